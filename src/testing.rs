//! Synthetic PE images for tests

use crate::image::DataDirectory;
use crate::space::{Access, Address, BufferSpace, Module};

/// Offset of the NT headers (`e_lfanew`)
const NT: usize = 0x80;
/// Offset of the optional header
const OPT: usize = NT + 24;
/// `SizeOfHeaders`, also the file offset of the first section
const HEADERS: u32 = 0x400;
/// `SizeOfImage`
const IMAGE_SIZE: u32 = 0x6000;
/// First RVA handed out for directories built by the helpers
const RDATA: u32 = 0x4000;

/// `(name, rva, virtual size, file offset, raw size)` of every section
const SECTIONS: [(&[u8; 8], u32, u32, u32, u32); 3] = [
    (b".text\0\0\0", 0x1000, 0x1000, 0x400, 0x1000),
    (b".data\0\0\0", 0x2000, 0x2000, 0x1400, 0x800),
    (b".rdata\0\0", 0x4000, 0x2000, 0x1c00, 0x2000),
];

/// One export address table entry
#[derive(Debug, Clone, Copy)]
pub enum Export {
    /// Unused ordinal
    Empty,
    /// Code at an RVA
    Code(u32),
    /// Forwarder string
    Forward(&'static str),
}

/// A PE32 or PE32+ image built in memory
///
/// The image is kept in its mapped layout (file offset == RVA); [`TestImage::raw`] derives the
/// on-disk layout from the section table. Directories are laid out in `.rdata`, which is both
/// mapped and stored in full.
pub struct TestImage {
    /// Mapped bytes
    data: Vec<u8>,
    /// Load address, also written as `ImageBase`
    base: Address,
    /// True for PE32+
    wide: bool,
    /// Next free RVA in `.rdata`
    cursor: u32,
}

impl TestImage {
    /// A PE32 image preferring `base`
    pub fn pe32(base: Address) -> Self {
        Self::build(base, false)
    }

    /// A PE32+ image preferring `base`
    pub fn pe64(base: Address) -> Self {
        Self::build(base, true)
    }

    /// Lays out headers and the section table
    fn build(base: Address, wide: bool) -> Self {
        let mut image = Self {
            data: vec![0; IMAGE_SIZE as usize],
            base,
            wide,
            cursor: RDATA,
        };

        image.write_u16(0, 0x5a4d);
        image.write_u32(0x3c, NT as u32);
        image.write_u32(NT as u32, 0x4550);

        let opt_size: u16 = if wide { 0xf0 } else { 0xe0 };
        image.write_u16(NT as u32 + 4, if wide { 0x8664 } else { 0x14c });
        image.write_u16(NT as u32 + 6, SECTIONS.len() as u16);
        image.write_u16(NT as u32 + 20, opt_size);
        image.write_u16(NT as u32 + 22, 0x2022);

        let opt = OPT as u32;
        image.write_u16(opt, if wide { 0x20b } else { 0x10b });
        image.write_u32(opt + 16, 0x1000);
        image.write_u32(opt + 20, 0x1000);
        image.write_u32(opt + 32, 0x1000);
        image.write_u32(opt + 36, 0x200);
        image.write_u32(opt + 56, IMAGE_SIZE);
        image.write_u32(opt + 60, HEADERS);
        if wide {
            image.write_u64(opt + 24, base);
            image.write_u64(opt + 72, 0x10_0000);
            image.write_u32(opt + 108, 16);
        } else {
            image.write_u32(opt + 28, base as u32);
            image.write_u32(opt + 72, 0x10_0000);
            image.write_u32(opt + 92, 16);
        }

        let mut header = opt + u32::from(opt_size);
        for (name, rva, size, offset, raw_size) in SECTIONS {
            image.write_bytes(header, name);
            image.write_u32(header + 8, size);
            image.write_u32(header + 12, rva);
            image.write_u32(header + 16, raw_size);
            image.write_u32(header + 20, offset);
            header += 40;
        }
        image
    }

    /// Preferred load address
    pub fn base(&self) -> Address {
        self.base
    }

    /// Size of the mapped image
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// The image as mapped by a loader
    pub fn mapped(&self) -> Vec<u8> {
        self.data.clone()
    }

    /// The image as stored on disk
    pub fn raw(&self) -> Vec<u8> {
        let (_, _, _, offset, size) = SECTIONS[SECTIONS.len() - 1];
        let mut raw = vec![0; (offset + size) as usize];
        raw[..HEADERS as usize].copy_from_slice(&self.data[..HEADERS as usize]);
        for (_, rva, _, offset, size) in SECTIONS {
            let (rva, offset, size) = (rva as usize, offset as usize, size as usize);
            raw[offset..offset + size].copy_from_slice(&self.data[rva..rva + size]);
        }
        raw
    }

    /// Maps the image at its base and registers it as module `name`
    pub fn load(&self, space: &BufferSpace, name: &str) {
        space.map(self.base, self.mapped(), Access::ReadWrite);
        space.add_module(Module::new(name, self.base, self.size()));
    }

    /// Writes raw bytes at `rva`
    pub fn write_bytes(&mut self, rva: u32, bytes: &[u8]) {
        let rva = rva as usize;
        self.data[rva..rva + bytes.len()].copy_from_slice(bytes);
    }

    /// Writes a little-endian `u16`
    pub fn write_u16(&mut self, rva: u32, value: u16) {
        self.write_bytes(rva, &value.to_le_bytes());
    }

    /// Writes a little-endian `u32`
    pub fn write_u32(&mut self, rva: u32, value: u32) {
        self.write_bytes(rva, &value.to_le_bytes());
    }

    /// Writes a little-endian `u64`
    pub fn write_u64(&mut self, rva: u32, value: u64) {
        self.write_bytes(rva, &value.to_le_bytes());
    }

    /// Writes a NUL-terminated string
    pub fn write_str(&mut self, rva: u32, value: &str) {
        self.write_bytes(rva, value.as_bytes());
        self.write_bytes(rva + value.len() as u32, &[0]);
    }

    /// Writes a pointer-sized value
    pub fn write_pointer(&mut self, rva: u32, value: u64) {
        if self.wide {
            self.write_u64(rva, value);
        } else {
            self.write_u32(rva, value as u32);
        }
    }

    /// Size of a pointer in the image
    pub fn pointer_size(&self) -> u32 {
        if self.wide {
            8
        } else {
            4
        }
    }

    /// Points data directory `directory` at `(rva, size)`
    pub fn set_directory(&mut self, directory: DataDirectory, rva: u32, size: u32) {
        let table = OPT as u32 + if self.wide { 112 } else { 96 };
        let entry = table + directory as u32 * 8;
        self.write_u32(entry, rva);
        self.write_u32(entry + 4, size);
    }

    /// Reserves `len` bytes in `.rdata`
    pub fn alloc(&mut self, len: u32) -> u32 {
        let rva = self.cursor;
        self.cursor = (self.cursor + len + 7) & !7;
        assert!(self.cursor <= IMAGE_SIZE, "test image out of space");
        rva
    }

    /// Reserves space for `value` in `.rdata` and writes it there
    pub fn alloc_str(&mut self, value: &str) -> u32 {
        let rva = self.alloc(value.len() as u32 + 1);
        self.write_str(rva, value);
        rva
    }

    /// Builds an export directory
    ///
    /// `names` pairs each exported name with its offset into `functions`. Forwarder strings are
    /// placed inside the directory's range, as linkers do.
    pub fn exports(
        &mut self,
        module: &str,
        ordinal_base: u32,
        functions: &[Export],
        names: &[(&str, u32)],
    ) {
        let directory = self.alloc(40);
        let table = self.alloc(4 * functions.len() as u32);
        let name_table = self.alloc(4 * names.len() as u32);
        let ordinal_table = self.alloc(2 * names.len() as u32);
        let module_name = self.alloc_str(module);

        for (i, function) in functions.iter().enumerate() {
            let rva = match *function {
                Export::Empty => 0,
                Export::Code(rva) => rva,
                Export::Forward(forwarder) => self.alloc_str(forwarder),
            };
            self.write_u32(table + 4 * i as u32, rva);
        }
        for (i, (name, offset)) in names.iter().enumerate() {
            let name = self.alloc_str(name);
            self.write_u32(name_table + 4 * i as u32, name);
            self.write_u16(ordinal_table + 2 * i as u32, *offset as u16);
        }

        self.write_u32(directory + 12, module_name);
        self.write_u32(directory + 16, ordinal_base);
        self.write_u32(directory + 20, functions.len() as u32);
        self.write_u32(directory + 24, names.len() as u32);
        self.write_u32(directory + 28, table);
        self.write_u32(directory + 32, if names.is_empty() { 0 } else { name_table });
        self.write_u32(directory + 36, if names.is_empty() { 0 } else { ordinal_table });
        self.set_directory(DataDirectory::Export, directory, self.cursor - directory);
    }

    /// Builds an import directory
    ///
    /// Each module lists `(function, resolved address)`; a function of the form `#N` is imported
    /// by ordinal. The import address table holds the resolved addresses, as after loading.
    pub fn imports(&mut self, modules: &[(&str, &[(&str, u64)])]) {
        let size = 20 * (modules.len() as u32 + 1);
        let descriptors = self.alloc(size);
        let pointer = self.pointer_size();
        let flag = if self.wide { 1 << 63 } else { 1 << 31 };

        for (i, (module, functions)) in modules.iter().enumerate() {
            let count = functions.len() as u32 + 1;
            let lookup = self.alloc(pointer * count);
            let iat = self.alloc(pointer * count);
            let name = self.alloc_str(module);

            for (j, (function, address)) in functions.iter().enumerate() {
                let entry = match function.strip_prefix('#') {
                    Some(ordinal) => flag | ordinal.parse::<u64>().unwrap_or(0),
                    None => {
                        let hint = self.alloc(2 + function.len() as u32 + 1);
                        self.write_u16(hint, j as u16);
                        self.write_str(hint + 2, function);
                        u64::from(hint)
                    }
                };
                self.write_pointer(lookup + pointer * j as u32, entry);
                self.write_pointer(iat + pointer * j as u32, *address);
            }

            let descriptor = descriptors + 20 * i as u32;
            self.write_u32(descriptor, lookup);
            self.write_u32(descriptor + 12, name);
            self.write_u32(descriptor + 16, iat);
        }
        self.set_directory(DataDirectory::Import, descriptors, size);
    }

    /// Builds a TLS directory whose callback array holds `callbacks` (as VAs) and a terminator
    ///
    /// Returns the RVA of the directory.
    pub fn tls(&mut self, callbacks: &[u32]) -> u32 {
        let pointer = self.pointer_size();
        let size = if self.wide { 40 } else { 24 };
        let directory = self.alloc(size);
        let array = self.alloc(pointer * (callbacks.len() as u32 + 1));
        for (i, rva) in callbacks.iter().enumerate() {
            self.write_pointer(array + pointer * i as u32, self.base + u64::from(*rva));
        }

        let fields = [
            self.base + 0x2000,
            self.base + 0x2100,
            self.base + 0x2100,
            self.base + u64::from(array),
        ];
        for (i, value) in fields.into_iter().enumerate() {
            self.write_pointer(directory + pointer * i as u32, value);
        }
        self.write_u32(directory + 4 * pointer, 0x10);
        self.write_u32(directory + 4 * pointer + 4, 0x0030_0000);
        self.set_directory(DataDirectory::Tls, directory, size);
        directory
    }
}
