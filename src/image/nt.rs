//! NT headers: signature, file header, optional header and data directories

use crate::error::{Error, Result};
use crate::space::{Address, AddressSpace};
use crate::store::PointerWidth;

use super::dos::DosHeader;
use super::section::{Section, Sections};
use super::ImageView;

/// `PE\0\0`
pub const NT_SIGNATURE: u32 = 0x0000_4550;
/// Optional header magic of PE32 images
pub const PE32_MAGIC: u16 = 0x10b;
/// Optional header magic of PE32+ images
pub const PE32_PLUS_MAGIC: u16 = 0x20b;

/// Offset of the file header from the NT headers
const FILE: u64 = 4;
/// Offset of the optional header from the NT headers
const OPT: u64 = 24;
/// Size of one data directory entry
const DIRECTORY_ENTRY_SIZE: u64 = 8;
/// Number of data directory slots defined by the format
pub const DIRECTORY_SLOTS: u32 = 16;

/// PE32 or PE32+, taken from the optional header magic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeKind {
    /// 32-bit image
    Pe32,
    /// 64-bit image
    Pe32Plus,
}

impl PeKind {
    /// Width of pointers stored in the image
    pub fn pointer_width(self) -> PointerWidth {
        match self {
            Self::Pe32 => PointerWidth::U32,
            Self::Pe32Plus => PointerWidth::U64,
        }
    }

    /// Instruction bitness of the image's code
    pub fn bitness(self) -> u32 {
        match self {
            Self::Pe32 => 32,
            Self::Pe32Plus => 64,
        }
    }
}

/// The well-known data directory slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DataDirectory {
    /// Exported functions
    Export = 0,
    /// Imported modules and functions
    Import = 1,
    /// Resource tree
    Resource = 2,
    /// Unwind information
    Exception = 3,
    /// Attribute certificates (a file offset, not an RVA)
    Security = 4,
    /// Base relocation blocks
    BaseRelocation = 5,
    /// Debug directory entries
    Debug = 6,
    /// Reserved, must be zero
    Architecture = 7,
    /// Value of the global pointer register
    GlobalPtr = 8,
    /// Thread-local storage
    Tls = 9,
    /// Load configuration
    LoadConfig = 10,
    /// Bound import descriptors
    BoundImport = 11,
    /// Import address tables
    Iat = 12,
    /// Delay-load import descriptors
    DelayImport = 13,
    /// CLR runtime header
    ComDescriptor = 14,
    /// Reserved, must be zero
    Reserved = 15,
}

/// One `(rva, size)` data directory entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// RVA of the directory
    pub virtual_address: u32,
    /// Size of the directory in bytes
    pub size: u32,
}

impl DirectoryEntry {
    /// True if the entry points at something
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }

    /// True if `rva` lies inside the directory
    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.virtual_address && rva - self.virtual_address < self.size
    }
}

/// Lens over `IMAGE_NT_HEADERS32` / `IMAGE_NT_HEADERS64`
///
/// Construction validates the `MZ` and `PE\0\0` signatures as well as the optional header
/// magic, so a lens always describes an image of known layout.
pub struct NtHeaders<'a, S: AddressSpace + ?Sized> {
    /// Image the headers belong to
    view: ImageView<'a, S>,
    /// Address of the `PE\0\0` signature
    base: Address,
    /// Layout of the optional header
    kind: PeKind,
}

impl<'a, S: AddressSpace + ?Sized> NtHeaders<'a, S> {
    /// Anchors the lens at `base + e_lfanew` and validates the image
    pub fn new(view: ImageView<'a, S>) -> Result<Self> {
        let dos = DosHeader::new(view)?;
        let base = view.base() + u64::from(dos.new_header_offset()?);
        let store = view.store();

        let signature = store.read::<u32>(base)?;
        if signature != NT_SIGNATURE {
            return Err(Error::InvalidSignature {
                header: "NT",
                address: base,
                found: signature,
            });
        }

        let kind = match store.read::<u16>(base + OPT)? {
            PE32_MAGIC => PeKind::Pe32,
            PE32_PLUS_MAGIC => PeKind::Pe32Plus,
            magic => {
                return Err(Error::InvalidSignature {
                    header: "optional header",
                    address: base + OPT,
                    found: magic.into(),
                })
            }
        };

        Ok(Self { view, base, kind })
    }

    /// Image these headers belong to
    pub fn view(&self) -> ImageView<'a, S> {
        self.view
    }

    /// Address of the NT headers
    pub fn base(&self) -> Address {
        self.base
    }

    /// PE32 or PE32+
    pub fn kind(&self) -> PeKind {
        self.kind
    }

    /// Address of the first section header
    pub fn section_table(&self) -> Result<Address> {
        Ok(self.base + OPT + u64::from(self.size_of_optional_header()?))
    }

    /// Lens over section `index`
    pub fn section(&self, index: u16) -> Result<Section<'a, S>> {
        Section::new(self, index)
    }

    /// Iterator over all sections
    pub fn sections(&self) -> Result<Sections<'a, S>> {
        Sections::new(self)
    }

    /// Offset of a field whose position depends on the image kind
    fn offset(&self, pe32: u64, pe32_plus: u64) -> u64 {
        match self.kind {
            PeKind::Pe32 => self.base + OPT + pe32,
            PeKind::Pe32Plus => self.base + OPT + pe32_plus,
        }
    }

    /// Reads a field that is pointer-sized, widening it to 64 bits
    fn read_wide(&self, pe32: u64, pe32_plus: u64) -> Result<u64> {
        self.view
            .store()
            .read_pointer(self.offset(pe32, pe32_plus), self.kind.pointer_width())
    }

    /// Writes a pointer-sized field; values beyond 32 bits are out of range in PE32 images
    fn write_wide(&self, pe32: u64, pe32_plus: u64, value: u64) -> Result<()> {
        self.view.store().write_pointer(
            self.offset(pe32, pe32_plus),
            self.kind.pointer_width(),
            value,
        )
    }

    /// Reads a 32-bit field whose offset depends on the image kind
    fn read_u32(&self, pe32: u64, pe32_plus: u64) -> Result<u32> {
        self.view.store().read::<u32>(self.offset(pe32, pe32_plus))
    }

    /// Writes a 32-bit field whose offset depends on the image kind
    fn write_u32(&self, pe32: u64, pe32_plus: u64, value: u32) -> Result<()> {
        self.view
            .store()
            .write::<u32>(self.offset(pe32, pe32_plus), value)
    }

    lens_fields! {
        /// `Signature`, always `PE\0\0` for a constructed lens unless changed through the setter
        signature, set_signature: u32 = 0;
        /// `FileHeader.Machine`
        machine, set_machine: u16 = FILE;
        /// `FileHeader.NumberOfSections`
        number_of_sections, set_number_of_sections: u16 = FILE + 2;
        /// `FileHeader.TimeDateStamp`
        time_date_stamp, set_time_date_stamp: u32 = FILE + 4;
        /// `FileHeader.PointerToSymbolTable`
        pointer_to_symbol_table, set_pointer_to_symbol_table: u32 = FILE + 8;
        /// `FileHeader.NumberOfSymbols`
        number_of_symbols, set_number_of_symbols: u32 = FILE + 12;
        /// `FileHeader.SizeOfOptionalHeader`
        size_of_optional_header, set_size_of_optional_header: u16 = FILE + 16;
        /// `FileHeader.Characteristics`
        characteristics, set_characteristics: u16 = FILE + 18;
        /// `OptionalHeader.Magic`
        magic, set_magic: u16 = OPT;
        /// `MajorLinkerVersion`
        major_linker_version, set_major_linker_version: u8 = OPT + 2;
        /// `MinorLinkerVersion`
        minor_linker_version, set_minor_linker_version: u8 = OPT + 3;
        /// Combined size of all code sections
        size_of_code, set_size_of_code: u32 = OPT + 4;
        /// Combined size of all initialized data sections
        size_of_initialized_data, set_size_of_initialized_data: u32 = OPT + 8;
        /// Combined size of all uninitialized data sections
        size_of_uninitialized_data, set_size_of_uninitialized_data: u32 = OPT + 12;
        /// RVA of the entry point
        address_of_entry_point, set_address_of_entry_point: u32 = OPT + 16;
        /// RVA of the first code section
        base_of_code, set_base_of_code: u32 = OPT + 20;
        /// Alignment of sections once mapped
        section_alignment, set_section_alignment: u32 = OPT + 32;
        /// Alignment of section data in the file
        file_alignment, set_file_alignment: u32 = OPT + 36;
        /// `MajorOperatingSystemVersion`
        major_operating_system_version, set_major_operating_system_version: u16 = OPT + 40;
        /// `MinorOperatingSystemVersion`
        minor_operating_system_version, set_minor_operating_system_version: u16 = OPT + 42;
        /// `MajorImageVersion`
        major_image_version, set_major_image_version: u16 = OPT + 44;
        /// `MinorImageVersion`
        minor_image_version, set_minor_image_version: u16 = OPT + 46;
        /// `MajorSubsystemVersion`
        major_subsystem_version, set_major_subsystem_version: u16 = OPT + 48;
        /// `MinorSubsystemVersion`
        minor_subsystem_version, set_minor_subsystem_version: u16 = OPT + 50;
        /// Reserved, must be zero
        win32_version_value, set_win32_version_value: u32 = OPT + 52;
        /// Size of the mapped image, including headers
        size_of_image, set_size_of_image: u32 = OPT + 56;
        /// Combined size of all headers, rounded up to the file alignment
        size_of_headers, set_size_of_headers: u32 = OPT + 60;
        /// Image checksum
        check_sum, set_check_sum: u32 = OPT + 64;
        /// Subsystem required to run the image (`IMAGE_SUBSYSTEM_*`)
        subsystem, set_subsystem: u16 = OPT + 68;
        /// `IMAGE_DLLCHARACTERISTICS_*` flags
        dll_characteristics, set_dll_characteristics: u16 = OPT + 70;
    }

    /// `BaseOfData`, which only PE32 images have
    pub fn base_of_data(&self) -> Result<Option<u32>> {
        match self.kind {
            PeKind::Pe32 => self.view.store().read::<u32>(self.base + OPT + 24).map(Some),
            PeKind::Pe32Plus => Ok(None),
        }
    }

    /// Sets `BaseOfData`; fails with [`Error::InvalidState`] on PE32+ images
    pub fn set_base_of_data(&self, value: u32) -> Result<()> {
        match self.kind {
            PeKind::Pe32 => self.view.store().write::<u32>(self.base + OPT + 24, value),
            PeKind::Pe32Plus => Err(Error::InvalidState("PE32+ images have no BaseOfData")),
        }
    }

    /// Preferred load address
    pub fn image_base(&self) -> Result<u64> {
        self.read_wide(28, 24)
    }

    /// Sets the value returned by [`Self::image_base`]
    pub fn set_image_base(&self, value: u64) -> Result<()> {
        self.write_wide(28, 24, value)
    }

    /// Stack reserved for the initial thread
    pub fn size_of_stack_reserve(&self) -> Result<u64> {
        self.read_wide(72, 72)
    }

    /// Sets the value returned by [`Self::size_of_stack_reserve`]
    pub fn set_size_of_stack_reserve(&self, value: u64) -> Result<()> {
        self.write_wide(72, 72, value)
    }

    /// Stack committed for the initial thread
    pub fn size_of_stack_commit(&self) -> Result<u64> {
        self.read_wide(76, 80)
    }

    /// Sets the value returned by [`Self::size_of_stack_commit`]
    pub fn set_size_of_stack_commit(&self, value: u64) -> Result<()> {
        self.write_wide(76, 80, value)
    }

    /// Heap reserved for the process
    pub fn size_of_heap_reserve(&self) -> Result<u64> {
        self.read_wide(80, 88)
    }

    /// Sets the value returned by [`Self::size_of_heap_reserve`]
    pub fn set_size_of_heap_reserve(&self, value: u64) -> Result<()> {
        self.write_wide(80, 88, value)
    }

    /// Heap committed for the process
    pub fn size_of_heap_commit(&self) -> Result<u64> {
        self.read_wide(84, 96)
    }

    /// Sets the value returned by [`Self::size_of_heap_commit`]
    pub fn set_size_of_heap_commit(&self, value: u64) -> Result<()> {
        self.write_wide(84, 96, value)
    }

    /// Reserved, must be zero
    pub fn loader_flags(&self) -> Result<u32> {
        self.read_u32(88, 104)
    }

    /// Sets the value returned by [`Self::loader_flags`]
    pub fn set_loader_flags(&self, value: u32) -> Result<()> {
        self.write_u32(88, 104, value)
    }

    /// Number of populated data directory slots
    pub fn number_of_rva_and_sizes(&self) -> Result<u32> {
        self.read_u32(92, 108)
    }

    /// Sets the value returned by [`Self::number_of_rva_and_sizes`]
    pub fn set_number_of_rva_and_sizes(&self, value: u32) -> Result<()> {
        self.write_u32(92, 108, value)
    }

    /// Address of data directory `slot`, or `None` if the image does not define that slot
    fn directory_address(&self, slot: u32) -> Result<Option<Address>> {
        if slot >= DIRECTORY_SLOTS || slot >= self.number_of_rva_and_sizes()? {
            return Ok(None);
        }
        let directories = self.offset(96, 112);
        Ok(Some(directories + u64::from(slot) * DIRECTORY_ENTRY_SIZE))
    }

    /// Reads data directory `slot`
    ///
    /// Slots the image does not define read as `(0, 0)`; the number of slots is image-defined,
    /// so this is not an error.
    pub fn data_directory_at(&self, slot: u32) -> Result<DirectoryEntry> {
        let Some(address) = self.directory_address(slot)? else {
            return Ok(DirectoryEntry::default());
        };
        let store = self.view.store();
        Ok(DirectoryEntry {
            virtual_address: store.read::<u32>(address)?,
            size: store.read::<u32>(address + 4)?,
        })
    }

    /// Writes data directory `slot`; does nothing for slots the image does not define
    pub fn set_data_directory_at(&self, slot: u32, entry: DirectoryEntry) -> Result<()> {
        let Some(address) = self.directory_address(slot)? else {
            return Ok(());
        };
        let store = self.view.store();
        store.write::<u32>(address, entry.virtual_address)?;
        store.write::<u32>(address + 4, entry.size)
    }

    /// Reads a well-known data directory
    pub fn data_directory(&self, directory: DataDirectory) -> Result<DirectoryEntry> {
        self.data_directory_at(directory as u32)
    }

    /// Writes a well-known data directory
    pub fn set_data_directory(&self, directory: DataDirectory, entry: DirectoryEntry) -> Result<()> {
        self.set_data_directory_at(directory as u32, entry)
    }
}
