//! The export directory: exported functions by ordinal and name, including forwarders

use crate::error::{Error, Result};
use crate::space::{Address, AddressSpace};

use super::nt::{DataDirectory, DirectoryEntry, NtHeaders};
use super::ImageView;

/// An export that resolves to another module's export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarder {
    /// Module the export is forwarded to, without extension (e.g. `NTDLL`)
    pub module: String,
    /// Function name, or `#<ordinal>` for forwards by ordinal
    pub function: String,
}

impl Forwarder {
    /// Splits a forwarder string `Module.Function` on its last `.`
    ///
    /// Module names may themselves contain dots (`api-ms-win-core-1.0.Function`), function names
    /// cannot.
    pub fn parse(forwarder: &str) -> Result<Self> {
        match forwarder.rsplit_once('.') {
            Some((module, function)) if !module.is_empty() && !function.is_empty() => Ok(Self {
                module: module.to_string(),
                function: function.to_string(),
            }),
            _ => Err(Error::InvalidForwarder(forwarder.to_string())),
        }
    }

    /// The ordinal for forwards of the form `Module.#123`
    pub fn ordinal(&self) -> Option<u16> {
        self.function.strip_prefix('#')?.parse().ok()
    }
}

/// Where an export leads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    /// RVA of the exported code or data
    Code(u32),
    /// Another module's export
    Forwarded(Forwarder),
}

/// One populated entry of the export address table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    /// Biased ordinal (`Base + offset`)
    pub ordinal: u16,
    /// Index into the export address table
    pub offset: u32,
    /// Exported name; exports by ordinal only have none
    pub name: Option<String>,
    /// What the export resolves to
    pub target: ExportTarget,
}

impl ExportEntry {
    /// RVA of the export, unless it is forwarded
    pub fn rva(&self) -> Option<u32> {
        match self.target {
            ExportTarget::Code(rva) => Some(rva),
            ExportTarget::Forwarded(_) => None,
        }
    }

    /// The forwarder, if the export is forwarded
    pub fn forwarder(&self) -> Option<&Forwarder> {
        match &self.target {
            ExportTarget::Code(_) => None,
            ExportTarget::Forwarded(forwarder) => Some(forwarder),
        }
    }
}

/// Lens over `IMAGE_EXPORT_DIRECTORY`
pub struct ExportDir<'a, S: AddressSpace + ?Sized> {
    /// Image the directory belongs to
    view: ImageView<'a, S>,
    /// Address of the directory
    base: Address,
    /// The data directory entry, bounding forwarder strings
    range: DirectoryEntry,
}

impl<'a, S: AddressSpace + ?Sized> ExportDir<'a, S> {
    /// Anchors the lens at the export directory, or returns `None` if the image has none
    pub fn new(view: ImageView<'a, S>) -> Result<Option<Self>> {
        let range = NtHeaders::new(view)?.data_directory(DataDirectory::Export)?;
        if !range.is_present() {
            return Ok(None);
        }
        Ok(Some(Self {
            view,
            base: view.address_of(range.virtual_address)?,
            range,
        }))
    }

    /// Address of the directory
    pub fn base(&self) -> Address {
        self.base
    }

    lens_fields! {
        /// Reserved, must be zero
        characteristics, set_characteristics: u32 = 0;
        /// Time the export data was created
        time_date_stamp, set_time_date_stamp: u32 = 4;
        /// `MajorVersion`
        major_version, set_major_version: u16 = 8;
        /// `MinorVersion`
        minor_version, set_minor_version: u16 = 10;
        /// RVA of the module name
        name, set_name: u32 = 12;
        /// Ordinal of the first export address table entry
        ordinal_base, set_ordinal_base: u32 = 16;
        /// Length of the export address table
        number_of_functions, set_number_of_functions: u32 = 20;
        /// Length of the name pointer and name ordinal tables
        number_of_names, set_number_of_names: u32 = 24;
        /// RVA of the export address table
        address_of_functions, set_address_of_functions: u32 = 28;
        /// RVA of the name pointer table
        address_of_names, set_address_of_names: u32 = 32;
        /// RVA of the name ordinal table
        address_of_name_ordinals, set_address_of_name_ordinals: u32 = 36;
    }

    /// Name the module exports itself under
    pub fn module_name(&self) -> Result<String> {
        let address = self.view.address_of(self.name()?)?;
        self.view.store().read_cstring(address)
    }

    /// Address of the export address table slot at `offset`
    pub fn slot_address(&self, offset: u32) -> Result<Address> {
        if offset >= self.number_of_functions()? {
            return Err(Error::out_of_range("export offset", offset));
        }
        let table = self.view.address_of(self.address_of_functions()?)?;
        Ok(table + u64::from(offset) * 4)
    }

    /// The first populated entry at or after `offset`
    ///
    /// Export address tables may be sparse: unused ordinals hold RVA 0 and are skipped, so the
    /// returned entry's `offset` may be larger than the one requested. Offsets are valid in
    /// `[0, NumberOfFunctions)`; running off the end is [`Error::OutOfRange`].
    pub fn entry(&self, offset: u32) -> Result<ExportEntry> {
        let count = self.number_of_functions()?;
        let table = self.view.address_of(self.address_of_functions()?)?;
        let store = self.view.store();

        let mut offset = offset;
        let rva = loop {
            if offset >= count {
                return Err(Error::out_of_range("export offset", offset));
            }
            let rva = store.read::<u32>(table + u64::from(offset) * 4)?;
            if rva != 0 {
                break rva;
            }
            offset += 1;
        };

        self.build_entry(offset, rva)
    }

    /// The entry for a biased ordinal, with the same sparse skipping as [`ExportDir::entry`]
    pub fn lookup_ordinal(&self, ordinal: u32) -> Result<ExportEntry> {
        let offset = ordinal
            .checked_sub(self.ordinal_base()?)
            .ok_or_else(|| Error::out_of_range("export ordinal", ordinal))?;
        self.entry(offset)
    }

    /// Finds an export by its exact (case-sensitive) name
    pub fn find_by_name(&self, name: &str) -> Result<Option<ExportEntry>> {
        let count = u64::from(self.number_of_names()?);
        if count == 0 {
            return Ok(None);
        }
        let store = self.view.store();
        let names = self.view.address_of(self.address_of_names()?)?;
        let ordinals = self.view.address_of(self.address_of_name_ordinals()?)?;

        for i in 0..count {
            let name_rva = store.read::<u32>(names + i * 4)?;
            if store.read_cstring(self.view.address_of(name_rva)?)? != name {
                continue;
            }
            let offset = u32::from(store.read::<u16>(ordinals + i * 2)?);
            let rva = store.read::<u32>(self.slot_address(offset)?)?;
            if rva == 0 {
                return Ok(None);
            }
            return self.build_entry(offset, rva).map(Some);
        }
        Ok(None)
    }

    /// Iterator over every populated entry, in table order
    pub fn iter(&self) -> Exports<'_, 'a, S> {
        Exports {
            dir: self,
            next: Some(0),
        }
    }

    /// Name exported for the table entry at `offset`, if any
    fn name_of(&self, offset: u32) -> Result<Option<String>> {
        let count = u64::from(self.number_of_names()?);
        if count == 0 {
            return Ok(None);
        }
        let store = self.view.store();
        let ordinals = self.view.address_of(self.address_of_name_ordinals()?)?;
        for i in 0..count {
            if u32::from(store.read::<u16>(ordinals + i * 2)?) != offset {
                continue;
            }
            let names = self.view.address_of(self.address_of_names()?)?;
            let name_rva = store.read::<u32>(names + i * 4)?;
            return store.read_cstring(self.view.address_of(name_rva)?).map(Some);
        }
        Ok(None)
    }

    /// Builds the entry for a populated slot
    fn build_entry(&self, offset: u32, rva: u32) -> Result<ExportEntry> {
        let ordinal = self
            .ordinal_base()?
            .checked_add(offset)
            .and_then(|ordinal| u16::try_from(ordinal).ok())
            .ok_or_else(|| Error::out_of_range("export ordinal", offset))?;

        // a function RVA pointing back into the directory is a forwarder string
        let target = if self.range.contains(rva) {
            let address = self.view.address_of(rva)?;
            ExportTarget::Forwarded(Forwarder::parse(&self.view.store().read_cstring(address)?)?)
        } else {
            ExportTarget::Code(rva)
        };

        Ok(ExportEntry {
            ordinal,
            offset,
            name: self.name_of(offset)?,
            target,
        })
    }
}

/// Iterator over the populated entries of an [`ExportDir`]
pub struct Exports<'d, 'a, S: AddressSpace + ?Sized> {
    /// Directory being walked
    dir: &'d ExportDir<'a, S>,
    /// Offset to resume the sparse scan at; `None` once finished
    next: Option<u32>,
}

impl<'d, 'a, S: AddressSpace + ?Sized> Iterator for Exports<'d, 'a, S> {
    type Item = Result<ExportEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next?;
        match self.dir.entry(offset) {
            Ok(entry) => {
                self.next = entry.offset.checked_add(1);
                Some(Ok(entry))
            }
            Err(Error::OutOfRange {
                what: "export offset",
                ..
            }) => {
                self.next = None;
                None
            }
            Err(e) => {
                self.next = None;
                Some(Err(e))
            }
        }
    }
}
