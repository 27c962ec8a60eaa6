//! The import directory: per-module descriptors and their thunk tables

use log::debug;

use crate::error::Result;
use crate::space::{Address, AddressSpace};
use crate::store::PointerWidth;

use super::nt::{DataDirectory, NtHeaders};
use super::{ImageView, Mode};

/// Size of one `IMAGE_IMPORT_DESCRIPTOR`
pub const DESCRIPTOR_SIZE: u64 = 20;

/// Upper bound on descriptors walked before giving up on finding the terminator
const MAX_DESCRIPTORS: u64 = 0x1_0000;

/// Upper bound on thunks walked per descriptor
const MAX_THUNKS: u64 = 0x1_0000;

/// How an import is looked up in the exporting module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportName {
    /// By name, with the loader's hint into the export name table
    Name {
        /// Index into the exporter's name table to try first
        hint: u16,
        /// Function name
        name: String,
    },
    /// By ordinal
    Ordinal(u16),
}

/// One paired import lookup / import address table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportThunk {
    /// Position in the thunk tables
    pub index: u32,
    /// Address of the import address table slot (the redirection point)
    pub slot: Address,
    /// Current value of the slot
    pub value: u64,
    /// What is imported
    pub import: ImportName,
}

impl ImportThunk {
    /// True if this thunk imports `name` by name
    pub fn is_named(&self, name: &str) -> bool {
        matches!(&self.import, ImportName::Name { name: n, .. } if n == name)
    }
}

/// Lens over the import directory
pub struct ImportDir<'a, S: AddressSpace + ?Sized> {
    /// Image the directory belongs to
    view: ImageView<'a, S>,
    /// Address of the first descriptor
    base: Address,
    /// Pointer width of the image's thunks
    width: PointerWidth,
}

impl<'a, S: AddressSpace + ?Sized> ImportDir<'a, S> {
    /// Anchors the lens at the import directory, or returns `None` if the image has none
    pub fn new(view: ImageView<'a, S>) -> Result<Option<Self>> {
        let nt = NtHeaders::new(view)?;
        let entry = nt.data_directory(DataDirectory::Import)?;
        if !entry.is_present() {
            return Ok(None);
        }
        Ok(Some(Self {
            view,
            base: view.address_of(entry.virtual_address)?,
            width: nt.kind().pointer_width(),
        }))
    }

    /// Address of the first descriptor
    pub fn base(&self) -> Address {
        self.base
    }

    /// All descriptors up to the all-zero terminator
    pub fn descriptors(&self) -> Result<Vec<ImportDescriptor<'a, S>>> {
        let mut descriptors = Vec::new();
        for i in 0..MAX_DESCRIPTORS {
            let descriptor = ImportDescriptor {
                view: self.view,
                base: self.base + i * DESCRIPTOR_SIZE,
                width: self.width,
            };
            if descriptor.is_terminator()? {
                break;
            }
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    }

    /// The first descriptor importing from `module`
    ///
    /// See [`module_names_match`](crate::space::module_names_match) for how names compare.
    pub fn find(&self, module: &str) -> Result<Option<ImportDescriptor<'a, S>>> {
        for descriptor in self.descriptors()? {
            if crate::space::module_names_match(&descriptor.module_name()?, module) {
                return Ok(Some(descriptor));
            }
        }
        Ok(None)
    }
}

/// Lens over one `IMAGE_IMPORT_DESCRIPTOR`
pub struct ImportDescriptor<'a, S: AddressSpace + ?Sized> {
    /// Image the descriptor belongs to
    view: ImageView<'a, S>,
    /// Address of the descriptor
    base: Address,
    /// Pointer width of the thunks
    width: PointerWidth,
}

impl<'a, S: AddressSpace + ?Sized> ImportDescriptor<'a, S> {
    /// Address of the descriptor
    pub fn base(&self) -> Address {
        self.base
    }

    lens_fields! {
        /// RVA of the import lookup table
        original_first_thunk, set_original_first_thunk: u32 = 0;
        /// Zero until the image is bound
        time_date_stamp, set_time_date_stamp: u32 = 4;
        /// Index of the first forwarder reference
        forwarder_chain, set_forwarder_chain: u32 = 8;
        /// RVA of the imported module's name
        name, set_name: u32 = 12;
        /// RVA of the import address table
        first_thunk, set_first_thunk: u32 = 16;
    }

    /// True for the all-zero descriptor closing the directory
    fn is_terminator(&self) -> Result<bool> {
        let raw = self.view.store().read::<[u8; 20]>(self.base)?;
        Ok(raw.iter().all(|&b| b == 0))
    }

    /// Name of the module imported from
    pub fn module_name(&self) -> Result<String> {
        let address = self.view.address_of(self.name()?)?;
        self.view.store().read_cstring(address)
    }

    /// Pairs the import address table with the lookup table, element by element
    ///
    /// Walking stops as soon as either table hits a null entry. Without a lookup table the
    /// address table doubles as one, but only in a raw file; once mapped, its entries are
    /// resolved addresses and no names can be recovered.
    pub fn thunks(&self) -> Result<Vec<ImportThunk>> {
        let store = self.view.store();
        let iat = self.view.address_of(self.first_thunk()?)?;
        let lookup = match self.original_first_thunk()? {
            0 if self.view.mode() == Mode::RawOnDisk => iat,
            0 => {
                debug!(
                    "import descriptor at {:#x} has no lookup table, skipping",
                    self.base
                );
                return Ok(Vec::new());
            }
            rva => self.view.address_of(rva)?,
        };

        let size = self.width.size() as u64;
        let mut thunks = Vec::new();
        for index in 0..MAX_THUNKS {
            let entry = store.read_pointer(lookup + index * size, self.width)?;
            let slot = iat + index * size;
            let value = store.read_pointer(slot, self.width)?;
            if entry == 0 || value == 0 {
                break;
            }

            let import = if entry & self.width.ordinal_flag() != 0 {
                ImportName::Ordinal(entry as u16)
            } else {
                // the hint/name RVA is the low 31 bits in either width
                let address = self.view.address_of((entry & 0x7fff_ffff) as u32)?;
                ImportName::Name {
                    hint: store.read::<u16>(address)?,
                    name: store.read_cstring(address + 2)?,
                }
            };

            thunks.push(ImportThunk {
                index: index as u32,
                slot,
                value,
                import,
            });
        }
        Ok(thunks)
    }
}
