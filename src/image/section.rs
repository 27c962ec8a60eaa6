//! Section table entries

use crate::error::{Error, Result};
use crate::space::{Address, AddressSpace};

use super::nt::NtHeaders;
use super::ImageView;

/// Size of one `IMAGE_SECTION_HEADER`
pub const SECTION_HEADER_SIZE: u64 = 40;

/// Snapshot of one section header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionRecord {
    /// Position in the section table
    pub index: u16,
    /// Raw, NUL-padded name
    pub name: [u8; 8],
    /// Size once mapped
    pub virtual_size: u32,
    /// RVA of the section
    pub virtual_address: u32,
    /// Size of the data stored in the file
    pub size_of_raw_data: u32,
    /// File offset of the stored data
    pub pointer_to_raw_data: u32,
    /// File offset of COFF relocations
    pub pointer_to_relocations: u32,
    /// File offset of COFF line numbers
    pub pointer_to_linenumbers: u32,
    /// Number of COFF relocations
    pub number_of_relocations: u16,
    /// Number of COFF line numbers
    pub number_of_linenumbers: u16,
    /// Section flags (`IMAGE_SCN_*`)
    pub characteristics: u32,
}

impl SectionRecord {
    /// Name up to the first NUL
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Size of the section once mapped
    ///
    /// Some linkers leave `VirtualSize` at zero, in which case the raw size is used.
    pub fn extent(&self) -> u32 {
        if self.virtual_size == 0 {
            self.size_of_raw_data
        } else {
            self.virtual_size
        }
    }

    /// True if `rva` lies inside the mapped section
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address && rva - self.virtual_address < self.extent()
    }

    /// File offset holding the byte at `rva`, if the section stores it in the file
    ///
    /// A raw data pointer that would place the byte past 4 GiB stores nothing.
    pub fn file_offset_of(&self, rva: u32) -> Option<u32> {
        if !self.contains_rva(rva) {
            return None;
        }
        let delta = rva - self.virtual_address;
        if delta >= self.size_of_raw_data {
            return None;
        }
        self.pointer_to_raw_data.checked_add(delta)
    }

    /// RVA of the byte stored at file offset `offset`, if it lies in this section's raw data
    pub fn rva_of_file_offset(&self, offset: u32) -> Option<u32> {
        let delta = offset.checked_sub(self.pointer_to_raw_data)?;
        if delta >= self.size_of_raw_data {
            return None;
        }
        self.virtual_address.checked_add(delta)
    }
}

/// Lens over one section header
pub struct Section<'a, S: AddressSpace + ?Sized> {
    /// Image the section belongs to
    view: ImageView<'a, S>,
    /// Address of the section header
    base: Address,
    /// Position in the section table
    index: u16,
}

impl<'a, S: AddressSpace + ?Sized> Section<'a, S> {
    /// Anchors the lens at header `index`
    ///
    /// Fails with [`Error::OutOfRange`] unless `index < NumberOfSections`.
    pub fn new(nt: &NtHeaders<'a, S>, index: u16) -> Result<Self> {
        if index >= nt.number_of_sections()? {
            return Err(Error::out_of_range("section index", index));
        }
        let base = nt.section_table()? + u64::from(index) * SECTION_HEADER_SIZE;
        Ok(Self {
            view: nt.view(),
            base,
            index,
        })
    }

    /// Position in the section table
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Address of the section header
    pub fn base(&self) -> Address {
        self.base
    }

    /// Name up to the first NUL
    pub fn name_str(&self) -> Result<String> {
        Ok(self.record()?.name())
    }

    /// Reads the whole header at once
    pub fn record(&self) -> Result<SectionRecord> {
        let raw = self.view.store().read::<[u8; 40]>(self.base)?;
        let u32_at = |o: usize| u32::from_le_bytes([raw[o], raw[o + 1], raw[o + 2], raw[o + 3]]);
        let u16_at = |o: usize| u16::from_le_bytes([raw[o], raw[o + 1]]);
        let mut name = [0u8; 8];
        name.copy_from_slice(&raw[..8]);
        Ok(SectionRecord {
            index: self.index,
            name,
            virtual_size: u32_at(8),
            virtual_address: u32_at(12),
            size_of_raw_data: u32_at(16),
            pointer_to_raw_data: u32_at(20),
            pointer_to_relocations: u32_at(24),
            pointer_to_linenumbers: u32_at(28),
            number_of_relocations: u16_at(32),
            number_of_linenumbers: u16_at(34),
            characteristics: u32_at(36),
        })
    }

    lens_fields! {
        /// Raw, NUL-padded name
        name, set_name: [u8; 8] = 0;
        /// Size once mapped
        virtual_size, set_virtual_size: u32 = 8;
        /// RVA of the section
        virtual_address, set_virtual_address: u32 = 12;
        /// Size of the data stored in the file
        size_of_raw_data, set_size_of_raw_data: u32 = 16;
        /// File offset of the stored data
        pointer_to_raw_data, set_pointer_to_raw_data: u32 = 20;
        /// File offset of COFF relocations
        pointer_to_relocations, set_pointer_to_relocations: u32 = 24;
        /// File offset of COFF line numbers
        pointer_to_linenumbers, set_pointer_to_linenumbers: u32 = 28;
        /// Number of COFF relocations
        number_of_relocations, set_number_of_relocations: u16 = 32;
        /// Number of COFF line numbers
        number_of_linenumbers, set_number_of_linenumbers: u16 = 34;
        /// Section flags (`IMAGE_SCN_*`)
        characteristics, set_characteristics: u32 = 36;
    }
}

/// Iterator over every section of an image
pub struct Sections<'a, S: AddressSpace + ?Sized> {
    /// Image the sections belong to
    view: ImageView<'a, S>,
    /// Address of the section table
    table: Address,
    /// Next index to yield
    next: u16,
    /// `NumberOfSections`, read once
    count: u16,
}

impl<'a, S: AddressSpace + ?Sized> Sections<'a, S> {
    /// Starts iterating the section table of `nt`
    pub fn new(nt: &NtHeaders<'a, S>) -> Result<Self> {
        Ok(Self {
            view: nt.view(),
            table: nt.section_table()?,
            next: 0,
            count: nt.number_of_sections()?,
        })
    }
}

impl<'a, S: AddressSpace + ?Sized> Iterator for Sections<'a, S> {
    type Item = Section<'a, S>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(Section {
            view: self.view,
            base: self.table + u64::from(index) * SECTION_HEADER_SIZE,
            index,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = usize::from(self.count - self.next);
        (left, Some(left))
    }
}
