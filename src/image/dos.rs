//! The MS-DOS header at the start of every image

use crate::error::{Error, Result};
use crate::space::{Address, AddressSpace};

use super::ImageView;

/// `MZ`
pub const DOS_MAGIC: u16 = 0x5a4d;

/// Lens over the 64-byte MS-DOS header
pub struct DosHeader<'a, S: AddressSpace + ?Sized> {
    /// Image the header belongs to
    view: ImageView<'a, S>,
    /// Address of the header (the image base)
    base: Address,
}

impl<'a, S: AddressSpace + ?Sized> DosHeader<'a, S> {
    /// Anchors the lens at the image base, checking the `MZ` signature
    pub fn new(view: ImageView<'a, S>) -> Result<Self> {
        let header = Self {
            view,
            base: view.base(),
        };
        header.ensure_valid()?;
        Ok(header)
    }

    /// Address of the header
    pub fn base(&self) -> Address {
        self.base
    }

    /// Fails with [`Error::InvalidSignature`] unless the header starts with `MZ`
    pub fn ensure_valid(&self) -> Result<()> {
        let magic = self.magic()?;
        if magic != DOS_MAGIC {
            return Err(Error::InvalidSignature {
                header: "DOS",
                address: self.base,
                found: magic.into(),
            });
        }
        Ok(())
    }

    lens_fields! {
        /// `e_magic`
        magic, set_magic: u16 = 0x00;
        /// `e_cblp`, bytes on the last page of the file
        bytes_on_last_page, set_bytes_on_last_page: u16 = 0x02;
        /// `e_cp`, pages in the file
        pages_in_file, set_pages_in_file: u16 = 0x04;
        /// `e_crlc`
        relocations, set_relocations: u16 = 0x06;
        /// `e_cparhdr`, size of the header in paragraphs
        size_of_header_in_paragraphs, set_size_of_header_in_paragraphs: u16 = 0x08;
        /// `e_minalloc`
        min_extra_paragraphs, set_min_extra_paragraphs: u16 = 0x0a;
        /// `e_maxalloc`
        max_extra_paragraphs, set_max_extra_paragraphs: u16 = 0x0c;
        /// `e_ss`
        initial_ss, set_initial_ss: u16 = 0x0e;
        /// `e_sp`
        initial_sp, set_initial_sp: u16 = 0x10;
        /// `e_csum`
        checksum, set_checksum: u16 = 0x12;
        /// `e_ip`
        initial_ip, set_initial_ip: u16 = 0x14;
        /// `e_cs`
        initial_cs, set_initial_cs: u16 = 0x16;
        /// `e_lfarlc`, file address of the relocation table
        relocation_table, set_relocation_table: u16 = 0x18;
        /// `e_ovno`
        overlay_number, set_overlay_number: u16 = 0x1a;
        /// `e_res`
        reserved_words_1, set_reserved_words_1: [u16; 4] = 0x1c;
        /// `e_oemid`
        oem_id, set_oem_id: u16 = 0x24;
        /// `e_oeminfo`
        oem_info, set_oem_info: u16 = 0x26;
        /// `e_res2`
        reserved_words_2, set_reserved_words_2: [u16; 10] = 0x28;
        /// `e_lfanew`, offset of the NT headers from the image base
        new_header_offset, set_new_header_offset: u32 = 0x3c;
    }
}

#[cfg(test)]
mod tests {
    use crate::space::{Access, BufferSpace};
    use crate::testing::TestImage;
    use crate::Error;

    use super::*;

    #[test]
    fn test_signature() {
        let mut image = TestImage::pe32(0x40_0000);
        let space = BufferSpace::new();
        space.map(0x40_0000, image.mapped(), Access::ReadWrite);
        let header = DosHeader::new(ImageView::mapped(&space, 0x40_0000)).unwrap();
        assert_eq!(header.magic().unwrap(), DOS_MAGIC);
        assert_eq!(header.new_header_offset().unwrap(), 0x80);

        image.write_u16(0, 0);
        let space = BufferSpace::new();
        space.map(0x40_0000, image.mapped(), Access::ReadWrite);
        assert!(matches!(
            DosHeader::new(ImageView::mapped(&space, 0x40_0000)),
            Err(Error::InvalidSignature { found: 0, .. })
        ));
    }

    #[test]
    /// Test get-after-set on every kind of field
    fn test_setters() {
        let image = TestImage::pe32(0x40_0000);
        let space = BufferSpace::new();
        space.map(0x40_0000, image.mapped(), Access::ReadWrite);
        let header = DosHeader::new(ImageView::mapped(&space, 0x40_0000)).unwrap();

        header.set_checksum(0x1234).unwrap();
        assert_eq!(header.checksum().unwrap(), 0x1234);
        header.set_reserved_words_2([7; 10]).unwrap();
        assert_eq!(header.reserved_words_2().unwrap(), [7; 10]);
        header.set_oem_id(3).unwrap();
        assert_eq!(header.oem_id().unwrap(), 3);

        // the target stops accepting writes
        space.set_access(0x40_0000, Access::DropWrites).unwrap();
        assert!(matches!(
            header.set_checksum(0x9999),
            Err(Error::VerificationMismatch { .. })
        ));
        assert_eq!(header.checksum().unwrap(), 0x1234);
    }
}
