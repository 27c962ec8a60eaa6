//! The TLS directory and its callback array

use crate::error::{Error, Result};
use crate::space::{Address, AddressSpace};
use crate::store::PointerWidth;

use super::nt::{DataDirectory, NtHeaders};
use super::ImageView;

/// Longest callback array [`TlsDir::callbacks`] will walk
pub const MAX_TLS_CALLBACKS: usize = 4096;

/// Lens over `IMAGE_TLS_DIRECTORY32` / `IMAGE_TLS_DIRECTORY64`
///
/// Unlike the other directory lenses an absent directory still yields a lens; it reports
/// itself through [`TlsDir::is_valid`] and every field access fails with
/// [`Error::InvalidState`].
pub struct TlsDir<'a, S: AddressSpace + ?Sized> {
    /// Image the directory belongs to
    view: ImageView<'a, S>,
    /// Address of the directory, if the image has one
    base: Option<Address>,
    /// Width of the VA fields
    width: PointerWidth,
}

impl<'a, S: AddressSpace + ?Sized> TlsDir<'a, S> {
    /// Anchors the lens at the TLS directory
    pub fn new(view: ImageView<'a, S>) -> Result<Self> {
        let nt = NtHeaders::new(view)?;
        let entry = nt.data_directory(DataDirectory::Tls)?;
        let base = if entry.is_present() {
            view.resolve(entry.virtual_address)?
        } else {
            None
        };
        Ok(Self {
            view,
            base,
            width: nt.kind().pointer_width(),
        })
    }

    /// True if the image has a TLS directory
    pub fn is_valid(&self) -> bool {
        self.base.is_some()
    }

    /// Address of the directory
    pub fn base(&self) -> Result<Address> {
        self.base
            .ok_or(Error::InvalidState("image has no TLS directory"))
    }

    /// Address of the field at pointer index `index` (the four VA fields come first)
    fn pointer_field(&self, index: u64) -> Result<Address> {
        Ok(self.base()? + index * self.width.size() as u64)
    }

    /// Address of a 32-bit field following the four VA fields
    fn trailing_field(&self, index: u64) -> Result<Address> {
        Ok(self.pointer_field(4)? + index * 4)
    }

    /// Reads VA field `index`
    fn read_va(&self, index: u64) -> Result<u64> {
        let address = self.pointer_field(index)?;
        self.view.store().read_pointer(address, self.width)
    }

    /// Writes VA field `index`
    fn write_va(&self, index: u64, value: u64) -> Result<()> {
        let address = self.pointer_field(index)?;
        self.view.store().write_pointer(address, self.width, value)
    }

    /// VA of the first byte of the TLS template
    pub fn start_address_of_raw_data(&self) -> Result<u64> {
        self.read_va(0)
    }

    /// Sets the value returned by [`Self::start_address_of_raw_data`]
    pub fn set_start_address_of_raw_data(&self, value: u64) -> Result<()> {
        self.write_va(0, value)
    }

    /// VA one past the last byte of the TLS template
    pub fn end_address_of_raw_data(&self) -> Result<u64> {
        self.read_va(1)
    }

    /// Sets the value returned by [`Self::end_address_of_raw_data`]
    pub fn set_end_address_of_raw_data(&self, value: u64) -> Result<()> {
        self.write_va(1, value)
    }

    /// VA of the slot receiving the TLS index
    pub fn address_of_index(&self) -> Result<u64> {
        self.read_va(2)
    }

    /// Sets the value returned by [`Self::address_of_index`]
    pub fn set_address_of_index(&self, value: u64) -> Result<()> {
        self.write_va(2, value)
    }

    /// VA of the null-terminated callback array
    pub fn address_of_callbacks(&self) -> Result<u64> {
        self.read_va(3)
    }

    /// Sets the value returned by [`Self::address_of_callbacks`]
    pub fn set_address_of_callbacks(&self, value: u64) -> Result<()> {
        self.write_va(3, value)
    }

    /// Bytes zero-filled after the TLS template
    pub fn size_of_zero_fill(&self) -> Result<u32> {
        self.view.store().read::<u32>(self.trailing_field(0)?)
    }

    /// Sets the value returned by [`Self::size_of_zero_fill`]
    pub fn set_size_of_zero_fill(&self, value: u32) -> Result<()> {
        self.view.store().write::<u32>(self.trailing_field(0)?, value)
    }

    /// Alignment flags (`IMAGE_SCN_ALIGN_*`)
    pub fn characteristics(&self) -> Result<u32> {
        self.view.store().read::<u32>(self.trailing_field(1)?)
    }

    /// Sets the value returned by [`Self::characteristics`]
    pub fn set_characteristics(&self, value: u32) -> Result<()> {
        self.view.store().write::<u32>(self.trailing_field(1)?, value)
    }

    /// RVAs of the TLS callbacks, in array order
    ///
    /// An array running past [`MAX_TLS_CALLBACKS`] entries without a terminator is
    /// [`Error::OutOfRange`].
    pub fn callbacks(&self) -> Result<Vec<u32>> {
        let array = self.address_of_callbacks()?;
        if array == 0 {
            return Ok(Vec::new());
        }
        let array = self.view.address_of_va(array)?;
        let store = self.view.store();
        let size = self.width.size() as u64;

        let mut callbacks = Vec::new();
        for i in 0..=MAX_TLS_CALLBACKS as u64 {
            let va = store.read_pointer(array + i * size, self.width)?;
            if va == 0 {
                return Ok(callbacks);
            }
            callbacks.push(self.view.va_to_rva(va)?);
        }
        Err(Error::out_of_range("TLS callback count", MAX_TLS_CALLBACKS as u64))
    }
}

#[cfg(test)]
mod tests {
    use crate::space::{Access, BufferSpace};
    use crate::testing::TestImage;

    use super::*;

    #[test]
    /// `[addr1, addr2, 0]` yields both callbacks as RVAs, in order
    fn test_callbacks() {
        let mut image = TestImage::pe64(0x1_8000_0000);
        image.tls(&[0x1100, 0x1040]);
        let space = BufferSpace::new();
        space.map(image.base(), image.mapped(), Access::ReadWrite);
        let tls = TlsDir::new(ImageView::mapped(&space, image.base())).unwrap();

        assert!(tls.is_valid());
        assert_eq!(tls.callbacks().unwrap(), [0x1100, 0x1040]);
        assert_eq!(tls.start_address_of_raw_data().unwrap(), 0x1_8000_2000);
        assert_eq!(tls.size_of_zero_fill().unwrap(), 0x10);
        assert_eq!(tls.characteristics().unwrap(), 0x0030_0000);
    }

    #[test]
    /// Raw images store VAs relative to the preferred base
    fn test_callbacks_raw_pe32() {
        let mut image = TestImage::pe32(0x40_0000);
        image.tls(&[0x1000, 0x1010, 0x1020]);
        let space = BufferSpace::new();
        space.map(0x10_0000, image.raw(), Access::ReadWrite);
        let tls = TlsDir::new(ImageView::raw(&space, 0x10_0000)).unwrap();

        assert_eq!(tls.callbacks().unwrap(), [0x1000, 0x1010, 0x1020]);
        assert_eq!(tls.address_of_index().unwrap(), 0x40_2100);
    }

    #[test]
    fn test_no_callbacks() {
        let mut image = TestImage::pe32(0x40_0000);
        image.tls(&[]);
        let space = BufferSpace::new();
        space.map(image.base(), image.mapped(), Access::ReadWrite);
        let tls = TlsDir::new(ImageView::mapped(&space, image.base())).unwrap();
        assert!(tls.callbacks().unwrap().is_empty());

        tls.set_address_of_callbacks(0).unwrap();
        assert!(tls.callbacks().unwrap().is_empty());
    }

    #[test]
    fn test_absent() {
        let image = TestImage::pe64(0x1_8000_0000);
        let space = BufferSpace::new();
        space.map(image.base(), image.mapped(), Access::ReadWrite);
        let tls = TlsDir::new(ImageView::mapped(&space, image.base())).unwrap();

        assert!(!tls.is_valid());
        assert!(matches!(
            tls.callbacks(),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            tls.set_characteristics(0),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    /// A callback array without terminator stops at the cap
    fn test_runaway() {
        let base = 0x1_8000_0000u64;
        let mut image = TestImage::pe64(base);
        let directory = image.tls(&[]);
        let space = BufferSpace::new();
        space.map(base, image.mapped(), Access::ReadWrite);
        // a separate region full of non-null pointers
        let array = 0x2_0000_0000u64;
        let mut data = Vec::with_capacity((MAX_TLS_CALLBACKS + 8) * 8);
        for _ in 0..MAX_TLS_CALLBACKS + 8 {
            data.extend_from_slice(&(base + 0x1000).to_le_bytes());
        }
        space.map(array, data, Access::ReadWrite);

        let tls = TlsDir::new(ImageView::mapped(&space, base)).unwrap();
        assert_eq!(tls.base().unwrap(), base + u64::from(directory));
        tls.set_address_of_callbacks(array).unwrap();
        assert!(matches!(
            tls.callbacks(),
            Err(Error::OutOfRange {
                what: "TLS callback count",
                ..
            })
        ));
    }

    #[test]
    /// Test get-after-set and write verification
    fn test_setters() {
        let mut image = TestImage::pe32(0x40_0000);
        image.tls(&[0x1000]);
        let space = BufferSpace::new();
        space.map(image.base(), image.mapped(), Access::ReadWrite);
        let tls = TlsDir::new(ImageView::mapped(&space, image.base())).unwrap();

        tls.set_end_address_of_raw_data(0x40_2200).unwrap();
        assert_eq!(tls.end_address_of_raw_data().unwrap(), 0x40_2200);
        tls.set_size_of_zero_fill(0x20).unwrap();
        assert_eq!(tls.size_of_zero_fill().unwrap(), 0x20);
        assert!(matches!(
            tls.set_start_address_of_raw_data(0x1_0000_0000),
            Err(Error::OutOfRange { .. })
        ));

        space.set_access(image.base(), Access::DropWrites).unwrap();
        assert!(matches!(
            tls.set_characteristics(1),
            Err(Error::VerificationMismatch { .. })
        ));
    }
}
