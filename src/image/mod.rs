//! # Image
//!
//! Structural access to PE images, either mapped by the loader or laid out as on disk.
//!
//! [`ImageView`] translates RVAs into addresses. The lenses ([`DosHeader`], [`NtHeaders`],
//! [`Section`], [`ExportDir`], [`ImportDir`], [`TlsDir`]) anchor themselves once at
//! construction and then read and write individual fields through a
//! [`ByteStore`](crate::ByteStore), so every setter is verified.

/// Generates a getter/setter pair per field of a lens
///
/// Each field is read and written at a fixed offset from the lens' `base`.
macro_rules! lens_fields {
    ($($(#[$meta:meta])* $get:ident, $set:ident: $ty:ty = $offset:expr;)*) => {
        $(
            $(#[$meta])*
            pub fn $get(&self) -> $crate::Result<$ty> {
                self.view.store().read::<$ty>(self.base + $offset)
            }

            #[doc = concat!("Sets the value returned by [`Self::", stringify!($get), "`]")]
            pub fn $set(&self, value: $ty) -> $crate::Result<()> {
                self.view.store().write::<$ty>(self.base + $offset, value)
            }
        )*
    };
}

pub mod dos;
pub mod export;
pub mod import;
pub mod nt;
pub mod section;
pub mod tls;

pub use dos::DosHeader;
pub use export::{ExportDir, ExportEntry, ExportTarget, Forwarder};
pub use import::{ImportDescriptor, ImportDir, ImportName, ImportThunk};
pub use nt::{DataDirectory, DirectoryEntry, NtHeaders, PeKind};
pub use section::{Section, SectionRecord, Sections};
pub use tls::TlsDir;

use crate::error::{Error, Result};
use crate::space::{Address, AddressSpace};
use crate::store::ByteStore;

/// How an image is laid out in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Sections sit at their virtual addresses, as mapped by the loader
    Mapped,
    /// Sections sit at their file offsets, as read from disk
    RawOnDisk,
}

/// A PE image at `base`, interpreted according to its [`Mode`]
///
/// Views own nothing and are cheap to copy.
pub struct ImageView<'a, S: AddressSpace + ?Sized> {
    /// Store the image is read through
    store: ByteStore<'a, S>,
    /// Address of the first byte of the image (the DOS header)
    base: Address,
    /// Layout of the image
    mode: Mode,
}

impl<'a, S: AddressSpace + ?Sized> Clone for ImageView<'a, S> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'a, S: AddressSpace + ?Sized> Copy for ImageView<'a, S> {}

impl<'a, S: AddressSpace + ?Sized> ImageView<'a, S> {
    /// Creates a view of the image at `base`
    pub fn new(space: &'a S, base: Address, mode: Mode) -> Self {
        Self {
            store: ByteStore::new(space),
            base,
            mode,
        }
    }

    /// Creates a view of an image mapped by the loader
    pub fn mapped(space: &'a S, base: Address) -> Self {
        Self::new(space, base, Mode::Mapped)
    }

    /// Creates a view of a raw image file loaded at `base`
    pub fn raw(space: &'a S, base: Address) -> Self {
        Self::new(space, base, Mode::RawOnDisk)
    }

    /// Store used for every access
    pub fn store(&self) -> ByteStore<'a, S> {
        self.store
    }

    /// Address of the image
    pub fn base(&self) -> Address {
        self.base
    }

    /// Layout of the image
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Translates an RVA into an address
    ///
    /// In [`Mode::Mapped`] this is `base + rva`, except that RVA 0 means "absent" and resolves
    /// to `None`. In [`Mode::RawOnDisk`] the headers are re-read and the section table is
    /// walked for the section whose virtual range contains `rva`; the result is the matching
    /// file offset. RVAs that no section backs with file data resolve to `None`, except those
    /// inside the headers, which map onto themselves.
    pub fn resolve(&self, rva: u32) -> Result<Option<Address>> {
        match self.mode {
            Mode::Mapped => Ok((rva != 0).then(|| self.base + u64::from(rva))),
            Mode::RawOnDisk => {
                let nt = NtHeaders::new(*self)?;
                for section in nt.sections()? {
                    let record = section.record()?;
                    if let Some(offset) = record.file_offset_of(rva) {
                        return Ok(Some(self.base + u64::from(offset)));
                    }
                    if record.contains_rva(rva) {
                        // inside the section, but past the data stored in the file
                        return Ok(None);
                    }
                }
                if rva < nt.size_of_headers()? {
                    return Ok(Some(self.base + u64::from(rva)));
                }
                Ok(None)
            }
        }
    }

    /// Like [`ImageView::resolve`], but an unresolvable RVA is an error
    pub fn address_of(&self, rva: u32) -> Result<Address> {
        self.resolve(rva)?
            .ok_or_else(|| Error::out_of_range("rva", rva))
    }

    /// Translates an address inside the image back into an RVA
    pub fn rva_of(&self, address: Address) -> Result<Option<u32>> {
        let Some(offset) = address.checked_sub(self.base) else {
            return Ok(None);
        };
        let Ok(offset) = u32::try_from(offset) else {
            return Ok(None);
        };
        match self.mode {
            Mode::Mapped => Ok(Some(offset)),
            Mode::RawOnDisk => {
                let nt = NtHeaders::new(*self)?;
                for section in nt.sections()? {
                    if let Some(rva) = section.record()?.rva_of_file_offset(offset) {
                        return Ok(Some(rva));
                    }
                }
                Ok((offset < nt.size_of_headers()?).then_some(offset))
            }
        }
    }

    /// Converts an absolute VA stored inside the image (e.g. in the TLS directory) into an RVA
    ///
    /// Mapped images have been relocated to `base`; raw images still refer to the preferred
    /// base recorded in the optional header.
    pub fn va_to_rva(&self, va: u64) -> Result<u32> {
        let image_base = match self.mode {
            Mode::Mapped => self.base,
            Mode::RawOnDisk => NtHeaders::new(*self)?.image_base()?,
        };
        va.checked_sub(image_base)
            .and_then(|rva| u32::try_from(rva).ok())
            .ok_or_else(|| Error::out_of_range("virtual address", va))
    }

    /// Resolves an absolute VA stored inside the image into an address in this view
    pub fn address_of_va(&self, va: u64) -> Result<Address> {
        match self.mode {
            Mode::Mapped => Ok(va),
            Mode::RawOnDisk => self.address_of(self.va_to_rva(va)?),
        }
    }
}
