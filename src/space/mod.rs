//! # Address space
//!
//! This module covers the boundary to the memory of a process. Everything else in the crate
//! reaches process memory only through [`AddressSpace`].

pub mod buffer;
pub mod local;

pub use buffer::{Access, BufferSpace};
pub use local::LocalProcess;

use crate::error::{AccessFault, Result};

/// An absolute address in the target address space
pub type Address = u64;

/// A module loaded in the target process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// File name of the module, e.g. `kernel32.dll`
    pub name: String,
    /// Address the image is mapped at
    pub base: Address,
    /// Size of the mapped image in bytes
    pub size: u64,
}

impl Module {
    /// Creates a module record
    pub fn new(name: impl Into<String>, base: Address, size: u64) -> Self {
        Self {
            name: name.into(),
            base,
            size,
        }
    }

    /// Returns true if `name` refers to this module
    ///
    /// See [`module_names_match`].
    pub fn is_named(&self, name: &str) -> bool {
        module_names_match(&self.name, name)
    }
}

/// Raw access to the memory of a process
///
/// Implementors report failures of the underlying call as [`Error::Io`](crate::Error::Io);
/// verification of writes is done one layer up by [`ByteStore`](crate::ByteStore).
pub trait AddressSpace {
    /// Fills `buf` with the bytes starting at `address`
    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` starting at `address`
    fn write_bytes(&self, address: Address, data: &[u8]) -> Result<()>;

    /// Snapshot of the modules loaded in the process
    fn modules(&self) -> Result<Vec<Module>>;

    /// Allocates `len` bytes of executable memory, preferably within 2 GiB of `near`
    fn allocate(&self, near: Address, len: usize) -> Result<Address> {
        let _ = near;
        Err(crate::Error::io(0, len, AccessFault::Unsupported))
    }

    /// Releases memory returned by [`AddressSpace::allocate`]
    fn free(&self, address: Address) -> Result<()> {
        Err(crate::Error::io(address, 0, AccessFault::Unsupported))
    }
}

impl<S: AddressSpace + ?Sized> AddressSpace for &S {
    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        (**self).read_bytes(address, buf)
    }

    fn write_bytes(&self, address: Address, data: &[u8]) -> Result<()> {
        (**self).write_bytes(address, data)
    }

    fn modules(&self) -> Result<Vec<Module>> {
        (**self).modules()
    }

    fn allocate(&self, near: Address, len: usize) -> Result<Address> {
        (**self).allocate(near, len)
    }

    fn free(&self, address: Address) -> Result<()> {
        (**self).free(address)
    }
}

/// Compares two module names the way the loader does
///
/// Comparison is ASCII case-insensitive, ignores any leading directory, and treats a name
/// without an extension as ending in `.dll`.
pub fn module_names_match(a: &str, b: &str) -> bool {
    fn normalize(name: &str) -> String {
        let file = name.rsplit(['\\', '/']).next().unwrap_or(name);
        let mut file = file.to_ascii_lowercase();
        if !file.contains('.') {
            file.push_str(".dll");
        }
        file
    }
    normalize(a) == normalize(b)
}
