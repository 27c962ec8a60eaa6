//! In-memory address space made of plain byte buffers
//!
//! Used for images read from disk and as a stand-in for a remote process.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::error::{AccessFault, Error, Result};

use super::{Address, AddressSpace, Module};

/// Alignment of regions handed out by [`BufferSpace::allocate`]
const ALLOCATION_ALIGN: u64 = 0x1000;

/// How a region reacts to writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Reads and writes succeed
    ReadWrite,
    /// Writes fail with [`AccessFault::NotWritable`]
    ReadOnly,
    /// Writes report success but the bytes are discarded
    DropWrites,
}

/// A contiguous run of bytes mapped at `base`
#[derive(Debug)]
struct Region {
    /// First address of the region
    base: Address,
    /// Contents
    data: Vec<u8>,
    /// Write behaviour
    access: Access,
}

impl Region {
    /// Offset of `[address, address + len)` inside this region, if it lies fully inside
    fn offset_of(&self, address: Address, len: usize) -> Option<usize> {
        let offset = address.checked_sub(self.base)?;
        let end = offset.checked_add(len as u64)?;
        (end <= self.data.len() as u64).then_some(offset as usize)
    }
}

/// An address space backed by in-memory buffers
///
/// Accesses must fall entirely inside one mapped region. Every successful write is counted,
/// which lets callers observe exactly how many times memory was touched.
#[derive(Debug, Default)]
pub struct BufferSpace {
    /// Mapped regions, unordered
    regions: RwLock<Vec<Region>>,
    /// Modules reported by [`AddressSpace::modules`]
    modules: RwLock<Vec<Module>>,
    /// Number of `write_bytes` calls that reached a region
    writes: AtomicUsize,
}

impl BufferSpace {
    /// Creates an empty address space
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps the file at `path` read-write at `base`, as the raw on-disk layout
    pub fn from_file(path: impl AsRef<Path>, base: Address) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| Error::io(base, 0, e))?;
        let space = Self::new();
        space.map(base, data, Access::ReadWrite);
        Ok(space)
    }

    /// Maps `data` at `base`
    ///
    /// Regions must not overlap; a region overlapping an existing one is still added but the
    /// first match wins on access.
    pub fn map(&self, base: Address, data: Vec<u8>, access: Access) {
        if let Ok(mut regions) = self.regions.write() {
            regions.push(Region { base, data, access });
        }
    }

    /// Changes the write behaviour of the region containing `address`
    pub fn set_access(&self, address: Address, access: Access) -> Result<()> {
        let mut regions = self.regions.write().map_err(|_| poisoned(address))?;
        let region = regions
            .iter_mut()
            .find(|r| r.offset_of(address, 1).is_some())
            .ok_or_else(|| Error::io(address, 1, AccessFault::Unmapped))?;
        region.access = access;
        Ok(())
    }

    /// Registers a module to be reported by [`AddressSpace::modules`]
    pub fn add_module(&self, module: Module) {
        if let Ok(mut modules) = self.modules.write() {
            modules.push(module);
        }
    }

    /// Number of writes that reached a region so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

/// Error for a lock poisoned by a panicking writer
fn poisoned(address: Address) -> Error {
    Error::io(address, 0, AccessFault::Unsupported)
}

impl AddressSpace for BufferSpace {
    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        let regions = self.regions.read().map_err(|_| poisoned(address))?;
        let (region, offset) = regions
            .iter()
            .find_map(|r| r.offset_of(address, buf.len()).map(|o| (r, o)))
            .ok_or_else(|| Error::io(address, buf.len(), AccessFault::Unmapped))?;
        buf.copy_from_slice(&region.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_bytes(&self, address: Address, data: &[u8]) -> Result<()> {
        let mut regions = self.regions.write().map_err(|_| poisoned(address))?;
        let (region, offset) = regions
            .iter_mut()
            .find_map(|r| r.offset_of(address, data.len()).map(|o| (r, o)))
            .ok_or_else(|| Error::io(address, data.len(), AccessFault::Unmapped))?;
        match region.access {
            Access::ReadOnly => return Err(Error::io(address, data.len(), AccessFault::NotWritable)),
            Access::DropWrites => {}
            Access::ReadWrite => region.data[offset..offset + data.len()].copy_from_slice(data),
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn modules(&self) -> Result<Vec<Module>> {
        let modules = self.modules.read().map_err(|_| poisoned(0))?;
        Ok(modules.clone())
    }

    fn allocate(&self, near: Address, len: usize) -> Result<Address> {
        let mut regions = self.regions.write().map_err(|_| poisoned(near))?;
        // place the block right after the highest region at or above `near`
        let end = regions
            .iter()
            .map(|r| r.base + r.data.len() as u64)
            .filter(|&end| end >= near)
            .max()
            .unwrap_or(near);
        let base = (end + ALLOCATION_ALIGN - 1) & !(ALLOCATION_ALIGN - 1);
        regions.push(Region {
            base,
            data: vec![0xcc; len],
            access: Access::ReadWrite,
        });
        Ok(base)
    }

    fn free(&self, address: Address) -> Result<()> {
        let mut regions = self.regions.write().map_err(|_| poisoned(address))?;
        let index = regions
            .iter()
            .position(|r| r.base == address)
            .ok_or_else(|| Error::io(address, 0, AccessFault::Unmapped))?;
        regions.remove(index);
        Ok(())
    }
}
