//! The address space of the current process

use std::ptr;
use std::sync::{Mutex, RwLock};

use region::Protection;

use crate::alloc::{Allocation, ProximityAllocator, DEFAULT_MAX_DISTANCE};
use crate::error::{AccessFault, Error, Result};

use super::{Address, AddressSpace, Module};

/// The address space of the calling process
///
/// Every access is checked against the page map first, so bad addresses produce
/// [`Error::Io`] instead of a fault. With [`LocalProcess::unprotect_writes`] (the default),
/// writes temporarily lift page protection the way a loader would when patching read-only
/// tables; otherwise writes to pages without write access fail.
///
/// Module enumeration is left to the host: register modules with
/// [`LocalProcess::with_modules`].
pub struct LocalProcess {
    /// Modules reported by [`AddressSpace::modules`]
    modules: RwLock<Vec<Module>>,
    /// Lift page protection around writes
    unprotect: bool,
    /// Pools for trampolines
    allocator: Mutex<ProximityAllocator>,
    /// Blocks handed out by `allocate` and not yet freed
    allocations: Mutex<Vec<Allocation>>,
}

impl Default for LocalProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalProcess {
    /// Creates a view of the current process with no registered modules
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(Vec::new()),
            unprotect: true,
            allocator: Mutex::new(ProximityAllocator::new(DEFAULT_MAX_DISTANCE)),
            allocations: Mutex::new(Vec::new()),
        }
    }

    /// Sets the modules reported by [`AddressSpace::modules`]
    pub fn with_modules(self, modules: Vec<Module>) -> Self {
        Self {
            modules: RwLock::new(modules),
            ..self
        }
    }

    /// Chooses whether writes may lift page protection
    pub fn unprotect_writes(self, unprotect: bool) -> Self {
        Self { unprotect, ..self }
    }

    /// Sets how far from the requested address trampolines may be allocated
    pub fn max_distance(self, max_distance: usize) -> Self {
        Self {
            allocator: Mutex::new(ProximityAllocator::new(max_distance)),
            ..self
        }
    }

    /// Registers one more module
    pub fn add_module(&self, module: Module) {
        if let Ok(mut modules) = self.modules.write() {
            modules.push(module);
        }
    }

    /// Checks that every page of the range grants `required`
    fn check(&self, address: Address, len: usize, required: Protection) -> Result<()> {
        let fault = |e: region::Error| match e {
            region::Error::UnmappedRegion => Error::io(address, len, AccessFault::Unmapped),
            e => Error::io(address, len, e),
        };
        for page in region::query_range(address as *const u8, len).map_err(fault)? {
            let page = page.map_err(fault)?;
            if page.is_guarded() || !page.protection().contains(required) {
                let denied = if required.contains(Protection::WRITE) {
                    AccessFault::NotWritable
                } else {
                    AccessFault::NotReadable
                };
                return Err(Error::io(address, len, denied));
            }
        }
        Ok(())
    }
}

impl AddressSpace for LocalProcess {
    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check(address, buf.len(), Protection::READ)?;
        // Safety: every page of the range was just found to be mapped and readable
        unsafe { ptr::copy_nonoverlapping(address as usize as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn write_bytes(&self, address: Address, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let target = address as usize as *mut u8;
        if self.unprotect {
            // make sure the range exists before touching its protection
            self.check(address, data.len(), Protection::NONE)?;
            let _guard = unsafe {
                region::protect_with_handle(target, data.len(), Protection::READ_WRITE_EXECUTE)
            }
            .map_err(|e| Error::io(address, data.len(), e))?;
            // Safety: the range is mapped and writable until `_guard` drops
            unsafe { ptr::copy(data.as_ptr(), target, data.len()) };
        } else {
            self.check(address, data.len(), Protection::WRITE)?;
            // Safety: every page of the range was just found to be writable
            unsafe { ptr::copy(data.as_ptr(), target, data.len()) };
        }
        Ok(())
    }

    fn modules(&self) -> Result<Vec<Module>> {
        let modules = self
            .modules
            .read()
            .map_err(|_| Error::io(0, 0, AccessFault::Unsupported))?;
        Ok(modules.clone())
    }

    fn allocate(&self, near: Address, len: usize) -> Result<Address> {
        let mut allocator = self
            .allocator
            .lock()
            .map_err(|_| Error::io(near, len, AccessFault::Unsupported))?;
        let block = allocator
            .allocate(near as usize, len)
            .map_err(|e| Error::io(near, len, e))?;
        let address = block.as_ptr() as usize as Address;
        let mut allocations = self
            .allocations
            .lock()
            .map_err(|_| Error::io(near, len, AccessFault::Unsupported))?;
        allocations.push(block);
        Ok(address)
    }

    fn free(&self, address: Address) -> Result<()> {
        let mut allocations = self
            .allocations
            .lock()
            .map_err(|_| Error::io(address, 0, AccessFault::Unsupported))?;
        let index = allocations
            .iter()
            .position(|block| block.as_ptr() as usize as Address == address)
            .ok_or_else(|| Error::io(address, 0, AccessFault::Unmapped))?;
        let block = allocations.swap_remove(index);
        drop(allocations);

        let mut allocator = self
            .allocator
            .lock()
            .map_err(|_| Error::io(address, 0, AccessFault::Unsupported))?;
        allocator.release(block);
        Ok(())
    }
}
