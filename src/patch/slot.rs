//! # Slot Patch
//!
//! Rewrites a single table entry, such as an import or export address table slot

use log::warn;

use crate::error::{Error, Result};
use crate::space::{Address, AddressSpace};
use crate::store::{ByteStore, PointerWidth};

use super::{Patch, PatchState, PatchTarget};

/// Patch replacing the value of one pointer-sized (or RVA-sized) slot
///
/// The value found in the slot when the patch is applied is kept and written back on
/// removal. Slots holding RVAs are created with a `rebase` so that
/// [`Patch::original`] still reports an address.
pub struct SlotPatch<'a, S: AddressSpace + ?Sized> {
    /// Store the slot is written through
    store: ByteStore<'a, S>,
    /// Location of the slot
    target: PatchTarget,
    /// Width of the slot
    width: PointerWidth,
    /// Value written by `apply`
    replacement: u64,
    /// Value of the slot before `apply`
    saved: u64,
    /// Added to slot values to form addresses
    rebase: Address,
    /// Lifecycle state
    state: PatchState,
}

impl<'a, S: AddressSpace + ?Sized> SlotPatch<'a, S> {
    /// Records a patch of `target`, reading the slot's current value
    pub fn new(
        store: ByteStore<'a, S>,
        target: PatchTarget,
        width: PointerWidth,
        replacement: u64,
        rebase: Address,
    ) -> Result<Self> {
        let saved = store.read_pointer(target.address, width)?;
        Ok(Self {
            store,
            target,
            width,
            replacement,
            saved,
            rebase,
            state: PatchState::Unapplied,
        })
    }

    /// Value the slot held before the patch
    pub fn saved(&self) -> u64 {
        self.saved
    }

    /// Value the patch writes
    pub fn replacement(&self) -> u64 {
        self.replacement
    }

    /// Writes the saved value back
    fn restore(&mut self) -> Result<()> {
        if self.state != PatchState::Applied {
            return Err(Error::InvalidState("slot patch is not applied"));
        }
        let current = self.store.read_pointer(self.target.address, self.width)?;
        if current != self.replacement {
            warn!(
                "slot {:#x} holds {:#x} instead of the detour {:#x}, restoring anyway",
                self.target.address, current, self.replacement
            );
        }
        self.store
            .write_pointer(self.target.address, self.width, self.saved)
    }
}

impl<'a, S: AddressSpace + ?Sized> Patch for SlotPatch<'a, S> {
    fn target(&self) -> &PatchTarget {
        &self.target
    }

    fn state(&self) -> PatchState {
        self.state
    }

    fn apply(&mut self) -> Result<()> {
        if self.state != PatchState::Unapplied {
            return Err(Error::InvalidState("slot patch was already applied"));
        }
        self.saved = self.store.read_pointer(self.target.address, self.width)?;
        self.store
            .write_pointer(self.target.address, self.width, self.replacement)?;
        self.state = PatchState::Applied;
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        self.restore()?;
        self.state = PatchState::Removed;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.restore()?;
        self.state = PatchState::Unapplied;
        Ok(())
    }

    fn original(&self) -> Option<Address> {
        (self.saved != 0).then(|| self.rebase + self.saved)
    }
}
