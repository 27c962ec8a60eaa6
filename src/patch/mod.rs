//! # Patch
//!
//! This module covers patches, which overwrite a location in memory and can restore it.
//!
//! A patch is created [`PatchState::Unapplied`], and moves to [`PatchState::Applied`] and then
//! [`PatchState::Removed`]. Patches never restore themselves on drop; the owning
//! [`Hook`](crate::Hook) decides when memory is put back.

pub mod code;
pub mod slot;

pub use code::CodePatch;
pub use slot::SlotPatch;

use crate::error::Result;
use crate::space::{Address, Module};

/// What kind of location a patch overwrites
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchKind {
    /// An export address table entry
    ExportSlot,
    /// The first instructions of an exported function
    ExportCode,
    /// An import address table entry of `importer`
    ImportSlot {
        /// Module whose import table is patched
        importer: Module,
    },
}

/// The location a patch overwrites
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTarget {
    /// First patched byte
    pub address: Address,
    /// What lives at `address`
    pub kind: PatchKind,
}

impl PatchTarget {
    /// Creates a patch target
    pub fn new(address: Address, kind: PatchKind) -> Self {
        Self { address, kind }
    }
}

/// Lifecycle of a patch or hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    /// Recorded but not written
    Unapplied,
    /// Written and active
    Applied,
    /// Restored; terminal
    Removed,
}

/// A reversible modification of one location
pub trait Patch {
    /// Location this patch overwrites
    fn target(&self) -> &PatchTarget;

    /// Current lifecycle state
    fn state(&self) -> PatchState;

    /// Writes the patch
    ///
    /// Fails with [`Error::InvalidState`](crate::Error::InvalidState) unless the patch is
    /// unapplied; a failed apply leaves it unapplied.
    fn apply(&mut self) -> Result<()>;

    /// Restores the original contents and retires the patch
    ///
    /// Fails with [`Error::InvalidState`](crate::Error::InvalidState) unless the patch is
    /// applied; a failed removal leaves it applied.
    fn remove(&mut self) -> Result<()>;

    /// Restores the original contents and returns the patch to [`PatchState::Unapplied`]
    ///
    /// Used to undo a partially applied hook.
    fn rollback(&mut self) -> Result<()>;

    /// Address that behaves like the unpatched code, if known
    fn original(&self) -> Option<Address>;
}
