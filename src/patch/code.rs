//! # Code Patch
//!
//! This module contains a code patcher which disassembles the target location, moves the
//! instructions it overwrites into a trampoline and writes a jump to the detour in their place.

use log::{debug, warn};

use crate::code::{self, Architecture, MAX_INSTRUCTION_LEN};
use crate::error::{Error, Result};
use crate::space::{Address, AddressSpace};
use crate::store::ByteStore;

use super::{Patch, PatchState, PatchTarget};

/// Bytes reserved for a trampoline
///
/// Enough for the longest displaced run (a jump's worth of bytes plus one more instruction)
/// to grow when short branches are re-encoded, followed by the jump back.
pub const TRAMPOLINE_LEN: usize = 0x80;

/// Inline patch redirecting a function to a detour
///
/// The trampoline is built when the patch is applied and released when it is removed. While
/// applied, [`Patch::original`] returns the trampoline, which runs the displaced instructions
/// and continues in the original function.
pub struct CodePatch<'a, S: AddressSpace + ?Sized> {
    /// Store the code is written through
    store: ByteStore<'a, S>,
    /// Entry of the patched function
    target: PatchTarget,
    /// Instruction set of the function
    arch: Architecture,
    /// Where the patch jumps to
    detour: Address,
    /// Trampoline holding the relocated instructions, while applied
    trampoline: Option<Address>,
    /// Bytes overwritten by the patch
    saved: Vec<u8>,
    /// Bytes written by the patch
    patch: Vec<u8>,
    /// Lifecycle state
    state: PatchState,
}

impl<'a, S: AddressSpace + ?Sized> CodePatch<'a, S> {
    /// Records a patch redirecting the function at `target` to `detour`
    pub fn new(
        store: ByteStore<'a, S>,
        target: PatchTarget,
        arch: Architecture,
        detour: Address,
    ) -> Self {
        Self {
            store,
            target,
            arch,
            detour,
            trampoline: None,
            saved: Vec::new(),
            patch: Vec::new(),
            state: PatchState::Unapplied,
        }
    }

    /// Address of the trampoline, while applied
    pub fn trampoline(&self) -> Option<Address> {
        self.trampoline
    }

    /// Reads the code at the target, a jump's length plus one full instruction
    fn read_code(&self) -> Result<Vec<u8>> {
        let len = self.arch.jump_len() + MAX_INSTRUCTION_LEN - 1;
        self.store.read_bytes(self.target.address, len)
    }

    /// Builds the trampoline at `trampoline` and overwrites the function entry
    fn install(&mut self, trampoline: Address) -> Result<()> {
        let source = self.target.address;
        let code = self.read_code()?;
        let relocated =
            code::relocate(self.arch, source, &code, self.arch.jump_len(), trampoline)?;
        if relocated.code.len() > TRAMPOLINE_LEN {
            return Err(Error::UnsupportedCode {
                address: source,
                reason: "relocated prologue does not fit in a trampoline",
            });
        }

        let patch = self
            .arch
            .patch_bytes(source, self.detour, relocated.displaced)?;
        self.store.write_bytes(trampoline, &relocated.code)?;
        self.store.write_bytes(source, &patch)?;
        debug!(
            "patched {} bytes at {:#x}, trampoline at {:#x}",
            relocated.displaced, source, trampoline
        );

        self.saved = code[..relocated.displaced].to_vec();
        self.patch = patch;
        Ok(())
    }

    /// Puts the saved bytes back and releases the trampoline
    fn restore(&mut self) -> Result<()> {
        if self.state != PatchState::Applied {
            return Err(Error::InvalidState("code patch is not applied"));
        }
        let current = self.store.read_bytes(self.target.address, self.patch.len())?;
        if current != self.patch {
            warn!(
                "code at {:#x} no longer holds the jump to {:#x}, restoring anyway",
                self.target.address, self.detour
            );
        }
        self.store.write_bytes(self.target.address, &self.saved)?;

        if let Some(trampoline) = self.trampoline.take() {
            if let Err(e) = self.store.space().free(trampoline) {
                warn!("leaking trampoline at {:#x}: {}", trampoline, e);
            }
        }
        Ok(())
    }
}

impl<'a, S: AddressSpace + ?Sized> Patch for CodePatch<'a, S> {
    fn target(&self) -> &PatchTarget {
        &self.target
    }

    fn state(&self) -> PatchState {
        self.state
    }

    fn apply(&mut self) -> Result<()> {
        if self.state != PatchState::Unapplied {
            return Err(Error::InvalidState("code patch was already applied"));
        }
        let space = self.store.space();
        let trampoline = space.allocate(self.target.address, TRAMPOLINE_LEN)?;
        if let Err(e) = self.install(trampoline) {
            if let Err(free) = space.free(trampoline) {
                warn!("leaking trampoline at {:#x}: {}", trampoline, free);
            }
            return Err(e);
        }
        self.trampoline = Some(trampoline);
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
        self.trampoline
    }
}
