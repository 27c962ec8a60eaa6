//! # Hook
//!
//! This module covers hooks, which redirect calls to an exported function into a detour.
//!
//! A [`Hook`] bundles every patch needed to intercept one function: at most one patch on the
//! exporting module (its export table entry or its code) and one import table patch per module
//! importing the function. All patches move through their lifecycle together.

pub mod registry;

pub use registry::{HookId, HookRegistry};

use log::{debug, error, warn};

use crate::code::Architecture;
use crate::error::{Error, Result};
use crate::image::{ExportDir, ExportTarget, ImageView, ImportDir, NtHeaders};
use crate::patch::{CodePatch, Patch, PatchKind, PatchState, PatchTarget, SlotPatch};
use crate::space::{Address, AddressSpace, Module};
use crate::store::PointerWidth;

/// Replacement code for a hooked function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detour {
    /// Address calls are redirected to
    pub address: Address,
    /// Opaque value for the caller, handed back through [`Hook::detour`]
    pub context: usize,
}

impl Detour {
    /// A detour at `address` without context
    pub fn new(address: Address) -> Self {
        Self {
            address,
            context: 0,
        }
    }

    /// Attaches a caller-defined context value
    pub fn with_context(self, context: usize) -> Self {
        Self { context, ..self }
    }
}

/// How the exporting module itself is patched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportRedirect {
    /// Rewrite the export address table entry, catching later `GetProcAddress`-style lookups
    #[default]
    Table,
    /// Overwrite the function entry with a jump, catching every caller
    Inline,
    /// Leave the exporting module alone
    Skip,
}

/// Options for [`Hook::install_with`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOptions {
    /// Export patch strategy
    export: ExportRedirect,
    /// Whether import tables are patched
    imports: bool,
    /// Module whose import table is left alone, typically the one holding the detour
    exclude_importer: Option<String>,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            export: ExportRedirect::Table,
            imports: true,
            exclude_importer: None,
        }
    }
}

impl HookOptions {
    /// Default options: export table plus every import table
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the export patch strategy
    pub fn export(self, export: ExportRedirect) -> Self {
        Self { export, ..self }
    }

    /// Chooses whether import tables are patched
    pub fn imports(self, imports: bool) -> Self {
        Self { imports, ..self }
    }

    /// Leaves the import table of `module` untouched
    pub fn exclude_importer(self, module: impl Into<String>) -> Self {
        Self {
            exclude_importer: Some(module.into()),
            ..self
        }
    }
}

/// Boxed patch owned by a hook
type BoxedPatch<'a> = Box<dyn Patch + 'a>;

/// Interception of one exported function
///
/// Dropping an applied hook restores every patch that is still applied. Errors during that
/// restore are logged, never propagated; call [`Hook::remove`] to observe them.
pub struct Hook<'a> {
    /// Module exporting the function
    module: String,
    /// Name of the function
    function: String,
    /// Where calls are redirected
    detour: Detour,
    /// Lifecycle of the hook as a whole
    state: PatchState,
    /// Patch on the exporting module
    export: Option<BoxedPatch<'a>>,
    /// Patches on importing modules
    imports: Vec<BoxedPatch<'a>>,
}

impl<'a> Hook<'a> {
    /// Records the patches redirecting `module!function` to `detour`, with default options
    pub fn install<S: AddressSpace + ?Sized>(
        space: &'a S,
        module: &str,
        function: &str,
        detour: Detour,
    ) -> Result<Self> {
        Self::install_with(space, &HookOptions::default(), module, function, detour)
    }

    /// Records the patches redirecting `module!function` to `detour`
    ///
    /// Nothing is written yet; see [`Hook::apply`]. The loaded modules are taken from
    /// [`AddressSpace::modules`] once. Fails with [`Error::NotFound`] if no patch site exists.
    pub fn install_with<S: AddressSpace + ?Sized>(
        space: &'a S,
        options: &HookOptions,
        module: &str,
        function: &str,
        detour: Detour,
    ) -> Result<Self> {
        let modules = space.modules()?;
        let mut hook = Self {
            module: module.to_string(),
            function: function.to_string(),
            detour,
            state: PatchState::Unapplied,
            export: None,
            imports: Vec::new(),
        };

        if options.export != ExportRedirect::Skip {
            if let Some(exporter) = modules.iter().find(|m| m.is_named(module)) {
                hook.record_export(space, options.export, exporter)?;
            } else {
                debug!("{} is not loaded, no export patch for {}", module, function);
            }
        }

        if options.imports {
            for importer in &modules {
                let excluded = options
                    .exclude_importer
                    .as_deref()
                    .map_or(false, |name| importer.is_named(name));
                if !excluded {
                    hook.record_import(space, importer);
                }
            }
        }

        if hook.export.is_none() && hook.imports.is_empty() {
            return Err(Error::not_found(format!("{}!{}", module, function)));
        }
        Ok(hook)
    }

    /// Records the export patch on `exporter`, if it exports the function
    fn record_export<S: AddressSpace + ?Sized>(
        &mut self,
        space: &'a S,
        redirect: ExportRedirect,
        exporter: &Module,
    ) -> Result<()> {
        let view = ImageView::mapped(space, exporter.base);
        let Some(exports) = ExportDir::new(view)? else {
            debug!("{} has no export directory", exporter.name);
            return Ok(());
        };
        let Some(entry) = exports.find_by_name(&self.function)? else {
            debug!("{} does not export {}", exporter.name, self.function);
            return Ok(());
        };
        let rva = match entry.target {
            ExportTarget::Code(rva) => rva,
            ExportTarget::Forwarded(forwarder) => {
                debug!(
                    "{}!{} is forwarded to {}.{}, not following",
                    exporter.name, self.function, forwarder.module, forwarder.function
                );
                return Ok(());
            }
        };

        debug_assert!(self.export.is_none(), "export patch recorded twice");
        let patch: BoxedPatch<'a> = match redirect {
            ExportRedirect::Table => {
                let slot = exports.slot_address(entry.offset)?;
                let relative = self
                    .detour
                    .address
                    .checked_sub(exporter.base)
                    .and_then(|offset| u32::try_from(offset).ok())
                    .ok_or_else(|| Error::out_of_range("export detour", self.detour.address))?;
                Box::new(SlotPatch::new(
                    view.store(),
                    PatchTarget::new(slot, PatchKind::ExportSlot),
                    PointerWidth::U32,
                    u64::from(relative),
                    exporter.base,
                )?)
            }
            ExportRedirect::Inline => {
                let arch = Architecture::from(NtHeaders::new(view)?.kind());
                Box::new(CodePatch::new(
                    view.store(),
                    PatchTarget::new(view.address_of(rva)?, PatchKind::ExportCode),
                    arch,
                    self.detour.address,
                ))
            }
            ExportRedirect::Skip => return Ok(()),
        };
        debug!(
            "export patch for {}!{} at {:#x}",
            exporter.name,
            self.function,
            patch.target().address
        );
        self.export = Some(patch);
        Ok(())
    }

    /// Records the import patch on `importer`, if it imports the function from the module
    ///
    /// The module list is a snapshot, so an importer may have been unloaded since, or may not
    /// be an image at all. Such a module is logged and skipped.
    fn record_import<S: AddressSpace + ?Sized>(&mut self, space: &'a S, importer: &Module) {
        match self.find_import(space, importer) {
            Ok(Some(patch)) => self.imports.push(patch),
            Ok(None) => {}
            Err(e) => warn!(
                "skipping imports of {} at {:#x}: {}",
                importer.name, importer.base, e
            ),
        }
    }

    /// Builds the import patch on `importer`, if it imports the function from the module
    fn find_import<S: AddressSpace + ?Sized>(
        &self,
        space: &'a S,
        importer: &Module,
    ) -> Result<Option<BoxedPatch<'a>>> {
        let view = ImageView::mapped(space, importer.base);
        let Some(imports) = ImportDir::new(view)? else {
            debug!("{} has no import directory", importer.name);
            return Ok(None);
        };
        let width = NtHeaders::new(view)?.kind().pointer_width();

        for descriptor in imports.descriptors()? {
            if !crate::space::module_names_match(&descriptor.module_name()?, &self.module) {
                continue;
            }
            let Some(thunk) = descriptor
                .thunks()?
                .into_iter()
                .find(|thunk| thunk.is_named(&self.function))
            else {
                continue;
            };

            debug!(
                "import patch for {}!{} in {} at {:#x}",
                self.module, self.function, importer.name, thunk.slot
            );
            let target = PatchTarget::new(
                thunk.slot,
                PatchKind::ImportSlot {
                    importer: importer.clone(),
                },
            );
            let patch: BoxedPatch<'a> = Box::new(SlotPatch::new(
                view.store(),
                target,
                width,
                self.detour.address,
                0,
            )?);
            return Ok(Some(patch));
        }
        Ok(None)
    }

    /// Module exporting the hooked function
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Name of the hooked function
    pub fn function(&self) -> &str {
        &self.function
    }

    /// The detour calls are redirected to
    pub fn detour(&self) -> Detour {
        self.detour
    }

    /// Lifecycle state of the hook
    pub fn state(&self) -> PatchState {
        self.state
    }

    /// Every patch of the hook, export patch first
    pub fn patches(&self) -> impl Iterator<Item = &(dyn Patch + 'a)> + '_ {
        self.export
            .iter()
            .chain(self.imports.iter())
            .map(|patch| &**patch)
    }

    /// Mutable access to every patch, export patch first
    fn patches_mut(&mut self) -> impl Iterator<Item = &mut BoxedPatch<'a>> + '_ {
        self.export.iter_mut().chain(self.imports.iter_mut())
    }

    /// Writes every patch, export patch first
    ///
    /// If a patch fails, the patches this call already applied are rolled back and the error
    /// is returned; the hook stays unapplied and may be applied again.
    pub fn apply(&mut self) -> Result<()> {
        match self.state {
            PatchState::Unapplied => {}
            PatchState::Applied => return Err(Error::InvalidState("hook is already applied")),
            PatchState::Removed => return Err(Error::InvalidState("hook was removed")),
        }

        let mut patches: Vec<_> = self.patches_mut().collect();
        for i in 0..patches.len() {
            if let Err(e) = patches[i].apply() {
                for patch in patches[..i].iter_mut().rev() {
                    if let Err(undo) = patch.rollback() {
                        error!(
                            "failed to roll back patch at {:#x}: {}",
                            patch.target().address,
                            undo
                        );
                    }
                }
                return Err(e);
            }
        }
        self.state = PatchState::Applied;
        Ok(())
    }

    /// Restores every applied patch
    ///
    /// Removal continues past failures; if any patch could not be restored the failures are
    /// returned as [`Error::PartialRemoval`] and those patches stay applied, so a later call
    /// (or dropping the hook) tries them again. Removing a removed hook with nothing left to
    /// restore does nothing.
    pub fn remove(&mut self) -> Result<()> {
        let mut total = 0;
        let mut failures = Vec::new();
        for patch in self.patches_mut() {
            if patch.state() != PatchState::Applied {
                continue;
            }
            total += 1;
            if let Err(e) = patch.remove() {
                error!(
                    "failed to restore patch at {:#x}: {}",
                    patch.target().address,
                    e
                );
                failures.push((patch.target().clone(), e));
            }
        }
        self.state = PatchState::Removed;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialRemoval { total, failures })
        }
    }

    /// Address that behaves like the unhooked function
    ///
    /// This is the trampoline for inline hooks, the original export for export table hooks,
    /// and otherwise the value the first patched import slot held.
    pub fn original(&self) -> Option<Address> {
        match &self.export {
            Some(export) => export.original(),
            None => self.imports.first().and_then(|patch| patch.original()),
        }
    }
}

impl<'a> Drop for Hook<'a> {
    fn drop(&mut self) {
        for patch in self.patches_mut() {
            if patch.state() != PatchState::Applied {
                continue;
            }
            if let Err(e) = patch.remove() {
                error!(
                    "failed to restore patch at {:#x} on drop: {}",
                    patch.target().address,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::code::x64;
    use crate::space::{Access, BufferSpace};
    use crate::store::ByteStore;
    use crate::testing::{Export, TestImage};

    use super::*;

    /// Base of `target.dll`
    pub const TARGET: Address = 0x1_8000_0000;
    /// Address of `target.dll!Frob`
    pub const FROB: Address = TARGET + 0x1000;
    /// Where `Frob` is redirected
    pub const DETOUR: Address = 0x1_9000_0000;

    /// `mov [rsp+8], rbx; mov [rsp+0x10], rsi; push rdi; sub rsp, 0x20`
    const PROLOGUE: [u8; 15] = [
        0x48, 0x89, 0x5c, 0x24, 0x08, 0x48, 0x89, 0x74, 0x24, 0x10, 0x57, 0x48, 0x83, 0xec, 0x20,
    ];

    /// `target.dll` exporting `Frob` and a forwarded `Fwd`, plus three modules importing `Frob`
    ///
    /// `target.dll` itself imports `Other` from `other.dll` only.
    pub fn process() -> BufferSpace {
        let space = BufferSpace::new();

        let mut target = TestImage::pe64(TARGET);
        target.write_bytes(0x1000, &PROLOGUE);
        target.exports(
            "target.dll",
            1,
            &[Export::Code(0x1000), Export::Forward("other.Frob")],
            &[("Frob", 0), ("Fwd", 1)],
        );
        target.imports(&[("other.dll", &[("Other", 0x7ff0_0000_1000)])]);
        target.load(&space, "target.dll");

        for (i, name) in ["a.exe", "b.dll", "c.dll"].into_iter().enumerate() {
            let mut importer = TestImage::pe64(0x1_0000_0000 + 0x1000_0000 * i as u64);
            importer.imports(&[
                ("kernel32.dll", &[("Sleep", 0x7ff0_0000_2000)]),
                ("TARGET.DLL", &[("Fwd", 0x7ff0_0000_3000), ("Frob", FROB)]),
            ]);
            importer.load(&space, name);
        }
        space
    }

    /// Import slot of `Frob` in `importer`
    fn import_slot(space: &BufferSpace, importer: &str) -> Address {
        let module = space
            .modules()
            .unwrap()
            .into_iter()
            .find(|m| m.name == importer)
            .unwrap();
        let imports = ImportDir::new(ImageView::mapped(space, module.base))
            .unwrap()
            .unwrap();
        let thunks = imports.find("target.dll").unwrap().unwrap().thunks().unwrap();
        thunks.into_iter().find(|t| t.is_named("Frob")).unwrap().slot
    }

    #[test]
    /// One export patch plus one import patch per importer
    fn test_install() {
        let space = process();
        let hook = Hook::install(&space, "target", "Frob", Detour::new(DETOUR)).unwrap();

        let kinds: Vec<_> = hook.patches().map(|p| p.target().kind.clone()).collect();
        assert_eq!(kinds.len(), 4);
        assert_eq!(kinds[0], PatchKind::ExportSlot);
        let importers: Vec<_> = kinds[1..]
            .iter()
            .map(|kind| match kind {
                PatchKind::ImportSlot { importer } => importer.name.as_str(),
                other => panic!("unexpected patch {:?}", other),
            })
            .collect();
        assert_eq!(importers, ["a.exe", "b.dll", "c.dll"]);
        assert_eq!(hook.state(), PatchState::Unapplied);
        assert_eq!(hook.original(), Some(FROB));
        // nothing written yet
        assert_eq!(space.write_count(), 0);
    }

    #[test]
    /// Modules that vanished or are not images are skipped instead of failing the install
    fn test_stale_modules() {
        let space = process();
        space.add_module(Module::new("gone.dll", 0x5_0000_0000, 0x6000));
        space.map(0x6_0000_0000, vec![0; 0x1000], Access::ReadWrite);
        space.add_module(Module::new("blob.dll", 0x6_0000_0000, 0x1000));

        let mut hook = Hook::install(&space, "target.dll", "Frob", Detour::new(DETOUR)).unwrap();
        assert_eq!(hook.patches().count(), 4);
        hook.apply().unwrap();
        assert_eq!(
            ByteStore::new(&space)
                .read::<u64>(import_slot(&space, "c.dll"))
                .unwrap(),
            DETOUR
        );

        // the exporting module itself must still be readable
        let space = BufferSpace::new();
        space.add_module(Module::new("target.dll", TARGET, 0x6000));
        assert!(matches!(
            Hook::install(&space, "target.dll", "Frob", Detour::new(DETOUR)),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    /// Apply redirects every slot, remove restores them, a second remove is a no-op
    fn test_apply_remove() {
        let space = process();
        let store = ByteStore::new(&space);
        let mut hook = Hook::install(&space, "target.dll", "Frob", Detour::new(DETOUR)).unwrap();
        let exports = ExportDir::new(ImageView::mapped(&space, TARGET))
            .unwrap()
            .unwrap();
        let slots: Vec<_> = ["a.exe", "b.dll", "c.dll"]
            .into_iter()
            .map(|name| import_slot(&space, name))
            .collect();

        hook.apply().unwrap();
        assert_eq!(hook.state(), PatchState::Applied);
        assert_eq!(
            exports.find_by_name("Frob").unwrap().unwrap().rva(),
            Some((DETOUR - TARGET) as u32)
        );
        for &slot in &slots {
            assert_eq!(store.read::<u64>(slot).unwrap(), DETOUR);
        }
        assert!(matches!(hook.apply(), Err(Error::InvalidState(_))));

        hook.remove().unwrap();
        assert_eq!(hook.state(), PatchState::Removed);
        assert_eq!(
            exports.find_by_name("Frob").unwrap().unwrap().rva(),
            Some(0x1000)
        );
        for &slot in &slots {
            assert_eq!(store.read::<u64>(slot).unwrap(), FROB);
        }

        let writes = space.write_count();
        hook.remove().unwrap();
        assert_eq!(space.write_count(), writes);
        assert!(matches!(hook.apply(), Err(Error::InvalidState(_))));
    }

    #[test]
    /// Dropping an applied hook restores each patch exactly once
    fn test_drop_restores() {
        let space = process();
        let slot = import_slot(&space, "b.dll");
        {
            let mut hook = Hook::install(&space, "target.dll", "Frob", Detour::new(DETOUR)).unwrap();
            hook.apply().unwrap();
            assert_eq!(space.write_count(), 4);
            assert_eq!(ByteStore::new(&space).read::<u64>(slot).unwrap(), DETOUR);
        }
        assert_eq!(space.write_count(), 8);
        assert_eq!(ByteStore::new(&space).read::<u64>(slot).unwrap(), FROB);

        // an unapplied hook touches nothing on drop
        drop(Hook::install(&space, "target.dll", "Frob", Detour::new(DETOUR)).unwrap());
        assert_eq!(space.write_count(), 8);
    }

    #[test]
    /// A failing patch rolls back the ones applied before it
    fn test_apply_rollback() {
        let space = process();
        let store = ByteStore::new(&space);
        let mut hook = Hook::install(&space, "target.dll", "Frob", Detour::new(DETOUR)).unwrap();
        let first = import_slot(&space, "a.exe");

        // c.dll silently drops writes
        space.set_access(0x1_2000_0000, Access::DropWrites).unwrap();
        assert!(matches!(
            hook.apply(),
            Err(Error::VerificationMismatch { .. })
        ));
        assert_eq!(hook.state(), PatchState::Unapplied);
        assert_eq!(store.read::<u64>(first).unwrap(), FROB);
        assert!(hook.patches().all(|p| p.state() == PatchState::Unapplied));

        space.set_access(0x1_2000_0000, Access::ReadWrite).unwrap();
        hook.apply().unwrap();
        assert_eq!(store.read::<u64>(first).unwrap(), DETOUR);
    }

    #[test]
    /// Removal keeps going past a failing patch and reports it
    fn test_partial_removal() {
        let space = process();
        let store = ByteStore::new(&space);
        let mut hook = Hook::install(&space, "target.dll", "Frob", Detour::new(DETOUR)).unwrap();
        hook.apply().unwrap();

        space.set_access(0x1_1000_0000, Access::ReadOnly).unwrap();
        match hook.remove() {
            Err(Error::PartialRemoval { total, failures }) => {
                assert_eq!(total, 4);
                assert_eq!(failures.len(), 1);
                assert!(matches!(
                    &failures[0].0.kind,
                    PatchKind::ImportSlot { importer } if importer.name == "b.dll"
                ));
                assert!(matches!(failures[0].1, Error::Io { .. }));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(store.read::<u64>(import_slot(&space, "a.exe")).unwrap(), FROB);
        assert_eq!(store.read::<u64>(import_slot(&space, "c.dll")).unwrap(), FROB);

        // the failed patch is retried
        space.set_access(0x1_1000_0000, Access::ReadWrite).unwrap();
        hook.remove().unwrap();
        assert_eq!(store.read::<u64>(import_slot(&space, "b.dll")).unwrap(), FROB);
    }

    #[test]
    fn test_options() {
        let space = process();

        let hook = Hook::install_with(
            &space,
            &HookOptions::new()
                .export(ExportRedirect::Skip)
                .exclude_importer("B"),
            "target.dll",
            "Frob",
            Detour::new(DETOUR).with_context(7),
        )
        .unwrap();
        assert_eq!(hook.patches().count(), 2);
        assert_eq!(hook.detour().context, 7);
        // no export patch: the first import's original value
        assert_eq!(hook.original(), Some(FROB));

        let hook = Hook::install_with(
            &space,
            &HookOptions::new().imports(false),
            "target.dll",
            "Frob",
            Detour::new(DETOUR),
        )
        .unwrap();
        assert_eq!(hook.patches().count(), 1);

        // too far from the module for an RVA
        assert!(matches!(
            Hook::install(&space, "target.dll", "Frob", Detour::new(0x1000)),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    /// Forwarded exports are skipped, unknown functions are not found
    fn test_not_found() {
        let space = process();

        let hook = Hook::install(&space, "target.dll", "Fwd", Detour::new(DETOUR)).unwrap();
        assert!(hook
            .patches()
            .all(|p| matches!(p.target().kind, PatchKind::ImportSlot { .. })));
        assert_eq!(hook.patches().count(), 3);

        assert!(matches!(
            Hook::install(&space, "target.dll", "Missing", Detour::new(DETOUR)),
            Err(Error::NotFound(name)) if name == "target.dll!Missing"
        ));
        assert!(matches!(
            Hook::install(&space, "absent.dll", "Frob", Detour::new(DETOUR)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    /// Inline hooks jump from the function entry and call the original through a trampoline
    fn test_inline() {
        let space = process();
        let store = ByteStore::new(&space);
        let mut hook = Hook::install_with(
            &space,
            &HookOptions::new().export(ExportRedirect::Inline).imports(false),
            "target.dll",
            "Frob",
            Detour::new(DETOUR),
        )
        .unwrap();
        assert_eq!(hook.original(), None);

        hook.apply().unwrap();
        let trampoline = hook.original().unwrap();
        assert_eq!(
            store.read_bytes(FROB, 14).unwrap(),
            x64::jmp_abs(DETOUR).to_vec()
        );
        assert_eq!(store.read_bytes(trampoline, 15).unwrap(), PROLOGUE);
        assert_eq!(
            store.read_bytes(trampoline + 15, 14).unwrap(),
            x64::jmp_abs(FROB + 15).to_vec()
        );

        hook.remove().unwrap();
        assert_eq!(store.read_bytes(FROB, 15).unwrap(), PROLOGUE);
    }
}
