//! A set of hooks addressed by handle.
//! - Doesn't allow/require choosing ids on install, just gives you one.
//! - Ids are never reused, so a stale id finds nothing instead of another hook.

use crate::error::{Error, Result};
use crate::patch::PatchState;
use crate::space::AddressSpace;

use super::{Detour, Hook, HookOptions};

/// Handle of a hook inside a [`HookRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u32);

/// Owning context for many hooks
///
/// Dropping the registry drops every hook it still holds, which restores their patches.
#[derive(Default)]
pub struct HookRegistry<'a> {
    /// Slot per id handed out; taken hooks leave `None` behind
    hooks: Vec<Option<Hook<'a>>>,
}

impl<'a> HookRegistry<'a> {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Adds an already installed hook
    pub fn insert(&mut self, hook: Hook<'a>) -> HookId {
        self.hooks.push(Some(hook));
        HookId(self.hooks.len() as u32 - 1)
    }

    /// Installs a hook with default options; see [`Hook::install`]
    pub fn install<S: AddressSpace + ?Sized>(
        &mut self,
        space: &'a S,
        module: &str,
        function: &str,
        detour: Detour,
    ) -> Result<HookId> {
        Hook::install(space, module, function, detour).map(|hook| self.insert(hook))
    }

    /// Installs a hook; see [`Hook::install_with`]
    pub fn install_with<S: AddressSpace + ?Sized>(
        &mut self,
        space: &'a S,
        options: &HookOptions,
        module: &str,
        function: &str,
        detour: Detour,
    ) -> Result<HookId> {
        Hook::install_with(space, options, module, function, detour).map(|hook| self.insert(hook))
    }

    /// The hook `id`, unless it was taken
    pub fn get(&self, id: HookId) -> Option<&Hook<'a>> {
        self.hooks.get(id.0 as usize)?.as_ref()
    }

    /// Mutable access to the hook `id`, unless it was taken
    pub fn get_mut(&mut self, id: HookId) -> Option<&mut Hook<'a>> {
        self.hooks.get_mut(id.0 as usize)?.as_mut()
    }

    /// Removes a hook from the registry without restoring it
    pub fn take(&mut self, id: HookId) -> Option<Hook<'a>> {
        self.hooks.get_mut(id.0 as usize)?.take()
    }

    /// Applies the hook `id`; see [`Hook::apply`]
    pub fn apply(&mut self, id: HookId) -> Result<()> {
        self.expect_hook(id)?.apply()
    }

    /// Removes the hook `id`; see [`Hook::remove`]
    pub fn remove(&mut self, id: HookId) -> Result<()> {
        self.expect_hook(id)?.remove()
    }

    /// Applies every unapplied hook, stopping at the first failure
    pub fn apply_all(&mut self) -> Result<()> {
        for hook in self.hooks.iter_mut().flatten() {
            if hook.state() == PatchState::Unapplied {
                hook.apply()?;
            }
        }
        Ok(())
    }

    /// Ids of every hook still held
    pub fn ids(&self) -> impl Iterator<Item = HookId> + '_ {
        self.hooks
            .iter()
            .enumerate()
            .filter(|(_, hook)| hook.is_some())
            .map(|(i, _)| HookId(i as u32))
    }

    /// Number of hooks still held
    pub fn len(&self) -> usize {
        self.hooks.iter().flatten().count()
    }

    /// True if no hook is held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The hook `id`, or [`Error::NotFound`]
    fn expect_hook(&mut self, id: HookId) -> Result<&mut Hook<'a>> {
        self.get_mut(id)
            .ok_or_else(|| Error::not_found(format!("hook {}", id.0)))
    }
}

#[cfg(test)]
mod tests {
    use crate::hook::tests::{process, DETOUR, FROB, TARGET};
    use crate::image::{ExportDir, ImageView};

    use super::*;

    /// RVA currently exported for `name` by the target module
    fn exported(space: &crate::space::BufferSpace, name: &str) -> Option<u32> {
        ExportDir::new(ImageView::mapped(space, TARGET))
            .unwrap()
            .unwrap()
            .find_by_name(name)
            .unwrap()?
            .rva()
    }

    #[test]
    fn test_registry() {
        let space = process();
        let mut registry = HookRegistry::new();
        let id = registry
            .install(&space, "target.dll", "Frob", Detour::new(DETOUR))
            .unwrap();
        let fwd = registry
            .install(&space, "target.dll", "Fwd", Detour::new(DETOUR))
            .unwrap();
        assert_ne!(id, fwd);
        assert_eq!(registry.len(), 2);
        assert!(registry
            .install(&space, "target.dll", "Missing", Detour::new(DETOUR))
            .is_err());
        assert_eq!(registry.len(), 2);

        registry.apply(id).unwrap();
        assert_eq!(registry.get(id).unwrap().state(), PatchState::Applied);
        assert_eq!(registry.get(id).unwrap().original(), Some(FROB));
        assert_eq!(exported(&space, "Frob"), Some((DETOUR - TARGET) as u32));

        registry.remove(id).unwrap();
        assert_eq!(exported(&space, "Frob"), Some(0x1000));

        let hook = registry.take(fwd).unwrap();
        assert_eq!(hook.function(), "Fwd");
        assert!(registry.get(fwd).is_none());
        assert!(matches!(registry.apply(fwd), Err(Error::NotFound(_))));
        assert_eq!(registry.ids().collect::<Vec<_>>(), [id]);
    }

    #[test]
    /// Dropping the registry restores every applied hook
    fn test_drop() {
        let space = process();
        {
            let mut registry = HookRegistry::new();
            registry
                .install(&space, "target.dll", "Frob", Detour::new(DETOUR))
                .unwrap();
            registry.apply_all().unwrap();
            assert_eq!(exported(&space, "Frob"), Some((DETOUR - TARGET) as u32));
        }
        assert_eq!(exported(&space, "Frob"), Some(0x1000));
    }
}
