#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod code;
pub mod error;
pub mod hook;
pub mod image;
pub mod patch;
pub mod space;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{AccessFault, Error, Result};
pub use hook::{Detour, ExportRedirect, Hook, HookId, HookOptions, HookRegistry};
pub use patch::{Patch, PatchKind, PatchState, PatchTarget};
pub use space::{Address, AddressSpace, Module};
pub use store::ByteStore;
