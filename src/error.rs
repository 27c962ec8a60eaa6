//! # Error
//!
//! Errors shared by every layer of the crate

use iced_x86::IcedError;
use thiserror::Error;

use crate::alloc::AllocError;
use crate::patch::PatchTarget;
use crate::space::Address;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons an [`AddressSpace`](crate::space::AddressSpace) access can fail
#[derive(Debug, Error)]
pub enum AccessFault {
    /// No region is mapped at (part of) the requested range
    #[error("address range is not mapped")]
    Unmapped,
    /// The range is mapped but may not be written
    #[error("address range is not writable")]
    NotWritable,
    /// The range is mapped but may not be read
    #[error("address range is not readable")]
    NotReadable,
    /// The address space cannot perform this kind of operation
    #[error("operation is not supported by this address space")]
    Unsupported,
    /// Error while querying or changing page protection
    #[error("{0}")]
    Protection(#[from] region::Error),
    /// Error while allocating executable memory
    #[error("{0}")]
    Alloc(#[from] AllocError),
    /// Error while reading an image from disk
    #[error("{0}")]
    File(#[from] std::io::Error),
}

/// Errors returned by memory, image and hook operations
#[derive(Debug, Error)]
pub enum Error {
    /// A header magic value did not match
    #[error("invalid {header} signature at {address:#x} (found {found:#x})")]
    InvalidSignature {
        /// Header that was being validated
        header: &'static str,
        /// Address of the signature
        address: Address,
        /// Value that was actually found
        found: u32,
    },
    /// An index, offset or RVA fell outside the structure it addresses
    #[error("{what} {value:#x} is out of range")]
    OutOfRange {
        /// What was being indexed
        what: &'static str,
        /// The offending value
        value: u64,
    },
    /// The write went through but reading it back produced different bytes
    #[error("write of {len} bytes at {address:#x} did not stick")]
    VerificationMismatch {
        /// Start of the write
        address: Address,
        /// Length of the write
        len: usize,
    },
    /// The underlying read or write call failed
    #[error("memory access of {len} bytes at {address:#x} failed: {source}")]
    Io {
        /// Start of the access
        address: Address,
        /// Length of the access
        len: usize,
        /// Why the access failed
        source: AccessFault,
    },
    /// A forwarded export string is not of the form `Module.Function`
    #[error("invalid export forwarder {0:?}")]
    InvalidForwarder(String),
    /// A named module, function or directory does not exist
    #[error("{0} not found")]
    NotFound(String),
    /// The operation is not valid in the object's current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Error while decoding or re-encoding displaced instructions
    #[error("{0}")]
    Disassembly(#[from] IcedError),
    /// Code at a patch site cannot be relocated into a trampoline
    #[error("cannot patch code at {address:#x}: {reason}")]
    UnsupportedCode {
        /// Address of the code
        address: Address,
        /// Why it cannot be patched
        reason: &'static str,
    },
    /// Some patches of a hook could not be restored
    #[error("{} of {total} patches failed to restore", .failures.len())]
    PartialRemoval {
        /// Number of patches that removal was attempted on
        total: usize,
        /// Every patch that failed, with its error
        failures: Vec<(PatchTarget, Error)>,
    },
}

impl Error {
    /// Builds an [`Error::Io`]
    pub(crate) fn io(address: Address, len: usize, source: impl Into<AccessFault>) -> Self {
        Self::Io {
            address,
            len,
            source: source.into(),
        }
    }

    /// Builds an [`Error::OutOfRange`]
    pub(crate) fn out_of_range(what: &'static str, value: impl Into<u64>) -> Self {
        Self::OutOfRange {
            what,
            value: value.into(),
        }
    }

    /// Builds an [`Error::NotFound`]
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
