//! # Store
//!
//! Typed, verified access on top of an [`AddressSpace`]

use std::fmt::Debug;

use crate::error::{Error, Result};
use crate::space::{Address, AddressSpace};

/// Longest string [`ByteStore::read_cstring`] will scan for a terminator
pub const MAX_STRING_LEN: usize = 0x1000;

/// Bytes fetched per read while scanning for a string terminator
const STRING_CHUNK: usize = 0x40;

/// Fixed-size plain values that can be copied to and from little-endian bytes
pub trait Scalar: Copy + PartialEq + Debug {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Decodes a value from exactly [`Scalar::SIZE`] bytes
    fn from_bytes(bytes: &[u8]) -> Self;

    /// Encodes the value into exactly [`Scalar::SIZE`] bytes
    fn to_bytes(&self, out: &mut [u8]);
}

/// Implements [`Scalar`] for primitive integers
macro_rules! scalar_int {
    ($($ty:ty),*) => {
        $(
            impl Scalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_bytes(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }

                fn to_bytes(&self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

scalar_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl<const N: usize> Scalar for [u8; N] {
    const SIZE: usize = N;

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; N];
        raw.copy_from_slice(bytes);
        raw
    }

    fn to_bytes(&self, out: &mut [u8]) {
        out.copy_from_slice(self);
    }
}

impl<const N: usize> Scalar for [u16; N] {
    const SIZE: usize = N * 2;

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u16; N];
        for (value, chunk) in raw.iter_mut().zip(bytes.chunks_exact(2)) {
            *value = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
        raw
    }

    fn to_bytes(&self, out: &mut [u8]) {
        for (value, chunk) in self.iter().zip(out.chunks_exact_mut(2)) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Width of a pointer in the target image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerWidth {
    /// 32-bit pointers (PE32)
    U32,
    /// 64-bit pointers (PE32+)
    U64,
}

impl PointerWidth {
    /// Pointer size in bytes
    pub fn size(self) -> usize {
        match self {
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }

    /// Bit marking an import lookup entry as an ordinal
    pub fn ordinal_flag(self) -> u64 {
        match self {
            Self::U32 => 1 << 31,
            Self::U64 => 1 << 63,
        }
    }
}

/// Typed reads and verified writes over an [`AddressSpace`]
///
/// Nothing is cached: every call goes to the address space. Writes are read back immediately
/// and fail with [`Error::VerificationMismatch`] if the bytes did not stick, which keeps a
/// failed write ([`Error::Io`]) distinguishable from a write the target silently lost.
pub struct ByteStore<'a, S: AddressSpace + ?Sized> {
    /// Backing address space
    space: &'a S,
}

impl<'a, S: AddressSpace + ?Sized> Clone for ByteStore<'a, S> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'a, S: AddressSpace + ?Sized> Copy for ByteStore<'a, S> {}

impl<'a, S: AddressSpace + ?Sized> ByteStore<'a, S> {
    /// Wraps an address space
    pub fn new(space: &'a S) -> Self {
        Self { space }
    }

    /// The wrapped address space
    pub fn space(&self) -> &'a S {
        self.space
    }

    /// Reads a value of type `T`
    pub fn read<T: Scalar>(&self, address: Address) -> Result<T> {
        let mut buf = vec![0u8; T::SIZE];
        self.space.read_bytes(address, &mut buf)?;
        Ok(T::from_bytes(&buf))
    }

    /// Writes a value of type `T` and verifies it by reading it back
    pub fn write<T: Scalar>(&self, address: Address, value: T) -> Result<()> {
        let mut buf = vec![0u8; T::SIZE];
        value.to_bytes(&mut buf);
        self.write_bytes(address, &buf)
    }

    /// Reads `len` raw bytes
    pub fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.space.read_bytes(address, &mut buf)?;
        Ok(buf)
    }

    /// Writes raw bytes and verifies them by reading them back
    pub fn write_bytes(&self, address: Address, data: &[u8]) -> Result<()> {
        self.space.write_bytes(address, data)?;
        let mut check = vec![0u8; data.len()];
        self.space.read_bytes(address, &mut check)?;
        if check != data {
            return Err(Error::VerificationMismatch {
                address,
                len: data.len(),
            });
        }
        Ok(())
    }

    /// Reads `count` consecutive values of type `T`
    pub fn read_vec<T: Scalar>(&self, address: Address, count: usize) -> Result<Vec<T>> {
        let buf = self.read_bytes(address, count * T::SIZE)?;
        Ok(buf.chunks_exact(T::SIZE).map(T::from_bytes).collect())
    }

    /// Reads a pointer of the given width, widened to 64 bits
    pub fn read_pointer(&self, address: Address, width: PointerWidth) -> Result<u64> {
        match width {
            PointerWidth::U32 => self.read::<u32>(address).map(u64::from),
            PointerWidth::U64 => self.read::<u64>(address),
        }
    }

    /// Writes a pointer of the given width
    ///
    /// Fails with [`Error::OutOfRange`] if `value` does not fit in a 32-bit pointer.
    pub fn write_pointer(&self, address: Address, width: PointerWidth, value: u64) -> Result<()> {
        match width {
            PointerWidth::U32 => {
                let value =
                    u32::try_from(value).map_err(|_| Error::out_of_range("32-bit pointer", value))?;
                self.write::<u32>(address, value)
            }
            PointerWidth::U64 => self.write::<u64>(address, value),
        }
    }

    /// Reads a NUL-terminated string of at most [`MAX_STRING_LEN`] bytes
    ///
    /// Bytes are fetched in chunks; a chunk that cannot be read as a whole (e.g. because the
    /// string ends right before an unmapped page) is retried byte by byte. Invalid UTF-8 is
    /// replaced lossily.
    pub fn read_cstring(&self, address: Address) -> Result<String> {
        let mut bytes = Vec::new();
        while bytes.len() < MAX_STRING_LEN {
            let at = address + bytes.len() as u64;
            let chunk = match self.read_bytes(at, STRING_CHUNK) {
                Ok(chunk) => chunk,
                Err(_) => vec![self.read::<u8>(at)?],
            };
            if let Some(end) = chunk.iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..end]);
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.extend_from_slice(&chunk);
        }
        Err(Error::out_of_range("string length", MAX_STRING_LEN as u64))
    }

    /// Writes `value` followed by a NUL terminator
    pub fn write_cstring(&self, address: Address, value: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.write_bytes(address, &bytes)
    }
}
