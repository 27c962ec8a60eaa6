//! # Code
//!
//! Jump encoding and prologue relocation for inline patches.
//!
//! An inline patch overwrites the first instructions of a function with a jump. The
//! instructions it displaces are re-encoded elsewhere (the trampoline) and followed by a jump
//! back to the first untouched instruction, which makes the trampoline behave like the
//! unpatched function.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};

use crate::error::{Error, Result};
use crate::image::PeKind;
use crate::space::Address;

pub mod x64;
pub mod x86;

/// Longest instruction either architecture can encode
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// `int3`, used to pad displaced bytes after the patch jump
const INT3: u8 = 0xcc;

/// Instruction set of the code being patched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// 32-bit x86
    X86,
    /// x86-64
    X64,
}

impl From<PeKind> for Architecture {
    fn from(kind: PeKind) -> Self {
        match kind {
            PeKind::Pe32 => Self::X86,
            PeKind::Pe32Plus => Self::X64,
        }
    }
}

impl Architecture {
    /// Decoder/encoder bitness
    pub fn bitness(self) -> u32 {
        match self {
            Self::X86 => 32,
            Self::X64 => 64,
        }
    }

    /// Length of the jump emitted by [`Architecture::jump`]
    pub fn jump_len(self) -> usize {
        match self {
            Self::X86 => x86::JMP_REL_LEN,
            Self::X64 => x64::JMP_ABS_LEN,
        }
    }

    /// Encodes a jump placed at `from` that lands on `to`
    pub fn jump(self, from: Address, to: Address) -> Result<Vec<u8>> {
        match self {
            Self::X86 => {
                let narrow = |a: Address| {
                    u32::try_from(a).map_err(|_| Error::out_of_range("32-bit address", a))
                };
                Ok(x86::jmp_rel(narrow(from)?, narrow(to)?).to_vec())
            }
            Self::X64 => Ok(x64::jmp_abs(to).to_vec()),
        }
    }

    /// Bytes written over a function entry: a jump to `to`, padded to `len` with `int3`
    pub fn patch_bytes(self, from: Address, to: Address, len: usize) -> Result<Vec<u8>> {
        let mut code = self.jump(from, to)?;
        if code.len() > len {
            return Err(Error::out_of_range("patch length", len as u64));
        }
        code.resize(len, INT3);
        Ok(code)
    }
}

/// Displaced instructions re-encoded for a new location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocated {
    /// Number of bytes taken from the source, always whole instructions
    pub displaced: usize,
    /// Trampoline code: the displaced instructions followed by a jump back
    pub code: Vec<u8>,
}

/// Re-encodes the instructions at the start of `code` for execution at `destination`
///
/// `code` holds the bytes at `source`. Instructions are taken until at least `min_len` bytes
/// are covered, so `code` should extend [`MAX_INSTRUCTION_LEN`]` - 1` bytes past `min_len`.
/// Relative branches and RIP-relative operands are fixed up by the block encoder, which fails
/// with [`Error::Disassembly`] if a target is out of reach from `destination`.
///
/// Fails with [`Error::UnsupportedCode`] if the covered range contains an invalid instruction,
/// or if control leaves the function (return, jump, trap) before `min_len` bytes are covered,
/// since whatever follows may be a branch target of its own.
pub fn relocate(
    arch: Architecture,
    source: Address,
    code: &[u8],
    min_len: usize,
    destination: Address,
) -> Result<Relocated> {
    let mut decoder = Decoder::with_ip(arch.bitness(), code, source, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut displaced = 0;
    let mut instruction = Instruction::default();

    while displaced < min_len {
        if !decoder.can_decode() {
            return Err(Error::UnsupportedCode {
                address: source,
                reason: "not enough code to decode",
            });
        }
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            return Err(Error::UnsupportedCode {
                address: instruction.ip(),
                reason: "invalid instruction",
            });
        }
        displaced += instruction.len();
        instructions.push(instruction);

        let leaves = matches!(
            instruction.flow_control(),
            FlowControl::Return
                | FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::Interrupt
                | FlowControl::Exception
        );
        if leaves && displaced < min_len {
            return Err(Error::UnsupportedCode {
                address: source,
                reason: "function is shorter than the patch",
            });
        }
    }

    let block = InstructionBlock::new(&instructions, destination);
    let encoded = BlockEncoder::encode(arch.bitness(), block, BlockEncoderOptions::NONE)?;
    let mut code = encoded.code_buffer;

    let back = destination + code.len() as u64;
    code.extend(arch.jump(back, source + displaced as u64)?);

    Ok(Relocated { displaced, code })
}
