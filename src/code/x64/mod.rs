/// Length of [`jmp_abs`]
pub const JMP_ABS_LEN: usize = 14;

/// Generates an absolute jump to a specified address and returns bytecode
///
/// Encoded as `jmp [rip + 0]` followed by the 64-bit target, so it reaches any address and
/// clobbers no registers.
pub fn jmp_abs(target: u64) -> [u8; JMP_ABS_LEN] {
    let mut code = [0u8; JMP_ABS_LEN];
    code[..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code[6..].copy_from_slice(&target.to_le_bytes());
    code
}
