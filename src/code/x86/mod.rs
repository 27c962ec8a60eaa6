/// Length of [`jmp_rel`]
pub const JMP_REL_LEN: usize = 5;

/// Generates a relative jump from `from` to `to` and returns bytecode
///
/// 32-bit code wraps around the address space, so every target is reachable.
pub fn jmp_rel(from: u32, to: u32) -> [u8; JMP_REL_LEN] {
    let displacement = to.wrapping_sub(from.wrapping_add(JMP_REL_LEN as u32));
    let mut code = [0xe9, 0, 0, 0, 0];
    code[1..].copy_from_slice(&displacement.to_le_bytes());
    code
}
