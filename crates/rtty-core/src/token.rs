//! Process-lifetime session token.
//!
//! One secret is generated at startup and authorizes every browser that
//! presents it. Comparison is constant-time over padded operands so that
//! neither the mismatch position nor the candidate's length shows up in
//! timing.

use rand::RngCore;

/// Token entropy in bytes (hex-encoded to twice this many characters).
pub const TOKEN_BYTES: usize = 32;

/// Generate a fresh random session token (64 lowercase hex chars).
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compare two byte strings in constant time.
///
/// Both operands are zero-padded to the longer length and every byte of
/// both padded buffers is visited, whatever the mismatch position.
pub fn safe_equal(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut padded_a = vec![0u8; len];
    let mut padded_b = vec![0u8; len];
    padded_a[..a.len()].copy_from_slice(a);
    padded_b[..b.len()].copy_from_slice(b);

    let mut diff = (a.len() ^ b.len()) as u64;
    for (x, y) in padded_a.iter().zip(padded_b.iter()) {
        diff |= u64::from(x ^ y);
    }
    std::hint::black_box(diff) == 0
}
