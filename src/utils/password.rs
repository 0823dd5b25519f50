//! Password hashing: PBKDF2-HMAC-SHA256 with a random 64-byte salt and a
//! 64-byte derived hash. Verification is constant-time, and a sink variant
//! performs an equal-cost derivation so unknown-user lookups are not
//! distinguishable by timing.

use pbkdf2::pbkdf2_hmac;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Salt width in bytes.
pub const SALT_LEN: usize = 64;

/// Derived hash width in bytes.
pub const HASH_LEN: usize = 64;

/// Fixed salt fed to [`verify_sink`]. Never stored; only burns cycles.
const SINK_SALT: [u8; SALT_LEN] = [0x5A; SALT_LEN];

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a hash from a password and salt. The result is wiped on drop;
/// callers that persist it copy out explicitly.
pub fn derive(password: &str, salt: &[u8], rounds: u32) -> Zeroizing<[u8; HASH_LEN]> {
    let mut out = Zeroizing::new([0u8; HASH_LEN]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut out[..]);
    out
}

/// Hash a fresh password: random salt plus derived hash, both caller-owned.
pub fn hash(password: &str, rounds: u32) -> ([u8; SALT_LEN], [u8; HASH_LEN]) {
    let salt = generate_salt();
    let derived = derive(password, &salt, rounds);
    (salt, *derived)
}

/// Constant-time verification against a stored salt and hash.
pub fn verify(password: &str, salt: &[u8], expected: &[u8], rounds: u32) -> bool {
    let derived = derive(password, salt, rounds);
    derived[..].ct_eq(expected).into()
}

/// Equal-cost derivation against a dummy salt. Called on the unknown-user
/// path so its latency matches a real verification.
pub fn verify_sink(password: &str, rounds: u32) {
    let _ = derive(password, &SINK_SALT, rounds);
}
