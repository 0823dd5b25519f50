//! Session cryptography: ephemeral X25519 key agreement, Keccak-256 key
//! derivation, and the XChaCha20-Poly1305 cipher suite used for string
//! payload fields.
//!
//! Key material hygiene: ephemeral secrets and shared secrets are owned by
//! dalek types that zeroize on drop; the derived session key travels inside
//! `Zeroizing` so it is wiped wherever it ends up.

use crate::error::{constants, ProtocolError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};
use sha3::{Digest, Keccak256};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};
use zeroize::Zeroizing;

/// Length of the derived symmetric session key.
pub const SESSION_KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length.
const NONCE_LEN: usize = 24;

/// A 32-byte symmetric key, wiped on drop.
pub type SessionKey = Zeroizing<[u8; SESSION_KEY_LEN]>;

/// Generate an ephemeral keypair. The secret is single-use: it is consumed
/// by [`agree`] and zeroized by the dalek type on drop.
pub fn generate_keypair() -> (EphemeralSecret, [u8; 32]) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret).to_bytes();
    (secret, public)
}

/// X25519 key agreement. Fails when the peer key is a low-order point that
/// contributes nothing to the shared secret.
pub fn agree(secret: EphemeralSecret, peer_public: &[u8; 32]) -> Result<SharedSecret> {
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    if !shared.was_contributory() {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_WEAK_SHARED_SECRET,
        ));
    }
    Ok(shared)
}

/// Derive the session key: `Keccak256(shared)`.
pub fn derive_session_key(shared: &SharedSecret) -> SessionKey {
    let digest = Keccak256::digest(shared.as_bytes());
    let mut key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
    key.copy_from_slice(&digest);
    key
}

/// Authenticated cipher over a session key. String fields travel as
/// Base64(`nonce || ciphertext`) when a frame carries the `ENCRYPTED` flag.
pub struct CipherSuite {
    cipher: XChaCha20Poly1305,
}

impl CipherSuite {
    pub fn new(key: &[u8; SESSION_KEY_LEN]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt a string field into its wire representation.
    pub fn seal_str(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| ProtocolError::EncryptionFailure)?;
        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(framed))
    }

    /// Decrypt a wire-framed string field back to plaintext.
    pub fn open_str(&self, wrapped: &str) -> Result<String> {
        let framed = BASE64
            .decode(wrapped)
            .map_err(|_| ProtocolError::DecryptionFailure)?;
        if framed.len() < NONCE_LEN {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(XNonce::from_slice(nonce), ciphertext)
                .map_err(|_| ProtocolError::DecryptionFailure)?,
        );
        String::from_utf8(plaintext.to_vec()).map_err(|_| ProtocolError::DecryptionFailure)
    }
}
