// =============================================================================
// KeyVault — symmetric authenticated encryption for exchange credentials
// =============================================================================
//
// Uses AES-256-GCM, the same RustCrypto family already pulled in for
// request signing (`hmac`, `sha2`). Ciphertext is self-describing:
//
//   byte 0       — format version (currently 1)
//   bytes 1..13  — 96-bit GCM nonce
//   bytes 13..   — ciphertext || 16-byte authentication tag
//
// `decrypt` never panics on malformed input: it logs a single warning and
// returns an empty string, matching spec §4.8.
// =============================================================================

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use rand::RngCore;
use tracing::warn;

const FORMAT_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;

/// Symmetric credential vault bound to a single 256-bit key for the life of
/// the process.
pub struct KeyVault {
    cipher: Aes256Gcm,
}

impl KeyVault {
    /// Build a vault from a raw 32-byte key. Callers typically derive this
    /// from an environment variable at start-up.
    pub fn new(key_bytes: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Self { cipher: Aes256Gcm::new(key) }
    }

    /// Encrypt `plaintext`, returning a base64-encoded, self-describing
    /// ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // AES-256-GCM encryption only fails on absurd (>~64 GiB) plaintexts;
        // credential strings never approach that, so a failure here is a
        // programming error, not a runtime condition to propagate.
        let ct = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .expect("AES-256-GCM encryption of a short credential string cannot fail");

        let mut out = Vec::with_capacity(1 + NONCE_LEN + ct.len());
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ct);

        base64::engine::general_purpose::STANDARD.encode(out)
    }

    /// Decrypt a ciphertext produced by `encrypt`. Returns an empty string
    /// on any malformed input or authentication failure — this method is
    /// designed never to crash the caller.
    pub fn decrypt(&self, ciphertext_b64: &str) -> String {
        match self.try_decrypt(ciphertext_b64) {
            Ok(plaintext) => plaintext,
            Err(reason) => {
                warn!(reason, "KeyVault decrypt failed — returning empty string");
                String::new()
            }
        }
    }

    fn try_decrypt(&self, ciphertext_b64: &str) -> Result<String, &'static str> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(ciphertext_b64)
            .map_err(|_| "invalid base64")?;

        if raw.len() < 1 + NONCE_LEN {
            return Err("ciphertext too short");
        }
        if raw[0] != FORMAT_VERSION {
            return Err("unsupported format version");
        }

        let nonce = Nonce::from_slice(&raw[1..1 + NONCE_LEN]);
        let body = &raw[1 + NONCE_LEN..];

        let plaintext = self
            .cipher
            .decrypt(nonce, body)
            .map_err(|_| "decryption/authentication failed")?;

        String::from_utf8(plaintext).map_err(|_| "decrypted payload is not valid UTF-8")
    }

    /// Mask a plaintext credential for display: keep the format recognisable
    /// but reveal only the last 4 characters, matching the teacher's
    /// `"<redacted>"`-style `Debug` conventions elsewhere in the codebase.
    pub fn mask(plaintext: &str) -> String {
        if plaintext.len() <= 4 {
            return "****".to_string();
        }
        let tail = &plaintext[plaintext.len() - 4..];
        format!("{}{}", "*".repeat(plaintext.len() - 4), tail)
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault").field("cipher", &"<Aes256Gcm>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> KeyVault {
        KeyVault::new(&[7u8; 32])
    }

    #[test]
    fn round_trips() {
        let vault = test_vault();
        let ct = vault.encrypt("super-secret-api-key");
        assert_eq!(vault.decrypt(&ct), "super-secret-api-key");
    }

    #[test]
    fn two_encryptions_differ_by_nonce() {
        let vault = test_vault();
        let a = vault.encrypt("same-plaintext");
        let b = vault.encrypt("same-plaintext");
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_input_returns_empty_not_panic() {
        let vault = test_vault();
        assert_eq!(vault.decrypt("not-valid-base64!!"), "");
        assert_eq!(vault.decrypt(""), "");
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let vault = test_vault();
        let mut ct = vault.encrypt("secret").into_bytes();
        // Flip a byte well inside the base64 body.
        let idx = ct.len() / 2;
        ct[idx] ^= 0xFF;
        let tampered = String::from_utf8(ct).unwrap_or_default();
        assert_eq!(vault.decrypt(&tampered), "");
    }

    #[test]
    fn mask_reveals_only_last_four() {
        let masked = KeyVault::mask("abcdefgh1234");
        assert!(masked.ends_with("1234"));
        assert!(!masked.contains("abcdefgh"));
    }
}
