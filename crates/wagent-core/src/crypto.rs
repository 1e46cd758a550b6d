//! Sealing of per-tenant WAHA API keys.
//!
//! AES-256-GCM with a fresh 12-byte nonce per encryption.
//! Storage format: "aes:" + base64(nonce || ciphertext || tag).
//! The cipher key is SHA-256 of the process-wide encryption key, so any
//! configured string of sufficient length yields a valid 32-byte key.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::{Result, WagentError};

/// Prefix marking an AES-256-GCM sealed value.
const AES_PREFIX: &str = "aes:";

/// Sealing context derived once at startup from `encryption_key`.
///
/// Tenant credentials are decrypted on demand and never cached beyond
/// the request that needed them.
#[derive(Clone)]
pub struct KeySealer {
    key: [u8; 32],
}

impl KeySealer {
    /// Build a sealer from the configured encryption key.
    ///
    /// The key must be at least 32 characters (also enforced by config
    /// validation).
    pub fn new(encryption_key: &str) -> Result<Self> {
        if encryption_key.len() < 32 {
            return Err(WagentError::Crypto(
                "encryption key must be at least 32 characters".to_string(),
            ));
        }
        let digest = Sha256::digest(encryption_key.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Ok(Self { key })
    }

    /// Seal a plaintext credential. Returns "aes:" + base64(nonce || ciphertext+tag).
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| WagentError::Crypto("invalid key length".to_string()))?;

        let mut nonce_bytes = [0u8; 12];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| WagentError::Crypto("encryption failed".to_string()))?;

        // Pack: nonce (12) || ciphertext+tag
        let mut packed = Vec::with_capacity(12 + ciphertext.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&ciphertext);

        let encoded = base64::engine::general_purpose::STANDARD.encode(&packed);
        Ok(format!("{}{}", AES_PREFIX, encoded))
    }

    /// Open a sealed credential. Input must carry the "aes:" prefix.
    pub fn open(&self, sealed: &str) -> Result<String> {
        let payload = sealed.strip_prefix(AES_PREFIX).ok_or_else(|| {
            WagentError::Crypto("sealed value missing aes: prefix".to_string())
        })?;

        let packed = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| WagentError::Crypto(format!("invalid base64: {}", e)))?;

        // Minimum: 12-byte nonce + 16-byte tag (empty plaintext)
        if packed.len() < 12 + 16 {
            return Err(WagentError::Crypto("ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = packed.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| WagentError::Crypto("invalid key length".to_string()))?;

        let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| {
            WagentError::Crypto("decryption failed: wrong key or corrupted data".to_string())
        })?;

        String::from_utf8(plaintext)
            .map_err(|_| WagentError::Crypto("plaintext is not valid UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> KeySealer {
        KeySealer::new("0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn seal_open_roundtrip() {
        let s = sealer();
        let sealed = s.seal("waha-api-key-abc123").unwrap();
        assert!(sealed.starts_with("aes:"));
        assert_eq!(s.open(&sealed).unwrap(), "waha-api-key-abc123");
    }

    #[test]
    fn each_seal_differs() {
        let s = sealer();
        let a = s.seal("same-input").unwrap();
        let b = s.seal("same-input").unwrap();
        // Random nonce means different ciphertext each time
        assert_ne!(a, b);
        assert_eq!(s.open(&a).unwrap(), s.open(&b).unwrap());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = sealer().seal("secret").unwrap();
        let other = KeySealer::new("ffffffffffffffffffffffffffffffff").unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let s = sealer();
        let sealed = s.seal("secret").unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&sealed["aes:".len()..])
            .unwrap();
        *raw.last_mut().unwrap() ^= 0xFF;
        let tampered = format!(
            "aes:{}",
            base64::engine::general_purpose::STANDARD.encode(&raw)
        );
        assert!(s.open(&tampered).is_err());
    }

    #[test]
    fn short_key_rejected() {
        assert!(KeySealer::new("short").is_err());
    }

    #[test]
    fn missing_prefix_rejected() {
        assert!(sealer().open("bm8tcHJlZml4").is_err());
    }
}
