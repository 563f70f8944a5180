//! Secrets at rest: the authenticated envelope and gateway token generation.
//!
//! Every secret the system persists (deployment intents, provisioning
//! credentials, gateway tokens) goes through [`Cipher`], which produces a
//! self-describing envelope string:
//!
//! ```text
//! v1.<iv_b64url>.<tag_b64url>.<ciphertext_b64url>
//! ```
//!
//! The scheme is AES-256-GCM with a fresh 96-bit IV per call and the 128-bit
//! authentication tag carried as its own field. The key is derived once from
//! a caller-provided passphrase with scrypt over a fixed application salt.
//! Decryption fails closed: a wrong version tag, field count, field length,
//! or authentication tag all surface as [`CipherError::Decrypt`].

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use scrypt::{Params, scrypt};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;

/// Version tag prefixing every envelope this crate produces.
const ENVELOPE_VERSION: &str = "v1";

/// Fixed application salt for scrypt key derivation. Changing this
/// invalidates every envelope at rest.
const KDF_SALT: &[u8] = b"clawctl.envelope.v1";

/// Minimum accepted passphrase length in bytes.
const MIN_PASSPHRASE_BYTES: usize = 16;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("encryption passphrase must be at least {MIN_PASSPHRASE_BYTES} bytes")]
    PassphraseTooShort,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("failed to serialize value for encryption: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("stored payload cannot be decrypted")]
    Decrypt,
}

/// Process-wide envelope cipher. Cheap to clone; the derived key is shared.
#[derive(Clone)]
pub struct Cipher {
    key: Arc<[u8; 32]>,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Derive the envelope key from a passphrase. Rejects passphrases
    /// shorter than 16 bytes.
    pub fn new(passphrase: &str) -> Result<Self, CipherError> {
        if passphrase.len() < MIN_PASSPHRASE_BYTES {
            return Err(CipherError::PassphraseTooShort);
        }

        // scrypt N=2^15, r=8, p=1: interactive-grade cost, derived once per process.
        let params = Params::new(15, 8, 1, 32).map_err(|_| CipherError::KeyDerivation)?;
        let mut key = [0u8; 32];
        scrypt(passphrase.as_bytes(), KDF_SALT, &params, &mut key).map_err(|_| CipherError::KeyDerivation)?;

        Ok(Self { key: Arc::new(key) })
    }

    /// Encrypt any serializable value into an envelope string.
    pub fn encrypt<T: Serialize>(&self, value: &T) -> Result<String, CipherError> {
        let plaintext = serde_json::to_vec(value).map_err(CipherError::Serialize)?;

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()));
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| CipherError::Decrypt)?;

        // aes-gcm appends the tag to the ciphertext; the envelope carries it
        // as a separate field.
        let (ct, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(format!(
            "{ENVELOPE_VERSION}.{}.{}.{}",
            URL_SAFE_NO_PAD.encode(iv),
            URL_SAFE_NO_PAD.encode(tag),
            URL_SAFE_NO_PAD.encode(ct),
        ))
    }

    /// Decrypt an envelope back into a value. Fails closed on any mismatch.
    pub fn decrypt<T: DeserializeOwned>(&self, envelope: &str) -> Result<T, CipherError> {
        let mut fields = envelope.split('.');
        let version = fields.next().ok_or(CipherError::Decrypt)?;
        if version != ENVELOPE_VERSION {
            return Err(CipherError::Decrypt);
        }

        let iv = URL_SAFE_NO_PAD
            .decode(fields.next().ok_or(CipherError::Decrypt)?)
            .map_err(|_| CipherError::Decrypt)?;
        let tag = URL_SAFE_NO_PAD
            .decode(fields.next().ok_or(CipherError::Decrypt)?)
            .map_err(|_| CipherError::Decrypt)?;
        let ct = URL_SAFE_NO_PAD
            .decode(fields.next().ok_or(CipherError::Decrypt)?)
            .map_err(|_| CipherError::Decrypt)?;

        if fields.next().is_some() || iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(CipherError::Decrypt);
        }

        let mut sealed = ct;
        sealed.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &sealed,
                    aad: &[],
                },
            )
            .map_err(|_| CipherError::Decrypt)?;

        serde_json::from_slice(&plaintext).map_err(|_| CipherError::Decrypt)
    }
}

/// Generate a random 32-byte gateway token, base64url encoded.
pub fn generate_gateway_token() -> String {
    let mut token_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut token_bytes);
    URL_SAFE_NO_PAD.encode(token_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cipher() -> Cipher {
        Cipher::new("correct horse battery staple").unwrap()
    }

    #[test]
    fn test_round_trip() {
        let c = cipher();
        let value = json!({"name": "claw-1", "channels": ["general", "ops"], "n": 42});
        let envelope = c.encrypt(&value).unwrap();
        assert!(envelope.starts_with("v1."));
        assert_eq!(envelope.split('.').count(), 4);

        let decrypted: serde_json::Value = c.decrypt(&envelope).unwrap();
        assert_eq!(decrypted, value);
    }

    #[test]
    fn test_rejects_short_passphrase() {
        assert!(matches!(Cipher::new("too short"), Err(CipherError::PassphraseTooShort)));
        // Exactly 16 bytes is accepted
        assert!(Cipher::new("0123456789abcdef").is_ok());
    }

    #[test]
    fn test_distinct_ivs_per_call() {
        let c = cipher();
        let a = c.encrypt(&json!("same value")).unwrap();
        let b = c.encrypt(&json!("same value")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = Cipher::new("passphrase number one").unwrap();
        let b = Cipher::new("passphrase number two").unwrap();
        let envelope = a.encrypt(&json!({"secret": true})).unwrap();
        assert!(matches!(b.decrypt::<serde_json::Value>(&envelope), Err(CipherError::Decrypt)));
    }

    #[test]
    fn test_single_byte_mutation_fails() {
        let c = cipher();
        let envelope = c.encrypt(&json!({"k": "v"})).unwrap();

        // Flip one character in every position of the envelope; decryption
        // must never succeed with the original value.
        let bytes = envelope.as_bytes();
        for i in 0..bytes.len() {
            let mut mutated = bytes.to_vec();
            mutated[i] = if mutated[i] == b'A' { b'B' } else { b'A' };
            let Ok(mutated) = String::from_utf8(mutated) else {
                continue;
            };
            if mutated == envelope {
                continue;
            }
            assert!(
                c.decrypt::<serde_json::Value>(&mutated).is_err(),
                "mutation at byte {i} was accepted"
            );
        }
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        let c = cipher();
        for bad in [
            "",
            "v1",
            "v1..",
            "v2.AAAA.AAAA.AAAA",
            "v1.AAAA.AAAA",             // too few fields
            "v1.AAAA.AAAA.AAAA.AAAA",   // too many fields
            "v1.!!!.AAAA.AAAA",         // invalid base64
        ] {
            assert!(c.decrypt::<serde_json::Value>(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_gateway_token_length_and_charset() {
        let token = generate_gateway_token();
        // 32 bytes -> 43 base64url chars, no padding
        assert_eq!(token.len(), 43);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(!token.contains('='));
    }
}
