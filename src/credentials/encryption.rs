//! AES-256-GCM encryption for stored OAuth tokens.
//!
//! Each secret is sealed with its own random 16-byte IV and stored as
//! `hex(iv):hex(tag):hex(ciphertext)`. The 32-byte key is injected when the
//! codec is constructed; nothing here reads process state.

use super::EncryptedSecret;
use aes_gcm::{
    aead::{consts::U16, Aead, AeadCore, KeyInit, OsRng},
    aes::Aes256,
    AesGcm, Nonce,
};
use thiserror::Error;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the IV in bytes
const IV_SIZE: usize = 16;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Field separator inside an [`EncryptedSecret`]
const SEPARATOR: char = ':';

/// AES-256-GCM with a 128-bit nonce.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Key missing or not 32 bytes. Fatal at startup.
    #[error("Invalid encryption key: {0}")]
    Configuration(String),

    /// Payload is not `iv:tag:ciphertext` hex.
    #[error("Malformed encrypted secret: {0}")]
    Format(String),

    /// Tag did not verify (wrong key or tampered payload).
    #[error("Encrypted secret failed authentication")]
    Authentication,
}

/// Symmetric codec for credential secrets.
#[derive(Clone)]
pub struct SecretCodec {
    cipher: Aes256Gcm16,
}

impl SecretCodec {
    /// Builds a codec from raw key bytes.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm16::new(&key.into()),
        }
    }

    /// Builds a codec from a 64-character hex key.
    ///
    /// # Returns
    /// * `Ok(SecretCodec)` - Key decoded to exactly 32 bytes
    /// * `Err(CodecError::Configuration)` - Invalid hex or wrong length
    pub fn from_hex(key_hex: &str) -> Result<Self, CodecError> {
        let key_bytes = hex::decode(key_hex.trim())
            .map_err(|e| CodecError::Configuration(format!("key is not valid hex: {}", e)))?;

        let key: [u8; KEY_SIZE] = key_bytes.as_slice().try_into().map_err(|_| {
            CodecError::Configuration(format!(
                "key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key_bytes.len()
            ))
        })?;

        Ok(Self::new(key))
    }

    /// Encrypts plaintext with a fresh random IV.
    ///
    /// # Security
    /// - The IV is drawn from the OS RNG on every call (never reused)
    /// - Authenticated encryption (tampering detected on decrypt)
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, CodecError> {
        let iv = Aes256Gcm16::generate_nonce(&mut OsRng);

        // aes-gcm appends the tag to the ciphertext
        let sealed = self
            .cipher
            .encrypt(&iv, plaintext.as_bytes())
            .map_err(|_| CodecError::Format("plaintext too large to encrypt".to_string()))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

        Ok(EncryptedSecret::from_stored(format!(
            "{}{sep}{}{sep}{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ciphertext),
            sep = SEPARATOR
        )))
    }

    /// Decrypts a secret produced by [`SecretCodec::encrypt`].
    ///
    /// # Returns
    /// * `Ok(String)` - Authenticated plaintext
    /// * `Err(CodecError::Format)` - Not three hex fields, or bad IV/tag length
    /// * `Err(CodecError::Authentication)` - Wrong key or tampered payload
    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<String, CodecError> {
        let fields: Vec<&str> = secret.as_str().split(SEPARATOR).collect();
        if fields.len() != 3 {
            return Err(CodecError::Format(format!(
                "expected 3 fields, got {}",
                fields.len()
            )));
        }

        let iv = decode_field("iv", fields[0])?;
        let tag = decode_field("tag", fields[1])?;
        let ciphertext = decode_field("ciphertext", fields[2])?;

        if iv.len() != IV_SIZE {
            return Err(CodecError::Format(format!(
                "iv must be {} bytes, got {}",
                IV_SIZE,
                iv.len()
            )));
        }
        if tag.len() != TAG_SIZE {
            return Err(CodecError::Format(format!(
                "tag must be {} bytes, got {}",
                TAG_SIZE,
                tag.len()
            )));
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::<U16>::from_slice(&iv), sealed.as_ref())
            .map_err(|_| CodecError::Authentication)?;

        String::from_utf8(plaintext)
            .map_err(|_| CodecError::Format("plaintext is not valid UTF-8".to_string()))
    }
}

impl std::fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCodec").finish_non_exhaustive()
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, CodecError> {
    hex::decode(value).map_err(|e| CodecError::Format(format!("{} is not valid hex: {}", name, e)))
}
