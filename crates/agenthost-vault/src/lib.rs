//! At-rest encryption for instance credentials.
//!
//! Values are sealed with AES-256-GCM under a key stretched from the process-wide
//! vault key with HKDF-SHA256. The stored form is three colon-separated hex
//! segments:
//!
//! ```text
//! hex(nonce, 12 bytes) : hex(auth tag, 16 bytes) : hex(ciphertext)
//! ```
//!
//! Anything that does not parse as that shape is treated as a legacy cleartext
//! value and returned unchanged by [`Vault::decrypt`]. Without a key the vault is
//! the identity function in both directions; values sealed under a previous key
//! stay unreadable until that key is configured again.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const HKDF_INFO: &[u8] = b"agenthost-vault-v1";

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: {0}")]
    Decrypt(&'static str),
}

pub struct Vault {
    key: Option<Zeroizing<[u8; KEY_SIZE]>>,
}

impl Vault {
    /// Build a vault from the configured key. `None` or a blank key disables encryption.
    pub fn new(key: Option<&str>) -> Result<Self, VaultError> {
        let Some(raw) = key.map(str::trim).filter(|k| !k.is_empty()) else {
            return Ok(Self::disabled());
        };
        let hk = Hkdf::<Sha256>::new(None, raw.as_bytes());
        let mut derived = Zeroizing::new([0u8; KEY_SIZE]);
        hk.expand(HKDF_INFO, &mut derived[..])
            .map_err(|_| VaultError::KeyDerivation)?;
        Ok(Self { key: Some(derived) })
    }

    pub fn disabled() -> Self {
        Self { key: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_string());
        };
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| VaultError::Encrypt)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;
        // aes-gcm appends the tag to the ciphertext
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
        Ok(format!(
            "{}:{}:{}",
            hex::encode(nonce),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, value: &str) -> Result<String, VaultError> {
        let Some(key) = &self.key else {
            return Ok(value.to_string());
        };
        let Some(sealed) = SealedValue::parse(value) else {
            return Ok(value.to_string());
        };
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|_| VaultError::Decrypt("invalid key"))?;
        let mut payload = sealed.ciphertext;
        payload.extend_from_slice(&sealed.tag);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), payload.as_slice())
            .map_err(|_| VaultError::Decrypt("authentication failed"))?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Decrypt("plaintext is not utf-8"))
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("enabled", &self.is_enabled())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Whether `value` has the stored `nonce:tag:ciphertext` shape.
pub fn is_sealed(value: &str) -> bool {
    SealedValue::parse(value).is_some()
}

/// Display form of a secret: first and last four characters, middle elided.
pub fn mask(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

struct SealedValue {
    nonce: Vec<u8>,
    tag: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl SealedValue {
    fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(':');
        let (nonce, tag, ciphertext) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        let nonce = hex::decode(nonce).ok()?;
        let tag = hex::decode(tag).ok()?;
        let ciphertext = hex::decode(ciphertext).ok()?;
        if nonce.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
            return None;
        }
        Some(Self {
            nonce,
            tag,
            ciphertext,
        })
    }
}
