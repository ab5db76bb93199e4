//! Encrypted configuration values.
//!
//! Wire format: `${enc=aes256_hex, value=<hex>}`. The hex payload decodes to
//! `salt::iv::ciphertext`, each part hex-encoded again. The key is derived
//! with PBKDF2-HMAC-SHA1 (65536 rounds, 32 bytes) from a passphrase taken
//! from the process environment; the ciphertext is AES-256-CBC with PKCS#7
//! padding.

use std::sync::Arc;

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{AgentError, Result};
use crate::logging::SecretRegistry;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

const MARKER_PREFIX: &str = "${enc=aes256_hex, value=";
const MARKER_SUFFIX: &str = "}";
const PBKDF2_ROUNDS: u32 = 65_536;
const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;

/// Whether `value` is an encrypted marker.
pub fn is_encrypted(value: &str) -> bool {
    marker_payload(value).is_some()
}

/// The hex payload of a marker, if `value` is one.
pub fn marker_payload(value: &str) -> Option<&str> {
    let inner = value
        .trim()
        .strip_prefix(MARKER_PREFIX)?
        .strip_suffix(MARKER_SUFFIX)?;
    if !inner.is_empty() && inner.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(inner)
    } else {
        None
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<sha1::Sha1>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

fn decode_part(part: &str, what: &str) -> Result<Vec<u8>> {
    hex::decode(part).map_err(|e| AgentError::config(format!("encrypted value has a bad {}: {}", what, e)))
}

/// Decrypt a marker payload with `passphrase`.
pub fn decrypt(payload_hex: &str, passphrase: &str) -> Result<String> {
    let outer = decode_part(payload_hex, "payload")?;
    let outer = String::from_utf8(outer)
        .map_err(|_| AgentError::config("encrypted value payload is not text"))?;
    let parts: Vec<&str> = outer.split("::").collect();
    let [salt, iv, data] = parts.as_slice() else {
        return Err(AgentError::config(format!(
            "encrypted value must have 3 parts (salt::iv::data), found {}",
            parts.len()
        )));
    };
    let salt = decode_part(salt, "salt")?;
    let iv = decode_part(iv, "iv")?;
    let data = decode_part(data, "ciphertext")?;

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|_| AgentError::config(format!("encrypted value iv must be {} bytes", IV_LEN)))?;
    let plain = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&data)
        .map_err(|_| AgentError::config("cannot decrypt value: wrong passphrase or corrupted data"))?;
    String::from_utf8(plain).map_err(|_| AgentError::config("decrypted value is not valid UTF-8"))
}

/// Encrypt `plaintext` into the full `${enc=...}` marker.
pub fn encrypt(plaintext: &str, passphrase: &str) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|_| AgentError::config("cannot initialise cipher"))?;
    let data = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let inner = format!("{}::{}::{}", hex::encode(salt), hex::encode(iv), hex::encode(data));
    Ok(format!("{}{}{}", MARKER_PREFIX, hex::encode(inner), MARKER_SUFFIX))
}

/// Decrypts markers using a passphrase from the environment, registering
/// every plaintext with the secret table.
#[derive(Debug, Clone)]
pub struct Decryptor {
    key_env: String,
    secrets: Option<Arc<SecretRegistry>>,
}

impl Decryptor {
    pub fn new(key_env: impl Into<String>) -> Self {
        Decryptor {
            key_env: key_env.into(),
            secrets: None,
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<SecretRegistry>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn key_env(&self) -> &str {
        &self.key_env
    }

    fn passphrase(&self) -> Result<String> {
        match std::env::var(&self.key_env) {
            Ok(p) if !p.is_empty() => Ok(p),
            _ => Err(AgentError::config(format!(
                "encrypted configuration found but no passphrase is set in ${}",
                self.key_env
            ))),
        }
    }

    /// Decrypt `value` if it is a marker; `None` otherwise.
    pub fn decrypt_marker(&self, value: &str) -> Result<Option<String>> {
        let Some(payload) = marker_payload(value) else {
            return Ok(None);
        };
        let plain = decrypt(payload, &self.passphrase()?)?;
        if let Some(secrets) = &self.secrets {
            secrets.register(&plain);
        }
        Ok(Some(plain))
    }
}
