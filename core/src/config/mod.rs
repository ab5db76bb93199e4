//! Configuration delivered with each batch: an immutable dictionary plus
//! transparent decryption of encrypted values.

pub mod crypto;
pub mod dictionary;

pub use crypto::{encrypt as encrypt_value, Decryptor};
pub use dictionary::{ConfigDictionary, ConfigValue};
