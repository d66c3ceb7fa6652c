//! Institutional key material for PharmaChain
//!
//! Blocks are sealed for a single institution: its secp256k1 public key wraps
//! every block's content key, and only the holder of the matching secret key
//! can open a batch. The secret key is kept on disk password-protected.

use crate::error::ChainError;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use argon2::Argon2;
use once_cell::sync::Lazy;
use rand::RngCore;
use secp256k1::{
    constants::{PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    All, PublicKey, Secp256k1, SecretKey,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// A thread-safe, lazily initialized Secp256k1 context.
pub(crate) static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

const SALT_SIZE: usize = 16;
const GCM_NONCE_SIZE: usize = 12;

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut rand::rngs::OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn from_secret_hex(hex_str: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| ChainError::CryptoError(format!("Invalid hex secret key: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    pub fn public_hex(&self) -> String {
        public_key_to_hex(&self.public_key)
    }
}

pub fn public_key_to_hex(key: &PublicKey) -> String {
    hex::encode(key.serialize())
}

/// Parse a compressed (33-byte) public key from hex.
pub fn public_key_from_hex(hex_str: &str) -> Result<PublicKey, ChainError> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| ChainError::CryptoError(format!("Invalid hex public key: {}", e)))?;
    if bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            bytes.len()
        )));
    }
    PublicKey::from_slice(&bytes).map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))
}

/// A secret key encrypted under a password. All fields are hex.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedSecretKey {
    pub public_key: String,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

fn derive_password_key(password: &[u8], salt: &[u8]) -> Result<[u8; 32], ChainError> {
    let mut out = [0u8; 32];
    Argon2::default()
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| ChainError::CryptoError(format!("Key derivation failed: {}", e)))?;
    Ok(out)
}

/// Encrypt `keypair`'s secret under a key stretched from `password` with Argon2id.
pub fn seal_secret_key(keypair: &KeyPair, password: &str) -> Result<SealedSecretKey, ChainError> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let kek = derive_password_key(password.as_bytes(), &salt)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, &keypair.secret_key.secret_bytes()[..])
        .map_err(|e| ChainError::CryptoError(format!("Failed to seal secret key: {}", e)))?;

    Ok(SealedSecretKey {
        public_key: keypair.public_hex(),
        salt: hex::encode(salt),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
    })
}

/// Decrypt a sealed secret key. A wrong password surfaces as a `CryptoError`.
pub fn open_secret_key(sealed: &SealedSecretKey, password: &str) -> Result<KeyPair, ChainError> {
    let decode = |field: &str, value: &str| {
        hex::decode(value).map_err(|e| ChainError::CryptoError(format!("Invalid {} in keystore: {}", field, e)))
    };
    let salt = decode("salt", &sealed.salt)?;
    let nonce = decode("nonce", &sealed.nonce)?;
    let ciphertext = decode("ciphertext", &sealed.ciphertext)?;
    if nonce.len() != GCM_NONCE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Keystore nonce must be {} bytes, got {}",
            GCM_NONCE_SIZE,
            nonce.len()
        )));
    }

    let kek = derive_password_key(password.as_bytes(), &salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
    let secret = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| ChainError::CryptoError("Wrong password or corrupted keystore".to_string()))?;

    let keypair = KeyPair::from_secret_bytes(&secret)?;
    if keypair.public_hex() != sealed.public_key {
        return Err(ChainError::CryptoError(
            "Keystore public key does not match its secret".to_string(),
        ));
    }
    Ok(keypair)
}

pub fn save_sealed_key(path: &Path, sealed: &SealedSecretKey) -> Result<(), ChainError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(sealed)?)?;
    Ok(())
}

pub fn load_sealed_key(path: &Path) -> Result<SealedSecretKey, ChainError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
