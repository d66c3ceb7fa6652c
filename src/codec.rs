//! Per-block hybrid encryption envelope
//!
//! Each block gets a fresh 256-bit content key. The cleartext batch (a JSON
//! array of records) is encrypted with AES-256-GCM under that key and a fresh
//! 96-bit nonce. The content key itself is wrapped for the institution with
//! ECIES over secp256k1: an ephemeral key pair, ECDH against the institution's
//! public key, SHA-256 to a key-encryption key, then AES-256-GCM.
//!
//! Wire shapes (both standard base64, so never containing `|` or `:`):
//! - payload: `nonce(12) || ciphertext+tag`
//! - wrapped key: `ephemeral_pubkey(33) || nonce(12) || ciphertext+tag`

use crate::blockchain::Block;
use crate::crypto::SECP256K1_CONTEXT;
use crate::error::ChainError;
use crate::transaction::{batch_from_json, batch_to_json, TransactionRecord};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use secp256k1::{constants::PUBLIC_KEY_SIZE, ecdh::SharedSecret, PublicKey, SecretKey};
use sha2::{Digest, Sha256};

const NONCE_SIZE: usize = 12;
const KEY_WRAP_DOMAIN: &[u8] = b"pharmachain/key-wrap/v1";

/// Symmetric key protecting one block's payload.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        ContentKey(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ContentKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("ContentKey(..)")
    }
}

fn aead_seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, ChainError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| ChainError::CryptoError(format!("Encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aead_open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, ChainError> {
    if sealed.len() < NONCE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Ciphertext too short: {} bytes",
            sealed.len()
        )));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ChainError::CryptoError("Decryption failed: authentication tag mismatch".to_string()))
}

fn decode_base64(label: &str, encoded: &str) -> Result<Vec<u8>, ChainError> {
    STANDARD
        .decode(encoded)
        .map_err(|e| ChainError::CryptoError(format!("Invalid base64 {}: {}", label, e)))
}

/// Encrypt a cleartext payload under `key`.
pub fn encrypt_payload(plaintext: &[u8], key: &ContentKey) -> Result<String, ChainError> {
    Ok(STANDARD.encode(aead_seal(key.as_bytes(), plaintext)?))
}

pub fn decrypt_payload(encoded: &str, key: &ContentKey) -> Result<Vec<u8>, ChainError> {
    aead_open(key.as_bytes(), &decode_base64("payload", encoded)?)
}

fn key_encryption_key(shared: &SharedSecret, ephemeral: &PublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KEY_WRAP_DOMAIN);
    hasher.update(shared.secret_bytes());
    hasher.update(ephemeral.serialize());
    hasher.finalize().into()
}

/// Wrap `key` so that only the holder of `recipient`'s secret key can recover it.
pub fn wrap_key(key: &ContentKey, recipient: &PublicKey) -> Result<String, ChainError> {
    let ephemeral_secret = SecretKey::new(&mut rand::rngs::OsRng);
    let ephemeral_public = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &ephemeral_secret);
    let shared = SharedSecret::new(recipient, &ephemeral_secret);
    let kek = key_encryption_key(&shared, &ephemeral_public);

    let mut out = Vec::with_capacity(PUBLIC_KEY_SIZE + NONCE_SIZE + 48);
    out.extend_from_slice(&ephemeral_public.serialize());
    out.extend_from_slice(&aead_seal(&kek, key.as_bytes())?);
    Ok(STANDARD.encode(out))
}

pub fn unwrap_key(wrapped: &str, secret: &SecretKey) -> Result<ContentKey, ChainError> {
    let raw = decode_base64("wrapped key", wrapped)?;
    if raw.len() < PUBLIC_KEY_SIZE + NONCE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Wrapped key too short: {} bytes",
            raw.len()
        )));
    }
    let (ephemeral, sealed) = raw.split_at(PUBLIC_KEY_SIZE);
    let ephemeral = PublicKey::from_slice(ephemeral)
        .map_err(|e| ChainError::CryptoError(format!("Invalid ephemeral key: {}", e)))?;
    let shared = SharedSecret::new(&ephemeral, secret);
    let kek = key_encryption_key(&shared, &ephemeral);

    let bytes = aead_open(&kek, sealed)?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ChainError::CryptoError("Unwrapped content key has wrong length".to_string()))?;
    Ok(ContentKey::from_bytes(bytes))
}

/// Output of sealing one batch: what goes into the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBatch {
    pub encrypted_payloads: Vec<String>,
    pub wrapped_key: String,
}

/// Seals batches for one institutional recipient.
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    recipient: PublicKey,
}

impl PayloadCodec {
    pub fn new(recipient: PublicKey) -> Self {
        Self { recipient }
    }

    pub fn recipient(&self) -> &PublicKey {
        &self.recipient
    }

    pub fn seal_batch(&self, records: &[TransactionRecord]) -> Result<SealedBatch, ChainError> {
        let key = ContentKey::generate();
        let json = batch_to_json(records)?;
        Ok(SealedBatch {
            encrypted_payloads: vec![encrypt_payload(json.as_bytes(), &key)?],
            wrapped_key: wrap_key(&key, &self.recipient)?,
        })
    }

    /// Encrypt the block's pending records and seal it. The hash is left for mining.
    pub fn seal_block(&self, block: &mut Block) -> Result<(), ChainError> {
        let sealed = self.seal_batch(block.pending_transactions())?;
        block.seal(sealed.encrypted_payloads, sealed.wrapped_key);
        Ok(())
    }
}

/// Recover the cleartext records of a sealed block with the institution's secret key.
pub fn open_batch(block: &Block, secret: &SecretKey) -> Result<Vec<TransactionRecord>, ChainError> {
    if block.wrapped_key.is_empty() {
        return Ok(Vec::new());
    }
    let key = unwrap_key(&block.wrapped_key, secret)?;
    let mut records = Vec::new();
    for payload in &block.encrypted_payloads {
        let plaintext = decrypt_payload(payload, &key)?;
        let json = String::from_utf8(plaintext)
            .map_err(|e| ChainError::CryptoError(format!("Payload is not UTF-8: {}", e)))?;
        records.extend(batch_from_json(&json)?);
    }
    Ok(records)
}
