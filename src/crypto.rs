use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aes_gcm::aead::{Aead, Nonce};
use aes_gcm::{Aes256Gcm, KeyInit};
use anyhow::{anyhow, bail};
#[cfg(test)] use mockall::automock;
use sha2::{Digest, Sha256};

/// Symmetric encryption of message bodies, keyed by a previously agreed secret.
pub trait PayloadEncryption: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// The key agreement that precedes encryption. The client's public key is sent to the server,
///  and the server's public key is used to derive the shared secret.
#[cfg_attr(test, automock)]
pub trait KeyExchange: Send + Sync {
    fn public_key(&self) -> Vec<u8>;

    fn derive_shared_secret(&self, server_public_key: &[u8]) -> anyhow::Result<Vec<u8>>;
}

pub fn derive_encryption(key_exchange: &dyn KeyExchange, server_public_key: &[u8]) -> anyhow::Result<Arc<dyn PayloadEncryption>> {
    let secret = key_exchange.derive_shared_secret(server_public_key)?;
    Ok(Arc::new(Aes256GcmEncryption::new(&secret)?))
}

pub struct NoEncryption;
impl PayloadEncryption for NoEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// AES-256-GCM with the SHA-256 hash of the shared secret as key. Each ciphertext is prefixed
///  with its 12 byte nonce: a random per-instance part plus a counter.
pub struct Aes256GcmEncryption {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_incremented: AtomicU64,
}
impl Aes256GcmEncryption {
    const NONCE_LEN: usize = 12;
    const TAG_LEN: usize = 16;

    pub fn new(shared_secret: &[u8]) -> anyhow::Result<Aes256GcmEncryption> {
        if shared_secret.is_empty() {
            bail!("empty shared secret");
        }
        let key = Sha256::digest(shared_secret);
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| anyhow!("invalid key: {}", e))?;

        Ok(Aes256GcmEncryption {
            cipher,
            nonce_fixed: rand::random(),
            nonce_incremented: AtomicU64::new(0),
        })
    }

    fn next_nonce(&self) -> [u8; Self::NONCE_LEN] {
        let mut result = [0u8; Self::NONCE_LEN];
        result[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        result[4..].copy_from_slice(&self.nonce_incremented.fetch_add(1, Ordering::AcqRel).to_be_bytes());
        result
    }
}

impl PayloadEncryption for Aes256GcmEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let nonce_bytes = self.next_nonce();
        let nonce = Nonce::<Aes256Gcm>::from(nonce_bytes);

        let ciphertext = self.cipher.encrypt(&nonce, plaintext)
            .map_err(|e| anyhow!("encryption error: {}", e))?;

        let mut result = Vec::with_capacity(Self::NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        if ciphertext.len() < Self::NONCE_LEN + Self::TAG_LEN {
            bail!("ciphertext of {} bytes is too short", ciphertext.len());
        }
        let nonce_bytes: [u8; Self::NONCE_LEN] = ciphertext[..Self::NONCE_LEN].try_into()?;
        let nonce = Nonce::<Aes256Gcm>::from(nonce_bytes);
        self.cipher.decrypt(&nonce, &ciphertext[Self::NONCE_LEN..])
            .map_err(|e| anyhow!("decryption error: {}", e))
    }
}
