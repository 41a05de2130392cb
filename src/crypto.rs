//! Per-instance secrets: a 256-bit AES-GCM key for export encryption and a
//! random salt for integrity hashing. Both are generated on first run and
//! persisted in the meta store.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;

use crate::error::MemoryError;
use crate::store::{KvStore, StoreName};

const KEY_KEY: &str = "encryption_key";
const SALT_KEY: &str = "salt";
const NONCE_LEN: usize = 12;

pub struct InstanceSecrets {
    cipher: Aes256Gcm,
    /// Exportable raw key material.
    key_bytes: [u8; 32],
    /// Fixed per instance, independent of the key.
    pub salt: String,
}

impl InstanceSecrets {
    /// Load the key and salt from the meta store, generating both on first run.
    pub async fn load_or_create(kv: &Arc<dyn KvStore>) -> Result<Self, MemoryError> {
        let key_bytes = match kv.get(StoreName::Meta, KEY_KEY).await? {
            Some(v) => {
                let bytes: Vec<u8> = serde_json::from_value(v)
                    .map_err(|e| MemoryError::Store(format!("corrupt key material: {e}")))?;
                bytes
                    .try_into()
                    .map_err(|_| MemoryError::Store("key material is not 32 bytes".into()))?
            }
            None => {
                let mut key = [0u8; 32];
                OsRng.fill_bytes(&mut key);
                kv.put(StoreName::Meta, KEY_KEY, serde_json::json!(key.to_vec()))
                    .await?;
                key
            }
        };

        let salt = match kv.get(StoreName::Meta, SALT_KEY).await? {
            Some(v) => v
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| MemoryError::Store("corrupt salt".into()))?,
            None => {
                let mut raw = [0u8; 16];
                OsRng.fill_bytes(&mut raw);
                let salt: String = raw.iter().map(|b| format!("{b:02x}")).collect();
                kv.put(StoreName::Meta, SALT_KEY, serde_json::json!(salt))
                    .await?;
                salt
            }
        };

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        Ok(Self {
            cipher,
            key_bytes,
            salt,
        })
    }

    pub fn key_material(&self) -> &[u8; 32] {
        &self.key_bytes
    }

    /// Encrypt with a fresh random 12-byte nonce, prepended to the output.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, MemoryError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| MemoryError::Internal(format!("encrypt: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, MemoryError> {
        if data.len() < NONCE_LEN {
            return Err(MemoryError::InvalidInput("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| MemoryError::InvalidInput(format!("decrypt: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemKv;

    #[tokio::test]
    async fn seal_open_round_trip() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let secrets = InstanceSecrets::load_or_create(&kv).await.unwrap();
        let sealed = secrets.seal(b"hello").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"hello");
        assert_eq!(secrets.open(&sealed).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn secrets_persist_across_reload() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let first = InstanceSecrets::load_or_create(&kv).await.unwrap();
        let sealed = first.seal(b"payload").unwrap();
        let salt = first.salt.clone();
        drop(first);

        let second = InstanceSecrets::load_or_create(&kv).await.unwrap();
        assert_eq!(second.salt, salt);
        assert_eq!(second.open(&sealed).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn tampered_ciphertext_rejected() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let secrets = InstanceSecrets::load_or_create(&kv).await.unwrap();
        let mut sealed = secrets.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(secrets.open(&sealed).is_err());
    }
}
