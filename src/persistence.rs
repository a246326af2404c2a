use async_trait::async_trait;

use crate::encryption::EncryptionProvider;

/// Consumed, not implemented (spec section 6): the engine defines this
/// contract and drives it from the [`crate::cache_observer::CacheObserver`]
/// plane, but ships no concrete backend. Browser-specific implementations
/// (`localStorage`, IndexedDB) from the teacher are dropped for the same
/// reason — see DESIGN.md.
#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    async fn persist(&self, key: &str, bytes: Vec<u8>) -> Result<(), PersistenceError>;
    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
    async fn remove(&self, key: &str) -> Result<(), PersistenceError>;
    async fn clear(&self) -> Result<(), PersistenceError>;
    async fn exists(&self, key: &str) -> Result<bool, PersistenceError>;
    async fn get_all_keys(&self) -> Result<Vec<String>, PersistenceError>;

    async fn persist_many(&self, entries: Vec<(String, Vec<u8>)>) -> Result<(), PersistenceError> {
        for (key, bytes) in entries {
            self.persist(&key, bytes).await?;
        }
        Ok(())
    }

    async fn remove_many(&self, keys: Vec<String>) -> Result<(), PersistenceError> {
        for key in keys {
            self.remove(&key).await?;
        }
        Ok(())
    }

    /// Re-encrypts every persisted entry under `new_key`. Must be atomic: if
    /// any entry fails to re-encrypt, every entry already rewritten must be
    /// restored under `old_key` before returning (spec section 6).
    /// `on_progress(done, total)` is called after each successfully
    /// rewritten entry.
    async fn update_encryption_key(
        &self,
        old_key: &[u8],
        new_key: &[u8],
        encryption: &dyn EncryptionProvider,
        on_progress: Option<&(dyn Fn(usize, usize) + Send + Sync)>,
    ) -> Result<(), PersistenceError> {
        let keys = self.get_all_keys().await?;
        let total = keys.len();
        let mut rewritten = Vec::with_capacity(total);

        for (done, key) in keys.iter().enumerate() {
            let Some(encrypted) = self.retrieve(key).await? else {
                continue;
            };
            let plaintext = encryption
                .decrypt(&encrypted, old_key)
                .map_err(PersistenceError::Encryption)?;
            let re_encrypted = encryption.encrypt(&plaintext, new_key).map_err(PersistenceError::Encryption)?;

            if let Err(err) = self.persist(key, re_encrypted).await {
                self.restore_on_failure(&rewritten, old_key, new_key, encryption).await;
                return Err(err);
            }
            rewritten.push(key.clone());
            if let Some(callback) = on_progress {
                callback(done + 1, total);
            }
        }
        Ok(())
    }

    /// Hook used by the default `update_encryption_key` to roll rewritten
    /// entries back to `old_key` if a later entry in the batch fails.
    /// Implementors backed by a single atomic transaction can leave this as
    /// a no-op override returning immediately, since their backend never
    /// leaves a partial write visible in the first place.
    async fn restore_on_failure(
        &self,
        rewritten_keys: &[String],
        old_key: &[u8],
        new_key: &[u8],
        encryption: &dyn EncryptionProvider,
    ) {
        for key in rewritten_keys {
            if let Ok(Some(current)) = self.retrieve(key).await {
                if let Ok(plaintext) = encryption.decrypt(&current, new_key) {
                    if let Ok(restored) = encryption.encrypt(&plaintext, old_key) {
                        let _ = self.persist(key, restored).await;
                    }
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence backend error: {0}")]
    Backend(String),
    #[error("encryption error: {0}")]
    Encryption(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct InMemoryProvider {
        store: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl PersistenceProvider for InMemoryProvider {
        async fn persist(&self, key: &str, bytes: Vec<u8>) -> Result<(), PersistenceError> {
            self.store.lock().unwrap().insert(key.to_string(), bytes);
            Ok(())
        }

        async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
            Ok(self.store.lock().unwrap().get(key).cloned())
        }

        async fn remove(&self, key: &str) -> Result<(), PersistenceError> {
            self.store.lock().unwrap().remove(key);
            Ok(())
        }

        async fn clear(&self) -> Result<(), PersistenceError> {
            self.store.lock().unwrap().clear();
            Ok(())
        }

        async fn exists(&self, key: &str) -> Result<bool, PersistenceError> {
            Ok(self.store.lock().unwrap().contains_key(key))
        }

        async fn get_all_keys(&self) -> Result<Vec<String>, PersistenceError> {
            Ok(self.store.lock().unwrap().keys().cloned().collect())
        }
    }

    struct XorCipher;

    impl EncryptionProvider for XorCipher {
        fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, crate::encryption::EncryptionError> {
            Ok(plaintext.iter().zip(key.iter().cycle()).map(|(b, k)| b ^ k).collect())
        }

        fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, crate::encryption::EncryptionError> {
            self.encrypt(ciphertext, key)
        }

        fn generate_key(&self) -> Vec<u8> {
            vec![0xAB; 16]
        }

        fn is_valid_key(&self, key: &[u8]) -> bool {
            !key.is_empty()
        }
    }

    #[tokio::test]
    async fn persist_many_then_retrieve_round_trips() {
        let provider = InMemoryProvider { store: Mutex::new(HashMap::new()) };
        provider
            .persist_many(vec![("a".into(), vec![1, 2, 3]), ("b".into(), vec![4, 5])])
            .await
            .unwrap();
        assert_eq!(provider.retrieve("a").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(provider.retrieve("b").await.unwrap(), Some(vec![4, 5]));
    }

    #[tokio::test]
    async fn update_encryption_key_round_trips_under_new_key() {
        let cipher = XorCipher;
        let old_key = vec![1u8; 4];
        let new_key = vec![2u8; 4];
        let provider = InMemoryProvider { store: Mutex::new(HashMap::new()) };

        let plaintext = b"hello".to_vec();
        let encrypted = cipher.encrypt(&plaintext, &old_key).unwrap();
        provider.persist("k", encrypted).await.unwrap();

        provider.update_encryption_key(&old_key, &new_key, &cipher, None).await.unwrap();

        let stored = provider.retrieve("k").await.unwrap().unwrap();
        let decrypted = cipher.decrypt(&stored, &new_key).unwrap();
        assert_eq!(decrypted, plaintext);
    }
}
