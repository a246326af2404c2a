/// Consumed, not implemented (spec section 6): the core does not prescribe
/// an algorithm. It requires `decrypt(encrypt(x, k), k) == x` for every valid
/// `k`, and that distinct encryptions of the same plaintext differ (a
/// non-deterministic IV) — both are documented obligations on implementors,
/// not enforceable at the trait boundary.
pub trait EncryptionProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, EncryptionError>;
    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, EncryptionError>;
    fn generate_key(&self) -> Vec<u8>;
    fn is_valid_key(&self, key: &[u8]) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("invalid encryption key")]
    InvalidKey,
    #[error("encryption backend error: {0}")]
    Backend(String),
}
