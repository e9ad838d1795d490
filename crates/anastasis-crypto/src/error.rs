use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// MAC verification failed: wrong key or corrupted ciphertext.
    #[error("authentication failed during decryption")]
    AuthFail,

    /// Blob too short to even hold nonce and MAC.
    #[error("ciphertext is malformed ({0} bytes)")]
    Malformed(usize),

    #[error("invalid Ed25519 public key")]
    InvalidPublicKey,

    #[error("invalid signature encoding")]
    InvalidSignature,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("identity data is not a JSON object")]
    BadIdentityData,
}
