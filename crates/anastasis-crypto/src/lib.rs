pub mod encryption;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod secret;

pub use encryption::{
    decrypt, encrypt, keyshare_decrypt, keyshare_encrypt, recovery_document_decrypt,
    recovery_document_encrypt, truth_decrypt, truth_encrypt,
};
pub use error::CryptoError;
pub use keys::{user_identifier_derive, verify_policy_upload, AccountKeyPair};
pub use secret::{
    core_secret_encrypt, core_secret_recover, hash_answer, keyshare_create, policy_key_derive,
    secure_answer_hash, CoreSecretEncryption,
};
