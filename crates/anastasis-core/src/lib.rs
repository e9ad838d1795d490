pub mod amount;
pub mod base32;
pub mod config;
pub mod constants;
pub mod types;

pub use amount::{Amount, AmountError};
pub use config::{AuthorizationMethodConfig, MerchantBackendConfig, ProviderConfig};
pub use types::{
    AccountPublicKey, AccountSignature, EncryptedKeyShare, HashCode, KeyShare, MasterSalt, Nonce,
    PaymentSecret, PolicyKey, ProviderSalt, QuestionSalt, Timestamp, TruthKey, TruthUuid,
};
