//! Client side of the Anastasis provider protocol: typed HTTP
//! operations plus the backup/recovery arithmetic library consumers
//! need to split and reassemble core secrets.

pub mod backup;
pub mod client;
pub mod document;

pub use backup::{recover_core_secret, split_core_secret, SecretSplit};
pub use client::{
    ClientError, KeyShareResult, MethodInfo, PolicyLookupResult, PolicyStoreResult,
    ProviderClient, ProviderInfo, TruthStoreResult,
};
pub use document::{DocumentError, PolicyEntry, RecoveryDocument, TruthReference};
