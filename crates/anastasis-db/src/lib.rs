pub mod db;
pub mod records;
pub mod retry;
pub mod status;

pub use db::AnastasisDb;
pub use retry::retry_soft;
pub use status::{
    AccountStatus, ChallengeCreation, CodeStatus, DbError, StoreStatus, TruthLookup,
    TruthStoreStatus,
};
