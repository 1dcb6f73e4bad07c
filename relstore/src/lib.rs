pub mod cmd;
pub mod conf;
pub mod context;
pub mod db;
pub mod errors;
pub mod testing;

pub use conf::{ProviderCapabilities, RetryPolicy, SelfReferenceStrategy, StoreConf};
pub use context::SaveContext;
pub use errors::{EntityAt, SaveError, SaveResult, SaveStatus};
