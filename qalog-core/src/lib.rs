pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod models;

pub use config::{QaLogConfig, SessionScope};
pub use error::QaLogError;
pub use identity::{IdentityResolver, RawIdentity};
