pub mod broker;
pub mod code;
pub mod config;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod login;
pub mod notify;
pub mod scheduler;
pub mod store;
pub mod upstream;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::KeepaliveConfig;
pub use credential::Credential;
pub use error::{ErrorKind, KeepaliveError, UpstreamError};
