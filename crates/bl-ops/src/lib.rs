//! BusLens broker operations
//!
//! One [`BrokerOperations`] trait with an implementation per authentication
//! mode. [`connect`] picks the implementation once; callers only ever hold
//! an `Arc<dyn BrokerOperations>`.

pub mod auth;
pub mod operations;
pub mod peek;

pub use auth::{
    connect, namespace_from_connection_string, AuthMode, DelegatedCredentialOperations, SharedSecretOperations,
};
pub use operations::{AuthKind, BrokerOperations};
pub use peek::peek_records;
