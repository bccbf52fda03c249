// workshop-sync-client library entry point.

pub mod api;
pub mod auth;
pub mod channel;
pub mod config;
pub mod fallback;
pub mod presence;
pub mod records;
pub mod runtime;
pub mod store;

pub use runtime::SyncClient;
