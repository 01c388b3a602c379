//! AI interpretation backends: instances, HTTP transport and the pool that
//! balances between them.

pub mod client;
pub mod instance;
pub mod pool;

pub use client::{BackendClient, HttpBackendClient, ReadingPrompt};
pub use instance::{ApiKey, BackendInstance, BackendStatus, BackendTarget};
pub use pool::{BackendPool, PoolSettings};
