pub mod backend;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod memory_store;
pub mod metrics;
pub mod middleware;
pub mod queue;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod redis;
pub mod response;
pub mod server;
pub mod store;
pub mod task;
pub mod token_bucket;
pub mod validation;
pub mod worker;

pub use config::Config;
pub use error::{Result, TarotError};
pub use server::{create_app, AppState};
