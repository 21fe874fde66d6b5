// Tessera Core - Domain Logic, Ports & the background resource pipeline
// NO infrastructure dependencies (Hexagonal Architecture)

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod port;

pub use config::CacheConfig;
pub use error::{AppError, JobError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
