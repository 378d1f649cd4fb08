//! Infrastructure - configuration, metrics, retry and process context
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `context` - Collaborator handles shared by every component
//! - `metrics` - Lock-free metrics collection
//! - `retry` - Jittered exponential backoff
//! - `clock` - Wall clock source (swappable in tests)

pub mod clock;
pub mod config;
pub mod context;
pub mod metrics;
pub mod retry;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use context::AppContext;
pub use metrics::Metrics;
pub use retry::RetryPolicy;
