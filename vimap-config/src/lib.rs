//! Domain-driven configuration management for vimap
//!
//! Configuration is split by functional domain (the worker pool and
//! logging), with validation, defaults, and environment variable support.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{logging::LoggingConfig, pool::PoolConfig, VimapConfig};

// Re-export utilities
pub use domains::utils::{serde_duration_ms, serde_duration_ms_option};
