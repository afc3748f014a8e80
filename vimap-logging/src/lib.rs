//! Structured logging infrastructure for vimap
//!
//! All output goes to stderr: in worker processes stdout carries the IPC
//! protocol, so nothing else may write there.

pub mod init;

pub use init::{build_env_filter, init_logging, init_worker_logging};
pub use vimap_config::domains::logging::{LogFormat, LogLevel, LoggingConfig};
