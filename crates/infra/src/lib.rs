//! Infrastructure layer: configuration and broker-backed transports.

pub mod config;
pub mod event_bus;

pub use config::{ConfigError, PipelineConfig};
