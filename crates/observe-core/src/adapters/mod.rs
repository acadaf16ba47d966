//! Adapters: configuration sources.

pub mod config;

pub use config::{ConfigError, ObserveConfig, CONFIG_ENV};
