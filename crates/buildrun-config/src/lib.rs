//! KDL configuration parsing for the buildrun controller.
//!
//! This crate handles parsing of:
//! - Controller tuning (workers, retry policy, cache sync window)
//! - Strategy builder images
//! - Build pod defaults and overrides

pub mod controller;
pub mod error;

pub use controller::{
    BuildrunConfig, ControllerConfig, PodSettings, StrategyConfig, load_config, parse_config,
};
pub use error::{ConfigError, ConfigResult};
