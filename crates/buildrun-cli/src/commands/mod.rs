//! CLI command implementations.

pub mod controller;

use std::path::Path;

use anyhow::Result;

pub fn validate(path: &Path) -> Result<()> {
    match buildrun_config::load_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!(
                "  workers: {}, max retries: {}, namespace: {}",
                config.controller.workers,
                config.controller.max_retries,
                config.controller.namespace.as_deref().unwrap_or("<all>")
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
