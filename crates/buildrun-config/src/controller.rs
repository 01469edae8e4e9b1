//! Controller configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Full configuration of a controller process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildrunConfig {
    pub controller: ControllerConfig,
    pub strategies: StrategyConfig,
    /// Settings added to build pods that do not set them already.
    pub defaults: PodSettings,
    /// Settings forced onto every build pod.
    pub overrides: PodSettings,
}

/// Reconciler tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Transient failures tolerated per key before giving up.
    pub max_retries: u32,
    /// First retry delay; doubled on every further failure.
    pub base_delay: Duration,
    /// Upper bound on the retry delay.
    pub max_delay: Duration,
    /// How long workers wait for caches to sync before startup fails.
    pub cache_sync_timeout: Duration,
    /// Namespace to watch. All namespaces when unset.
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_retries: 15,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            cache_sync_timeout: Duration::from_secs(60),
            namespace: None,
        }
    }
}

/// Images used by the strategy builders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Builder image for Dockerfile builds.
    pub docker_image: String,
    /// Builder image that drives source-to-image assembly.
    pub source_image: String,
    /// Service account for build pods when the build names none.
    pub service_account: String,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            docker_image: "quay.io/buildrun/docker-builder:latest".to_string(),
            source_image: "quay.io/buildrun/sti-builder:latest".to_string(),
            service_account: "builder".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSettings {
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub node_selector: BTreeMap<String, String>,
}

impl PodSettings {
    pub fn is_empty(&self) -> bool {
        self.env.is_empty() && self.labels.is_empty() && self.node_selector.is_empty()
    }
}

/// Read and parse a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<BuildrunConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
}

/// Parse a controller configuration from KDL text.
pub fn parse_config(kdl: &str) -> ConfigResult<BuildrunConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = BuildrunConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "controller" => parse_controller(node, &mut config.controller)?,
            "strategies" => parse_strategies(node, &mut config.strategies)?,
            "defaults" => config.defaults = parse_pod_settings(node)?,
            "overrides" => config.overrides = parse_pod_settings(node)?,
            _ => {} // Ignore unknown nodes
        }
    }

    if config.controller.workers == 0 {
        return Err(ConfigError::InvalidValue {
            field: "controller.workers".to_string(),
            message: "at least one worker is required".to_string(),
        });
    }

    Ok(config)
}

fn parse_controller(node: &KdlNode, config: &mut ControllerConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        match child.name().value() {
            "workers" => config.workers = require_int(child)? as usize,
            "max-retries" => {
                config.max_retries = u32::try_from(require_int(child)?).map_err(|_| {
                    invalid(child, "value out of range".to_string())
                })?;
            }
            "base-delay-ms" => config.base_delay = Duration::from_millis(require_int(child)?),
            "max-delay-secs" => config.max_delay = Duration::from_secs(require_int(child)?),
            "cache-sync-timeout-secs" => {
                config.cache_sync_timeout = Duration::from_secs(require_int(child)?)
            }
            "namespace" => config.namespace = Some(require_string(child)?),
            _ => {}
        }
    }

    if config.base_delay > config.max_delay {
        return Err(ConfigError::InvalidValue {
            field: "controller.base-delay-ms".to_string(),
            message: "base delay exceeds max delay".to_string(),
        });
    }
    Ok(())
}

fn parse_strategies(node: &KdlNode, config: &mut StrategyConfig) -> ConfigResult<()> {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "docker-image" => config.docker_image = require_string(child)?,
                "source-image" => config.source_image = require_string(child)?,
                "service-account" => config.service_account = require_string(child)?,
                _ => {}
            }
        }
    }
    Ok(())
}

fn parse_pod_settings(node: &KdlNode) -> ConfigResult<PodSettings> {
    let mut settings = PodSettings::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let target = match child.name().value() {
                "env" => &mut settings.env,
                "label" => &mut settings.labels,
                "node-selector" => &mut settings.node_selector,
                _ => continue,
            };
            let (key, value) = require_pair(child)?;
            target.insert(key, value);
        }
    }

    Ok(settings)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn require_string(node: &KdlNode) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| invalid(node, "expected a string".to_string()))
}

fn require_int(node: &KdlNode) -> ConfigResult<u64> {
    let value = get_first_int_arg(node)
        .ok_or_else(|| invalid(node, "expected an integer".to_string()))?;
    u64::try_from(value).map_err(|_| invalid(node, format!("{value} is out of range")))
}

fn require_pair(node: &KdlNode) -> ConfigResult<(String, String)> {
    match get_all_string_args(node).as_slice() {
        [key, value] => Ok((key.clone(), value.clone())),
        _ => Err(invalid(node, "expected a key and a value".to_string())),
    }
}

fn invalid(node: &KdlNode, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: node.name().value().to_string(),
        message,
    }
}
