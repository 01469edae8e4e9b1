//! Run policy extension point.
//!
//! A run policy decides when a new build may start and is told when a build
//! finishes, so that policy-gated families can admit their next build.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Build, Result};

/// The run policies a build can request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum RunPolicyKind {
    /// Builds start as soon as they are created.
    Parallel,
    /// Builds of a family run one at a time, in creation order.
    #[default]
    Serial,
    /// Like `Serial`, but queued builds are cancelled in favor of the newest.
    SerialLatestOnly,
}

impl std::fmt::Display for RunPolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunPolicyKind::Parallel => "Parallel",
            RunPolicyKind::Serial => "Serial",
            RunPolicyKind::SerialLatestOnly => "SerialLatestOnly",
        })
    }
}

impl std::str::FromStr for RunPolicyKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Parallel" => Ok(RunPolicyKind::Parallel),
            "Serial" => Ok(RunPolicyKind::Serial),
            "SerialLatestOnly" => Ok(RunPolicyKind::SerialLatestOnly),
            other => Err(crate::Error::Fatal(format!("unknown run policy {other:?}"))),
        }
    }
}

/// Trait for run policies.
#[async_trait]
pub trait RunPolicy: Send + Sync {
    /// Whether this policy is responsible for builds requesting `kind`.
    fn handles(&self, kind: RunPolicyKind) -> bool;

    /// Whether the build may start now.
    async fn is_runnable(&self, build: &Build) -> Result<bool>;

    /// Called once a build has durably reached a terminal phase.
    async fn on_complete(&self, build: &Build) -> Result<()>;
}
