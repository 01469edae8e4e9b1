//! The `Parallel` run policy: no ordering between builds of a family.

use async_trait::async_trait;
use buildrun_core::policy::{RunPolicy, RunPolicyKind};
use buildrun_core::{Build, Result};

/// Every build starts as soon as it is created.
pub struct ParallelPolicy;

#[async_trait]
impl RunPolicy for ParallelPolicy {
    fn handles(&self, kind: RunPolicyKind) -> bool {
        kind == RunPolicyKind::Parallel
    }

    async fn is_runnable(&self, _build: &Build) -> Result<bool> {
        Ok(true)
    }

    async fn on_complete(&self, _build: &Build) -> Result<()> {
        Ok(())
    }
}
