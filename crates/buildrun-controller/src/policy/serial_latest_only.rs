//! The `SerialLatestOnly` run policy. Runs a family one build at a time
//! and cancels queued builds that a newer one has superseded.

use std::sync::Arc;

use async_trait::async_trait;
use buildrun_core::client::{BuildClient, Lister};
use buildrun_core::policy::{RunPolicy, RunPolicyKind};
use buildrun_core::{Build, Result};

use super::{accept, cancel, is_active, is_queued, siblings};

/// Serial execution where only the newest queued build survives; older
/// queued builds are cancelled.
pub struct SerialLatestOnlyPolicy {
    builds: Arc<dyn Lister<Build>>,
    client: Arc<dyn BuildClient>,
}

impl SerialLatestOnlyPolicy {
    pub fn new(builds: Arc<dyn Lister<Build>>, client: Arc<dyn BuildClient>) -> Self {
        Self { builds, client }
    }

    /// Cancel every queued build of `family` numbered below `number`.
    async fn cancel_older(&self, siblings: &[Arc<Build>], number: u64) -> Result<()> {
        for older in siblings
            .iter()
            .filter(|b| is_queued(b) && b.build_number() < number)
        {
            cancel(&*self.client, older).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RunPolicy for SerialLatestOnlyPolicy {
    fn handles(&self, kind: RunPolicyKind) -> bool {
        kind == RunPolicyKind::SerialLatestOnly
    }

    async fn is_runnable(&self, build: &Build) -> Result<bool> {
        let Some(family) = build.family() else {
            return Ok(true);
        };
        let number = build.build_number();
        let siblings = siblings(&*self.builds, build, family);
        self.cancel_older(&siblings, number).await?;

        let blocked = siblings
            .iter()
            .any(|b| is_active(b) || (is_queued(b) && b.build_number() > number));
        Ok(!blocked)
    }

    async fn on_complete(&self, build: &Build) -> Result<()> {
        let Some(family) = build.family() else {
            return Ok(());
        };
        let siblings = siblings(&*self.builds, build, family);
        let Some(latest) = siblings.iter().rev().find(|b| is_queued(b)) else {
            return Ok(());
        };
        self.cancel_older(&siblings, latest.build_number()).await?;
        accept(&*self.client, latest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBuildClient, family_build};
    use buildrun_core::{BuildPhase, ObjectCache, ObjectKey};
    use kube::ResourceExt;

    fn policy(existing: Vec<Build>) -> (SerialLatestOnlyPolicy, Arc<FakeBuildClient>) {
        let builds = Arc::new(ObjectCache::<Build>::new());
        for build in existing {
            builds.apply(build);
        }
        let client = Arc::new(FakeBuildClient::new(builds.clone()));
        (SerialLatestOnlyPolicy::new(builds, client.clone()), client)
    }

    #[tokio::test]
    async fn test_newest_build_cancels_older_queued() {
        let (policy, client) = policy(vec![
            family_build("app", 1, BuildPhase::New),
            family_build("app", 2, BuildPhase::New),
            family_build("app", 3, BuildPhase::New),
        ]);
        let runnable = policy
            .is_runnable(&family_build("app", 3, BuildPhase::New))
            .await
            .unwrap();
        assert!(runnable);

        let cancelled: Vec<_> = client.patches().into_iter().map(|(key, _)| key).collect();
        assert_eq!(
            cancelled,
            vec![ObjectKey::new("builds", "app-1"), ObjectKey::new("builds", "app-2")]
        );
        assert!(client.build("app-1").unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_older_build_waits_for_newer() {
        let (policy, _) = policy(vec![
            family_build("app", 1, BuildPhase::New),
            family_build("app", 2, BuildPhase::New),
        ]);
        assert!(!policy.is_runnable(&family_build("app", 1, BuildPhase::New)).await.unwrap());
    }

    #[tokio::test]
    async fn test_running_sibling_blocks() {
        let (policy, _) = policy(vec![
            family_build("app", 1, BuildPhase::Running),
            family_build("app", 2, BuildPhase::New),
        ]);
        assert!(!policy.is_runnable(&family_build("app", 2, BuildPhase::New)).await.unwrap());
    }

    #[tokio::test]
    async fn test_completion_admits_latest_only() {
        let (policy, client) = policy(vec![
            family_build("app", 1, BuildPhase::Complete),
            family_build("app", 2, BuildPhase::New),
            family_build("app", 3, BuildPhase::New),
        ]);
        policy
            .on_complete(&family_build("app", 1, BuildPhase::Complete))
            .await
            .unwrap();

        assert!(client.build("app-2").unwrap().is_cancelled());
        let latest = client.build("app-3").unwrap();
        assert!(!latest.is_cancelled());
        assert!(latest.annotations().contains_key(buildrun_core::build::BUILD_ACCEPTED_ANNOTATION));
    }
}
