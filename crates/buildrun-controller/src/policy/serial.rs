//! The `Serial` run policy.

use std::sync::Arc;

use async_trait::async_trait;
use buildrun_core::client::{BuildClient, Lister};
use buildrun_core::policy::{RunPolicy, RunPolicyKind};
use buildrun_core::{Build, Result};

use super::{accept, is_active, is_queued, siblings};

/// Builds of a family run one at a time, lowest build number first.
pub struct SerialPolicy {
    builds: Arc<dyn Lister<Build>>,
    client: Arc<dyn BuildClient>,
}

impl SerialPolicy {
    pub fn new(builds: Arc<dyn Lister<Build>>, client: Arc<dyn BuildClient>) -> Self {
        Self { builds, client }
    }
}

#[async_trait]
impl RunPolicy for SerialPolicy {
    fn handles(&self, kind: RunPolicyKind) -> bool {
        kind == RunPolicyKind::Serial
    }

    async fn is_runnable(&self, build: &Build) -> Result<bool> {
        let Some(family) = build.family() else {
            return Ok(true);
        };
        let number = build.build_number();
        let blocked = siblings(&*self.builds, build, family)
            .iter()
            .any(|b| is_active(b) || (is_queued(b) && b.build_number() < number));
        Ok(!blocked)
    }

    async fn on_complete(&self, build: &Build) -> Result<()> {
        let Some(family) = build.family() else {
            return Ok(());
        };
        let siblings = siblings(&*self.builds, build, family);
        match siblings.iter().find(|b| is_queued(b)) {
            Some(next) => accept(&*self.client, next).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBuildClient, family_build, new_build};
    use buildrun_core::build::BUILD_ACCEPTED_ANNOTATION;
    use buildrun_core::{BuildPhase, ObjectCache, ObjectKey};

    fn policy(existing: Vec<Build>) -> (SerialPolicy, Arc<FakeBuildClient>) {
        let builds = Arc::new(ObjectCache::<Build>::new());
        for build in existing {
            builds.apply(build);
        }
        let client = Arc::new(FakeBuildClient::new(builds.clone()));
        (SerialPolicy::new(builds, client.clone()), client)
    }

    #[tokio::test]
    async fn test_build_without_family_is_runnable() {
        let (policy, _) = policy(vec![]);
        assert!(policy.is_runnable(&new_build("adhoc")).await.unwrap());
    }

    #[tokio::test]
    async fn test_lowest_queued_build_runs_first() {
        let (policy, _) = policy(vec![
            family_build("app", 1, BuildPhase::Complete),
            family_build("app", 2, BuildPhase::New),
            family_build("app", 3, BuildPhase::New),
        ]);
        assert!(policy.is_runnable(&family_build("app", 2, BuildPhase::New)).await.unwrap());
        assert!(!policy.is_runnable(&family_build("app", 3, BuildPhase::New)).await.unwrap());
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
    async fn test_cancelled_sibling_does_not_block() {
        let mut cancelled = family_build("app", 1, BuildPhase::New);
        cancelled.status.as_mut().unwrap().cancelled = true;
        let (policy, _) = policy(vec![cancelled, family_build("app", 2, BuildPhase::New)]);
        assert!(policy.is_runnable(&family_build("app", 2, BuildPhase::New)).await.unwrap());
    }

    #[tokio::test]
    async fn test_completion_admits_next_build() {
        let (policy, client) = policy(vec![
            family_build("app", 1, BuildPhase::Complete),
            family_build("app", 3, BuildPhase::New),
            family_build("app", 2, BuildPhase::New),
        ]);
        policy
            .on_complete(&family_build("app", 1, BuildPhase::Complete))
            .await
            .unwrap();

        let patches = client.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, ObjectKey::new("builds", "app-2"));
        assert!(
            patches[0].1["metadata"]["annotations"][BUILD_ACCEPTED_ANNOTATION].is_string()
        );
    }

    #[tokio::test]
    async fn test_completion_with_empty_queue() {
        let (policy, client) = policy(vec![family_build("app", 1, BuildPhase::Complete)]);
        policy
            .on_complete(&family_build("app", 1, BuildPhase::Complete))
            .await
            .unwrap();
        assert!(client.patches().is_empty());
    }
}
