//! Run policies: when may a build of a family start, and who goes next once
//! one finishes.

mod parallel;
mod serial;
mod serial_latest_only;

use std::collections::BTreeMap;
use std::sync::Arc;

use buildrun_core::build::{BUILD_ACCEPTED_ANNOTATION, BUILD_CONFIG_LABEL};
use buildrun_core::client::{BuildClient, Lister};
use buildrun_core::policy::RunPolicy;
use buildrun_core::{Build, BuildPhase, Result};
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

pub use parallel::ParallelPolicy;
pub use serial::SerialPolicy;
pub use serial_latest_only::SerialLatestOnlyPolicy;

/// The configured run policies, looked up by the kind a build requests.
pub struct RunPolicies {
    policies: Vec<Arc<dyn RunPolicy>>,
}

impl RunPolicies {
    pub fn new(policies: Vec<Arc<dyn RunPolicy>>) -> Self {
        Self { policies }
    }

    /// Parallel, Serial and SerialLatestOnly, backed by the build cache.
    pub fn defaults(builds: Arc<dyn Lister<Build>>, client: Arc<dyn BuildClient>) -> Self {
        Self::new(vec![
            Arc::new(ParallelPolicy),
            Arc::new(SerialPolicy::new(builds.clone(), client.clone())),
            Arc::new(SerialLatestOnlyPolicy::new(builds, client)),
        ])
    }

    pub fn for_build(&self, build: &Build) -> Option<&Arc<dyn RunPolicy>> {
        let kind = build.run_policy();
        self.policies.iter().find(|p| p.handles(kind))
    }
}

/// Other builds of the same family, ordered by build number.
fn siblings(builds: &dyn Lister<Build>, build: &Build, family: &str) -> Vec<Arc<Build>> {
    let namespace = build.namespace().unwrap_or_default();
    let selector = BTreeMap::from([(BUILD_CONFIG_LABEL.to_string(), family.to_string())]);
    let mut siblings: Vec<_> = builds
        .list(&namespace, &selector)
        .into_iter()
        .filter(|b| b.name_any() != build.name_any())
        .collect();
    siblings.sort_by_key(|b| b.build_number());
    siblings
}

fn is_active(build: &Build) -> bool {
    matches!(build.phase(), BuildPhase::Pending | BuildPhase::Running)
}

/// Waiting to be admitted.
fn is_queued(build: &Build) -> bool {
    build.phase() == BuildPhase::New && !build.is_cancelled()
}

/// Touch a queued build so its informer update puts it back on the queue.
async fn accept(client: &dyn BuildClient, build: &Build) -> Result<()> {
    debug!(build = %build.key(), "Admitting next build");
    let patch = json!({
        "metadata": {
            "annotations": { BUILD_ACCEPTED_ANNOTATION: uuid::Uuid::now_v7().to_string() }
        }
    });
    client
        .patch(&build.namespace().unwrap_or_default(), &build.name_any(), &patch)
        .await?;
    Ok(())
}

async fn cancel(client: &dyn BuildClient, build: &Build) -> Result<()> {
    debug!(build = %build.key(), "Cancelling superseded build");
    let patch = json!({ "status": { "cancelled": true } });
    client
        .patch(&build.namespace().unwrap_or_default(), &build.name_any(), &patch)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBuildClient, family_build, new_build};
    use buildrun_core::ObjectCache;
    use buildrun_core::build::BUILD_RUN_POLICY_LABEL;
    use buildrun_core::policy::RunPolicyKind;

    fn policies() -> RunPolicies {
        let builds = Arc::new(ObjectCache::<Build>::new());
        let client = Arc::new(FakeBuildClient::new(builds.clone()));
        RunPolicies::defaults(builds, client)
    }

    #[test]
    fn test_lookup_by_label() {
        let policies = policies();
        let mut build = new_build("app-1");
        assert!(policies.for_build(&build).unwrap().handles(RunPolicyKind::Serial));

        build
            .labels_mut()
            .insert(BUILD_RUN_POLICY_LABEL.into(), "SerialLatestOnly".into());
        assert!(
            policies
                .for_build(&build)
                .unwrap()
                .handles(RunPolicyKind::SerialLatestOnly)
        );
    }

    #[test]
    fn test_no_policy_for_kind() {
        let policies = RunPolicies::new(vec![Arc::new(ParallelPolicy)]);
        assert!(policies.for_build(&new_build("app-1")).is_none());
    }

    #[test]
    fn test_siblings_exclude_self_and_other_families() {
        let builds = ObjectCache::<Build>::new();
        builds.apply(family_build("app", 3, BuildPhase::New));
        builds.apply(family_build("app", 1, BuildPhase::Complete));
        builds.apply(family_build("app", 2, BuildPhase::Running));
        builds.apply(family_build("other", 1, BuildPhase::Running));

        let me = family_build("app", 2, BuildPhase::Running);
        let names: Vec<_> = siblings(&builds, &me, "app")
            .iter()
            .map(|b| b.name_any())
            .collect();
        assert_eq!(names, vec!["app-1", "app-3"]);
    }
}
