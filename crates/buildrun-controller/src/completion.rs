//! Completion hook run after a build reaches a terminal phase.

use std::sync::Arc;

use buildrun_core::Build;
use tracing::{debug, warn};

use crate::policy::RunPolicies;

/// Tells the build's run policy that it finished, so the family's next
/// build can be admitted. Best-effort: failures are only logged.
pub struct CompletionNotifier {
    policies: Arc<RunPolicies>,
}

impl CompletionNotifier {
    pub fn new(policies: Arc<RunPolicies>) -> Self {
        Self { policies }
    }

    pub async fn notify(&self, build: &Build) {
        let Some(policy) = self.policies.for_build(build) else {
            warn!(
                build = %build.key(),
                policy = %build.run_policy(),
                "No run policy handles completed build"
            );
            return;
        };
        debug!(build = %build.key(), phase = %build.phase(), "Build completed");
        if let Err(e) = policy.on_complete(build).await {
            warn!(build = %build.key(), error = %e, "Run policy completion hook failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePolicy, build_in_phase};
    use buildrun_core::BuildPhase;
    use buildrun_core::policy::RunPolicy;

    #[tokio::test]
    async fn test_notify_reaches_policy() {
        let policy = Arc::new(FakePolicy::new(true));
        let notifier = CompletionNotifier::new(Arc::new(RunPolicies::new(vec![
            policy.clone() as Arc<dyn RunPolicy>,
        ])));
        notifier.notify(&build_in_phase("app-1", BuildPhase::Complete)).await;
        assert_eq!(policy.completed(), vec!["app-1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_policy_is_tolerated() {
        let notifier = CompletionNotifier::new(Arc::new(RunPolicies::new(vec![])));
        notifier.notify(&build_in_phase("app-1", BuildPhase::Failed)).await;
    }
}
