//! Phase decisions that only depend on a build and its pod.

use buildrun_core::{Build, BuildPhase, StatusReason};
use chrono::{DateTime, SubsecRound, Utc};
use k8s_openapi::api::core::v1::Pod;

use crate::update::BuildUpdate;

/// Lines of the build container's termination message kept in the snippet.
const MAX_EXCERPT_LINES: usize = 5;
const MAX_EXCERPT_LINE_LENGTH: usize = 120;

/// Builds the controller never acts on: pipeline builds, and terminal builds
/// whose completion data is already recorded.
pub fn should_ignore(build: &Build) -> bool {
    if build.is_pipeline() {
        return true;
    }
    if !build.phase().is_terminal() {
        return false;
    }
    match build.phase() {
        BuildPhase::Failed => build.completion_timestamp().is_some() && has_log_snippet(build),
        _ => build.completion_timestamp().is_some(),
    }
}

/// An active build whose cancellation flag is set.
pub fn should_cancel(build: &Build) -> bool {
    !build.phase().is_terminal() && build.is_cancelled()
}

fn has_log_snippet(build: &Build) -> bool {
    build
        .status
        .as_ref()
        .and_then(|s| s.log_snippet.as_deref())
        .is_some_and(|s| !s.is_empty())
}

/// Whether the pod was created before the build, i.e. belongs to an earlier
/// build of the same name.
pub fn pod_predates_build(pod: &Pod, build: &Build) -> bool {
    match (pod.metadata.creation_timestamp.as_ref(), build.created_at()) {
        (Some(pod_created), Some(build_created)) => pod_created.0 < build_created,
        _ => false,
    }
}

/// Maps the pod's phase onto the build. `None` when nothing changes.
pub fn pod_phase_update(
    build: &Build,
    pod: &Pod,
    push_secret_missing: bool,
) -> Option<BuildUpdate> {
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or_default();

    match phase {
        "Pending" => {
            let mut update = (build.phase() != BuildPhase::Pending)
                .then(|| BuildUpdate::transition(BuildPhase::Pending, None));
            if push_secret_missing && build.reason() != Some(StatusReason::MissingPushSecret) {
                update = Some(BuildUpdate::transition(
                    BuildPhase::Pending,
                    Some(StatusReason::MissingPushSecret),
                ));
            }
            update
        }
        "Running" => (build.phase() != BuildPhase::Running).then(|| {
            let mut update = BuildUpdate::transition(BuildPhase::Running, None);
            update.start_time = status.and_then(|s| s.start_time.as_ref()).map(|t| t.0);
            update
        }),
        "Succeeded" => {
            let containers = status
                .and_then(|s| s.container_statuses.as_deref())
                .unwrap_or_default();
            if containers.is_empty() {
                return Some(BuildUpdate::transition(
                    BuildPhase::Error,
                    Some(StatusReason::NoBuildContainerStatus),
                ));
            }
            let failed = containers.iter().any(|c| {
                c.state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                    .is_some_and(|t| t.exit_code != 0)
            });
            if failed {
                return Some(BuildUpdate::transition(
                    BuildPhase::Failed,
                    Some(StatusReason::FailedContainer),
                ));
            }
            (build.phase() != BuildPhase::Complete)
                .then(|| BuildUpdate::transition(BuildPhase::Complete, None))
        }
        "Failed" => (build.phase() != BuildPhase::Failed).then(|| {
            if pod.metadata.deletion_timestamp.is_some() {
                BuildUpdate::transition(BuildPhase::Error, Some(StatusReason::BuildPodDeleted))
            } else {
                BuildUpdate::transition(BuildPhase::Failed, Some(StatusReason::GenericBuildFailed))
            }
        }),
        _ => None,
    }
}

/// Fill completion time, duration and log snippet, plus the start time if
/// the build never recorded one.
pub fn set_completion_data(
    build: &Build,
    pod: Option<&Pod>,
    update: &mut BuildUpdate,
    now: DateTime<Utc>,
) {
    update.completion_time = Some(now);

    let start = match build.start_timestamp().or(update.start_time) {
        Some(start) => start,
        None => {
            let start = pod
                .and_then(|p| p.status.as_ref())
                .and_then(|s| s.start_time.as_ref())
                .map(|t| t.0)
                .unwrap_or(now);
            update.start_time = Some(start);
            start
        }
    };
    update.duration = Some(now.trunc_subsecs(0) - start.trunc_subsecs(0));

    if let Some(snippet) = pod.and_then(log_snippet) {
        update.log_snippet = Some(snippet);
    }
}

/// Tail of the first container's termination message.
pub fn log_snippet(pod: &Pod) -> Option<String> {
    let message = pod
        .status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .first()?
        .state
        .as_ref()?
        .terminated
        .as_ref()?
        .message
        .as_deref()?;
    if message.is_empty() {
        return None;
    }

    let lines: Vec<&str> = message.trim_end_matches('\n').split('\n').collect();
    let excerpt = &lines[lines.len().saturating_sub(MAX_EXCERPT_LINES)..];
    Some(
        excerpt
            .iter()
            .map(|line| elide(line))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

fn elide(line: &str) -> String {
    let len = line.chars().count();
    if len <= MAX_EXCERPT_LINE_LENGTH {
        return line.to_string();
    }
    let head: String = line.chars().take(58).collect();
    let tail: String = line.chars().skip(len - 59).collect();
    format!("{head}...{tail}")
}
