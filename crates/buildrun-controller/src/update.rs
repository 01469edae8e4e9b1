//! Status delta for one reconciliation pass.

use buildrun_core::build::BUILD_POD_NAME_ANNOTATION;
use buildrun_core::{Build, BuildPhase, Result, StatusReason};
use chrono::{DateTime, TimeDelta, Utc};
use kube::ResourceExt;
use serde_json::{Map, Value};

/// Fields a reconciliation pass wants to change. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildUpdate {
    pub phase: Option<BuildPhase>,
    /// `Some(None)` clears the reason.
    pub reason: Option<Option<StatusReason>>,
    pub message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub duration: Option<TimeDelta>,
    pub output_ref: Option<String>,
    pub pod_name_annotation: Option<String>,
    pub push_secret: Option<String>,
    pub log_snippet: Option<String>,
}

impl BuildUpdate {
    /// Move to `phase` with the given reason and its fixed message. A `None`
    /// reason clears any previous reason and message.
    pub fn transition(phase: BuildPhase, reason: Option<StatusReason>) -> Self {
        Self {
            phase: Some(phase),
            reason: Some(reason),
            message: Some(reason.map(|r| r.message().to_string()).unwrap_or_default()),
            ..Default::default()
        }
    }

    /// Record a reason without changing phase.
    pub fn set_reason(&mut self, reason: StatusReason) {
        self.reason = Some(Some(reason));
        self.message = Some(reason.message().to_string());
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Write every set field onto `build`.
    pub fn apply(&self, build: &mut Build) {
        if let Some(name) = &self.pod_name_annotation {
            build
                .annotations_mut()
                .insert(BUILD_POD_NAME_ANNOTATION.to_string(), name.clone());
        }
        if let Some(secret) = &self.push_secret {
            build.spec.output.push_secret = Some(secret.clone());
        }

        let status = build.status.get_or_insert_with(Default::default);
        if let Some(phase) = self.phase {
            status.phase = phase;
        }
        if let Some(reason) = self.reason {
            status.reason = reason;
        }
        if let Some(message) = &self.message {
            status.message = message.clone();
        }
        if let Some(start) = self.start_time {
            status.start_timestamp = Some(start);
        }
        if let Some(completion) = self.completion_time {
            status.completion_timestamp = Some(completion);
        }
        if let Some(duration) = self.duration {
            status.duration_seconds = Some(duration.num_seconds());
        }
        if let Some(output) = &self.output_ref {
            status.output_docker_image_reference = Some(output.clone());
        }
        if let Some(snippet) = &self.log_snippet {
            status.log_snippet = Some(snippet.clone());
        }
    }
}

/// JSON merge patch turning `old` into `new`. Empty when they are equal.
pub fn create_build_patch(old: &Build, new: &Build) -> Result<Value> {
    let old = serde_json::to_value(old)?;
    let new = serde_json::to_value(new)?;
    Ok(merge_diff(&old, &new).unwrap_or_else(|| Value::Object(Map::new())))
}

pub fn is_empty_patch(patch: &Value) -> bool {
    patch.as_object().is_some_and(Map::is_empty)
}

fn merge_diff(old: &Value, new: &Value) -> Option<Value> {
    if old == new {
        return None;
    }
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, value) in new {
                match old.get(key) {
                    Some(previous) => {
                        if let Some(diff) = merge_diff(previous, value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Some(Value::Object(patch))
        }
        _ => Some(new.clone()),
    }
}
