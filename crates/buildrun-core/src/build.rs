//! The `Build` custom resource: one execution attempt of a build job.

use chrono::{DateTime, Utc};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{CustomResource, CustomResourceExt, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ObjectKey;
use crate::pod::build_pod_name;
use crate::policy::RunPolicyKind;

/// Annotation on a pod naming the build it runs.
pub const BUILD_ANNOTATION: &str = "buildrun.dev/build.name";
/// Label on a pod naming the build it runs.
pub const BUILD_LABEL: &str = "buildrun.dev/build.name";
/// Annotation on a build naming the pod running it.
pub const BUILD_POD_NAME_ANNOTATION: &str = "buildrun.dev/pod-name";
/// Label grouping builds produced from the same build config (the "family").
pub const BUILD_CONFIG_LABEL: &str = "buildrun.dev/config";
/// Annotation carrying the sequence number of a build within its family.
pub const BUILD_NUMBER_ANNOTATION: &str = "buildrun.dev/build-number";
/// Label selecting the run policy for a build.
pub const BUILD_RUN_POLICY_LABEL: &str = "buildrun.dev/run-policy";
/// Annotation bumped on a queued build when the build ahead of it finishes.
pub const BUILD_ACCEPTED_ANNOTATION: &str = "buildrun.dev/accepted";

/// Event reasons recorded against builds.
pub const BUILD_STARTED_EVENT: &str = "BuildStarted";
pub const BUILD_COMPLETED_EVENT: &str = "BuildCompleted";
pub const BUILD_FAILED_EVENT: &str = "BuildFailed";
pub const BUILD_CANCELLED_EVENT: &str = "BuildCancelled";
pub const FAILED_CREATE_EVENT: &str = "FailedCreate";
pub const INVALID_OUTPUT_EVENT: &str = "InvalidOutput";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "build.buildrun.dev",
    version = "v1",
    kind = "Build",
    plural = "builds",
    namespaced,
    status = "BuildStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// How the build is executed.
    pub strategy: BuildStrategy,

    /// Source to build from.
    #[serde(default)]
    pub source: BuildSource,

    /// Where the produced image is pushed.
    #[serde(default)]
    pub output: BuildOutput,

    /// Service account the build pod runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
}

/// Build strategy variants. Exactly one is set per build.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "type")]
pub enum BuildStrategy {
    /// Build an image from a Dockerfile.
    DirectImage(DirectImageStrategy),
    /// Inject source into a builder image.
    SourceToImage(SourceToImageStrategy),
    /// Run a user-supplied builder image.
    CustomExecutor(CustomExecutorStrategy),
    /// Handled by an external pipeline system, never by this controller.
    ExternalPipeline(ExternalPipelineStrategy),
}

impl BuildStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            BuildStrategy::DirectImage(_) => "DirectImage",
            BuildStrategy::SourceToImage(_) => "SourceToImage",
            BuildStrategy::CustomExecutor(_) => "CustomExecutor",
            BuildStrategy::ExternalPipeline(_) => "ExternalPipeline",
        }
    }

    /// Images the strategy runs or builds on top of.
    pub fn image_references(&self) -> Vec<&ImageReference> {
        match self {
            BuildStrategy::DirectImage(s) => s.from.iter().collect(),
            BuildStrategy::SourceToImage(s) => vec![&s.builder_image],
            BuildStrategy::CustomExecutor(s) => vec![&s.image],
            BuildStrategy::ExternalPipeline(_) => Vec::new(),
        }
    }

    pub fn image_references_mut(&mut self) -> Vec<&mut ImageReference> {
        match self {
            BuildStrategy::DirectImage(s) => s.from.iter_mut().collect(),
            BuildStrategy::SourceToImage(s) => vec![&mut s.builder_image],
            BuildStrategy::CustomExecutor(s) => vec![&mut s.image],
            BuildStrategy::ExternalPipeline(_) => Vec::new(),
        }
    }
}

/// An image consumed by a strategy. Stream references must be resolved to a
/// `DockerImage` before a pod can be built from them.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "kind")]
pub enum ImageReference {
    /// A pullable registry reference.
    DockerImage { name: String },
    /// `name:tag` in an image stream; resolves to the newest image of the tag.
    ImageStreamTag {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
    },
    /// `name@id` in an image stream; resolves to that exact image.
    ImageStreamImage {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
    },
}

impl Default for ImageReference {
    fn default() -> Self {
        ImageReference::DockerImage {
            name: String::new(),
        }
    }
}

impl ImageReference {
    pub fn docker(name: impl Into<String>) -> Self {
        ImageReference::DockerImage { name: name.into() }
    }

    /// The pull spec of a resolved, non-empty reference.
    pub fn pull_spec(&self) -> Option<&str> {
        match self {
            ImageReference::DockerImage { name } if !name.is_empty() => Some(name),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, name, namespace) = match self {
            ImageReference::DockerImage { name } => return f.write_str(name),
            ImageReference::ImageStreamTag { name, namespace } => ("ImageStreamTag", name, namespace),
            ImageReference::ImageStreamImage { name, namespace } => {
                ("ImageStreamImage", name, namespace)
            }
        };
        match namespace {
            Some(ns) => write!(f, "{kind} {ns}/{name}"),
            None => write!(f, "{kind} {name}"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DirectImageStrategy {
    /// Path of the Dockerfile relative to the context directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_path: Option<String>,
    /// Image replacing the FROM instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ImageReference>,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_args: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceToImageStrategy {
    /// Builder image that assembles the source.
    pub builder_image: ImageReference,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomExecutorStrategy {
    /// Image that performs the whole build.
    pub image: ImageReference,
    #[serde(default)]
    pub expose_docker_socket: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalPipelineStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_path: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_dir: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<OutputTarget>,
    /// Name of the secret used to push the output image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_secret: Option<String>,
}

/// Declared output of a build.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "kind")]
pub enum OutputTarget {
    /// A literal registry reference, used as-is.
    DockerImage { name: String },
    /// `name:tag` in an image stream, resolved through the stream's repository.
    ImageStreamTag {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
    },
    /// A whole image stream, resolved to its untagged repository.
    ImageStream {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
    },
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    #[serde(default)]
    pub phase: BuildPhase,

    /// Set by external actors to request cancellation.
    #[serde(default)]
    pub cancelled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StatusReason>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<DateTime<Utc>>,

    /// Wall-clock duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,

    /// Resolved, pushable reference of the output image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_docker_image_reference: Option<String>,

    /// Tail of the build container's termination message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_snippet: Option<String>,
}

/// Lifecycle phase of a build.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum BuildPhase {
    #[default]
    New,
    Pending,
    Running,
    Complete,
    Failed,
    Error,
    Cancelled,
}

impl BuildPhase {
    pub const ALL: [BuildPhase; 7] = [
        BuildPhase::New,
        BuildPhase::Pending,
        BuildPhase::Running,
        BuildPhase::Complete,
        BuildPhase::Failed,
        BuildPhase::Error,
        BuildPhase::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildPhase::Complete | BuildPhase::Failed | BuildPhase::Error | BuildPhase::Cancelled
        )
    }

    /// Phase transition table. Staying in the same phase is always allowed.
    pub fn can_transition_to(self, to: BuildPhase) -> bool {
        if self == to {
            return true;
        }
        match self {
            from if from.is_terminal() => false,
            BuildPhase::Pending => to != BuildPhase::New,
            BuildPhase::Running => !matches!(to, BuildPhase::New | BuildPhase::Pending),
            _ => true,
        }
    }
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildPhase::New => "New",
            BuildPhase::Pending => "Pending",
            BuildPhase::Running => "Running",
            BuildPhase::Complete => "Complete",
            BuildPhase::Failed => "Failed",
            BuildPhase::Error => "Error",
            BuildPhase::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Machine-readable reason for the current status of a build.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum StatusReason {
    CannotCreateBuildPodSpec,
    CannotCreateBuildPod,
    InvalidOutputReference,
    InvalidImageReference,
    BuildPodDeleted,
    MissingPushSecret,
    CancelledBuild,
    BuildPodExists,
    NoBuildContainerStatus,
    FailedContainer,
    GenericBuildFailed,
}

impl StatusReason {
    /// Human readable message recorded alongside the reason.
    pub fn message(self) -> &'static str {
        match self {
            StatusReason::CannotCreateBuildPodSpec => "Failed to create pod spec.",
            StatusReason::CannotCreateBuildPod => "Failed creating build pod.",
            StatusReason::InvalidOutputReference => "Output image could not be resolved.",
            StatusReason::InvalidImageReference => "Referenced image could not be resolved.",
            StatusReason::BuildPodDeleted => {
                "The pod for this build was deleted before the build completed."
            }
            StatusReason::MissingPushSecret => "Missing push secret.",
            StatusReason::CancelledBuild => "The build was cancelled by the user.",
            StatusReason::BuildPodExists => {
                "The pod for this build already exists and is older than the build."
            }
            StatusReason::NoBuildContainerStatus => {
                "The pod for this build has no container statuses indicating success or failure."
            }
            StatusReason::FailedContainer => {
                "The pod for this build has at least one container with a non-zero exit status."
            }
            StatusReason::GenericBuildFailed => "Generic Build failure - check logs for details.",
        }
    }
}

/// The `Build` CRD as installed. Status is served on the main resource so a
/// single merge patch can move spec annotations and status together.
pub fn build_crd() -> CustomResourceDefinition {
    let mut crd = Build::crd();
    for version in &mut crd.spec.versions {
        if let Some(subresources) = version.subresources.as_mut() {
            subresources.status = None;
        }
    }
    crd
}

impl Build {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(self)
    }

    pub fn phase(&self) -> BuildPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn reason(&self) -> Option<StatusReason> {
        self.status.as_ref().and_then(|s| s.reason)
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.cancelled)
    }

    pub fn completion_timestamp(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.completion_timestamp)
    }

    pub fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.start_timestamp)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.metadata.creation_timestamp.as_ref().map(|t| t.0)
    }

    /// Name of the pod that runs this build.
    pub fn pod_name(&self) -> String {
        build_pod_name(&self.name_any())
    }

    pub fn has_pod_name_annotation(&self) -> bool {
        self.annotations().contains_key(BUILD_POD_NAME_ANNOTATION)
    }

    /// The build config this build belongs to, if any.
    pub fn family(&self) -> Option<&str> {
        self.labels().get(BUILD_CONFIG_LABEL).map(String::as_str)
    }

    pub fn build_number(&self) -> u64 {
        self.annotations()
            .get(BUILD_NUMBER_ANNOTATION)
            .and_then(|n| n.parse().ok())
            .unwrap_or_default()
    }

    /// Run policy requested by the build; `Serial` when unset or unknown.
    pub fn run_policy(&self) -> RunPolicyKind {
        self.labels()
            .get(BUILD_RUN_POLICY_LABEL)
            .and_then(|p| p.parse().ok())
            .unwrap_or_default()
    }

    pub fn is_pipeline(&self) -> bool {
        matches!(self.spec.strategy, BuildStrategy::ExternalPipeline(_))
    }

    /// `namespace/name (phase)`, used in logs and errors.
    pub fn describe(&self) -> String {
        format!("{} ({})", self.key(), self.phase())
    }
}
