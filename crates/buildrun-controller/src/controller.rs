//! The build controller: reconciles one build at a time against its pod.

use std::collections::BTreeMap;
use std::sync::Arc;

use buildrun_config::ControllerConfig;
use buildrun_core::build::{
    BUILD_CANCELLED_EVENT, BUILD_COMPLETED_EVENT, BUILD_FAILED_EVENT, BUILD_STARTED_EVENT,
    FAILED_CREATE_EVENT, INVALID_OUTPUT_EVENT,
};
use buildrun_core::client::{
    BuildClient, EventRecorder, EventType, Lister, PodAdmission, PodClient,
};
use buildrun_core::pod::build_key_for_pod;
use buildrun_core::{Build, BuildPhase, Error, ImageStream, ObjectKey, Result, StatusReason};
use buildrun_executor::{BuildPodStrategy, ResourceHandler};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::completion::CompletionNotifier;
use crate::phase::{
    log_snippet, pod_phase_update, pod_predates_build, set_completion_data, should_cancel,
    should_ignore,
};
use crate::policy::RunPolicies;
use crate::queue::WorkQueue;
use crate::resolve::{
    ResolveError, output_stream_key, resolve_output, resolve_strategy_images,
    strategy_stream_keys,
};
use crate::trigger::ResourceTriggerIndex;
use crate::update::{BuildUpdate, create_build_patch, is_empty_patch};

const DOCKERCFG_SECRET_TYPE: &str = "kubernetes.io/dockercfg";
const DOCKERCONFIGJSON_SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";
const SERVICE_ACCOUNT_ANNOTATION: &str = "kubernetes.io/service-account.name";

/// Collaborators the controller is wired to.
pub struct BuildControllerParams {
    pub builds: Arc<dyn Lister<Build>>,
    pub pods: Arc<dyn Lister<Pod>>,
    pub secrets: Arc<dyn Lister<Secret>>,
    pub image_streams: Arc<dyn Lister<ImageStream>>,
    pub build_client: Arc<dyn BuildClient>,
    pub pod_client: Arc<dyn PodClient>,
    pub recorder: Arc<dyn EventRecorder>,
    pub pod_strategy: Arc<dyn BuildPodStrategy>,
    pub admission: Arc<dyn PodAdmission>,
    pub run_policies: Arc<RunPolicies>,
    /// Service account whose push secret is used when a build names none.
    pub default_service_account: String,
}

pub struct BuildController {
    builds: Arc<dyn Lister<Build>>,
    pods: Arc<dyn Lister<Pod>>,
    secrets: Arc<dyn Lister<Secret>>,
    image_streams: Arc<dyn Lister<ImageStream>>,
    build_client: Arc<dyn BuildClient>,
    pod_client: Arc<dyn PodClient>,
    recorder: Arc<dyn EventRecorder>,
    pod_strategy: Arc<dyn BuildPodStrategy>,
    admission: Arc<dyn PodAdmission>,
    run_policies: Arc<RunPolicies>,
    completion: CompletionNotifier,
    queue: WorkQueue<ObjectKey>,
    triggers: ResourceTriggerIndex,
    default_service_account: String,
    max_retries: u32,
}

/// What a phase handler decided: a status change to persist, and an error
/// to report after it has been persisted.
#[derive(Debug, Default)]
struct Outcome {
    update: Option<BuildUpdate>,
    error: Option<Error>,
}

impl Outcome {
    fn none() -> Self {
        Self::default()
    }

    fn update(update: BuildUpdate) -> Self {
        Self {
            update: Some(update),
            error: None,
        }
    }

    fn reason(reason: StatusReason) -> Self {
        let mut update = BuildUpdate::default();
        update.set_reason(reason);
        Self::update(update)
    }

    fn with_error(mut self, error: Error) -> Self {
        self.error = Some(error);
        self
    }
}

impl From<Option<BuildUpdate>> for Outcome {
    fn from(update: Option<BuildUpdate>) -> Self {
        Self {
            update,
            error: None,
        }
    }
}

impl BuildController {
    pub fn new(params: BuildControllerParams, config: &ControllerConfig) -> Self {
        Self {
            completion: CompletionNotifier::new(params.run_policies.clone()),
            builds: params.builds,
            pods: params.pods,
            secrets: params.secrets,
            image_streams: params.image_streams,
            build_client: params.build_client,
            pod_client: params.pod_client,
            recorder: params.recorder,
            pod_strategy: params.pod_strategy,
            admission: params.admission,
            run_policies: params.run_policies,
            queue: WorkQueue::new(config.base_delay, config.max_delay),
            triggers: ResourceTriggerIndex::new(),
            default_service_account: params.default_service_account,
            max_retries: config.max_retries,
        }
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    pub fn triggers(&self) -> &ResourceTriggerIndex {
        &self.triggers
    }

    /// Whether every cache the controller reads from has loaded.
    pub fn caches_synced(&self) -> bool {
        self.builds.has_synced()
            && self.pods.has_synced()
            && self.secrets.has_synced()
            && self.image_streams.has_synced()
    }

    pub fn enqueue(&self, key: ObjectKey) {
        self.queue.add(key);
    }

    /// Take one key off the queue and reconcile it. Returns `false` once the
    /// queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let result = self.sync_build(&key).await;
        self.handle_error(&key, result);
        self.queue.done(key);
        true
    }

    /// Reconcile the build stored under `key`. Deleted builds are a no-op.
    pub async fn sync_build(&self, key: &ObjectKey) -> Result<()> {
        let Some(build) = self.builds.get(&key.namespace, &key.name) else {
            debug!(build = %key, "Build no longer exists");
            return Ok(());
        };
        self.handle_build(&build).await
    }

    fn handle_error(&self, key: &ObjectKey, result: Result<()>) {
        let Err(e) = result else {
            self.queue.forget(key);
            return;
        };
        if e.is_fatal() {
            warn!(build = %key, error = %e, "Will not retry fatal error");
            self.queue.forget(key);
            return;
        }
        let requeues = self.queue.num_requeues(key);
        if requeues < self.max_retries {
            debug!(build = %key, error = %e, requeues, "Failed to handle build, retrying");
            self.queue.add_rate_limited(key.clone());
            return;
        }
        warn!(build = %key, error = %e, requeues, "Giving up on build");
        self.queue.forget(key);
    }

    /// One reconciliation pass over a build.
    pub async fn handle_build(&self, build: &Build) -> Result<()> {
        if should_ignore(build) {
            debug!(build = %build.describe(), "Ignoring build");
            return Ok(());
        }
        debug!(build = %build.describe(), "Handling build");

        let namespace = build.namespace().unwrap_or_default();
        let mut pod = self.pods.get(&namespace, &build.pod_name());
        let cancel = should_cancel(build);
        let active = matches!(build.phase(), BuildPhase::Pending | BuildPhase::Running);
        if pod.is_none() && active && !cancel {
            pod = self.find_missing_pod(build).await.map(Arc::new);
        }
        let pod = pod.as_deref();

        let outcome = if cancel {
            self.cancel_build(build).await?
        } else {
            match build.phase() {
                BuildPhase::New => self.handle_new_build(build, pod).await?,
                BuildPhase::Pending | BuildPhase::Running => self.handle_active_build(build, pod),
                _ => self.handle_completed_build(build, pod),
            }
        };

        let update_result = match outcome.update {
            Some(update) if !update.is_empty() => self.update_build(build, update, pod).await,
            _ => Ok(()),
        };
        match outcome.error {
            Some(e) => Err(e),
            None => update_result,
        }
    }

    async fn handle_new_build(&self, build: &Build, pod: Option<&Pod>) -> Result<Outcome> {
        if let Some(pod) = pod {
            if pod_predates_build(pod, build) {
                return Ok(Outcome::update(BuildUpdate::transition(
                    BuildPhase::Error,
                    Some(StatusReason::BuildPodExists),
                )));
            }
            return Ok(self.handle_active_build(build, Some(pod)));
        }

        let policy = self.run_policies.for_build(build).ok_or_else(|| {
            Error::Internal(format!(
                "no run policy handles {} ({})",
                build.key(),
                build.run_policy()
            ))
        })?;
        if !policy.is_runnable(build).await? {
            debug!(build = %build.key(), policy = %build.run_policy(), "Build is not runnable yet");
            return Ok(Outcome::none());
        }

        self.create_build_pod(build).await
    }

    async fn create_build_pod(&self, build: &Build) -> Result<Outcome> {
        let key = build.key();

        let stream = match output_stream_key(build) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(build = %key, error = %e, "Build output cannot be resolved");
                return Ok(Outcome::reason(StatusReason::InvalidOutputReference)
                    .with_error(Error::Fatal(e.to_string())));
            }
        };
        if let Some(stream) = &stream {
            self.triggers.add(key.clone(), stream.clone());
        }
        let output_ref = match resolve_output(build, &*self.image_streams) {
            Ok(output_ref) => output_ref,
            Err(ResolveError::NoRegistry(stream)) => {
                self.recorder
                    .event(
                        build,
                        EventType::Warning,
                        INVALID_OUTPUT_EVENT,
                        format!(
                            "Output image stream {stream} has no docker image repository; \
                             waiting for an integrated registry"
                        ),
                    )
                    .await;
                return Ok(Outcome::reason(StatusReason::InvalidOutputReference));
            }
            Err(e) => {
                debug!(build = %key, error = %e, "Output not resolvable yet");
                return Ok(Outcome::reason(StatusReason::InvalidOutputReference));
            }
        };
        if let Some(stream) = &stream {
            self.triggers.remove(&key, stream);
        }

        let image_streams = match strategy_stream_keys(build) {
            Ok(streams) => streams,
            Err(e) => {
                warn!(build = %key, error = %e, "Build strategy image cannot be resolved");
                return Ok(Outcome::reason(StatusReason::InvalidImageReference)
                    .with_error(Error::Fatal(e.to_string())));
            }
        };
        for stream in &image_streams {
            self.triggers.add(key.clone(), stream.clone());
        }
        let mut spec_build = build.clone();
        let namespace = build.namespace().unwrap_or_default();
        if let Err(e) =
            resolve_strategy_images(&mut spec_build.spec.strategy, &namespace, &*self.image_streams)
        {
            debug!(build = %key, error = %e, "Strategy image not resolvable yet");
            return Ok(Outcome::reason(StatusReason::InvalidImageReference));
        }
        for stream in &image_streams {
            self.triggers.remove(&key, stream);
        }

        let push_secret = match (&build.spec.output.to, &build.spec.output.push_secret) {
            (Some(_), None) => self.find_push_secret(build),
            _ => None,
        };
        if let Some(secret) = &push_secret {
            spec_build.spec.output.push_secret = Some(secret.clone());
        }
        let status = spec_build.status.get_or_insert_with(Default::default);
        status.reason = None;
        status.message.clear();
        status.output_docker_image_reference = output_ref.clone();

        let mut pod = match self.pod_strategy.create_build_pod(&spec_build) {
            Ok(pod) => pod,
            Err(e) => {
                warn!(build = %key, error = %e, "Failed to create build pod spec");
                return Ok(Outcome::reason(StatusReason::CannotCreateBuildPodSpec)
                    .with_error(e.into()));
            }
        };
        if let Err(e) = self
            .admission
            .apply_defaults(&mut pod)
            .and_then(|()| self.admission.apply_overrides(&mut pod))
        {
            warn!(build = %key, error = %e, "Failed to apply build defaults and overrides");
            return Ok(Outcome::reason(StatusReason::CannotCreateBuildPodSpec));
        }

        let pod_name = pod.name_any();
        info!(build = %key, pod = %pod_name, "Creating build pod");
        match self.pod_client.create(&namespace, &pod).await {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {
                self.recorder
                    .event(
                        build,
                        EventType::Warning,
                        FAILED_CREATE_EVENT,
                        format!("Pod already exists: {namespace}/{pod_name}"),
                    )
                    .await;
                let existing = self.pod_client.get(&namespace, &pod_name).await?;
                if pod_predates_build(&existing, build) {
                    return Ok(Outcome::update(BuildUpdate::transition(
                        BuildPhase::Error,
                        Some(StatusReason::BuildPodExists),
                    )));
                }
                debug!(build = %key, pod = %pod_name, "Build pod already created");
                return Ok(Outcome::none());
            }
            Err(e) => {
                self.recorder
                    .event(
                        build,
                        EventType::Warning,
                        FAILED_CREATE_EVENT,
                        format!("Error creating build pod {namespace}/{pod_name}: {e}"),
                    )
                    .await;
                return Ok(Outcome::reason(StatusReason::CannotCreateBuildPod).with_error(e));
            }
        }

        let mut update = BuildUpdate::transition(BuildPhase::Pending, None);
        update.pod_name_annotation = Some(pod_name);
        update.output_ref = output_ref;
        update.push_secret = push_secret;
        Ok(Outcome::update(update))
    }

    /// Pick the first dockercfg secret of the build's service account.
    fn find_push_secret(&self, build: &Build) -> Option<String> {
        let service_account = build
            .spec
            .service_account
            .as_deref()
            .unwrap_or(&self.default_service_account);
        self.secrets
            .list(&build.namespace().unwrap_or_default(), &BTreeMap::new())
            .iter()
            .filter(|s| {
                matches!(
                    s.type_.as_deref(),
                    Some(DOCKERCFG_SECRET_TYPE | DOCKERCONFIGJSON_SECRET_TYPE)
                )
            })
            .filter(|s| {
                s.annotations().get(SERVICE_ACCOUNT_ANNOTATION).map(String::as_str)
                    == Some(service_account)
            })
            .map(|s| s.name_any())
            .min()
    }

    fn push_secret_missing(&self, build: &Build) -> bool {
        let Some(secret) = build.spec.output.push_secret.as_deref() else {
            return false;
        };
        self.secrets
            .get(&build.namespace().unwrap_or_default(), secret)
            .is_none()
    }

    fn handle_active_build(&self, build: &Build, pod: Option<&Pod>) -> Outcome {
        let Some(pod) = pod else {
            info!(build = %build.key(), "Build pod is gone");
            return Outcome::update(BuildUpdate::transition(
                BuildPhase::Error,
                Some(StatusReason::BuildPodDeleted),
            ));
        };
        pod_phase_update(build, pod, self.push_secret_missing(build)).into()
    }

    fn handle_completed_build(&self, build: &Build, pod: Option<&Pod>) -> Outcome {
        let mut update = BuildUpdate::default();
        if build.completion_timestamp().is_none() {
            set_completion_data(build, pod, &mut update, Utc::now());
        } else if let Some(snippet) = pod.and_then(log_snippet) {
            update.log_snippet = Some(snippet);
        }
        Outcome::update(update)
    }

    async fn cancel_build(&self, build: &Build) -> Result<Outcome> {
        let namespace = build.namespace().unwrap_or_default();
        info!(build = %build.key(), "Cancelling build");
        match self.pod_client.delete(&namespace, &build.pod_name()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(Outcome::update(BuildUpdate::transition(
            BuildPhase::Cancelled,
            Some(StatusReason::CancelledBuild),
        )))
    }

    /// One last uncached lookup before declaring the pod gone.
    async fn find_missing_pod(&self, build: &Build) -> Option<Pod> {
        let namespace = build.namespace().unwrap_or_default();
        match self.pod_client.get(&namespace, &build.pod_name()).await {
            Ok(pod) => {
                debug!(build = %build.key(), "Found missing pod with a direct lookup");
                Some(pod)
            }
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(build = %build.key(), error = %e, "Direct pod lookup failed");
                None
            }
        }
    }

    /// Validate, persist and announce a status change.
    async fn update_build(
        &self,
        build: &Build,
        mut update: BuildUpdate,
        pod: Option<&Pod>,
    ) -> Result<()> {
        let current = build.phase();
        let transition = match update.phase {
            Some(phase) if phase != current => Some(phase),
            // Phase set to Failed outside the controller, completion never recorded.
            _ if current == BuildPhase::Failed && update.completion_time.is_some() => {
                Some(BuildPhase::Failed)
            }
            _ => None,
        };

        if let Some(to) = transition {
            update.phase = Some(to);
            if !current.can_transition_to(to) {
                return Err(Error::InvalidTransition {
                    build: build.key().to_string(),
                    from: current,
                    to,
                });
            }
            if to.is_terminal() {
                set_completion_data(build, pod, &mut update, Utc::now());
            }
            info!(
                build = %build.key(),
                from = %current,
                to = %to,
                reason = ?update.reason.flatten(),
                "Updating build phase"
            );
        }

        if update.pod_name_annotation.is_none() && !build.has_pod_name_annotation() {
            update.pod_name_annotation = pod.map(|p| p.name_any());
        }

        let patched = self.patch_build(build, &update).await?;

        let Some(to) = transition else {
            return Ok(());
        };
        let (namespace, name) = (patched.namespace().unwrap_or_default(), patched.name_any());
        let event = match to {
            BuildPhase::Running => Some((BUILD_STARTED_EVENT, "is now running")),
            BuildPhase::Cancelled => Some((BUILD_CANCELLED_EVENT, "was cancelled")),
            BuildPhase::Complete => Some((BUILD_COMPLETED_EVENT, "completed successfully")),
            BuildPhase::Failed | BuildPhase::Error => Some((BUILD_FAILED_EVENT, "failed")),
            BuildPhase::New | BuildPhase::Pending => None,
        };
        if let Some((reason, what)) = event {
            self.recorder
                .event(
                    &patched,
                    EventType::Normal,
                    reason,
                    format!("Build {namespace}/{name} {what}"),
                )
                .await;
        }
        if to.is_terminal() {
            self.completion.notify(&patched).await;
        }
        Ok(())
    }

    /// Apply `update` to a copy of `build` and send the difference. Nothing
    /// is sent when the update changes nothing.
    async fn patch_build(&self, build: &Build, update: &BuildUpdate) -> Result<Build> {
        let mut updated = build.clone();
        update.apply(&mut updated);
        let patch = create_build_patch(build, &updated)?;
        if is_empty_patch(&patch) {
            debug!(build = %build.key(), "Build already up to date");
            return Ok(updated);
        }
        debug!(build = %build.key(), %patch, "Patching build");
        self.build_client
            .patch(
                &build.namespace().unwrap_or_default(),
                &build.name_any(),
                &patch,
            )
            .await
    }
}

impl ResourceHandler<Build> for BuildController {
    fn on_apply(&self, _old: Option<Arc<Build>>, new: Arc<Build>) {
        self.enqueue(new.key());
    }

    fn on_delete(&self, obj: Arc<Build>) {
        self.triggers.forget(&obj.key());
    }
}

impl ResourceHandler<Pod> for BuildController {
    fn on_apply(&self, old: Option<Arc<Pod>>, new: Arc<Pod>) {
        // Adds are covered by the build they were created for; a relist
        // replays pods with an unchanged resource version.
        let Some(old) = old else {
            return;
        };
        if old.resource_version() == new.resource_version() {
            return;
        }
        if let Some(key) = build_key_for_pod(&new) {
            self.enqueue(key);
        }
    }

    fn on_delete(&self, obj: Arc<Pod>) {
        if let Some(key) = build_key_for_pod(&obj) {
            debug!(build = %key, pod = %obj.name_any(), "Build pod deleted");
            self.enqueue(key);
        }
    }
}

impl ResourceHandler<ImageStream> for BuildController {
    fn on_apply(&self, _old: Option<Arc<ImageStream>>, new: Arc<ImageStream>) {
        let stream = ObjectKey::of(&*new);
        for key in self.triggers.pop(&stream) {
            debug!(build = %key, stream = %stream, "Image stream changed, retrying build");
            self.enqueue(key);
        }
    }
}
