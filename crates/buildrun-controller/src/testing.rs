//! In-memory collaborators and object builders for controller tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use buildrun_config::{ControllerConfig, PodSettings, StrategyConfig};
use buildrun_core::build::{
    BUILD_ANNOTATION, BUILD_CONFIG_LABEL, BUILD_NUMBER_ANNOTATION, BuildOutput, BuildSource,
    DirectImageStrategy,
};
use buildrun_core::client::{BuildClient, EventRecorder, EventType, Lister, PodClient};
use buildrun_core::image::{ImageStreamSpec, ImageStreamStatus, NamedTagEventList, TagEvent};
use buildrun_core::policy::{RunPolicy, RunPolicyKind};
use buildrun_core::{
    Build, BuildPhase, BuildSpec, BuildStatus, BuildStrategy, Error, ImageStream, ObjectCache,
    ObjectKey, Result,
};
use buildrun_executor::{BuildAdmission, BuildPodFactory, BuildPodStrategy, StrategyError};
use chrono::{TimeDelta, Utc};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodStatus, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use serde_json::{Map, Value};

use crate::controller::{BuildController, BuildControllerParams};
use crate::policy::RunPolicies;

pub(crate) const NAMESPACE: &str = "builds";

/// A `New` DirectImage build created a minute ago.
pub(crate) fn new_build(name: &str) -> Build {
    let mut build = Build::new(
        name,
        BuildSpec {
            strategy: BuildStrategy::DirectImage(DirectImageStrategy::default()),
            source: BuildSource::default(),
            output: BuildOutput::default(),
            service_account: None,
        },
    );
    build.metadata.namespace = Some(NAMESPACE.into());
    build.metadata.creation_timestamp = Some(Time(Utc::now() - TimeDelta::seconds(60)));
    build.status = Some(BuildStatus::default());
    build
}

pub(crate) fn build_in_phase(name: &str, phase: BuildPhase) -> Build {
    let mut build = new_build(name);
    build.status = Some(BuildStatus {
        phase,
        ..Default::default()
    });
    build
}

/// Build `number` of `family`, named `<family>-<number>`.
pub(crate) fn family_build(family: &str, number: u64, phase: BuildPhase) -> Build {
    let mut build = build_in_phase(&format!("{family}-{number}"), phase);
    build
        .labels_mut()
        .insert(BUILD_CONFIG_LABEL.into(), family.into());
    build
        .annotations_mut()
        .insert(BUILD_NUMBER_ANNOTATION.into(), number.to_string());
    build
}

pub(crate) fn image_stream(namespace: &str, name: &str, repository: &str) -> ImageStream {
    let mut stream = ImageStream::new(name, ImageStreamSpec::default());
    stream.metadata.namespace = Some(namespace.into());
    stream.status = Some(ImageStreamStatus {
        docker_image_repository: repository.into(),
        ..Default::default()
    });
    stream
}

/// A stream whose `tag` points at image `id`.
pub(crate) fn tagged_image_stream(
    namespace: &str,
    name: &str,
    repository: &str,
    tag: &str,
    id: &str,
) -> ImageStream {
    let mut stream = image_stream(namespace, name, repository);
    if let Some(status) = stream.status.as_mut() {
        status.tags.push(NamedTagEventList {
            tag: tag.into(),
            items: vec![TagEvent {
                docker_image_reference: format!("{repository}:{tag}"),
                image: id.into(),
            }],
        });
    }
    stream
}

/// A dockercfg secret owned by `service_account`.
pub(crate) fn push_secret(namespace: &str, name: &str, service_account: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            annotations: Some(BTreeMap::from([(
                "kubernetes.io/service-account.name".to_string(),
                service_account.to_string(),
            )])),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockercfg".into()),
        ..Default::default()
    }
}

/// The build's pod in `phase`, with one terminated container per exit code.
pub(crate) fn pod_for(build: &Build, phase: &str, exit_codes: &[i32]) -> Pod {
    let statuses: Vec<ContainerStatus> = exit_codes
        .iter()
        .enumerate()
        .map(|(i, &exit_code)| ContainerStatus {
            name: format!("build-{i}"),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    Pod {
        metadata: ObjectMeta {
            name: Some(build.pod_name()),
            namespace: build.namespace(),
            creation_timestamp: Some(Time(Utc::now())),
            annotations: Some(BTreeMap::from([(
                BUILD_ANNOTATION.to_string(),
                build.name_any(),
            )])),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.into()),
            container_statuses: (!statuses.is_empty()).then_some(statuses),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// RFC 7386 merge of `patch` into `target`.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Applies merge patches to a build cache, standing in for the API server.
pub(crate) struct FakeBuildClient {
    builds: Arc<ObjectCache<Build>>,
    patches: Mutex<Vec<(ObjectKey, Value)>>,
}

impl FakeBuildClient {
    pub(crate) fn new(builds: Arc<ObjectCache<Build>>) -> Self {
        Self {
            builds,
            patches: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn patches(&self) -> Vec<(ObjectKey, Value)> {
        self.patches.lock().unwrap().clone()
    }

    pub(crate) fn build(&self, name: &str) -> Option<Arc<Build>> {
        self.builds.get(NAMESPACE, name)
    }
}

#[async_trait]
impl BuildClient for FakeBuildClient {
    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<Build> {
        let current = self
            .builds
            .get(namespace, name)
            .ok_or_else(|| Error::NotFound(format!("build {namespace}/{name}")))?;
        let mut value = serde_json::to_value(&*current)?;
        merge_patch(&mut value, patch);
        let patched: Build = serde_json::from_value(value)?;

        self.patches
            .lock()
            .unwrap()
            .push((ObjectKey::new(namespace, name), patch.clone()));
        self.builds.apply(patched.clone());
        Ok(patched)
    }
}

/// Pod store with call recording.
#[derive(Default)]
pub(crate) struct FakePodClient {
    pods: Mutex<HashMap<String, Pod>>,
    created: Mutex<Vec<Pod>>,
    deleted: Mutex<Vec<String>>,
    gets: Mutex<Vec<String>>,
    create_error: Mutex<Option<Error>>,
}

impl FakePodClient {
    /// Put a pod in the store without recording a create.
    pub(crate) fn insert(&self, pod: Pod) {
        self.pods.lock().unwrap().insert(pod.name_any(), pod);
    }

    /// Fail the next create with `err`.
    pub(crate) fn fail_create(&self, err: Error) {
        *self.create_error.lock().unwrap() = Some(err);
    }

    pub(crate) fn created(&self) -> Vec<Pod> {
        self.created.lock().unwrap().clone()
    }

    pub(crate) fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub(crate) fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }
}

#[async_trait]
impl PodClient for FakePodClient {
    async fn create(&self, _namespace: &str, pod: &Pod) -> Result<Pod> {
        if let Some(err) = self.create_error.lock().unwrap().take() {
            return Err(err);
        }
        let name = pod.name_any();
        let mut pods = self.pods.lock().unwrap();
        if pods.contains_key(&name) {
            return Err(Error::AlreadyExists(format!("pod {name}")));
        }
        pods.insert(name, pod.clone());
        self.created.lock().unwrap().push(pod.clone());
        Ok(pod.clone())
    }

    async fn get(&self, _namespace: &str, name: &str) -> Result<Pod> {
        self.gets.lock().unwrap().push(name.to_string());
        self.pods
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pod {name}")))
    }

    async fn delete(&self, _namespace: &str, name: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(name.to_string());
        self.pods
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("pod {name}")))
    }
}

#[derive(Default)]
pub(crate) struct FakeRecorder {
    events: Mutex<Vec<(EventType, String, String)>>,
}

impl FakeRecorder {
    pub(crate) fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventRecorder for FakeRecorder {
    async fn event(&self, _build: &Build, event_type: EventType, reason: &str, message: String) {
        self.events
            .lock()
            .unwrap()
            .push((event_type, reason.to_string(), message));
    }
}

/// Run policy answering every kind, with a switchable verdict.
pub(crate) struct FakePolicy {
    runnable: AtomicBool,
    completed: Mutex<Vec<String>>,
}

impl FakePolicy {
    pub(crate) fn new(runnable: bool) -> Self {
        Self {
            runnable: AtomicBool::new(runnable),
            completed: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_runnable(&self, runnable: bool) {
        self.runnable.store(runnable, Ordering::SeqCst);
    }

    pub(crate) fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunPolicy for FakePolicy {
    fn handles(&self, _kind: RunPolicyKind) -> bool {
        true
    }

    async fn is_runnable(&self, _build: &Build) -> Result<bool> {
        Ok(self.runnable.load(Ordering::SeqCst))
    }

    async fn on_complete(&self, build: &Build) -> Result<()> {
        self.completed.lock().unwrap().push(build.name_any());
        Ok(())
    }
}

/// The real pod factory, unless told to fail.
pub(crate) struct FakeStrategy {
    factory: BuildPodFactory,
    failing: AtomicBool,
}

impl FakeStrategy {
    pub(crate) fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

impl BuildPodStrategy for FakeStrategy {
    fn create_build_pod(&self, build: &Build) -> std::result::Result<Pod, StrategyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StrategyError::InvalidSpec("unrecognized build".into()));
        }
        self.factory.create_build_pod(build)
    }
}

/// A controller wired to in-memory collaborators, with synced caches.
pub(crate) struct Fixture {
    pub builds: Arc<ObjectCache<Build>>,
    pub pods: Arc<ObjectCache<Pod>>,
    pub secrets: Arc<ObjectCache<Secret>>,
    pub streams: Arc<ObjectCache<ImageStream>>,
    pub build_client: Arc<FakeBuildClient>,
    pub pod_client: Arc<FakePodClient>,
    pub recorder: Arc<FakeRecorder>,
    pub policy: Arc<FakePolicy>,
    pub strategy: Arc<FakeStrategy>,
    pub config: ControllerConfig,
    pub controller: Arc<BuildController>,
}

impl Fixture {
    /// Every build is handled by a `FakePolicy` that starts out runnable.
    pub(crate) fn new() -> Self {
        Self::wire(false, true)
    }

    /// Caches that never report an initial list.
    pub(crate) fn unsynced() -> Self {
        Self::wire(false, false)
    }

    /// The real Parallel/Serial/SerialLatestOnly policies.
    pub(crate) fn with_default_policies() -> Self {
        Self::wire(true, true)
    }

    fn wire(default_policies: bool, synced: bool) -> Self {
        let builds = Arc::new(ObjectCache::<Build>::new());
        let pods = Arc::new(ObjectCache::<Pod>::new());
        let secrets = Arc::new(ObjectCache::<Secret>::new());
        let streams = Arc::new(ObjectCache::<ImageStream>::new());
        if synced {
            builds.mark_synced();
            pods.mark_synced();
            secrets.mark_synced();
            streams.mark_synced();
        }

        let build_client = Arc::new(FakeBuildClient::new(builds.clone()));
        let pod_client = Arc::new(FakePodClient::default());
        let recorder = Arc::new(FakeRecorder::default());
        let policy = Arc::new(FakePolicy::new(true));
        let strategies = StrategyConfig::default();
        let strategy = Arc::new(FakeStrategy {
            factory: BuildPodFactory::new(&strategies),
            failing: AtomicBool::new(false),
        });
        let run_policies = if default_policies {
            RunPolicies::defaults(builds.clone(), build_client.clone())
        } else {
            RunPolicies::new(vec![policy.clone() as Arc<dyn RunPolicy>])
        };

        let config = ControllerConfig::default();
        let controller = Arc::new(BuildController::new(
            BuildControllerParams {
                builds: builds.clone(),
                pods: pods.clone(),
                secrets: secrets.clone(),
                image_streams: streams.clone(),
                build_client: build_client.clone(),
                pod_client: pod_client.clone(),
                recorder: recorder.clone(),
                pod_strategy: strategy.clone(),
                admission: Arc::new(BuildAdmission::new(
                    PodSettings::default(),
                    PodSettings::default(),
                )),
                run_policies: Arc::new(run_policies),
                default_service_account: strategies.service_account.clone(),
            },
            &config,
        ));

        Self {
            builds,
            pods,
            secrets,
            streams,
            build_client,
            pod_client,
            recorder,
            policy,
            strategy,
            config,
            controller,
        }
    }

    pub(crate) fn add_build(&self, build: Build) -> Arc<Build> {
        self.builds.apply(build).0
    }

    /// Add a pod to both the cache and the pod store.
    pub(crate) fn add_pod(&self, pod: Pod) -> Arc<Pod> {
        self.pod_client.insert(pod.clone());
        self.pods.apply(pod).0
    }

    pub(crate) fn build(&self, name: &str) -> Arc<Build> {
        self.build_client
            .build(name)
            .unwrap_or_else(|| panic!("build {name} not in cache"))
    }
}
