//! Kubernetes-backed collaborators.

use async_trait::async_trait;
use buildrun_core::build::build_crd;
use buildrun_core::client::{BuildClient, EventRecorder, EventType, PodClient};
use buildrun_core::{Build, Error, ImageStream, Result};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{self, Recorder, Reporter};
use kube::{Client, CustomResourceExt, Resource, ResourceExt};
use tracing::{info, warn};

const FIELD_MANAGER: &str = "buildrun-controller";
/// Action recorded on every build event.
const EVENT_ACTION: &str = "Reconcile";

/// Talks to the API server for builds, pods and events.
#[derive(Clone)]
pub struct KubernetesClient {
    client: Client,
    recorder: Recorder,
}

impl KubernetesClient {
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn builds(&self, namespace: &str) -> Api<Build> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Install or update the CRDs the controller serves, using server-side
    /// apply.
    pub async fn install_crds(&self) -> Result<()> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let params = PatchParams::apply(FIELD_MANAGER).force();
        for crd in crds() {
            let name = crd.name_any();
            info!(crd = %name, "Installing CRD");
            api.patch(&name, &params, &Patch::Apply(&crd))
                .await
                .map_err(|e| Error::Internal(format!("failed to install {name} CRD: {e}")))?;
        }
        Ok(())
    }
}

/// Every CRD the controller reads or writes.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![build_crd(), ImageStream::crd()]
}

fn kube_event_type(event_type: EventType) -> events::EventType {
    match event_type {
        EventType::Normal => events::EventType::Normal,
        EventType::Warning => events::EventType::Warning,
    }
}

/// Maps API failures onto the controller's error taxonomy.
pub fn map_kube_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(resp.message),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::AlreadyExists(resp.message)
        }
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(resp.message),
        other => Error::Api(other.to_string()),
    }
}

/// Builds are installed without a status subresource (see `build_crd`), so
/// one merge patch carries annotations and status together.
#[async_trait]
impl BuildClient for KubernetesClient {
    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<Build> {
        self.builds(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(map_kube_error)
    }
}

#[async_trait]
impl PodClient for KubernetesClient {
    async fn create(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(map_kube_error)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pods(namespace).get(name).await.map_err(map_kube_error)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }
}

#[async_trait]
impl EventRecorder for KubernetesClient {
    async fn event(&self, build: &Build, event_type: EventType, reason: &str, message: String) {
        let event = events::Event {
            type_: kube_event_type(event_type),
            reason: reason.to_string(),
            note: Some(message),
            action: EVENT_ACTION.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &build.object_ref(&())).await {
            warn!(build = %build.key(), reason, error = %e, "Failed to publish build event");
        }
    }
}
