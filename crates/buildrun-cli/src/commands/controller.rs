//! `buildrun controller`: run the reconciler until interrupted.

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use buildrun_config::{BuildrunConfig, load_config};
use buildrun_controller::{BuildController, BuildControllerParams, RunPolicies, run_workers};
use buildrun_core::{Build, ImageStream, ObjectCache};
use buildrun_executor::{
    BuildAdmission, BuildPodFactory, IgnoreEvents, KubernetesClient, ResourceHandler,
    run_informer,
};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::{Api, Client, Resource};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{error, info};

pub async fn run(
    config_path: &Path,
    workers: Option<usize>,
    namespace: Option<String>,
) -> Result<()> {
    let mut config = if config_path.exists() {
        load_config(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        info!(path = %config_path.display(), "No config file, using defaults");
        BuildrunConfig::default()
    };
    if let Some(workers) = workers {
        config.controller.workers = workers;
    }
    if namespace.is_some() {
        config.controller.namespace = namespace;
    }
    anyhow::ensure!(config.controller.workers > 0, "workers must be at least 1");

    let kube = Arc::new(KubernetesClient::new().await?);
    kube.install_crds().await?;
    let client = kube.client();
    let namespace = config.controller.namespace.as_deref();

    let builds = Arc::new(ObjectCache::<Build>::new());
    let pods = Arc::new(ObjectCache::<Pod>::new());
    let secrets = Arc::new(ObjectCache::<Secret>::new());
    let image_streams = Arc::new(ObjectCache::<ImageStream>::new());

    let controller = Arc::new(BuildController::new(
        BuildControllerParams {
            builds: builds.clone(),
            pods: pods.clone(),
            secrets: secrets.clone(),
            image_streams: image_streams.clone(),
            build_client: kube.clone(),
            pod_client: kube.clone(),
            recorder: kube.clone(),
            pod_strategy: Arc::new(BuildPodFactory::new(&config.strategies)),
            admission: Arc::new(BuildAdmission::new(
                config.defaults.clone(),
                config.overrides.clone(),
            )),
            run_policies: Arc::new(RunPolicies::defaults(builds.clone(), kube.clone())),
            default_service_account: config.strategies.service_account.clone(),
        },
        &config.controller,
    ));

    let mut informers = JoinSet::new();
    informers.spawn(run_informer(
        api::<Build>(&client, namespace),
        builds,
        controller.clone() as Arc<dyn ResourceHandler<Build>>,
    ));
    informers.spawn(run_informer(
        api::<Pod>(&client, namespace),
        pods,
        controller.clone() as Arc<dyn ResourceHandler<Pod>>,
    ));
    informers.spawn(run_informer(
        api::<Secret>(&client, namespace),
        secrets,
        Arc::new(IgnoreEvents) as Arc<dyn ResourceHandler<Secret>>,
    ));
    informers.spawn(run_informer(
        api::<ImageStream>(&client, namespace),
        image_streams,
        controller.clone() as Arc<dyn ResourceHandler<ImageStream>>,
    ));

    info!(
        namespace = namespace.unwrap_or("<all>"),
        workers = config.controller.workers,
        "Starting buildrun controller"
    );
    let (shutdown, mut signal_error) = shutdown_on(tokio::signal::ctrl_c());
    let result = run_workers(
        controller,
        config.controller.workers,
        config.controller.cache_sync_timeout,
        shutdown,
    )
    .await;

    informers.abort_all();
    result?;
    if let Ok(e) = signal_error.try_recv() {
        return Err(e).context("listening for shutdown signal");
    }
    info!("Controller stopped");
    Ok(())
}

/// A shutdown future that resolves when `signal` does. If the signal handler
/// cannot be installed the future resolves at once and the error is handed
/// to the returned receiver.
fn shutdown_on(
    signal: impl Future<Output = io::Result<()>>,
) -> (impl Future<Output = ()>, oneshot::Receiver<io::Error>) {
    let (tx, rx) = oneshot::channel();
    let shutdown = async move {
        if let Err(e) = signal.await {
            error!(error = %e, "Failed to listen for shutdown signal");
            let _ = tx.send(e);
        }
    };
    (shutdown, rx)
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}
