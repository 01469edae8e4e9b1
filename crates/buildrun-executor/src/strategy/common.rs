//! Pieces shared by every strategy builder.

use std::collections::BTreeMap;

use buildrun_core::build::{BUILD_LABEL, EnvVar};
use buildrun_core::{Build, ImageReference};
use k8s_openapi::api::core::v1::{
    Container, EnvVar as PodEnvVar, HostPathVolumeSource, Pod, PodSpec, SecretVolumeSource,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::StrategyError;

pub(crate) const PUSH_SECRET_VOLUME: &str = "push-secret";
pub(crate) const PUSH_SECRET_MOUNT_PATH: &str = "/var/run/secrets/buildrun.dev/push";
pub(crate) const DOCKER_SOCKET_VOLUME: &str = "docker-socket";
pub(crate) const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Environment every build container receives.
///
/// `BUILD` carries the serialized Build so the container knows what to do
/// without talking to the API server.
pub(crate) fn build_env(build: &Build) -> Result<Vec<PodEnvVar>, StrategyError> {
    let serialized = serde_json::to_string(build)
        .map_err(|e| StrategyError::InvalidSpec(format!("cannot serialize build: {e}")))?;

    let mut env = vec![env_var("BUILD", serialized)];
    if let Some(git) = &build.spec.source.git {
        env.push(env_var("SOURCE_REPOSITORY", &git.uri));
        if let Some(r) = &git.r#ref {
            env.push(env_var("SOURCE_REF", r));
        }
    }
    if let Some(dir) = &build.spec.source.context_dir {
        env.push(env_var("SOURCE_CONTEXT_DIR", dir));
    }
    if let Some(output) = build
        .status
        .as_ref()
        .and_then(|s| s.output_docker_image_reference.as_ref())
    {
        env.push(env_var("OUTPUT_IMAGE", output));
    }
    if build.spec.output.push_secret.is_some() {
        env.push(env_var("PUSH_DOCKERCFG_PATH", PUSH_SECRET_MOUNT_PATH));
    }
    Ok(env)
}

/// Pull spec of a strategy image. Stream references must have been resolved
/// by the controller before the pod is built.
pub(crate) fn pull_spec<'a>(
    reference: &'a ImageReference,
    strategy: &'static str,
) -> Result<&'a str, StrategyError> {
    match reference {
        ImageReference::DockerImage { .. } => reference
            .pull_spec()
            .ok_or(StrategyError::MissingImage { strategy }),
        unresolved => Err(StrategyError::UnresolvedImage(unresolved.to_string())),
    }
}

pub(crate) fn env_var(name: &str, value: impl Into<String>) -> PodEnvVar {
    PodEnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Appends user-supplied variables, replacing any built-in of the same name.
pub(crate) fn merge_env(env: &mut Vec<PodEnvVar>, extra: &[EnvVar]) {
    for var in extra {
        env.retain(|e| e.name != var.name);
        env.push(env_var(&var.name, var.value.clone()));
    }
}

/// Wraps a build container into the pod that runs it.
pub(crate) fn build_pod(
    build: &Build,
    mut container: Container,
    default_service_account: &str,
    mount_docker_socket: bool,
) -> Pod {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    if let Some(secret) = &build.spec.output.push_secret {
        volumes.push(Volume {
            name: PUSH_SECRET_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: PUSH_SECRET_VOLUME.to_string(),
            mount_path: PUSH_SECRET_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    if mount_docker_socket {
        volumes.push(Volume {
            name: DOCKER_SOCKET_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: DOCKER_SOCKET_PATH.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: DOCKER_SOCKET_VOLUME.to_string(),
            mount_path: DOCKER_SOCKET_PATH.to_string(),
            ..Default::default()
        });
    }

    if !mounts.is_empty() {
        container.volume_mounts = Some(mounts);
    }

    let service_account = build
        .spec
        .service_account
        .clone()
        .filter(|sa| !sa.is_empty())
        .unwrap_or_else(|| default_service_account.to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(build.pod_name()),
            namespace: build.namespace(),
            labels: Some(BTreeMap::from([(
                BUILD_LABEL.to_string(),
                build.name_any(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            service_account_name: Some(service_account),
            containers: vec![container],
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            ..Default::default()
        }),
        ..Default::default()
    }
}
