//! Dockerfile builds.

use buildrun_config::StrategyConfig;
use buildrun_core::{Build, BuildStrategy};
use k8s_openapi::api::core::v1::{Container, Pod, SecurityContext};

use super::BuildPodStrategy;
use super::common::{build_env, build_pod, env_var, merge_env, pull_spec};
use crate::StrategyError;

pub struct DockerBuildStrategy {
    image: String,
    service_account: String,
}

impl DockerBuildStrategy {
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            image: config.docker_image.clone(),
            service_account: config.service_account.clone(),
        }
    }
}

impl BuildPodStrategy for DockerBuildStrategy {
    fn create_build_pod(&self, build: &Build) -> Result<Pod, StrategyError> {
        let BuildStrategy::DirectImage(strategy) = &build.spec.strategy else {
            return Err(StrategyError::InvalidSpec(
                "docker builder invoked for a non-DirectImage build".to_string(),
            ));
        };
        if self.image.is_empty() {
            return Err(StrategyError::MissingImage {
                strategy: "DirectImage",
            });
        }

        let mut env = build_env(build)?;
        if let Some(path) = &strategy.dockerfile_path {
            env.push(env_var("DOCKERFILE_PATH", path));
        }
        if let Some(from) = &strategy.from {
            env.push(env_var("DOCKER_FROM", pull_spec(from, "DirectImage")?));
        }
        if strategy.no_cache {
            env.push(env_var("NO_CACHE", "true"));
        }
        if !strategy.build_args.is_empty() {
            let args = serde_json::to_string(&strategy.build_args)
                .map_err(|e| StrategyError::InvalidSpec(format!("build args: {e}")))?;
            env.push(env_var("BUILD_ARGS", args));
        }
        merge_env(&mut env, &strategy.env);

        let container = Container {
            name: "docker-build".to_string(),
            image: Some(self.image.clone()),
            env: Some(env),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        Ok(build_pod(build, container, &self.service_account, true))
    }
}
