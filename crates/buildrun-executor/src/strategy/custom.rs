//! Builds performed entirely by a user-supplied image.

use buildrun_config::StrategyConfig;
use buildrun_core::{Build, BuildStrategy};
use k8s_openapi::api::core::v1::{Container, Pod};

use super::BuildPodStrategy;
use super::common::{build_env, build_pod, merge_env, pull_spec};
use crate::StrategyError;

pub struct CustomBuildStrategy {
    service_account: String,
}

impl CustomBuildStrategy {
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            service_account: config.service_account.clone(),
        }
    }
}

impl BuildPodStrategy for CustomBuildStrategy {
    fn create_build_pod(&self, build: &Build) -> Result<Pod, StrategyError> {
        let BuildStrategy::CustomExecutor(strategy) = &build.spec.strategy else {
            return Err(StrategyError::InvalidSpec(
                "custom builder invoked for a non-CustomExecutor build".to_string(),
            ));
        };
        let image = pull_spec(&strategy.image, "CustomExecutor")?;

        let mut env = build_env(build)?;
        merge_env(&mut env, &strategy.env);

        let container = Container {
            name: "custom-build".to_string(),
            image: Some(image.to_string()),
            env: Some(env),
            ..Default::default()
        };

        Ok(build_pod(
            build,
            container,
            &self.service_account,
            strategy.expose_docker_socket,
        ))
    }
}
