//! Source-to-image builds.

use buildrun_config::StrategyConfig;
use buildrun_core::{Build, BuildStrategy};
use k8s_openapi::api::core::v1::{Container, Pod};

use super::BuildPodStrategy;
use super::common::{build_env, build_pod, env_var, merge_env, pull_spec};
use crate::StrategyError;

pub struct SourceBuildStrategy {
    image: String,
    service_account: String,
}

impl SourceBuildStrategy {
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            image: config.source_image.clone(),
            service_account: config.service_account.clone(),
        }
    }
}

impl BuildPodStrategy for SourceBuildStrategy {
    fn create_build_pod(&self, build: &Build) -> Result<Pod, StrategyError> {
        let BuildStrategy::SourceToImage(strategy) = &build.spec.strategy else {
            return Err(StrategyError::InvalidSpec(
                "source builder invoked for a non-SourceToImage build".to_string(),
            ));
        };
        let builder_image = pull_spec(&strategy.builder_image, "SourceToImage")?;
        if self.image.is_empty() {
            return Err(StrategyError::MissingImage {
                strategy: "SourceToImage",
            });
        }

        let mut env = build_env(build)?;
        env.push(env_var("BUILDER_IMAGE", builder_image));
        if strategy.incremental {
            env.push(env_var("INCREMENTAL", "true"));
        }
        merge_env(&mut env, &strategy.env);

        let container = Container {
            name: "sti-build".to_string(),
            image: Some(self.image.clone()),
            env: Some(env),
            ..Default::default()
        };

        Ok(build_pod(build, container, &self.service_account, true))
    }
}
