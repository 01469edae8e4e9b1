//! Build pod strategies.
//!
//! Each strategy variant of a Build has a builder that turns the Build into
//! the pod that executes it. `BuildPodFactory` dispatches on the variant.

mod common;
mod custom;
mod docker;
mod source;

pub use custom::CustomBuildStrategy;
pub use docker::DockerBuildStrategy;
pub use source::SourceBuildStrategy;

use buildrun_config::StrategyConfig;
use buildrun_core::build::BUILD_ANNOTATION;
use buildrun_core::{Build, BuildStrategy};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::StrategyError;

/// Turns a Build into the pod that runs it.
pub trait BuildPodStrategy: Send + Sync {
    fn create_build_pod(&self, build: &Build) -> Result<Pod, StrategyError>;
}

/// Selects the builder matching the Build's strategy.
pub struct BuildPodFactory {
    docker: DockerBuildStrategy,
    source: SourceBuildStrategy,
    custom: CustomBuildStrategy,
}

impl BuildPodFactory {
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            docker: DockerBuildStrategy::new(config),
            source: SourceBuildStrategy::new(config),
            custom: CustomBuildStrategy::new(config),
        }
    }
}

impl BuildPodStrategy for BuildPodFactory {
    fn create_build_pod(&self, build: &Build) -> Result<Pod, StrategyError> {
        let mut pod = match &build.spec.strategy {
            BuildStrategy::DirectImage(_) => self.docker.create_build_pod(build)?,
            BuildStrategy::SourceToImage(_) => self.source.create_build_pod(build)?,
            BuildStrategy::CustomExecutor(_) => self.custom.create_build_pod(build)?,
            BuildStrategy::ExternalPipeline(_) => {
                return Err(StrategyError::UnsupportedStrategy("ExternalPipeline"));
            }
        };

        pod.annotations_mut()
            .insert(BUILD_ANNOTATION.to_string(), build.name_any());
        Ok(pod)
    }
}
