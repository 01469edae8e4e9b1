//! Resolution of the image references a build names: its output and the
//! images its strategy runs on.

use buildrun_core::build::OutputTarget;
use buildrun_core::client::Lister;
use buildrun_core::image::{DockerImageReference, split_image_stream_image, split_image_stream_tag};
use buildrun_core::{Build, BuildStrategy, ImageReference, ImageStream, ObjectKey};
use kube::ResourceExt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error("image stream {0} not found")]
    StreamNotFound(ObjectKey),

    #[error("image stream {0} has no docker image repository")]
    NoRegistry(ObjectKey),

    #[error("image stream {0} has no image tagged {1}")]
    TagNotFound(ObjectKey, String),

    #[error("image stream {0} has no image {1}")]
    ImageNotFound(ObjectKey, String),

    #[error("invalid image reference: {0}")]
    InvalidReference(String),
}

fn in_namespace(namespace: &Option<String>, default: &str) -> String {
    namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Stream the build pushes to, when its output names one.
pub fn output_stream_key(build: &Build) -> Result<Option<ObjectKey>, ResolveError> {
    let build_namespace = build.namespace().unwrap_or_default();
    let namespace = |ns: &Option<String>| in_namespace(ns, &build_namespace);
    match &build.spec.output.to {
        None | Some(OutputTarget::DockerImage { .. }) => Ok(None),
        Some(OutputTarget::ImageStreamTag { name, namespace: ns }) => {
            let (stream, _) = split_image_stream_tag(name)
                .ok_or_else(|| ResolveError::InvalidReference(name.clone()))?;
            Ok(Some(ObjectKey::new(namespace(ns), stream)))
        }
        Some(OutputTarget::ImageStream { name, namespace: ns }) => {
            if name.is_empty() {
                return Err(ResolveError::InvalidReference(name.clone()));
            }
            Ok(Some(ObjectKey::new(namespace(ns), name.clone())))
        }
    }
}

/// Pushable reference for the build's output. `None` when the build has no
/// output.
pub fn resolve_output(
    build: &Build,
    streams: &dyn Lister<ImageStream>,
) -> Result<Option<String>, ResolveError> {
    let tag = match &build.spec.output.to {
        None => return Ok(None),
        Some(OutputTarget::DockerImage { name }) => return Ok(Some(name.clone())),
        Some(OutputTarget::ImageStreamTag { name, .. }) => split_image_stream_tag(name)
            .map(|(_, tag)| tag.to_string())
            .ok_or_else(|| ResolveError::InvalidReference(name.clone()))?,
        Some(OutputTarget::ImageStream { .. }) => String::new(),
    };
    let Some(key) = output_stream_key(build)? else {
        return Ok(None);
    };

    let stream = streams
        .get(&key.namespace, &key.name)
        .ok_or_else(|| ResolveError::StreamNotFound(key.clone()))?;
    let repository = stream
        .repository()
        .ok_or_else(|| ResolveError::NoRegistry(key.clone()))?;

    let mut reference = DockerImageReference::parse(repository)
        .map_err(|_| ResolveError::InvalidReference(repository.to_string()))?
        .as_repository();
    reference.tag = tag;
    Ok(Some(reference.exact()))
}

/// Stream a strategy image is taken from. `None` for plain registry images.
pub fn image_stream_key(
    reference: &ImageReference,
    namespace: &str,
) -> Result<Option<ObjectKey>, ResolveError> {
    let stream = match reference {
        ImageReference::DockerImage { .. } => return Ok(None),
        ImageReference::ImageStreamTag { name, namespace: ns } => split_image_stream_tag(name)
            .map(|(stream, _)| (stream, ns))
            .ok_or_else(|| ResolveError::InvalidReference(name.clone()))?,
        ImageReference::ImageStreamImage { name, namespace: ns } => split_image_stream_image(name)
            .map(|(stream, _)| (stream, ns))
            .ok_or_else(|| ResolveError::InvalidReference(name.clone()))?,
    };
    let (name, ns) = stream;
    Ok(Some(ObjectKey::new(in_namespace(ns, namespace), name)))
}

/// Streams the build's strategy images come from, deduplicated.
pub fn strategy_stream_keys(build: &Build) -> Result<Vec<ObjectKey>, ResolveError> {
    let namespace = build.namespace().unwrap_or_default();
    let mut keys = Vec::new();
    for reference in build.spec.strategy.image_references() {
        if let Some(key) = image_stream_key(reference, &namespace)? {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    Ok(keys)
}

/// Pull spec a strategy image currently points at.
pub fn resolve_image(
    reference: &ImageReference,
    namespace: &str,
    streams: &dyn Lister<ImageStream>,
) -> Result<String, ResolveError> {
    let lookup = |ns: &Option<String>, stream: &str| {
        let key = ObjectKey::new(in_namespace(ns, namespace), stream);
        match streams.get(&key.namespace, &key.name) {
            Some(found) => Ok((key, found)),
            None => Err(ResolveError::StreamNotFound(key)),
        }
    };
    match reference {
        ImageReference::DockerImage { name } => Ok(name.clone()),
        ImageReference::ImageStreamTag { name, namespace: ns } => {
            let (stream, tag) = split_image_stream_tag(name)
                .ok_or_else(|| ResolveError::InvalidReference(name.clone()))?;
            let (key, found) = lookup(ns, stream)?;
            found
                .latest_tagged_image(tag)
                .ok_or_else(|| ResolveError::TagNotFound(key, tag.to_string()))
        }
        ImageReference::ImageStreamImage { name, namespace: ns } => {
            let (stream, id) = split_image_stream_image(name)
                .ok_or_else(|| ResolveError::InvalidReference(name.clone()))?;
            let (key, found) = lookup(ns, stream)?;
            found
                .image_by_id(id)
                .ok_or_else(|| ResolveError::ImageNotFound(key, id.to_string()))
        }
    }
}

/// Rewrite every stream reference of `strategy` into the registry image it
/// resolves to. Leaves the strategy untouched on error.
pub fn resolve_strategy_images(
    strategy: &mut BuildStrategy,
    namespace: &str,
    streams: &dyn Lister<ImageStream>,
) -> Result<(), ResolveError> {
    let resolved = strategy
        .image_references()
        .into_iter()
        .map(|reference| resolve_image(reference, namespace, streams))
        .collect::<Result<Vec<_>, _>>()?;
    for (reference, name) in strategy.image_references_mut().into_iter().zip(resolved) {
        if !matches!(reference, ImageReference::DockerImage { .. }) {
            *reference = ImageReference::DockerImage { name };
        }
    }
    Ok(())
}
