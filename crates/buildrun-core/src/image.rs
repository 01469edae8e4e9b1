//! Image streams and image reference parsing.

use std::sync::LazyLock;

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tag used when a reference does not name one.
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// A named collection of image tags backed by a registry repository.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "image.buildrun.dev",
    version = "v1",
    kind = "ImageStream",
    plural = "imagestreams",
    namespaced,
    status = "ImageStreamStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamSpec {
    /// Upstream repository the stream mirrors, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image_repository: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamStatus {
    /// Registry repository images of this stream are pushed to. Empty until
    /// an integrated registry has been configured.
    #[serde(default)]
    pub docker_image_repository: String,

    /// History of each tag, newest image first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<NamedTagEventList>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamedTagEventList {
    pub tag: String,
    #[serde(default)]
    pub items: Vec<TagEvent>,
}

/// One image a tag has pointed at.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagEvent {
    /// Pull spec recorded when the tag was updated.
    pub docker_image_reference: String,
    /// Image id (digest).
    pub image: String,
}

impl ImageStream {
    pub fn repository(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.docker_image_repository.as_str())
            .filter(|r| !r.is_empty())
    }

    fn tag_events(&self) -> impl Iterator<Item = (&str, &[TagEvent])> {
        self.status
            .iter()
            .flat_map(|s| s.tags.iter())
            .map(|t| (t.tag.as_str(), t.items.as_slice()))
    }

    /// Pull spec for the newest image of `tag`, pinned by id when possible.
    pub fn latest_tagged_image(&self, tag: &str) -> Option<String> {
        let event = self
            .tag_events()
            .find(|(name, _)| *name == tag)
            .and_then(|(_, items)| items.first())?;
        Some(self.pull_spec_for(event))
    }

    /// Pull spec for the image with `id` anywhere in the stream's history.
    pub fn image_by_id(&self, id: &str) -> Option<String> {
        let event = self
            .tag_events()
            .flat_map(|(_, items)| items)
            .find(|e| e.image == id)?;
        Some(self.pull_spec_for(event))
    }

    fn pull_spec_for(&self, event: &TagEvent) -> String {
        match self.repository() {
            Some(repository) if !event.image.is_empty() => format!("{repository}@{}", event.image),
            _ => event.docker_image_reference.clone(),
        }
    }
}

/// One path component of a repository name.
static COMPONENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").unwrap());

/// A parsed `[registry/][namespace/]name[:tag][@id]` reference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DockerImageReference {
    pub registry: String,
    pub namespace: String,
    pub name: String,
    pub tag: String,
    pub id: String,
}

impl DockerImageReference {
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || Error::Fatal(format!("invalid image reference {spec:?}"));
        if spec.is_empty() {
            return Err(invalid());
        }

        let (rest, id) = match spec.split_once('@') {
            Some((rest, id)) if !id.is_empty() => (rest, id.to_string()),
            Some(_) => return Err(invalid()),
            None => (spec, String::new()),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to a registry port.
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (path, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => (&rest[..last_slash + i], rest[last_slash + i + 1..].to_string()),
            None => (rest, String::new()),
        };

        let mut parts: Vec<&str> = path.split('/').collect();
        let mut reference = DockerImageReference {
            tag,
            id,
            ..Default::default()
        };

        if parts.len() > 1 && looks_like_registry(parts[0]) {
            reference.registry = parts.remove(0).to_string();
        }
        let name = parts.pop().ok_or_else(invalid)?;
        if !parts.iter().chain(std::iter::once(&name)).all(|c| COMPONENT.is_match(c)) {
            return Err(invalid());
        }
        reference.namespace = parts.join("/");
        reference.name = name.to_string();
        Ok(reference)
    }

    /// The reference without tag or id.
    pub fn as_repository(&self) -> Self {
        Self {
            tag: String::new(),
            id: String::new(),
            ..self.clone()
        }
    }

    /// The most exact string form, keeping every populated component.
    pub fn exact(&self) -> String {
        let mut out = String::new();
        for segment in [&self.registry, &self.namespace] {
            if !segment.is_empty() {
                out.push_str(segment);
                out.push('/');
            }
        }
        out.push_str(&self.name);
        if !self.tag.is_empty() {
            out.push(':');
            out.push_str(&self.tag);
        }
        if !self.id.is_empty() {
            out.push('@');
            out.push_str(&self.id);
        }
        out
    }
}

impl std::fmt::Display for DockerImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.exact())
    }
}

fn looks_like_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

/// Splits `name:tag` into its parts, defaulting the tag to `latest`.
/// Returns `None` for empty names or tags and for more than one colon.
pub fn split_image_stream_tag(name_and_tag: &str) -> Option<(&str, &str)> {
    let (name, tag) = match name_and_tag.split_once(':') {
        Some((name, tag)) => (name, tag),
        None => (name_and_tag, DEFAULT_IMAGE_TAG),
    };
    if name.is_empty() || tag.is_empty() || tag.contains(':') {
        return None;
    }
    Some((name, tag))
}

/// Splits `name@id`. Both parts must be present.
pub fn split_image_stream_image(name_and_id: &str) -> Option<(&str, &str)> {
    match name_and_id.split_once('@') {
        Some((name, id)) if !name.is_empty() && !id.is_empty() => Some((name, id)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_reference() {
        let r = DockerImageReference::parse("registry.local:5000/team/app:v1@sha256:abc").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.namespace, "team");
        assert_eq!(r.name, "app");
        assert_eq!(r.tag, "v1");
        assert_eq!(r.id, "sha256:abc");
        assert_eq!(r.exact(), "registry.local:5000/team/app:v1@sha256:abc");
    }

    #[test]
    fn test_parse_short_forms() {
        let r = DockerImageReference::parse("centos").unwrap();
        assert_eq!((r.registry.as_str(), r.namespace.as_str(), r.name.as_str()), ("", "", "centos"));

        let r = DockerImageReference::parse("library/centos:7").unwrap();
        assert_eq!(r.namespace, "library");
        assert_eq!(r.tag, "7");

        let r = DockerImageReference::parse("localhost/app").unwrap();
        assert_eq!(r.registry, "localhost");
        assert_eq!(r.name, "app");
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(DockerImageReference::parse("").is_err());
        assert!(DockerImageReference::parse("Upper/Case").is_err());
        assert!(DockerImageReference::parse("app@").is_err());
    }

    #[test]
    fn test_as_repository_drops_tag_and_id() {
        let r = DockerImageReference::parse("172.30.1.1:5000/ns/app:old@sha256:1").unwrap();
        assert_eq!(r.as_repository().exact(), "172.30.1.1:5000/ns/app");
    }

    #[test]
    fn test_split_image_stream_tag() {
        assert_eq!(split_image_stream_tag("app:v2"), Some(("app", "v2")));
        assert_eq!(split_image_stream_tag("app"), Some(("app", "latest")));
        assert_eq!(split_image_stream_tag(":v2"), None);
        assert_eq!(split_image_stream_tag("app:"), None);
        assert_eq!(split_image_stream_tag("app:a:b"), None);
    }

    #[test]
    fn test_split_image_stream_image() {
        assert_eq!(
            split_image_stream_image("ruby@sha256:abc"),
            Some(("ruby", "sha256:abc"))
        );
        assert_eq!(split_image_stream_image("ruby"), None);
        assert_eq!(split_image_stream_image("@sha256:abc"), None);
        assert_eq!(split_image_stream_image("ruby@"), None);
    }

    #[test]
    fn test_repository_requires_status() {
        let mut stream = ImageStream::new("app", ImageStreamSpec::default());
        assert_eq!(stream.repository(), None);
        stream.status = Some(ImageStreamStatus {
            docker_image_repository: "registry/ns/app".into(),
            ..Default::default()
        });
        assert_eq!(stream.repository(), Some("registry/ns/app"));
    }

    fn tagged_stream(repository: &str) -> ImageStream {
        let mut stream = ImageStream::new("ruby", ImageStreamSpec::default());
        let event = |id: &str| TagEvent {
            docker_image_reference: format!("docker.io/library/ruby@{id}"),
            image: id.into(),
        };
        stream.status = Some(ImageStreamStatus {
            docker_image_repository: repository.into(),
            tags: vec![
                NamedTagEventList {
                    tag: "3".into(),
                    items: vec![event("sha256:new"), event("sha256:old")],
                },
                NamedTagEventList {
                    tag: "2".into(),
                    items: Vec::new(),
                },
            ],
        });
        stream
    }

    #[test]
    fn test_latest_tagged_image() {
        let stream = tagged_stream("registry/images/ruby");
        assert_eq!(
            stream.latest_tagged_image("3").as_deref(),
            Some("registry/images/ruby@sha256:new")
        );
        assert_eq!(stream.latest_tagged_image("2"), None);
        assert_eq!(stream.latest_tagged_image("latest"), None);

        let unmirrored = tagged_stream("");
        assert_eq!(
            unmirrored.latest_tagged_image("3").as_deref(),
            Some("docker.io/library/ruby@sha256:new")
        );
    }

    #[test]
    fn test_image_by_id_searches_history() {
        let stream = tagged_stream("registry/images/ruby");
        assert_eq!(
            stream.image_by_id("sha256:old").as_deref(),
            Some("registry/images/ruby@sha256:old")
        );
        assert_eq!(stream.image_by_id("sha256:missing"), None);
    }
}
