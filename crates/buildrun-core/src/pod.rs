//! Build pod naming and correlation helpers.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::ObjectKey;
use crate::build::BUILD_ANNOTATION;

/// Maximum length of a pod name (DNS-1123 label).
const MAX_POD_NAME_LENGTH: usize = 63;
const POD_NAME_SUFFIX: &str = "build";
const HASH_LENGTH: usize = 8;

/// Derives the name of the pod that runs the named build.
///
/// Names that would exceed the DNS label limit are truncated and made unique
/// again with a short hash of the full build name.
pub fn build_pod_name(build_name: &str) -> String {
    let name = format!("{build_name}-{POD_NAME_SUFFIX}");
    if name.len() <= MAX_POD_NAME_LENGTH {
        return name;
    }

    let digest = hex::encode(Sha256::digest(build_name.as_bytes()));
    let keep = MAX_POD_NAME_LENGTH - POD_NAME_SUFFIX.len() - HASH_LENGTH - 2;
    let prefix: String = build_name.chars().take(keep).collect();
    format!(
        "{}-{}-{POD_NAME_SUFFIX}",
        prefix.trim_end_matches('-'),
        &digest[..HASH_LENGTH]
    )
}

/// Name of the build a pod runs, taken from its back-reference annotation.
pub fn build_name_for_pod(pod: &Pod) -> Option<&str> {
    pod.annotations()
        .get(BUILD_ANNOTATION)
        .map(String::as_str)
        .filter(|name| !name.is_empty())
}

/// Key of the build a pod runs, if the pod is a build pod.
pub fn build_key_for_pod(pod: &Pod) -> Option<ObjectKey> {
    let name = build_name_for_pod(pod)?;
    Some(ObjectKey::new(pod.namespace().unwrap_or_default(), name))
}

pub fn is_build_pod(pod: &Pod) -> bool {
    build_name_for_pod(pod).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_short_name_gets_suffix() {
        assert_eq!(build_pod_name("ruby-hello-world-1"), "ruby-hello-world-1-build");
    }

    #[test]
    fn test_long_name_is_truncated_and_hashed() {
        let long = "a".repeat(80);
        let name = build_pod_name(&long);
        assert_eq!(name.len(), MAX_POD_NAME_LENGTH);
        assert!(name.ends_with("-build"));

        let other = format!("{}b", "a".repeat(79));
        assert_ne!(build_pod_name(&other), name);
    }

    #[test]
    fn test_build_key_for_pod() {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some("builds".into());
        assert!(!is_build_pod(&pod));

        pod.metadata.annotations = Some(BTreeMap::from([(
            BUILD_ANNOTATION.to_string(),
            "app-2".to_string(),
        )]));
        assert!(is_build_pod(&pod));
        assert_eq!(
            build_key_for_pod(&pod),
            Some(ObjectKey::new("builds", "app-2"))
        );
    }
}
