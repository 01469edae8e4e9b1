//! Namespace-qualified object identifiers.

use derive_more::Display;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Identifies a namespaced object as `namespace/name`.
///
/// This is the work key of the controller queue and the key of the
/// deferred-resolution index.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{namespace}/{name}")]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for any namespaced kube resource. Cluster-scoped objects get an
    /// empty namespace.
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl std::str::FromStr for ObjectKey {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.split_once('/') {
            Some((namespace, name)) if !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(crate::Error::Fatal(format!("malformed object key {s:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let key = ObjectKey::new("builds", "app-3");
        assert_eq!(key.to_string(), "builds/app-3");
        assert_eq!("builds/app-3".parse::<ObjectKey>().unwrap(), key);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("no-namespace".parse::<ObjectKey>().is_err());
        assert!("a/b/c".parse::<ObjectKey>().is_err());
        assert!("ns/".parse::<ObjectKey>().is_err());
    }
}
