//! Cluster-wide build defaults and overrides.

use std::collections::BTreeMap;

use buildrun_config::PodSettings;
use buildrun_core::Result;
use buildrun_core::client::PodAdmission;
use k8s_openapi::api::core::v1::{EnvVar, Pod};

/// Applies the `defaults` and `overrides` sections of the controller config
/// to every build pod.
#[derive(Debug, Clone, Default)]
pub struct BuildAdmission {
    defaults: PodSettings,
    overrides: PodSettings,
}

impl BuildAdmission {
    pub fn new(defaults: PodSettings, overrides: PodSettings) -> Self {
        Self {
            defaults,
            overrides,
        }
    }
}

impl PodAdmission for BuildAdmission {
    fn apply_defaults(&self, pod: &mut Pod) -> Result<()> {
        apply(pod, &self.defaults, false);
        Ok(())
    }

    fn apply_overrides(&self, pod: &mut Pod) -> Result<()> {
        apply(pod, &self.overrides, true);
        Ok(())
    }
}

fn apply(pod: &mut Pod, settings: &PodSettings, replace: bool) {
    if settings.is_empty() {
        return;
    }

    if !settings.labels.is_empty() {
        merge_map(
            pod.metadata.labels.get_or_insert_with(BTreeMap::new),
            &settings.labels,
            replace,
        );
    }

    let Some(spec) = pod.spec.as_mut() else {
        return;
    };
    if !settings.node_selector.is_empty() {
        merge_map(
            spec.node_selector.get_or_insert_with(BTreeMap::new),
            &settings.node_selector,
            replace,
        );
    }

    if settings.env.is_empty() {
        return;
    }
    for container in &mut spec.containers {
        let env = container.env.get_or_insert_with(Vec::new);
        for (name, value) in &settings.env {
            match env.iter_mut().find(|e| &e.name == name) {
                Some(existing) if replace => {
                    existing.value = Some(value.clone());
                    existing.value_from = None;
                }
                Some(_) => {}
                None => env.push(EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    ..Default::default()
                }),
            }
        }
    }
}

fn merge_map(
    target: &mut BTreeMap<String, String>,
    source: &BTreeMap<String, String>,
    replace: bool,
) {
    for (key, value) in source {
        if replace {
            target.insert(key.clone(), value.clone());
        } else {
            target.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}
