//! carto.run/v1alpha1 resources the commands read and write.
//!
//! Specs are kept opaque: the CLI only needs metadata and status conditions.

use anyhow::anyhow;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::json;

use apps_core::conditions::{self, Condition, ConditionStatus};

pub const GROUP: &str = "carto.run";

/// Label the supply chain puts on every object produced for a workload.
pub const WORKLOAD_LABEL_NAME: &str = "carto.run/workload-name";

/// Annotation marking a workload whose source was published through the local source proxy.
pub const LOCAL_SOURCE_PROXY_ANNOTATION: &str = "local-source-proxy.apps.tanzu.vmware.com";

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "carto.run",
    version = "v1alpha1",
    kind = "Workload",
    namespaced,
    status = "WorkloadStatus",
    schema = "disabled"
)]
pub struct WorkloadSpec {
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supply_chain_ref: Option<serde_json::Value>,
}

/// `spec.source.git` of a workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitSource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, rename = "ref")]
    pub git_ref: GitRef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "carto.run",
    version = "v1alpha1",
    kind = "ClusterSupplyChain",
    status = "SupplyChainStatus",
    schema = "disabled"
)]
pub struct SupplyChainSpec {
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplyChainStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Workload {
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.status.as_ref().and_then(|s| conditions::find(&s.conditions, conditions::READY))
    }

    /// True once the controller has observed the current spec generation.
    pub fn is_observed(&self) -> bool {
        let observed = self.status.as_ref().and_then(|s| s.observed_generation);
        self.metadata.generation == observed
    }

    /// `spec.source.image`, when the workload builds from a source image.
    pub fn source_image(&self) -> Option<&str> {
        self.spec.fields.get("source")?.get("image")?.as_str()
    }

    pub fn git_source(&self) -> Option<GitSource> {
        let git = self.spec.fields.get("source")?.get("git")?;
        serde_json::from_value(git.clone()).ok()
    }

    /// Drop every source: `spec.source` and `spec.image`.
    pub fn reset_source(&mut self) {
        self.spec.fields.remove("source");
        self.spec.fields.remove("image");
    }

    /// Deploy a pre-built image, skipping the source and build steps.
    pub fn set_image(&mut self, image: &str) {
        self.reset_source();
        self.spec.fields.insert("image".into(), json!(image));
    }

    pub fn set_source_image(&mut self, image: &str) {
        self.reset_source();
        self.spec.fields.insert("source".into(), json!({ "image": image }));
    }

    /// Build from git. An empty url or a missing branch is taken from the
    /// workload's current git source, if any.
    pub fn set_git(&mut self, mut git: GitSource) {
        if let Some(current) = self.git_source() {
            if git.url.is_empty() {
                git.url = current.url;
            }
            if git.git_ref.branch.is_none() {
                git.git_ref.branch = current.git_ref.branch;
            }
        }
        self.reset_source();
        self.spec.fields.insert("source".into(), json!({ "git": git }));
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.metadata.annotations.get_or_insert_with(Default::default).insert(key.into(), value.into());
    }

    pub fn remove_annotation(&mut self, key: &str) {
        if let Some(a) = self.metadata.annotations.as_mut() {
            a.remove(key);
        }
    }
}

impl ClusterSupplyChain {
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.status.as_ref().and_then(|s| conditions::find(&s.conditions, conditions::READY))
    }
}

/// Readiness predicate for `Workload` waits.
///
/// Not ready while the controller lags behind the current generation; a
/// `Ready=False` condition is terminal.
pub fn workload_ready(w: &Workload) -> anyhow::Result<bool> {
    if !w.is_observed() {
        return Ok(false);
    }
    match w.ready_condition() {
        Some(c) if c.status == ConditionStatus::True => Ok(true),
        Some(c) if c.status == ConditionStatus::False => {
            Err(anyhow!("Failed to become ready: {}", c.message.as_deref().unwrap_or_default()))
        }
        _ => Ok(false),
    }
}
