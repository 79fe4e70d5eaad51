//! apps core types shared by the kube integration, the wait/proxy engines and the CLI.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod conditions;

pub use conditions::{Condition, ConditionStatus};

/// Namespace + name of a single object; the target of a wait call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// True when `namespace`/`name` identify this object. A missing namespace never matches.
    pub fn matches(&self, namespace: Option<&str>, name: Option<&str>) -> bool {
        namespace == Some(self.namespace.as_str()) && name == Some(self.name.as_str())
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Health report for the local source proxy.
///
/// Facets get more informative as the proxy call gets further; only the
/// all-true report means the proxy is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub user_has_permission: bool,
    pub reachable: bool,
    pub upstream_authenticated: bool,
    pub overall_health: bool,
    pub message: String,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.user_has_permission && self.reachable && self.upstream_authenticated && self.overall_health
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid object reference {0:?} (expect name or namespace/name)")]
pub struct ParseNameError(pub String);

impl NamespacedName {
    /// Parse `name` or `namespace/name`, falling back to `default_ns`.
    pub fn parse(s: &str, default_ns: &str) -> Result<Self, ParseNameError> {
        let parts: Vec<_> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new(default_ns, *name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::new(*ns, *name)),
            _ => Err(ParseNameError(s.to_string())),
        }
    }
}
