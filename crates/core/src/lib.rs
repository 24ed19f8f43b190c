//! Envop core types: the environment spec/status model shared by all crates.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Namespaced name addressing one environment resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Nsn {
    pub namespace: String,
    pub name: String,
}

impl Nsn {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for Nsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// State of a step as persisted in the environment status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    #[default]
    Initial,
    Running,
    Ready,
    Error,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Initial => "Initial",
            StepState::Running => "Running",
            StepState::Ready => "Ready",
            StepState::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Per-step status entry, keyed by the step short name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    pub hash: String,
    pub state: StepState,
    pub msg: String,
}

/// Environment status as persisted by the controller shell between reconciles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    #[serde(default)]
    pub steps: BTreeMap<String, StepStatus>,
}

impl EnvironmentStatus {
    /// Short names of the steps currently in `state`.
    pub fn steps_in_state(&self, state: StepState) -> Vec<String> {
        self.steps
            .iter()
            .filter(|(_, s)| s.state == state)
            .map(|(n, _)| n.clone())
            .collect()
    }
}

/// Caps on the number of objects one apply may add, change or delete.
/// A `None` limit is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSpec {
    pub add_limit: Option<u32>,
    pub update_limit: Option<u32>,
    pub delete_limit: Option<u32>,
}

/// Azure-specific settings for the infrastructure footprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzSpec {
    pub subscription: String,
    pub resource_group: String,
}

/// Access to the infrastructure-engine state store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSpec {
    /// Storage access key; may be a secret reference.
    #[serde(default)]
    pub access: String,
}

/// Desired infrastructure footprint of an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfraSpec {
    pub env_name: String,
    /// Directory (relative to the infra workspace) holding the main module.
    #[serde(default)]
    pub main: String,
    #[serde(default)]
    pub state: StateSpec,
    #[serde(default)]
    pub az: AzSpec,
    #[serde(default)]
    pub budget: BudgetSpec,
    /// Engine input values; entries may reference secrets (`vault:<path>:<field>`).
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// Infrastructure parameters of one managed cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfraSpec {
    /// Desired Kubernetes version of the cluster node pools.
    pub version: String,
    /// Node pool scale targets by pool name.
    #[serde(default)]
    pub pools: BTreeMap<String, u32>,
}

/// Addon parameters of one managed cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAddonSpec {
    /// Master key vault path, relative to the cluster workspace.
    #[serde(default)]
    pub mkv: String,
    /// Manifest job files to apply, in order, relative to the cluster workspace.
    #[serde(default)]
    pub jobs: Vec<String>,
    /// Values substituted into the job manifests.
    #[serde(default)]
    pub x: BTreeMap<String, String>,
}

/// One managed cluster within an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    #[serde(default)]
    pub infra: ClusterInfraSpec,
    #[serde(default)]
    pub addons: ClusterAddonSpec,
}

// ------------- Env helpers (config knobs) -------------

/// Boolean env flag: "1"/"true"/"yes" (case-insensitive) is true.
pub fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
        .unwrap_or(default)
}

/// Parse an env var, falling back to `default` when unset or malformed.
pub fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}
