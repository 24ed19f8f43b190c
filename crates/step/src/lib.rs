//! Steps: the discrete units of work the planner schedules.
//!
//! A step owns its working directory for the duration of `execute` and reports
//! its own state transitions (`Initial → Running → Ready|Error`) through the
//! status sink. The event sink carries fire-and-forget narration; only the
//! status sink is authoritative.

#![forbid(unsafe_code)]

use envop_core::{ClusterSpec, InfraSpec, Nsn, StepState};
use envop_cloud::ServicePrincipal;
use envop_terraform::{ApplyRecord, ApplyStream};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::warn;

mod addons;
mod aks_pool;
mod destroy;
mod exec;
mod infra;
mod kubeconfig;
mod preflight;

pub use addons::AddonStep;
pub use aks_pool::AksPoolStep;
pub use destroy::DestroyStep;
pub use exec::Executor;
pub use infra::InfraStep;
pub use kubeconfig::KubeconfigStep;
pub use preflight::AksAddonPreflightStep;

/// Default suffix of template files expanded before an engine run.
pub const TEMPLATE_SUFFIX: &str = ".tmplt";

/// The closed set of step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StepType {
    Infra,
    Destroy,
    AksPool,
    Kubeconfig,
    AksAddonPreflight,
    Addons,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Infra => "Infra",
            StepType::Destroy => "Destroy",
            StepType::AksPool => "AksPool",
            StepType::Kubeconfig => "Kubeconfig",
            StepType::AksAddonPreflight => "AksAddonPreflight",
            StepType::Addons => "Addons",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a step: kind + environment + optional cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId {
    pub step_type: StepType,
    pub namespace: String,
    pub name: String,
    /// Empty for environment-scoped steps.
    pub cluster_name: String,
}

impl StepId {
    pub fn env_scoped(step_type: StepType, nsn: &Nsn) -> Self {
        Self {
            step_type,
            namespace: nsn.namespace.clone(),
            name: nsn.name.clone(),
            cluster_name: String::new(),
        }
    }

    pub fn cluster_scoped(step_type: StepType, nsn: &Nsn, cluster: &str) -> Self {
        Self { cluster_name: cluster.to_string(), ..Self::env_scoped(step_type, nsn) }
    }

    /// Stable key of this step in the persisted environment status.
    pub fn short_name(&self) -> String {
        if self.cluster_name.is_empty() {
            self.step_type.as_str().to_string()
        } else {
            format!("{}.{}", self.step_type, self.cluster_name)
        }
    }

    pub fn nsn(&self) -> Nsn {
        Nsn::new(self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.name, self.short_name())
    }
}

/// Common step metadata; the unit the status sink persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMeta {
    pub id: StepId,
    /// Staleness fingerprint over the step's inputs.
    pub hash: String,
    pub state: StepState,
    pub msg: String,
}

impl StepMeta {
    pub fn new(id: StepId, hash: String) -> Self {
        Self { id, hash, state: StepState::Initial, msg: String::new() }
    }
}

/// Fire-and-forget narration for user-facing event streams.
pub trait EventSink: Send + Sync {
    fn info(&self, id: &StepId, text: &str);
    fn warning(&self, id: &StepId, text: &str);
}

/// Authoritative status snapshots; the controller shell persists these.
pub trait StatusSink: Send + Sync {
    fn update(&self, meta: &StepMeta);
}

/// Spec fragments available during template expansion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InfraValues {
    pub infra: InfraSpec,
    pub clusters: Vec<ClusterSpec>,
}

/// Template expander seam; rendering semantics live outside the core.
pub trait Expander: Send + Sync {
    fn expand_all(&self, dir: &Path, suffix: &str, values: &InfraValues) -> anyhow::Result<()>;
}

/// No-op expander for shells that pre-render their sources.
pub struct NoopExpander;

impl Expander for NoopExpander {
    fn expand_all(&self, _dir: &Path, _suffix: &str, _values: &InfraValues) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A step of a plan, ready to execute.
#[derive(Clone, Debug)]
pub enum Step {
    Infra(InfraStep),
    Destroy(DestroyStep),
    AksPool(AksPoolStep),
    Kubeconfig(KubeconfigStep),
    AksAddonPreflight(AksAddonPreflightStep),
    Addons(AddonStep),
}

impl Step {
    pub fn meta(&self) -> &StepMeta {
        match self {
            Step::Infra(s) => &s.meta,
            Step::Destroy(s) => &s.meta,
            Step::AksPool(s) => &s.meta,
            Step::Kubeconfig(s) => &s.meta,
            Step::AksAddonPreflight(s) => &s.meta,
            Step::Addons(s) => &s.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut StepMeta {
        match self {
            Step::Infra(s) => &mut s.meta,
            Step::Destroy(s) => &mut s.meta,
            Step::AksPool(s) => &mut s.meta,
            Step::Kubeconfig(s) => &mut s.meta,
            Step::AksAddonPreflight(s) => &mut s.meta,
            Step::Addons(s) => &mut s.meta,
        }
    }

    /// Drive the step to a terminal state; true iff it reached `Ready`.
    pub async fn execute(
        &mut self,
        env: &[(String, String)],
        events: &dyn EventSink,
        status: &dyn StatusSink,
    ) -> bool {
        match self {
            Step::Infra(s) => s.execute(env, events, status).await,
            Step::Destroy(s) => s.execute(env, events, status).await,
            Step::AksPool(s) => s.execute(env, events, status).await,
            Step::Kubeconfig(s) => s.execute(env, events, status).await,
            Step::AksAddonPreflight(s) => s.execute(env, events, status).await,
            Step::Addons(s) => s.execute(env, events, status).await,
        }
    }
}

// ------------- shared step plumbing -------------

/// Terminal error transition; always returns false for tail position use.
pub(crate) fn fail(meta: &mut StepMeta, status: &dyn StatusSink, msg: String) -> bool {
    meta.state = StepState::Error;
    meta.msg = msg;
    status.update(meta);
    false
}

/// Engine-specific environment for the child process.
pub(crate) fn terraform_environ(sp: &ServicePrincipal, access: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("ARM_CLIENT_ID".to_string(), sp.client_id.clone()),
        ("ARM_CLIENT_SECRET".to_string(), sp.client_secret.clone()),
        ("ARM_TENANT_ID".to_string(), sp.tenant.clone()),
        ("ARM_ACCESS_KEY".to_string(), access.to_string()),
    ])
}

/// Merge extra vars over a base environment; extras win on conflict.
pub(crate) fn merge_env(
    base: &[(String, String)],
    extra: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> =
        base.iter().filter(|(k, _)| !extra.contains_key(k)).cloned().collect();
    out.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

/// Write text to `dir/log/name`. Best effort: errors are logged, not fatal.
pub(crate) fn write_text(dir: &Path, name: &str, text: &str) {
    let log_dir = dir.join("log");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        warn!(dir = %log_dir.display(), error = %e, "creating step log dir");
    }
    if let Err(e) = std::fs::write(log_dir.join(name), text) {
        warn!(file = %name, error = %e, "writing step log");
    }
}

/// Write env as a shell-sourceable export line to `dir/log/name`.
pub(crate) fn write_env(dir: &Path, name: &str, env: &BTreeMap<String, String>) {
    let mut line = String::from("export");
    for (k, v) in env {
        line.push(' ');
        line.push_str(k);
        line.push('=');
        line.push_str(v);
    }
    write_text(dir, name, &line);
}

/// Drain an apply/destroy stream to completion, narrating per-object progress,
/// then reap the child. Returns the last record seen, if any.
pub(crate) async fn drain_records(
    mut stream: ApplyStream,
    id: &StepId,
    events: &dyn EventSink,
    what: &str,
) -> Option<ApplyRecord> {
    let mut last = None;
    while let Some(r) = stream.records.recv().await {
        if !r.object.is_empty() {
            events.info(id, &format!("{} {}", r.object, r.action));
        }
        last = Some(r);
    }
    // Fakes carry no child; the channel close is authoritative either way.
    if let Some(mut child) = stream.child {
        if let Err(e) = child.wait().await {
            warn!(step = %id, what, error = %e, "waiting for engine process");
        }
    }
    last
}

#[cfg(test)]
pub(crate) mod testutil;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_formats() {
        let nsn = Nsn::new("default", "env314");
        assert_eq!(StepId::env_scoped(StepType::Infra, &nsn).short_name(), "Infra");
        assert_eq!(
            StepId::cluster_scoped(StepType::Addons, &nsn, "k").short_name(),
            "Addons.k"
        );
    }

    #[test]
    fn merge_env_prefers_extras() {
        let base = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("ARM_CLIENT_ID".to_string(), "stale".to_string()),
        ];
        let extra = BTreeMap::from([("ARM_CLIENT_ID".to_string(), "fresh".to_string())]);
        let merged = merge_env(&base, &extra);
        assert!(merged.contains(&("PATH".to_string(), "/usr/bin".to_string())));
        assert!(merged.contains(&("ARM_CLIENT_ID".to_string(), "fresh".to_string())));
        assert_eq!(merged.iter().filter(|(k, _)| k == "ARM_CLIENT_ID").count(), 1);
    }

    #[test]
    fn write_env_is_shell_sourceable() {
        let tmp = tempfile::tempdir().unwrap();
        let env = BTreeMap::from([
            ("ARM_CLIENT_ID".to_string(), "id".to_string()),
            ("ARM_TENANT_ID".to_string(), "t".to_string()),
        ]);
        write_env(tmp.path(), "infra.env", &env);
        let line = std::fs::read_to_string(tmp.path().join("log/infra.env")).unwrap();
        assert_eq!(line, "export ARM_CLIENT_ID=id ARM_TENANT_ID=t");
    }
}
