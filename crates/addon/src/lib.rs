//! Cluster-control client: readiness probes and addon manifest application
//! against a cluster addressed by a kubeconfig file.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

mod apply;
mod kubeconfig;

pub use apply::KubeClient;
pub use kubeconfig::{render_kubeconfig, write_kubeconfig};

/// Result of applying one manifest job.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// Documents applied successfully.
    pub applied: usize,
    /// Failure messages, one per failed document.
    pub failed: Vec<String>,
}

/// Operations the addon steps need from a cluster.
#[async_trait]
pub trait KubeCtl: Send + Sync {
    /// Verify the cluster behind `kubeconfig` is reachable and every node is
    /// Ready.
    async fn cluster_ready(&self, kubeconfig: &Path) -> Result<()>;

    /// Apply one manifest job file after substituting `values` (plus the
    /// builtin `mkv` master-vault path).
    async fn apply_job(
        &self,
        kubeconfig: &Path,
        job: &Path,
        values: &BTreeMap<String, String>,
        master_vault_path: &Path,
    ) -> Result<ApplyOutcome>;
}

/// Scripted cluster-control fake.
#[derive(Default)]
pub struct KubeCtlFake {
    /// When set, `cluster_ready` fails with this message.
    pub not_ready: Option<String>,
    /// Outcome returned per `apply_job` call.
    pub outcome: ApplyOutcome,
    jobs: Mutex<Vec<String>>,
}

impl KubeCtlFake {
    pub fn new() -> Self {
        Self { outcome: ApplyOutcome { applied: 1, failed: vec![] }, ..Default::default() }
    }

    pub fn with_not_ready(mut self, msg: &str) -> Self {
        self.not_ready = Some(msg.to_string());
        self
    }

    pub fn with_outcome(mut self, outcome: ApplyOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Job paths applied so far.
    pub fn jobs(&self) -> Vec<String> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl KubeCtl for KubeCtlFake {
    async fn cluster_ready(&self, _kubeconfig: &Path) -> Result<()> {
        match &self.not_ready {
            Some(msg) => Err(anyhow!("{msg}")),
            None => Ok(()),
        }
    }

    async fn apply_job(
        &self,
        _kubeconfig: &Path,
        job: &Path,
        _values: &BTreeMap<String, String>,
        _master_vault_path: &Path,
    ) -> Result<ApplyOutcome> {
        self.jobs.lock().unwrap().push(job.to_string_lossy().into_owned());
        Ok(self.outcome.clone())
    }
}
