//! Addon step: apply manifest jobs to the target cluster.

use crate::{fail, EventSink, StatusSink, StepMeta};
use envop_core::StepState;
use envop_addon::KubeCtl;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Applies the cluster's addon manifest jobs, in spec order.
#[derive(Clone)]
pub struct AddonStep {
    pub meta: StepMeta,

    /* parameters */
    /// Cluster workspace directory holding the job files.
    pub source_path: PathBuf,
    pub kc_path: PathBuf,
    pub master_vault_path: PathBuf,
    pub job_paths: Vec<String>,
    pub values: BTreeMap<String, String>,
    pub kubectl: Arc<dyn KubeCtl>,

    /* results */
    pub applied: usize,
}

impl std::fmt::Debug for AddonStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonStep")
            .field("meta", &self.meta)
            .field("source_path", &self.source_path)
            .field("kc_path", &self.kc_path)
            .field("master_vault_path", &self.master_vault_path)
            .field("job_paths", &self.job_paths)
            .field("values", &self.values)
            .field("applied", &self.applied)
            .finish()
    }
}

impl AddonStep {
    pub(crate) async fn execute(
        &mut self,
        _env: &[(String, String)],
        events: &dyn EventSink,
        status: &dyn StatusSink,
    ) -> bool {
        info!(step = %self.meta.id, jobs = self.job_paths.len(), "start");

        self.meta.state = StepState::Running;
        self.meta.msg = "applying addons".into();
        status.update(&self.meta);

        let mut applied = 0;
        for job in &self.job_paths {
            events.info(&self.meta.id, &format!("apply {job}"));
            self.meta.msg = format!("applying {job}");
            status.update(&self.meta);

            let path = self.source_path.join(job);
            let outcome = match self
                .kubectl
                .apply_job(&self.kc_path, &path, &self.values, &self.master_vault_path)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => return fail(&mut self.meta, status, format!("addon {job}: {e}")),
            };
            applied += outcome.applied;
            if let Some(first) = outcome.failed.first() {
                // first failure only; the full list is in the logs
                return fail(&mut self.meta, status, format!("addon {job}: {first}"));
            }
        }

        self.applied = applied;
        self.meta.state = StepState::Ready;
        self.meta.msg = format!("addons applied jobs={} objects={}", self.job_paths.len(), applied);
        status.update(&self.meta);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingSinks;
    use crate::{StepId, StepType};
    use envop_core::Nsn;
    use envop_addon::{ApplyOutcome, KubeCtlFake};

    fn step_with(kubectl: Arc<KubeCtlFake>, jobs: &[&str]) -> AddonStep {
        let nsn = Nsn::new("default", "env314");
        AddonStep {
            meta: StepMeta::new(StepId::cluster_scoped(StepType::Addons, &nsn, "k"), "h".into()),
            source_path: "/ws/k".into(),
            kc_path: "/ws/k/kubeconfig".into(),
            master_vault_path: "/ws/k/vault".into(),
            job_paths: jobs.iter().map(|s| s.to_string()).collect(),
            values: BTreeMap::from([("region".to_string(), "westeurope".to_string())]),
            kubectl,
            applied: 0,
        }
    }

    #[tokio::test]
    async fn applies_jobs_in_order() {
        let kubectl = Arc::new(KubeCtlFake::new());
        let mut step = step_with(kubectl.clone(), &["ingress.yaml", "dns.yaml"]);
        let sinks = RecordingSinks::new();

        assert!(step.execute(&[], &sinks, &sinks).await);
        sinks.assert_transitions(StepState::Ready);
        assert_eq!(kubectl.jobs(), vec!["/ws/k/ingress.yaml", "/ws/k/dns.yaml"]);
        assert_eq!(step.applied, 2);
        assert_eq!(step.meta.msg, "addons applied jobs=2 objects=2");
    }

    #[tokio::test]
    async fn first_failed_document_stops_the_step() {
        let kubectl = Arc::new(KubeCtlFake::new().with_outcome(ApplyOutcome {
            applied: 1,
            failed: vec!["Deployment/nginx: forbidden".into(), "Service/x: denied".into()],
        }));
        let mut step = step_with(kubectl, &["ingress.yaml", "dns.yaml"]);
        let sinks = RecordingSinks::new();

        assert!(!step.execute(&[], &sinks, &sinks).await);
        sinks.assert_transitions(StepState::Error);
        assert_eq!(step.meta.msg, "addon ingress.yaml: Deployment/nginx: forbidden");
    }
}
