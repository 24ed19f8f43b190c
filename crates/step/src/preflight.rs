//! Addon preflight step: verify the cluster is reachable and ready.

use crate::{fail, EventSink, StatusSink, StepMeta};
use envop_core::StepState;
use envop_addon::KubeCtl;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Probes the target cluster before addons are applied.
#[derive(Clone)]
pub struct AksAddonPreflightStep {
    pub meta: StepMeta,

    pub kc_path: PathBuf,
    pub kubectl: Arc<dyn KubeCtl>,
}

impl std::fmt::Debug for AksAddonPreflightStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AksAddonPreflightStep")
            .field("meta", &self.meta)
            .field("kc_path", &self.kc_path)
            .finish()
    }
}

impl AksAddonPreflightStep {
    pub(crate) async fn execute(
        &mut self,
        _env: &[(String, String)],
        _events: &dyn EventSink,
        status: &dyn StatusSink,
    ) -> bool {
        info!(step = %self.meta.id, "start");

        self.meta.state = StepState::Running;
        self.meta.msg = "addon preflight".into();
        status.update(&self.meta);

        if let Err(e) = self.kubectl.cluster_ready(&self.kc_path).await {
            return fail(&mut self.meta, status, format!("preflight: {e}"));
        }

        self.meta.state = StepState::Ready;
        self.meta.msg = "cluster ready for addons".into();
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
    use envop_addon::KubeCtlFake;

    fn step_with(kubectl: KubeCtlFake) -> AksAddonPreflightStep {
        let nsn = Nsn::new("default", "env314");
        AksAddonPreflightStep {
            meta: StepMeta::new(
                StepId::cluster_scoped(StepType::AksAddonPreflight, &nsn, "k"),
                "h".into(),
            ),
            kc_path: "/ws/k/kubeconfig".into(),
            kubectl: Arc::new(kubectl),
        }
    }

    #[tokio::test]
    async fn ready_cluster_passes() {
        let mut step = step_with(KubeCtlFake::new());
        let sinks = RecordingSinks::new();
        assert!(step.execute(&[], &sinks, &sinks).await);
        sinks.assert_transitions(StepState::Ready);
        assert_eq!(step.meta.msg, "cluster ready for addons");
    }

    #[tokio::test]
    async fn unready_cluster_is_terminal() {
        let fake = KubeCtlFake::new().with_not_ready("nodes not ready: aks-1");
        let mut step = step_with(fake);
        let sinks = RecordingSinks::new();
        assert!(!step.execute(&[], &sinks, &sinks).await);
        sinks.assert_transitions(StepState::Error);
        assert!(step.meta.msg.contains("aks-1"));
    }
}
