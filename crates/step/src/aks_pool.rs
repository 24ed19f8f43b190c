//! AKS pool step: reconcile node-pool Kubernetes versions.

use crate::{fail, EventSink, StatusSink, StepMeta};
use envop_core::StepState;
use envop_cloud::AksClient;
use std::sync::Arc;
use tracing::info;

/// Upgrades node pools whose orchestrator version differs from the desired
/// cluster version. Idempotent: up-to-date pools are left alone.
#[derive(Clone)]
pub struct AksPoolStep {
    pub meta: StepMeta,

    pub subscription: String,
    pub resource_group: String,
    /// Cloud-side cluster name (see `prefixed_cluster_name`).
    pub cluster: String,
    pub version: String,
    pub azure: Arc<dyn AksClient>,
}

impl std::fmt::Debug for AksPoolStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AksPoolStep")
            .field("meta", &self.meta)
            .field("subscription", &self.subscription)
            .field("resource_group", &self.resource_group)
            .field("cluster", &self.cluster)
            .field("version", &self.version)
            .finish()
    }
}

impl AksPoolStep {
    pub(crate) async fn execute(
        &mut self,
        _env: &[(String, String)],
        events: &dyn EventSink,
        status: &dyn StatusSink,
    ) -> bool {
        info!(step = %self.meta.id, cluster = %self.cluster, "start");

        self.meta.state = StepState::Running;
        self.meta.msg = "aks node pools".into();
        status.update(&self.meta);

        let pools = match self
            .azure
            .node_pools(&self.subscription, &self.resource_group, &self.cluster)
            .await
        {
            Ok(pools) => pools,
            Err(e) => return fail(&mut self.meta, status, format!("list node pools: {e}")),
        };

        let outdated: Vec<_> =
            pools.into_iter().filter(|p| p.orchestrator_version != self.version).collect();
        if outdated.is_empty() {
            self.meta.state = StepState::Ready;
            self.meta.msg = "node pools up-to-date".into();
            status.update(&self.meta);
            return true;
        }

        for pool in &outdated {
            events.info(
                &self.meta.id,
                &format!("upgrading pool {} {} -> {}", pool.name, pool.orchestrator_version, self.version),
            );
            self.meta.msg = format!("upgrading pool {}", pool.name);
            status.update(&self.meta);
            if let Err(e) = self
                .azure
                .upgrade_node_pool(
                    &self.subscription,
                    &self.resource_group,
                    &self.cluster,
                    &pool.name,
                    &self.version,
                )
                .await
            {
                return fail(&mut self.meta, status, format!("upgrade pool {}: {e}", pool.name));
            }
        }

        self.meta.state = StepState::Ready;
        self.meta.msg = format!("upgraded {} node pool(s) to {}", outdated.len(), self.version);
        status.update(&self.meta);
        true
    }
}
