//! Kubeconfig step: extract cluster credentials from engine output state.

use crate::{fail, merge_env, terraform_environ, EventSink, StatusSink, StepMeta};
use envop_core::StepState;
use envop_addon::{render_kubeconfig, write_kubeconfig};
use envop_cloud::Cloud;
use envop_terraform::Terraform;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Writes the cluster's kubeconfig to `kc_path`. Must succeed before any
/// cluster-control step runs.
#[derive(Clone)]
pub struct KubeconfigStep {
    pub meta: StepMeta,

    /// Directory holding the engine state (same as the infra step's).
    pub tf_path: PathBuf,
    pub cluster_name: String,
    pub kc_path: PathBuf,
    /// State-store access key.
    pub access: String,
    pub cloud: Arc<dyn Cloud>,
    pub terraform: Arc<dyn Terraform>,
}

impl std::fmt::Debug for KubeconfigStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeconfigStep")
            .field("meta", &self.meta)
            .field("tf_path", &self.tf_path)
            .field("cluster_name", &self.cluster_name)
            .field("kc_path", &self.kc_path)
            .finish()
    }
}

impl KubeconfigStep {
    pub(crate) async fn execute(
        &mut self,
        env: &[(String, String)],
        _events: &dyn EventSink,
        status: &dyn StatusSink,
    ) -> bool {
        info!(step = %self.meta.id, cluster = %self.cluster_name, "start");

        self.meta.state = StepState::Running;
        self.meta.msg = "kubeconfig".into();
        status.update(&self.meta);

        let sp = match self.cloud.login().await {
            Ok(sp) => sp,
            Err(e) => return fail(&mut self.meta, status, e.to_string()),
        };
        let xenv = terraform_environ(&sp, &self.access);
        let env = merge_env(env, &xenv);

        let output = match self.terraform.output(&env, &self.tf_path).await {
            Ok(v) => v,
            Err(e) => return fail(&mut self.meta, status, format!("terraform output: {e}")),
        };
        let kc = match render_kubeconfig(&output, &self.cluster_name) {
            Ok(kc) => kc,
            Err(e) => return fail(&mut self.meta, status, e.to_string()),
        };
        if let Err(e) = write_kubeconfig(&self.kc_path, &kc) {
            return fail(&mut self.meta, status, e.to_string());
        }

        self.meta.state = StepState::Ready;
        self.meta.msg = "kubeconfig written".into();
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
    use envop_cloud::CloudFake;
    use envop_terraform::TerraformFake;

    fn step_with(tf: TerraformFake, kc_path: PathBuf) -> KubeconfigStep {
        let nsn = Nsn::new("default", "env314");
        KubeconfigStep {
            meta: StepMeta::new(StepId::cluster_scoped(StepType::Kubeconfig, &nsn, "k"), "h".into()),
            tf_path: "/tf".into(),
            cluster_name: "k".into(),
            kc_path,
            access: "acc".into(),
            cloud: Arc::new(CloudFake::default()),
            terraform: Arc::new(tf),
        }
    }

    #[tokio::test]
    async fn writes_kubeconfig_from_output_state() {
        let tmp = tempfile::tempdir().unwrap();
        let kc_path = tmp.path().join("kubeconfig");
        let mut step = step_with(TerraformFake::new().with_cluster_output("k"), kc_path.clone());
        let sinks = RecordingSinks::new();

        assert!(step.execute(&[], &sinks, &sinks).await);
        sinks.assert_transitions(StepState::Ready);
        let written = std::fs::read_to_string(&kc_path).unwrap();
        assert!(written.contains("https://fake.example:443"));
        let doc: serde_yaml::Value = serde_yaml::from_str(&written).unwrap();
        assert_eq!(doc["current-context"], serde_yaml::Value::from("k"));
    }

    #[tokio::test]
    async fn missing_cluster_in_output_is_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut step = step_with(TerraformFake::new(), tmp.path().join("kubeconfig"));
        let sinks = RecordingSinks::new();

        assert!(!step.execute(&[], &sinks, &sinks).await);
        sinks.assert_transitions(StepState::Error);
        assert!(step.meta.msg.contains("kube_admin_config"));
    }
}
