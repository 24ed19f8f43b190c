//! Destroy step: engine `init → destroy` for environment teardown.
//!
//! No budget gate; a destroy plan is intentional by type.

use crate::{
    drain_records, fail, merge_env, terraform_environ, write_env, write_text, EventSink,
    Expander, InfraValues, StatusSink, StepMeta,
};
use envop_core::StepState;
use envop_cloud::Cloud;
use envop_terraform::Terraform;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Tears down the environment's infrastructure.
#[derive(Clone)]
pub struct DestroyStep {
    pub meta: StepMeta,

    /* parameters */
    pub values: InfraValues,
    pub source_path: PathBuf,
    pub template_suffix: String,
    pub cloud: Arc<dyn Cloud>,
    pub terraform: Arc<dyn Terraform>,
    pub expander: Arc<dyn Expander>,

    /* results */
    pub added: usize,
    pub changed: usize,
    pub deleted: usize,
}

impl std::fmt::Debug for DestroyStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestroyStep")
            .field("meta", &self.meta)
            .field("values", &self.values)
            .field("source_path", &self.source_path)
            .field("template_suffix", &self.template_suffix)
            .field("added", &self.added)
            .field("changed", &self.changed)
            .field("deleted", &self.deleted)
            .finish()
    }
}

impl DestroyStep {
    pub(crate) async fn execute(
        &mut self,
        env: &[(String, String)],
        events: &dyn EventSink,
        status: &dyn StatusSink,
    ) -> bool {
        info!(step = %self.meta.id, "start");

        // Init
        self.meta.state = StepState::Running;
        self.meta.msg = "terraform init".into();
        status.update(&self.meta);

        if let Err(e) = self.expander.expand_all(&self.source_path, &self.template_suffix, &self.values) {
            return fail(&mut self.meta, status, e.to_string());
        }

        // Destroy needs the same principal as apply.
        let sp = match self.cloud.login().await {
            Ok(sp) => sp,
            Err(e) => return fail(&mut self.meta, status, e.to_string()),
        };
        let xenv = terraform_environ(&sp, &self.values.infra.state.access);
        write_env(&self.source_path, "infra.env", &xenv);
        let env = merge_env(env, &xenv);

        let tfr = self.terraform.init(&env, &self.source_path).await;
        write_text(&self.source_path, "init.txt", &tfr.text);
        if let Some(first) = tfr.errors.first() {
            write_text(&self.source_path, "init.err", first);
            return fail(&mut self.meta, status, format!("terraform init {first}"));
        }

        // Destroy
        self.meta.msg = "terraform destroy".into();
        status.update(&self.meta);

        let stream = match self.terraform.start_destroy(&env, &self.source_path).await {
            Ok(s) => s,
            Err(e) => {
                warn!(step = %self.meta.id, error = %e, "start terraform destroy");
                events.warning(&self.meta.id, &format!("start terraform destroy:{e}"));
                return fail(&mut self.meta, status, format!("start terraform destroy:{e}"));
            }
        };

        let last = drain_records(stream, &self.meta.id, events, "terraform destroy").await;
        let Some(last) = last else {
            let msg = "did not receive response from terraform destroy".to_string();
            return fail(&mut self.meta, status, msg);
        };
        write_text(&self.source_path, "destroy.txt", &last.text);

        if last.errors.is_empty() {
            self.meta.state = StepState::Ready;
            self.meta.msg = format!(
                "terraform destroy errors=0 added={} changed={} deleted={}",
                last.total_added, last.total_changed, last.total_destroyed
            );
        } else {
            self.meta.state = StepState::Error;
            self.meta.msg = last.errors.join(", ");
        }
        self.added = last.total_added;
        self.changed = last.total_changed;
        self.deleted = last.total_destroyed;
        status.update(&self.meta);

        self.meta.state == StepState::Ready
    }
}
