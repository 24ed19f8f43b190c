//! Infra step: full engine `init → plan → apply` cycle with budget gating.

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

/// Creates or updates the environment's infrastructure.
#[derive(Clone)]
pub struct InfraStep {
    pub meta: StepMeta,

    /* parameters */
    pub values: InfraValues,
    /// Directory containing the infrastructure code; owned exclusively during
    /// execution.
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

impl std::fmt::Debug for InfraStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfraStep")
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

impl InfraStep {
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

        let sp = match self.cloud.login().await {
            Ok(sp) => sp,
            Err(e) => return fail(&mut self.meta, status, e.to_string()),
        };
        let xenv = terraform_environ(&sp, &self.values.infra.state.access);
        write_env(&self.source_path, "infra.env", &xenv); // aid for running the engine manually
        let env = merge_env(env, &xenv);

        let tfr = self.terraform.init(&env, &self.source_path).await;
        write_text(&self.source_path, "init.txt", &tfr.text);
        if let Some(first) = tfr.errors.first() {
            write_text(&self.source_path, "init.err", first);
            return fail(&mut self.meta, status, format!("terraform init {first}"));
        }

        // Plan
        self.meta.msg = "terraform plan".into();
        status.update(&self.meta);

        let tfr = self.terraform.plan(&env, &self.source_path).await;
        write_text(&self.source_path, "plan.txt", &tfr.text);
        if let Some(first) = tfr.errors.first() {
            write_text(&self.source_path, "plan.err", first);
            return fail(&mut self.meta, status, format!("terraform plan {first}"));
        }

        self.added = tfr.plan_added;
        self.changed = tfr.plan_changed;
        self.deleted = tfr.plan_deleted;
        if self.added == 0 && self.changed == 0 && self.deleted == 0 {
            self.meta.state = StepState::Ready;
            self.meta.msg = "terraform plan: nothing to do".into();
            status.update(&self.meta);
            return true;
        }

        // Budget gate: refuse catastrophic churn without operator intervention.
        let budget = &self.values.infra.budget;
        if let Some(limit) = budget.add_limit {
            if tfr.plan_added > limit as usize {
                let msg = format!("plan added {} exceeds addLimit {limit}", tfr.plan_added);
                return fail(&mut self.meta, status, msg);
            }
        }
        if let Some(limit) = budget.update_limit {
            if tfr.plan_changed > limit as usize {
                let msg = format!("plan changed {} exceeds updateLimit {limit}", tfr.plan_changed);
                return fail(&mut self.meta, status, msg);
            }
        }
        if let Some(limit) = budget.delete_limit {
            if tfr.plan_deleted > limit as usize {
                let msg = format!("plan deleted {} exceeds deleteLimit {limit}", tfr.plan_deleted);
                return fail(&mut self.meta, status, msg);
            }
        }

        // Apply
        self.meta.msg = format!(
            "terraform apply adds={} changes={} deletes={}",
            tfr.plan_added, tfr.plan_changed, tfr.plan_deleted
        );
        status.update(&self.meta);

        let stream = match self.terraform.start_apply(&env, &self.source_path).await {
            Ok(s) => s,
            Err(e) => {
                warn!(step = %self.meta.id, error = %e, "start terraform apply");
                events.warning(&self.meta.id, &format!("start terraform apply:{e}"));
                return fail(&mut self.meta, status, format!("start terraform apply:{e}"));
            }
        };

        let last = drain_records(stream, &self.meta.id, events, "terraform apply").await;
        let Some(last) = last else {
            let msg = "did not receive response from terraform apply".to_string();
            return fail(&mut self.meta, status, msg);
        };
        write_text(&self.source_path, "apply.txt", &last.text);

        if last.errors.is_empty() {
            self.meta.state = StepState::Ready;
            self.meta.msg = format!(
                "terraform apply errors=0 added={} changed={} deleted={}",
                last.total_added, last.total_changed, last.total_destroyed
            );
        } else {
            self.meta.state = StepState::Error;
            self.meta.msg = last.errors.join(", ");
            write_text(&self.source_path, "apply.err", &self.meta.msg);
        }
        self.added = last.total_added;
        self.changed = last.total_changed;
        self.deleted = last.total_destroyed;
        status.update(&self.meta);

        self.meta.state == StepState::Ready
    }
}
