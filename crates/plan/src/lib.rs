//! The planner: decides which step an environment executes next.
//!
//! Current state lives as hashes of source code and parameters in the
//! environment status. When a plan step's hash differs from the stored one,
//! the step runs again; equal hashes mean up-to-date.

#![forbid(unsafe_code)]

use envop_core::{ClusterInfraSpec, ClusterSpec, EnvironmentStatus, InfraSpec, Nsn, StepState};
use envop_cloud::{AksClient, Cloud, SecretSource};
use envop_addon::KubeCtl;
use envop_source::Sourcer;
use envop_step::{
    AddonStep, AksAddonPreflightStep, AksPoolStep, DestroyStep, Expander, InfraStep, InfraValues,
    KubeconfigStep, Step, StepId, StepMeta, StepType, TEMPLATE_SUFFIX,
};
use envop_terraform::Terraform;
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

mod hash;
mod secrets;

pub use hash::{content_hash, HASH_ERROR};
use secrets::resolve_secret_refs;

/// Planner-boundary failures; per-step failures never surface here, they are
/// recorded in status by the steps themselves.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("secret reference: {0}")]
    Secret(#[from] anyhow::Error),
    #[error("expected plan for {0}")]
    MissingPlan(Nsn),
}

/// Builds plans and selects the next step per environment. Shared across
/// reconcile callers; the plan table is process-wide, keyed by `Nsn`.
pub struct Planner {
    pub terraform: Arc<dyn Terraform>,
    pub cloud: Arc<dyn Cloud>,
    pub azure: Arc<dyn AksClient>,
    pub kubectl: Arc<dyn KubeCtl>,
    pub expander: Arc<dyn Expander>,
    pub secrets: Arc<dyn SecretSource>,
    /// When non-empty, only these step types survive plan construction.
    pub allowed_step_types: HashSet<StepType>,
    pub template_suffix: String,
    current_plans: Mutex<HashMap<Nsn, Vec<Step>>>,
}

impl Planner {
    pub fn new(
        terraform: Arc<dyn Terraform>,
        cloud: Arc<dyn Cloud>,
        azure: Arc<dyn AksClient>,
        kubectl: Arc<dyn KubeCtl>,
        expander: Arc<dyn Expander>,
        secrets: Arc<dyn SecretSource>,
    ) -> Self {
        Self {
            terraform,
            cloud,
            azure,
            kubectl,
            expander,
            secrets,
            allowed_step_types: HashSet::new(),
            template_suffix: TEMPLATE_SUFFIX.to_string(),
            current_plans: Mutex::new(HashMap::new()),
        }
    }

    /// Decide what step should execute next.
    ///
    /// `Ok(None)` means no work: prerequisites missing, a step errored (reset
    /// required), or everything is up-to-date.
    pub async fn next_step(
        &self,
        nsn: &Nsn,
        src: &dyn Sourcer,
        destroy: bool,
        ispec: &InfraSpec,
        cspec: &[ClusterSpec],
        status: &EnvironmentStatus,
    ) -> Result<Option<Step>, PlanError> {
        if !status.steps_in_state(StepState::Error).is_empty() {
            // a step is in error state; it needs a reset to continue
            return Ok(None);
        }

        let running = status.steps_in_state(StepState::Running);
        if let Some(name) = running.first() {
            if let Some(st) = self.current_plan_step(nsn, name) {
                return Ok(Some(st));
            }
            // current plan may be empty due to a process restart
        }

        let ispec = resolve_secret_refs(ispec.clone(), self.secrets.as_ref()).await?;

        if !self.build_plan(nsn, src, destroy, &ispec, cspec) {
            return Ok(None);
        }

        if let Some(name) = running.first() {
            if let Some(st) = self.current_plan_step(nsn, name) {
                return Ok(Some(st));
            }
            warn!(request = %nsn, step = %name, "running step in status has no match in plan");
        }

        let st = self.select_step(nsn, status)?;
        if let Some(st) = &st {
            debug!(request = %nsn, step = %st.meta().id.short_name(), "next step");
        }
        Ok(st)
    }

    /// Build the plan for `nsn`. False when prerequisites are not fulfilled.
    fn build_plan(
        &self,
        nsn: &Nsn,
        src: &dyn Sourcer,
        destroy: bool,
        ispec: &InfraSpec,
        cspec: &[ClusterSpec],
    ) -> bool {
        let mut plans = self.current_plans.lock().unwrap();

        let built = if destroy {
            self.build_destroy_plan(nsn, src, ispec, cspec)
        } else {
            self.build_create_plan(nsn, src, ispec, cspec)
        };
        let Some(pl) = built else {
            return false;
        };

        counter!("plan_builds_total", 1u64);
        plans.insert(nsn.clone(), plan_filter(pl, &self.allowed_step_types));
        true
    }

    /// A plan that deletes the target environment: one destroy step.
    fn build_destroy_plan(
        &self,
        nsn: &Nsn,
        src: &dyn Sourcer,
        ispec: &InfraSpec,
        cspec: &[ClusterSpec],
    ) -> Option<Vec<Step>> {
        let tfw = src.workspace(nsn, "")?;
        if tfw.hash.is_empty() {
            return None;
        }
        let tf_path = tfw.path.join(&ispec.main);

        Some(vec![Step::Destroy(DestroyStep {
            meta: StepMeta::new(
                StepId::env_scoped(StepType::Destroy, nsn),
                content_hash(&(tfw.hash.as_str(),)),
            ),
            values: InfraValues { infra: ispec.clone(), clusters: cspec.to_vec() },
            source_path: tf_path,
            template_suffix: self.template_suffix.clone(),
            cloud: self.cloud.clone(),
            terraform: self.terraform.clone(),
            expander: self.expander.clone(),
            added: 0,
            changed: 0,
            deleted: 0,
        })])
    }

    /// A plan that creates or updates the target environment.
    fn build_create_plan(
        &self,
        nsn: &Nsn,
        src: &dyn Sourcer,
        ispec: &InfraSpec,
        cspec: &[ClusterSpec],
    ) -> Option<Vec<Step>> {
        let tfw = src.workspace(nsn, "")?;
        if !tfw.synced {
            return None;
        }
        let tf_path = tfw.path.join(&ispec.main);

        let cluster_infras: Vec<&ClusterInfraSpec> = cspec.iter().map(|c| &c.infra).collect();
        let h_env = content_hash(&(tfw.hash.as_str(), ispec, &cluster_infras));

        let mut pl = Vec::with_capacity(1 + 4 * cspec.len());
        pl.push(Step::Infra(InfraStep {
            meta: StepMeta::new(StepId::env_scoped(StepType::Infra, nsn), h_env.clone()),
            values: InfraValues { infra: ispec.clone(), clusters: cspec.to_vec() },
            source_path: tf_path.clone(),
            template_suffix: self.template_suffix.clone(),
            cloud: self.cloud.clone(),
            terraform: self.terraform.clone(),
            expander: self.expander.clone(),
            added: 0,
            changed: 0,
            deleted: 0,
        }));

        for cl in cspec {
            let cw = src.workspace(nsn, &cl.name)?;
            if cw.hash.is_empty() {
                return None;
            }

            let kc_path = cw.path.join("kubeconfig");
            let mv_path = cw.path.join(&cl.addons.mkv);

            pl.push(Step::AksPool(AksPoolStep {
                meta: StepMeta::new(
                    StepId::cluster_scoped(StepType::AksPool, nsn, &cl.name),
                    content_hash(&(
                        tfw.hash.as_str(),
                        &ispec.az.resource_group,
                        &cl.infra.version,
                    )),
                ),
                subscription: ispec.az.subscription.clone(),
                resource_group: ispec.az.resource_group.clone(),
                cluster: prefixed_cluster_name("aks", &ispec.env_name, &cl.name),
                version: cl.infra.version.clone(),
                azure: self.azure.clone(),
            }));
            pl.push(Step::Kubeconfig(KubeconfigStep {
                meta: StepMeta::new(
                    StepId::cluster_scoped(StepType::Kubeconfig, nsn, &cl.name),
                    content_hash(&(tfw.hash.as_str(),)),
                ),
                tf_path: tf_path.clone(),
                cluster_name: cl.name.clone(),
                kc_path: kc_path.clone(),
                access: ispec.state.access.clone(),
                cloud: self.cloud.clone(),
                terraform: self.terraform.clone(),
            }));
            pl.push(Step::AksAddonPreflight(AksAddonPreflightStep {
                meta: StepMeta::new(
                    StepId::cluster_scoped(StepType::AksAddonPreflight, nsn, &cl.name),
                    h_env.clone(),
                ),
                kc_path: kc_path.clone(),
                kubectl: self.kubectl.clone(),
            }));
            pl.push(Step::Addons(AddonStep {
                meta: StepMeta::new(
                    StepId::cluster_scoped(StepType::Addons, nsn, &cl.name),
                    content_hash(&(cw.hash.as_str(), &cl.addons.jobs, &cl.addons.x)),
                ),
                source_path: cw.path.clone(),
                kc_path,
                master_vault_path: mv_path,
                job_paths: cl.addons.jobs.clone(),
                values: cl.addons.x.clone(),
                kubectl: self.kubectl.clone(),
                applied: 0,
            }));
        }

        Some(pl)
    }

    /// The current plan's step with the given short name, if any.
    fn current_plan_step(&self, nsn: &Nsn, short_name: &str) -> Option<Step> {
        let plans = self.current_plans.lock().unwrap();
        plans
            .get(nsn)?
            .iter()
            .find(|st| st.meta().id.short_name() == short_name)
            .cloned()
    }

    /// Walk the plan in order and pick the first step whose hash drifted from
    /// status. The returned step might be in Running state; accepting it is
    /// the executor's call.
    fn select_step(&self, nsn: &Nsn, status: &EnvironmentStatus) -> Result<Option<Step>, PlanError> {
        let plans = self.current_plans.lock().unwrap();
        let pl = plans.get(nsn).ok_or_else(|| PlanError::MissingPlan(nsn.clone()))?;

        for st in pl {
            let short = st.meta().id.short_name();
            let Some(current) = status.steps.get(&short) else {
                // first time this step is seen
                return Ok(Some(st.clone()));
            };

            // Hash before state: a step that errored and whose inputs then
            // reverted is skipped.
            if current.hash == st.meta().hash {
                continue;
            }

            if current.state == StepState::Error {
                // no budget to retry
                return Ok(None);
            }

            return Ok(Some(st.clone()));
        }

        Ok(None)
    }
}

/// The cluster name as the cloud knows it; the same derivation lives in the
/// infrastructure code.
pub fn prefixed_cluster_name(resource: &str, env: &str, name: &str) -> String {
    let t = env.chars().last().map(String::from).unwrap_or_default();
    format!("{t}{resource}001{env}-{name}")
}

/// Keep only allowed step types; an empty allow-list keeps everything.
fn plan_filter(pl: Vec<Step>, allowed: &HashSet<StepType>) -> Vec<Step> {
    if allowed.is_empty() {
        return pl;
    }
    pl.into_iter().filter(|st| allowed.contains(&st.meta().id.step_type)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use envop_core::{ClusterAddonSpec, StepStatus};
    use envop_cloud::{AksFake, CloudFake, FixedSecrets};
    use envop_addon::KubeCtlFake;
    use envop_source::{FixedSource, Workspace};
    use envop_step::NoopExpander;
    use envop_terraform::TerraformFake;

    fn planner() -> Planner {
        planner_with_secrets(FixedSecrets::new())
    }

    fn planner_with_secrets(secrets: FixedSecrets) -> Planner {
        Planner::new(
            Arc::new(TerraformFake::new()),
            Arc::new(CloudFake::default()),
            Arc::new(AksFake::default()),
            Arc::new(KubeCtlFake::new()),
            Arc::new(NoopExpander),
            Arc::new(secrets),
        )
    }

    fn nsn() -> Nsn {
        Nsn::new("default", "env314")
    }

    fn specs() -> (InfraSpec, Vec<ClusterSpec>) {
        let ispec = InfraSpec { env_name: "xyz".into(), main: "infra".into(), ..Default::default() };
        let cspec = vec![ClusterSpec {
            name: "k".into(),
            infra: ClusterInfraSpec { version: "1.28.0".into(), ..Default::default() },
            addons: ClusterAddonSpec {
                mkv: "vault".into(),
                jobs: vec!["ingress.yaml".into()],
                ..Default::default()
            },
        }];
        (ispec, cspec)
    }

    fn sources() -> FixedSource {
        let src = FixedSource::new();
        src.insert(nsn(), "", Workspace { path: "/ws".into(), hash: "abc".into(), synced: true });
        src.insert(nsn(), "k", Workspace { path: "/ws/k".into(), hash: "k1".into(), synced: true });
        src
    }

    fn mark(status: &mut EnvironmentStatus, st: &Step, state: StepState) {
        status.steps.insert(
            st.meta().id.short_name(),
            StepStatus { hash: st.meta().hash.clone(), state, msg: String::new() },
        );
    }

    #[tokio::test]
    async fn fresh_environment_walks_plan_in_order() {
        let p = planner();
        let src = sources();
        let (ispec, cspec) = specs();
        let mut status = EnvironmentStatus::default();

        let want = ["Infra", "AksPool.k", "Kubeconfig.k", "AksAddonPreflight.k", "Addons.k"];
        for short in want {
            let st = p
                .next_step(&nsn(), &src, false, &ispec, &cspec, &status)
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("expected step {short}"));
            assert_eq!(st.meta().id.short_name(), short);
            mark(&mut status, &st, StepState::Ready);
        }

        // everything up-to-date now
        let st = p.next_step(&nsn(), &src, false, &ispec, &cspec, &status).await.unwrap();
        assert!(st.is_none());
    }

    #[tokio::test]
    async fn error_state_gates_all_progress() {
        let p = planner();
        let src = sources();
        let (ispec, cspec) = specs();

        let mut status = EnvironmentStatus::default();
        status.steps.insert(
            "AksPool.k".into(),
            StepStatus { hash: "stale".into(), state: StepState::Error, msg: "boom".into() },
        );

        let st = p.next_step(&nsn(), &src, false, &ispec, &cspec, &status).await.unwrap();
        assert!(st.is_none());
    }

    #[tokio::test]
    async fn running_step_is_returned_again() {
        let p = planner();
        let src = sources();
        let (ispec, cspec) = specs();

        let mut status = EnvironmentStatus::default();
        let first = p
            .next_step(&nsn(), &src, false, &ispec, &cspec, &status)
            .await
            .unwrap()
            .unwrap();
        mark(&mut status, &first, StepState::Running);

        let again = p
            .next_step(&nsn(), &src, false, &ispec, &cspec, &status)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.meta().id.short_name(), "Infra");
    }

    #[tokio::test]
    async fn missing_cluster_workspace_means_no_work() {
        let p = planner();
        let src = FixedSource::new();
        src.insert(nsn(), "", Workspace { path: "/ws".into(), hash: "abc".into(), synced: true });
        let (ispec, cspec) = specs();

        let st = p
            .next_step(&nsn(), &src, false, &ispec, &cspec, &EnvironmentStatus::default())
            .await
            .unwrap();
        assert!(st.is_none());
    }

    #[tokio::test]
    async fn unsynced_infra_workspace_means_no_work() {
        let p = planner();
        let src = sources();
        src.insert(nsn(), "", Workspace { path: "/ws".into(), hash: "abc".into(), synced: false });
        let (ispec, cspec) = specs();

        let st = p
            .next_step(&nsn(), &src, false, &ispec, &cspec, &EnvironmentStatus::default())
            .await
            .unwrap();
        assert!(st.is_none());
    }

    #[tokio::test]
    async fn destroy_plan_is_a_single_destroy_step() {
        let p = planner();
        let src = FixedSource::new();
        src.insert(nsn(), "", Workspace { path: "/ws".into(), hash: "xyz".into(), synced: true });
        let (ispec, cspec) = specs();

        let st = p
            .next_step(&nsn(), &src, true, &ispec, &cspec, &EnvironmentStatus::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(st.meta().id.short_name(), "Destroy");
        assert_eq!(st.meta().hash, content_hash(&("xyz",)));

        let plans = p.current_plans.lock().unwrap();
        assert_eq!(plans[&nsn()].len(), 1);
    }

    #[tokio::test]
    async fn plan_rebuild_is_pure() {
        let p = planner();
        let src = sources();
        let (ispec, cspec) = specs();
        let status = EnvironmentStatus::default();

        let fingerprint = |p: &Planner| -> Vec<(String, String)> {
            let plans = p.current_plans.lock().unwrap();
            plans[&nsn()]
                .iter()
                .map(|st| (st.meta().id.short_name(), st.meta().hash.clone()))
                .collect()
        };

        p.next_step(&nsn(), &src, false, &ispec, &cspec, &status).await.unwrap();
        let fp1 = fingerprint(&p);
        p.next_step(&nsn(), &src, false, &ispec, &cspec, &status).await.unwrap();
        let fp2 = fingerprint(&p);
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 5);

        // hashes are decoupled: changing an addon value only drifts Addons
        let mut cspec2 = cspec.clone();
        cspec2[0].addons.x.insert("region".into(), "northeurope".into());
        p.next_step(&nsn(), &src, false, &ispec, &cspec2, &status).await.unwrap();
        let fp3 = fingerprint(&p);
        for ((n1, h1), (n3, h3)) in fp1.iter().zip(fp3.iter()) {
            assert_eq!(n1, n3);
            if n1 == "Addons.k" {
                assert_ne!(h1, h3, "addon value change must drift the addon hash");
            } else {
                assert_eq!(h1, h3, "{n1} must not drift on addon value change");
            }
        }
    }

    #[tokio::test]
    async fn secret_refs_resolve_into_the_plan() {
        let secrets = FixedSecrets::new().insert("infra/kv", "pw", "s3cret");
        let p = planner_with_secrets(secrets);
        let src = sources();
        let (mut ispec, cspec) = specs();
        ispec.vars.insert("db_password".into(), "vault:infra/kv:pw".into());

        let st = p
            .next_step(&nsn(), &src, false, &ispec, &cspec, &EnvironmentStatus::default())
            .await
            .unwrap()
            .unwrap();
        match st {
            Step::Infra(infra) => assert_eq!(infra.values.infra.vars["db_password"], "s3cret"),
            other => panic!("expected infra step, got {}", other.meta().id),
        }
    }

    #[tokio::test]
    async fn secret_resolution_failure_propagates() {
        let p = planner();
        let src = sources();
        let (mut ispec, cspec) = specs();
        ispec.vars.insert("pw".into(), "vault:infra/kv:missing".into());

        let err = p
            .next_step(&nsn(), &src, false, &ispec, &cspec, &EnvironmentStatus::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::Secret(_)));
    }

    #[tokio::test]
    async fn allow_list_prunes_the_plan() {
        let mut p = planner();
        p.allowed_step_types = HashSet::from([StepType::Infra]);
        let src = sources();
        let (ispec, cspec) = specs();
        let mut status = EnvironmentStatus::default();

        let st = p
            .next_step(&nsn(), &src, false, &ispec, &cspec, &status)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(st.meta().id.short_name(), "Infra");
        mark(&mut status, &st, StepState::Ready);

        let st = p.next_step(&nsn(), &src, false, &ispec, &cspec, &status).await.unwrap();
        assert!(st.is_none());
    }

    #[test]
    fn prefixed_cluster_name_matches_infra_naming() {
        assert_eq!(prefixed_cluster_name("aks", "xyz", "k"), "zaks001xyz-k");
        assert_eq!(prefixed_cluster_name("aks", "prod", "cpe"), "daks001prod-cpe");
    }
}
