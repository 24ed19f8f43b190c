//! Scripted engine fake for tests and offline plan previews.

use crate::{ApplyRecord, ApplyStream, Terraform, TfResult};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Fake engine: returns configured results and records the operations invoked.
/// `start_*` returns no child handle, like the contract allows.
pub struct TerraformFake {
    pub init_result: TfResult,
    pub plan_result: TfResult,
    pub apply_records: Vec<ApplyRecord>,
    pub destroy_records: Vec<ApplyRecord>,
    pub output_value: serde_json::Value,
    /// When set, `start_apply`/`start_destroy` fail outright.
    pub fail_start: bool,
    calls: Mutex<Vec<String>>,
}

impl TerraformFake {
    /// A fake that succeeds end to end: one object added.
    pub fn new() -> Self {
        let summary = "Apply complete! Resources: 1 added, 0 changed, 0 destroyed.";
        Self {
            init_result: TfResult { text: "Terraform initialized.".into(), ..Default::default() },
            plan_result: TfResult {
                text: "Plan: 1 to add, 0 to change, 0 to destroy.".into(),
                plan_added: 1,
                ..Default::default()
            },
            apply_records: vec![
                ApplyRecord {
                    object: "null_resource.a".into(),
                    action: "Creating".into(),
                    text: "null_resource.a: Creating...".into(),
                    ..Default::default()
                },
                ApplyRecord { text: summary.into(), total_added: 1, ..Default::default() },
            ],
            destroy_records: vec![ApplyRecord {
                text: "Destroy complete! Resources: 1 destroyed.".into(),
                total_destroyed: 1,
                ..Default::default()
            }],
            output_value: json!({}),
            fail_start: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Configure plan counts (text kept in sync with the counts).
    pub fn with_plan_counts(mut self, added: usize, changed: usize, deleted: usize) -> Self {
        self.plan_result = TfResult {
            text: format!("Plan: {added} to add, {changed} to change, {deleted} to destroy."),
            plan_added: added,
            plan_changed: changed,
            plan_deleted: deleted,
            ..Default::default()
        };
        self
    }

    pub fn with_init_error(mut self, err: &str) -> Self {
        self.init_result = TfResult { errors: vec![err.to_string()], ..Default::default() };
        self
    }

    /// Seed output state with an admin kubeconfig block for `cluster`.
    pub fn with_cluster_output(mut self, cluster: &str) -> Self {
        self.output_value[cluster] = json!({
            "kube_admin_config": {
                "host": "https://fake.example:443",
                "client_certificate": "ZmFrZS1jZXJ0",
                "client_key": "ZmFrZS1rZXk=",
                "cluster_ca_certificate": "ZmFrZS1jYQ==",
                "username": "admin",
                "password": "hunter2",
            }
        });
        self
    }

    /// Operations invoked so far: "init", "plan", "output", "apply", "destroy".
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &str) {
        self.calls.lock().unwrap().push(op.to_string());
    }

    fn stream(records: Vec<ApplyRecord>) -> ApplyStream {
        let (tx, rx) = mpsc::channel(records.len().max(1));
        tokio::spawn(async move {
            for r in records {
                if tx.send(r).await.is_err() {
                    break;
                }
            }
        });
        ApplyStream { child: None, records: rx }
    }
}

impl Default for TerraformFake {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Terraform for TerraformFake {
    async fn init(&self, _env: &[(String, String)], _dir: &Path) -> TfResult {
        self.record("init");
        self.init_result.clone()
    }

    async fn plan(&self, _env: &[(String, String)], _dir: &Path) -> TfResult {
        self.record("plan");
        self.plan_result.clone()
    }

    async fn output(&self, _env: &[(String, String)], _dir: &Path) -> Result<serde_json::Value> {
        self.record("output");
        Ok(self.output_value.clone())
    }

    async fn start_apply(&self, _env: &[(String, String)], _dir: &Path) -> Result<ApplyStream> {
        self.record("apply");
        if self.fail_start {
            return Err(anyhow!("fake apply start failure"));
        }
        Ok(Self::stream(self.apply_records.clone()))
    }

    async fn start_destroy(&self, _env: &[(String, String)], _dir: &Path) -> Result<ApplyStream> {
        self.record("destroy");
        if self.fail_start {
            return Err(anyhow!("fake destroy start failure"));
        }
        Ok(Self::stream(self.destroy_records.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_streams_configured_records_without_child() {
        let fake = TerraformFake::new();
        let mut stream = fake.start_apply(&[], Path::new("/tmp")).await.unwrap();
        assert!(stream.child.is_none());
        let mut count = 0;
        let mut last = None;
        while let Some(r) = stream.records.recv().await {
            count += 1;
            last = Some(r);
        }
        assert_eq!(count, 2);
        assert_eq!(last.unwrap().total_added, 1);
        assert_eq!(fake.calls(), vec!["apply"]);
    }

    #[tokio::test]
    async fn cluster_output_has_admin_config() {
        let fake = TerraformFake::new().with_cluster_output("k");
        let out = fake.output(&[], Path::new("/tmp")).await.unwrap();
        assert_eq!(out["k"]["kube_admin_config"]["host"], "https://fake.example:443");
    }
}
