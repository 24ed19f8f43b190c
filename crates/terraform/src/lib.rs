//! Infrastructure-engine adapter: init/plan/output synchronously, apply and
//! destroy as streamed subprocesses.
//!
//! The async operations hand back a channel of progress records plus the child
//! process handle; the channel closes when the subprocess ends and the consumer
//! reaps the child afterwards. Fakes return no child; consumers tolerate that.

#![forbid(unsafe_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Child;
use tokio::sync::mpsc;

mod exe;
mod fake;
mod parse;

pub use exe::TerraformCli;
pub use fake::TerraformFake;
pub use parse::{parse_errors, parse_plan_counts, ApplyParser};

/// Result of a synchronous engine run (`init`, `plan`).
#[derive(Debug, Clone, Default)]
pub struct TfResult {
    /// Full engine output.
    pub text: String,
    /// Error lines; empty means success.
    pub errors: Vec<String>,
    /// Counts extracted from the plan summary line.
    pub plan_added: usize,
    pub plan_changed: usize,
    pub plan_deleted: usize,
}

/// Incremental progress record streamed during apply/destroy.
///
/// `object`/`action` are set for per-object lines; `text` accumulates the full
/// output so the last record always carries the complete log.
#[derive(Debug, Clone, Default)]
pub struct ApplyRecord {
    pub object: String,
    pub action: String,
    pub text: String,
    pub errors: Vec<String>,
    pub total_added: usize,
    pub total_changed: usize,
    pub total_destroyed: usize,
}

/// Handle for an in-flight apply/destroy: drain `records` to completion, then
/// wait on `child` for exit-status reaping.
pub struct ApplyStream {
    pub child: Option<Child>,
    pub records: mpsc::Receiver<ApplyRecord>,
}

/// Infrastructure-engine contract consumed by the steps.
#[async_trait]
pub trait Terraform: Send + Sync {
    async fn init(&self, env: &[(String, String)], dir: &Path) -> TfResult;
    async fn plan(&self, env: &[(String, String)], dir: &Path) -> TfResult;
    /// Engine output state as JSON (`output -json`).
    async fn output(&self, env: &[(String, String)], dir: &Path) -> Result<serde_json::Value>;
    async fn start_apply(&self, env: &[(String, String)], dir: &Path) -> Result<ApplyStream>;
    async fn start_destroy(&self, env: &[(String, String)], dir: &Path) -> Result<ApplyStream>;
}

fn queue_cap() -> usize {
    envop_core::env_parse("ENVOP_APPLY_QUEUE_CAP", 64)
}
