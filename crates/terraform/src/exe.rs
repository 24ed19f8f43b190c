//! Engine CLI driver: spawns the binary, captures or streams its output.

use crate::{parse, queue_cap, ApplyRecord, ApplyStream, TfResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Runs the engine binary (`ENVOP_TF_BIN`, default `terraform`) as a
/// subprocess in the step's source directory.
pub struct TerraformCli {
    bin: String,
}

impl TerraformCli {
    pub fn new() -> Self {
        Self { bin: std::env::var("ENVOP_TF_BIN").unwrap_or_else(|_| "terraform".to_string()) }
    }

    fn command(&self, args: &[&str], env: &[(String, String)], dir: &Path) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .current_dir(dir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run to completion, returning combined stdout+stderr.
    async fn run_capture(&self, args: &[&str], env: &[(String, String)], dir: &Path) -> Result<String> {
        debug!(bin = %self.bin, ?args, dir = %dir.display(), "run");
        let out = self
            .command(args, env, dir)
            .output()
            .await
            .with_context(|| format!("spawning {} {}", self.bin, args.join(" ")))?;
        let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(text)
    }

    async fn start_streaming(
        &self,
        args: &[&str],
        env: &[(String, String)],
        dir: &Path,
    ) -> Result<ApplyStream> {
        debug!(bin = %self.bin, ?args, dir = %dir.display(), "start");
        let mut child = self
            .command(args, env, dir)
            .spawn()
            .with_context(|| format!("spawning {} {}", self.bin, args.join(" ")))?;

        let stdout = child.stdout.take().context("child stdout not piped")?;
        let mut stderr = child.stderr.take().context("child stderr not piped")?;

        let echo = envop_core::env_flag("ENVOP_TF_ECHO", false);
        let (tx, rx) = mpsc::channel::<ApplyRecord>(queue_cap());
        tokio::spawn(async move {
            let mut parser = parse::ApplyParser::new();

            // Read both pipes concurrently so neither can fill and stall the
            // child; stdout drives the record stream.
            let pump = async {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if echo {
                                debug!(line = %line, "engine");
                            }
                            if let Some(rec) = parser.push_line(&line) {
                                if tx.send(rec).await.is_err() {
                                    break; // receiver gone
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "reading engine stdout");
                            break;
                        }
                    }
                }
            };
            let errs = async {
                let mut buf = String::new();
                if let Err(e) = stderr.read_to_string(&mut buf).await {
                    warn!(error = %e, "reading engine stderr");
                }
                buf
            };
            let ((), stderr_text) = tokio::join!(pump, errs);

            for line in stderr_text.lines() {
                if let Some(rec) = parser.push_line(line) {
                    let _ = tx.send(rec).await;
                }
            }
            if let Some(rec) = parser.flush() {
                let _ = tx.send(rec).await;
            }
            // tx drops here; the channel close signals the end of the stream.
        });

        Ok(ApplyStream { child: Some(child), records: rx })
    }
}

impl Default for TerraformCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl crate::Terraform for TerraformCli {
    async fn init(&self, env: &[(String, String)], dir: &Path) -> TfResult {
        match self.run_capture(&["init", "-no-color", "-input=false"], env, dir).await {
            Ok(text) => {
                let errors = parse::parse_errors(&text);
                TfResult { text, errors, ..Default::default() }
            }
            Err(e) => TfResult { errors: vec![e.to_string()], ..Default::default() },
        }
    }

    async fn plan(&self, env: &[(String, String)], dir: &Path) -> TfResult {
        match self.run_capture(&["plan", "-no-color", "-input=false"], env, dir).await {
            Ok(text) => {
                let errors = parse::parse_errors(&text);
                let (plan_added, plan_changed, plan_deleted) = parse::parse_plan_counts(&text);
                TfResult { text, errors, plan_added, plan_changed, plan_deleted }
            }
            Err(e) => TfResult { errors: vec![e.to_string()], ..Default::default() },
        }
    }

    async fn output(&self, env: &[(String, String)], dir: &Path) -> Result<serde_json::Value> {
        let text = self.run_capture(&["output", "-no-color", "-json"], env, dir).await?;
        serde_json::from_str(&text).context("parsing engine output state")
    }

    async fn start_apply(&self, env: &[(String, String)], dir: &Path) -> Result<ApplyStream> {
        self.start_streaming(&["apply", "-auto-approve", "-no-color", "-input=false"], env, dir)
            .await
    }

    async fn start_destroy(&self, env: &[(String, String)], dir: &Path) -> Result<ApplyStream> {
        self.start_streaming(&["destroy", "-auto-approve", "-no-color", "-input=false"], env, dir)
            .await
    }
}
