use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::info;

use envop_core::{ClusterSpec, EnvironmentStatus, InfraSpec, Nsn, StepState, StepStatus};
use envop_cloud::{AksFake, CloudFake, EnvSecrets};
use envop_addon::KubeCtlFake;
use envop_plan::Planner;
use envop_source::DirSource;
use envop_step::NoopExpander;
use envop_terraform::TerraformFake;

#[derive(Parser, Debug)]
#[command(name = "envopctl", version, about = "Envop planner CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Preview the step plan for an environment spec (offline; fake adapters)
    Plan {
        /// Environment spec file (YAML)
        #[arg(long = "spec")]
        spec: PathBuf,
        /// Root directory holding the workspace sources
        #[arg(long = "source-root")]
        source_root: PathBuf,
        /// Preview the destroy plan instead of create/update
        #[arg(long, action = ArgAction::SetTrue)]
        destroy: bool,
    },
}

/// On-disk environment declaration consumed by `plan`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvSpecFile {
    #[serde(default = "default_namespace")]
    namespace: String,
    name: String,
    infra: InfraSpec,
    #[serde(default)]
    clusters: Vec<ClusterSpec>,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize)]
struct PlannedStep {
    order: usize,
    step: String,
    hash: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = std::env::var("ENVOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Plan { spec, source_root, destroy } => plan(cli.output, &spec, &source_root, destroy).await,
    }
}

/// Walk the plan the way the reconcile loop would, marking each selected step
/// Ready, and print the resulting execution order.
async fn plan(output: Output, spec: &PathBuf, source_root: &PathBuf, destroy: bool) -> Result<()> {
    let text = std::fs::read_to_string(spec)
        .with_context(|| format!("reading spec {}", spec.display()))?;
    let env_spec: EnvSpecFile = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing spec {}", spec.display()))?;
    let nsn = Nsn::new(env_spec.namespace.clone(), env_spec.name.clone());

    let src = DirSource::new(source_root.clone());
    // Fake engine/cloud/cluster adapters: previewing only needs hashes and
    // ordering. Secret refs resolve from the environment.
    let planner = Planner::new(
        Arc::new(TerraformFake::new()),
        Arc::new(CloudFake::default()),
        Arc::new(AksFake::default()),
        Arc::new(KubeCtlFake::new()),
        Arc::new(NoopExpander),
        Arc::new(EnvSecrets),
    );

    let mut status = EnvironmentStatus::default();
    let mut planned = Vec::new();
    loop {
        let st = planner
            .next_step(&nsn, &src, destroy, &env_spec.infra, &env_spec.clusters, &status)
            .await?;
        let Some(st) = st else {
            break;
        };
        let meta = st.meta();
        planned.push(PlannedStep {
            order: planned.len() + 1,
            step: meta.id.short_name(),
            hash: meta.hash.clone(),
        });
        status.steps.insert(
            meta.id.short_name(),
            StepStatus { hash: meta.hash.clone(), state: StepState::Ready, msg: String::new() },
        );
        if planned.len() > 128 {
            bail!("plan walk did not converge");
        }
    }

    if planned.is_empty() {
        info!(env = %nsn, "nothing to do (are the workspace sources present under the source root?)");
    }
    match output {
        Output::Human => {
            for p in &planned {
                println!("{:>2}. {:<24} {}", p.order, p.step, p.hash);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&planned)?),
    }
    Ok(())
}
