//! Cloud collaborators: principal credentials, AKS node pools, secret values.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Short-lived service principal credentials.
#[derive(Debug, Clone, Default)]
pub struct ServicePrincipal {
    pub client_id: String,
    pub client_secret: String,
    pub tenant: String,
}

/// Provides principal credentials on demand.
#[async_trait]
pub trait Cloud: Send + Sync {
    async fn login(&self) -> Result<ServicePrincipal>;
}

/// Credentials handed in at construction time (mounted secret, CI env).
pub struct ConfigCloud {
    pub sp: ServicePrincipal,
}

#[async_trait]
impl Cloud for ConfigCloud {
    async fn login(&self) -> Result<ServicePrincipal> {
        Ok(self.sp.clone())
    }
}

/// Fake cloud; optionally failing to exercise error paths.
#[derive(Default)]
pub struct CloudFake {
    pub fail: bool,
}

#[async_trait]
impl Cloud for CloudFake {
    async fn login(&self) -> Result<ServicePrincipal> {
        if self.fail {
            return Err(anyhow!("fake login failure"));
        }
        Ok(ServicePrincipal {
            client_id: "fake-client".into(),
            client_secret: "fake-secret".into(),
            tenant: "fake-tenant".into(),
        })
    }
}

/// One AKS node pool as reported by the cloud.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NodePool {
    pub name: String,
    #[serde(rename = "orchestratorVersion")]
    pub orchestrator_version: String,
}

/// AKS node-pool operations used by the pool upgrade step.
#[async_trait]
pub trait AksClient: Send + Sync {
    async fn node_pools(
        &self,
        subscription: &str,
        resource_group: &str,
        cluster: &str,
    ) -> Result<Vec<NodePool>>;

    async fn upgrade_node_pool(
        &self,
        subscription: &str,
        resource_group: &str,
        cluster: &str,
        pool: &str,
        version: &str,
    ) -> Result<()>;
}

/// `az` CLI backed implementation (`ENVOP_AZ_BIN`, default `az`).
pub struct AzCli {
    bin: String,
}

impl AzCli {
    pub fn new() -> Self {
        Self { bin: std::env::var("ENVOP_AZ_BIN").unwrap_or_else(|_| "az".to_string()) }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(bin = %self.bin, ?args, "az");
        let out = tokio::process::Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning {}", self.bin))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!("{} {}: {}", self.bin, args.first().unwrap_or(&""), stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

impl Default for AzCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AksClient for AzCli {
    async fn node_pools(
        &self,
        subscription: &str,
        resource_group: &str,
        cluster: &str,
    ) -> Result<Vec<NodePool>> {
        let text = self
            .run(&[
                "aks", "nodepool", "list",
                "--subscription", subscription,
                "--resource-group", resource_group,
                "--cluster-name", cluster,
                "-o", "json",
            ])
            .await?;
        serde_json::from_str(&text).context("parsing nodepool list")
    }

    async fn upgrade_node_pool(
        &self,
        subscription: &str,
        resource_group: &str,
        cluster: &str,
        pool: &str,
        version: &str,
    ) -> Result<()> {
        self.run(&[
            "aks", "nodepool", "upgrade",
            "--subscription", subscription,
            "--resource-group", resource_group,
            "--cluster-name", cluster,
            "--name", pool,
            "--kubernetes-version", version,
            "-o", "none",
        ])
        .await
        .map(|_| ())
    }
}

/// Fake AKS client: serves a pool map and records upgrades.
#[derive(Default)]
pub struct AksFake {
    pools: Mutex<Vec<NodePool>>,
    upgraded: Mutex<Vec<(String, String)>>,
    pub fail: bool,
}

impl AksFake {
    pub fn new(pools: Vec<NodePool>) -> Self {
        Self { pools: Mutex::new(pools), ..Default::default() }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    /// `(pool, version)` pairs upgraded so far.
    pub fn upgraded(&self) -> Vec<(String, String)> {
        self.upgraded.lock().unwrap().clone()
    }
}

#[async_trait]
impl AksClient for AksFake {
    async fn node_pools(&self, _: &str, _: &str, _: &str) -> Result<Vec<NodePool>> {
        if self.fail {
            return Err(anyhow!("fake nodepool list failure"));
        }
        Ok(self.pools.lock().unwrap().clone())
    }

    async fn upgrade_node_pool(&self, _: &str, _: &str, _: &str, pool: &str, version: &str) -> Result<()> {
        if self.fail {
            return Err(anyhow!("fake nodepool upgrade failure"));
        }
        let mut pools = self.pools.lock().unwrap();
        if let Some(p) = pools.iter_mut().find(|p| p.name == pool) {
            p.orchestrator_version = version.to_string();
        }
        self.upgraded.lock().unwrap().push((pool.to_string(), version.to_string()));
        Ok(())
    }
}

/// Resolves symbolic secret references to concrete values.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn secret(&self, path: &str, field: &str) -> Result<String>;
}

/// Fixed map of `(path, field) -> value`; the test and preview double.
#[derive(Default)]
pub struct FixedSecrets {
    values: BTreeMap<(String, String), String>,
}

impl FixedSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, path: &str, field: &str, value: &str) -> Self {
        self.values.insert((path.to_string(), field.to_string()), value.to_string());
        self
    }
}

#[async_trait]
impl SecretSource for FixedSecrets {
    async fn secret(&self, path: &str, field: &str) -> Result<String> {
        self.values
            .get(&(path.to_string(), field.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("no secret for {}/{}", path, field))
    }
}

/// Development secret source reading `<PATH>_<FIELD>` env vars (uppercased,
/// non-alphanumerics mapped to `_`).
pub struct EnvSecrets;

#[async_trait]
impl SecretSource for EnvSecrets {
    async fn secret(&self, path: &str, field: &str) -> Result<String> {
        let key: String = format!("{}_{}", path, field)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        std::env::var(&key).map_err(|_| {
            warn!(var = %key, "secret env var not set");
            anyhow!("no secret env var {}", key)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aks_fake_tracks_upgrades() {
        let fake = AksFake::new(vec![
            NodePool { name: "system".into(), orchestrator_version: "1.27.3".into() },
            NodePool { name: "user".into(), orchestrator_version: "1.28.0".into() },
        ]);
        fake.upgrade_node_pool("s", "rg", "c", "system", "1.28.0").await.unwrap();
        assert_eq!(fake.upgraded(), vec![("system".to_string(), "1.28.0".to_string())]);
        let pools = fake.node_pools("s", "rg", "c").await.unwrap();
        assert!(pools.iter().all(|p| p.orchestrator_version == "1.28.0"));
    }

    #[tokio::test]
    async fn fixed_secrets_resolve_or_fail() {
        let secrets = FixedSecrets::new().insert("infra/state", "accessKey", "k3y");
        assert_eq!(secrets.secret("infra/state", "accessKey").await.unwrap(), "k3y");
        assert!(secrets.secret("infra/state", "other").await.is_err());
    }

    #[test]
    fn node_pool_parses_az_json() {
        let pools: Vec<NodePool> = serde_json::from_str(
            r#"[{"name": "system", "orchestratorVersion": "1.27.3", "count": 3}]"#,
        )
        .unwrap();
        assert_eq!(pools[0].orchestrator_version, "1.27.3");
    }
}
