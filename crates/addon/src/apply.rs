//! kube-rs implementation of the cluster-control contract.

use crate::{ApplyOutcome, KubeCtl};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client, Config,
};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Applies manifests and probes readiness through the Kubernetes API.
pub struct KubeClient;

impl KubeClient {
    pub fn new() -> Self {
        Self
    }

    async fn client_for(kubeconfig: &Path) -> Result<Client> {
        let kc = Kubeconfig::read_from(kubeconfig)
            .with_context(|| format!("reading kubeconfig {}", kubeconfig.display()))?;
        let config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
            .await
            .context("building client config from kubeconfig")?;
        Client::try_from(config).context("building kube client")
    }
}

impl Default for KubeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KubeCtl for KubeClient {
    async fn cluster_ready(&self, kubeconfig: &Path) -> Result<()> {
        let client = Self::client_for(kubeconfig).await?;
        let nodes: Api<Node> = Api::all(client);
        let list = nodes.list(&ListParams::default()).await.context("listing nodes")?;
        if list.items.is_empty() {
            return Err(anyhow!("cluster has no nodes"));
        }
        let not_ready: Vec<String> = list
            .items
            .iter()
            .filter(|n| !node_is_ready(n))
            .filter_map(|n| n.metadata.name.clone())
            .collect();
        if !not_ready.is_empty() {
            return Err(anyhow!("nodes not ready: {}", not_ready.join(", ")));
        }
        Ok(())
    }

    async fn apply_job(
        &self,
        kubeconfig: &Path,
        job: &Path,
        values: &BTreeMap<String, String>,
        master_vault_path: &Path,
    ) -> Result<ApplyOutcome> {
        let manifest = tokio::fs::read_to_string(job)
            .await
            .with_context(|| format!("reading job {}", job.display()))?;
        let manifest = substitute_values(&manifest, values, master_vault_path);

        let client = Self::client_for(kubeconfig).await?;
        let discovery = Discovery::new(client.clone()).run().await.context("api discovery")?;

        let mut outcome = ApplyOutcome::default();
        for doc in split_docs(&manifest)? {
            match apply_doc(&client, &discovery, &doc).await {
                Ok(name) => {
                    info!(job = %job.display(), object = %name, "applied");
                    outcome.applied += 1;
                }
                Err(e) => {
                    warn!(job = %job.display(), error = %e, "apply failed");
                    outcome.failed.push(e.to_string());
                }
            }
        }
        Ok(outcome)
    }
}

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

/// Replace `${key}` occurrences with step values; `${mkv}` is builtin.
fn substitute_values(manifest: &str, values: &BTreeMap<String, String>, mkv: &Path) -> String {
    let mut out = manifest.replace("${mkv}", &mkv.to_string_lossy());
    for (k, v) in values {
        out = out.replace(&format!("${{{k}}}"), v);
    }
    out
}

/// Split a multi-document YAML manifest into JSON values, skipping empties.
fn split_docs(manifest: &str) -> Result<Vec<Json>> {
    use serde::Deserialize;
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_yaml::Value::deserialize(de).context("parsing manifest yaml")?;
        if value.is_null() {
            continue;
        }
        docs.push(serde_json::to_value(value).context("converting manifest yaml to json")?);
    }
    Ok(docs)
}

async fn apply_doc(client: &Client, discovery: &Discovery, doc: &Json) -> Result<String> {
    let (gvk, name, ns) = doc_target(doc)?;
    let (ar, namespaced) = find_api_resource(discovery, &gvk)?;
    let api: Api<DynamicObject> = if namespaced {
        match ns.as_deref() {
            Some(n) => Api::namespaced_with(client.clone(), n, &ar),
            None => return Err(anyhow!("{}/{}: namespace required for namespaced kind", gvk.kind, name)),
        }
    } else {
        Api::all_with(client.clone(), &ar)
    };
    let pp = PatchParams::apply("envop");
    api.patch(&name, &pp, &Patch::Apply(doc))
        .await
        .map_err(|e| anyhow!("{}/{}: {}", gvk.kind, name, e))?;
    Ok(format!("{}/{}", gvk.kind, name))
}

fn doc_target(doc: &Json) -> Result<(GroupVersionKind, String, Option<String>)> {
    let api_version = doc
        .get("apiVersion")
        .and_then(Json::as_str)
        .ok_or_else(|| anyhow!("manifest missing apiVersion"))?;
    let kind = doc
        .get("kind")
        .and_then(Json::as_str)
        .ok_or_else(|| anyhow!("manifest missing kind"))?;
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    let name = doc
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Json::as_str)
        .ok_or_else(|| anyhow!("manifest missing metadata.name"))?
        .to_string();
    let ns = doc
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(Json::as_str)
        .map(str::to_string);
    Ok((GroupVersionKind { group, version, kind: kind.to_string() }, name, ns))
}

fn find_api_resource(
    discovery: &Discovery,
    gvk: &GroupVersionKind,
) -> Result<(kube::core::ApiResource, bool)> {
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not served: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_values_and_builtin_mkv() {
        let mut values = BTreeMap::new();
        values.insert("region".to_string(), "westeurope".to_string());
        let out = substitute_values(
            "region: ${region}\nvault: ${mkv}\nkeep: ${unknown}",
            &values,
            Path::new("/ws/k/vault"),
        );
        assert!(out.contains("region: westeurope"));
        assert!(out.contains("vault: /ws/k/vault"));
        assert!(out.contains("keep: ${unknown}"));
    }

    #[test]
    fn splits_multi_doc_manifests() {
        let docs = split_docs("a: 1\n---\n---\nb: 2\n").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["a"], 1);
        assert_eq!(docs[1]["b"], 2);
    }

    #[test]
    fn doc_target_extracts_gvk_name_namespace() {
        let doc = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "nginx", "namespace": "web"},
        });
        let (gvk, name, ns) = doc_target(&doc).unwrap();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");
        assert_eq!(name, "nginx");
        assert_eq!(ns.as_deref(), Some("web"));
    }

    #[test]
    fn doc_target_core_group_is_empty() {
        let doc = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
        });
        let (gvk, _, ns) = doc_target(&doc).unwrap();
        assert_eq!(gvk.group, "");
        assert_eq!(ns, None);
    }

    #[test]
    fn doc_target_errors_are_friendly() {
        let e = doc_target(&serde_json::json!({"kind": "Foo"})).unwrap_err();
        assert!(e.to_string().contains("missing apiVersion"));
        let e = doc_target(&serde_json::json!({"apiVersion": "v1"})).unwrap_err();
        assert!(e.to_string().contains("missing kind"));
    }
}
