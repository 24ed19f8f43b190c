//! Kubeconfig rendering from engine output state.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::Path;

/// Render a kubeconfig document from the engine's output state.
///
/// Expects `output[cluster].kube_admin_config` with `host` and base64
/// `client_certificate`/`client_key`/`cluster_ca_certificate` fields, the
/// shape AKS admin credentials take in the engine state.
pub fn render_kubeconfig(output: &Value, cluster: &str) -> Result<String> {
    let admin = output
        .get(cluster)
        .and_then(|c| c.get("kube_admin_config"))
        .with_context(|| format!("no kube_admin_config for cluster {cluster} in output state"))?;

    let field = |name: &str| -> Result<&str> {
        admin
            .get(name)
            .and_then(Value::as_str)
            .with_context(|| format!("kube_admin_config.{name} missing for cluster {cluster}"))
    };

    let user = format!("{cluster}-admin");
    let mut user_auth = json!({
        "client-certificate-data": field("client_certificate")?,
        "client-key-data": field("client_key")?,
    });
    // Basic-auth fields are optional; carry them when the engine exposes them.
    if let Some(username) = admin.get("username").and_then(Value::as_str) {
        user_auth["username"] = json!(username);
    }
    if let Some(password) = admin.get("password").and_then(Value::as_str) {
        user_auth["password"] = json!(password);
    }

    let config = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster,
            "cluster": {
                "server": field("host")?,
                "certificate-authority-data": field("cluster_ca_certificate")?,
            },
        }],
        "users": [{ "name": user, "user": user_auth }],
        "contexts": [{
            "name": cluster,
            "context": { "cluster": cluster, "user": user },
        }],
        "current-context": cluster,
    });

    serde_yaml::to_string(&config).context("rendering kubeconfig yaml")
}

/// Write a kubeconfig with owner-only permissions.
pub fn write_kubeconfig(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(())
}
