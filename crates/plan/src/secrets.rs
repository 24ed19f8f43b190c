//! Secret-reference resolution: `vault:<path>:<field>` spec values are
//! replaced by materialized secrets before plan construction.

use anyhow::{anyhow, Context, Result};
use envop_core::InfraSpec;
use envop_cloud::SecretSource;

pub(crate) async fn resolve_secret_refs(
    mut ispec: InfraSpec,
    secrets: &dyn SecretSource,
) -> Result<InfraSpec> {
    for value in ispec.vars.values_mut() {
        if let Some(resolved) = resolve_one(value, secrets).await? {
            *value = resolved;
        }
    }
    if let Some(resolved) = resolve_one(&ispec.state.access, secrets).await? {
        ispec.state.access = resolved;
    }
    Ok(ispec)
}

async fn resolve_one(value: &str, secrets: &dyn SecretSource) -> Result<Option<String>> {
    let Some(rest) = value.strip_prefix("vault:") else {
        return Ok(None);
    };
    let (path, field) = rest
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("malformed secret reference {value:?}, want vault:<path>:<field>"))?;
    let resolved = secrets
        .secret(path, field)
        .await
        .with_context(|| format!("resolving {value:?}"))?;
    Ok(Some(resolved))
}
