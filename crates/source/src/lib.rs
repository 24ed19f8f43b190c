//! Workspace sources: on-disk source trees for environments and clusters.
//!
//! The planner consumes a `(path, hash, synced)` handle per workspace; how the
//! sources get on disk (git, volume mounts) is the surrounding shell's problem.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use envop_core::Nsn;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

/// An on-disk directory of source artifacts plus a content hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    /// Content hash of the tree; empty means "not ready".
    pub hash: String,
    /// True when the tree matches the upstream source.
    pub synced: bool,
}

/// Supplies workspaces for an environment.
///
/// `name == ""` denotes the infrastructure workspace; any other name the
/// named cluster workspace.
pub trait Sourcer: Send + Sync {
    fn workspace(&self, nsn: &Nsn, name: &str) -> Option<Workspace>;
}

/// Directory layout: `<root>/<namespace>/<name>/infra` for the infrastructure
/// workspace and `<root>/<namespace>/<name>/clusters/<cluster>` for clusters.
/// A workspace is synced when its directory exists; its hash covers file paths
/// and contents, excluding the `log/` directory steps write into.
pub struct DirSource {
    pub root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir_for(&self, nsn: &Nsn, name: &str) -> PathBuf {
        let base = self.root.join(&nsn.namespace).join(&nsn.name);
        if name.is_empty() {
            base.join("infra")
        } else {
            base.join("clusters").join(name)
        }
    }
}

impl Sourcer for DirSource {
    fn workspace(&self, nsn: &Nsn, name: &str) -> Option<Workspace> {
        let dir = self.dir_for(nsn, name);
        if !dir.is_dir() {
            return None;
        }
        match tree_hash(&dir) {
            Ok(hash) => Some(Workspace { path: dir, hash, synced: true }),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "hashing workspace");
                None
            }
        }
    }
}

/// Content hash of a directory tree: relative paths and file bytes in sorted
/// order, `log/` excluded so step output does not churn the hash.
pub fn tree_hash(dir: &Path) -> Result<String> {
    let mut files = BTreeMap::new();
    collect_files(dir, dir, &mut files)?;
    let mut hasher = Sha256::new();
    for (rel, path) in files {
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path, out: &mut BTreeMap<String, PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let ft = entry.file_type()?;
        if ft.is_dir() {
            if path.file_name().map(|n| n == "log").unwrap_or(false) {
                continue;
            }
            collect_files(root, &path, out)?;
        } else if ft.is_file() {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            out.insert(rel, path);
        }
    }
    Ok(())
}

/// Fixed in-memory sourcer for tests and offline plan previews.
#[derive(Default)]
pub struct FixedSource {
    workspaces: RwLock<BTreeMap<(Nsn, String), Workspace>>,
}

impl FixedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, nsn: Nsn, name: &str, ws: Workspace) {
        self.workspaces.write().unwrap().insert((nsn, name.to_string()), ws);
    }

    pub fn remove(&self, nsn: &Nsn, name: &str) {
        self.workspaces.write().unwrap().remove(&(nsn.clone(), name.to_string()));
    }
}

impl Sourcer for FixedSource {
    fn workspace(&self, nsn: &Nsn, name: &str) -> Option<Workspace> {
        self.workspaces.read().unwrap().get(&(nsn.clone(), name.to_string())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn tree_hash_is_stable_and_content_sensitive() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "main.tf", "resource {}");
        write(tmp.path(), "vars/common.tfvars", "a = 1");

        let h1 = tree_hash(tmp.path()).unwrap();
        let h2 = tree_hash(tmp.path()).unwrap();
        assert_eq!(h1, h2);

        write(tmp.path(), "main.tf", "resource { changed }");
        let h3 = tree_hash(tmp.path()).unwrap();
        assert_ne!(h1, h3);
    }

    #[test]
    fn tree_hash_ignores_log_dir() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "main.tf", "resource {}");
        let before = tree_hash(tmp.path()).unwrap();
        write(tmp.path(), "log/apply.txt", "Apply complete!");
        let after = tree_hash(tmp.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn dir_source_resolves_infra_and_cluster_workspaces() {
        let tmp = tempfile::tempdir().unwrap();
        let nsn = Nsn::new("default", "env314");
        write(&tmp.path().join("default/env314/infra"), "main.tf", "x");
        write(&tmp.path().join("default/env314/clusters/k"), "addons.yaml", "y");

        let src = DirSource::new(tmp.path());
        let infra = src.workspace(&nsn, "").expect("infra workspace");
        assert!(infra.synced);
        assert!(!infra.hash.is_empty());
        assert!(src.workspace(&nsn, "k").is_some());
        assert!(src.workspace(&nsn, "missing").is_none());
    }

    #[test]
    fn fixed_source_round_trip() {
        let src = FixedSource::new();
        let nsn = Nsn::new("default", "e");
        assert!(src.workspace(&nsn, "").is_none());
        src.insert(
            nsn.clone(),
            "",
            Workspace { path: "/ws".into(), hash: "abc".into(), synced: true },
        );
        let ws = src.workspace(&nsn, "").unwrap();
        assert_eq!(ws.hash, "abc");
    }
}
