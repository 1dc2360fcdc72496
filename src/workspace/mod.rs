//! Workspace resolution against the dataset manifest.
//!
//! Each project's sandbox root is computed from `<dataset_base>/datasets.json`
//! and validated to be a real directory contained in the dataset base. The
//! resolver never writes; a failed resolution aborts that project only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{AuditError, Result};

const MANIFEST_NAME: &str = "datasets.json";

/// One manifest entry: `{ "<project_id>": {"path": "<relative_dir>"} }`.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
}

/// Resolves and validates project workspace roots.
#[derive(Debug, Clone)]
pub struct WorkspaceResolver {
    dataset_base: PathBuf,
    entries: BTreeMap<String, ManifestEntry>,
}

impl WorkspaceResolver {
    /// Read the manifest and canonicalize the dataset base.
    pub fn load(dataset_base: &Path) -> Result<Self> {
        let dataset_base = dataset_base.canonicalize().map_err(|e| {
            AuditError::workspace(
                "<dataset>",
                format!("dataset base {} not accessible: {e}", dataset_base.display()),
            )
        })?;

        let manifest_path = dataset_base.join(MANIFEST_NAME);
        let content = std::fs::read_to_string(&manifest_path).map_err(|e| {
            AuditError::workspace(
                "<dataset>",
                format!("cannot read {}: {e}", manifest_path.display()),
            )
        })?;
        let entries: BTreeMap<String, ManifestEntry> =
            serde_json::from_str(&content).map_err(|e| {
                AuditError::workspace(
                    "<dataset>",
                    format!("malformed {}: {e}", manifest_path.display()),
                )
            })?;

        Ok(Self {
            dataset_base,
            entries,
        })
    }

    pub fn dataset_base(&self) -> &Path {
        &self.dataset_base
    }

    /// All project ids in the manifest, in stable order.
    pub fn project_ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Compute the canonical workspace root for a project.
    ///
    /// Guarantees on success: the path exists, is a directory, and its
    /// canonical form is a prefix-descendant of the dataset base.
    pub fn resolve(&self, project_id: &str) -> Result<PathBuf> {
        let entry = self.entries.get(project_id).ok_or_else(|| {
            AuditError::workspace(project_id, "project not present in dataset manifest")
        })?;

        let rel = entry.path.trim();
        if rel.is_empty() {
            return Err(AuditError::workspace(project_id, "manifest path is empty"));
        }

        let joined = self.dataset_base.join(rel);
        let root = joined.canonicalize().map_err(|e| {
            AuditError::workspace(
                project_id,
                format!("workspace {} not accessible: {e}", joined.display()),
            )
        })?;

        if !root.is_dir() {
            return Err(AuditError::workspace(
                project_id,
                format!("workspace {} is not a directory", root.display()),
            ));
        }

        if !root.starts_with(&self.dataset_base) {
            return Err(AuditError::workspace(
                project_id,
                format!(
                    "workspace {} escapes dataset base {}",
                    root.display(),
                    self.dataset_base.display()
                ),
            ));
        }

        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_manifest(base: &Path, body: &str) {
        fs::write(base.join(MANIFEST_NAME), body).unwrap();
    }

    #[test]
    fn resolves_project_under_base() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("vault-v2/src")).unwrap();
        write_manifest(dir.path(), r#"{"vault": {"path": "vault-v2"}}"#);

        let resolver = WorkspaceResolver::load(dir.path()).unwrap();
        let root = resolver.resolve("vault").unwrap();
        assert!(root.ends_with("vault-v2"));
        assert!(root.starts_with(resolver.dataset_base()));
    }

    #[test]
    fn rejects_escape_via_parent_components() {
        let dir = tempdir().unwrap();
        write_manifest(dir.path(), r#"{"evil": {"path": "../../../etc"}}"#);

        let resolver = WorkspaceResolver::load(dir.path()).unwrap();
        let err = resolver.resolve("evil").unwrap_err();
        assert!(matches!(err, AuditError::Workspace { .. }));
    }

    #[test]
    fn rejects_unknown_project_and_file_target() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        write_manifest(dir.path(), r#"{"flat": {"path": "notes.txt"}}"#);

        let resolver = WorkspaceResolver::load(dir.path()).unwrap();
        assert!(resolver.resolve("missing").is_err());
        assert!(resolver.resolve("flat").is_err());
    }

    #[test]
    fn lists_projects_in_stable_order() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        write_manifest(
            dir.path(),
            r#"{"zeta": {"path": "a"}, "alpha": {"path": "b"}}"#,
        );

        let resolver = WorkspaceResolver::load(dir.path()).unwrap();
        assert_eq!(resolver.project_ids(), vec!["alpha", "zeta"]);
    }
}
