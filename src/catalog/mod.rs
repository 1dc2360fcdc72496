//! Function catalog built from the tree-sitter export.
//!
//! The export is produced by the external parsing step as a JSON array of
//! function records. The catalog exposes canonical identities
//! (`Container.name`, optionally with a parameter signature), bodies and
//! spans, and the reference resolution used to validate planner output.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AuditError, Result};

/// One parsed function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionEntry {
    /// Canonical identity: `Container.name`.
    pub name: String,
    /// Parameter-type signature, e.g. `(uint256,address)`, when the parser
    /// emits one (used to disambiguate overloads).
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub visibility: String,
    /// Full function body text.
    pub content: String,
    pub start_line: u32,
    pub end_line: u32,
    pub relative_file_path: String,
    pub absolute_file_path: String,
}

impl FunctionEntry {
    /// `Container.name(signature)` when a signature exists, else
    /// `Container.name`.
    pub fn signed_name(&self) -> String {
        match &self.signature {
            Some(sig) => format!("{}{}", self.name, sig),
            None => self.name.clone(),
        }
    }

    fn container(&self) -> &str {
        self.name.split('.').next().unwrap_or("")
    }

    fn bare_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }
}

/// Outcome of resolving one textual reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefResolution {
    /// Exactly one candidate.
    Matched(usize),
    /// Multiple candidates; the index is the deterministic first (ordered by
    /// file path, then start line).
    Ambiguous(usize),
    /// Nothing in the catalog matches.
    Missing,
}

/// Immutable per-project function set.
#[derive(Debug, Clone)]
pub struct FunctionCatalog {
    entries: Vec<FunctionEntry>,
    by_name: HashMap<String, Vec<usize>>,
    by_signed: HashMap<String, usize>,
}

impl FunctionCatalog {
    /// Load the export file and build the scannable set.
    ///
    /// Test functions and interface containers (`I` + uppercase, the
    /// Solidity convention) never enter the catalog.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AuditError::catalog(path, format!("cannot read export: {e}")))?;
        let raw: Vec<FunctionEntry> = serde_json::from_str(&content)
            .map_err(|e| AuditError::catalog(path, format!("malformed export: {e}")))?;

        let entries: Vec<FunctionEntry> = raw
            .into_iter()
            .filter(|f| !f.name.to_lowercase().contains("test"))
            .filter(|f| !is_interface_container(f.container()))
            .collect();

        if entries.is_empty() {
            return Err(AuditError::catalog(path, "export contains no scannable functions"));
        }

        Ok(Self::from_entries(entries))
    }

    /// Build a catalog from in-memory entries (tests, replays).
    pub fn from_entries(mut entries: Vec<FunctionEntry>) -> Self {
        entries.sort_by(|a, b| {
            (a.relative_file_path.as_str(), a.start_line)
                .cmp(&(b.relative_file_path.as_str(), b.start_line))
        });

        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_signed: HashMap<String, usize> = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            by_name.entry(entry.name.clone()).or_default().push(idx);
            if entry.signature.is_some() {
                by_signed.entry(entry.signed_name()).or_insert(idx);
            }
        }

        Self {
            entries,
            by_name,
            by_signed,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, ordered by (file path, start line).
    pub fn list(&self) -> &[FunctionEntry] {
        &self.entries
    }

    pub fn get(&self, idx: usize) -> &FunctionEntry {
        &self.entries[idx]
    }

    /// Map an external textual reference to a catalog entry.
    ///
    /// Normalization: whitespace stripped; `constructor`/`receive`/`fallback`
    /// mapped to their canonical member names; a signature-exact match wins;
    /// otherwise the `Container.name` buckets decide, with multi-match
    /// flagged ambiguous.
    pub fn resolve(&self, reference: &str) -> RefResolution {
        let normalized = normalize_ref(reference);
        if normalized.is_empty() {
            return RefResolution::Missing;
        }

        if let Some(&idx) = self.by_signed.get(&normalized) {
            return RefResolution::Matched(idx);
        }

        let base = strip_signature(&normalized);
        match self.by_name.get(base) {
            Some(indices) if indices.len() == 1 => RefResolution::Matched(indices[0]),
            Some(indices) => RefResolution::Ambiguous(indices[0]),
            None => RefResolution::Missing,
        }
    }

    /// Newline-separated identity list embedded into planning prompts.
    pub fn identity_block(&self) -> String {
        let mut lines: Vec<String> = self.entries.iter().map(|e| e.signed_name()).collect();
        lines.sort();
        lines.join("\n")
    }
}

fn is_interface_container(container: &str) -> bool {
    let mut chars = container.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some('I'), Some(second)) if second.is_ascii_uppercase()
    )
}

/// Strip whitespace and canonicalize special member names.
fn normalize_ref(reference: &str) -> String {
    let compact: String = reference.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact.trim_end_matches("(interface)").to_string();

    // `Vault.constructor()` and `Vault.Vault` both mean the constructor.
    if let Some((container, member)) = compact.rsplit_once('.') {
        let member_base = member.split('(').next().unwrap_or(member);
        for special in ["constructor", "receive", "fallback"] {
            if member_base.eq_ignore_ascii_case(special) {
                return format!("{container}.{special}");
            }
        }
        if member_base == container {
            return format!("{container}.constructor");
        }
    }
    compact
}

fn strip_signature(reference: &str) -> &str {
    reference.split('(').next().unwrap_or(reference)
}
