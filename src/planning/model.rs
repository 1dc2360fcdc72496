//! Planning state: business-flow groups (Gi) and flows (Fi).
//!
//! IDs are append-only. Once `G3`/`F7` exist they are never recycled or
//! reordered; repair rounds allocate strictly increasing numbers, and any
//! delta that tries to reuse a number is remapped to a fresh one.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::catalog::{FunctionCatalog, RefResolution};

/// One business-flow group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanGroup {
    pub group_id: String,
    pub group_name: String,
    #[serde(default)]
    pub functions: Vec<String>,
}

/// One business flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFlow {
    pub flow_id: String,
    pub flow_name: String,
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default)]
    pub function_refs: Vec<String>,
}

/// Converged planning JSON (`business_flow_planning_v1`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningSnapshot {
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub groups: Vec<PlanGroup>,
    #[serde(default)]
    pub flows: Vec<PlanFlow>,
}

/// Repair delta (`business_flow_coverage_repair_v1`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairDelta {
    #[serde(default)]
    pub new_groups: Vec<PlanGroup>,
    #[serde(default)]
    pub new_flows: Vec<PlanFlow>,
}

/// A flow's refs classified against the catalog.
#[derive(Debug, Clone)]
pub struct ResolvedFlow {
    pub flow: PlanFlow,
    /// Catalog indices of matched refs, in ref order.
    pub matched: Vec<usize>,
    /// Signed names of matched refs, in ref order.
    pub matched_refs: Vec<String>,
    pub ambiguous_refs: Vec<String>,
    pub missing_refs: Vec<String>,
}

/// Mutable planning state across P0..P5.
#[derive(Debug, Clone, Default)]
pub struct PlanningState {
    pub groups: Vec<PlanGroup>,
    pub flows: Vec<PlanFlow>,
}

impl PlanningState {
    pub fn from_snapshot(snapshot: PlanningSnapshot) -> Self {
        let mut state = Self::default();
        state.merge_delta(RepairDelta {
            new_groups: snapshot.groups,
            new_flows: snapshot.flows,
        });
        state
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn next_group_id(&self) -> String {
        format!("G{}", max_numeric_id(self.groups.iter().map(|g| g.group_id.as_str()), 'G') + 1)
    }

    pub fn next_flow_id(&self) -> String {
        format!("F{}", max_numeric_id(self.flows.iter().map(|f| f.flow_id.as_str()), 'F') + 1)
    }

    /// Merge new groups and flows, enforcing append-only IDs.
    ///
    /// A delta entry whose ID collides with an existing one (or is
    /// malformed) gets the next free number; flow `group_ids` referencing a
    /// remapped group follow it. Flows left without any known group get a
    /// fallback group allocated.
    pub fn merge_delta(&mut self, delta: RepairDelta) {
        let mut group_remap: BTreeMap<String, String> = BTreeMap::new();

        for mut group in delta.new_groups {
            if !self.is_fresh_group_id(&group.group_id) {
                let fresh = self.next_group_id();
                group_remap.insert(group.group_id.clone(), fresh.clone());
                group.group_id = fresh;
            }
            self.groups.push(group);
        }

        for mut flow in delta.new_flows {
            if !self.is_fresh_flow_id(&flow.flow_id) {
                flow.flow_id = self.next_flow_id();
            }
            flow.group_ids = flow
                .group_ids
                .iter()
                .map(|id| group_remap.get(id).cloned().unwrap_or_else(|| id.clone()))
                .filter(|id| self.groups.iter().any(|g| &g.group_id == id))
                .collect();
            if flow.group_ids.is_empty() {
                let fallback = PlanGroup {
                    group_id: self.next_group_id(),
                    group_name: flow.flow_name.clone(),
                    functions: flow.function_refs.clone(),
                };
                flow.group_ids = vec![fallback.group_id.clone()];
                self.groups.push(fallback);
            }
            self.flows.push(flow);
        }
    }

    fn is_fresh_group_id(&self, id: &str) -> bool {
        parse_numeric_id(id, 'G').is_some() && !self.groups.iter().any(|g| g.group_id == id)
    }

    fn is_fresh_flow_id(&self, id: &str) -> bool {
        parse_numeric_id(id, 'F').is_some() && !self.flows.iter().any(|f| f.flow_id == id)
    }

    /// Classify every flow's refs against the catalog.
    pub fn resolve_flows(&self, catalog: &FunctionCatalog) -> Vec<ResolvedFlow> {
        self.flows
            .iter()
            .map(|flow| {
                let mut matched = Vec::new();
                let mut matched_refs = Vec::new();
                let mut ambiguous_refs = Vec::new();
                let mut missing_refs = Vec::new();
                for reference in &flow.function_refs {
                    match catalog.resolve(reference) {
                        RefResolution::Matched(idx) => {
                            matched.push(idx);
                            matched_refs.push(catalog.get(idx).signed_name());
                        }
                        RefResolution::Ambiguous(_) => ambiguous_refs.push(reference.clone()),
                        RefResolution::Missing => missing_refs.push(reference.clone()),
                    }
                }
                ResolvedFlow {
                    flow: flow.clone(),
                    matched,
                    matched_refs,
                    ambiguous_refs,
                    missing_refs,
                }
            })
            .collect()
    }

    /// Catalog indices covered by at least one flow's matched refs.
    pub fn covered_set(&self, catalog: &FunctionCatalog) -> BTreeSet<usize> {
        self.resolve_flows(catalog)
            .iter()
            .flat_map(|r| r.matched.iter().copied())
            .collect()
    }

    /// Fraction of the catalog referenced by at least one flow.
    pub fn coverage(&self, catalog: &FunctionCatalog) -> f64 {
        if catalog.is_empty() {
            return 1.0;
        }
        self.covered_set(catalog).len() as f64 / catalog.len() as f64
    }

    /// Short Gi/Fi overview embedded into repair prompts.
    pub fn overview(&self) -> String {
        let mut lines = Vec::new();
        for group in &self.groups {
            lines.push(format!(
                "{} {}: {}",
                group.group_id,
                group.group_name,
                group.functions.join(", ")
            ));
        }
        for flow in &self.flows {
            lines.push(format!(
                "{} {} (groups: {}): {}",
                flow.flow_id,
                flow.flow_name,
                flow.group_ids.join(","),
                flow.function_refs.join(", ")
            ));
        }
        lines.join("\n")
    }
}

fn parse_numeric_id(id: &str, prefix: char) -> Option<u32> {
    let rest = id.strip_prefix(prefix)?;
    rest.parse().ok()
}

fn max_numeric_id<'a>(ids: impl Iterator<Item = &'a str>, prefix: char) -> u32 {
    ids.filter_map(|id| parse_numeric_id(id, prefix))
        .max()
        .unwrap_or(0)
}

/// Fallback parser for the free-form P0/P1 overview lines:
///
/// ```text
/// G1 settlement: Vault.deposit, Vault.withdraw
/// F1 trade (groups: G1): Vault.deposit, Router.swap
/// + F2 claim (groups: G1): Vault.withdraw
/// ```
///
/// `+` lines add, `~` lines replace the named flow/group. Used as the last
/// good snapshot when P2 convergence fails twice.
pub fn parse_overview_lines(text: &str) -> PlanningSnapshot {
    let mut groups: Vec<PlanGroup> = Vec::new();
    let mut flows: Vec<PlanFlow> = Vec::new();

    for raw_line in text.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let replace = line.starts_with('~');
        line = line.trim_start_matches(['+', '~']).trim();

        // Refs never contain a colon, so the last one separates the head
        // (which may itself hold "(groups: ...)") from the ref list.
        let Some((head, refs_part)) = line.rsplit_once(':') else {
            continue;
        };
        let refs: Vec<String> = refs_part
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && s.contains('.'))
            .collect();
        if refs.is_empty() {
            continue;
        }

        let head = head.trim();
        let Some(id_token) = head.split_whitespace().next() else {
            continue;
        };

        if parse_numeric_id(id_token, 'G').is_some() {
            let name = head[id_token.len()..].trim().to_string();
            let group = PlanGroup {
                group_id: id_token.to_string(),
                group_name: name,
                functions: refs,
            };
            if replace {
                if let Some(existing) = groups.iter_mut().find(|g| g.group_id == group.group_id) {
                    *existing = group;
                    continue;
                }
            }
            if !groups.iter().any(|g| g.group_id == group.group_id) {
                groups.push(group);
            }
        } else if parse_numeric_id(id_token, 'F').is_some() {
            let mut name = head[id_token.len()..].trim().to_string();
            let mut group_ids = Vec::new();
            if let Some(open) = name.find('(') {
                let inner = name[open..].trim_start_matches('(').trim_end_matches(')');
                group_ids = inner
                    .trim_start_matches("groups:")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| parse_numeric_id(s, 'G').is_some())
                    .collect();
                name = name[..open].trim().to_string();
            }
            let flow = PlanFlow {
                flow_id: id_token.to_string(),
                flow_name: name,
                group_ids,
                function_refs: refs,
            };
            if replace {
                if let Some(existing) = flows.iter_mut().find(|f| f.flow_id == flow.flow_id) {
                    *existing = flow;
                    continue;
                }
            }
            if !flows.iter().any(|f| f.flow_id == flow.flow_id) {
                flows.push(flow);
            }
        }
    }

    PlanningSnapshot {
        schema_version: "business_flow_planning_v1".to_string(),
        groups,
        flows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FunctionEntry;

    fn entry(name: &str, file: &str, line: u32) -> FunctionEntry {
        FunctionEntry {
            name: name.to_string(),
            signature: None,
            visibility: "public".to_string(),
            content: format!("body({name})"),
            start_line: line,
            end_line: line + 5,
            relative_file_path: file.to_string(),
            absolute_file_path: format!("/abs/{file}"),
        }
    }

    fn catalog() -> FunctionCatalog {
        FunctionCatalog::from_entries(vec![
            entry("A.f", "a.sol", 1),
            entry("A.g", "a.sol", 20),
            entry("B.h", "b.sol", 1),
        ])
    }

    fn flow(id: &str, refs: &[&str]) -> PlanFlow {
        PlanFlow {
            flow_id: id.to_string(),
            flow_name: format!("flow {id}"),
            group_ids: vec!["G1".to_string()],
            function_refs: refs.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn group(id: &str) -> PlanGroup {
        PlanGroup {
            group_id: id.to_string(),
            group_name: format!("group {id}"),
            functions: vec![],
        }
    }

    #[test]
    fn coverage_counts_matched_refs_only() {
        let mut state = PlanningState::default();
        state.merge_delta(RepairDelta {
            new_groups: vec![group("G1")],
            new_flows: vec![flow("F1", &["A.f", "A.g", "External.x"])],
        });

        let c = catalog();
        let resolved = state.resolve_flows(&c);
        assert_eq!(resolved[0].matched.len(), 2);
        assert_eq!(resolved[0].missing_refs, vec!["External.x"]);
        assert!((state.coverage(&c) - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn merge_never_recycles_ids() {
        let mut state = PlanningState::default();
        state.merge_delta(RepairDelta {
            new_groups: vec![group("G1")],
            new_flows: vec![flow("F1", &["A.f"])],
        });

        // A delta reusing F1/G1 gets remapped, never replaces.
        state.merge_delta(RepairDelta {
            new_groups: vec![group("G1")],
            new_flows: vec![flow("F1", &["B.h"])],
        });

        let ids: Vec<_> = state.flows.iter().map(|f| f.flow_id.as_str()).collect();
        assert_eq!(ids, vec!["F1", "F2"]);
        let gids: Vec<_> = state.groups.iter().map(|g| g.group_id.as_str()).collect();
        assert_eq!(gids, vec!["G1", "G2"]);
        assert_eq!(state.next_flow_id(), "F3");
    }

    #[test]
    fn flow_without_known_group_gets_fallback() {
        let mut state = PlanningState::default();
        let mut orphan = flow("F1", &["A.f"]);
        orphan.group_ids = vec!["G9".to_string()];
        state.merge_delta(RepairDelta {
            new_groups: vec![],
            new_flows: vec![orphan],
        });
        assert_eq!(state.flows[0].group_ids.len(), 1);
        assert_eq!(state.groups.len(), 1);
        assert_eq!(state.flows[0].group_ids[0], state.groups[0].group_id);
    }

    #[test]
    fn overview_line_parser_handles_adds_and_edits() {
        let text = "\
G1 settlement: A.f, A.g
F1 trade (groups: G1): A.f, A.g
noise line without refs
+ F2 claim (groups: G1): B.h
~ F1 trade (groups: G1): A.f
";
        let snapshot = parse_overview_lines(text);
        assert_eq!(snapshot.groups.len(), 1);
        assert_eq!(snapshot.flows.len(), 2);
        assert_eq!(snapshot.flows[0].function_refs, vec!["A.f"]);
        assert_eq!(snapshot.flows[1].flow_id, "F2");
    }
}
