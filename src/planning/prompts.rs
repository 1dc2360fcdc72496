//! Prompt builders for the planning phases.

/// P0: initial Gi/Fi extraction over the whole repository.
pub fn p0_initial(function_catalog: &str) -> String {
    format!(
        r#"You are a business-flow extraction assistant. Based on the repository in the
current working directory, extract the project's business flows and business-flow
groups as comma-separated lists of `Container.function` references
(e.g. `Cred.buyShareCred, BondingCurve.getPriceData`). Different business-flow
modules may live in the same file; one function may belong to several groups.

[Iterable output]
- Give every business-flow group a stable ID: G1, G2, ...
- Give every business flow a stable ID: F1, F2, ...
- Later refinements must reference these IDs; never renumber existing ones.

[Function naming rules]
- Use `Container.function` (contract, class, module, or library name).
- Overloads must carry a parameter-type signature: `Container.func(type1,type2)`.
- constructor/receive/fallback are written `Container.constructor`,
  `Container.receive`, `Container.fallback`.
- If only an interface call is visible and no implementation can be located,
  append `(interface)` — such refs are diagnostic only.

[First-round output]
1) Business-flow groups, one line each:
   Gi group-name: ContractA.func1, ContractA.func2, ContractB.func3 ...
   Include external entry points, shared internal pipeline functions, and the
   cross-contract dependencies they call.
2) Business flows within the groups, one line each:
   Fi flow-name (groups: Gx,...): ContractA.func1, ContractB.func2 ...
   A flow spanning several contracts lists every involved function on one line.
3) A completeness checklist of commonly missed categories (create/update,
   start/stop, single/batch, inflow/outflow, signature/merkle/permission
   checks, time windows, caps, indexing, events, upgrade/initialization,
   cross-chain assumptions), marking anything not yet covered as
   "needs second round".

[Available function catalog — use these names verbatim]
You MUST pick function names from the catalog below (exact string match).
Do NOT output functions outside the catalog (no external interfaces, library
or system functions), do NOT output constants, state variables, typehashes or
event names, and do NOT output bare function names without a container.

{function_catalog}"#
    )
}

/// P1: incremental augmentation over the P0 output.
pub fn p1_incremental(previous_output: &str) -> String {
    format!(
        r#"Based on the Gi/Fi you output in the previous round, perform an incremental
completion pass. Output only added or corrected lines; do not repeat lines that
are already complete.

1) First list the categories most at risk of being missed (fill these first):
   permissions/governance (set*/role/upgrade), allowlists; signature/merkle
   data management and verification branches; time windows/locks/caps;
   indexing/pagination/query flows; fund flows (refunds, fee routing,
   withdrawals); events; cross-chain or environment assumptions.

2) Output format (must reference existing IDs; `+` adds, `~` corrects):
   + Gi group-name: Container.func, Container.func ...
   ~ Fi flow-name (groups: Gx,...): Container.func, Container.func ...

3) If a function belongs to additional groups or flows, emit a `~` line for
   exactly the affected Gi/Fi.

4) Finish with the completeness checklist again, marking anything still
   uncovered.

====================
[Previous round output]
{previous_output}"#
    )
}

/// P2: converge P0 + P1 into one strict JSON object.
pub fn p2_final_json(p0_output: &str, p1_delta_output: &str) -> String {
    format!(
        r#"Produce the final, full list of business flows (Fi) as JSON for machine
parsing and persistence.

[Input]
1) First-round output (P0):
{p0_output}

2) Incremental output (P1, only +/~ lines):
{p1_delta_output}

[Output — a single JSON object, no other text]
{{
  "schema_version": "business_flow_planning_v1",
  "groups": [{{"group_id":"G1","group_name":"string","functions":["Contract.func"]}}],
  "flows": [
    {{
      "flow_id": "F1",
      "flow_name": "string",
      "group_ids": ["G1"],
      "function_refs": ["Contract.func", "Contract._internalFunc", "OtherContract.dep"]
    }}
  ]
}}

Constraints:
- `flows` must contain every Fi (full list) with stable, un-renumbered IDs.
- `function_refs` are `Container.function` strings in flow execution order.
- No external interfaces or dependencies (IERC20, IVault, ...), no constants,
  typehashes or event names, no bare function names."#
    )
}

/// Stricter reminder appended when a convergence output failed to parse.
pub fn json_retry_reminder(previous_attempt: &str) -> String {
    format!(
        r#"Your previous answer could not be parsed as a single JSON object. Output the
JSON object again. Output ONLY the JSON object: no markdown fence, no prose
before or after, double-quoted keys and strings, no trailing commas.

[Previous answer]
{previous_attempt}"#
    )
}

/// P3: group one batch of uncovered functions into NEW flows.
pub fn p3_repair_batch(
    existing_overview: &str,
    uncovered_functions: &str,
    next_group_id: &str,
    next_flow_id: &str,
    target_new_flows: usize,
) -> String {
    format!(
        r#"You are a business-flow completion assistant. A set of Gi/Fi already exists,
but some functions parsed from the repository are not covered by any flow.
Group these uncovered functions by business meaning and produce NEW
groups/flows only.

[Hard constraints]
- Only use function names from the uncovered list below (exact match).
- No functions outside that list (no external interfaces, libraries, system
  contracts), no constants, typehashes or event names, no bare names.
- Do NOT modify existing flows: no `~` lines, only `new_flows`.
- Prefer coarser flows: cover more functions with fewer, longer flows.
  Target about {target_new_flows} new flows (fewer is fine, more is not).

[Agentic workflow]
You may use read-only commands inside the working directory (rg/grep/cat/ls)
to confirm functions belong to the same business domain, but `function_refs`
must still come strictly from the uncovered list.

[Existing Gi/Fi overview — for naming only, not referencable functions]
{existing_overview}

[Uncovered functions — pick only from here]
{uncovered_functions}

[Output — a single JSON object, no other text]
{{
  "schema_version": "business_flow_coverage_repair_v1",
  "new_groups": [
    {{"group_id": "{next_group_id}", "group_name": "string", "functions": ["Contract.func"]}}
  ],
  "new_flows": [
    {{
      "flow_id": "{next_flow_id}",
      "flow_name": "string",
      "group_ids": ["{next_group_id}"],
      "function_refs": ["Contract.func", "Contract.func"]
    }}
  ]
}}

Rules: `new_flows` must be non-empty; `new_groups` may be empty; every
`function_refs` item must come from the uncovered list — when unsure, leave
the function out."#
    )
}

/// P4: incremental pass over the residual uncovered set.
pub fn p4_repair_incremental(batch_outputs: &str, residual_uncovered: &str) -> String {
    format!(
        r#"The repair round so far proposed the new flows below, yet some functions
remain uncovered. Do one more incremental pass: output only `+` lines for
additional new flows that pick up the residue, in the same
`+ Fi flow-name (groups: Gx): Container.func, ...` format. Only functions
from the residual list may appear; prefer attaching residue to few, coarse
flows. If nothing sensible remains, output nothing.

[Proposed so far]
{batch_outputs}

[Residual uncovered functions]
{residual_uncovered}"#
    )
}

/// P5: converge the whole repair round into one JSON delta.
pub fn p5_repair_final_json(
    round_outputs: &str,
    next_group_id: &str,
    next_flow_id: &str,
) -> String {
    format!(
        r#"Converge this repair round into its final JSON delta.

[Round output to converge]
{round_outputs}

[Output — a single JSON object, no other text]
{{
  "schema_version": "business_flow_coverage_repair_v1",
  "new_groups": [{{"group_id": "{next_group_id}", "group_name": "string", "functions": ["Contract.func"]}}],
  "new_flows": [{{"flow_id": "{next_flow_id}", "flow_name": "string", "group_ids": ["{next_group_id}"], "function_refs": ["Contract.func"]}}]
}}

Constraints:
- IDs continue strictly increasing from {next_group_id}/{next_flow_id};
  never reuse an existing ID.
- Merge duplicate proposals for the same functions into one flow.
- `function_refs` keep the `Container.function` form."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p0_embeds_catalog() {
        let prompt = p0_initial("Vault.deposit\nVault.withdraw");
        assert!(prompt.contains("Vault.deposit"));
        assert!(prompt.contains("G1, G2"));
    }

    #[test]
    fn p3_embeds_ids_and_batch() {
        let prompt = p3_repair_batch("G1 core: A.f", "B.h\nB.k", "G2", "F2", 3);
        assert!(prompt.contains("\"group_id\": \"G2\""));
        assert!(prompt.contains("\"flow_id\": \"F2\""));
        assert!(prompt.contains("B.h"));
    }
}
