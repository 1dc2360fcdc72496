//! Validation prompt: evidence-based re-check of one candidate finding.

/// Build the strict JSON-only validation prompt.
pub fn build_validation_prompt(
    finding_json: &str,
    rule_key: &str,
    hint_file: &str,
    hint_function: &str,
) -> String {
    format!(
        r#"You are a professional smart-contract / blockchain security audit validator.
Your task is to re-confirm one candidate vulnerability finding.

[Workspace constraints — mandatory]
- Judge only from files under the current working directory (the workspace
  root); never reference or assume code, configuration, or deployment details
  outside it.
- Use read-only commands for search and cross-reference (rg/grep/ls/find/cat/
  sed -n); never attempt to write files.

[Agentic workflow — mandatory]
Before concluding, perform multi-step read-only retrieval (at least 3 steps,
at most 10):
  1) Locate the relevant code from the finding's keywords, function names,
     and file hints.
  2) Trace the call chain and the key condition branches (callers, callees,
     critical state variables).
  3) Verify the exploit preconditions (permissions, controllable inputs,
     external call sites, state-update ordering, boundary conditions).
  4) If the project carries documentation or specs, consult them first (see
     below).

[Documentation requirement]
If any documentation can explain whether the behavior is intended design,
consult it before concluding: README, docs/, spec/, design/, whitepaper or
audit markdown, contract header comments, NatSpec (@notice/@dev), and
comments on key constants.

[Questions you must answer]
Does the vulnerability exist? Is it a false positive? Is it intended design?
How severe is the impact, and how hard is it to exploit? Consult the
documentation where available.

[Output — very important: JSON only]
Output exactly one JSON object (no markdown, no extra prose) matching:
{{
  "schema_version": "validation_codex_v1",
  "status": "pending|intended_design|false_positive|vulnerability|vuln_high_cost|vuln_low_impact|not_sure",
  "confidence": "high|medium|low",
  "exists": true,
  "classification": "vulnerability|non_vulnerability|uncertain",
  "impact": "high|medium|low|unknown",
  "exploit_difficulty": "easy|medium|hard|unknown",
  "reason": "2-5 sentences explaining the conclusion, citing the evidence",
  "evidence": [
    {{
      "file": "path relative to the workspace root",
      "locator": "function/variable/key statement (line range or grep keyword)",
      "snippet": "<= 30 lines of the key fragment (optional, recommended)",
      "why": "how this evidence supports the judgement"
    }}
  ],
  "doc_references": [
    {{
      "file": "relative path",
      "locator": "section heading / keyword",
      "excerpt": "relevant quotation (optional)",
      "why": "how it indicates intended design or informs the impact"
    }}
  ],
  "attack_preconditions": ["preconditions if vulnerable; may be empty"],
  "attack_path": "exploitation path if vulnerable; empty string otherwise",
  "mitigation": "1-3 fix suggestions if vulnerable; empty string otherwise",
  "unknowns": ["if not_sure: what is missing and what would settle it"]
}}

[Judgement calibration — avoid false positives]
- intended_design: the behavior is backed by documentation, comments, or
  explicit logic, and no abuse path causes real damage.
- false_positive: the finding contradicts the code (condition absent,
  permission unobtainable, entry unreachable, variable not controllable,
  inverted logic).
- vulnerability: a realistic exploit path exists with concrete damage (fund
  loss, privilege escalation, locked assets, denial of service).
- vuln_high_cost: real, but exploitation needs high privilege, harsh chain
  conditions, complex multi-transaction timing, or prohibitive cost.
- vuln_low_impact: real, but the blast radius is marginal (edge users,
  negligible loss, self-inflicted preconditions).
- not_sure: retrieval inside the workspace was insufficient to decide (the
  unknowns list must say what is missing).

[Input: candidate finding_json]
{finding_json}

[Auxiliary hints (may be empty)]
rule_key: {rule_key}
hint_file: {hint_file}
hint_function: {hint_function}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_embeds_finding_and_hints() {
        let prompt = build_validation_prompt(
            r#"{"vulnerabilities":[{"description":"D"}]}"#,
            "asset_flow",
            "src/Vault.sol",
            "Fi:F1 trade [asset_flow]",
        );
        assert!(prompt.contains(r#""description":"D""#));
        assert!(prompt.contains("rule_key: asset_flow"));
        assert!(prompt.contains("validation_codex_v1"));
    }
}
