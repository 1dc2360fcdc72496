//! Prompt builders for the Reasoner and Ideator roles.

/// Reasoner: neutral checklist-driven audit with a fixed JSON output.
pub fn reasoner(
    business_flow_code: &str,
    rule_key: &str,
    checklist: &[String],
    watcher_instruction: &str,
) -> String {
    let checklist_lines = checklist
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {item}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"# Role
You are a senior smart contract / blockchain security auditor.

# Task
Perform a careful vulnerability assessment of the provided code using the
checklist below. Be neutral: vulnerabilities may or may not exist. You may
use read-only commands in the working directory (rg/grep/cat/ls) to confirm
cross-references before concluding.

# Instruction from the audit supervisor
{watcher_instruction}

# Checklist ({rule_key})
{checklist_lines}

# Hard Requirements
- Only report vulnerabilities that are high confidence and would cause real harm.
- Do NOT report intended design, best-practice suggestions, or hypothetical
  risks without exploitability.
- Each description must state the trigger conditions, the impact, concrete
  evidence locators (function, file, key statement), and a rebuttal of the
  obvious false-positive reading.
- Evidence MUST come from the provided code or repository (include file/line
  range and a short excerpt).
- Output MUST be a single JSON object matching the schema below. Output JSON only.
- If you find multiple distinct high-confidence vulnerabilities, include ALL
  of them as separate items (up to 5). Do NOT stop after the first.

# Output JSON Schema (MUST match exactly)
{{
  "schema_version": "1.0",
  "vulnerabilities": [{{"description": "string"}}]
}}

# Description length constraint
Keep each "description" around 100-200 English words (no shorter than ~80,
no longer than ~250).

# Notes
- "vulnerabilities" MUST be an array. It MAY be empty if nothing holds up.
- With N distinct vulnerabilities (2 <= N <= 5), return N items; with more
  than 5, return the 5 most harmful and certain.

# Code
{business_flow_code}"#
    )
}

/// Ideator: produce executable probes after the Watcher pivots.
pub fn ideator(
    rule_key: &str,
    last_instruction: &str,
    confirmed: &[String],
    budget_rounds_left: u32,
) -> String {
    let confirmed_block = if confirmed.is_empty() {
        "(none so far)".to_string()
    } else {
        confirmed
            .iter()
            .map(|d| format!("- {d}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"# Role
You are the ideation assistant of a smart-contract audit loop. The reasoning
rounds on the '{rule_key}' checklist have stalled and the supervisor decided
to pivot. {budget_rounds_left} round(s) remain.

# Last supervisor instruction
{last_instruction}

# Findings confirmed so far (do not re-derive these)
{confirmed_block}

# Task
Propose fresh, concrete attack hypotheses the previous rounds likely missed.
Every item must be executable by an auditor with read-only repository access:
name a specific keyword, file, function, or variable to look at.

# Output (a single JSON object, no other text)
{{
  "new_hypotheses": ["string"],
  "suggested_probes": ["string"],
  "expected_evidence": ["string"]
}}

Keep each list to at most 5 items; an empty list is allowed when the space
is genuinely exhausted."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoner_embeds_code_checklist_and_instruction() {
        let prompt = reasoner(
            "fn transfer() {}",
            "asset_flow",
            &["item one".to_string()],
            "Round 2: dig into fee paths",
        );
        assert!(prompt.contains("fn transfer() {}"));
        assert!(prompt.contains("1. item one"));
        assert!(prompt.contains("Round 2: dig into fee paths"));
        assert!(prompt.contains("\"schema_version\": \"1.0\""));
    }

    #[test]
    fn ideator_lists_confirmed_findings() {
        let prompt = ideator("x", "instr", &["D1".to_string()], 2);
        assert!(prompt.contains("- D1"));
        assert!(prompt.contains("new_hypotheses"));
    }
}
