//! Watcher role: budget control over the reasoning loop.
//!
//! The Watcher's contract is a decision table over observable loop state
//! (new non-duplicate findings, instruction repetition, remaining budget),
//! so it runs as a deterministic controller; only the Reasoner and Ideator
//! consume agent invocations. Every decision lands in the trace with the
//! same record shape an agent-played watcher would produce.

use std::collections::BTreeSet;

use super::trace::BudgetSnapshot;

/// Watcher verdict after a reasoner round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherDecision {
    Continue,
    Pivot,
    Stop,
}

impl WatcherDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatcherDecision::Continue => "continue",
            WatcherDecision::Pivot => "pivot",
            WatcherDecision::Stop => "stop",
        }
    }
}

/// Rolling watcher state across one task's rounds.
#[derive(Debug)]
pub struct WatcherState {
    max_rounds: u32,
    time_limit_sec: u64,
    rounds_used: u32,
    no_progress_rounds: u32,
    pending_hypotheses: usize,
    seen_descriptions: BTreeSet<String>,
    prev_round_instruction: Option<String>,
}

impl WatcherState {
    pub fn new(max_rounds: u32, time_limit_sec: u64) -> Self {
        Self {
            max_rounds: max_rounds.max(1),
            time_limit_sec,
            rounds_used: 0,
            no_progress_rounds: 0,
            pending_hypotheses: 0,
            seen_descriptions: BTreeSet::new(),
            prev_round_instruction: None,
        }
    }

    /// First instruction before any reasoner round.
    pub fn initial_instruction(&self, rule_key: &str) -> String {
        format!(
            "Round 1: audit the provided business flow against the '{rule_key}' \
             checklist end to end. Report every distinct high-confidence \
             vulnerability; report none if none hold up."
        )
    }

    /// Count a round's descriptions, returning how many are new.
    pub fn record_descriptions(&mut self, descriptions: &[String]) -> usize {
        let mut fresh = 0;
        for d in descriptions {
            if self.seen_descriptions.insert(normalize(d)) {
                fresh += 1;
            }
        }
        fresh
    }

    pub fn seen_count(&self) -> usize {
        self.seen_descriptions.len()
    }

    /// Normalized descriptions recorded so far, in stable order.
    pub fn seen_descriptions(&self) -> Vec<String> {
        self.seen_descriptions.iter().cloned().collect()
    }

    /// Ideator delivered hypotheses to probe.
    pub fn add_hypotheses(&mut self, count: usize) {
        self.pending_hypotheses += count;
    }

    pub fn remaining_rounds(&self) -> u32 {
        self.max_rounds.saturating_sub(self.rounds_used)
    }

    pub fn budget_snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            max_more_rounds: self.remaining_rounds(),
            time_limit_sec: self.time_limit_sec,
            no_progress_rounds: self.no_progress_rounds,
        }
    }

    /// Evaluate one finished reasoner round.
    ///
    /// Table: `continue` on new non-duplicate findings with budget left;
    /// `pivot` after two consecutive zero-progress rounds or a repeated
    /// instruction; `stop` on exhausted budget or when nothing is pending
    /// and nothing new appeared.
    pub fn evaluate(&mut self, new_findings: usize, instruction: &str) -> (WatcherDecision, String) {
        self.rounds_used += 1;
        let repeated = self.prev_round_instruction.as_deref() == Some(instruction);
        self.prev_round_instruction = Some(instruction.to_string());

        if new_findings == 0 {
            self.no_progress_rounds += 1;
        } else {
            self.no_progress_rounds = 0;
            // Fresh evidence settles previously open hypotheses.
            self.pending_hypotheses = self.pending_hypotheses.saturating_sub(new_findings);
        }

        if self.remaining_rounds() == 0 {
            return (WatcherDecision::Stop, "round budget exhausted".to_string());
        }
        if new_findings > 0 {
            return (
                WatcherDecision::Continue,
                format!("{new_findings} new finding(s), budget remains"),
            );
        }
        if self.no_progress_rounds >= 2 || repeated {
            return (
                WatcherDecision::Pivot,
                if repeated {
                    "instruction repeated without progress".to_string()
                } else {
                    "two consecutive rounds without new findings".to_string()
                },
            );
        }
        if self.pending_hypotheses == 0 {
            return (
                WatcherDecision::Stop,
                "no pending hypotheses and no new findings".to_string(),
            );
        }
        (
            WatcherDecision::Continue,
            format!("{} pending hypotheses to probe", self.pending_hypotheses),
        )
    }

    /// Instruction for the next round after `continue`.
    pub fn continue_instruction(&self, round: u32, rule_key: &str) -> String {
        format!(
            "Round {round}: continue the '{rule_key}' audit. {} distinct finding(s) are \
             already recorded; do not repeat them. Cover the checklist items and \
             code paths not yet addressed.",
            self.seen_descriptions.len()
        )
    }

    /// Instruction for the next round after `pivot`, folding in the
    /// Ideator's probes.
    pub fn pivot_instruction(&self, round: u32, rule_key: &str, probes: &[String]) -> String {
        let probe_lines = if probes.is_empty() {
            "- Re-examine cross-function state transitions for unchecked assumptions.".to_string()
        } else {
            probes
                .iter()
                .map(|p| format!("- {p}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "Round {round}: prior angles on '{rule_key}' are exhausted. Pivot to these \
             concrete probes and report only what survives them:\n{probe_lines}"
        )
    }
}

fn normalize(description: &str) -> String {
    description.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn zero_findings_first_round_stops() {
        // No pending hypotheses, nothing found: the loop has nothing to do.
        let mut w = WatcherState::new(4, 1800);
        let instruction = w.initial_instruction("access_control");
        let fresh = w.record_descriptions(&[]);
        let (decision, reason) = w.evaluate(fresh, &instruction);
        assert_eq!(decision, WatcherDecision::Stop);
        assert!(reason.contains("no pending hypotheses"));
    }

    #[test]
    fn new_findings_continue_until_budget_exhausted() {
        let mut w = WatcherState::new(2, 1800);
        let instruction = w.initial_instruction("asset_flow");

        let fresh = w.record_descriptions(&descs(&["D1", "D2"]));
        assert_eq!(fresh, 2);
        let (decision, _) = w.evaluate(fresh, &instruction);
        assert_eq!(decision, WatcherDecision::Continue);

        let next = w.continue_instruction(2, "asset_flow");
        let fresh = w.record_descriptions(&descs(&["D3"]));
        let (decision, reason) = w.evaluate(fresh, &next);
        assert_eq!(decision, WatcherDecision::Stop);
        assert!(reason.contains("budget"));
    }

    #[test]
    fn duplicates_do_not_count_as_progress() {
        let mut w = WatcherState::new(5, 1800);
        let i1 = w.initial_instruction("x");
        let fresh = w.record_descriptions(&descs(&["Same finding"]));
        assert_eq!(w.evaluate(fresh, &i1).0, WatcherDecision::Continue);

        let i2 = w.continue_instruction(2, "x");
        let fresh = w.record_descriptions(&descs(&["Same  finding"]));
        assert_eq!(fresh, 0, "whitespace-normalized duplicate");
        // One zero round, nothing pending: stop rather than burn budget.
        let (decision, _) = w.evaluate(fresh, &i2);
        assert_eq!(decision, WatcherDecision::Stop);
    }

    #[test]
    fn two_zero_rounds_pivot() {
        let mut w = WatcherState::new(6, 1800);
        let i1 = w.initial_instruction("x");
        w.record_descriptions(&descs(&["D1"]));
        assert_eq!(w.evaluate(1, &i1).0, WatcherDecision::Continue);

        w.add_hypotheses(2);
        let i2 = w.continue_instruction(2, "x");
        assert_eq!(w.evaluate(0, &i2).0, WatcherDecision::Continue);

        let i3 = w.continue_instruction(3, "x");
        let (decision, reason) = w.evaluate(0, &i3);
        assert_eq!(decision, WatcherDecision::Pivot);
        assert!(reason.contains("two consecutive"));
    }

    #[test]
    fn repeated_instruction_pivots() {
        let mut w = WatcherState::new(6, 1800);
        let i1 = w.initial_instruction("x");
        w.record_descriptions(&descs(&["D1"]));
        assert_eq!(w.evaluate(1, &i1).0, WatcherDecision::Continue);

        // Same instruction fed twice in a row.
        let (decision, reason) = w.evaluate(0, &i1);
        assert_eq!(decision, WatcherDecision::Pivot);
        assert!(reason.contains("repeated"));
    }

    #[test]
    fn budget_snapshot_tracks_remaining() {
        let mut w = WatcherState::new(3, 600);
        let i = w.initial_instruction("x");
        w.evaluate(1, &i);
        let snap = w.budget_snapshot();
        assert_eq!(snap.max_more_rounds, 2);
        assert_eq!(snap.time_limit_sec, 600);
    }
}
