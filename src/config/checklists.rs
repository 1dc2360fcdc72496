//! Built-in checklist table.
//!
//! Checklist authorship is external to the pipeline; this table carries a
//! compact default per rule key so a bare deployment produces meaningful
//! reasoning prompts. `[checklists]` entries in the config file replace a
//! key wholesale.

use std::collections::HashMap;
use std::sync::OnceLock;

pub fn builtin_checklists() -> &'static HashMap<String, Vec<String>> {
    static TABLE: OnceLock<HashMap<String, Vec<String>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        table.insert(
            "access_control".to_string(),
            to_items(&[
                "Missing or bypassable caller authorization on state-changing entry points",
                "Privileged setters (owner/admin/role) callable by unintended actors or without timelock",
                "Initialization and upgrade paths callable more than once or by arbitrary callers",
                "Signature, merkle proof, or allowlist verification that can be replayed or forged",
                "Cross-contract calls that trust unvalidated msg.sender or forwarded authority",
            ]),
        );
        table.insert(
            "asset_flow".to_string(),
            to_items(&[
                "Token or native-asset transfers whose accounting can diverge from balances",
                "Fee, refund, or payout computation subject to rounding or ordering abuse",
                "Reentrancy windows around external transfers before state is settled",
                "Deposits or withdrawals that can be replayed, front-run, or double-counted",
                "Funds that can become permanently locked or redirected to an attacker",
            ]),
        );
        table.insert(
            "state_consistency".to_string(),
            to_items(&[
                "State updated after external interaction so observers see stale values",
                "Invariant-bearing counters or supplies mutated on only one side of a pair",
                "Time-window, deadline, or epoch checks that are inconsistent across flows",
                "Batch operations whose partial failure leaves mixed committed state",
                "Pause, cap, or limit flags consulted on some paths but not others",
            ]),
        );
        table
    })
}

fn to_items(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
