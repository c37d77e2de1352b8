//! Compact combat-history summaries for the oracle prompt.
//!
//! The most recent turns are kept verbatim; older turns collapse to
//! one-line digests under a character budget; deaths, condition changes
//! and concentration drops since the digest cut ride along in a
//! "significant events" ribbon.

use crate::combatant::Status;
use crate::encounter::{EncounterState, TurnRecord};

#[derive(Debug, Clone)]
pub struct ContextSummariser {
    verbatim_turns: usize,
    char_budget: usize,
}

impl ContextSummariser {
    pub fn new(verbatim_turns: usize, char_budget: usize) -> Self {
        Self {
            verbatim_turns,
            char_budget,
        }
    }

    /// Render the prior-turn history for inclusion in the next prompt.
    pub fn summarise(&self, state: &EncounterState) -> String {
        let records: Vec<&TurnRecord> = state.turn_records().collect();
        if records.is_empty() {
            return String::from("No turns have been resolved yet.");
        }

        let verbatim_from = records.len().saturating_sub(self.verbatim_turns);
        let (older, recent) = records.split_at(verbatim_from);

        let mut out = String::new();

        // Digest lines for older turns, newest first until the budget runs
        // out, then emitted oldest-first.
        if !older.is_empty() {
            let mut digests: Vec<String> = Vec::new();
            let mut used = 0usize;
            for record in older.iter().rev() {
                let line = digest_line(record);
                if used + line.len() > self.char_budget {
                    break;
                }
                used += line.len();
                digests.push(line);
            }
            if !digests.is_empty() {
                out.push_str("## Earlier turns\n");
                for line in digests.iter().rev() {
                    out.push_str(line);
                    out.push('\n');
                }
            }

            let ribbon = significant_events(older);
            if !ribbon.is_empty() {
                out.push_str("## Significant events\n");
                for line in ribbon {
                    out.push_str(&line);
                    out.push('\n');
                }
            }
        }

        out.push_str("## Recent turns\n");
        for record in recent {
            out.push_str(&verbatim_entry(record));
            out.push('\n');
        }

        out
    }
}

/// `R{r}:{actor}→{action_type} on {target} ({hp_change})`
fn digest_line(record: &TurnRecord) -> String {
    let target = record
        .intent
        .targets()
        .first()
        .map(|t| t.as_str())
        .unwrap_or("-");
    let hp_change: i32 = record.results.hp_changes.iter().map(|h| h.delta).sum();
    format!(
        "R{}:{}->{} on {} ({:+})",
        record.round,
        record.combatant_id,
        record.intent.action_type(),
        target,
        hp_change
    )
}

fn verbatim_entry(record: &TurnRecord) -> String {
    let mut line = format!(
        "R{} {}: {} [{}]",
        record.round, record.combatant_id, record.intent, record.source_tier
    );
    for roll in &record.rolls {
        line.push_str(&format!(" | {}={} ({})", roll.expression, roll.result, roll.purpose));
    }
    for change in &record.results.hp_changes {
        line.push_str(&format!(" | {} hp {:+} -> {}", change.target, change.delta, change.new_hp));
    }
    if !record.narrative.is_empty() {
        line.push_str(" | ");
        line.push_str(&record.narrative);
    }
    line
}

/// Deaths, condition changes, concentration drops in the digested span.
fn significant_events(older: &[&TurnRecord]) -> Vec<String> {
    let mut events = Vec::new();
    for record in older {
        for (id, status) in &record.results.status_changes {
            match status {
                Status::Dead => events.push(format!("{id} died (R{})", record.round)),
                Status::Unconscious => {
                    events.push(format!("{id} fell unconscious (R{})", record.round))
                }
                _ => {}
            }
        }
        for (id, condition) in &record.results.conditions_applied {
            events.push(format!("{id} gained {condition} (R{})", record.round));
        }
        for (id, condition) in &record.results.conditions_removed {
            events.push(format!("{id} lost {condition} (R{})", record.round));
        }
        for (caster, spell) in &record.results.concentration_drops {
            events.push(format!(
                "{caster} lost concentration on {spell} (R{})",
                record.round
            ));
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combatant::{Combatant, CombatantId, Side};
    use crate::encounter::{Environment, HpChange, LogEntry, MechanicalResults};
    use crate::intent::{Intent, SourceTier};

    fn record(round: u32, actor: &str, target: &str, delta: i32) -> TurnRecord {
        TurnRecord {
            round,
            combatant_id: CombatantId::from(actor),
            intent: Intent::Attack {
                ability_name: "Claw".into(),
                targets: vec![CombatantId::from(target)],
                movement_cost: None,
            },
            rolls: vec![],
            results: MechanicalResults {
                hp_changes: vec![HpChange {
                    target: CombatantId::from(target),
                    delta,
                    new_hp: 10 + delta,
                }],
                ..Default::default()
            },
            narrative: String::new(),
            source_tier: SourceTier::Oracle,
        }
    }

    fn state_with_turns(n: u32) -> EncounterState {
        let mut state = EncounterState::new(
            vec![Combatant::new("a", "a", Side::Player).with_hp(10)],
            Environment::default(),
        );
        for round in 1..=n {
            state.log.push(LogEntry::Turn(record(round, "a", "b", -3)));
        }
        state
    }

    #[test]
    fn test_recent_turns_verbatim() {
        let state = state_with_turns(2);
        let summary = ContextSummariser::new(3, 1200).summarise(&state);
        assert!(summary.contains("## Recent turns"));
        assert!(!summary.contains("## Earlier turns"));
        assert!(summary.contains("attack (Claw)"));
    }

    #[test]
    fn test_older_turns_digested() {
        let state = state_with_turns(6);
        let summary = ContextSummariser::new(3, 1200).summarise(&state);
        assert!(summary.contains("## Earlier turns"));
        assert!(summary.contains("R1:a->attack on b (-3)"));
    }

    #[test]
    fn test_digest_budget_drops_oldest() {
        let state = state_with_turns(60);
        let summary = ContextSummariser::new(3, 60).summarise(&state);
        // Budget of 60 chars keeps only the newest couple of digests.
        assert!(!summary.contains("R1:a->"));
        assert!(summary.contains("R56:a->"));
    }

    #[test]
    fn test_significant_events_ribbon() {
        let mut state = state_with_turns(5);
        if let LogEntry::Turn(record) = &mut state.log[0] {
            record
                .results
                .status_changes
                .push((CombatantId::from("b"), Status::Dead));
        }
        let summary = ContextSummariser::new(2, 1200).summarise(&state);
        assert!(summary.contains("b died (R1)"));
    }
}
