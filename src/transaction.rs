//! Transactional turn execution.
//!
//! Every turn runs against a deep snapshot of the encounter: execute,
//! validate the post-state, then commit or restore. A bad oracle or a bad
//! roll can never leave a half-mutated combatant behind.

use crate::combatant::Status;
use crate::encounter::{EncounterState, LogEntry};
use crate::error::StateError;
use crate::intent::SourceTier;
use crate::validator::AbilityValidator;

/// Deep, independent copy of the encounter taken before execution.
pub struct Snapshot {
    state: EncounterState,
}

impl Snapshot {
    pub fn log_len(&self) -> usize {
        self.state.log.len()
    }
}

#[derive(Debug, Default)]
pub struct TransactionManager;

impl TransactionManager {
    pub fn new() -> Self {
        Self
    }

    pub fn begin(&self, state: &EncounterState) -> Snapshot {
        Snapshot {
            state: state.clone(),
        }
    }

    /// Restore the pre-turn state and append a rollback entry to the log.
    pub fn rollback(
        &self,
        state: &mut EncounterState,
        snapshot: Snapshot,
        combatant_id: &crate::combatant::CombatantId,
        reason: &str,
        source_tier: SourceTier,
    ) {
        tracing::warn!(combatant = %combatant_id, reason, "rolling back turn");
        let round = snapshot.state.round;
        *state = snapshot.state;
        state.log.push(LogEntry::Rollback {
            round,
            combatant_id: combatant_id.clone(),
            reason: reason.to_string(),
            source_tier,
        });
    }

    /// Post-turn validation: HP bounds, status/HP consistency, condition
    /// durations, action economy, ability-tag ownership.
    pub fn validate(
        &self,
        state: &EncounterState,
        validator: &AbilityValidator,
    ) -> Result<(), StateError> {
        for combatant in &state.combatants {
            if combatant.hp < 0 || combatant.hp > combatant.max_hp {
                return Err(StateError::HpOutOfBounds {
                    id: combatant.id.clone(),
                    hp: combatant.hp,
                    max_hp: combatant.max_hp,
                });
            }

            let down_status = matches!(
                combatant.status,
                Status::Unconscious | Status::Dead | Status::Stable
            );
            if down_status && combatant.hp != 0 {
                return Err(StateError::StatusMismatch {
                    id: combatant.id.clone(),
                    status: combatant.status.name().to_string(),
                    hp: combatant.hp,
                });
            }
            if combatant.hp == 0 && !down_status {
                return Err(StateError::StatusMismatch {
                    id: combatant.id.clone(),
                    status: combatant.status.name().to_string(),
                    hp: combatant.hp,
                });
            }

            for active in &combatant.conditions {
                if let crate::combatant::ConditionDuration::Rounds(remaining) = active.duration {
                    if remaining < 0 {
                        return Err(StateError::NegativeDuration {
                            id: combatant.id.clone(),
                            condition: active.condition.name().to_string(),
                        });
                    }
                }
            }

            if combatant.economy.movement_remaining < 0 {
                return Err(StateError::NegativeMovement {
                    id: combatant.id.clone(),
                    remaining: combatant.economy.movement_remaining,
                });
            }

            // No ability bleed: every carried ability must be tagged with
            // this combatant's own id and be canonical for it.
            let own_suffix = format!("_{}_ability]", combatant.id);
            for ability in &combatant.abilities {
                let canonical = validator
                    .canonical_set(&combatant.id)
                    .map(|set| set.contains(ability.name.to_lowercase().as_str()))
                    .unwrap_or(false);
                if !ability.tag.ends_with(&own_suffix) || !canonical {
                    return Err(StateError::ForeignAbility {
                        id: combatant.id.clone(),
                        ability: ability.name.clone(),
                        tag: ability.tag.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
