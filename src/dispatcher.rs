//! Legendary-action and reaction dispatch.
//!
//! Legendary creatures act between other combatants' turns, drawing from a
//! per-round pool; each legendary action is a miniature resolution under
//! its own nested transaction. Non-opportunity reactions (shield,
//! counterspell) are synchronous hooks the rules engine invokes while an
//! attack or spell is in flight: a reacting combatant spends its reaction
//! and mutates the pending resolution before the outcome is committed.

use crate::combatant::{AbilityKind, Combatant, CombatantId, ReactionEffect};
use crate::encounter::{EncounterState, LogEntry, MechanicalResults, TurnRecord};
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::intent::{Intent, SourceTier};
use crate::oracle::{CancelToken, OracleFn, OracleGateway, RollFn};
use crate::rules::{RulesEngine, TurnRolls};
use crate::transaction::TransactionManager;
use crate::validator::AbilityValidator;

// ============================================================================
// Reaction hooks
// ============================================================================

/// An attack roll awaiting its outcome. Reactors may raise the effective
/// AC before the hit is determined.
#[derive(Debug)]
pub struct AttackContext {
    pub attacker: CombatantId,
    pub target: CombatantId,
    pub natural: i32,
    pub total: i32,
    pub effective_ac: i32,
}

/// A spell in flight. Reactors may negate it outright.
#[derive(Debug)]
pub struct SpellContext {
    pub caster: CombatantId,
    pub spell: String,
    pub negated: bool,
}

/// Dispatches reaction hooks from the rules engine.
#[derive(Debug)]
pub struct ReactionDispatcher {
    enabled: bool,
}

impl ReactionDispatcher {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    /// A dispatcher that never reacts, used for nested resolutions
    /// (opportunity attacks are not themselves reactable).
    pub const fn disabled() -> Self {
        Self { enabled: false }
    }

    /// Invoked after the attack roll, before the hit is determined. The
    /// target may spend its reaction on an AC-raising ability if that
    /// would turn the hit into a miss.
    pub fn on_attack_resolved(
        &self,
        state: &mut EncounterState,
        context: &mut AttackContext,
        _results: &mut MechanicalResults,
    ) {
        if !self.enabled || context.natural == 20 || context.natural == 1 {
            return;
        }
        let would_hit = context.total >= context.effective_ac;
        if !would_hit {
            return;
        }

        let bonus = {
            let Some(target) = state.combatant(&context.target) else {
                return;
            };
            if !target.economy.reaction || target.is_incapacitated() {
                return;
            }
            target
                .abilities
                .iter()
                .find_map(|a| match a.kind {
                    AbilityKind::Reaction {
                        effect: ReactionEffect::AcBonus(bonus),
                    } => Some(bonus),
                    _ => None,
                })
        };
        let Some(bonus) = bonus else {
            return;
        };
        if context.total >= context.effective_ac + bonus {
            // The reaction would be wasted; hold it.
            return;
        }

        if let Some(target) = state.combatant_mut(&context.target) {
            target.economy.reaction = false;
        }
        context.effective_ac += bonus;
        tracing::info!(
            target = %context.target,
            attacker = %context.attacker,
            bonus,
            "reaction raises AC against the incoming attack"
        );
    }

    /// Invoked when a save-forcing spell is cast; a hostile reactor with a
    /// negating reaction may counter it.
    pub fn on_spell_cast(
        &self,
        state: &mut EncounterState,
        context: &mut SpellContext,
        _results: &mut MechanicalResults,
    ) {
        if !self.enabled {
            return;
        }
        let caster_faction = match state.combatant(&context.caster) {
            Some(caster) => caster.side.faction(),
            None => return,
        };
        let reactor = state
            .combatants
            .iter()
            .find(|c| {
                c.side.faction() != caster_faction
                    && c.is_active()
                    && c.economy.reaction
                    && !c.is_incapacitated()
                    && c.abilities.iter().any(|a| {
                        matches!(
                            a.kind,
                            AbilityKind::Reaction {
                                effect: ReactionEffect::NegateSpell,
                            }
                        )
                    })
            })
            .map(|c| c.id.clone());

        if let Some(reactor_id) = reactor {
            if let Some(reactor) = state.combatant_mut(&reactor_id) {
                reactor.economy.reaction = false;
            }
            context.negated = true;
            tracing::info!(
                reactor = %reactor_id,
                caster = %context.caster,
                spell = %context.spell,
                "spell negated by reaction"
            );
        }
    }
}

impl Default for ReactionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Legendary interleave
// ============================================================================

/// Combatants eligible to act between turns: a legendary pool remains and
/// they were not the one who just acted.
pub fn legendary_candidates(state: &EncounterState, just_acted: &CombatantId) -> Vec<CombatantId> {
    state
        .combatants
        .iter()
        .filter(|c| {
            c.id != *just_acted
                && c.is_active()
                && c.legendary.remaining() > 0
                && c.abilities
                    .iter()
                    .any(|a| matches!(a.kind, AbilityKind::Legendary { .. }))
        })
        .map(|c| c.id.clone())
        .collect()
}

fn legendary_cost(actor: &Combatant, ability_name: &str) -> Option<u8> {
    actor.find_ability(ability_name).and_then(|a| match a.kind {
        AbilityKind::Legendary { cost, .. } => Some(cost),
        _ => None,
    })
}

/// Run the between-turns legendary phase. Each eligible creature is
/// prompted for a legendary intent (or skip); a usable reply executes
/// under a nested transaction and draws down the pool. Anything
/// unusable skips the creature, never the encounter.
#[allow(clippy::too_many_arguments)]
pub fn run_legendary_phase(
    engine: &RulesEngine,
    gateway: &OracleGateway,
    validator: &AbilityValidator,
    transactions: &TransactionManager,
    state: &mut EncounterState,
    just_acted: &CombatantId,
    oracle: &mut OracleFn<'_>,
    roll_fn: &mut RollFn<'_>,
    token: &CancelToken,
    oracle_budget: std::time::Duration,
    emit: &mut dyn FnMut(EngineEvent),
) -> Result<(), EngineError> {
    for actor_id in legendary_candidates(state, just_acted) {
        if token.is_stopped() {
            return Err(EngineError::Cancelled);
        }
        let actor = match state.combatant(&actor_id) {
            Some(actor) => actor.clone(),
            None => continue,
        };

        let mut prompt = gateway.build_prompt(state, &actor, None);
        prompt.push_str(&format!(
            "\n# LEGENDARY ACTION\n{} may spend a legendary action now ({} remaining). \
             Reply with action_type \"legendary\" and one of its legendary abilities, \
             or reply with {{\"action_type\": \"dodge\"}} to skip.\n",
            actor.name,
            actor.legendary.remaining()
        ));
        let prompt = validator.clean_prompt(&prompt, &actor);

        let call_token = token.child_with_budget(oracle_budget);
        let decision = match gateway.request_intent(oracle, &prompt, &call_token) {
            Ok(decision) => decision,
            Err(failure) => {
                tracing::debug!(actor = %actor_id, failure = %failure.describe(), "legendary prompt unusable; skipping");
                continue;
            }
        };

        let Intent::Legendary { ability_name, .. } = &decision.intent else {
            tracing::debug!(actor = %actor_id, "oracle declined the legendary action");
            continue;
        };
        if validator.validate_intent(&decision.intent, &actor).is_err() {
            tracing::debug!(actor = %actor_id, ability = %ability_name, "foreign legendary ability rejected");
            continue;
        }
        let Some(cost) = legendary_cost(&actor, ability_name) else {
            tracing::debug!(actor = %actor_id, ability = %ability_name, "not a legendary ability; skipping");
            continue;
        };
        if cost > actor.legendary.remaining() {
            tracing::debug!(actor = %actor_id, cost, remaining = actor.legendary.remaining(), "legendary pool too low");
            continue;
        }

        // Nested transaction around the miniature resolution.
        let snapshot = transactions.begin(state);
        emit(EngineEvent::Intent {
            combatant_id: actor_id.clone(),
            intent: decision.intent.clone(),
            source_tier: SourceTier::Oracle,
        });

        let mut rolls = TurnRolls::new(roll_fn, emit, actor_id.clone());
        let dispatcher = ReactionDispatcher::new();
        let executed = engine.execute(state, &actor_id, &decision, &mut rolls, &dispatcher);
        let rolls = rolls.rolls;

        let outcome = executed.and_then(|results| {
            if let Some(actor) = state.combatant_mut(&actor_id) {
                actor.legendary.used += cost;
                actor.economy.legendary_used += cost;
            }
            Ok(results)
        });

        match outcome {
            Ok(results) => {
                if let Err(corruption) = transactions.validate(state, validator) {
                    transactions.rollback(
                        state,
                        snapshot,
                        &actor_id,
                        &corruption.to_string(),
                        SourceTier::Oracle,
                    );
                    emit(EngineEvent::Rollback {
                        round: state.round,
                        combatant_id: actor_id.clone(),
                        reason: corruption.to_string(),
                    });
                    continue;
                }
                let record = TurnRecord {
                    round: state.round,
                    combatant_id: actor_id.clone(),
                    intent: decision.intent.clone(),
                    rolls,
                    results,
                    narrative: decision.narrative.clone(),
                    source_tier: SourceTier::Oracle,
                };
                state.log.push(LogEntry::Turn(record.clone()));
                emit(EngineEvent::Result {
                    turn_record: record,
                });
            }
            Err(rules_error) => {
                transactions.rollback(
                    state,
                    snapshot,
                    &actor_id,
                    &rules_error.to_string(),
                    SourceTier::Oracle,
                );
                emit(EngineEvent::Rollback {
                    round: state.round,
                    combatant_id: actor_id.clone(),
                    reason: rules_error.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combatant::{DamageType, Side, TaggedAbility};
    use crate::encounter::Environment;

    fn shield_bearer() -> Combatant {
        let base = Combatant::new("fighter", "Fighter", Side::Player)
            .with_hp(20)
            .with_ac(16);
        let shield = TaggedAbility::new(
            "Shield",
            &base.id,
            &base.name,
            AbilityKind::Reaction {
                effect: ReactionEffect::AcBonus(5),
            },
        );
        base.add_tagged(shield)
    }

    #[test]
    fn test_shield_turns_hit_into_miss() {
        let mut state = EncounterState::new(vec![shield_bearer()], Environment::default());
        let dispatcher = ReactionDispatcher::new();
        let mut results = MechanicalResults::default();
        let mut context = AttackContext {
            attacker: CombatantId::from("orc"),
            target: CombatantId::from("fighter"),
            natural: 14,
            total: 18,
            effective_ac: 16,
        };
        dispatcher.on_attack_resolved(&mut state, &mut context, &mut results);
        assert_eq!(context.effective_ac, 21);
        assert!(!state
            .combatant(&CombatantId::from("fighter"))
            .unwrap()
            .economy
            .reaction);
    }

    #[test]
    fn test_shield_not_wasted_on_overwhelming_hit() {
        let mut state = EncounterState::new(vec![shield_bearer()], Environment::default());
        let dispatcher = ReactionDispatcher::new();
        let mut results = MechanicalResults::default();
        let mut context = AttackContext {
            attacker: CombatantId::from("orc"),
            target: CombatantId::from("fighter"),
            natural: 15,
            total: 25,
            effective_ac: 16,
        };
        dispatcher.on_attack_resolved(&mut state, &mut context, &mut results);
        assert_eq!(context.effective_ac, 16);
        assert!(state
            .combatant(&CombatantId::from("fighter"))
            .unwrap()
            .economy
            .reaction);
    }

    #[test]
    fn test_disabled_dispatcher_never_reacts() {
        let mut state = EncounterState::new(vec![shield_bearer()], Environment::default());
        let dispatcher = ReactionDispatcher::disabled();
        let mut results = MechanicalResults::default();
        let mut context = AttackContext {
            attacker: CombatantId::from("orc"),
            target: CombatantId::from("fighter"),
            natural: 14,
            total: 18,
            effective_ac: 16,
        };
        dispatcher.on_attack_resolved(&mut state, &mut context, &mut results);
        assert_eq!(context.effective_ac, 16);
    }

    #[test]
    fn test_counterspell_negates() {
        let counter = TaggedAbility::new(
            "Counterspell",
            &CombatantId::from("mage"),
            "Mage",
            AbilityKind::Reaction {
                effect: ReactionEffect::NegateSpell,
            },
        );
        let mage = Combatant::new("mage", "Mage", Side::Player)
            .with_hp(12)
            .add_tagged(counter);
        let lich = Combatant::new("lich", "Lich", Side::Monster).with_hp(40);
        let mut state = EncounterState::new(vec![mage, lich], Environment::default());

        let dispatcher = ReactionDispatcher::new();
        let mut results = MechanicalResults::default();
        let mut context = SpellContext {
            caster: CombatantId::from("lich"),
            spell: "Ray of Sickness".into(),
            negated: false,
        };
        dispatcher.on_spell_cast(&mut state, &mut context, &mut results);
        assert!(context.negated);
        assert!(!state
            .combatant(&CombatantId::from("mage"))
            .unwrap()
            .economy
            .reaction);
    }

    #[test]
    fn test_legendary_candidates_excludes_actor_and_spent_pools() {
        let dragon = Combatant::new("dragon", "Dragon", Side::Monster)
            .with_hp(100)
            .with_legendary(3)
            .add_ability(
                "Tail Attack",
                AbilityKind::Legendary {
                    cost: 1,
                    attack: Box::new(AbilityKind::Attack {
                        bonus: 8,
                        damage: "2d8+5".into(),
                        damage_type: DamageType::Bludgeoning,
                        ranged: false,
                        reach_ft: 10,
                    }),
                },
            );
        let pc = Combatant::new("pc", "Hero", Side::Player).with_hp(30);
        let mut state = EncounterState::new(vec![dragon, pc], Environment::default());

        assert_eq!(
            legendary_candidates(&state, &CombatantId::from("pc")),
            vec![CombatantId::from("dragon")]
        );
        assert!(legendary_candidates(&state, &CombatantId::from("dragon")).is_empty());

        state.combatant_mut(&CombatantId::from("dragon")).unwrap().legendary.used = 3;
        assert!(legendary_candidates(&state, &CombatantId::from("pc")).is_empty());
    }
}
