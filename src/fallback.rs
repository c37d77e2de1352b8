//! Fallback ladder: oracle retry, deterministic heuristic, safe default.
//!
//! Whatever the oracle does, the encounter advances. Each tier tags the
//! turn record it produces so observers can see where a decision came
//! from.

use crate::combatant::{AbilityKind, Combatant, Status, TaggedAbility};
use crate::encounter::EncounterState;
use crate::intent::{Decision, Intent};

/// Deterministic tactical chooser used when the oracle (and its one
/// retry) cannot produce a usable intent.
pub fn heuristic_decision(state: &EncounterState, actor: &Combatant) -> Decision {
    // Badly hurt and able to self-heal: do that first.
    if actor.hp * 4 <= actor.max_hp {
        if let Some(heal) = actor.abilities.iter().find(|a| a.is_heal() && usable(actor, a)) {
            return Decision {
                intent: Intent::UseItem {
                    ability_name: heal.name.clone(),
                    targets: vec![actor.id.clone()],
                },
                narrative: format!("{} tends to its wounds.", actor.name),
                uses_reaction: false,
            };
        }
    }

    // Finish a downed enemy in reach if a melee attack is available.
    let melee = actor
        .abilities
        .iter()
        .filter(|a| a.is_melee_attack() && usable(actor, a))
        .max_by(|a, b| {
            estimated_damage(a)
                .partial_cmp(&estimated_damage(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    if let Some(attack) = melee {
        let downed = state.living_enemies(actor).into_iter().find(|enemy| {
            enemy.status == Status::Unconscious && actor.position.in_melee_with(&enemy.id)
        });
        if let Some(target) = downed {
            return Decision {
                intent: Intent::Attack {
                    ability_name: attack.name.clone(),
                    targets: vec![target.id.clone()],
                    movement_cost: None,
                },
                narrative: format!("{} moves to finish {}.", actor.name, target.name),
                uses_reaction: false,
            };
        }
    }

    // Score the remaining enemies and pick the best target.
    let target = state
        .living_enemies(actor)
        .into_iter()
        .filter(|enemy| !enemy.status.is_down())
        .max_by(|a, b| {
            target_score(actor, a)
                .partial_cmp(&target_score(actor, b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

    let Some(target) = target else {
        return Decision::from_intent(Intent::Dodge);
    };

    // Action preference: hardest-hitting usable attack, then cantrip,
    // then dash toward the target, then dodge.
    let best_attack = actor
        .abilities
        .iter()
        .filter(|a| {
            matches!(a.kind, AbilityKind::Attack { .. } | AbilityKind::Save { .. })
                && usable(actor, a)
        })
        .filter(|a| {
            // Melee attacks need the target in reach.
            !a.is_melee_attack() || reach_of(a) >= actor.position.distance_to(&target.id)
        })
        .max_by(|a, b| {
            estimated_damage(a)
                .partial_cmp(&estimated_damage(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

    if let Some(attack) = best_attack {
        return Decision {
            intent: Intent::Attack {
                ability_name: attack.name.clone(),
                targets: vec![target.id.clone()],
                movement_cost: None,
            },
            narrative: format!("{} presses the attack on {}.", actor.name, target.name),
            uses_reaction: false,
        };
    }

    let distance = actor.position.distance_to(&target.id);
    if distance > 5 && actor.effective_speed() > 0 {
        return Decision {
            intent: Intent::Dash {
                movement_cost: Some(distance.min(actor.effective_speed())),
            },
            narrative: format!("{} rushes toward {}.", actor.name, target.name),
            uses_reaction: false,
        };
    }

    Decision::from_intent(Intent::Dodge)
}

/// The minimal safe default: always legal, always succeeds.
pub fn default_decision(actor: &Combatant) -> Decision {
    Decision {
        intent: Intent::Dodge,
        narrative: format!("{} falls back and defends.", actor.name),
        uses_reaction: false,
    }
}

/// Retry instruction block appended to the re-prompt, pointing at the
/// specific validation failure.
pub fn retry_note(failure: &crate::error::IntentFailure) -> String {
    failure.describe()
}

/// Target desirability: wounded, poorly armored, adjacent, close.
fn target_score(actor: &Combatant, enemy: &Combatant) -> f32 {
    let wounded = 1.0 - enemy.hp_ratio();
    let soft = (20 - enemy.armor_class).max(0) as f32;
    let in_melee = if actor.position.in_melee_with(&enemy.id) { 20.0 } else { 0.0 };
    let distance = actor.position.distance_to(&enemy.id).min(1_000) as f32;
    wounded * 30.0 + soft * 2.0 + in_melee - distance
}

fn usable(actor: &Combatant, ability: &TaggedAbility) -> bool {
    match actor.recharge_pool.get(ability.name.to_lowercase().as_str()) {
        Some(entry) => entry.available,
        None => true,
    }
}

fn reach_of(ability: &TaggedAbility) -> i32 {
    match &ability.kind {
        AbilityKind::Attack { reach_ft, .. } => *reach_ft,
        _ => i32::MAX,
    }
}

/// Average damage of an ability's dice expression, for ranking only.
/// Understands the `XdY+Z` subset; anything else ranks as zero.
fn estimated_damage(ability: &TaggedAbility) -> f32 {
    let dice = match &ability.kind {
        AbilityKind::Attack { damage, .. } => damage.as_str(),
        AbilityKind::Save { damage: Some(damage), .. } => damage.as_str(),
        _ => return 0.0,
    };
    average_of(dice)
}

fn average_of(dice: &str) -> f32 {
    let mut total = 0.0f32;
    for term in dice.replace('-', "+-").split('+') {
        let term = term.trim();
        if term.is_empty() {
            continue;
        }
        if let Some((count, sides)) = term.split_once('d') {
            let count: f32 = if count.is_empty() {
                1.0
            } else {
                count.parse().unwrap_or(0.0)
            };
            let sides: f32 = sides.parse().unwrap_or(0.0);
            total += count * (sides + 1.0) / 2.0;
        } else {
            total += term.parse::<f32>().unwrap_or(0.0);
        }
    }
    total
}
