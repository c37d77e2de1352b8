//! Encounter state and the append-only combat log.
//!
//! The encounter owns the combatant roster, the initiative order, and the
//! log of committed turns. It is mutated only inside a transaction; a pure
//! replay of the log over the initial roster reproduces the final state.

use crate::combatant::{Ability, Combatant, CombatantId, Condition, Faction, Status};
use crate::intent::{Intent, SourceTier};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ============================================================================
// Environment
// ============================================================================

/// Terrain and hazards, matched against combatant position bags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Zone names where movement costs double.
    pub difficult_terrain: HashSet<String>,
    pub hazards: Vec<String>,
}

// ============================================================================
// Turn records
// ============================================================================

/// One dice roll made during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiceRoll {
    pub expression: String,
    pub result: i32,
    pub purpose: String,
}

/// An HP change applied to a target, recorded post-adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpChange {
    pub target: CombatantId,
    pub delta: i32,
    pub new_hp: i32,
}

/// A saving throw outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRecord {
    pub who: CombatantId,
    pub ability: Ability,
    pub dc: i32,
    pub total: i32,
    pub success: bool,
    /// Converted to a success by legendary resistance.
    pub legendary_resistance: bool,
}

/// Death-save counters after a roll or damage-while-down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeathSaveRecord {
    pub who: CombatantId,
    pub successes: u8,
    pub failures: u8,
}

/// The concrete state changes a turn committed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MechanicalResults {
    pub hp_changes: Vec<HpChange>,
    pub status_changes: Vec<(CombatantId, Status)>,
    pub conditions_applied: Vec<(CombatantId, Condition)>,
    pub conditions_removed: Vec<(CombatantId, Condition)>,
    pub saves: Vec<SaveRecord>,
    pub death_saves: Vec<DeathSaveRecord>,
    /// Concentration effects dropped this turn: (caster, spell).
    pub concentration_drops: Vec<(CombatantId, String)>,
}

impl MechanicalResults {
    pub fn is_empty(&self) -> bool {
        self.hp_changes.is_empty()
            && self.status_changes.is_empty()
            && self.conditions_applied.is_empty()
            && self.conditions_removed.is_empty()
            && self.saves.is_empty()
            && self.death_saves.is_empty()
            && self.concentration_drops.is_empty()
    }
}

/// Immutable record of one resolved turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub round: u32,
    pub combatant_id: CombatantId,
    pub intent: Intent,
    pub rolls: Vec<DiceRoll>,
    pub results: MechanicalResults,
    pub narrative: String,
    pub source_tier: SourceTier,
}

/// Entry in the append-only combat log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    Turn(TurnRecord),
    Rollback {
        round: u32,
        combatant_id: CombatantId,
        reason: String,
        source_tier: SourceTier,
    },
}

impl LogEntry {
    pub fn as_turn(&self) -> Option<&TurnRecord> {
        match self {
            LogEntry::Turn(record) => Some(record),
            LogEntry::Rollback { .. } => None,
        }
    }
}

// ============================================================================
// Encounter state
// ============================================================================

/// The full mutable state of a running encounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterState {
    pub combatants: Vec<Combatant>,
    /// Initiative order, highest first.
    pub order: Vec<CombatantId>,
    /// Current round, 1-based.
    pub round: u32,
    /// Index into `order` of the acting combatant.
    pub turn: usize,
    pub environment: Environment,
    pub log: Vec<LogEntry>,
}

impl EncounterState {
    /// Build an encounter, computing the initiative order: descending
    /// initiative, then descending dexterity, then initiative advantage.
    pub fn new(combatants: Vec<Combatant>, environment: Environment) -> Self {
        let mut order: Vec<&Combatant> = combatants.iter().collect();
        order.sort_by(|a, b| {
            b.initiative
                .cmp(&a.initiative)
                .then(b.initiative_tiebreak.cmp(&a.initiative_tiebreak))
                .then(b.initiative_advantage.cmp(&a.initiative_advantage))
        });
        let order = order.into_iter().map(|c| c.id.clone()).collect();
        Self {
            combatants,
            order,
            round: 1,
            turn: 0,
            environment,
            log: Vec::new(),
        }
    }

    pub fn combatant(&self, id: &CombatantId) -> Option<&Combatant> {
        self.combatants.iter().find(|c| &c.id == id)
    }

    pub fn combatant_mut(&mut self, id: &CombatantId) -> Option<&mut Combatant> {
        self.combatants.iter_mut().find(|c| &c.id == id)
    }

    /// Living enemies of the given combatant.
    pub fn living_enemies(&self, of: &Combatant) -> Vec<&Combatant> {
        self.combatants
            .iter()
            .filter(|c| c.side.faction() != of.side.faction() && c.is_alive())
            .collect()
    }

    pub fn living_allies(&self, of: &Combatant) -> Vec<&Combatant> {
        self.combatants
            .iter()
            .filter(|c| c.side.faction() == of.side.faction() && c.id != of.id && c.is_alive())
            .collect()
    }

    /// The winner, if one faction has been eliminated. A faction is out
    /// when every member has status in {unconscious, dead}; stable
    /// creatures still count as down.
    pub fn winner(&self) -> Option<Faction> {
        let players_up = self
            .combatants
            .iter()
            .any(|c| c.side.faction() == Faction::Players && !c.status.is_down());
        let monsters_up = self
            .combatants
            .iter()
            .any(|c| c.side.faction() == Faction::Monsters && !c.status.is_down());
        match (players_up, monsters_up) {
            (true, false) => Some(Faction::Players),
            (false, true) => Some(Faction::Monsters),
            (false, false) | (true, true) => None,
        }
    }

    /// True when both factions still field a live combatant.
    pub fn both_sides_standing(&self) -> bool {
        let players = self
            .combatants
            .iter()
            .any(|c| c.side.faction() == Faction::Players && !c.status.is_down());
        let monsters = self
            .combatants
            .iter()
            .any(|c| c.side.faction() == Faction::Monsters && !c.status.is_down());
        players && monsters
    }

    pub fn turn_records(&self) -> impl Iterator<Item = &TurnRecord> {
        self.log.iter().filter_map(LogEntry::as_turn)
    }
}

// ============================================================================
// Replay
// ============================================================================

/// Apply every committed turn record in order to an initial roster,
/// reproducing the hp/status/condition state observed live. Rollback
/// entries are skipped: the state they touched was restored before commit.
pub fn replay(initial: &EncounterState, log: &[LogEntry]) -> Vec<Combatant> {
    let mut roster = initial.combatants.clone();

    for record in log.iter().filter_map(LogEntry::as_turn) {
        for change in &record.results.hp_changes {
            if let Some(c) = roster.iter_mut().find(|c| c.id == change.target) {
                c.hp = change.new_hp;
            }
        }
        for (id, status) in &record.results.status_changes {
            if let Some(c) = roster.iter_mut().find(|c| &c.id == id) {
                c.status = *status;
            }
        }
        for (id, condition) in &record.results.conditions_applied {
            if let Some(c) = roster.iter_mut().find(|c| &c.id == id) {
                if !c.has_condition(condition) {
                    c.conditions.push(crate::combatant::ActiveCondition::new(
                        condition.clone(),
                        record.combatant_id.clone(),
                    ));
                }
            }
        }
        for (id, condition) in &record.results.conditions_removed {
            if let Some(c) = roster.iter_mut().find(|c| &c.id == id) {
                c.conditions.retain(|ac| &ac.condition != condition);
            }
        }
        for ds in &record.results.death_saves {
            if let Some(c) = roster.iter_mut().find(|c| c.id == ds.who) {
                c.death_saves.successes = ds.successes;
                c.death_saves.failures = ds.failures;
            }
        }
        for (caster, _spell) in &record.results.concentration_drops {
            if let Some(c) = roster.iter_mut().find(|c| &c.id == caster) {
                c.concentration = None;
            }
        }
    }

    roster
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combatant::Side;

    fn sample(id: &str, side: Side, init: i32, dex: u8) -> Combatant {
        let mut c = Combatant::new(id, id, side).with_hp(10).with_initiative(init);
        c.initiative_tiebreak = dex;
        c
    }

    #[test]
    fn test_initiative_order() {
        let state = EncounterState::new(
            vec![
                sample("slow", Side::Player, 5, 10),
                sample("fast", Side::Monster, 18, 14),
                sample("tied-low-dex", Side::Monster, 18, 8),
            ],
            Environment::default(),
        );
        assert_eq!(
            state.order,
            vec![
                CombatantId::from("fast"),
                CombatantId::from("tied-low-dex"),
                CombatantId::from("slow"),
            ]
        );
    }

    #[test]
    fn test_advantage_breaks_full_tie() {
        let mut a = sample("a", Side::Player, 12, 10);
        let mut b = sample("b", Side::Monster, 12, 10);
        a.initiative_advantage = false;
        b.initiative_advantage = true;
        let state = EncounterState::new(vec![a, b], Environment::default());
        assert_eq!(state.order[0], CombatantId::from("b"));
    }

    #[test]
    fn test_winner_requires_elimination() {
        let mut state = EncounterState::new(
            vec![
                sample("pc", Side::Player, 10, 10),
                sample("orc", Side::Monster, 12, 10),
            ],
            Environment::default(),
        );
        assert_eq!(state.winner(), None);

        state.combatant_mut(&CombatantId::from("pc")).unwrap().status = Status::Unconscious;
        assert_eq!(state.winner(), Some(Faction::Monsters));
    }

    #[test]
    fn test_replay_applies_hp_and_status() {
        let initial = EncounterState::new(
            vec![sample("pc", Side::Player, 10, 10)],
            Environment::default(),
        );
        let record = TurnRecord {
            round: 1,
            combatant_id: CombatantId::from("orc"),
            intent: Intent::Dodge,
            rolls: vec![],
            results: MechanicalResults {
                hp_changes: vec![HpChange {
                    target: CombatantId::from("pc"),
                    delta: -10,
                    new_hp: 0,
                }],
                status_changes: vec![(CombatantId::from("pc"), Status::Unconscious)],
                ..Default::default()
            },
            narrative: String::new(),
            source_tier: SourceTier::Oracle,
        };
        let roster = replay(&initial, &[LogEntry::Turn(record)]);
        assert_eq!(roster[0].hp, 0);
        assert_eq!(roster[0].status, Status::Unconscious);
    }
}
