//! Deterministic rules engine.
//!
//! Executes a validated decision against the encounter state: attack and
//! save math, damage typing, conditions, action economy, opportunity
//! attacks, recharge rolls, death saves and concentration. All randomness
//! flows through the injected roll callback; all state changes are
//! accumulated into `MechanicalResults` so a committed turn can be
//! replayed.

use crate::combatant::{
    Ability, AbilityKind, ActiveCondition, Combatant, CombatantId, Condition, ConditionDuration,
    Cover, DamageType, Status, TaggedAbility,
};
use crate::config::ResolutionConfig;
use crate::dispatcher::{AttackContext, ReactionDispatcher, SpellContext};
use crate::encounter::{
    DeathSaveRecord, DiceRoll, EncounterState, HpChange, MechanicalResults, SaveRecord,
};
use crate::error::{RulesError, RulesResult};
use crate::event::EngineEvent;
use crate::intent::{Decision, Intent};
use crate::oracle::RollFn;

// ============================================================================
// Roll plumbing
// ============================================================================

/// Wraps the injected roller for one turn: every roll is recorded for the
/// turn record and emitted as a dice event in order.
pub struct TurnRolls<'a, 'b> {
    roll_fn: &'a mut RollFn<'b>,
    emit: &'a mut dyn FnMut(EngineEvent),
    actor: CombatantId,
    pub rolls: Vec<DiceRoll>,
}

impl<'a, 'b> TurnRolls<'a, 'b> {
    pub fn new(
        roll_fn: &'a mut RollFn<'b>,
        emit: &'a mut dyn FnMut(EngineEvent),
        actor: CombatantId,
    ) -> Self {
        Self {
            roll_fn,
            emit,
            actor,
            rolls: Vec::new(),
        }
    }

    pub fn roll(&mut self, expression: &str, purpose: &str) -> i32 {
        let result = (self.roll_fn)(expression);
        self.rolls.push(DiceRoll {
            expression: expression.to_string(),
            result,
            purpose: purpose.to_string(),
        });
        (self.emit)(EngineEvent::Dice {
            combatant_id: self.actor.clone(),
            expression: expression.to_string(),
            result,
            purpose: purpose.to_string(),
        });
        result
    }
}

/// Advantage state for a d20 roll; advantage and disadvantage cancel
/// exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advantage {
    Normal,
    Advantage,
    Disadvantage,
}

impl Advantage {
    fn from_flags(has_advantage: bool, has_disadvantage: bool) -> Self {
        match (has_advantage, has_disadvantage) {
            (true, false) => Advantage::Advantage,
            (false, true) => Advantage::Disadvantage,
            _ => Advantage::Normal,
        }
    }
}

/// Double the dice of an expression, leaving the modifier alone:
/// `2d6+3` becomes `4d6+3`.
pub fn double_dice(expression: &str) -> String {
    expression
        .split('+')
        .map(|term| {
            let term = term.trim();
            match term.split_once('d') {
                Some((count, sides)) if sides.chars().all(|c| c.is_ascii_digit()) => {
                    let count: i32 = if count.is_empty() {
                        1
                    } else {
                        count.parse().unwrap_or(1)
                    };
                    format!("{}d{}", count * 2, sides)
                }
                _ => term.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("+")
}

// ============================================================================
// Engine
// ============================================================================

pub struct RulesEngine {
    config: ResolutionConfig,
}

impl RulesEngine {
    pub fn new(config: ResolutionConfig) -> Self {
        Self { config }
    }

    // ------------------------------------------------------------------
    // Turn boundaries
    // ------------------------------------------------------------------

    /// Start-of-turn bookkeeping: clear transient stances, reset the
    /// action economy, roll recharges for spent abilities.
    pub fn start_of_turn(
        &self,
        state: &mut EncounterState,
        actor_id: &CombatantId,
        rolls: &mut TurnRolls<'_, '_>,
    ) -> RulesResult<()> {
        let speed = {
            let actor = state
                .combatant(actor_id)
                .ok_or_else(|| RulesError::UnknownCombatant(actor_id.clone()))?;
            actor.effective_speed()
        };

        // Recharge rolls happen against the live combatant, so collect the
        // pending names first.
        let pending: Vec<(String, crate::combatant::RechargeRange)> = state
            .combatant(actor_id)
            .map(|actor| {
                actor
                    .recharge_pool
                    .iter()
                    .filter(|(_, entry)| !entry.available)
                    .map(|(name, entry)| (name.clone(), entry.range))
                    .collect()
            })
            .unwrap_or_default();

        for (name, range) in pending {
            let roll = rolls.roll("1d6", &format!("recharge: {name}"));
            if range.contains(roll) {
                if let Some(actor) = state.combatant_mut(actor_id) {
                    if let Some(entry) = actor.recharge_pool.get_mut(&name) {
                        entry.available = true;
                    }
                }
                tracing::debug!(actor = %actor_id, ability = %name, roll, "ability recharged");
            }
        }

        if let Some(actor) = state.combatant_mut(actor_id) {
            actor.conditions.retain(|c| {
                !matches!(
                    c.condition,
                    Condition::Dodging | Condition::Disengaging | Condition::Hidden
                )
            });
            actor.economy.reset_for_turn(speed);
        }
        Ok(())
    }

    /// End-of-turn: tick down the actor's timed conditions; expired ones
    /// are removed and recorded.
    pub fn end_of_turn(
        &self,
        state: &mut EncounterState,
        actor_id: &CombatantId,
        results: &mut MechanicalResults,
    ) {
        let Some(actor) = state.combatant_mut(actor_id) else {
            return;
        };
        let mut expired = Vec::new();
        for active in &mut actor.conditions {
            if let ConditionDuration::Rounds(remaining) = &mut active.duration {
                *remaining -= 1;
                if *remaining <= 0 {
                    expired.push(active.condition.clone());
                }
            }
        }
        actor.conditions.retain(|c| match c.duration {
            ConditionDuration::Rounds(remaining) => remaining > 0,
            ConditionDuration::Indefinite => true,
        });
        for condition in expired {
            results
                .conditions_removed
                .push((actor_id.clone(), condition));
        }
    }

    /// Round start: legendary pools refill.
    pub fn start_of_round(&self, state: &mut EncounterState) {
        for combatant in &mut state.combatants {
            combatant.economy.legendary_used = 0;
            combatant.legendary.used = 0;
            combatant.legendary_resistance_spent_this_round = false;
        }
    }

    // ------------------------------------------------------------------
    // Death saves
    // ------------------------------------------------------------------

    /// Death-save turn for an unconscious, non-stable player: 1 is two
    /// failures, 2-9 one failure, 10-19 one success, 20 wakes with 1 HP.
    pub fn death_save_turn(
        &self,
        state: &mut EncounterState,
        actor_id: &CombatantId,
        rolls: &mut TurnRolls<'_, '_>,
    ) -> RulesResult<MechanicalResults> {
        let roll = rolls.roll("1d20", "death save");
        let mut results = MechanicalResults::default();
        let actor = state
            .combatant_mut(actor_id)
            .ok_or_else(|| RulesError::UnknownCombatant(actor_id.clone()))?;

        match roll {
            20 => {
                actor.hp = 1;
                actor.status = Status::Ok;
                actor.death_saves.reset();
                results.hp_changes.push(HpChange {
                    target: actor_id.clone(),
                    delta: 1,
                    new_hp: 1,
                });
                results.status_changes.push((actor_id.clone(), Status::Ok));
                results
                    .conditions_removed
                    .extend(strip_condition(actor, &Condition::Unconscious));
            }
            10..=19 => {
                if actor.death_saves.add_success() {
                    actor.status = Status::Stable;
                    results.status_changes.push((actor_id.clone(), Status::Stable));
                }
            }
            1 => {
                if actor.death_saves.add_failure(2) {
                    actor.status = Status::Dead;
                    results.status_changes.push((actor_id.clone(), Status::Dead));
                }
            }
            _ => {
                if actor.death_saves.add_failure(1) {
                    actor.status = Status::Dead;
                    results.status_changes.push((actor_id.clone(), Status::Dead));
                }
            }
        }
        results.death_saves.push(DeathSaveRecord {
            who: actor_id.clone(),
            successes: state.combatant(actor_id).map(|c| c.death_saves.successes).unwrap_or(0),
            failures: state.combatant(actor_id).map(|c| c.death_saves.failures).unwrap_or(0),
        });
        Ok(results)
    }

    // ------------------------------------------------------------------
    // Intent execution
    // ------------------------------------------------------------------

    /// Execute a validated decision. Any error leaves the state for the
    /// transaction manager to roll back.
    pub fn execute(
        &self,
        state: &mut EncounterState,
        actor_id: &CombatantId,
        decision: &Decision,
        rolls: &mut TurnRolls<'_, '_>,
        dispatcher: &ReactionDispatcher,
    ) -> RulesResult<MechanicalResults> {
        let mut results = MechanicalResults::default();
        let intent = &decision.intent;

        // Spend the action slot up front; the gateway checked it, the
        // engine enforces it.
        if intent.spends_action() {
            self.spend_action(state, actor_id)?;
        }
        if decision.uses_reaction {
            self.spend_reaction(state, actor_id)?;
        }

        // Movement happens before the action, and may provoke.
        if let Some(cost) = intent.movement_cost() {
            if cost > 0 {
                let toward = intent.targets().first().cloned();
                self.move_combatant(state, actor_id, toward, cost, rolls, &mut results)?;
                // An opportunity attack may have dropped the mover.
                let standing = state
                    .combatant(actor_id)
                    .map(|c| c.is_active())
                    .unwrap_or(false);
                if !standing {
                    return Ok(results);
                }
            }
        }

        match intent {
            Intent::Attack { ability_name, targets, .. }
            | Intent::Spell { ability_name, targets, .. }
            | Intent::Cantrip { ability_name, targets, .. }
            | Intent::UseItem { ability_name, targets }
            | Intent::Legendary { ability_name, targets } => {
                let ability = self.lookup_ability(state, actor_id, ability_name)?;
                self.execute_ability(
                    state, actor_id, &ability, targets, rolls, dispatcher, &mut results,
                )?;
            }
            Intent::Dash { .. } => {
                // Dash doubles this turn's movement.
                let extra = state
                    .combatant(actor_id)
                    .map(|c| c.effective_speed())
                    .unwrap_or(0);
                if let Some(actor) = state.combatant_mut(actor_id) {
                    actor.economy.movement_remaining += extra;
                }
            }
            Intent::Dodge => {
                self.apply_condition_to(
                    state,
                    actor_id,
                    ActiveCondition::new(Condition::Dodging, actor_id.clone()),
                    &mut results,
                );
            }
            Intent::Disengage { .. } => {
                self.apply_condition_to(
                    state,
                    actor_id,
                    ActiveCondition::new(Condition::Disengaging, actor_id.clone()),
                    &mut results,
                );
            }
            Intent::Help { targets } => {
                if let Some(ally) = targets.first() {
                    self.apply_condition_to(
                        state,
                        ally,
                        ActiveCondition::new(Condition::Helped, actor_id.clone()),
                        &mut results,
                    );
                }
            }
            Intent::Hide => {
                let roll = rolls.roll("1d20", "stealth check");
                // A middling floor keeps hide from being strictly free.
                if roll >= 10 {
                    self.apply_condition_to(
                        state,
                        actor_id,
                        ActiveCondition::new(Condition::Hidden, actor_id.clone()),
                        &mut results,
                    );
                }
            }
            Intent::Ready { .. } => {
                // Readying is narrative-only until the trigger resolves.
            }
            Intent::RechargeAbility { ability_name } => {
                let roll = rolls.roll("1d6", &format!("recharge: {ability_name}"));
                if let Some(actor) = state.combatant_mut(actor_id) {
                    if let Some(entry) = actor.recharge_pool.get_mut(&ability_name.to_lowercase())
                    {
                        if entry.range.contains(roll) {
                            entry.available = true;
                        }
                    }
                }
            }
            Intent::DeathSave => {
                // Handled by death_save_turn; reaching here is a pipeline bug.
                return Err(RulesError::NotActionable {
                    ability: "death_save".to_string(),
                });
            }
        }

        Ok(results)
    }

    fn lookup_ability(
        &self,
        state: &EncounterState,
        actor_id: &CombatantId,
        name: &str,
    ) -> RulesResult<TaggedAbility> {
        let actor = state
            .combatant(actor_id)
            .ok_or_else(|| RulesError::UnknownCombatant(actor_id.clone()))?;
        if let Some(ability) = actor.find_ability(name) {
            if let Some(entry) = actor.recharge_pool.get(&ability.name.to_lowercase()) {
                if !entry.available {
                    return Err(RulesError::NotRecharged {
                        ability: ability.name.clone(),
                    });
                }
            }
            return Ok(ability.clone());
        }
        // Universal unarmed strike for basic-action attacks.
        if name.eq_ignore_ascii_case("unarmed strike") {
            return Ok(TaggedAbility::new(
                "Unarmed Strike",
                &actor.id,
                &actor.name,
                AbilityKind::Attack {
                    bonus: actor.scores.modifier(Ability::Strength) + actor.proficiency_bonus,
                    damage: "1".to_string(),
                    damage_type: DamageType::Bludgeoning,
                    ranged: false,
                    reach_ft: 5,
                },
            ));
        }
        Err(RulesError::UnknownAbility {
            actor: actor_id.clone(),
            ability: name.to_string(),
        })
    }

    fn execute_ability(
        &self,
        state: &mut EncounterState,
        actor_id: &CombatantId,
        ability: &TaggedAbility,
        targets: &[CombatantId],
        rolls: &mut TurnRolls<'_, '_>,
        dispatcher: &ReactionDispatcher,
        results: &mut MechanicalResults,
    ) -> RulesResult<()> {
        // A spent recharge ability is marked used here; it will roll to
        // come back at the start of the owner's later turns.
        if ability.recharge.is_some() {
            if let Some(actor) = state.combatant_mut(actor_id) {
                if let Some(entry) = actor.recharge_pool.get_mut(&ability.name.to_lowercase()) {
                    entry.available = false;
                }
            }
        }

        match &ability.kind {
            AbilityKind::Attack { .. } => {
                for target in targets {
                    self.resolve_attack(
                        state, actor_id, target, ability, rolls, dispatcher, results, true,
                    )?;
                }
                Ok(())
            }
            AbilityKind::Save { .. } => {
                self.resolve_save_ability(state, actor_id, ability, targets, rolls, dispatcher, results)
            }
            AbilityKind::Heal { dice } => {
                let amount = self.roll_guarded(rolls, dice, "healing", 4);
                for target in targets {
                    self.apply_healing(state, target, amount, results)?;
                }
                Ok(())
            }
            AbilityKind::Legendary { attack, .. } => {
                let inner = TaggedAbility {
                    name: ability.name.clone(),
                    tag: ability.tag.clone(),
                    kind: (**attack).clone(),
                    recharge: None,
                    targets_allies: ability.targets_allies,
                };
                self.execute_ability(state, actor_id, &inner, targets, rolls, dispatcher, results)
            }
            AbilityKind::Reaction { .. } | AbilityKind::Trait => Err(RulesError::NotActionable {
                ability: ability.name.clone(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Attacks
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn resolve_attack(
        &self,
        state: &mut EncounterState,
        attacker_id: &CombatantId,
        target_id: &CombatantId,
        ability: &TaggedAbility,
        rolls: &mut TurnRolls<'_, '_>,
        dispatcher: &ReactionDispatcher,
        results: &mut MechanicalResults,
        allow_reactions: bool,
    ) -> RulesResult<()> {
        let AbilityKind::Attack {
            bonus,
            damage,
            damage_type,
            ranged,
            ..
        } = &ability.kind
        else {
            return Err(RulesError::NotActionable {
                ability: ability.name.clone(),
            });
        };

        let attacker = state
            .combatant(attacker_id)
            .ok_or_else(|| RulesError::UnknownCombatant(attacker_id.clone()))?
            .clone();
        let target = state
            .combatant(target_id)
            .ok_or_else(|| RulesError::UnknownCombatant(target_id.clone()))?
            .clone();
        if !target.is_alive() {
            return Err(RulesError::IllegalTarget {
                target: target_id.clone(),
                reason: "target is dead".to_string(),
            });
        }

        // Full cover cannot be attacked at all.
        if target.position.cover == Some(Cover::Full) {
            tracing::debug!(attacker = %attacker_id, target = %target_id, "attack blocked by full cover");
            return Ok(());
        }

        let in_melee = attacker.position.in_melee_with(target_id);
        let advantage = attack_advantage(state, &attacker, &target, *ranged, in_melee);

        let natural = self.roll_d20(rolls, advantage, "attack roll");
        let total = natural + bonus;

        let cover_bonus = target.position.cover.map(|c| c.ac_bonus()).unwrap_or(0);
        let mut context = AttackContext {
            attacker: attacker_id.clone(),
            target: target_id.clone(),
            natural,
            total,
            effective_ac: target.armor_class + cover_bonus,
        };
        if allow_reactions {
            dispatcher.on_attack_resolved(state, &mut context, results);
        }

        let auto_crit_melee = in_melee
            && target.conditions.iter().any(|c| {
                matches!(c.condition, Condition::Unconscious | Condition::Paralyzed)
            });
        let is_crit = natural != 1
            && (self.config.is_critical(natural)
                || (attacker.improved_critical && natural >= 19)
                || auto_crit_melee);
        let hits = natural != 1 && (natural == 20 || is_crit || context.total >= context.effective_ac);

        if !hits {
            tracing::debug!(
                attacker = %attacker_id,
                target = %target_id,
                total = context.total,
                ac = context.effective_ac,
                "attack missed"
            );
            return Ok(());
        }

        let damage_expr = if is_crit { double_dice(damage) } else { damage.clone() };
        let rolled = self.roll_guarded(rolls, &damage_expr, "damage", 1);
        self.apply_damage(
            state,
            target_id,
            rolled,
            *damage_type,
            is_crit && in_melee,
            rolls,
            results,
        )?;

        // Attacking ends hidden and spends any help granted to us.
        if let Some(attacker) = state.combatant_mut(attacker_id) {
            results
                .conditions_removed
                .extend(strip_condition(attacker, &Condition::Hidden));
            results
                .conditions_removed
                .extend(strip_condition(attacker, &Condition::Helped));
        }
        Ok(())
    }

    fn resolve_save_ability(
        &self,
        state: &mut EncounterState,
        actor_id: &CombatantId,
        ability: &TaggedAbility,
        targets: &[CombatantId],
        rolls: &mut TurnRolls<'_, '_>,
        dispatcher: &ReactionDispatcher,
        results: &mut MechanicalResults,
    ) -> RulesResult<()> {
        let AbilityKind::Save {
            dc,
            ability: save_ability,
            damage,
            damage_type,
            half_on_success,
            condition,
        } = &ability.kind
        else {
            return Err(RulesError::NotActionable {
                ability: ability.name.clone(),
            });
        };

        let mut context = SpellContext {
            caster: actor_id.clone(),
            spell: ability.name.clone(),
            negated: false,
        };
        dispatcher.on_spell_cast(state, &mut context, results);
        if context.negated {
            tracing::debug!(caster = %actor_id, spell = %ability.name, "spell negated by reaction");
            return Ok(());
        }

        for target_id in targets {
            let save = self.saving_throw(state, target_id, *save_ability, *dc, rolls)?;
            results.saves.push(save.clone());

            if let (Some(dice), Some(damage_type)) = (damage, damage_type) {
                let rolled = self.roll_guarded(rolls, dice, "save damage", 1);
                let dealt = if save.success {
                    if *half_on_success {
                        rolled / 2
                    } else {
                        0
                    }
                } else {
                    rolled
                };
                if dealt > 0 {
                    self.apply_damage(state, target_id, dealt, *damage_type, false, rolls, results)?;
                }
            }
            if !save.success {
                if let Some(condition) = condition {
                    self.apply_condition_to(
                        state,
                        target_id,
                        ActiveCondition::new(condition.clone(), actor_id.clone())
                            .with_duration(1)
                            .with_save(*dc, *save_ability),
                        results,
                    );
                }
            }
        }
        Ok(())
    }

    /// A single saving throw, honoring condition auto-fails and legendary
    /// resistance.
    pub fn saving_throw(
        &self,
        state: &mut EncounterState,
        who: &CombatantId,
        ability: Ability,
        dc: i32,
        rolls: &mut TurnRolls<'_, '_>,
    ) -> RulesResult<SaveRecord> {
        let combatant = state
            .combatant(who)
            .ok_or_else(|| RulesError::UnknownCombatant(who.clone()))?
            .clone();

        let auto_fail = matches!(ability, Ability::Strength | Ability::Dexterity)
            && combatant
                .conditions
                .iter()
                .any(|c| c.condition.auto_fails_str_dex());

        let mut record = if auto_fail {
            SaveRecord {
                who: who.clone(),
                ability,
                dc,
                total: 0,
                success: false,
                legendary_resistance: false,
            }
        } else {
            let disadvantage = ability == Ability::Dexterity
                && combatant.has_condition(&Condition::Restrained);
            let advantage = Advantage::from_flags(false, disadvantage);
            let natural = self.roll_d20(rolls, advantage, &format!("{ability} save"));
            let mut modifier = combatant.scores.modifier(ability);
            if combatant.save_proficiencies.contains(&ability) {
                modifier += combatant.proficiency_bonus;
            }
            let total = natural + modifier;
            SaveRecord {
                who: who.clone(),
                ability,
                dc,
                total,
                success: total >= dc,
                legendary_resistance: false,
            }
        };

        // Legendary resistance converts the first failure each round.
        if !record.success {
            if let Some(combatant) = state.combatant_mut(who) {
                if combatant.legendary_resistances > 0
                    && !combatant.legendary_resistance_spent_this_round
                {
                    combatant.legendary_resistances -= 1;
                    combatant.legendary_resistance_spent_this_round = true;
                    record.success = true;
                    record.legendary_resistance = true;
                    tracing::info!(who = %who, "legendary resistance converts a failed save");
                }
            }
        }
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Damage and healing
    // ------------------------------------------------------------------

    /// Apply typed damage: resistance tables, instant death, falling
    /// unconscious, damage while down, and concentration checks.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_damage(
        &self,
        state: &mut EncounterState,
        target_id: &CombatantId,
        amount: i32,
        damage_type: DamageType,
        is_melee_crit: bool,
        rolls: &mut TurnRolls<'_, '_>,
        results: &mut MechanicalResults,
    ) -> RulesResult<()> {
        let target = state
            .combatant(target_id)
            .ok_or_else(|| RulesError::UnknownCombatant(target_id.clone()))?
            .clone();

        let adjusted = if target.immunities.contains(&damage_type) {
            0
        } else if target.resistances.contains(&damage_type) {
            (amount / 2).max(if amount > 0 { 1 } else { 0 })
        } else if target.vulnerabilities.contains(&damage_type) {
            amount * 2
        } else {
            amount
        };
        if adjusted == 0 {
            tracing::debug!(target = %target_id, damage_type = damage_type.name(), "damage negated by immunity");
            return Ok(());
        }

        // Damage while already down: death save failures, or instant death
        // on massive damage.
        if target.hp <= 0 && target.status != Status::Dead {
            if adjusted >= target.max_hp {
                self.set_status(state, target_id, Status::Dead, results);
                return Ok(());
            }
            let failures = if is_melee_crit { 2 } else { 1 };
            let died = state
                .combatant_mut(target_id)
                .map(|c| c.death_saves.add_failure(failures))
                .unwrap_or(false);
            if let Some(c) = state.combatant(target_id) {
                results.death_saves.push(DeathSaveRecord {
                    who: target_id.clone(),
                    successes: c.death_saves.successes,
                    failures: c.death_saves.failures,
                });
            }
            if died {
                self.set_status(state, target_id, Status::Dead, results);
            }
            return Ok(());
        }

        let new_hp = (target.hp - adjusted).max(0);
        let overflow = adjusted - target.hp;
        if let Some(c) = state.combatant_mut(target_id) {
            c.hp = new_hp;
        }
        results.hp_changes.push(HpChange {
            target: target_id.clone(),
            delta: -adjusted,
            new_hp,
        });

        if new_hp == 0 {
            if overflow >= target.max_hp {
                // Massive damage: dead outright regardless of side.
                self.set_status(state, target_id, Status::Dead, results);
            } else if target.side == crate::combatant::Side::Monster {
                self.set_status(state, target_id, Status::Dead, results);
            } else {
                self.set_status(state, target_id, Status::Unconscious, results);
                self.apply_condition_to(
                    state,
                    target_id,
                    ActiveCondition::new(Condition::Unconscious, target_id.clone()),
                    results,
                );
                if let Some(c) = state.combatant_mut(target_id) {
                    c.death_saves.reset();
                }
            }
            // Going down ends concentration without a check.
            self.drop_concentration(state, target_id, results);
        } else if target.concentration.is_some() {
            // Concentration check: Con save vs max(10, damage / 2).
            let dc = (adjusted / 2).max(10);
            let save = self.saving_throw(state, target_id, Ability::Constitution, dc, rolls)?;
            results.saves.push(save.clone());
            if !save.success {
                self.drop_concentration(state, target_id, results);
            }
        }
        Ok(())
    }

    /// Positive healing wakes the unconscious: status ok, counters reset,
    /// HP set to the healed amount (clamped to max).
    pub fn apply_healing(
        &self,
        state: &mut EncounterState,
        target_id: &CombatantId,
        amount: i32,
        results: &mut MechanicalResults,
    ) -> RulesResult<()> {
        if amount <= 0 {
            return Ok(());
        }
        let target = state
            .combatant(target_id)
            .ok_or_else(|| RulesError::UnknownCombatant(target_id.clone()))?
            .clone();
        if target.status == Status::Dead {
            return Err(RulesError::IllegalTarget {
                target: target_id.clone(),
                reason: "the dead cannot be healed".to_string(),
            });
        }

        let was_down = matches!(target.status, Status::Unconscious | Status::Stable);
        let new_hp = if was_down {
            amount.min(target.max_hp)
        } else {
            (target.hp + amount).min(target.max_hp)
        };
        let delta = new_hp - target.hp;
        if let Some(c) = state.combatant_mut(target_id) {
            c.hp = new_hp;
            if was_down {
                c.status = Status::Ok;
                c.death_saves.reset();
            }
        }
        results.hp_changes.push(HpChange {
            target: target_id.clone(),
            delta,
            new_hp,
        });
        if was_down {
            results.status_changes.push((target_id.clone(), Status::Ok));
            if let Some(c) = state.combatant_mut(target_id) {
                results
                    .conditions_removed
                    .extend(strip_condition(c, &Condition::Unconscious));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Movement
    // ------------------------------------------------------------------

    /// Deduct movement (doubled in difficult terrain), resolve opportunity
    /// attacks from hostiles whose reach the mover leaves, then shorten
    /// the distance toward the given target.
    fn move_combatant(
        &self,
        state: &mut EncounterState,
        mover_id: &CombatantId,
        toward: Option<CombatantId>,
        cost: i32,
        rolls: &mut TurnRolls<'_, '_>,
        results: &mut MechanicalResults,
    ) -> RulesResult<()> {
        let mover = state
            .combatant(mover_id)
            .ok_or_else(|| RulesError::UnknownCombatant(mover_id.clone()))?
            .clone();

        let difficult = mover
            .position
            .terrain
            .as_ref()
            .map(|zone| state.environment.difficult_terrain.contains(zone))
            .unwrap_or(false);
        let effective_cost = if difficult { cost * 2 } else { cost };

        if effective_cost > mover.economy.movement_remaining {
            return Err(RulesError::InsufficientMovement {
                actor: mover_id.clone(),
                needed: effective_cost,
                remaining: mover.economy.movement_remaining,
            });
        }

        // Opportunity attacks from hostiles the mover is leaving, unless
        // disengaging.
        if !mover.has_condition(&Condition::Disengaging) {
            let threats: Vec<CombatantId> = state
                .combatants
                .iter()
                .filter(|c| {
                    c.side.faction() != mover.side.faction()
                        && c.is_active()
                        && c.economy.reaction
                        && c.position.in_melee_with(mover_id)
                        && toward.as_ref() != Some(&c.id)
                })
                .map(|c| c.id.clone())
                .collect();

            for threat_id in threats {
                let Some(weapon) = state
                    .combatant(&threat_id)
                    .and_then(|c| {
                        c.abilities
                            .iter()
                            .find(|a| a.is_melee_attack())
                            .cloned()
                    })
                else {
                    continue;
                };
                if let Some(threat) = state.combatant_mut(&threat_id) {
                    threat.economy.reaction = false;
                }
                tracing::debug!(mover = %mover_id, threat = %threat_id, "opportunity attack");
                // Opportunity attacks cannot themselves be reacted to.
                self.resolve_attack(
                    state, &threat_id, mover_id, &weapon, rolls, &NO_REACTIONS, results, false,
                )?;
                let still_up = state
                    .combatant(mover_id)
                    .map(|c| c.is_active())
                    .unwrap_or(false);
                if !still_up {
                    // Dropped mid-step: remaining movement is cancelled.
                    return Ok(());
                }
            }
        }

        if let Some(mover) = state.combatant_mut(mover_id) {
            mover.economy.movement_remaining -= effective_cost;
        }
        if let Some(target_id) = toward {
            let current = state
                .combatant(mover_id)
                .map(|c| c.position.distance_to(&target_id));
            if let Some(current) = current {
                let new_distance = (current - cost).max(0);
                if let Some(mover) = state.combatant_mut(mover_id) {
                    mover.position.distance_to.insert(target_id.clone(), new_distance);
                }
                if let Some(target) = state.combatant_mut(&target_id) {
                    target.position.distance_to.insert(mover_id.clone(), new_distance);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn roll_d20(&self, rolls: &mut TurnRolls<'_, '_>, advantage: Advantage, purpose: &str) -> i32 {
        match advantage {
            Advantage::Normal => rolls.roll("1d20", purpose),
            Advantage::Advantage => {
                let first = rolls.roll("1d20", &format!("{purpose} (advantage)"));
                let second = rolls.roll("1d20", &format!("{purpose} (advantage)"));
                first.max(second)
            }
            Advantage::Disadvantage => {
                let first = rolls.roll("1d20", &format!("{purpose} (disadvantage)"));
                let second = rolls.roll("1d20", &format!("{purpose} (disadvantage)"));
                first.min(second)
            }
        }
    }

    /// Roll an engine-built expression, substituting a flat fallback if it
    /// somehow is not well formed.
    fn roll_guarded(
        &self,
        rolls: &mut TurnRolls<'_, '_>,
        expression: &str,
        purpose: &str,
        fallback: i32,
    ) -> i32 {
        let sane = !expression.is_empty()
            && expression
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, 'd' | '+' | '-' | ' '));
        if !sane {
            tracing::warn!(expression, "malformed dice expression; using fallback");
            return fallback;
        }
        rolls.roll(expression, purpose).max(0)
    }

    fn spend_action(&self, state: &mut EncounterState, actor_id: &CombatantId) -> RulesResult<()> {
        let actor = state
            .combatant_mut(actor_id)
            .ok_or_else(|| RulesError::UnknownCombatant(actor_id.clone()))?;
        if !actor.economy.action {
            return Err(RulesError::EconomyViolation {
                actor: actor_id.clone(),
                slot: "action".to_string(),
            });
        }
        actor.economy.action = false;
        Ok(())
    }

    fn spend_reaction(&self, state: &mut EncounterState, actor_id: &CombatantId) -> RulesResult<()> {
        let actor = state
            .combatant_mut(actor_id)
            .ok_or_else(|| RulesError::UnknownCombatant(actor_id.clone()))?;
        if !actor.economy.reaction {
            return Err(RulesError::EconomyViolation {
                actor: actor_id.clone(),
                slot: "reaction".to_string(),
            });
        }
        actor.economy.reaction = false;
        Ok(())
    }

    fn set_status(
        &self,
        state: &mut EncounterState,
        id: &CombatantId,
        status: Status,
        results: &mut MechanicalResults,
    ) {
        let changed = match state.combatant_mut(id) {
            Some(c) if c.status != status => {
                c.status = status;
                true
            }
            _ => false,
        };
        if changed {
            results.status_changes.push((id.clone(), status));
            if status == Status::Dead {
                self.drop_concentration(state, id, results);
            }
        }
    }

    fn apply_condition_to(
        &self,
        state: &mut EncounterState,
        id: &CombatantId,
        condition: ActiveCondition,
        results: &mut MechanicalResults,
    ) {
        if let Some(c) = state.combatant_mut(id) {
            if !c.has_condition(&condition.condition) {
                results
                    .conditions_applied
                    .push((id.clone(), condition.condition.clone()));
                c.conditions.push(condition);
            }
        }
    }

    /// End a caster's concentration: the linked condition is removed from
    /// every affected combatant and the drop is recorded.
    pub fn drop_concentration(
        &self,
        state: &mut EncounterState,
        caster_id: &CombatantId,
        results: &mut MechanicalResults,
    ) {
        let Some(link) = state
            .combatant_mut(caster_id)
            .and_then(|c| c.concentration.take())
        else {
            return;
        };
        let linked = Condition::Linked(link.spell.clone());
        for target_id in &link.targets {
            if let Some(target) = state.combatant_mut(target_id) {
                let before = target.conditions.len();
                target
                    .conditions
                    .retain(|c| !(c.condition == linked && c.source_id == *caster_id));
                if target.conditions.len() != before {
                    results
                        .conditions_removed
                        .push((target_id.clone(), linked.clone()));
                }
            }
        }
        results
            .concentration_drops
            .push((caster_id.clone(), link.spell));
        tracing::info!(caster = %caster_id, "concentration dropped");
    }
}

/// Dispatcher with no registered reactors, for nested resolutions that
/// must not recurse.
static NO_REACTIONS: ReactionDispatcher = ReactionDispatcher::disabled();

/// Compute advantage state for an attack from the standing conditions.
fn attack_advantage(
    state: &EncounterState,
    attacker: &Combatant,
    target: &Combatant,
    ranged: bool,
    in_melee: bool,
) -> Advantage {
    let mut has_advantage = false;
    let mut has_disadvantage = false;

    if attacker.position.flanking && !ranged {
        has_advantage = true;
    }
    if attacker.has_condition(&Condition::Hidden) || attacker.has_condition(&Condition::Helped) {
        has_advantage = true;
    }
    // Attacker impairments.
    if attacker.has_condition(&Condition::Blinded)
        || attacker.has_condition(&Condition::Restrained)
        || attacker.has_condition(&Condition::Prone)
    {
        has_disadvantage = true;
    }
    // Frightened only bites while the source of the fear is still in the
    // fight (the line-of-sight proxy without grid geometry).
    if attacker
        .conditions
        .iter()
        .filter(|c| c.condition == Condition::Frightened)
        .any(|c| {
            state
                .combatant(&c.source_id)
                .map(|source| source.is_active())
                .unwrap_or(false)
        })
    {
        has_disadvantage = true;
    }
    // Target state.
    for active in &target.conditions {
        match active.condition {
            Condition::Unconscious | Condition::Paralyzed | Condition::Blinded
            | Condition::Restrained => has_advantage = true,
            Condition::Prone => {
                if ranged || !in_melee {
                    has_disadvantage = true;
                } else {
                    has_advantage = true;
                }
            }
            Condition::Dodging => has_disadvantage = true,
            _ => {}
        }
    }

    Advantage::from_flags(has_advantage, has_disadvantage)
}

fn strip_condition(combatant: &mut Combatant, condition: &Condition) -> Vec<(CombatantId, Condition)> {
    let before = combatant.conditions.len();
    combatant.conditions.retain(|c| &c.condition != condition);
    if combatant.conditions.len() != before {
        vec![(combatant.id.clone(), condition.clone())]
    } else {
        Vec::new()
    }
}
