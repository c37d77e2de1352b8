//! Combatant data model.
//!
//! Combatants are created externally and handed to the engine by value at
//! `start`. The engine owns them exclusively for the life of the
//! resolution; observers only ever see clones carried by events.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

// ============================================================================
// Identity
// ============================================================================

/// Stable identifier for a combatant, supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct CombatantId(pub String);

impl CombatantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CombatantId {
    fn from(s: &str) -> Self {
        CombatantId(s.to_string())
    }
}

impl From<String> for CombatantId {
    fn from(s: String) -> Self {
        CombatantId(s)
    }
}

impl fmt::Display for CombatantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the encounter a combatant fights for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Player,
    Monster,
    Npc,
}

impl Side {
    /// Players and NPCs form one faction against the monsters.
    pub fn faction(&self) -> Faction {
        match self {
            Side::Monster => Faction::Monsters,
            Side::Player | Side::Npc => Faction::Players,
        }
    }
}

/// The two opposing factions used for targeting and the end condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Faction {
    Players,
    Monsters,
}

// ============================================================================
// Abilities and scores
// ============================================================================

/// The six D&D ability scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ability {
    Strength,
    Dexterity,
    Constitution,
    Intelligence,
    Wisdom,
    Charisma,
}

impl Ability {
    pub fn abbreviation(&self) -> &'static str {
        match self {
            Ability::Strength => "STR",
            Ability::Dexterity => "DEX",
            Ability::Constitution => "CON",
            Ability::Intelligence => "INT",
            Ability::Wisdom => "WIS",
            Ability::Charisma => "CHA",
        }
    }
}

impl fmt::Display for Ability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.abbreviation())
    }
}

/// Ability score block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityScores {
    pub strength: u8,
    pub dexterity: u8,
    pub constitution: u8,
    pub intelligence: u8,
    pub wisdom: u8,
    pub charisma: u8,
}

impl AbilityScores {
    pub fn new(str: u8, dex: u8, con: u8, int: u8, wis: u8, cha: u8) -> Self {
        Self {
            strength: str,
            dexterity: dex,
            constitution: con,
            intelligence: int,
            wisdom: wis,
            charisma: cha,
        }
    }

    pub fn get(&self, ability: Ability) -> u8 {
        match ability {
            Ability::Strength => self.strength,
            Ability::Dexterity => self.dexterity,
            Ability::Constitution => self.constitution,
            Ability::Intelligence => self.intelligence,
            Ability::Wisdom => self.wisdom,
            Ability::Charisma => self.charisma,
        }
    }

    /// Standard modifier: (score - 10) / 2, rounded down.
    pub fn modifier(&self, ability: Ability) -> i32 {
        (self.get(ability) as i32 - 10).div_euclid(2)
    }
}

impl Default for AbilityScores {
    fn default() -> Self {
        Self::new(10, 10, 10, 10, 10, 10)
    }
}

// ============================================================================
// Status and death saves
// ============================================================================

/// Combatant life status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Ok,
    Unconscious,
    Dead,
    Stable,
}

impl Status {
    pub fn name(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Unconscious => "unconscious",
            Status::Dead => "dead",
            Status::Stable => "stable",
        }
    }

    /// Out of the fight: counts toward the side-elimination check.
    pub fn is_down(&self) -> bool {
        !matches!(self, Status::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Death saving throw counters (0-3 each).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathSaves {
    pub successes: u8,
    pub failures: u8,
}

impl DeathSaves {
    /// Returns true when three successes are reached (stabilized).
    pub fn add_success(&mut self) -> bool {
        self.successes = (self.successes + 1).min(3);
        self.successes >= 3
    }

    /// Returns true when three failures are reached (death).
    pub fn add_failure(&mut self, count: u8) -> bool {
        self.failures = (self.failures + count).min(3);
        self.failures >= 3
    }

    pub fn reset(&mut self) {
        self.successes = 0;
        self.failures = 0;
    }
}

// ============================================================================
// Action economy
// ============================================================================

/// Per-turn action budget. Booleans are `true` while the slot is unspent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEconomy {
    pub action: bool,
    pub bonus_action: bool,
    pub reaction: bool,
    pub movement_remaining: i32,
    pub legendary_used: u8,
}

impl ActionEconomy {
    pub fn fresh(speed: i32) -> Self {
        Self {
            action: true,
            bonus_action: true,
            reaction: true,
            movement_remaining: speed,
            legendary_used: 0,
        }
    }

    /// Start-of-turn reset: action, bonus action, reaction and movement.
    /// `legendary_used` resets at round start, not here.
    pub fn reset_for_turn(&mut self, speed: i32) {
        self.action = true;
        self.bonus_action = true;
        self.reaction = true;
        self.movement_remaining = speed;
    }
}

impl Default for ActionEconomy {
    fn default() -> Self {
        Self::fresh(30)
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// Conditions with fixed mechanical effects, plus spell-linked effects
/// (concentration auras and the like) carried by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Unconscious,
    Paralyzed,
    Stunned,
    Prone,
    Frightened,
    Blinded,
    Restrained,
    Grappled,
    Incapacitated,
    /// Dodging until the start of the combatant's next turn.
    Dodging,
    /// Movement does not provoke opportunity attacks this turn.
    Disengaging,
    /// Advantage on the next attack roll, granted by the Help action.
    Helped,
    /// Hidden; attacks from hiding have advantage.
    Hidden,
    /// A named ongoing effect, usually bound to a caster's concentration.
    #[serde(untagged)]
    Linked(String),
}

impl Condition {
    pub fn name(&self) -> &str {
        match self {
            Condition::Unconscious => "unconscious",
            Condition::Paralyzed => "paralyzed",
            Condition::Stunned => "stunned",
            Condition::Prone => "prone",
            Condition::Frightened => "frightened",
            Condition::Blinded => "blinded",
            Condition::Restrained => "restrained",
            Condition::Grappled => "grappled",
            Condition::Incapacitated => "incapacitated",
            Condition::Dodging => "dodging",
            Condition::Disengaging => "disengaging",
            Condition::Helped => "helped",
            Condition::Hidden => "hidden",
            Condition::Linked(name) => name,
        }
    }

    /// No actions or reactions while this holds.
    pub fn is_incapacitating(&self) -> bool {
        matches!(
            self,
            Condition::Incapacitated
                | Condition::Paralyzed
                | Condition::Stunned
                | Condition::Unconscious
        )
    }

    /// Auto-fail Strength and Dexterity saving throws.
    pub fn auto_fails_str_dex(&self) -> bool {
        matches!(
            self,
            Condition::Unconscious | Condition::Paralyzed | Condition::Stunned
        )
    }

    /// Speed is 0 while this holds.
    pub fn zeroes_speed(&self) -> bool {
        matches!(self, Condition::Restrained | Condition::Grappled)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Remaining lifetime of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionDuration {
    Rounds(i32),
    Indefinite,
}

/// A condition applied to a combatant, with tracking info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveCondition {
    pub condition: Condition,
    pub duration: ConditionDuration,
    pub source_id: CombatantId,
    pub save_dc: Option<i32>,
    pub save_ability: Option<Ability>,
}

impl ActiveCondition {
    pub fn new(condition: Condition, source_id: CombatantId) -> Self {
        Self {
            condition,
            duration: ConditionDuration::Indefinite,
            source_id,
            save_dc: None,
            save_ability: None,
        }
    }

    pub fn with_duration(mut self, rounds: i32) -> Self {
        self.duration = ConditionDuration::Rounds(rounds);
        self
    }

    pub fn with_save(mut self, dc: i32, ability: Ability) -> Self {
        self.save_dc = Some(dc);
        self.save_ability = Some(ability);
        self
    }
}

// ============================================================================
// Damage
// ============================================================================

/// Damage types recognized by the resistance tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DamageType {
    Slashing,
    Piercing,
    Bludgeoning,
    Fire,
    Cold,
    Lightning,
    Thunder,
    Acid,
    Poison,
    Necrotic,
    Radiant,
    Force,
    Psychic,
}

impl DamageType {
    pub fn name(&self) -> &'static str {
        match self {
            DamageType::Slashing => "slashing",
            DamageType::Piercing => "piercing",
            DamageType::Bludgeoning => "bludgeoning",
            DamageType::Fire => "fire",
            DamageType::Cold => "cold",
            DamageType::Lightning => "lightning",
            DamageType::Thunder => "thunder",
            DamageType::Acid => "acid",
            DamageType::Poison => "poison",
            DamageType::Necrotic => "necrotic",
            DamageType::Radiant => "radiant",
            DamageType::Force => "force",
            DamageType::Psychic => "psychic",
        }
    }
}

// ============================================================================
// Position and cover
// ============================================================================

/// Degree of cover a target enjoys against the current attacker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cover {
    Half,
    ThreeQuarters,
    Full,
}

impl Cover {
    /// AC bonus granted; full cover is an auto-miss handled separately.
    pub fn ac_bonus(&self) -> i32 {
        match self {
            Cover::Half => 2,
            Cover::ThreeQuarters => 5,
            Cover::Full => 0,
        }
    }
}

/// Opaque position bag: pairwise distances plus optional cover/terrain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Distance in feet to each other combatant.
    pub distance_to: HashMap<CombatantId, i32>,
    pub cover: Option<Cover>,
    /// Terrain zone name, matched against the environment's difficult set.
    pub terrain: Option<String>,
    /// Flanking grants advantage on melee attacks.
    pub flanking: bool,
}

impl Position {
    pub fn distance_to(&self, other: &CombatantId) -> i32 {
        self.distance_to.get(other).copied().unwrap_or(i32::MAX)
    }

    /// Within 5 ft melee reach of the other combatant.
    pub fn in_melee_with(&self, other: &CombatantId) -> bool {
        self.distance_to(other) <= 5
    }
}

// ============================================================================
// Recharge and legendary pools
// ============================================================================

/// Inclusive d6 range on which a spent ability recharges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RechargeRange {
    pub low: i32,
    pub high: i32,
}

impl RechargeRange {
    pub fn contains(&self, roll: i32) -> bool {
        roll >= self.low && roll <= self.high
    }
}

/// Tracks whether a recharge ability is currently available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RechargeState {
    pub range: RechargeRange,
    pub available: bool,
}

/// Per-round legendary action budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegendaryPool {
    pub max: u8,
    pub used: u8,
}

impl LegendaryPool {
    pub fn remaining(&self) -> u8 {
        self.max.saturating_sub(self.used)
    }
}

// ============================================================================
// Abilities
// ============================================================================

/// Mechanical shape of an owned ability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbilityKind {
    /// Weapon or natural attack.
    Attack {
        bonus: i32,
        damage: String,
        damage_type: DamageType,
        ranged: bool,
        reach_ft: i32,
    },
    /// Save-based effect (breath weapons, most damaging spells).
    Save {
        dc: i32,
        ability: Ability,
        damage: Option<String>,
        damage_type: Option<DamageType>,
        /// Half damage on a successful save instead of no effect.
        half_on_success: bool,
        condition: Option<Condition>,
    },
    /// Restores hit points to the target.
    Heal { dice: String },
    /// Spent as a reaction when its trigger fires.
    Reaction { effect: ReactionEffect },
    /// Usable only through the legendary action pool.
    Legendary { cost: u8, attack: Box<AbilityKind> },
    /// Narrative-only trait with no mechanical execution.
    Trait,
}

/// What a reaction ability does to the in-flight resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionEffect {
    /// Raise own AC against the triggering attack (e.g. Shield: +5).
    AcBonus(i32),
    /// Negate the triggering spell outright (e.g. Counterspell).
    NegateSpell,
}

/// An ability string carried by a combatant, tagged with its owner's
/// canonical identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedAbility {
    pub name: String,
    /// Canonical-ownership marker: `[<name>_<id>_ability]`.
    pub tag: String,
    pub kind: AbilityKind,
    pub recharge: Option<RechargeRange>,
    /// Healing and buff abilities may target allies.
    pub targets_allies: bool,
}

impl TaggedAbility {
    pub fn new(name: impl Into<String>, owner: &CombatantId, owner_name: &str, kind: AbilityKind) -> Self {
        let name = name.into();
        Self {
            tag: ability_tag(owner_name, owner),
            name,
            kind,
            recharge: None,
            targets_allies: false,
        }
    }

    pub fn with_recharge(mut self, low: i32, high: i32) -> Self {
        self.recharge = Some(RechargeRange { low, high });
        self
    }

    pub fn ally_targeted(mut self) -> Self {
        self.targets_allies = true;
        self
    }

    pub fn is_melee_attack(&self) -> bool {
        matches!(self.kind, AbilityKind::Attack { ranged: false, .. })
    }

    pub fn is_heal(&self) -> bool {
        matches!(self.kind, AbilityKind::Heal { .. })
    }
}

/// Format the canonical ownership tag for an ability.
pub fn ability_tag(owner_name: &str, owner: &CombatantId) -> String {
    format!("[{}_{}_ability]", owner_name.to_lowercase().replace(' ', "-"), owner)
}

// ============================================================================
// Combatant
// ============================================================================

/// A participant in the encounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Combatant {
    pub id: CombatantId,
    pub name: String,
    pub side: Side,
    pub scores: AbilityScores,
    pub armor_class: i32,
    pub hp: i32,
    pub max_hp: i32,
    /// Walking speed in feet per round.
    pub speed: i32,
    pub initiative: i32,
    /// Dexterity score breaks initiative ties.
    pub initiative_tiebreak: u8,
    /// Won initiative advantage; final tiebreak.
    pub initiative_advantage: bool,
    pub status: Status,
    pub position: Position,
    pub economy: ActionEconomy,
    pub conditions: Vec<ActiveCondition>,
    pub resistances: HashSet<DamageType>,
    pub immunities: HashSet<DamageType>,
    pub vulnerabilities: HashSet<DamageType>,
    /// Spell the combatant is concentrating on, with the targets it binds.
    pub concentration: Option<ConcentrationLink>,
    pub death_saves: DeathSaves,
    pub recharge_pool: HashMap<String, RechargeState>,
    pub legendary: LegendaryPool,
    pub legendary_resistances: u8,
    /// Set once legendary resistance has been consumed this round.
    pub legendary_resistance_spent_this_round: bool,
    pub abilities: Vec<TaggedAbility>,
    /// Saving throw proficiencies.
    pub save_proficiencies: HashSet<Ability>,
    pub proficiency_bonus: i32,
    /// Natural 19-20 crits when set.
    pub improved_critical: bool,
}

/// Binds one ongoing spell effect to its caster's concentration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationLink {
    pub spell: String,
    pub targets: Vec<CombatantId>,
}

impl Combatant {
    /// Minimal constructor; callers fill the rest through the fields or
    /// the builder-style helpers below.
    pub fn new(id: impl Into<String>, name: impl Into<String>, side: Side) -> Self {
        let id = CombatantId(id.into());
        Self {
            id,
            name: name.into(),
            side,
            scores: AbilityScores::default(),
            armor_class: 10,
            hp: 1,
            max_hp: 1,
            speed: 30,
            initiative: 0,
            initiative_tiebreak: 10,
            initiative_advantage: false,
            status: Status::Ok,
            position: Position::default(),
            economy: ActionEconomy::default(),
            conditions: Vec::new(),
            resistances: HashSet::new(),
            immunities: HashSet::new(),
            vulnerabilities: HashSet::new(),
            concentration: None,
            death_saves: DeathSaves::default(),
            recharge_pool: HashMap::new(),
            legendary: LegendaryPool::default(),
            legendary_resistances: 0,
            legendary_resistance_spent_this_round: false,
            abilities: Vec::new(),
            save_proficiencies: HashSet::new(),
            proficiency_bonus: 2,
            improved_critical: false,
        }
    }

    pub fn with_hp(mut self, hp: i32) -> Self {
        self.hp = hp;
        self.max_hp = hp;
        self
    }

    pub fn with_ac(mut self, ac: i32) -> Self {
        self.armor_class = ac;
        self
    }

    pub fn with_initiative(mut self, initiative: i32) -> Self {
        self.initiative = initiative;
        self
    }

    pub fn with_scores(mut self, scores: AbilityScores) -> Self {
        self.initiative_tiebreak = scores.dexterity;
        self.scores = scores;
        self
    }

    pub fn with_speed(mut self, speed: i32) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_legendary(mut self, max: u8) -> Self {
        self.legendary = LegendaryPool { max, used: 0 };
        self
    }

    /// Attach an ability, tagging it with this combatant's canonical id.
    pub fn add_ability(mut self, name: impl Into<String>, kind: AbilityKind) -> Self {
        let ability = TaggedAbility::new(name, &self.id, &self.name, kind);
        if let Some(range) = ability.recharge {
            self.recharge_pool.insert(
                ability.name.to_lowercase(),
                RechargeState { range, available: true },
            );
        }
        self.abilities.push(ability);
        self
    }

    /// Attach a pre-built ability (for recharge or ally-targeted ones).
    pub fn add_tagged(mut self, mut ability: TaggedAbility) -> Self {
        ability.tag = ability_tag(&self.name, &self.id);
        if let Some(range) = ability.recharge {
            self.recharge_pool.insert(
                ability.name.to_lowercase(),
                RechargeState { range, available: true },
            );
        }
        self.abilities.push(ability);
        self
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.status, Status::Dead)
    }

    /// Able to take a normal turn.
    pub fn is_active(&self) -> bool {
        matches!(self.status, Status::Ok)
    }

    pub fn has_condition(&self, condition: &Condition) -> bool {
        self.conditions.iter().any(|c| &c.condition == condition)
    }

    pub fn is_incapacitated(&self) -> bool {
        self.conditions.iter().any(|c| c.condition.is_incapacitating())
    }

    /// Effective speed after conditions.
    pub fn effective_speed(&self) -> i32 {
        if self.conditions.iter().any(|c| c.condition.zeroes_speed()) {
            0
        } else {
            self.speed
        }
    }

    pub fn find_ability(&self, name: &str) -> Option<&TaggedAbility> {
        self.abilities
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn hp_ratio(&self) -> f32 {
        if self.max_hp <= 0 {
            0.0
        } else {
            self.hp as f32 / self.max_hp as f32
        }
    }
}
