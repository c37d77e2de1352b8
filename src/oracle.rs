//! Oracle gateway: turns `(combatant, encounter)` into a validated intent.
//!
//! The oracle itself is an injected blocking callback. The gateway builds
//! the prompt, runs the call under a cooperative cancel token, then pushes
//! the reply through a strict -> repair -> scavenge parse ladder and
//! validates the result against the actor's canonical abilities and
//! current action economy. Failures are reported by value; the fallback
//! ladder dispatches on them.

use crate::combatant::{Combatant, CombatantId};
use crate::config::ResolutionConfig;
use crate::encounter::EncounterState;
use crate::error::{IntentFailure, OracleError};
use crate::intent::{Decision, Intent};
use crate::summary::ContextSummariser;
use crate::validator::AbilityValidator;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation token, checked at every suspension point and
/// passed into the oracle callback, which is required to honour it.
///
/// Child tokens share the parent's cancel flag but may carry a tighter
/// deadline, so a per-call budget composes with `stop`.
#[derive(Debug, Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// A child sharing this token's flag, expiring after `budget`.
    pub fn child_with_budget(&self, budget: Duration) -> Self {
        let deadline = Instant::now() + budget;
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: Some(match self.deadline {
                Some(parent) => parent.min(deadline),
                None => deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Whether cancellation came from the flag (a stop) rather than the
    /// deadline.
    pub fn is_stopped(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Injected dice callback: evaluates an expression like `2d6+3`.
pub type RollFn<'a> = dyn FnMut(&str) -> i32 + Send + 'a;

/// Injected oracle callback: blocking completion that must honour the
/// cancel token it is given.
pub type OracleFn<'a> = dyn FnMut(&str, &CancelToken) -> Result<String, OracleError> + Send + 'a;

// ============================================================================
// Wire format
// ============================================================================

/// Advisory dice request in the oracle's reply.
#[derive(Debug, Clone, Deserialize)]
pub struct DiceRequest {
    pub expression: String,
    #[serde(default)]
    pub purpose: String,
}

/// The raw decision shape the oracle is asked for.
#[derive(Debug, Clone, Deserialize)]
struct RawDecision {
    #[serde(flatten)]
    intent: Intent,
    #[serde(default)]
    dice_requests: Vec<DiceRequest>,
    #[serde(default)]
    narrative: String,
    #[serde(default)]
    uses_reaction: bool,
}

// ============================================================================
// Gateway
// ============================================================================

pub struct OracleGateway {
    summariser: ContextSummariser,
    hide_enemy_hp: bool,
}

impl OracleGateway {
    pub fn new(config: &ResolutionConfig) -> Self {
        Self {
            summariser: ContextSummariser::new(
                config.summary_verbatim_turns,
                config.summary_char_budget,
            ),
            hide_enemy_hp: config.hide_enemy_hp_bands,
        }
    }

    /// Build the turn prompt: schema preamble, summarised history, actor
    /// sheet, enemy roster. The caller passes the result through the
    /// ability validator before sending.
    pub fn build_prompt(
        &self,
        state: &EncounterState,
        actor: &Combatant,
        retry_note: Option<&str>,
    ) -> String {
        let mut prompt = String::new();

        prompt.push_str(PROMPT_PREAMBLE);
        prompt.push('\n');

        prompt.push_str("# COMBAT HISTORY\n");
        prompt.push_str(&self.summariser.summarise(state));
        prompt.push('\n');

        prompt.push_str(&format!("# ACTIVE COMBATANT: {} ({})\n", actor.name, actor.id));
        prompt.push_str(&format!(
            "HP {}/{}, AC {}, speed {} ft\n",
            actor.hp, actor.max_hp, actor.armor_class, actor.speed
        ));
        prompt.push_str(&format!(
            "Action economy: action={}, bonus_action={}, reaction={}, movement {} ft\n",
            actor.economy.action,
            actor.economy.bonus_action,
            actor.economy.reaction,
            actor.economy.movement_remaining
        ));
        if !actor.conditions.is_empty() {
            let names: Vec<&str> = actor.conditions.iter().map(|c| c.condition.name()).collect();
            prompt.push_str(&format!("Conditions: {}\n", names.join(", ")));
        }

        prompt.push_str("## Actions:\n");
        for ability in &actor.abilities {
            let recharge_note = match actor.recharge_pool.get(ability.name.to_lowercase().as_str())
            {
                Some(entry) if !entry.available => " (recharging)",
                _ => "",
            };
            prompt.push_str(&format!(
                "- {}: {:?}{} {}\n",
                ability.name, ability.kind, recharge_note, ability.tag
            ));
        }

        prompt.push_str("\n# NEARBY ENEMIES\n");
        for enemy in state.living_enemies(actor) {
            let hp_text = if self.hide_enemy_hp {
                hp_band(enemy.hp, enemy.max_hp).to_string()
            } else {
                format!("{}/{}", enemy.hp, enemy.max_hp)
            };
            let conditions: Vec<&str> =
                enemy.conditions.iter().map(|c| c.condition.name()).collect();
            prompt.push_str(&format!(
                "- {} (id: {}): {} HP, AC {}, {} ft away{}\n",
                enemy.name,
                enemy.id,
                hp_text,
                enemy.armor_class,
                actor.position.distance_to(&enemy.id),
                if conditions.is_empty() {
                    String::new()
                } else {
                    format!(", conditions: {}", conditions.join(", "))
                }
            ));
        }

        if let Some(note) = retry_note {
            prompt.push_str("\n# CORRECTION\n");
            prompt.push_str("Your previous answer was rejected: ");
            prompt.push_str(note);
            prompt.push_str("\nAnswer again with a valid JSON object.\n");
        }

        prompt
    }

    /// Call the oracle and parse its reply. Transport and parse failures
    /// come back as values for the ladder.
    pub fn request_intent(
        &self,
        oracle: &mut OracleFn<'_>,
        prompt: &str,
        token: &CancelToken,
    ) -> Result<Decision, IntentFailure> {
        if token.is_cancelled() {
            return Err(IntentFailure::Transport(OracleError::Cancelled));
        }

        let text = oracle(prompt, token).map_err(IntentFailure::Transport)?;
        let raw = parse_decision(&text).map_err(IntentFailure::Parse)?;

        for request in &raw.dice_requests {
            if !is_sane_dice_expression(&request.expression) {
                tracing::warn!(
                    expression = %request.expression,
                    "dropping malformed oracle dice request"
                );
            }
        }

        Ok(Decision {
            intent: raw.intent,
            narrative: raw.narrative,
            uses_reaction: raw.uses_reaction,
        })
    }

    /// Validate a parsed decision against the actor and encounter.
    pub fn validate(
        &self,
        state: &EncounterState,
        actor: &Combatant,
        validator: &AbilityValidator,
        decision: &Decision,
    ) -> Result<(), IntentFailure> {
        let intent = &decision.intent;

        if matches!(intent, Intent::DeathSave) {
            return Err(IntentFailure::Invalid(
                "death saves are engine-originated".into(),
            ));
        }
        // Legendary actions resolve through the between-turns dispatcher,
        // never as the turn's own action.
        if matches!(intent, Intent::Legendary { .. }) {
            return Err(IntentFailure::Invalid(
                "legendary actions happen between other combatants' turns".into(),
            ));
        }

        validator
            .validate_intent(intent, actor)
            .map_err(IntentFailure::Invalid)?;

        // Recharge abilities must actually be charged.
        if let Some(name) = intent.ability_name() {
            if let Some(entry) = actor.recharge_pool.get(name.to_lowercase().as_str()) {
                if !entry.available && !matches!(intent, Intent::RechargeAbility { .. }) {
                    return Err(IntentFailure::Invalid(format!(
                        "'{name}' has not recharged yet"
                    )));
                }
            }
        }

        let ability = intent.ability_name().and_then(|n| actor.find_ability(n));
        for target_id in intent.targets() {
            let target = state.combatant(target_id).ok_or_else(|| {
                IntentFailure::Invalid(format!("unknown target '{target_id}'"))
            })?;
            if !target.is_alive() {
                return Err(IntentFailure::Invalid(format!(
                    "target '{target_id}' is dead"
                )));
            }
            let friendly = target.side.faction() == actor.side.faction();
            let allows_allies = matches!(intent, Intent::Help { .. })
                || ability.map(|a| a.targets_allies).unwrap_or(false);
            if friendly && !allows_allies && target.id != actor.id {
                return Err(IntentFailure::Invalid(format!(
                    "'{target_id}' is an ally; this action targets enemies"
                )));
            }
            if !friendly && allows_allies {
                return Err(IntentFailure::Invalid(format!(
                    "'{target_id}' is an enemy; this action targets allies"
                )));
            }
        }

        if intent.spends_action() && !actor.economy.action {
            return Err(IntentFailure::Invalid(
                "the action for this turn is already spent".into(),
            ));
        }
        if decision.uses_reaction && !actor.economy.reaction {
            return Err(IntentFailure::Invalid(
                "the reaction is already spent".into(),
            ));
        }
        if let Some(cost) = intent.movement_cost() {
            if cost < 0 {
                return Err(IntentFailure::Invalid("negative movement cost".into()));
            }
        }

        Ok(())
    }
}

/// Coarse HP description used when exact enemy HP is hidden.
fn hp_band(hp: i32, max_hp: i32) -> &'static str {
    if hp <= 0 {
        "down"
    } else if hp * 4 <= max_hp {
        "critical"
    } else if hp * 2 <= max_hp {
        "bloodied"
    } else {
        "healthy"
    }
}

const PROMPT_PREAMBLE: &str = r#"# OUTPUT FORMAT
Decide this combatant's turn. Reply with a single JSON object:
{
  "action_type": "attack | spell | cantrip | dash | dodge | disengage | help | hide | ready | use_item | recharge_ability | legendary",
  "ability_name": "<one of the actor's listed abilities>",
  "targets": ["<combatant id>"],
  "dice_requests": [{"expression": "1d20+4", "purpose": "attack roll"}],
  "narrative": "<one sentence>"
}
Only use abilities listed for the active combatant. Target ids must come
from the roster below.

Examples:
{"action_type": "attack", "ability_name": "Shortsword", "targets": ["goblin-2"], "dice_requests": [{"expression": "1d20+4", "purpose": "attack roll"}], "narrative": "A quick thrust at the goblin."}
{"action_type": "dodge", "targets": [], "dice_requests": [], "narrative": "Weaves defensively, biding time."}
"#;

// ============================================================================
// Parse ladder
// ============================================================================

/// Strict parse, then repair, then permissive key-value scavenging.
fn parse_decision(text: &str) -> Result<RawDecision, String> {
    // Fast path: the whole reply is the object.
    if let Ok(decision) = serde_json::from_str::<RawDecision>(text) {
        return Ok(decision);
    }

    // Repair: strip fences and surrounding prose, balance brackets, drop
    // trailing commas.
    let repaired = repair_json(text);
    match serde_json::from_str::<RawDecision>(&repaired) {
        Ok(decision) => {
            tracing::debug!("oracle reply required JSON repair");
            Ok(decision)
        }
        Err(repair_err) => {
            // Last resort: scavenge action_type / ability_name / targets.
            scavenge_decision(text)
                .ok_or_else(|| format!("unparseable after repair: {repair_err}"))
        }
    }
}

/// Extract the outermost JSON object and fix the common oracle mistakes.
fn repair_json(text: &str) -> String {
    let mut candidate = text.trim();

    // Markdown fences.
    if let Some(start) = candidate.find("```") {
        let after = &candidate[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        candidate = match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        };
    }

    // Trim prose around the outermost braces.
    let start = candidate.find('{');
    let end = candidate.rfind('}');
    let mut body = match (start, end) {
        (Some(s), Some(e)) if e > s => candidate[s..=e].to_string(),
        (Some(s), _) => candidate[s..].to_string(),
        _ => candidate.to_string(),
    };

    // Trailing commas before a closing brace or bracket.
    while let Some(pos) = find_trailing_comma(&body) {
        body.remove(pos);
    }

    // Close unbalanced braces/brackets (string-aware).
    let mut depth_braces = 0i32;
    let mut depth_brackets = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for ch in body.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth_braces += 1,
            '}' if !in_string => depth_braces -= 1,
            '[' if !in_string => depth_brackets += 1,
            ']' if !in_string => depth_brackets -= 1,
            _ => {}
        }
    }
    if in_string {
        body.push('"');
    }
    for _ in 0..depth_brackets.max(0) {
        body.push(']');
    }
    for _ in 0..depth_braces.max(0) {
        body.push('}');
    }

    body
}

fn find_trailing_comma(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut in_string = false;
    let mut escaped = false;
    let mut last_comma: Option<usize> = None;
    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b',' if !in_string => last_comma = Some(i),
            b'}' | b']' if !in_string => {
                if let Some(c) = last_comma {
                    if body[c + 1..i].chars().all(char::is_whitespace) {
                        return Some(c);
                    }
                }
                last_comma = None;
            }
            b if !in_string && !b.is_ascii_whitespace() => last_comma = None,
            _ => {}
        }
    }
    None
}

/// Permissive key-value scan for the load-bearing fields.
fn scavenge_decision(text: &str) -> Option<RawDecision> {
    let action_type = scavenge_value(text, "action_type")?;
    let ability_name = scavenge_value(text, "ability_name").unwrap_or_default();
    let targets: Vec<CombatantId> = scavenge_targets(text);

    let mut object = serde_json::Map::new();
    object.insert("action_type".into(), action_type.clone().into());
    if !ability_name.is_empty() {
        object.insert("ability_name".into(), ability_name.into());
    }
    object.insert(
        "targets".into(),
        serde_json::Value::Array(targets.into_iter().map(|t| t.0.into()).collect()),
    );

    match serde_json::from_value::<RawDecision>(serde_json::Value::Object(object)) {
        Ok(decision) => {
            tracing::debug!(action_type, "scavenged oracle reply via key-value scan");
            Some(decision)
        }
        Err(_) => None,
    }
}

fn scavenge_value(text: &str, key: &str) -> Option<String> {
    let pos = text.find(key)?;
    let after = &text[pos + key.len()..];
    let after = after.trim_start_matches(|c: char| c == '"' || c.is_whitespace());
    let after = after
        .strip_prefix(':')
        .or_else(|| after.strip_prefix('='))?;
    let after = after.trim_start_matches(|c: char| c == '"' || c == '\'' || c.is_whitespace());
    let end = after.find(['"', '\'', ',', '\n', '}']).unwrap_or(after.len());
    let value = after[..end].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn scavenge_targets(text: &str) -> Vec<CombatantId> {
    let Some(pos) = text.find("\"targets\"").or_else(|| text.find("targets")) else {
        return Vec::new();
    };
    let rest = &text[pos..];
    let Some(open) = rest.find('[') else {
        return Vec::new();
    };
    let Some(close) = rest[open..].find(']') else {
        return Vec::new();
    };
    rest[open + 1..open + close]
        .split(',')
        .map(|part| part.trim().trim_matches('"').trim_matches('\''))
        .filter(|part| !part.is_empty())
        .map(CombatantId::from)
        .collect()
}

/// Rejects schema placeholders the oracle sometimes echoes back (`1dY+Z`).
fn is_sane_dice_expression(expression: &str) -> bool {
    let stripped = expression.replace(' ', "");
    !stripped.is_empty()
        && stripped
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, 'd' | '+' | '-'))
        && stripped.contains(|c: char| c.is_ascii_digit())
}
