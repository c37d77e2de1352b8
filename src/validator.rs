//! Canonical ability ownership.
//!
//! Oracles given several creatures in context leak abilities across them
//! ("the skeleton breathes fire"). Every ability string a combatant
//! carries is tagged `[<name>_<id>_ability]`; this module builds the
//! canonical set per combatant at encounter load and filters both prompts
//! and intents against it.

use crate::combatant::{Combatant, CombatantId};
use crate::intent::Intent;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// Matches the canonical ownership tag: `[<name>_<id>_ability]`.
static ABILITY_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([A-Za-z0-9 \-]+)_([A-Za-z0-9\-]+)_ability\]").expect("tag regex"));

/// Actions every combatant can always take, tag or no tag.
static BASIC_ACTIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "dash",
        "dodge",
        "disengage",
        "help",
        "hide",
        "ready",
        "unarmed strike",
    ]
    .into_iter()
    .collect()
});

pub fn is_basic_action(name: &str) -> bool {
    BASIC_ACTIONS.contains(name.to_lowercase().as_str())
}

/// Per-combatant canonical ability sets, cached for the encounter.
#[derive(Debug, Default)]
pub struct AbilityValidator {
    canonical: HashMap<CombatantId, HashSet<String>>,
}

impl AbilityValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the validator from the full roster at encounter load.
    pub fn from_roster(combatants: &[Combatant]) -> Self {
        let mut validator = Self::new();
        for combatant in combatants {
            validator.register(combatant);
        }
        validator
    }

    pub fn register(&mut self, combatant: &Combatant) {
        let set = combatant
            .abilities
            .iter()
            .map(|a| a.name.to_lowercase())
            .collect();
        self.canonical.insert(combatant.id.clone(), set);
    }

    pub fn canonical_set(&self, id: &CombatantId) -> Option<&HashSet<String>> {
        self.canonical.get(id)
    }

    /// Does this ability belong to the combatant (or is it a universal
    /// basic action)?
    pub fn owns(&self, id: &CombatantId, ability: &str) -> bool {
        if is_basic_action(ability) {
            return true;
        }
        self.canonical
            .get(id)
            .map(|set| set.contains(ability.to_lowercase().as_str()))
            .unwrap_or(false)
    }

    /// Rewrite a prompt so every ability line carries the actor's tag, and
    /// strip lines whose tag names another combatant. Untagged bullets are
    /// only treated as abilities inside the ability sections; roster and
    /// history bullets pass through untouched.
    pub fn clean_prompt(&self, prompt: &str, actor: &Combatant) -> String {
        let actor_tag = crate::combatant::ability_tag(&actor.name, &actor.id);
        let mut kept = Vec::new();
        let mut stripped = 0usize;
        let mut in_ability_section = false;

        for line in prompt.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("## Actions:") || trimmed.starts_with("## Traits:") {
                in_ability_section = true;
                kept.push(line.to_string());
                continue;
            }
            if trimmed.starts_with('#') {
                in_ability_section = false;
                kept.push(line.to_string());
                continue;
            }

            if let Some(caps) = ABILITY_TAG.captures(line) {
                let tag_id = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                if tag_id != actor.id.as_str() {
                    stripped += 1;
                    continue;
                }
                kept.push(line.to_string());
            } else if in_ability_section && is_untagged_ability_line(line) {
                // Untagged ability bullet: claim it for the actor only if
                // the name is actually canonical, otherwise drop it.
                let name = ability_line_name(line).unwrap_or_default();
                if self.owns(&actor.id, &name) {
                    kept.push(format!("{line} {actor_tag}"));
                } else {
                    stripped += 1;
                }
            } else {
                kept.push(line.to_string());
            }
        }

        if stripped > 0 {
            tracing::debug!(
                actor = %actor.id,
                stripped,
                "removed foreign ability lines from prompt"
            );
        }
        kept.join("\n")
    }

    /// Reject intents naming an ability outside the actor's canonical set.
    pub fn validate_intent(&self, intent: &Intent, actor: &Combatant) -> Result<(), String> {
        let Some(name) = intent.ability_name() else {
            return Ok(());
        };
        if self.owns(&actor.id, name) {
            Ok(())
        } else {
            Err(format!(
                "'{}' is not among {}'s abilities",
                name, actor.name
            ))
        }
    }
}

/// An ability bullet in the prompt looks like `- Name: description`.
fn is_untagged_ability_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("- ") && trimmed.contains(':')
}

fn ability_line_name(line: &str) -> Option<String> {
    let trimmed = line.trim_start().strip_prefix("- ")?;
    let (name, _) = trimmed.split_once(':')?;
    Some(name.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combatant::{AbilityKind, DamageType, Side};

    fn monster(id: &str, name: &str, ability: &str) -> Combatant {
        Combatant::new(id, name, Side::Monster).add_ability(
            ability,
            AbilityKind::Attack {
                bonus: 4,
                damage: "1d6+2".into(),
                damage_type: DamageType::Fire,
                ranged: false,
                reach_ft: 5,
            },
        )
    }

    #[test]
    fn test_canonical_ownership() {
        let a = monster("m1", "Drake", "Fire Breath");
        let b = monster("m2", "Skeleton", "Bone Shards");
        let validator = AbilityValidator::from_roster(&[a.clone(), b]);

        assert!(validator.owns(&a.id, "Fire Breath"));
        assert!(validator.owns(&a.id, "fire breath"));
        assert!(!validator.owns(&a.id, "Bone Shards"));
        assert!(validator.owns(&a.id, "dodge"));
    }

    #[test]
    fn test_validate_intent_rejects_foreign_ability() {
        let a = monster("m1", "Drake", "Fire Breath");
        let b = monster("m2", "Skeleton", "Bone Shards");
        let validator = AbilityValidator::from_roster(&[a.clone(), b]);

        let foreign = Intent::Attack {
            ability_name: "Bone Shards".into(),
            targets: vec![],
            movement_cost: None,
        };
        assert!(validator.validate_intent(&foreign, &a).is_err());

        let owned = Intent::Attack {
            ability_name: "Fire Breath".into(),
            targets: vec![],
            movement_cost: None,
        };
        assert!(validator.validate_intent(&owned, &a).is_ok());
    }

    #[test]
    fn test_clean_prompt_strips_foreign_tags() {
        let a = monster("m1", "Drake", "Fire Breath");
        let b = monster("m2", "Skeleton", "Bone Shards");
        let validator = AbilityValidator::from_roster(&[a.clone(), b]);

        let prompt = "\
## Actions:
- Fire Breath: exhale flame. [drake_m1_ability]
- Bone Shards: hurl splinters. [skeleton_m2_ability]
Other text.";
        let cleaned = validator.clean_prompt(prompt, &a);
        assert!(cleaned.contains("Fire Breath"));
        assert!(!cleaned.contains("Bone Shards"));
        assert!(cleaned.contains("Other text."));
    }

    #[test]
    fn test_clean_prompt_tags_untagged_canonical_lines() {
        let a = monster("m1", "Drake", "Fire Breath");
        let validator = AbilityValidator::from_roster(std::slice::from_ref(&a));

        let prompt = "## Actions:\n- Fire Breath: exhale flame.";
        let cleaned = validator.clean_prompt(prompt, &a);
        assert!(cleaned.contains("[drake_m1_ability]"));

        let foreign = "## Actions:\n- Ice Storm: conjured hail.";
        let cleaned = validator.clean_prompt(foreign, &a);
        assert!(!cleaned.contains("Ice Storm"));
    }

    #[test]
    fn test_clean_prompt_leaves_roster_bullets_alone() {
        let a = monster("m1", "Drake", "Fire Breath");
        let validator = AbilityValidator::from_roster(std::slice::from_ref(&a));

        let prompt = "\
## Actions:
- Fire Breath: exhale flame. [drake_m1_ability]

# NEARBY ENEMIES
- Hero (id: pc-1): healthy HP, AC 16, 30 ft away";
        let cleaned = validator.clean_prompt(prompt, &a);
        assert!(cleaned.contains("Hero (id: pc-1)"));
    }
}
