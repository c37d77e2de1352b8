//! Structured tactical intents.
//!
//! The oracle is asked for a JSON object tagged by `action_type`; each
//! variant carries exactly the fields that action needs. The engine also
//! produces intents of its own (death saves, fallback dodges) through the
//! same type so every turn resolves the same way.

use crate::combatant::CombatantId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a combatant wants to do with its turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum Intent {
    Attack {
        ability_name: String,
        targets: Vec<CombatantId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        movement_cost: Option<i32>,
    },
    Spell {
        ability_name: String,
        targets: Vec<CombatantId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        spell_slot_level: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        movement_cost: Option<i32>,
    },
    Cantrip {
        ability_name: String,
        targets: Vec<CombatantId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        movement_cost: Option<i32>,
    },
    Dash {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        movement_cost: Option<i32>,
    },
    Dodge,
    Disengage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        movement_cost: Option<i32>,
    },
    Help {
        targets: Vec<CombatantId>,
    },
    Hide,
    Ready {
        ability_name: String,
    },
    UseItem {
        ability_name: String,
        targets: Vec<CombatantId>,
    },
    RechargeAbility {
        ability_name: String,
    },
    Legendary {
        ability_name: String,
        targets: Vec<CombatantId>,
    },
    /// Engine-originated: rolled at the start of an unconscious player's
    /// turn. Never offered to or accepted from the oracle.
    DeathSave,
}

impl Intent {
    /// The named ability this intent invokes, if any.
    pub fn ability_name(&self) -> Option<&str> {
        match self {
            Intent::Attack { ability_name, .. }
            | Intent::Spell { ability_name, .. }
            | Intent::Cantrip { ability_name, .. }
            | Intent::Ready { ability_name }
            | Intent::UseItem { ability_name, .. }
            | Intent::RechargeAbility { ability_name }
            | Intent::Legendary { ability_name, .. } => Some(ability_name),
            _ => None,
        }
    }

    pub fn targets(&self) -> &[CombatantId] {
        match self {
            Intent::Attack { targets, .. }
            | Intent::Spell { targets, .. }
            | Intent::Cantrip { targets, .. }
            | Intent::Help { targets }
            | Intent::UseItem { targets, .. }
            | Intent::Legendary { targets, .. } => targets,
            _ => &[],
        }
    }

    pub fn movement_cost(&self) -> Option<i32> {
        match self {
            Intent::Attack { movement_cost, .. }
            | Intent::Spell { movement_cost, .. }
            | Intent::Cantrip { movement_cost, .. }
            | Intent::Dash { movement_cost }
            | Intent::Disengage { movement_cost } => *movement_cost,
            _ => None,
        }
    }

    /// Consumes the main action slot.
    pub fn spends_action(&self) -> bool {
        !matches!(
            self,
            Intent::RechargeAbility { .. } | Intent::Legendary { .. } | Intent::DeathSave
        )
    }

    pub fn action_type(&self) -> &'static str {
        match self {
            Intent::Attack { .. } => "attack",
            Intent::Spell { .. } => "spell",
            Intent::Cantrip { .. } => "cantrip",
            Intent::Dash { .. } => "dash",
            Intent::Dodge => "dodge",
            Intent::Disengage { .. } => "disengage",
            Intent::Help { .. } => "help",
            Intent::Hide => "hide",
            Intent::Ready { .. } => "ready",
            Intent::UseItem { .. } => "use_item",
            Intent::RechargeAbility { .. } => "recharge_ability",
            Intent::Legendary { .. } => "legendary",
            Intent::DeathSave => "death_save",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ability_name() {
            Some(name) => write!(f, "{} ({})", self.action_type(), name),
            None => write!(f, "{}", self.action_type()),
        }
    }
}

/// Which rung of the fallback ladder produced a turn's intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    Oracle,
    OracleRetry,
    Heuristic,
    Default,
}

impl SourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTier::Oracle => "oracle",
            SourceTier::OracleRetry => "oracle_retry",
            SourceTier::Heuristic => "heuristic",
            SourceTier::Default => "default",
        }
    }

    /// The next rung down, if any. The default tier has nowhere to go.
    pub fn next_down(&self) -> Option<SourceTier> {
        match self {
            SourceTier::Oracle => Some(SourceTier::OracleRetry),
            SourceTier::OracleRetry => Some(SourceTier::Heuristic),
            SourceTier::Heuristic => Some(SourceTier::Default),
            SourceTier::Default => None,
        }
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validated decision handed to the rules engine: the intent plus the
/// narrative and reaction flag the oracle supplied alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub intent: Intent,
    #[serde(default)]
    pub narrative: String,
    #[serde(default)]
    pub uses_reaction: bool,
}

impl Decision {
    pub fn from_intent(intent: Intent) -> Self {
        Self {
            intent,
            narrative: String::new(),
            uses_reaction: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_deserialization() {
        let json = r#"{
            "action_type": "attack",
            "ability_name": "Shortsword",
            "targets": ["commoner-1"],
            "movement_cost": 10
        }"#;
        let intent: Intent = serde_json::from_str(json).unwrap();
        match &intent {
            Intent::Attack {
                ability_name,
                targets,
                movement_cost,
            } => {
                assert_eq!(ability_name, "Shortsword");
                assert_eq!(targets, &[CombatantId::from("commoner-1")]);
                assert_eq!(*movement_cost, Some(10));
            }
            other => panic!("expected attack intent, got {other:?}"),
        }
    }

    #[test]
    fn test_unit_variant_roundtrip() {
        let json = serde_json::to_string(&Intent::Dodge).unwrap();
        assert!(json.contains(r#""action_type":"dodge""#));
        let back: Intent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Intent::Dodge);
    }

    #[test]
    fn test_tier_ladder() {
        assert_eq!(SourceTier::Oracle.next_down(), Some(SourceTier::OracleRetry));
        assert_eq!(SourceTier::Heuristic.next_down(), Some(SourceTier::Default));
        assert_eq!(SourceTier::Default.next_down(), None);
        assert_eq!(SourceTier::OracleRetry.as_str(), "oracle_retry");
    }

    #[test]
    fn test_spends_action() {
        assert!(Intent::Dodge.spends_action());
        assert!(!Intent::DeathSave.spends_action());
        assert!(!Intent::Legendary {
            ability_name: "Tail Attack".into(),
            targets: vec![]
        }
        .spends_action());
    }
}
