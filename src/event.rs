//! Observer event schema.
//!
//! The variants and field names here are a stable contract; they serialize
//! with a `type` tag matching the documented wire names.

use crate::combatant::{CombatantId, Faction};
use crate::encounter::TurnRecord;
use crate::intent::{Intent, SourceTier};
use serde::{Deserialize, Serialize};

/// Who won the encounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Players,
    Monsters,
    Draw,
}

impl From<Faction> for Winner {
    fn from(f: Faction) -> Self {
        match f {
            Faction::Players => Winner::Players,
            Faction::Monsters => Winner::Monsters,
        }
    }
}

/// Events delivered to the observer, in turn order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RoundStart {
        round: u32,
    },
    TurnStart {
        round: u32,
        combatant_id: CombatantId,
    },
    Intent {
        combatant_id: CombatantId,
        intent: Intent,
        source_tier: SourceTier,
    },
    Dice {
        combatant_id: CombatantId,
        expression: String,
        result: i32,
        purpose: String,
    },
    Result {
        turn_record: TurnRecord,
    },
    Rollback {
        round: u32,
        combatant_id: CombatantId,
        reason: String,
    },
    TurnTimeout {
        combatant_id: CombatantId,
    },
    Lag {
        dropped_events: usize,
    },
    EncounterEnd {
        winner: Winner,
    },
    Fatal {
        message: String,
    },
}

impl EngineEvent {
    /// Terminal events end the stream; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineEvent::EncounterEnd { .. } | EngineEvent::Fatal { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EngineEvent::RoundStart { .. } => "round_start",
            EngineEvent::TurnStart { .. } => "turn_start",
            EngineEvent::Intent { .. } => "intent",
            EngineEvent::Dice { .. } => "dice",
            EngineEvent::Result { .. } => "result",
            EngineEvent::Rollback { .. } => "rollback",
            EngineEvent::TurnTimeout { .. } => "turn_timeout",
            EngineEvent::Lag { .. } => "lag",
            EngineEvent::EncounterEnd { .. } => "encounter_end",
            EngineEvent::Fatal { .. } => "fatal",
        }
    }
}
