//! Error types for the resolution engine.
//!
//! Uses thiserror for ergonomic error definition. The taxonomy follows the
//! recovery policy: oracle failures are consumed by the fallback ladder,
//! rules and corruption errors trigger rollback, and only fatal errors
//! escape to the observer.

use crate::combatant::CombatantId;

/// Failure of the injected oracle callback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OracleError {
    /// Network or provider failure reported by the callback.
    #[error("oracle transport failed: {0}")]
    Transport(String),

    /// The call observed its cancel token and bailed out.
    #[error("oracle call cancelled")]
    Cancelled,

    /// The call exceeded its deadline.
    #[error("oracle call timed out after {0} ms")]
    Timeout(u64),
}

/// Why a turn could not get a usable intent from a given tier.
///
/// The fallback ladder dispatches on this by value; parse and validation
/// problems are never raised as panics or carried through catch-style
/// control flow.
#[derive(Debug, Clone)]
pub enum IntentFailure {
    /// The oracle callback itself failed (network, cancellation, timeout).
    Transport(OracleError),
    /// The oracle replied but the reply was unparseable after repair.
    Parse(String),
    /// The reply parsed but violated intent validation.
    Invalid(String),
}

impl IntentFailure {
    /// Short label used in retry prompts and diagnostics.
    pub fn describe(&self) -> String {
        match self {
            IntentFailure::Transport(e) => format!("transport error: {e}"),
            IntentFailure::Parse(msg) => format!("unparseable output: {msg}"),
            IntentFailure::Invalid(msg) => format!("invalid intent: {msg}"),
        }
    }
}

/// Mechanical execution errors raised by the rules engine.
///
/// Any of these aborts the turn and rolls the transaction back.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RulesError {
    #[error("unknown combatant: {0}")]
    UnknownCombatant(CombatantId),

    #[error("illegal target {target}: {reason}")]
    IllegalTarget { target: CombatantId, reason: String },

    #[error("{actor} has no ability named '{ability}'")]
    UnknownAbility { actor: CombatantId, ability: String },

    #[error("action economy violation for {actor}: {slot} already spent")]
    EconomyViolation { actor: CombatantId, slot: String },

    #[error("{actor} has insufficient movement: needs {needed} ft, has {remaining} ft")]
    InsufficientMovement {
        actor: CombatantId,
        needed: i32,
        remaining: i32,
    },

    #[error("ability '{ability}' has not recharged")]
    NotRecharged { ability: String },

    #[error("'{ability}' cannot be used as an action")]
    NotActionable { ability: String },

    #[error("legendary pool exhausted for {actor}")]
    LegendaryExhausted { actor: CombatantId },
}

/// Post-turn state validation failures.
///
/// Detected by the transaction manager after execution; always rolled back.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    #[error("{id}: hp {hp} outside [0, {max_hp}]")]
    HpOutOfBounds { id: CombatantId, hp: i32, max_hp: i32 },

    #[error("{id}: status {status} inconsistent with hp {hp}")]
    StatusMismatch { id: CombatantId, status: String, hp: i32 },

    #[error("{id}: condition '{condition}' has negative duration")]
    NegativeDuration { id: CombatantId, condition: String },

    #[error("{id}: movement_remaining is negative ({remaining})")]
    NegativeMovement { id: CombatantId, remaining: i32 },

    #[error("{id}: ability '{ability}' carries a foreign tag '{tag}'")]
    ForeignAbility {
        id: CombatantId,
        ability: String,
        tag: String,
    },
}

/// Lifecycle errors from the pipeline controller's public contract.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("a resolution is already running")]
    AlreadyRunning,

    #[error("no resolution is running")]
    NotRunning,

    #[error("cannot resolve: the {0} side has no live combatant")]
    EmptySide(&'static str),
}

/// Top-level engine error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("rules error: {0}")]
    Rules(#[from] RulesError),

    #[error("state corruption: {0}")]
    Corruption(#[from] StateError),

    /// The default tier itself failed, or snapshot restore failed.
    /// Surfaced as a `fatal` event; the engine stops.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Produced when `stop` is observed at a suspension point. Consumed by
    /// the worker exit path, never delivered to the observer.
    #[error("resolution cancelled")]
    Cancelled,
}

pub type RulesResult<T> = std::result::Result<T, RulesError>;
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RulesError::EconomyViolation {
            actor: CombatantId::from("kobold-1"),
            slot: "action".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "action economy violation for kobold-1: action already spent"
        );
    }

    #[test]
    fn test_error_conversion() {
        let state_err = StateError::NegativeMovement {
            id: CombatantId::from("c1"),
            remaining: -5,
        };
        let err: EngineError = state_err.into();
        assert!(matches!(err, EngineError::Corruption(_)));
    }

    #[test]
    fn test_intent_failure_describe() {
        let f = IntentFailure::Parse("unbalanced braces".to_string());
        assert!(f.describe().contains("unparseable"));
    }
}
