//! Automated turn resolution engine for tabletop combat encounters.
//!
//! This crate provides:
//! - A cancellable, pauseable turn pipeline driven by an injected LLM oracle
//! - Resilient oracle handling with a retry / heuristic / default ladder
//! - A deterministic D&D-style rules engine (attacks, saves, conditions,
//!   action economy, opportunity attacks, death saves, concentration)
//! - Transactional state updates: snapshot, execute, validate, commit or
//!   roll back
//! - Canonical ability ownership so one creature's abilities never bleed
//!   into another's turn
//!
//! # Quick Start
//!
//! ```ignore
//! use encounter_core::{EncounterState, Environment, Mode, Resolver};
//!
//! let resolver = Resolver::default();
//! let mut handle = resolver.start(
//!     EncounterState::new(combatants, Environment::default()),
//!     roll,                       // Fn(&str) -> i32
//!     complete,                   // Fn(&str, &CancelToken) -> Result<String, OracleError>
//!     |event| println!("{event:?}"),
//!     Mode::Continuous,
//! )?;
//! handle.wait(std::time::Duration::from_secs(300));
//! ```

pub mod combatant;
pub mod config;
pub mod dispatcher;
pub mod encounter;
pub mod error;
pub mod event;
pub mod fallback;
pub mod intent;
pub mod oracle;
pub mod pipeline;
pub mod rules;
pub mod summary;
pub mod testing;
pub mod transaction;
pub mod validator;

// Primary public API
pub use combatant::{
    Ability, AbilityKind, AbilityScores, ActionEconomy, ActiveCondition, Combatant, CombatantId,
    ConcentrationLink, Condition, ConditionDuration, Cover, DamageType, Faction, Position,
    ReactionEffect, RechargeRange, Side, Status, TaggedAbility,
};
pub use config::ResolutionConfig;
pub use encounter::{replay, EncounterState, Environment, LogEntry, TurnRecord};
pub use error::{EngineError, IntentFailure, OracleError, PipelineError, RulesError, StateError};
pub use event::{EngineEvent, Winner};
pub use intent::{Decision, Intent, SourceTier};
pub use oracle::{CancelToken, OracleGateway};
pub use pipeline::{Mode, PipelineStatus, ResolutionHandle, Resolver};
pub use rules::RulesEngine;
pub use summary::ContextSummariser;
pub use validator::AbilityValidator;
