//! Turn pipeline controller.
//!
//! One worker thread per resolution, observed from the caller's thread.
//! Three flags behind a single mutex (`running`, `paused`,
//! `stop_requested`) and a pause condvar are the only synchronisation
//! primitives; cancellation is a cooperative token checked at every
//! suspension point and passed into the oracle callback. Events flow
//! through a bounded drop-oldest queue so a slow observer can never block
//! the worker.

use crate::combatant::{CombatantId, Side, Status};
use crate::config::ResolutionConfig;
use crate::dispatcher::{run_legendary_phase, ReactionDispatcher};
use crate::encounter::{DiceRoll, EncounterState, LogEntry, MechanicalResults, TurnRecord};
use crate::error::{EngineError, IntentFailure, OracleError, PipelineError};
use crate::event::{EngineEvent, Winner};
use crate::fallback;
use crate::intent::{Decision, SourceTier};
use crate::oracle::{CancelToken, OracleGateway};
use crate::rules::{RulesEngine, TurnRolls};
use crate::transaction::TransactionManager;
use crate::validator::AbilityValidator;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Resolution mode: run to the end, or auto-pause after every turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Continuous,
    Step,
}

/// Snapshot of the controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStatus {
    pub running: bool,
    pub paused: bool,
    pub stop_requested: bool,
    pub round: u32,
    pub turn: usize,
}

#[derive(Debug, Default)]
struct Flags {
    running: bool,
    paused: bool,
    stop_requested: bool,
}

#[derive(Debug, Default)]
struct EventQueue {
    events: VecDeque<EngineEvent>,
    /// Drops since the last lag report.
    pending_lag: usize,
}

struct Shared {
    flags: Mutex<Flags>,
    pause_cv: Condvar,
    queue: Mutex<EventQueue>,
    progress: Mutex<(u32, usize)>,
    cancel: CancelToken,
    capacity: usize,
    drop_oldest: bool,
}

impl Shared {
    fn push_event(&self, event: EngineEvent) {
        let mut queue = self.queue.lock().expect("event queue poisoned");
        if queue.events.len() >= self.capacity {
            if self.drop_oldest {
                queue.events.pop_front();
                queue.pending_lag += 1;
            } else {
                // Bounded without drop: the newest event is the casualty.
                queue.pending_lag += 1;
                return;
            }
        }
        queue.events.push_back(event);
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Entry point owning the one-resolution-at-a-time contract.
pub struct Resolver {
    config: ResolutionConfig,
    active: Arc<AtomicBool>,
}

impl Resolver {
    pub fn new(config: ResolutionConfig) -> Self {
        Self {
            config,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start resolving. Fails if a resolution from this resolver is still
    /// running, or if either side has no live combatant.
    pub fn start<R, O, Obs>(
        &self,
        encounter: EncounterState,
        roll_fn: R,
        oracle_fn: O,
        observer: Obs,
        mode: Mode,
    ) -> Result<ResolutionHandle, PipelineError>
    where
        R: FnMut(&str) -> i32 + Send + 'static,
        O: FnMut(&str, &CancelToken) -> Result<String, OracleError> + Send + 'static,
        Obs: FnMut(EngineEvent) + Send + 'static,
    {
        let players_up = encounter
            .combatants
            .iter()
            .any(|c| c.side != Side::Monster && !c.status.is_down());
        let monsters_up = encounter
            .combatants
            .iter()
            .any(|c| c.side == Side::Monster && !c.status.is_down());
        if !players_up {
            return Err(PipelineError::EmptySide("player"));
        }
        if !monsters_up {
            return Err(PipelineError::EmptySide("monster"));
        }

        if self.active.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyRunning);
        }

        let shared = Arc::new(Shared {
            flags: Mutex::new(Flags {
                running: true,
                ..Flags::default()
            }),
            pause_cv: Condvar::new(),
            queue: Mutex::new(EventQueue::default()),
            progress: Mutex::new((encounter.round, encounter.turn)),
            cancel: CancelToken::new(),
            capacity: self.config.event_queue_capacity,
            drop_oldest: self.config.drop_oldest_on_observer_lag,
        });

        let worker_shared = Arc::clone(&shared);
        let worker_active = Arc::clone(&self.active);
        let config = self.config.clone();
        let worker = std::thread::Builder::new()
            .name("encounter-resolution".to_string())
            .spawn(move || {
                let mut roll_fn = roll_fn;
                let mut oracle_fn = oracle_fn;
                Worker {
                    shared: worker_shared.clone(),
                    config,
                    mode,
                }
                .run(encounter, &mut roll_fn, &mut oracle_fn);

                let mut flags = worker_shared.flags.lock().expect("flag mutex poisoned");
                flags.running = false;
                flags.paused = false;
                worker_shared.pause_cv.notify_all();
                drop(flags);
                worker_active.store(false, Ordering::SeqCst);
            })
            .expect("failed to spawn resolution worker");

        Ok(ResolutionHandle {
            shared,
            worker: Some(worker),
            observer: Box::new(observer),
            grace: Duration::from_millis(self.config.stop_grace_ms),
        })
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(ResolutionConfig::default())
    }
}

/// Handle to a running resolution.
pub struct ResolutionHandle {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    observer: Box<dyn FnMut(EngineEvent) + Send>,
    grace: Duration,
}

impl ResolutionHandle {
    /// Pause before the next turn. No-op while already paused.
    pub fn pause(&self) -> Result<(), PipelineError> {
        let mut flags = self.shared.flags.lock().expect("flag mutex poisoned");
        if !flags.running {
            return Err(PipelineError::NotRunning);
        }
        flags.paused = true;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), PipelineError> {
        let mut flags = self.shared.flags.lock().expect("flag mutex poisoned");
        if !flags.running {
            return Err(PipelineError::NotRunning);
        }
        flags.paused = false;
        self.shared.pause_cv.notify_all();
        Ok(())
    }

    /// Request a stop and block until the worker exits, bounded by the
    /// safety grace period. Idempotent.
    pub fn stop(&mut self) {
        {
            let mut flags = self.shared.flags.lock().expect("flag mutex poisoned");
            flags.stop_requested = true;
            flags.paused = false;
            self.shared.cancel.cancel();
            self.shared.pause_cv.notify_all();
        }

        let deadline = Instant::now() + self.grace;
        let mut flags = self.shared.flags.lock().expect("flag mutex poisoned");
        while flags.running {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("worker did not exit within the stop grace period");
                break;
            }
            let (guard, _timeout) = self
                .shared
                .pause_cv
                .wait_timeout(flags, remaining)
                .expect("flag mutex poisoned");
            flags = guard;
        }
        let exited = !flags.running;
        drop(flags);

        if exited {
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }

    pub fn status(&self) -> PipelineStatus {
        let flags = self.shared.flags.lock().expect("flag mutex poisoned");
        let (round, turn) = *self.shared.progress.lock().expect("progress poisoned");
        PipelineStatus {
            running: flags.running,
            paused: flags.paused,
            stop_requested: flags.stop_requested,
            round,
            turn,
        }
    }

    /// Deliver pending events to the observer on the caller's thread.
    /// Returns the number delivered.
    pub fn pump_events(&mut self) -> usize {
        let (lag, drained): (usize, Vec<EngineEvent>) = {
            let mut queue = self.shared.queue.lock().expect("event queue poisoned");
            let lag = std::mem::take(&mut queue.pending_lag);
            (lag, queue.events.drain(..).collect())
        };
        let mut delivered = 0;
        if lag > 0 {
            (self.observer)(EngineEvent::Lag {
                dropped_events: lag,
            });
            delivered += 1;
        }
        for event in drained {
            (self.observer)(event);
            delivered += 1;
        }
        delivered
    }

    /// Pump events until the worker exits or the timeout elapses.
    /// Returns true when the resolution finished.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump_events();
            let running = self.shared.flags.lock().expect("flag mutex poisoned").running;
            if !running {
                self.pump_events();
                if let Some(worker) = self.worker.take() {
                    let _ = worker.join();
                }
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    shared: Arc<Shared>,
    config: ResolutionConfig,
    mode: Mode,
}

impl Worker {
    fn run(
        &self,
        mut state: EncounterState,
        roll_fn: &mut (dyn FnMut(&str) -> i32 + Send),
        oracle_fn: &mut (dyn FnMut(&str, &CancelToken) -> Result<String, OracleError> + Send),
    ) {
        let engine = RulesEngine::new(self.config.clone());
        let gateway = OracleGateway::new(&self.config);
        let validator = AbilityValidator::from_roster(&state.combatants);
        let transactions = TransactionManager::new();
        let dispatcher = ReactionDispatcher::new();

        let outcome = self.run_rounds(
            &mut state,
            &engine,
            &gateway,
            &validator,
            &transactions,
            &dispatcher,
            roll_fn,
            oracle_fn,
        );

        match outcome {
            Ok(winner) => {
                tracing::info!(winner = ?winner, rounds = state.round, "encounter resolved");
                self.shared.push_event(EngineEvent::EncounterEnd { winner });
            }
            Err(EngineError::Cancelled) => {
                // Consumed by the worker exit path; the observer sees no
                // event for the uncommitted in-flight turn.
                tracing::info!("resolution cancelled");
            }
            Err(error) => {
                tracing::error!(%error, "resolution failed");
                self.shared.push_event(EngineEvent::Fatal {
                    message: error.to_string(),
                });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_rounds(
        &self,
        state: &mut EncounterState,
        engine: &RulesEngine,
        gateway: &OracleGateway,
        validator: &AbilityValidator,
        transactions: &TransactionManager,
        dispatcher: &ReactionDispatcher,
        roll_fn: &mut (dyn FnMut(&str) -> i32 + Send),
        oracle_fn: &mut (dyn FnMut(&str, &CancelToken) -> Result<String, OracleError> + Send),
    ) -> Result<Winner, EngineError> {
        while state.round <= self.config.max_rounds {
            self.suspension_point()?;
            engine.start_of_round(state);
            self.shared.push_event(EngineEvent::RoundStart {
                round: state.round,
            });
            tracing::debug!(round = state.round, "round start");

            let order = state.order.clone();
            for (idx, actor_id) in order.iter().enumerate() {
                state.turn = idx;
                *self.shared.progress.lock().expect("progress poisoned") = (state.round, idx);
                self.suspension_point()?;

                if let Some(winner) = state.winner() {
                    return Ok(winner.into());
                }

                let actor = match state.combatant(actor_id) {
                    Some(actor) => actor.clone(),
                    None => continue,
                };
                if actor.status == Status::Dead || actor.status == Status::Stable {
                    continue;
                }

                if actor.status == Status::Unconscious {
                    // Unconscious monsters are dead by construction; only
                    // players and NPCs roll death saves.
                    if actor.side == Side::Monster {
                        continue;
                    }
                    self.death_save_turn(state, engine, validator, transactions, roll_fn, actor_id)?;
                } else {
                    self.full_turn(
                        state, engine, gateway, validator, transactions, dispatcher, roll_fn,
                        oracle_fn, actor_id, &actor,
                    )?;
                }

                run_legendary_phase(
                    engine,
                    gateway,
                    validator,
                    transactions,
                    state,
                    actor_id,
                    oracle_fn,
                    roll_fn,
                    &self.shared.cancel,
                    Duration::from_millis(self.config.oracle_deadline_ms),
                    &mut |event| self.shared.push_event(event),
                )?;

                if let Some(winner) = state.winner() {
                    return Ok(winner.into());
                }

                if self.mode == Mode::Step {
                    let mut flags = self.shared.flags.lock().expect("flag mutex poisoned");
                    if !flags.stop_requested {
                        flags.paused = true;
                    }
                }
            }

            state.round += 1;
            state.turn = 0;
        }

        tracing::warn!(max_rounds = self.config.max_rounds, "round cap reached; declaring a draw");
        Ok(Winner::Draw)
    }

    /// Death-save turn: engine-originated intent, one d20, committed like
    /// any other turn.
    fn death_save_turn(
        &self,
        state: &mut EncounterState,
        engine: &RulesEngine,
        validator: &AbilityValidator,
        transactions: &TransactionManager,
        roll_fn: &mut (dyn FnMut(&str) -> i32 + Send),
        actor_id: &CombatantId,
    ) -> Result<(), EngineError> {
        self.shared.push_event(EngineEvent::TurnStart {
            round: state.round,
            combatant_id: actor_id.clone(),
        });
        let snapshot = transactions.begin(state);
        self.shared.push_event(EngineEvent::Intent {
            combatant_id: actor_id.clone(),
            intent: crate::intent::Intent::DeathSave,
            source_tier: SourceTier::Default,
        });

        let mut emit = |event: EngineEvent| self.shared.push_event(event);
        let mut rolls = TurnRolls::new(roll_fn, &mut emit, actor_id.clone());
        let results = engine.death_save_turn(state, actor_id, &mut rolls)?;
        let rolls = rolls.rolls;

        if let Err(corruption) = transactions.validate(state, validator) {
            transactions.rollback(
                state,
                snapshot,
                actor_id,
                &corruption.to_string(),
                SourceTier::Default,
            );
            self.shared.push_event(EngineEvent::Rollback {
                round: state.round,
                combatant_id: actor_id.clone(),
                reason: corruption.to_string(),
            });
            return Err(EngineError::Fatal(format!(
                "death save turn corrupted state: {corruption}"
            )));
        }

        let record = TurnRecord {
            round: state.round,
            combatant_id: actor_id.clone(),
            intent: crate::intent::Intent::DeathSave,
            rolls,
            results,
            narrative: String::new(),
            source_tier: SourceTier::Default,
        };
        state.log.push(LogEntry::Turn(record.clone()));
        self.shared.push_event(EngineEvent::Result {
            turn_record: record,
        });
        Ok(())
    }

    /// A normal turn: start-of-turn bookkeeping, the intent ladder, then
    /// transactional execution with tier descent on rollback.
    #[allow(clippy::too_many_arguments)]
    fn full_turn(
        &self,
        state: &mut EncounterState,
        engine: &RulesEngine,
        gateway: &OracleGateway,
        validator: &AbilityValidator,
        transactions: &TransactionManager,
        dispatcher: &ReactionDispatcher,
        roll_fn: &mut (dyn FnMut(&str) -> i32 + Send),
        oracle_fn: &mut (dyn FnMut(&str, &CancelToken) -> Result<String, OracleError> + Send),
        actor_id: &CombatantId,
        actor: &crate::combatant::Combatant,
    ) -> Result<(), EngineError> {
        let turn_deadline = Instant::now() + Duration::from_millis(self.config.turn_deadline_ms);

        self.shared.push_event(EngineEvent::TurnStart {
            round: state.round,
            combatant_id: actor_id.clone(),
        });
        tracing::debug!(actor = %actor_id, round = state.round, "turn start");

        // Start-of-turn bookkeeping. Recharge dice are recorded for the
        // turn record but kept out of the event stream, which stays
        // `turn_start, intent, dice*, (result | rollback)`.
        let pre_rolls_vec: Vec<DiceRoll> = {
            let mut silent = |_event: EngineEvent| {};
            let mut pre_rolls = TurnRolls::new(roll_fn, &mut silent, actor_id.clone());
            engine.start_of_turn(state, actor_id, &mut pre_rolls)?;
            pre_rolls.rolls
        };

        // Incapacitated combatants lose the turn: conditions still tick.
        let incapacitated = state
            .combatant(actor_id)
            .map(|c| c.is_incapacitated())
            .unwrap_or(false);
        if incapacitated {
            let snapshot = transactions.begin(state);
            let decision = fallback::default_decision(actor);
            self.shared.push_event(EngineEvent::Intent {
                combatant_id: actor_id.clone(),
                intent: decision.intent.clone(),
                source_tier: SourceTier::Default,
            });
            let mut results = MechanicalResults::default();
            engine.end_of_turn(state, actor_id, &mut results);
            if let Err(corruption) = transactions.validate(state, validator) {
                transactions.rollback(
                    state,
                    snapshot,
                    actor_id,
                    &corruption.to_string(),
                    SourceTier::Default,
                );
                return Err(EngineError::Fatal(format!(
                    "incapacitated turn corrupted state: {corruption}"
                )));
            }
            let record = TurnRecord {
                round: state.round,
                combatant_id: actor_id.clone(),
                intent: decision.intent,
                rolls: pre_rolls_vec,
                results,
                narrative: format!("{} is unable to act.", actor.name),
                source_tier: SourceTier::Default,
            };
            state.log.push(LogEntry::Turn(record.clone()));
            self.shared.push_event(EngineEvent::Result {
                turn_record: record,
            });
            return Ok(());
        }

        // Intent ladder.
        let mut retries_left = self.config.retry_budget;
        let (mut decision, mut tier) = self.choose_intent(
            state,
            gateway,
            validator,
            oracle_fn,
            actor_id,
            turn_deadline,
            &mut retries_left,
        )?;

        // Execute, descending a tier on each rollback. The default tier
        // must not roll back; if it does the engine is done.
        loop {
            self.suspension_point()?;
            let actor_fresh = state
                .combatant(actor_id)
                .cloned()
                .ok_or_else(|| EngineError::Fatal(format!("actor {actor_id} vanished")))?;

            let snapshot = transactions.begin(state);
            self.shared.push_event(EngineEvent::Intent {
                combatant_id: actor_id.clone(),
                intent: decision.intent.clone(),
                source_tier: tier,
            });

            let mut emit = |event: EngineEvent| self.shared.push_event(event);
            let mut rolls = TurnRolls::new(roll_fn, &mut emit, actor_id.clone());
            rolls.rolls = pre_rolls_vec.clone();
            let executed = engine.execute(state, actor_id, &decision, &mut rolls, dispatcher);
            let turn_rolls = rolls.rolls;

            let failure: String = match executed {
                Ok(mut results) => {
                    engine.end_of_turn(state, actor_id, &mut results);
                    match transactions.validate(state, validator) {
                        Ok(()) => {
                            let record = TurnRecord {
                                round: state.round,
                                combatant_id: actor_id.clone(),
                                intent: decision.intent.clone(),
                                rolls: turn_rolls,
                                results,
                                narrative: decision.narrative.clone(),
                                source_tier: tier,
                            };
                            state.log.push(LogEntry::Turn(record.clone()));
                            self.shared.push_event(EngineEvent::Result {
                                turn_record: record,
                            });
                            return Ok(());
                        }
                        Err(corruption) => corruption.to_string(),
                    }
                }
                Err(rules_error) => rules_error.to_string(),
            };

            transactions.rollback(state, snapshot, actor_id, &failure, tier);
            self.shared.push_event(EngineEvent::Rollback {
                round: state.round,
                combatant_id: actor_id.clone(),
                reason: failure.clone(),
            });

            let Some(next) = tier.next_down() else {
                return Err(EngineError::Fatal(format!(
                    "default action rolled back: {failure}"
                )));
            };
            (decision, tier) = match next {
                SourceTier::OracleRetry if retries_left > 0 => {
                    retries_left -= 1;
                    match self.oracle_decision(
                        state,
                        gateway,
                        validator,
                        oracle_fn,
                        actor_id,
                        turn_deadline,
                        Some(&failure),
                    ) {
                        Ok(decision) => (decision, SourceTier::OracleRetry),
                        Err(LadderStop::Cancelled) => return Err(EngineError::Cancelled),
                        Err(LadderStop::TurnTimeout) => {
                            self.shared.push_event(EngineEvent::TurnTimeout {
                                combatant_id: actor_id.clone(),
                            });
                            (fallback::default_decision(&actor_fresh), SourceTier::Default)
                        }
                        Err(LadderStop::Failure(_)) => (
                            fallback::heuristic_decision(state, &actor_fresh),
                            SourceTier::Heuristic,
                        ),
                    }
                }
                SourceTier::OracleRetry | SourceTier::Heuristic => (
                    fallback::heuristic_decision(state, &actor_fresh),
                    SourceTier::Heuristic,
                ),
                _ => (fallback::default_decision(&actor_fresh), SourceTier::Default),
            };
        }
    }

    /// First pass down the ladder: oracle, one retry, heuristic, default.
    #[allow(clippy::too_many_arguments)]
    fn choose_intent(
        &self,
        state: &EncounterState,
        gateway: &OracleGateway,
        validator: &AbilityValidator,
        oracle_fn: &mut (dyn FnMut(&str, &CancelToken) -> Result<String, OracleError> + Send),
        actor_id: &CombatantId,
        turn_deadline: Instant,
        retries_left: &mut u32,
    ) -> Result<(Decision, SourceTier), EngineError> {
        let actor = state
            .combatant(actor_id)
            .cloned()
            .ok_or_else(|| EngineError::Fatal(format!("actor {actor_id} vanished")))?;

        match self.oracle_decision(state, gateway, validator, oracle_fn, actor_id, turn_deadline, None)
        {
            Ok(decision) => return Ok((decision, SourceTier::Oracle)),
            Err(LadderStop::Cancelled) => return Err(EngineError::Cancelled),
            Err(LadderStop::TurnTimeout) => {
                self.shared.push_event(EngineEvent::TurnTimeout {
                    combatant_id: actor_id.clone(),
                });
                return Ok((fallback::default_decision(&actor), SourceTier::Default));
            }
            Err(LadderStop::Failure(failure)) => {
                // Retry once, only for failures a correction can fix.
                let retryable = matches!(
                    failure,
                    IntentFailure::Parse(_) | IntentFailure::Invalid(_)
                );
                if retryable && *retries_left > 0 {
                    *retries_left -= 1;
                    let note = fallback::retry_note(&failure);
                    match self.oracle_decision(
                        state,
                        gateway,
                        validator,
                        oracle_fn,
                        actor_id,
                        turn_deadline,
                        Some(&note),
                    ) {
                        Ok(decision) => return Ok((decision, SourceTier::OracleRetry)),
                        Err(LadderStop::Cancelled) => return Err(EngineError::Cancelled),
                        Err(LadderStop::TurnTimeout) => {
                            self.shared.push_event(EngineEvent::TurnTimeout {
                                combatant_id: actor_id.clone(),
                            });
                            return Ok((fallback::default_decision(&actor), SourceTier::Default));
                        }
                        Err(LadderStop::Failure(_)) => {}
                    }
                }
            }
        }

        tracing::info!(actor = %actor_id, "oracle tiers exhausted; using heuristic");
        Ok((
            fallback::heuristic_decision(state, &actor),
            SourceTier::Heuristic,
        ))
    }

    /// One oracle round-trip: prompt, call, parse, validate.
    #[allow(clippy::too_many_arguments)]
    fn oracle_decision(
        &self,
        state: &EncounterState,
        gateway: &OracleGateway,
        validator: &AbilityValidator,
        oracle_fn: &mut (dyn FnMut(&str, &CancelToken) -> Result<String, OracleError> + Send),
        actor_id: &CombatantId,
        turn_deadline: Instant,
        retry_note: Option<&str>,
    ) -> Result<Decision, LadderStop> {
        if self.shared.cancel.is_stopped() {
            return Err(LadderStop::Cancelled);
        }
        let now = Instant::now();
        if now >= turn_deadline {
            return Err(LadderStop::TurnTimeout);
        }

        let actor = state.combatant(actor_id).ok_or(LadderStop::TurnTimeout)?;
        let prompt = gateway.build_prompt(state, actor, retry_note);
        let prompt = validator.clean_prompt(&prompt, actor);

        let oracle_budget = Duration::from_millis(self.config.oracle_deadline_ms)
            .min(turn_deadline.saturating_duration_since(now));
        let token = self.shared.cancel.child_with_budget(oracle_budget);

        let result = gateway
            .request_intent(oracle_fn, &prompt, &token)
            .and_then(|decision| {
                gateway
                    .validate(state, actor, validator, &decision)
                    .map(|()| decision)
            });

        match result {
            Ok(decision) => Ok(decision),
            Err(failure) => {
                if self.shared.cancel.is_stopped() {
                    return Err(LadderStop::Cancelled);
                }
                tracing::info!(
                    actor = %actor_id,
                    failure = %failure.describe(),
                    "oracle tier failed"
                );
                Err(LadderStop::Failure(failure))
            }
        }
    }

    /// Before-turn and around-oracle suspension point: honour stop, wait
    /// out pause.
    fn suspension_point(&self) -> Result<(), EngineError> {
        let mut flags = self.shared.flags.lock().expect("flag mutex poisoned");
        loop {
            if flags.stop_requested {
                return Err(EngineError::Cancelled);
            }
            if !flags.paused {
                return Ok(());
            }
            flags = self
                .shared
                .pause_cv
                .wait(flags)
                .expect("flag mutex poisoned");
        }
    }
}

enum LadderStop {
    Failure(IntentFailure),
    TurnTimeout,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combatant::{AbilityKind, Combatant, DamageType};
    use crate::encounter::Environment;
    use crate::testing::{EventLog, ScriptedOracle};

    fn duel_state() -> EncounterState {
        let kobold = Combatant::new("kobold", "Kobold", Side::Monster)
            .with_hp(5)
            .with_ac(12)
            .with_initiative(15)
            .add_ability(
                "Dagger",
                AbilityKind::Attack {
                    bonus: 4,
                    damage: "1d4+2".into(),
                    damage_type: DamageType::Piercing,
                    ranged: false,
                    reach_ft: 5,
                },
            );
        let pc = Combatant::new("pc", "Commoner", Side::Player)
            .with_hp(4)
            .with_ac(10)
            .with_initiative(10)
            .add_ability(
                "Club",
                AbilityKind::Attack {
                    bonus: 2,
                    damage: "1d4".into(),
                    damage_type: DamageType::Bludgeoning,
                    ranged: false,
                    reach_ft: 5,
                },
            );
        let mut state = EncounterState::new(vec![kobold, pc], Environment::default());
        for (a, b) in [("kobold", "pc"), ("pc", "kobold")] {
            state
                .combatant_mut(&CombatantId::from(a))
                .unwrap()
                .position
                .distance_to
                .insert(CombatantId::from(b), 5);
        }
        state
    }

    #[test]
    fn test_start_rejects_empty_side() {
        let only_monsters = EncounterState::new(
            vec![Combatant::new("kobold", "Kobold", Side::Monster).with_hp(5)],
            Environment::default(),
        );
        let resolver = Resolver::default();
        let log = EventLog::new();
        let err = resolver.start(
            only_monsters,
            |_expr: &str| 10,
            |_: &str, _: &CancelToken| Ok(String::new()),
            log.observer(),
            Mode::Continuous,
        );
        assert!(matches!(err, Err(PipelineError::EmptySide("player"))));
    }

    #[test]
    fn test_second_start_while_running_is_rejected() {
        let resolver = Resolver::new(ResolutionConfig::default().with_stop_grace_ms(2_000));
        let log = EventLog::new();
        // A slow oracle keeps the first resolution in flight while the
        // second start is attempted.
        let oracle = ScriptedOracle::always(
            r#"{"action_type": "attack", "ability_name": "Dagger", "targets": ["pc"]}"#,
        )
        .with_delay(Duration::from_millis(100));
        let mut handle = resolver
            .start(duel_state(), |_expr: &str| 2, oracle.into_fn(), log.observer(), Mode::Continuous)
            .unwrap();

        let log2 = EventLog::new();
        let second = resolver.start(
            duel_state(),
            |_expr: &str| 2,
            ScriptedOracle::always("{}").into_fn(),
            log2.observer(),
            Mode::Continuous,
        );
        assert!(matches!(second, Err(PipelineError::AlreadyRunning)));

        handle.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let resolver = Resolver::new(ResolutionConfig::default().with_stop_grace_ms(2_000));
        let log = EventLog::new();
        let oracle = ScriptedOracle::always(
            r#"{"action_type": "attack", "ability_name": "Dagger", "targets": ["pc"]}"#,
        );
        let mut handle = resolver
            .start(duel_state(), |_expr: &str| 2, oracle.into_fn(), log.observer(), Mode::Continuous)
            .unwrap();
        handle.stop();
        handle.stop();
        assert!(!handle.status().running);
        assert!(handle.status().stop_requested);
    }

    #[test]
    fn test_pause_while_paused_is_noop() {
        let resolver = Resolver::new(ResolutionConfig::default().with_stop_grace_ms(2_000));
        let log = EventLog::new();
        let oracle = ScriptedOracle::always(
            r#"{"action_type": "attack", "ability_name": "Dagger", "targets": ["pc"]}"#,
        );
        let mut handle = resolver
            .start(duel_state(), |_expr: &str| 2, oracle.into_fn(), log.observer(), Mode::Continuous)
            .unwrap();
        if handle.pause().is_ok() {
            assert!(handle.pause().is_ok());
        }
        handle.stop();
    }

    #[test]
    fn test_drop_oldest_reports_lag() {
        let shared = Shared {
            flags: Mutex::new(Flags::default()),
            pause_cv: Condvar::new(),
            queue: Mutex::new(EventQueue::default()),
            progress: Mutex::new((1, 0)),
            cancel: CancelToken::new(),
            capacity: 2,
            drop_oldest: true,
        };
        shared.push_event(EngineEvent::RoundStart { round: 1 });
        shared.push_event(EngineEvent::RoundStart { round: 2 });
        shared.push_event(EngineEvent::RoundStart { round: 3 });

        let queue = shared.queue.lock().unwrap();
        assert_eq!(queue.events.len(), 2);
        assert_eq!(queue.pending_lag, 1);
        assert_eq!(
            queue.events.front(),
            Some(&EngineEvent::RoundStart { round: 2 })
        );
    }
}
