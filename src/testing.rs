//! Testing utilities for the resolution engine.
//!
//! This module provides deterministic doubles for the injected
//! collaborators:
//! - `ScriptedOracle` for canned oracle replies without a network
//! - `SequenceRoller` for fixed dice sequences
//! - `NotationRoller` for random rolls of the `XdY+Z` subset
//! - `EventLog` for collecting observer events in assertions

use crate::error::OracleError;
use crate::event::EngineEvent;
use crate::oracle::CancelToken;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Oracle doubles
// ============================================================================

/// An oracle that returns scripted responses in order, then repeats the
/// last one. Optionally sleeps per call (in small slices, honouring the
/// cancel token) to exercise timeout and cancellation paths.
#[derive(Clone)]
pub struct ScriptedOracle {
    responses: Arc<Mutex<ScriptState>>,
    delay: Duration,
}

struct ScriptState {
    responses: Vec<String>,
    index: usize,
    calls: usize,
}

impl ScriptedOracle {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(ScriptState {
                responses: responses.into_iter().map(String::from).collect(),
                index: 0,
                calls: 0,
            })),
            delay: Duration::ZERO,
        }
    }

    /// The same response for every call.
    pub fn always(response: &str) -> Self {
        Self::new(vec![response])
    }

    /// Sleep this long on every call before answering, checking the
    /// cancel token every few milliseconds as a well-behaved oracle must.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// How many times the oracle was called.
    pub fn calls(&self) -> usize {
        self.responses.lock().expect("script poisoned").calls
    }

    /// Produce the callback to hand to `Resolver::start`.
    pub fn into_fn(
        self,
    ) -> impl FnMut(&str, &CancelToken) -> Result<String, OracleError> + Send + 'static {
        move |_prompt: &str, token: &CancelToken| {
            let mut waited = Duration::ZERO;
            while waited < self.delay {
                if token.is_cancelled() {
                    return Err(if token.is_stopped() {
                        OracleError::Cancelled
                    } else {
                        OracleError::Timeout(waited.as_millis() as u64)
                    });
                }
                let slice = Duration::from_millis(2).min(self.delay - waited);
                std::thread::sleep(slice);
                waited += slice;
            }
            if token.is_cancelled() {
                return Err(if token.is_stopped() {
                    OracleError::Cancelled
                } else {
                    OracleError::Timeout(self.delay.as_millis() as u64)
                });
            }

            let mut state = self.responses.lock().expect("script poisoned");
            state.calls += 1;
            let index = state.index.min(state.responses.len().saturating_sub(1));
            if state.index + 1 < state.responses.len() {
                state.index += 1;
            }
            state
                .responses
                .get(index)
                .cloned()
                .ok_or_else(|| OracleError::Transport("no scripted response".to_string()))
        }
    }
}

/// An oracle that fails every call with a transport error.
pub fn failing_oracle(
) -> impl FnMut(&str, &CancelToken) -> Result<String, OracleError> + Send + 'static {
    |_prompt: &str, _token: &CancelToken| Err(OracleError::Transport("wire down".to_string()))
}

// ============================================================================
// Dice doubles
// ============================================================================

/// Returns a fixed sequence of results, then 10 forever.
pub struct SequenceRoller {
    results: Vec<i32>,
    index: usize,
}

impl SequenceRoller {
    pub fn new(results: Vec<i32>) -> Self {
        Self { results, index: 0 }
    }

    pub fn next_result(&mut self) -> i32 {
        let value = self.results.get(self.index).copied().unwrap_or(10);
        self.index += 1;
        value
    }

    /// Borrow as a roll callback for direct engine calls.
    pub fn as_fn(&mut self) -> impl FnMut(&str) -> i32 + Send + '_ {
        move |_expr: &str| self.next_result()
    }

    /// Consume into an owned callback for `Resolver::start`.
    pub fn into_fn(mut self) -> impl FnMut(&str) -> i32 + Send + 'static {
        move |_expr: &str| self.next_result()
    }
}

/// Rolls `XdY+Z` notation with a real RNG, clamped at a minimum of 1.
/// Test-support counterpart of a production dice service.
pub struct NotationRoller;

impl NotationRoller {
    pub fn into_fn() -> impl FnMut(&str) -> i32 + Send + 'static {
        let mut rng = rand::rngs::OsRng;
        move |expression: &str| {
            let mut total = 0i64;
            for term in expression.replace(' ', "").replace('-', "+-").split('+') {
                if term.is_empty() {
                    continue;
                }
                if let Some((count, sides)) = term.split_once('d') {
                    let count: i64 = if count.is_empty() {
                        1
                    } else {
                        count.parse().unwrap_or(0)
                    };
                    let sides: i64 = sides.parse().unwrap_or(0);
                    if sides > 0 {
                        for _ in 0..count.max(0) {
                            total += rng.gen_range(1..=sides);
                        }
                    }
                } else {
                    total += term.parse::<i64>().unwrap_or(0);
                }
            }
            total.max(1) as i32
        }
    }
}

// ============================================================================
// Event collection
// ============================================================================

/// Collects observer events behind a shared handle for assertions.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The observer callback to hand to `Resolver::start`.
    pub fn observer(&self) -> impl FnMut(EngineEvent) + Send + 'static {
        let events = Arc::clone(&self.events);
        move |event| events.lock().expect("event log poisoned").push(event)
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }

    pub fn count_of(&self, type_name: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.type_name() == type_name)
            .count()
    }

    pub fn first_of(&self, type_name: &str) -> Option<EngineEvent> {
        self.events()
            .into_iter()
            .find(|e| e.type_name() == type_name)
    }

    pub fn last(&self) -> Option<EngineEvent> {
        self.events().last().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_roller_repeats_default() {
        let mut roller = SequenceRoller::new(vec![20, 4]);
        let mut roll = roller.as_fn();
        assert_eq!(roll("1d20"), 20);
        assert_eq!(roll("1d4"), 4);
        assert_eq!(roll("1d6"), 10);
    }

    #[test]
    fn test_scripted_oracle_repeats_last() {
        let oracle = ScriptedOracle::new(vec!["a", "b"]);
        let mut call = oracle.clone().into_fn();
        let token = CancelToken::new();
        assert_eq!(call("p", &token).unwrap(), "a");
        assert_eq!(call("p", &token).unwrap(), "b");
        assert_eq!(call("p", &token).unwrap(), "b");
        assert_eq!(oracle.calls(), 3);
    }

    #[test]
    fn test_delayed_oracle_honours_cancellation() {
        let oracle = ScriptedOracle::always("x").with_delay(Duration::from_secs(5));
        let mut call = oracle.into_fn();
        let token = CancelToken::new();
        token.cancel();
        let started = std::time::Instant::now();
        let result = call("p", &token);
        assert!(matches!(result, Err(OracleError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_notation_roller_ranges() {
        let mut roll = NotationRoller::into_fn();
        for _ in 0..50 {
            let value = roll("2d6+3");
            assert!((5..=15).contains(&value));
        }
        assert_eq!(roll("5"), 5);
    }

    #[test]
    fn test_event_log_collects() {
        let log = EventLog::new();
        let mut observer = log.observer();
        observer(EngineEvent::RoundStart { round: 1 });
        observer(EngineEvent::Lag { dropped_events: 2 });
        assert_eq!(log.count_of("round_start"), 1);
        assert!(matches!(log.last(), Some(EngineEvent::Lag { .. })));
    }
}
