//! Resolution configuration.

/// Tunables applied at `start`. Defaults match the documented contract.
#[derive(Debug, Clone)]
pub struct ResolutionConfig {
    /// Wall-clock budget for a whole turn, in milliseconds.
    pub turn_deadline_ms: u64,
    /// Budget for a single oracle call, in milliseconds.
    pub oracle_deadline_ms: u64,
    /// Oracle retries per turn.
    pub retry_budget: u32,
    /// Recent turns kept verbatim in the prompt summary.
    pub summary_verbatim_turns: usize,
    /// Character budget for the digest section of the summary.
    pub summary_char_budget: usize,
    /// Natural rolls that crit; `[19, 20]` with improved critical.
    pub critical_range: Vec<i32>,
    /// Describe enemy HP as bands rather than exact numbers.
    pub hide_enemy_hp_bands: bool,
    /// Drop the oldest pending event instead of blocking a slow observer.
    pub drop_oldest_on_observer_lag: bool,
    /// Failsafe round cap; hitting it ends the encounter as a draw.
    pub max_rounds: u32,
    /// Bounded observer queue capacity.
    pub event_queue_capacity: usize,
    /// How long `stop` waits for the worker after cancelling an in-flight
    /// oracle call, in milliseconds.
    pub stop_grace_ms: u64,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            turn_deadline_ms: 60_000,
            oracle_deadline_ms: 30_000,
            retry_budget: 1,
            summary_verbatim_turns: 3,
            summary_char_budget: 1_200,
            critical_range: vec![20],
            hide_enemy_hp_bands: true,
            drop_oldest_on_observer_lag: true,
            max_rounds: 50,
            event_queue_capacity: 256,
            stop_grace_ms: 5_000,
        }
    }
}

impl ResolutionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_turn_deadline_ms(mut self, ms: u64) -> Self {
        self.turn_deadline_ms = ms;
        self
    }

    pub fn with_oracle_deadline_ms(mut self, ms: u64) -> Self {
        self.oracle_deadline_ms = ms;
        self
    }

    pub fn with_retry_budget(mut self, retries: u32) -> Self {
        self.retry_budget = retries;
        self
    }

    pub fn with_summary_verbatim_turns(mut self, turns: usize) -> Self {
        self.summary_verbatim_turns = turns;
        self
    }

    pub fn with_summary_char_budget(mut self, chars: usize) -> Self {
        self.summary_char_budget = chars;
        self
    }

    /// Enable 19-20 critical hits.
    pub fn with_improved_critical(mut self) -> Self {
        self.critical_range = vec![19, 20];
        self
    }

    pub fn with_visible_enemy_hp(mut self) -> Self {
        self.hide_enemy_hp_bands = false;
        self
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_stop_grace_ms(mut self, ms: u64) -> Self {
        self.stop_grace_ms = ms;
        self
    }

    pub fn is_critical(&self, natural: i32) -> bool {
        self.critical_range.contains(&natural)
    }
}
