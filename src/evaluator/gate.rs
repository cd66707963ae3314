//! Admission control for the remote deep-evaluation stage.
//!
//! Two thread-safe checks gate every deep call: a Bernoulli draw against the
//! configured sample rate, then a token bucket of `deep_max_per_min` tokens
//! refilled once per wall-clock minute. Failing either simply skips the deep
//! stage; the rule result stands in.

use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::debug;

use crate::types::Clock;

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: f64,
}

pub struct DeepGate {
    sample_rate: f64,
    max_per_min: u32,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl DeepGate {
    pub fn new(sample_rate: f64, max_per_min: u32, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            sample_rate: sample_rate.clamp(0.0, 1.0),
            max_per_min,
            state: Mutex::new(BucketState { tokens: max_per_min, last_refill: now }),
            clock,
        }
    }

    /// Decide whether one deep evaluation may run now.
    pub fn admit(&self) -> bool {
        if self.sample_rate < 1.0 && rand::thread_rng().gen::<f64>() > self.sample_rate {
            debug!("Deep stage skipped by sampling");
            return false;
        }
        self.take_token()
    }

    fn take_token(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().expect("deep gate lock poisoned");

        if now - state.last_refill >= 60.0 {
            state.tokens = self.max_per_min;
            state.last_refill = now;
        }

        if state.tokens == 0 {
            debug!("Deep stage skipped by rate limit");
            return false;
        }
        state.tokens -= 1;
        true
    }

    /// Tokens remaining in the current window.
    pub fn tokens_left(&self) -> u32 {
        self.state.lock().expect("deep gate lock poisoned").tokens
    }
}
