//! Posture State Machine
//!
//! An EWMA-smoothed threat score drives the gateway through
//! `normal -> portal -> shield -> lockdown`. Upward transitions are
//! immediate; downward transitions observe per-step hysteresis windows and
//! never skip an intermediate state. Manual overrides park the machine in a
//! `user_*` state until their timer expires.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{ActionPreset, ConfigHandle};
use crate::types::{Clock, Mode};

/// Result of feeding one score sample into the machine.
#[derive(Debug, Clone)]
pub struct PostureEvaluation {
    /// Current EWMA after the sample
    pub average: f64,
    /// Mode the thresholds ask for
    pub desired_mode: Mode,
    /// Desired mode after hysteresis constraints
    pub target_mode: Mode,
    /// Mode the machine actually ended in
    pub applied_mode: Mode,
    /// True while a manual override suppresses automatic transitions
    pub user_override: bool,
    /// Seconds left on the active override, if any
    pub timeout_remaining: Option<f64>,
}

/// Score metrics kept for display consumers.
#[derive(Debug, Clone)]
pub struct ScoreMetrics {
    pub ewma: f64,
    pub window_avg: f64,
    pub history: Vec<u8>,
}

pub struct PostureMachine {
    config: Arc<ConfigHandle>,
    clock: Arc<dyn Clock>,
    state: Mode,
    ewma: f64,
    ewma_initialized: bool,
    last_ewma_ts: f64,
    /// Bounded ring of recent raw scores, display only
    window: VecDeque<u8>,
    /// Earliest time a step-down to the keyed mode is permitted
    unlock_until: HashMap<Mode, f64>,
    /// Wall time at which the manual override expires (0 = none)
    user_override_until: f64,
}

impl PostureMachine {
    pub fn new(config: Arc<ConfigHandle>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            state: Mode::Portal,
            ewma: 0.0,
            ewma_initialized: false,
            last_ewma_ts: now,
            window: VecDeque::new(),
            unlock_until: HashMap::new(),
            user_override_until: 0.0,
        }
    }

    pub fn state(&self) -> Mode {
        self.state
    }

    /// Action preset for the current mode (user overrides borrow their base
    /// mode's preset).
    pub fn actions_preset(&self) -> ActionPreset {
        self.config.get().actions.for_mode(self.state).clone()
    }

    pub fn metrics(&self) -> ScoreMetrics {
        let window_avg = if self.window.is_empty() {
            0.0
        } else {
            self.window.iter().map(|&s| f64::from(s)).sum::<f64>() / self.window.len() as f64
        };
        ScoreMetrics {
            ewma: self.ewma,
            window_avg,
            history: self.window.iter().copied().collect(),
        }
    }

    /// Feed one score sample; advance the EWMA and transition if permitted.
    pub fn apply_score(&mut self, score: u8) -> PostureEvaluation {
        let timeout_occurred = self.check_user_timeout();
        let now = self.clock.now();

        let average = self.update_ewma(score, now);
        let desired_mode = self.desired_for(average);

        if self.state.is_user() && !timeout_occurred {
            return PostureEvaluation {
                average,
                desired_mode,
                target_mode: self.state,
                applied_mode: self.state,
                user_override: true,
                timeout_remaining: Some((self.user_override_until - now).max(0.0)),
            };
        }

        let target_mode = match desired_mode {
            Mode::Normal => self.target_for_normal(now),
            Mode::Portal => self.target_for_portal(now),
            Mode::Shield => self.target_for_shield(now),
            other => other,
        };

        if target_mode != self.state {
            self.transition_to(target_mode);
        }

        PostureEvaluation {
            average,
            desired_mode,
            target_mode,
            applied_mode: self.state,
            user_override: false,
            timeout_remaining: None,
        }
    }

    /// Move to a manual override mode for `duration_secs`.
    ///
    /// Returns false for modes without a user variant.
    pub fn start_user_mode(&mut self, mode: Mode, duration_secs: f64) -> bool {
        let Some(user_mode) = mode.as_user() else { return false };
        // Timer is armed before the transition so the entry hook keeps it
        self.user_override_until = self.clock.now() + duration_secs;
        self.transition_to(user_mode);
        info!("👤 Manual override: {} for {:.0}s", user_mode, duration_secs);
        true
    }

    /// Expire an elapsed override, dropping back to the base mode.
    fn check_user_timeout(&mut self) -> bool {
        if !self.state.is_user() {
            return false;
        }
        if self.clock.now() < self.user_override_until {
            return false;
        }
        let base = self.state.base();
        info!("⏱️ Override expired: timeout_{}", base);
        self.user_override_until = 0.0;
        self.transition_to(base);
        true
    }

    // --- EWMA --------------------------------------------------------------

    /// `alpha = 1 - exp(-dt/tau)`: monotone in the previous value and the new
    /// sample, decaying toward zero when fed zeros.
    fn update_ewma(&mut self, score: u8, now: f64) -> f64 {
        let sample = f64::from(score);

        let window_size = self.config.get().scoring.window_size.max(1);
        while self.window.len() >= window_size {
            self.window.pop_front();
        }
        self.window.push_back(score);

        let dt = (now - self.last_ewma_ts).max(0.0);
        let tau = self.config.get().scoring.ewma_tau;
        let alpha = if tau <= 0.0 || dt <= 0.0 { 1.0 } else { 1.0 - (-dt / tau).exp() };

        if !self.ewma_initialized {
            self.ewma = sample;
            self.ewma_initialized = true;
        } else {
            self.ewma = alpha * sample + (1.0 - alpha) * self.ewma;
        }
        self.last_ewma_ts = now;
        self.ewma
    }

    fn desired_for(&self, average: f64) -> Mode {
        let t = self.config.get().thresholds;
        if average >= t.t2_lockdown {
            Mode::Lockdown
        } else if average >= t.t1_shield {
            Mode::Shield
        } else if average >= t.t0_normal {
            Mode::Portal
        } else {
            Mode::Normal
        }
    }

    // --- hysteresis targets ------------------------------------------------

    fn target_for_shield(&self, now: f64) -> Mode {
        if self.state.base() == Mode::Lockdown && self.locked(Mode::Shield, now) {
            return Mode::Lockdown;
        }
        Mode::Shield
    }

    fn target_for_portal(&self, now: f64) -> Mode {
        match self.state.base() {
            Mode::Lockdown => {
                if self.locked(Mode::Shield, now) {
                    Mode::Lockdown
                } else {
                    // Step-down path: lockdown reaches portal through shield
                    Mode::Shield
                }
            }
            Mode::Shield if self.locked(Mode::Portal, now) => Mode::Shield,
            _ => Mode::Portal,
        }
    }

    /// Stepping down to normal walks the same ladder as portal; only the
    /// final portal -> normal hop is unconditional.
    fn target_for_normal(&self, now: f64) -> Mode {
        match self.state.base() {
            Mode::Lockdown => {
                if self.locked(Mode::Shield, now) {
                    Mode::Lockdown
                } else {
                    Mode::Shield
                }
            }
            Mode::Shield => {
                if self.locked(Mode::Portal, now) {
                    Mode::Shield
                } else {
                    Mode::Portal
                }
            }
            _ => Mode::Normal,
        }
    }

    fn locked(&self, step_target: Mode, now: f64) -> bool {
        self.unlock_until.get(&step_target).is_some_and(|&until| now < until)
    }

    // --- transitions -------------------------------------------------------

    fn transition_to(&mut self, target: Mode) {
        let previous = self.state;
        if previous == target {
            return;
        }
        self.state = target;
        debug!("Posture transition: {} -> {}", previous, target);

        let config = self.config.get();
        let waits = &config.thresholds.unlock_wait_secs;
        let now = self.clock.now();

        if target.is_user() && self.user_override_until == 0.0 {
            self.user_override_until =
                now + config.thresholds.user_mode_timeout_mins * 60.0;
        } else if previous.is_user() && !target.is_user() {
            self.user_override_until = 0.0;
        }

        match target.base() {
            Mode::Lockdown => {
                if waits.shield > 0 {
                    self.unlock_until.insert(Mode::Shield, now + waits.shield as f64);
                }
            }
            Mode::Shield => {
                if waits.portal > 0 {
                    self.unlock_until.insert(Mode::Portal, now + waits.portal as f64);
                }
                self.unlock_until.remove(&Mode::Shield);
            }
            Mode::Portal | Mode::Normal => {
                self.unlock_until.clear();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AzazelConfig;
    use crate::types::ManualClock;

    fn machine() -> (PostureMachine, Arc<ManualClock>) {
        machine_with(AzazelConfig::default())
    }

    fn machine_with(config: AzazelConfig) -> (PostureMachine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0.0));
        let handle = Arc::new(ConfigHandle::new(config, None));
        (PostureMachine::new(handle, clock.clone()), clock)
    }

    #[test]
    fn test_threshold_boundaries_inclusive() {
        for (score, expected) in [(19u8, Mode::Normal), (20, Mode::Portal), (50, Mode::Shield), (80, Mode::Lockdown)]
        {
            let (mut m, _) = machine();
            let eval = m.apply_score(score);
            assert_eq!(eval.desired_mode, expected, "score {score}");
        }
    }

    #[test]
    fn test_first_sample_initializes_ewma() {
        let (mut m, _) = machine();
        let eval = m.apply_score(73);
        assert!((eval.average - 73.0).abs() < f64::EPSILON);
        assert_eq!(eval.applied_mode, Mode::Shield);
    }

    #[test]
    fn test_upward_transitions_immediate() {
        let (mut m, _) = machine();
        assert_eq!(m.apply_score(90).applied_mode, Mode::Lockdown);
        assert_eq!(m.state(), Mode::Lockdown);
    }

    #[test]
    fn test_step_down_observes_unlock_waits() {
        let (mut m, clock) = machine();
        m.apply_score(90);
        assert_eq!(m.state(), Mode::Lockdown);

        // Same-instant zero sample resets the EWMA (dt=0 => alpha=1) but the
        // shield unlock window holds the machine in lockdown
        clock.advance(500.0);
        let eval = m.apply_score(0);
        assert!(eval.average < 20.0);
        assert_eq!(eval.desired_mode, Mode::Normal);
        assert_eq!(eval.target_mode, Mode::Lockdown);
        assert_eq!(m.state(), Mode::Lockdown);

        // Past the shield wait: exactly one step down
        clock.advance(101.0);
        let eval = m.apply_score(0);
        assert_eq!(eval.target_mode, Mode::Shield);
        assert_eq!(m.state(), Mode::Shield);

        // Portal unlock armed on shield entry; not yet elapsed
        let eval = m.apply_score(0);
        assert_eq!(eval.target_mode, Mode::Shield);

        clock.advance(1801.0);
        let eval = m.apply_score(0);
        assert_eq!(eval.target_mode, Mode::Portal);
        assert_eq!(m.state(), Mode::Portal);

        // Portal -> normal is unconditional
        let eval = m.apply_score(0);
        assert_eq!(eval.applied_mode, Mode::Normal);
    }

    #[test]
    fn test_step_down_never_skips_shield() {
        let (mut m, clock) = machine();
        m.apply_score(95);
        assert_eq!(m.state(), Mode::Lockdown);

        let mut seen = vec![m.state()];
        for _ in 0..700 {
            clock.advance(10.0);
            let eval = m.apply_score(0);
            if *seen.last().unwrap() != eval.applied_mode {
                seen.push(eval.applied_mode);
            }
        }
        assert_eq!(seen, vec![Mode::Lockdown, Mode::Shield, Mode::Portal, Mode::Normal]);
    }

    #[test]
    fn test_ewma_decays_toward_zero() {
        let (mut m, clock) = machine();
        m.apply_score(100);
        let mut prev = 100.0;
        for _ in 0..20 {
            clock.advance(30.0);
            let eval = m.apply_score(0);
            assert!(eval.average < prev, "EWMA must strictly decrease");
            prev = eval.average;
        }
        assert!(prev < 1.0);
    }

    #[test]
    fn test_ewma_never_exceeds_max_sample() {
        let (mut m, clock) = machine();
        for _ in 0..50 {
            clock.advance(5.0);
            let eval = m.apply_score(60);
            assert!(eval.average <= 60.0 + 1e-9);
        }
    }

    #[test]
    fn test_user_override_suppresses_thresholds() {
        let (mut m, clock) = machine();
        assert!(m.start_user_mode(Mode::Shield, 180.0));
        assert_eq!(m.state(), Mode::UserShield);

        let eval = m.apply_score(95);
        assert!(eval.user_override);
        assert_eq!(eval.applied_mode, Mode::UserShield);
        assert!(eval.timeout_remaining.unwrap() > 0.0);

        // Override expires; automatic logic resumes on the same event
        clock.advance(181.0);
        let eval = m.apply_score(95);
        assert!(!eval.user_override);
        assert_eq!(eval.applied_mode, Mode::Lockdown);
    }

    #[test]
    fn test_user_mode_rejected_for_normal() {
        let (mut m, _) = machine();
        assert!(!m.start_user_mode(Mode::Normal, 60.0));
        assert_eq!(m.state(), Mode::Portal);
    }

    #[test]
    fn test_window_ring_is_bounded() {
        let (mut m, clock) = machine();
        for i in 0..20 {
            clock.advance(1.0);
            m.apply_score((i % 7) as u8);
        }
        let metrics = m.metrics();
        assert_eq!(metrics.history.len(), 5);
        assert!(metrics.window_avg <= 6.0);
    }

    #[test]
    fn test_zero_unlock_waits_allow_direct_stepdown() {
        let mut config = AzazelConfig::default();
        config.thresholds.unlock_wait_secs.shield = 0;
        config.thresholds.unlock_wait_secs.portal = 0;
        let (mut m, clock) = machine_with(config);

        m.apply_score(90);
        assert_eq!(m.state(), Mode::Lockdown);
        // Five EWMA time constants: the average has decayed below t0
        clock.advance(300.0);
        // Still steps through shield and portal, one hop per event
        assert_eq!(m.apply_score(0).applied_mode, Mode::Shield);
        assert_eq!(m.apply_score(0).applied_mode, Mode::Portal);
        assert_eq!(m.apply_score(0).applied_mode, Mode::Normal);
    }
}
