//! Core types shared across the Azazel pipeline.
//!
//! Events flow tailer -> normalizer -> evaluator -> posture machine ->
//! enforcer, and every stage communicates through the types defined here.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

// =============================================================================
// EVENTS
// =============================================================================

/// A normalized sensor event.
///
/// Produced by the ingest normalizers (one per sensor schema) and by the
/// daemon's synthetic timers (`decay_tick`, `trend_sample`), consumed once by
/// the evaluation pipeline and then discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Short event kind token (`alert`, `canary`, `decay_tick`, `trend_sample`)
    pub name: String,

    /// Sensor severity, 1 (most severe) to 5, or 0 for synthetic events
    pub severity: u8,

    /// Free-form signature; empty for synthetic events
    #[serde(default)]
    pub signature: String,

    /// Source address in textual form (IPv6 sources are enforcement-ineligible)
    #[serde(default)]
    pub src_ip: Option<String>,

    /// Destination address in textual form
    #[serde(default)]
    pub dest_ip: Option<String>,

    /// Destination port, when the sensor reported one
    #[serde(default)]
    pub dest_port: Option<u16>,

    /// Protocol (`tcp`/`udp`/`icmp`)
    #[serde(default)]
    pub proto: Option<String>,

    /// Sensor-provided ISO-8601 timestamp
    #[serde(default)]
    pub timestamp: Option<String>,

    /// Opaque sensor payload preserved for downstream logging
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Event {
    /// Build a synthetic event (no signature, severity 0).
    pub fn synthetic(name: &str) -> Self {
        Self {
            name: name.to_string(),
            severity: 0,
            signature: String::new(),
            src_ip: None,
            dest_ip: None,
            dest_port: None,
            proto: None,
            timestamp: None,
            details: serde_json::Value::Null,
        }
    }

    /// Whether the source address looks like IPv6 (enforcement-ineligible).
    pub fn has_ipv6_source(&self) -> bool {
        self.src_ip.as_deref().map(is_ipv6_literal).unwrap_or(false)
    }
}

/// IPv6 detection on the textual form: a colon without IPv4 dot notation.
pub fn is_ipv6_literal(ip: &str) -> bool {
    ip.contains(':') && !ip.split('.').all(|o| !o.is_empty() && o.chars().all(|c| c.is_ascii_digit()))
}

// =============================================================================
// SCORING
// =============================================================================

/// Threat category assigned by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatCategory {
    Benign,
    Scan,
    Bruteforce,
    Dos,
    Exploit,
    Sqli,
    Malware,
    Critical,
    Unknown,
}

impl ThreatCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::Benign => "benign",
            ThreatCategory::Scan => "scan",
            ThreatCategory::Bruteforce => "bruteforce",
            ThreatCategory::Dos => "dos",
            ThreatCategory::Exploit => "exploit",
            ThreatCategory::Sqli => "sqli",
            ThreatCategory::Malware => "malware",
            ThreatCategory::Critical => "critical",
            ThreatCategory::Unknown => "unknown",
        }
    }

    /// Parse a category token coming back from the deep evaluator.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "benign" => ThreatCategory::Benign,
            "scan" | "recon" => ThreatCategory::Scan,
            "bruteforce" | "brute_force" => ThreatCategory::Bruteforce,
            "dos" | "ddos" => ThreatCategory::Dos,
            "exploit" => ThreatCategory::Exploit,
            "sqli" | "injection" => ThreatCategory::Sqli,
            "malware" => ThreatCategory::Malware,
            "critical" => ThreatCategory::Critical,
            _ => ThreatCategory::Unknown,
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recommended action carried alongside the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionHint {
    Allow,
    Monitor,
    Delay,
    Block,
}

impl ActionHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionHint::Allow => "allow",
            ActionHint::Monitor => "monitor",
            ActionHint::Delay => "delay",
            ActionHint::Block => "block",
        }
    }

    /// Derive an action from a 0-100 score when the evaluator returned none.
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => ActionHint::Block,
            60..=79 => ActionHint::Delay,
            30..=59 => ActionHint::Monitor,
            _ => ActionHint::Allow,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Some(ActionHint::Allow),
            "monitor" => Some(ActionHint::Monitor),
            "delay" => Some(ActionHint::Delay),
            "block" => Some(ActionHint::Block),
            _ => None,
        }
    }
}

/// Which evaluation stage produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalMethod {
    Exception,
    Rule,
    Deep,
    Fallback,
}

impl EvalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalMethod::Exception => "exception",
            EvalMethod::Rule => "rule",
            EvalMethod::Deep => "deep",
            EvalMethod::Fallback => "fallback",
        }
    }
}

/// Final evaluation result fed to the posture machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Clamped threat score in [0, 100]
    pub score: u8,
    pub category: ThreatCategory,
    pub action: ActionHint,
    pub method: EvalMethod,
    /// Stage confidence in [0, 1]
    pub confidence: f64,
    /// Short human-readable rationale (truncated upstream)
    pub explanation: String,
}

impl ScoreResult {
    pub fn exception() -> Self {
        Self {
            score: 95,
            category: ThreatCategory::Critical,
            action: ActionHint::Block,
            method: EvalMethod::Exception,
            confidence: 1.0,
            explanation: "denylist/critical signature".to_string(),
        }
    }
}

/// Clamp an arbitrary numeric score into the 0-100 range.
pub fn clamp_score(score: i64) -> u8 {
    score.clamp(0, 100) as u8
}

/// Map the internal 1-5 risk scale to the 0-100 score scale.
pub fn risk_to_score(risk: u8) -> u8 {
    clamp_score((i64::from(risk.clamp(1, 5)) - 1) * 25)
}

// =============================================================================
// POSTURE MODES
// =============================================================================

/// Defensive posture of the gateway.
///
/// The `User*` variants are manual overrides; automatic threshold transitions
/// are suspended while one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Normal,
    Portal,
    Shield,
    Lockdown,
    UserPortal,
    UserShield,
    UserLockdown,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Portal => "portal",
            Mode::Shield => "shield",
            Mode::Lockdown => "lockdown",
            Mode::UserPortal => "user_portal",
            Mode::UserShield => "user_shield",
            Mode::UserLockdown => "user_lockdown",
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Mode::UserPortal | Mode::UserShield | Mode::UserLockdown)
    }

    /// Base mode with any user override stripped.
    pub fn base(&self) -> Mode {
        match self {
            Mode::UserPortal => Mode::Portal,
            Mode::UserShield => Mode::Shield,
            Mode::UserLockdown => Mode::Lockdown,
            other => *other,
        }
    }

    /// User-override variant of an automatic mode, if one exists.
    pub fn as_user(&self) -> Option<Mode> {
        match self.base() {
            Mode::Portal => Some(Mode::UserPortal),
            Mode::Shield => Some(Mode::UserShield),
            Mode::Lockdown => Some(Mode::UserLockdown),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Option<Mode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Some(Mode::Normal),
            "portal" => Some(Mode::Portal),
            "shield" => Some(Mode::Shield),
            "lockdown" => Some(Mode::Lockdown),
            "user_portal" => Some(Mode::UserPortal),
            "user_shield" => Some(Mode::UserShield),
            "user_lockdown" => Some(Mode::UserLockdown),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CLOCK
// =============================================================================

/// Monotone time source injected at construction.
///
/// The EWMA clock, the frequency window, the deep-stage token bucket and the
/// TTL sweep all read time through this trait so tests can drive it manually.
pub trait Clock: Send + Sync {
    /// Seconds since an arbitrary fixed origin; strictly non-decreasing.
    fn now(&self) -> f64;
}

/// Process-lifetime monotonic clock.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually driven clock for deterministic tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock {
    value: std::sync::Mutex<f64>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self { value: std::sync::Mutex::new(start) }
    }

    pub fn advance(&self, secs: f64) {
        *self.value.lock().unwrap() += secs;
    }

    pub fn set(&self, secs: f64) {
        *self.value.lock().unwrap() = secs;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.value.lock().unwrap()
    }
}
