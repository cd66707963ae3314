//! Azazel Gateway Configuration
//!
//! Single YAML document driving thresholds, action presets, scoring, SOC
//! exception lists, network enforcement, the deep evaluator and notification
//! sinks. Missing keys fall back to defaults chosen to match a small
//! LTE-uplinked edge gateway.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::Mode;

/// Errors raised while loading the configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed reading config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed parsing config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Main configuration for the gateway daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AzazelConfig {
    pub thresholds: Thresholds,
    pub actions: ActionPresets,
    pub scoring: ScoringConfig,
    pub soc: SocConfig,
    pub network: NetworkConfig,
    pub ai: AiConfig,
    pub canary: CanaryConfig,
    pub paths: PathsConfig,
    pub notify: NotifyConfig,
    pub decay: DecayConfig,
    pub trend: TrendConfig,

    /// Optional one-shot event feed consumed by the `events` subcommand
    pub events: Vec<FeedEvent>,
}

/// Posture thresholds on the EWMA score and step-down hysteresis windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub t0_normal: f64,
    pub t1_shield: f64,
    pub t2_lockdown: f64,
    pub unlock_wait_secs: UnlockWaits,
    pub user_mode_timeout_mins: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            t0_normal: 20.0,
            t1_shield: 50.0,
            t2_lockdown: 80.0,
            unlock_wait_secs: UnlockWaits::default(),
            user_mode_timeout_mins: 3.0,
        }
    }
}

/// Minimum dwell times before the machine may step down.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnlockWaits {
    pub shield: u64,
    pub portal: u64,
}

impl Default for UnlockWaits {
    fn default() -> Self {
        Self { shield: 600, portal: 1800 }
    }
}

/// Per-mode enforcement preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionPreset {
    pub delay_ms: u32,
    pub shape_kbps: Option<u32>,
    pub block: bool,
}

impl Default for ActionPreset {
    fn default() -> Self {
        Self { delay_ms: 0, shape_kbps: None, block: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionPresets {
    pub normal: ActionPreset,
    pub portal: ActionPreset,
    pub shield: ActionPreset,
    pub lockdown: ActionPreset,
}

impl Default for ActionPresets {
    fn default() -> Self {
        Self {
            normal: ActionPreset::default(),
            portal: ActionPreset { delay_ms: 100, shape_kbps: None, block: false },
            shield: ActionPreset { delay_ms: 200, shape_kbps: Some(128), block: false },
            lockdown: ActionPreset { delay_ms: 300, shape_kbps: Some(64), block: true },
        }
    }
}

impl ActionPresets {
    /// Preset for a mode; user overrides use their base mode's preset.
    pub fn for_mode(&self, mode: Mode) -> &ActionPreset {
        match mode.base() {
            Mode::Normal => &self.normal,
            Mode::Portal => &self.portal,
            Mode::Shield => &self.shield,
            Mode::Lockdown => &self.lockdown,
            // base() never returns a user variant
            _ => &self.normal,
        }
    }
}

/// EWMA smoothing and score window parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// EWMA time constant in seconds
    pub ewma_tau: f64,
    /// Bounded ring of recent raw scores kept for display
    pub window_size: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self { ewma_tau: 60.0, window_size: 5 }
    }
}

/// SOC exception lists and signature-category filters.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SocConfig {
    /// Sources blocked on sight, exact textual match
    pub denylist_ips: Vec<String>,
    /// Case-insensitive substrings that make a signature critical
    pub critical_signatures: Vec<String>,
    /// When non-empty, only these ET categories are admitted
    pub allowed_categories: Vec<String>,
    /// ET categories dropped before evaluation
    pub denied_categories: Vec<String>,
}

/// Enforcement interface and rule lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Egress interface carrying the shaping hierarchy
    pub interface: String,
    /// Uplink budget for the root shaping class
    pub uplink_kbps: u32,
    /// TTL sweep period
    pub cleanup_interval_seconds: u64,
    /// Rules older than this are swept
    pub max_rule_age_seconds: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "wlan1".to_string(),
            uplink_kbps: 5000,
            cleanup_interval_seconds: 60,
            max_rule_age_seconds: 3600,
        }
    }
}

/// Remote deep-evaluator endpoint and admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Bernoulli admission probability for the deep stage
    pub deep_sample_rate: f64,
    /// Token bucket refilled once per wall-clock minute
    pub deep_max_per_min: u32,
    pub deep_eval_retries: u32,
    pub deep_persist_retries: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434/api/generate".to_string(),
            model: "qwen2.5-threat-v3".to_string(),
            timeout_secs: 15,
            deep_sample_rate: 1.0,
            deep_max_per_min: 10,
            deep_eval_retries: 2,
            deep_persist_retries: 3,
        }
    }
}

/// Honeypot address and advertised service ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    pub ip: String,
    pub ports: Vec<u16>,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self { ip: "172.16.10.10".to_string(), ports: vec![22, 80, 5432] }
    }
}

/// Filesystem locations for sensor logs and runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub suricata_eve: PathBuf,
    pub opencanary_log: PathBuf,
    pub decisions_log: PathBuf,
    /// Holds `diversions.json` and `status.json`
    pub runtime_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            suricata_eve: PathBuf::from("/var/log/suricata/eve.json"),
            opencanary_log: PathBuf::from("/opt/azazel/logs/opencanary.log"),
            decisions_log: PathBuf::from("/var/log/azazel/decisions.log"),
            runtime_dir: PathBuf::from("/var/lib/azazel"),
        }
    }
}

impl PathsConfig {
    pub fn diversions_file(&self) -> PathBuf {
        self.runtime_dir.join("diversions.json")
    }

    pub fn status_file(&self) -> PathBuf {
        self.runtime_dir.join("status.json")
    }
}

/// Notification sink settings shared by all backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub mattermost: MattermostConfig,
    pub ntfy: NtfyConfig,
    /// Per-key suppression window
    pub cooldown_seconds: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            mattermost: MattermostConfig::default(),
            ntfy: NtfyConfig::default(),
            cooldown_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MattermostConfig {
    pub webhook_url: String,
    pub channel: String,
    pub username: String,
    pub icon_emoji: String,
    pub enabled: bool,
}

impl Default for MattermostConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            channel: "azazel-alerts".to_string(),
            username: "Azazel-Bot".to_string(),
            icon_emoji: ":shield:".to_string(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NtfyConfig {
    pub base_url: String,
    pub topic_alert: String,
    pub topic_info: String,
    pub token_file: PathBuf,
    pub timeout_secs: f64,
    pub enabled: bool,
}

impl Default for NtfyConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            topic_alert: "azg-alert-critical".to_string(),
            topic_info: "azg-info-status".to_string(),
            token_file: PathBuf::from("/etc/azazel/ntfy.token"),
            timeout_secs: 2.0,
            enabled: true,
        }
    }
}

/// Decay writer cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    pub check_interval_secs: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self { check_interval_secs: 5.0 }
    }
}

/// Trend sampler cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    pub sample_interval_secs: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self { sample_interval_secs: 10.0 }
    }
}

/// One entry of the optional `events:` feed (`events` subcommand).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedEvent {
    pub name: String,
    pub severity: u8,
    pub signature: String,
    pub src_ip: Option<String>,
    pub dest_ip: Option<String>,
    pub dest_port: Option<u16>,
    pub proto: Option<String>,
}

impl Default for FeedEvent {
    fn default() -> Self {
        Self {
            name: "alert".to_string(),
            severity: 3,
            signature: String::new(),
            src_ip: None,
            dest_ip: None,
            dest_port: None,
            proto: None,
        }
    }
}

impl AzazelConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    // Builder-style methods for CLI overrides

    pub fn with_interface(mut self, interface: Option<String>) -> Self {
        if let Some(interface) = interface {
            self.network.interface = interface;
        }
        self
    }

    pub fn with_decisions_log(mut self, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.paths.decisions_log = path;
        }
        self
    }

    pub fn with_runtime_dir(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(dir) = dir {
            self.paths.runtime_dir = dir;
        }
        self
    }

    /// Validate configuration values. Startup-fatal on failure.
    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.thresholds;
        if !(t.t0_normal < t.t1_shield && t.t1_shield < t.t2_lockdown) {
            anyhow::bail!(
                "thresholds must be strictly increasing: t0_normal ({}) < t1_shield ({}) < t2_lockdown ({})",
                t.t0_normal,
                t.t1_shield,
                t.t2_lockdown
            );
        }

        if self.scoring.ewma_tau <= 0.0 {
            anyhow::bail!("scoring.ewma_tau ({}) must be positive", self.scoring.ewma_tau);
        }

        if self.scoring.window_size == 0 {
            anyhow::bail!("scoring.window_size must be at least 1");
        }

        if self.network.interface.is_empty() {
            anyhow::bail!("network.interface must not be empty");
        }

        if !(0.0..=1.0).contains(&self.ai.deep_sample_rate) {
            anyhow::bail!(
                "ai.deep_sample_rate ({}) must be within [0, 1]",
                self.ai.deep_sample_rate
            );
        }

        Ok(())
    }
}

/// Shared configuration handle with best-effort reload.
///
/// Readers take a cheap clone of the current document; a failed reload keeps
/// the previously loaded configuration in place.
#[derive(Debug)]
pub struct ConfigHandle {
    path: Option<PathBuf>,
    current: RwLock<AzazelConfig>,
}

impl ConfigHandle {
    pub fn new(config: AzazelConfig, path: Option<PathBuf>) -> Self {
        Self { path, current: RwLock::new(config) }
    }

    pub fn get(&self) -> AzazelConfig {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Re-read the document from disk; on any failure the last good
    /// configuration stays active.
    pub fn reload(&self) -> bool {
        let Some(path) = &self.path else { return false };
        match AzazelConfig::load(path).map_err(anyhow::Error::from).and_then(|c| {
            c.validate()?;
            Ok(c)
        }) {
            Ok(config) => {
                *self.current.write().expect("config lock poisoned") = config;
                true
            }
            Err(e) => {
                warn!("Config reload failed, keeping previous configuration: {e:#}");
                false
            }
        }
    }
}
