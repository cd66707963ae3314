//! Outbound Notifications
//!
//! Three event kinds fan out to webhook-style sinks: a detected threat, a
//! diversion applied/removed, and a posture change. Each sink deduplicates
//! per-kind keys through a cooldown window and sends best-effort: a failing
//! backend never blocks the others, and nothing here ever propagates an
//! error into the event pipeline.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::NotifyConfig;
use crate::types::{Clock, Event, Mode};

/// Webhook send timeout.
const SEND_TIMEOUT: Duration = Duration::from_secs(8);

/// A honeypot endpoint advertised in redirect notifications.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: String,
    pub port: u16,
}

impl Endpoint {
    pub fn tcp(port: u16) -> Self {
        Self { protocol: "tcp".to_string(), port }
    }
}

/// One notification backend.
#[async_trait]
pub trait NotifySink: Send + Sync {
    async fn threat_detected(&self, alert: &Event) -> bool;
    async fn redirect_change(&self, target_ip: &str, endpoints: &[Endpoint], applied: bool) -> bool;
    async fn mode_change(&self, previous: Mode, current: Mode, average: f64) -> bool;
}

/// Per-key suppression window shared by the sink implementations.
pub struct Cooldown {
    seconds: f64,
    last_sent: Mutex<HashMap<String, f64>>,
    clock: Arc<dyn Clock>,
}

impl Cooldown {
    pub fn new(seconds: u64, clock: Arc<dyn Clock>) -> Self {
        Self { seconds: seconds as f64, last_sent: Mutex::new(HashMap::new()), clock }
    }

    /// True when the key is cold; records the send time as a side effect.
    pub fn should_send(&self, key: &str) -> bool {
        if key.is_empty() {
            return true;
        }
        let now = self.clock.now();
        let mut last_sent = self.last_sent.lock().expect("cooldown lock poisoned");
        match last_sent.get(key) {
            Some(&last) if now - last <= self.seconds => false,
            _ => {
                last_sent.insert(key.to_string(), now);
                true
            }
        }
    }
}

fn render_fields(title: &str, fields: &[(&str, String)]) -> String {
    let mut parts = vec![title.to_string()];
    for (label, value) in fields {
        if value.is_empty() {
            continue;
        }
        parts.push(format!("{label}: {value}"));
    }
    parts.join("\n")
}

fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "-".to_string())
}

// =============================================================================
// MATTERMOST
// =============================================================================

/// Mattermost incoming-webhook sink.
pub struct MattermostSink {
    client: reqwest::Client,
    webhook_url: String,
    channel: String,
    username: String,
    icon_emoji: String,
    enabled: bool,
    cooldown: Cooldown,
}

impl MattermostSink {
    pub fn new(config: &NotifyConfig, clock: Arc<dyn Clock>) -> Self {
        let mm = &config.mattermost;
        Self {
            client: reqwest::Client::builder()
                .timeout(SEND_TIMEOUT)
                .build()
                .unwrap_or_default(),
            webhook_url: mm.webhook_url.clone(),
            channel: mm.channel.clone(),
            username: mm.username.clone(),
            icon_emoji: mm.icon_emoji.clone(),
            enabled: mm.enabled && !mm.webhook_url.is_empty(),
            cooldown: Cooldown::new(config.cooldown_seconds, clock),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, text: String, key: &str) -> bool {
        if !self.enabled || !self.cooldown.should_send(key) {
            return false;
        }

        let body = serde_json::json!({
            "text": text,
            "channel": self.channel,
            "username": self.username,
            "icon_emoji": self.icon_emoji,
        });

        match self.client.post(&self.webhook_url).json(&body).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Mattermost send failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl NotifySink for MattermostSink {
    async fn threat_detected(&self, alert: &Event) -> bool {
        if alert.signature.is_empty() || alert.src_ip.is_none() {
            return false;
        }
        let key = format!("threat:{}:{}", alert.signature, opt(&alert.src_ip));
        let fields = [
            ("Signature", alert.signature.clone()),
            ("Severity", alert.severity.to_string()),
            ("Source IP", opt(&alert.src_ip)),
            ("Destination IP", opt(&alert.dest_ip)),
            ("Protocol", opt(&alert.proto)),
            ("Destination Port", alert.dest_port.map(|p| p.to_string()).unwrap_or_default()),
            ("Timestamp", opt(&alert.timestamp)),
        ];
        self.send(render_fields("⚠️ Sensor detected a new threat", &fields), &key).await
    }

    async fn redirect_change(&self, target_ip: &str, endpoints: &[Endpoint], applied: bool) -> bool {
        let action = if applied { "applied" } else { "removed" };
        let key = format!("redirect:{target_ip}:{action}");
        let ports = if endpoints.is_empty() {
            "all protocols".to_string()
        } else {
            endpoints
                .iter()
                .map(|e| format!("{}/{}", e.protocol, e.port))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let fields = [
            ("Target IP", target_ip.to_string()),
            ("Status", action.to_string()),
            ("Ports", ports),
        ];
        self.send(render_fields("🔁 Traffic diversion change", &fields), &key).await
    }

    async fn mode_change(&self, previous: Mode, current: Mode, average: f64) -> bool {
        let key = format!("mode:{previous}->{current}");
        let fields = [
            ("Previous", previous.to_string()),
            ("Current", current.to_string()),
            ("Average score", format!("{:.2}", average)),
        ];
        self.send(render_fields("🛡️ Defense mode changed", &fields), &key).await
    }
}

// =============================================================================
// NTFY
// =============================================================================

/// Self-hosted ntfy push sink.
pub struct NtfySink {
    client: reqwest::Client,
    base_url: String,
    topic_alert: String,
    topic_info: String,
    token: String,
    enabled: bool,
    cooldown: Cooldown,
}

impl NtfySink {
    pub fn new(config: &NotifyConfig, clock: Arc<dyn Clock>) -> Self {
        let ntfy = &config.ntfy;
        let token = read_token(&ntfy.token_file);
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs_f64(ntfy.timeout_secs.max(0.1)))
                .build()
                .unwrap_or_default(),
            base_url: ntfy.base_url.trim_end_matches('/').to_string(),
            topic_alert: ntfy.topic_alert.clone(),
            topic_info: ntfy.topic_info.clone(),
            enabled: ntfy.enabled && !ntfy.base_url.is_empty() && !token.is_empty(),
            token,
            cooldown: Cooldown::new(config.cooldown_seconds, clock),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, topic: &str, title: &str, body: String, key: &str, priority: u8, tags: &str) -> bool {
        if !self.enabled || topic.is_empty() || !self.cooldown.should_send(key) {
            return false;
        }

        let url = format!("{}/{}", self.base_url, topic);
        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Title", title)
            .header("Priority", priority.to_string())
            .header("Tags", tags)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body);

        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("ntfy send failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl NotifySink for NtfySink {
    async fn threat_detected(&self, alert: &Event) -> bool {
        if alert.signature.is_empty() || alert.src_ip.is_none() {
            return false;
        }
        let key = format!("ntfy:threat:{}:{}", alert.signature, opt(&alert.src_ip));
        let body = [
            format!("Signature: {}", alert.signature),
            format!("Severity: {}", alert.severity),
            format!("Source IP: {}", opt(&alert.src_ip)),
            format!("Destination IP: {}", opt(&alert.dest_ip)),
            format!("Protocol: {}", opt(&alert.proto)),
        ]
        .join("\n");
        self.send(&self.topic_alert, "Sensor detected a new threat", body, &key, 5, "warning,shield")
            .await
    }

    async fn redirect_change(&self, target_ip: &str, endpoints: &[Endpoint], applied: bool) -> bool {
        let status = if applied { "applied" } else { "removed" };
        let key = format!("ntfy:redirect:{target_ip}:{status}");
        let ports = if endpoints.is_empty() {
            "all protocols".to_string()
        } else {
            endpoints
                .iter()
                .map(|e| format!("{}/{}", e.protocol, e.port))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let body = format!("Target IP: {target_ip}\nStatus: {status}\nPorts: {ports}");
        let priority = if applied { 3 } else { 2 };
        self.send(&self.topic_info, "Traffic diversion change", body, &key, priority, "arrows_counterclockwise,network")
            .await
    }

    async fn mode_change(&self, previous: Mode, current: Mode, average: f64) -> bool {
        let key = format!("ntfy:mode:{previous}->{current}");
        let body = format!("Previous: {previous}\nCurrent: {current}\nAverage score: {average:.2}");
        self.send(&self.topic_info, "Defense mode changed", body, &key, 3, "shield").await
    }
}

fn read_token(path: &Path) -> String {
    std::fs::read_to_string(path).map(|s| s.trim().to_string()).unwrap_or_default()
}

// =============================================================================
// COMPOSITE
// =============================================================================

/// Fan-out over every configured backend; sends are independent.
pub struct CompositeNotifier {
    sinks: Vec<Box<dyn NotifySink>>,
}

impl CompositeNotifier {
    pub fn new(sinks: Vec<Box<dyn NotifySink>>) -> Self {
        Self { sinks }
    }

    /// Build the default chain from configuration; None when no backend is
    /// usable so the daemon can skip notification work entirely.
    pub fn from_config(config: &NotifyConfig, clock: Arc<dyn Clock>) -> Option<Self> {
        let mut sinks: Vec<Box<dyn NotifySink>> = Vec::new();

        let mattermost = MattermostSink::new(config, clock.clone());
        if mattermost.enabled() {
            sinks.push(Box::new(mattermost));
        }
        let ntfy = NtfySink::new(config, clock);
        if ntfy.enabled() {
            sinks.push(Box::new(ntfy));
        }

        if sinks.is_empty() {
            None
        } else {
            info!("🔔 Notification chain ready ({} backend(s))", sinks.len());
            Some(Self::new(sinks))
        }
    }

    pub async fn threat_detected(&self, alert: &Event) -> bool {
        let mut sent = false;
        for sink in &self.sinks {
            sent |= sink.threat_detected(alert).await;
        }
        sent
    }

    pub async fn redirect_change(&self, target_ip: &str, endpoints: &[Endpoint], applied: bool) -> bool {
        let mut sent = false;
        for sink in &self.sinks {
            sent |= sink.redirect_change(target_ip, endpoints, applied).await;
        }
        sent
    }

    pub async fn mode_change(&self, previous: Mode, current: Mode, average: f64) -> bool {
        let mut sent = false;
        for sink in &self.sinks {
            sent |= sink.mode_change(previous, current, average).await;
        }
        sent
    }
}
