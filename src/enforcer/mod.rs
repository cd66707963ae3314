//! Traffic-Control Enforcer
//!
//! Converges the per-source rule set in the kernel packet filter (iptables)
//! and traffic shaper (tc) to the current posture. Idempotent throughout:
//! shaping commands go through `replace`, packet-filter inserts are preceded
//! by a `check`, deletes tolerate missing objects, and redirect/block rules
//! are persisted with their full deletion spec so a restarted process can
//! still remove them.
//!
//! ## Shaping hierarchy
//!
//! ```text
//! 1:  htb root (default 30)
//! └── 1:1   uplink ceiling
//!     ├── 1:30  default traffic
//!     ├── 1:40  suspect class (low priority, starved bandwidth)
//!     ├── 1:41  delay class (+ netem)
//!     └── 1:42  per-source shaping
//! ```

mod command;
mod persist;

pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use persist::{DiversionRecord, DiversionStore};

#[cfg(test)]
pub use command::fake::FakeRunner;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ConfigHandle;
use crate::types::{is_ipv6_literal, Clock, Mode};

/// Rule kinds this engine installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Delay,
    Shape,
    Block,
    Redirect,
    SuspectQos,
}

/// One installed rule, with everything needed to delete it later.
#[derive(Debug, Clone)]
pub struct ControlRule {
    pub action: RuleAction,
    /// tc class the rule points at, when applicable
    pub classid: Option<&'static str>,
    /// tc filter priority, when applicable
    pub prio: Option<u32>,
    /// Packet-filter deletion record (redirect/block)
    pub record: Option<DiversionRecord>,
    /// Monotonic application time for the TTL sweep
    pub created_at: f64,
}

pub struct TrafficEnforcer {
    config: Arc<ConfigHandle>,
    runner: Arc<dyn CommandRunner>,
    store: DiversionStore,
    /// Guarded bookkeeping only; kernel commands run outside this lock
    rules: Mutex<HashMap<String, Vec<ControlRule>>>,
    clock: Arc<dyn Clock>,
}

impl TrafficEnforcer {
    pub fn new(
        config: Arc<ConfigHandle>,
        runner: Arc<dyn CommandRunner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = DiversionStore::new(config.get().paths.diversions_file());
        Self { config, runner, store, rules: Mutex::new(HashMap::new()), clock }
    }

    fn interface(&self) -> String {
        self.config.get().network.interface
    }

    // --- initialization ----------------------------------------------------

    /// Ensure the shaping hierarchy exists on the egress interface.
    ///
    /// Uses `replace` everywhere so re-running is harmless and pre-existing
    /// objects never fail the setup.
    pub async fn initialize(&self) -> bool {
        let interface = self.interface();
        let uplink = self.config.get().network.uplink_kbps;

        let qdisc_show = self.tc(&["qdisc", "show", "dev", &interface]).await;
        if !qdisc_show.stdout.contains("htb 1:") {
            let res = self
                .tc(&["qdisc", "replace", "dev", &interface, "root", "handle", "1:", "htb", "default", "30"])
                .await;
            if !res.ok() && !res.already_exists() {
                warn!("tc qdisc replace failed (continuing): {}", res.stderr.trim());
            }
        }

        let uplink_rate = format!("{uplink}kbit");
        let default_rate = format!("{}kbit", uplink / 2);
        let suspect_rate = format!("{}kbit", uplink / 10);
        let suspect_ceil = format!("{}kbit", uplink / 5);

        let ok_root = self
            .ensure_class(&interface, "1:1", &["parent", "1:", "classid", "1:1", "htb", "rate", &uplink_rate])
            .await;
        let ok_default = self
            .ensure_class(
                &interface,
                "1:30",
                &["parent", "1:1", "classid", "1:30", "htb", "rate", &default_rate, "ceil", &uplink_rate],
            )
            .await;
        let ok_suspect = self
            .ensure_class(
                &interface,
                "1:40",
                &["parent", "1:1", "classid", "1:40", "htb", "rate", &suspect_rate, "ceil", &suspect_ceil, "prio", "4"],
            )
            .await;

        info!("🚦 TC setup completed for {}", interface);
        ok_root && ok_default && ok_suspect
    }

    async fn ensure_class(&self, interface: &str, classid: &str, args: &[&str]) -> bool {
        let mut cmd = vec!["class", "replace", "dev", interface];
        cmd.extend_from_slice(args);
        let res = self.tc(&cmd).await;
        if res.ok() || res.already_exists() {
            true
        } else {
            warn!("tc class replace failed for {}: {}", classid, res.stderr.trim());
            false
        }
    }

    // --- recovery ----------------------------------------------------------

    /// Rebuild the in-memory map from the persisted diversion file, then
    /// prune every record whose underlying kernel rule is gone.
    ///
    /// Returns the number of pruned records.
    pub async fn recover(&self) -> usize {
        let persisted = self.store.load();
        if persisted.is_empty() {
            return 0;
        }

        info!("📦 Restoring {} persisted diversion record(s)", persisted.len());

        let mut stale: Vec<String> = Vec::new();
        for (ip, record) in &persisted {
            let present = if record.backend == "iptables"
                && matches!(record.action.as_str(), "redirect" | "block")
                && !record.rule_spec.is_empty()
            {
                let mut args =
                    vec!["-t".to_string(), record.table.clone(), "-C".to_string(), record.chain.clone()];
                args.extend(record.rule_spec.iter().cloned());
                self.runner.run("iptables", &args).await.ok()
            } else {
                // Anything else is an obsolete record shape
                false
            };

            if !present {
                stale.push(ip.clone());
            }
        }

        let now = self.clock.now();
        {
            let mut rules = self.rules.lock().await;
            for (ip, record) in &persisted {
                if stale.contains(ip) {
                    continue;
                }
                let action = if record.action == "redirect" {
                    RuleAction::Redirect
                } else {
                    RuleAction::Block
                };
                rules.entry(ip.clone()).or_default().push(ControlRule {
                    action,
                    classid: None,
                    prio: None,
                    record: Some(record.clone()),
                    created_at: now,
                });
            }
        }

        for ip in &stale {
            warn!("Pruning stale diversion record for {}", ip);
            self.store.remove(ip);
        }
        stale.len()
    }

    // --- rule operations ---------------------------------------------------

    /// Introduce a per-source latency bucket. Idempotent per IP.
    pub async fn apply_delay(&self, target_ip: &str, delay_ms: u32) -> bool {
        if self.has_rule(target_ip, RuleAction::Delay).await {
            debug!("Delay already applied to {}, skip", target_ip);
            return true;
        }

        let interface = self.interface();
        let classid = "1:41";

        let class_show = self.tc(&["class", "show", "dev", &interface, "classid", classid]).await;
        if !(class_show.ok() && class_show.stdout.contains(classid)) {
            let res = self
                .tc(&["class", "replace", "dev", &interface, "parent", "1:1", "classid", classid, "htb", "rate", "64kbit", "ceil", "128kbit"])
                .await;
            if !res.ok() && !res.already_exists() {
                warn!("tc class replace failed for {}: {}", classid, res.stderr.trim());
            }
        }

        let qdisc_show = self.tc(&["qdisc", "show", "dev", &interface]).await;
        let has_netem =
            qdisc_show.stdout.contains(&format!("parent {classid}")) && qdisc_show.stdout.contains("netem");
        if !has_netem {
            let delay = format!("{delay_ms}ms");
            let res = self
                .tc(&["qdisc", "replace", "dev", &interface, "parent", classid, "handle", "41:", "netem", "delay", &delay])
                .await;
            if !res.ok() && !res.already_exists() {
                warn!("tc netem replace failed on {}: {}", classid, res.stderr.trim());
            }
        }

        if !self.ensure_source_filter(&interface, target_ip, 1, classid).await {
            return false;
        }

        self.record_rule(
            target_ip,
            ControlRule {
                action: RuleAction::Delay,
                classid: Some(classid),
                prio: Some(1),
                record: None,
                created_at: self.clock.now(),
            },
        )
        .await;

        info!("⏳ Delay {}ms applied to {}", delay_ms, target_ip);
        true
    }

    /// Rate-limit a source to the given bandwidth. Idempotent per IP.
    pub async fn apply_shaping(&self, target_ip: &str, rate_kbps: u32) -> bool {
        if self.has_rule(target_ip, RuleAction::Shape).await {
            debug!("Shaping already applied to {}, skip", target_ip);
            return true;
        }

        let interface = self.interface();
        let classid = "1:42";
        let rate = format!("{rate_kbps}kbit");

        let res = self
            .tc(&["class", "replace", "dev", &interface, "parent", "1:1", "classid", classid, "htb", "rate", &rate, "ceil", &rate])
            .await;
        if !res.ok() && !res.already_exists() {
            warn!("tc class replace failed for shaping {}: {}", classid, res.stderr.trim());
        }

        if !self.ensure_source_filter(&interface, target_ip, 2, classid).await {
            return false;
        }

        self.record_rule(
            target_ip,
            ControlRule {
                action: RuleAction::Shape,
                classid: Some(classid),
                prio: Some(2),
                record: None,
                created_at: self.clock.now(),
            },
        )
        .await;

        info!("📉 Shaping {}kbps applied to {}", rate_kbps, target_ip);
        true
    }

    /// Attach a source to the low-priority suspect class.
    pub async fn apply_suspect_classification(&self, target_ip: &str) -> bool {
        if self.has_rule(target_ip, RuleAction::SuspectQos).await {
            return true;
        }

        let interface = self.interface();
        if !self.ensure_source_filter(&interface, target_ip, 4, "1:40").await {
            return false;
        }

        self.record_rule(
            target_ip,
            ControlRule {
                action: RuleAction::SuspectQos,
                classid: Some("1:40"),
                prio: Some(4),
                record: None,
                created_at: self.clock.now(),
            },
        )
        .await;

        info!("🐌 Suspect classification applied to {}", target_ip);
        true
    }

    /// Divert a source to the honeypot, optionally for one destination port.
    ///
    /// IPv6 sources are refused. At most one redirect rule exists per source.
    pub async fn apply_dnat_redirect(&self, target_ip: &str, dest_port: Option<u16>) -> bool {
        if is_ipv6_literal(target_ip) {
            info!("Skipping DNAT redirect for IPv6 address {}", target_ip);
            return false;
        }

        let canary_ip = self.config.get().canary.ip;

        let mut rule_spec: Vec<String> = vec!["-s".into(), target_ip.to_string()];
        let to_dest = match dest_port {
            Some(port) => {
                rule_spec.extend(["-p".into(), "tcp".into(), "--dport".into(), port.to_string()]);
                format!("{canary_ip}:{port}")
            }
            None => canary_ip.clone(),
        };
        rule_spec.extend(["-j".into(), "DNAT".into(), "--to-destination".into(), to_dest]);

        let record = DiversionRecord {
            backend: "iptables".to_string(),
            table: "nat".to_string(),
            chain: "PREROUTING".to_string(),
            rule_spec: rule_spec.clone(),
            dest_port,
            canary_ip: Some(canary_ip.clone()),
            action: "redirect".to_string(),
        };

        if !self.install_filter_rule(&record).await {
            error!("Failed to apply DNAT redirect for {}", target_ip);
            return false;
        }

        self.record_rule(
            target_ip,
            ControlRule {
                action: RuleAction::Redirect,
                classid: None,
                prio: None,
                record: Some(record.clone()),
                created_at: self.clock.now(),
            },
        )
        .await;
        self.store.upsert(target_ip, record);

        info!(
            "🔁 DNAT redirect: {} -> {}{}",
            target_ip,
            canary_ip,
            dest_port.map(|p| format!(":{p}")).unwrap_or_default()
        );
        true
    }

    /// Install a drop rule for the source. Idempotent; at most one block rule
    /// exists per source.
    pub async fn apply_block(&self, target_ip: &str) -> bool {
        let record = DiversionRecord {
            backend: "iptables".to_string(),
            table: "filter".to_string(),
            chain: "INPUT".to_string(),
            rule_spec: vec!["-s".into(), target_ip.to_string(), "-j".into(), "DROP".into()],
            dest_port: None,
            canary_ip: None,
            action: "block".to_string(),
        };

        if !self.install_filter_rule(&record).await {
            error!("Failed to apply block for {}", target_ip);
            return false;
        }

        self.record_rule(
            target_ip,
            ControlRule {
                action: RuleAction::Block,
                classid: None,
                prio: None,
                record: Some(record.clone()),
                created_at: self.clock.now(),
            },
        )
        .await;
        self.store.upsert(target_ip, record);

        info!("⛔ Block applied to {}", target_ip);
        true
    }

    /// Converge this source's rule set to the given posture.
    pub async fn apply_combined_action(&self, target_ip: &str, mode: Mode) -> bool {
        let mode = mode.base();

        if mode == Mode::Normal {
            info!("Normal mode: removing all rules for {}", target_ip);
            return self.remove_rules_for_ip(target_ip).await;
        }

        let mut success = self.apply_dnat_redirect(target_ip, None).await;

        if mode == Mode::Portal {
            // Portal relies solely on diversion, no QoS on top
            return success;
        }

        if !self.apply_suspect_classification(target_ip).await {
            success = false;
        }

        let preset = self.config.get().actions.for_mode(mode).clone();
        if preset.delay_ms > 0 && !self.apply_delay(target_ip, preset.delay_ms).await {
            success = false;
        }
        if let Some(rate) = preset.shape_kbps {
            if rate > 0 && !self.apply_shaping(target_ip, rate).await {
                success = false;
            }
        }

        if success {
            info!("Combined action applied: {} -> {}", target_ip, mode);
        } else {
            error!("Partial failure in combined action: {} -> {}", target_ip, mode);
        }
        success
    }

    /// Drop every rule installed for this source and clear its persistence.
    pub async fn remove_rules_for_ip(&self, target_ip: &str) -> bool {
        let to_remove = {
            let mut rules = self.rules.lock().await;
            match rules.remove(target_ip) {
                Some(list) => list,
                None => {
                    debug!("No active rules for {}", target_ip);
                    return true;
                }
            }
        };

        let interface = self.interface();
        let mut success = true;

        for rule in to_remove {
            match rule.action {
                RuleAction::Delay | RuleAction::Shape => {
                    let prio = rule.prio.unwrap_or(1).to_string();
                    let res = self
                        .tc(&["filter", "del", "dev", &interface, "protocol", "ip", "parent", "1:", "prio", &prio])
                        .await;
                    if !res.ok() && !res.no_such_object() {
                        warn!("tc filter del failed for {}: {}", target_ip, res.stderr.trim());
                        success = false;
                    }
                    // The suspect class is shared; only private classes go
                    if let Some(classid) = rule.classid.filter(|&c| c != "1:40") {
                        let res = self.tc(&["class", "del", "dev", &interface, "classid", classid]).await;
                        if !res.ok() && !res.no_such_object() {
                            debug!("tc class del {} reported: {}", classid, res.stderr.trim());
                        }
                    }
                }
                RuleAction::SuspectQos => {
                    let res = self
                        .tc(&["filter", "del", "dev", &interface, "protocol", "ip", "parent", "1:", "prio", "4"])
                        .await;
                    if !res.ok() && !res.no_such_object() {
                        warn!("tc suspect filter del failed for {}: {}", target_ip, res.stderr.trim());
                        success = false;
                    }
                }
                RuleAction::Redirect | RuleAction::Block => {
                    if let Some(record) = &rule.record {
                        if self.delete_filter_rule(record).await {
                            self.store.remove(target_ip);
                        } else {
                            success = false;
                        }
                    } else {
                        warn!("No deletion spec stored for {} rule on {}", record_name(rule.action), target_ip);
                        success = false;
                    }
                }
            }
        }

        info!("🧹 Rules removed for {}", target_ip);
        success
    }

    /// Sweep sources whose oldest rule exceeded the age threshold.
    pub async fn cleanup_expired_rules(&self, max_age_seconds: u64) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = {
            let rules = self.rules.lock().await;
            rules
                .iter()
                .filter(|(_, list)| {
                    list.iter()
                        .map(|r| r.created_at)
                        .fold(f64::INFINITY, f64::min)
                        < now - max_age_seconds as f64
                })
                .map(|(ip, _)| ip.clone())
                .collect()
        };

        let mut cleaned = 0;
        for ip in expired {
            if self.remove_rules_for_ip(&ip).await {
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            info!("🧹 Cleaned up {} expired rule set(s)", cleaned);
        }
        cleaned
    }

    /// Snapshot of the active rule map.
    pub async fn active_rules(&self) -> HashMap<String, Vec<ControlRule>> {
        self.rules.lock().await.clone()
    }

    pub async fn has_rule(&self, target_ip: &str, action: RuleAction) -> bool {
        self.rules
            .lock()
            .await
            .get(target_ip)
            .map(|list| list.iter().any(|r| r.action == action))
            .unwrap_or(false)
    }

    // --- internals ---------------------------------------------------------

    async fn tc(&self, args: &[&str]) -> CommandOutput {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner.run("tc", &args).await
    }

    /// Install a tc u32 source filter unless one for this IP already exists.
    async fn ensure_source_filter(
        &self,
        interface: &str,
        target_ip: &str,
        prio: u32,
        classid: &str,
    ) -> bool {
        let filter_show = self.tc(&["filter", "show", "dev", interface, "parent", "1:"]).await;
        if filter_show.stdout.contains(target_ip) {
            debug!("TC filter for {} already exists, skip", target_ip);
            return true;
        }

        let prio = prio.to_string();
        let res = self
            .tc(&["filter", "replace", "dev", interface, "protocol", "ip", "parent", "1:", "prio", &prio, "u32", "match", "ip", "src", target_ip, "flowid", classid])
            .await;
        if res.ok() || res.already_exists() {
            true
        } else {
            warn!("tc filter replace failed for {}: {}", target_ip, res.stderr.trim());
            false
        }
    }

    /// `check` first, then insert at position 1; an already-present rule is
    /// success with the in-memory record reconciled by the caller.
    async fn install_filter_rule(&self, record: &DiversionRecord) -> bool {
        let mut check =
            vec!["-t".to_string(), record.table.clone(), "-C".to_string(), record.chain.clone()];
        check.extend(record.rule_spec.iter().cloned());
        if self.runner.run("iptables", &check).await.ok() {
            debug!("{} rule already present in {}/{}", record.action, record.table, record.chain);
            return true;
        }

        let mut insert = vec![
            "-t".to_string(),
            record.table.clone(),
            "-I".to_string(),
            record.chain.clone(),
            "1".to_string(),
        ];
        insert.extend(record.rule_spec.iter().cloned());
        let res = self.runner.run("iptables", &insert).await;
        if res.ok() {
            true
        } else {
            error!("iptables insert failed: {} {}", res.stderr.trim(), res.stdout.trim());
            false
        }
    }

    /// Delete by the stored specification; a missing rule counts as deleted.
    async fn delete_filter_rule(&self, record: &DiversionRecord) -> bool {
        let mut args =
            vec!["-t".to_string(), record.table.clone(), "-D".to_string(), record.chain.clone()];
        args.extend(record.rule_spec.iter().cloned());
        let res = self.runner.run("iptables", &args).await;
        if res.ok() || res.no_such_object() {
            info!("Removed iptables {} rule ({})", record.action, record.chain);
            true
        } else {
            warn!("iptables delete failed: {}", res.stderr.trim());
            false
        }
    }

    /// Record a rule, keeping at most one entry per packet-filter action.
    async fn record_rule(&self, target_ip: &str, rule: ControlRule) {
        let mut rules = self.rules.lock().await;
        let list = rules.entry(target_ip.to_string()).or_default();
        if matches!(rule.action, RuleAction::Redirect | RuleAction::Block) {
            list.retain(|r| r.action != rule.action);
        }
        list.push(rule);
    }
}

fn record_name(action: RuleAction) -> &'static str {
    match action {
        RuleAction::Delay => "delay",
        RuleAction::Shape => "shape",
        RuleAction::Block => "block",
        RuleAction::Redirect => "redirect",
        RuleAction::SuspectQos => "suspect_qos",
    }
}
