//! Daemon Controller
//!
//! Owns the evaluation pipeline, posture machine, enforcer, recorder and
//! notifier, and runs the background timers (decay writer, TTL sweep, trend
//! sampler) plus the asynchronous deep-evaluation worker.
//!
//! Event flow: tailer -> normalizer -> [`process_event`] -> evaluator ->
//! posture machine -> enforcer -> decision log -> notifications. A single
//! process-wide mutex serializes `process_event`, which keeps the decision
//! log strictly append-ordered and makes the posture machine single-owner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::ConfigHandle;
use crate::enforcer::TrafficEnforcer;
use crate::evaluator::ThreatEvaluator;
use crate::notify::{CompositeNotifier, Endpoint};
use crate::posture::PostureMachine;
use crate::recorder::{epoch_now, iso_now, DecisionEntry, DecisionRecorder, FollowupEntry, Snapshot};
use crate::types::{Clock, Event, EvalMethod, Mode, ScoreResult};

/// Bound on the deep follow-up queue; admission control runs at enqueue time.
const DEEP_QUEUE_DEPTH: usize = 64;

pub struct AzazelDaemon {
    config: Arc<ConfigHandle>,
    clock: Arc<dyn Clock>,
    evaluator: ThreatEvaluator,
    machine: Mutex<PostureMachine>,
    enforcer: Arc<TrafficEnforcer>,
    recorder: Arc<DecisionRecorder>,
    notifier: Option<CompositeNotifier>,
    /// Serializes the whole per-event pass
    process_lock: Mutex<()>,
    /// Posture each enforced source currently has applied
    ip_modes: Mutex<HashMap<String, Mode>>,
    /// Sources currently diverted to the honeypot (value: last touch)
    diverted: Mutex<HashMap<String, f64>>,
    /// Monotonic time of the last appended decision line
    last_written_at: std::sync::Mutex<Option<f64>>,
    deep_tx: mpsc::Sender<Event>,
    deep_rx: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl AzazelDaemon {
    pub fn new(
        config: Arc<ConfigHandle>,
        enforcer: Arc<TrafficEnforcer>,
        recorder: Arc<DecisionRecorder>,
        notifier: Option<CompositeNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let snapshot = config.get();
        let (deep_tx, deep_rx) = mpsc::channel(DEEP_QUEUE_DEPTH);
        Self {
            evaluator: ThreatEvaluator::new(&snapshot, clock.clone()),
            machine: Mutex::new(PostureMachine::new(config.clone(), clock.clone())),
            config,
            clock,
            enforcer,
            recorder,
            notifier,
            process_lock: Mutex::new(()),
            ip_modes: Mutex::new(HashMap::new()),
            diverted: Mutex::new(HashMap::new()),
            last_written_at: std::sync::Mutex::new(None),
            deep_tx,
            deep_rx: Mutex::new(Some(deep_rx)),
        }
    }

    /// One-time startup work: shaping hierarchy and diversion recovery.
    pub async fn initialize(&self) -> bool {
        let tc_ok = self.enforcer.initialize().await;
        let pruned = self.enforcer.recover().await;
        if pruned > 0 {
            info!("Startup validation pruned {} stale diversion record(s)", pruned);
        }
        tc_ok
    }

    /// Process one normalized event end to end.
    pub async fn process_event(&self, event: Event) {
        let _guard = self.process_lock.lock().await;

        if event.name == "trend_sample" {
            self.log_trend_snapshot().await;
            return;
        }

        let is_decay = event.name == "decay_tick";
        if !is_decay {
            self.notify_threat(&event).await;
        }

        let result = if is_decay {
            None
        } else {
            Some(self.evaluator.evaluate(&event).await)
        };
        let score = result.as_ref().map(|r| r.score).unwrap_or(0);
        let classification = result
            .as_ref()
            .map(|r| r.category.as_str().to_string())
            .unwrap_or_else(|| "decay".to_string());

        let (previous_mode, evaluation, actions) = {
            let mut machine = self.machine.lock().await;
            let previous = machine.state();
            let evaluation = machine.apply_score(score);
            let actions = machine.actions_preset();
            (previous, evaluation, actions)
        };

        let snapshot = Snapshot {
            mode: evaluation.applied_mode.as_str().to_string(),
            average: evaluation.average,
            timestamp: epoch_now(),
        };
        let entry = DecisionEntry {
            timestamp: iso_now(),
            event: event.name.clone(),
            score: f64::from(score),
            classification,
            average: evaluation.average,
            desired_mode: evaluation.desired_mode.as_str().to_string(),
            target_mode: evaluation.target_mode.as_str().to_string(),
            mode: evaluation.applied_mode.as_str().to_string(),
            actions,
            src_ip: event.src_ip.clone(),
            mode_snapshot: snapshot,
        };
        self.append_entry(&entry);

        if previous_mode != evaluation.applied_mode {
            self.notify_mode_change(previous_mode, evaluation.applied_mode, evaluation.average).await;
        }

        self.handle_enforcement(&event, result.as_ref(), evaluation.applied_mode).await;
        self.maybe_enqueue_deep(&event, result.as_ref());
    }

    /// Drain normalized events until the channel closes or stop flips.
    pub async fn event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<Event>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.process_event(event).await,
                    None => return,
                },
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    }

    // --- enforcement -------------------------------------------------------

    async fn handle_enforcement(
        &self,
        event: &Event,
        result: Option<&ScoreResult>,
        applied_mode: Mode,
    ) {
        let Some(src_ip) = event.src_ip.as_deref() else { return };
        if event.has_ipv6_source() {
            debug!("Skipping enforcement for IPv6 source {}", src_ip);
            return;
        }

        // Exception hits get an immediate drop rule; the block supersedes
        // any per-mode diversion or shaping for this event.
        if result.map(|r| r.method) == Some(EvalMethod::Exception) {
            if self.enforcer.apply_block(src_ip).await {
                warn!("⛔ Exception block applied: {}", src_ip);
            }
            return;
        }

        let current_applied = self.ip_modes.lock().await.get(src_ip).copied();

        match applied_mode.base() {
            Mode::Normal => {
                // Return to normal drops every rule this source accumulated
                self.enforcer.remove_rules_for_ip(src_ip).await;
                self.ip_modes.lock().await.remove(src_ip);
                if self.diverted.lock().await.remove(src_ip).is_some() {
                    let endpoints = self.event_endpoints(event);
                    self.notify_redirect(src_ip, &endpoints, false).await;
                }
            }
            Mode::Portal => {
                // Portal relies solely on diversion; drop any shaping left
                // over from a stricter mode and re-divert quietly.
                if current_applied.is_some() {
                    self.enforcer.remove_rules_for_ip(src_ip).await;
                    self.ip_modes.lock().await.remove(src_ip);
                    self.diverted.lock().await.remove(src_ip);
                    self.ensure_diversion(src_ip, event, false).await;
                } else {
                    self.ensure_diversion(src_ip, event, true).await;
                }
            }
            mode @ (Mode::Shield | Mode::Lockdown) => {
                self.ensure_diversion(src_ip, event, true).await;
                if current_applied == Some(mode) {
                    return;
                }
                if current_applied.is_some() {
                    self.enforcer.remove_rules_for_ip(src_ip).await;
                    self.ip_modes.lock().await.remove(src_ip);
                }
                if self.enforcer.apply_combined_action(src_ip, mode).await {
                    self.ip_modes.lock().await.insert(src_ip.to_string(), mode);
                }
            }
            _ => {}
        }
    }

    /// Divert a source to the honeypot once, announcing the first diversion.
    async fn ensure_diversion(&self, src_ip: &str, event: &Event, announce: bool) {
        let now = self.clock.now();
        {
            let mut diverted = self.diverted.lock().await;
            if let Some(touch) = diverted.get_mut(src_ip) {
                *touch = now;
                return;
            }
        }

        if self.enforcer.apply_dnat_redirect(src_ip, event.dest_port).await {
            self.diverted.lock().await.insert(src_ip.to_string(), now);
            if announce {
                let endpoints = self.event_endpoints(event);
                self.notify_redirect(src_ip, &endpoints, true).await;
            }
        }
    }

    /// Endpoints involved in a diversion: the event's own target when known,
    /// otherwise the configured honeypot service ports.
    fn event_endpoints(&self, event: &Event) -> Vec<Endpoint> {
        if let Some(port) = event.dest_port {
            let protocol = event.proto.clone().unwrap_or_else(|| "tcp".to_string());
            return vec![Endpoint { protocol, port }];
        }
        self.config.get().canary.ports.iter().map(|&p| Endpoint::tcp(p)).collect()
    }

    // --- synthetic events and timers ---------------------------------------

    async fn log_trend_snapshot(&self) {
        let (metrics, mode, actions) = {
            let machine = self.machine.lock().await;
            (machine.metrics(), machine.state(), machine.actions_preset())
        };

        let snapshot = Snapshot {
            mode: mode.as_str().to_string(),
            average: metrics.ewma,
            timestamp: epoch_now(),
        };
        let entry = DecisionEntry {
            timestamp: iso_now(),
            event: "trend_sample".to_string(),
            score: metrics.ewma,
            classification: "trend".to_string(),
            average: metrics.ewma,
            desired_mode: mode.as_str().to_string(),
            target_mode: mode.as_str().to_string(),
            mode: mode.as_str().to_string(),
            actions,
            src_ip: None,
            mode_snapshot: snapshot,
        };
        self.append_entry(&entry);
    }

    fn append_entry(&self, entry: &DecisionEntry) {
        self.recorder.append(entry);
        *self.last_written_at.lock().expect("last-written lock") = Some(self.clock.now());
    }

    /// Decay writer: when no entry has been appended for a full check
    /// interval, dispatch a zero-severity tick so the EWMA keeps decaying.
    pub async fn decay_writer(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let check_interval = self.config.get().decay.check_interval_secs.max(0.5);
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(check_interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                res = stop.changed() => if res.is_err() || *stop.borrow() { return },
            }

            let due = {
                let last = *self.last_written_at.lock().expect("last-written lock");
                last.is_some_and(|ts| self.clock.now() - ts >= check_interval)
            };
            if due {
                self.process_event(Event::synthetic("decay_tick")).await;
            }
        }
    }

    /// Trend sampler: periodic display-only snapshot lines.
    pub async fn trend_sampler(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let interval = self.config.get().trend.sample_interval_secs;
        if interval <= 0.0 {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                res = stop.changed() => if res.is_err() || *stop.borrow() { return },
            }
            self.process_event(Event::synthetic("trend_sample")).await;
        }
    }

    /// TTL sweep for enforcement rules.
    pub async fn cleanup_task(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let network = self.config.get().network;
        let mut ticker =
            tokio::time::interval(Duration::from_secs(network.cleanup_interval_seconds.max(5)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                res = stop.changed() => if res.is_err() || *stop.borrow() { return },
            }

            let cleaned = self.enforcer.cleanup_expired_rules(network.max_rule_age_seconds).await;
            if cleaned > 0 {
                // Sources swept by TTL no longer count as diverted
                let mut diverted = self.diverted.lock().await;
                let live = self.enforcer.active_rules().await;
                diverted.retain(|ip, _| live.contains_key(ip));
                self.ip_modes.lock().await.retain(|ip, _| live.contains_key(ip));
            }
        }
    }

    // --- deep follow-up worker ---------------------------------------------

    /// Gate and enqueue a background deep analysis for this event.
    fn maybe_enqueue_deep(&self, event: &Event, result: Option<&ScoreResult>) {
        let Some(result) = result else { return };
        if result.method != EvalMethod::Rule || event.signature.is_empty() {
            return;
        }
        if event.src_ip.is_none() || event.has_ipv6_source() {
            return;
        }
        if !self.evaluator.gate().admit() {
            debug!("Deep follow-up skipped by sampling/rate limit");
            return;
        }
        if self.deep_tx.try_send(event.clone()).is_err() {
            debug!("Deep follow-up queue full, dropping");
        }
    }

    /// Drain the follow-up queue; results land in the decision log tagged
    /// `deep_followup`, with bounded write retries.
    pub async fn deep_worker(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let Some(mut rx) = self.deep_rx.lock().await.take() else { return };
        let persist_retries = self.config.get().ai.deep_persist_retries;

        info!("🔬 Deep analysis worker started");
        loop {
            let event = tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => event,
                    None => return,
                },
                res = stop.changed() => if res.is_err() || *stop.borrow() { return } else { continue },
            };

            let result = self.evaluator.deep_followup(&event).await;
            debug!("Deep follow-up for {:?}: score={}", event.signature, result.score);

            let entry = FollowupEntry::new(&event.signature, event.timestamp.as_deref(), &result);
            let mut attempt = 0u32;
            while !self.recorder.append_followup(&entry) {
                if attempt >= persist_retries {
                    warn!("Giving up persisting deep follow-up after {} attempts", attempt + 1);
                    break;
                }
                let wait = 0.25 * f64::from(1u32 << attempt);
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                attempt += 1;
            }
        }
    }

    // --- notifications -----------------------------------------------------

    async fn notify_threat(&self, event: &Event) {
        if event.signature.is_empty() || event.src_ip.is_none() {
            return;
        }
        if let Some(notifier) = &self.notifier {
            notifier.threat_detected(event).await;
        }
    }

    async fn notify_redirect(&self, target_ip: &str, endpoints: &[Endpoint], applied: bool) {
        if let Some(notifier) = &self.notifier {
            notifier.redirect_change(target_ip, endpoints, applied).await;
        }
    }

    async fn notify_mode_change(&self, previous: Mode, current: Mode, average: f64) {
        if let Some(notifier) = &self.notifier {
            notifier.mode_change(previous, current, average).await;
        }
    }

    // --- one-shot feed -----------------------------------------------------

    /// Drive the pipeline from the `events:` list in the configuration.
    pub async fn process_feed(&self) -> usize {
        let feed = self.config.get().events;
        let count = feed.len();
        for item in feed {
            let event = Event {
                name: item.name,
                severity: item.severity,
                signature: item.signature,
                src_ip: item.src_ip,
                dest_ip: item.dest_ip,
                dest_port: item.dest_port,
                proto: item.proto,
                timestamp: None,
                details: serde_json::Value::Null,
            };
            self.process_event(event).await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AzazelConfig;
    use crate::enforcer::{CommandOutput, FakeRunner, RuleAction};
    use crate::types::ManualClock;

    struct Fixture {
        daemon: Arc<AzazelDaemon>,
        runner: Arc<FakeRunner>,
        clock: Arc<ManualClock>,
        dir: tempfile::TempDir,
    }

    fn fixture_with(mutate: impl FnOnce(&mut AzazelConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AzazelConfig::default();
        config.paths.runtime_dir = dir.path().to_path_buf();
        config.paths.decisions_log = dir.path().join("decisions.log");
        // Deep stage resolves instantly against an unreachable endpoint
        config.ai.endpoint = "http://127.0.0.1:9/api/generate".to_string();
        config.ai.timeout_secs = 1;
        config.ai.deep_eval_retries = 0;
        mutate(&mut config);

        let handle = Arc::new(ConfigHandle::new(config, None));
        let runner = Arc::new(FakeRunner::default());
        let clock = Arc::new(ManualClock::new(0.0));
        let enforcer =
            Arc::new(TrafficEnforcer::new(handle.clone(), runner.clone(), clock.clone()));
        let recorder = Arc::new(DecisionRecorder::new(&handle.get().paths));
        let daemon =
            Arc::new(AzazelDaemon::new(handle, enforcer, recorder, None, clock.clone()));
        Fixture { daemon, runner, clock, dir }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn malware_alert(src_ip: &str) -> Event {
        Event {
            severity: 1,
            signature: "ET MALWARE Trojan.Gen C2 Communication".to_string(),
            src_ip: Some(src_ip.to_string()),
            dest_ip: Some("10.0.0.5".to_string()),
            dest_port: Some(8443),
            proto: Some("tcp".to_string()),
            details: serde_json::json!({ "payload_printable": "POST /gate.php HTTP/1.1" }),
            ..Event::synthetic("alert")
        }
    }

    fn decision_lines(dir: &tempfile::TempDir) -> Vec<serde_json::Value> {
        let content = std::fs::read_to_string(dir.path().join("decisions.log")).unwrap_or_default();
        content.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_malware_alert_escalates_and_diverts() {
        let f = fixture();
        // iptables checks fail so inserts happen
        for _ in 0..4 {
            f.runner.respond_containing("-C", CommandOutput::failure("Bad rule"));
        }

        f.daemon.process_event(malware_alert("203.0.113.9")).await;

        let lines = decision_lines(&f.dir);
        assert_eq!(lines.len(), 1);
        let entry = &lines[0];
        assert!(entry["score"].as_f64().unwrap() >= 60.0);
        assert!(["malware", "exploit"].contains(&entry["classification"].as_str().unwrap()));
        assert!(["shield", "lockdown"].contains(&entry["mode"].as_str().unwrap()));

        assert!(f.daemon.enforcer.has_rule("203.0.113.9", RuleAction::Redirect).await);
    }

    #[tokio::test]
    async fn test_benign_alert_leaves_no_rules() {
        let f = fixture();
        let event = Event {
            severity: 4,
            signature: "ET INFO HTTPS request to legitimate CDN".to_string(),
            src_ip: Some("198.51.100.20".to_string()),
            dest_port: Some(443),
            proto: Some("tcp".to_string()),
            ..Event::synthetic("alert")
        };
        f.daemon.process_event(event).await;

        let lines = decision_lines(&f.dir);
        assert!(lines[0]["score"].as_f64().unwrap() < 50.0);
        assert_eq!(lines[0]["classification"], "benign");
        // Score 14 lands in normal: no diversion, no rules
        assert!(f.daemon.enforcer.active_rules().await.is_empty());
    }

    #[tokio::test]
    async fn test_denylisted_source_gets_blocked() {
        let f = fixture_with(|c| {
            c.soc.denylist_ips = vec!["192.168.1.100".to_string()];
        });
        f.runner.respond_containing("-C", CommandOutput::failure("Bad rule"));

        f.daemon.process_event(malware_alert("192.168.1.100")).await;

        let lines = decision_lines(&f.dir);
        assert_eq!(lines[0]["score"].as_f64().unwrap(), 95.0);
        assert_eq!(lines[0]["classification"], "critical");

        assert!(f.daemon.enforcer.has_rule("192.168.1.100", RuleAction::Block).await);
        // No diversion on the exception path
        assert!(!f.daemon.enforcer.has_rule("192.168.1.100", RuleAction::Redirect).await);

        let persisted: std::collections::HashMap<String, serde_json::Value> =
            serde_json::from_str(
                &std::fs::read_to_string(f.dir.path().join("diversions.json")).unwrap(),
            )
            .unwrap();
        assert_eq!(persisted["192.168.1.100"]["action"], "block");
    }

    #[tokio::test]
    async fn test_ipv6_source_skips_enforcement() {
        let f = fixture();
        f.daemon.process_event(malware_alert("2001:db8::99")).await;

        assert_eq!(decision_lines(&f.dir).len(), 1);
        assert!(f.daemon.enforcer.active_rules().await.is_empty());
        assert_eq!(f.runner.calls_containing("iptables"), 0);
    }

    #[tokio::test]
    async fn test_decay_steps_down_without_skipping() {
        let f = fixture();
        for _ in 0..4 {
            f.runner.respond_containing("-C", CommandOutput::failure("Bad rule"));
        }

        f.daemon.process_event(malware_alert("203.0.113.9")).await;
        {
            let machine = f.daemon.machine.lock().await;
            assert!(matches!(machine.state(), Mode::Shield | Mode::Lockdown));
        }

        // Only low-severity traffic for a long stretch: walk the ladder down
        let mut seen = Vec::new();
        for _ in 0..500 {
            f.clock.advance(10.0);
            f.daemon.process_event(Event::synthetic("decay_tick")).await;
            let mode = f.daemon.machine.lock().await.state();
            if seen.last() != Some(&mode) {
                seen.push(mode);
            }
        }

        assert_eq!(*seen.last().unwrap(), Mode::Normal);
        for pair in seen.windows(2) {
            // One rung at a time, in strictly de-escalating order
            let order = |m: &Mode| match m {
                Mode::Lockdown => 3,
                Mode::Shield => 2,
                Mode::Portal => 1,
                _ => 0,
            };
            assert_eq!(order(&pair[0]) - order(&pair[1]), 1, "skipped a rung: {seen:?}");
        }

        // Decay ticks carry no source; the TTL sweep reclaims the rules
        assert_eq!(f.daemon.enforcer.cleanup_expired_rules(3600).await, 1);
        assert!(f.daemon.enforcer.active_rules().await.is_empty());
    }

    #[tokio::test]
    async fn test_trend_sample_does_not_change_state() {
        let f = fixture();
        for _ in 0..4 {
            f.runner.respond_containing("-C", CommandOutput::failure("Bad rule"));
        }
        f.daemon.process_event(malware_alert("203.0.113.9")).await;
        let before = f.daemon.machine.lock().await.state();

        f.daemon.process_event(Event::synthetic("trend_sample")).await;
        f.daemon.process_event(Event::synthetic("trend_sample")).await;

        assert_eq!(f.daemon.machine.lock().await.state(), before);
        let lines = decision_lines(&f.dir);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1]["event"], "trend_sample");
        assert_eq!(lines[1]["classification"], "trend");
        // Average carried through unchanged
        assert_eq!(lines[1]["average"], lines[2]["average"]);
    }

    #[tokio::test]
    async fn test_repeat_alert_same_mode_applies_once() {
        let f = fixture();
        for _ in 0..8 {
            f.runner.respond_containing("-C", CommandOutput::failure("Bad rule"));
        }

        f.daemon.process_event(malware_alert("203.0.113.9")).await;
        let inserts_after_first = f.runner.calls_containing("-I PREROUTING 1");
        f.clock.advance(1.0);
        f.daemon.process_event(malware_alert("203.0.113.9")).await;

        // Mode unchanged: the combined action is not replayed
        assert_eq!(f.runner.calls_containing("-I PREROUTING 1"), inserts_after_first);
    }

    #[tokio::test]
    async fn test_feed_processing_is_one_shot() {
        let f = fixture_with(|c| {
            c.events = vec![
                crate::config::FeedEvent {
                    name: "alert".to_string(),
                    severity: 1,
                    signature: "ET MALWARE Trojan.Gen".to_string(),
                    src_ip: Some("203.0.113.5".to_string()),
                    ..crate::config::FeedEvent::default()
                },
                crate::config::FeedEvent {
                    name: "alert".to_string(),
                    severity: 4,
                    signature: "ET INFO normal traffic".to_string(),
                    ..crate::config::FeedEvent::default()
                },
            ];
        });
        for _ in 0..4 {
            f.runner.respond_containing("-C", CommandOutput::failure("Bad rule"));
        }

        assert_eq!(f.daemon.process_feed().await, 2);
        assert_eq!(decision_lines(&f.dir).len(), 2);
    }

    #[tokio::test]
    async fn test_deep_budget_never_starves_rule_stage() {
        let f = fixture_with(|c| {
            c.ai.deep_max_per_min = 10;
        });

        // 100 uncertain events: at most 10 reach the deep stage this minute,
        // every one of them still produces a decision line
        for i in 0..100u32 {
            f.clock.advance(0.1);
            let event = Event {
                severity: 3,
                signature: format!("XYZZY frobnication variant {i}"),
                src_ip: Some(format!("203.0.113.{}", i % 250 + 1)),
                proto: Some("tcp".to_string()),
                ..Event::synthetic("alert")
            };
            f.daemon.process_event(event).await;
        }

        assert_eq!(decision_lines(&f.dir).len(), 100);
        assert_eq!(f.daemon.evaluator.gate().tokens_left(), 0);
    }

    #[tokio::test]
    async fn test_exactly_one_entry_per_event() {
        let f = fixture();
        for _ in 0..8 {
            f.runner.respond_containing("-C", CommandOutput::failure("Bad rule"));
        }

        for i in 0..5 {
            f.clock.advance(1.0);
            let mut event = malware_alert("203.0.113.9");
            event.severity = (i % 4 + 1) as u8;
            f.daemon.process_event(event).await;
        }
        assert_eq!(decision_lines(&f.dir).len(), 5);
    }
}
