//! Rule/heuristic threat scorer.
//!
//! Second evaluation stage: a weighted ensemble over six features (signature
//! pattern, payload complexity, target criticality, source reputation,
//! temporal frequency, protocol anomaly) producing a 1-5 risk with category
//! and confidence, blended with a severity-seeded additive score and then
//! calibrated with per-category floors. Benign traffic is recognized before
//! any of that and capped low.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::types::{clamp_score, risk_to_score, ActionHint, Clock, EvalMethod, Event, ScoreResult, ThreatCategory};

/// Feature weights of the ensemble; they sum to 1.
const W_SIGNATURE: f64 = 0.40;
const W_PAYLOAD: f64 = 0.15;
const W_TARGET: f64 = 0.15;
const W_REPUTATION: f64 = 0.10;
const W_TEMPORAL: f64 = 0.10;
const W_PROTOCOL: f64 = 0.10;

/// Rolling frequency window (seconds) for the `(signature, src_ip)` ring.
const FREQUENCY_WINDOW_SECS: f64 = 3600.0;

/// Cap on timestamps retained per frequency key.
const FREQUENCY_RING_CAP: usize = 1000;

/// Signatures matching any of these are treated as benign on sight.
const BENIGN_PATTERNS: [&str; 10] = [
    "legitimate",
    "normal",
    "benign",
    "routine",
    "https request",
    "http get",
    "dns query",
    "software update",
    "heartbeat",
    "keepalive",
];

const HIGH_RISK_KEYWORDS: [&str; 7] =
    ["exploit", "malware", "trojan", "backdoor", "shellcode", "injection", "overflow"];

const MEDIUM_RISK_KEYWORDS: [&str; 8] =
    ["dos", "ddos", "flood", "brute", "bruteforce", "scan", "probe", "reconnaissance"];

/// One curated signature-pattern group.
struct PatternGroup {
    category: ThreatCategory,
    base_risk: u8,
    confidence: f64,
    patterns: Vec<Regex>,
}

/// Outcome of the signature feature.
#[derive(Debug, Clone, Copy)]
struct SignatureMatch {
    category: ThreatCategory,
    risk: u8,
    confidence: f64,
}

pub struct RuleScorer {
    groups: Vec<PatternGroup>,
    suspicious_payload: Vec<Regex>,
    hex_escape: Regex,
    reputation_cache: Mutex<HashMap<String, f64>>,
    frequency: Mutex<HashMap<(String, String), VecDeque<f64>>>,
    clock: Arc<dyn Clock>,
}

impl RuleScorer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            groups: load_pattern_groups(),
            suspicious_payload: compile(&[
                r"(?i)\\x[0-9a-f]{2}",
                r"(?i)%[0-9a-f]{2}",
                r"(?i)eval\s*\(",
                r"(?i)exec\s*\(",
                r"(?i)system\s*\(",
                r"(?i)shell_exec",
                r"(?i)base64_decode",
                r"(?i)javascript:",
                r"(?i)<script",
            ]),
            hex_escape: Regex::new(r"(?i)\\x[0-9a-f]{2}").expect("hex escape pattern"),
            reputation_cache: Mutex::new(HashMap::new()),
            frequency: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Score one event. Always returns a result; confidence tells the router
    /// whether the deep stage should be consulted.
    pub fn evaluate(&self, event: &Event) -> ScoreResult {
        let signature = event.signature.to_ascii_lowercase();
        let payload = payload_text(event).to_ascii_lowercase();
        let proto = event.proto.as_deref().unwrap_or("").to_ascii_lowercase();

        let additive = self.additive_score(event, &signature);

        if is_benign(&signature, event.dest_port, event.severity) {
            return ScoreResult {
                score: clamp_score(additive.into()).min(15),
                category: ThreatCategory::Benign,
                action: ActionHint::Allow,
                method: EvalMethod::Rule,
                confidence: 0.9,
                explanation: "benign traffic pattern".to_string(),
            };
        }

        let sig = self.signature_feature(&signature);
        let payload_score = self.payload_feature(&payload);
        let target_score = target_feature(event.dest_port);
        let reputation_score = self.reputation_feature(event.src_ip.as_deref());
        let temporal_score = self.temporal_feature(&event.signature, event.src_ip.as_deref());
        let protocol_score = self.protocol_feature(&proto, event.dest_port, &payload);

        let weighted = f64::from(sig.risk) * W_SIGNATURE
            + payload_score * 3.0 * W_PAYLOAD
            + target_score * 2.0 * W_TARGET
            + reputation_score * 2.0 * W_REPUTATION
            + temporal_score * 2.0 * W_TEMPORAL
            + protocol_score * 2.0 * W_PROTOCOL;
        let risk = (weighted.round() as i64).clamp(1, 5) as u8;

        // Blend the ensemble with the severity-seeded additive estimator,
        // then apply the per-category floors.
        let blended = (0.6 * f64::from(additive) + 0.4 * f64::from(risk_to_score(risk))).round();
        let mut score = clamp_score(blended as i64);
        score = match sig.category {
            ThreatCategory::Exploit | ThreatCategory::Malware | ThreatCategory::Sqli => {
                score.max(60)
            }
            ThreatCategory::Dos | ThreatCategory::Bruteforce => score.max(40),
            _ => score,
        };

        debug!(
            "Rule score for {:?}: additive={} risk={} score={} category={}",
            event.signature, additive, risk, score, sig.category
        );

        ScoreResult {
            score,
            category: sig.category,
            action: ActionHint::from_score(score),
            method: EvalMethod::Rule,
            confidence: sig.confidence,
            explanation: format!("{} pattern ensemble", sig.category),
        }
    }

    // --- features ---------------------------------------------------------

    /// First pattern group whose regexes match wins; groups are ordered by
    /// descending base risk. On a total miss, plain keyword matching over the
    /// same categories, then `unknown`.
    fn signature_feature(&self, signature: &str) -> SignatureMatch {
        for group in &self.groups {
            if group.patterns.iter().any(|p| p.is_match(signature)) {
                return SignatureMatch {
                    category: group.category,
                    risk: group.base_risk,
                    confidence: group.confidence,
                };
            }
        }

        let keyword_tables: [(&[&str], ThreatCategory, u8, f64); 5] = [
            (&["brute", "force", "login", "auth", "password"], ThreatCategory::Bruteforce, 3, 0.7),
            (&["scan", "nmap", "probe", "recon"], ThreatCategory::Scan, 2, 0.7),
            (&["injection", "sql", "xss", "script"], ThreatCategory::Sqli, 4, 0.8),
            (&["malware", "trojan", "virus", "bot"], ThreatCategory::Malware, 5, 0.8),
            (&["dos", "flood", "amplification"], ThreatCategory::Dos, 4, 0.8),
        ];
        for (words, category, risk, confidence) in keyword_tables {
            if words.iter().any(|w| signature.contains(w)) {
                return SignatureMatch { category, risk, confidence };
            }
        }

        SignatureMatch { category: ThreatCategory::Unknown, risk: 1, confidence: 0.5 }
    }

    /// Length buckets, distinct-character spread and suspicious tokens,
    /// normalized to [0, 1].
    fn payload_feature(&self, payload: &str) -> f64 {
        if payload.is_empty() {
            return 0.0;
        }

        let mut score: f64 = 0.0;

        score += match payload.len() {
            l if l > 1000 => 0.3,
            l if l > 500 => 0.2,
            l if l > 100 => 0.1,
            _ => 0.0,
        };

        let unique: HashSet<char> = payload.chars().collect();
        score += match unique.len() {
            u if u > 50 => 0.3,
            u if u > 30 => 0.2,
            _ => 0.0,
        };

        if self.suspicious_payload.iter().any(|p| p.is_match(payload)) {
            score += 0.2;
        }

        score.min(1.0)
    }

    /// Reputation class of the source address, cached per address.
    fn reputation_feature(&self, src_ip: Option<&str>) -> f64 {
        let Some(src_ip) = src_ip else { return 0.5 };

        if let Some(cached) = self.reputation_cache.lock().expect("reputation lock").get(src_ip) {
            return *cached;
        }

        let score = match src_ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => reputation_v4(v4),
            Ok(IpAddr::V6(v6)) => reputation_v6(v6),
            Err(_) => 0.9,
        };

        self.reputation_cache
            .lock()
            .expect("reputation lock")
            .insert(src_ip.to_string(), score);
        score
    }

    /// Rolling count of events with the same `(signature, src_ip)` key within
    /// the last hour, bucketed low/medium/high.
    fn temporal_feature(&self, signature: &str, src_ip: Option<&str>) -> f64 {
        let count = self.record_and_count(signature, src_ip.unwrap_or(""));
        match count {
            c if c > 10 => 0.9,
            c if c > 5 => 0.6,
            _ => 0.3,
        }
    }

    fn record_and_count(&self, signature: &str, src_ip: &str) -> usize {
        let now = self.clock.now();
        let cutoff = now - FREQUENCY_WINDOW_SECS;
        let key = (signature.to_string(), src_ip.to_string());

        let mut frequency = self.frequency.lock().expect("frequency lock");
        let ring = frequency.entry(key).or_default();
        while ring.front().is_some_and(|&ts| ts < cutoff) {
            ring.pop_front();
        }
        if ring.len() == FREQUENCY_RING_CAP {
            ring.pop_front();
        }
        ring.push_back(now);
        ring.len()
    }

    /// Protocol-shape anomalies: HTTP tokens off web ports, binary escapes on
    /// plaintext ports, oversized UDP payloads.
    fn protocol_feature(&self, proto: &str, dest_port: Option<u16>, payload: &str) -> f64 {
        let mut score: f64 = 0.0;

        match proto {
            "tcp" => {
                let port = dest_port.unwrap_or(0);
                if !matches!(port, 80 | 443 | 8080 | 8443) && payload.contains("http") {
                    score += 0.4;
                }
                if matches!(port, 80 | 443 | 22 | 23) && self.hex_escape.is_match(payload) {
                    score += 0.3;
                }
            }
            "udp" => {
                if payload.len() > 1000 {
                    score += 0.5;
                }
            }
            _ => {}
        }

        score.min(1.0)
    }

    /// Severity-seeded additive estimator (0-100) blended with the ensemble.
    fn additive_score(&self, event: &Event, signature: &str) -> u8 {
        let mut score: i64 = match event.severity {
            1 => 25,
            2 => 15,
            3 => 8,
            4 => 3,
            _ => 5,
        };

        if HIGH_RISK_KEYWORDS.iter().any(|k| signature.contains(k)) {
            if ["exploit", "malware", "trojan", "backdoor"].iter().any(|k| signature.contains(k)) {
                score += 30;
            } else {
                score += 25;
            }
        } else if MEDIUM_RISK_KEYWORDS.iter().any(|k| signature.contains(k)) {
            if ["nmap", "scan", "probe", "reconnaissance"].iter().any(|k| signature.contains(k)) {
                score += 20;
            } else if ["dos", "ddos", "flood"].iter().any(|k| signature.contains(k)) {
                score += 15;
            } else if ["brute", "bruteforce", "dictionary"].iter().any(|k| signature.contains(k)) {
                score += 12;
            } else {
                score += 10;
            }
        } else if ["suspicious", "anomal", "unusual"].iter().any(|k| signature.contains(k)) {
            score += 10;
        }

        if let Some(port) = event.dest_port {
            if matches!(port, 22 | 80 | 443 | 3389 | 5432 | 3306 | 1433) {
                score += 8;
            }
        }

        match event.proto.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("tcp") => score += 3,
            Some("icmp") => score += 1,
            _ => {}
        }

        if let Some(metadata) = event.details.get("metadata").and_then(Value::as_object) {
            if metadata.contains_key("attack_target") {
                score += 5;
            }
            if metadata.contains_key("malware_family") || metadata.contains_key("former_category") {
                score += 10;
            }
        }

        // Frequency adder from the same rolling window the ensemble uses
        let count = self.peek_count(&event.signature, event.src_ip.as_deref().unwrap_or(""));
        if count > 5 {
            score += 15;
        } else if count > 2 {
            score += 8;
        }

        clamp_score(score)
    }

    fn peek_count(&self, signature: &str, src_ip: &str) -> usize {
        let now = self.clock.now();
        let cutoff = now - FREQUENCY_WINDOW_SECS;
        let frequency = self.frequency.lock().expect("frequency lock");
        frequency
            .get(&(signature.to_string(), src_ip.to_string()))
            .map(|ring| ring.iter().filter(|&&ts| ts >= cutoff).count())
            .unwrap_or(0)
    }
}

/// Target criticality: per-port table for well-known services, then a coarse
/// low/high split.
fn target_feature(dest_port: Option<u16>) -> f64 {
    match dest_port {
        Some(22) | Some(3389) => 0.9,
        Some(23) => 0.8,
        Some(80) | Some(443) => 0.7,
        Some(5432) | Some(3306) | Some(1433) => 0.8,
        Some(21) | Some(25) => 0.6,
        Some(p) if p > 8000 => 0.4,
        _ => 0.3,
    }
}

fn reputation_v4(ip: Ipv4Addr) -> f64 {
    if ip.is_private() {
        0.3
    } else if ip.is_loopback() || ip.is_link_local() {
        0.2
    } else if ip.is_multicast() || ip.is_broadcast() || ip.is_documentation() || ip.is_unspecified()
    {
        0.8
    } else {
        0.5
    }
}

fn reputation_v6(ip: Ipv6Addr) -> f64 {
    let segments = ip.segments();
    if (segments[0] & 0xfe00) == 0xfc00 {
        // Unique local fc00::/7, the RFC1918 analogue
        0.3
    } else if ip.is_loopback() || (segments[0] & 0xffc0) == 0xfe80 {
        0.2
    } else if ip.is_multicast() || ip.is_unspecified() {
        0.8
    } else {
        0.5
    }
}

fn is_benign(signature: &str, dest_port: Option<u16>, severity: u8) -> bool {
    if BENIGN_PATTERNS.iter().any(|p| signature.contains(p)) {
        return true;
    }

    let risky = HIGH_RISK_KEYWORDS
        .iter()
        .chain(MEDIUM_RISK_KEYWORDS.iter())
        .any(|k| signature.contains(k));

    if dest_port == Some(443) && !risky {
        return true;
    }
    // Sensor severity 4 is its lowest tier
    severity == 4 && !risky
}

fn payload_text(event: &Event) -> String {
    event
        .details
        .get("payload_printable")
        .or_else(|| event.details.get("payload"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("curated pattern must compile"))
        .collect()
}

/// Curated pattern table, ordered by descending base risk so the first match
/// is also the strongest.
fn load_pattern_groups() -> Vec<PatternGroup> {
    vec![
        PatternGroup {
            category: ThreatCategory::Exploit,
            base_risk: 5,
            confidence: 0.95,
            patterns: compile(&[
                r"(?i)buffer\s*overflow",
                r"(?i)stack\s*overflow",
                r"(?i)heap\s*spray",
                r"(?i)shellcode",
                r"(?i)rop\s*chain",
                r"(?i)return\s*oriented",
                r"(?i)use\s*after\s*free",
                r"(?i)double\s*free",
                r"(?i)format\s*string",
            ]),
        },
        PatternGroup {
            category: ThreatCategory::Malware,
            base_risk: 5,
            confidence: 0.85,
            patterns: compile(&[
                r"(?i)beacon|c2|command.*control|bot.*net",
                r"(?i)trojan|backdoor|rootkit|keylogger",
                r"(?i)ransomware|cryptolocker|wannacry",
                r"(?i)payload.*download|stage.*2|dropper",
            ]),
        },
        PatternGroup {
            category: ThreatCategory::Sqli,
            base_risk: 4,
            confidence: 0.90,
            patterns: compile(&[
                r"(?i)('\s*or\s*'1'\s*=\s*'1|'\s*or\s*1\s*=\s*1)",
                r"(?i)union\s*select",
                r"(?i)drop\s*table",
                r"(?i)delete\s*from",
                r"(?i)insert\s*into",
                r"(?i)update\s*.*set",
                r"(?i)exec\s*\(",
                r"(?i)sp_executesql",
                r"(?i)xp_cmdshell",
            ]),
        },
        PatternGroup {
            category: ThreatCategory::Dos,
            base_risk: 4,
            confidence: 0.85,
            patterns: compile(&[
                r"(?i)dos|ddos|flood|amplification",
                r"(?i)syn.*flood|udp.*flood|icmp.*flood",
                r"(?i)slowloris|http.*flood|bandwidth.*exhaust",
            ]),
        },
        PatternGroup {
            category: ThreatCategory::Bruteforce,
            base_risk: 3,
            confidence: 0.80,
            patterns: compile(&[
                r"(?i)brute.*force|dictionary.*attack|password.*spray",
                r"(?i)login.*attempt|auth.*failed|invalid.*credential",
                r"(?i)admin.*admin|root.*root|123456|password",
            ]),
        },
        PatternGroup {
            category: ThreatCategory::Scan,
            base_risk: 2,
            confidence: 0.75,
            patterns: compile(&[
                r"(?i)nmap|masscan|zmap|port.*scan",
                r"(?i)banner.*grab|service.*enum|version.*detect",
                r"(?i)directory.*enum|web.*crawl|spider",
                r"(?i)dns.*enum|subdomain.*enum",
            ]),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualClock;

    fn scorer() -> (RuleScorer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0.0));
        (RuleScorer::new(clock.clone()), clock)
    }

    fn alert(signature: &str, severity: u8) -> Event {
        Event {
            severity,
            signature: signature.to_string(),
            src_ip: Some("203.0.113.9".to_string()),
            proto: Some("tcp".to_string()),
            ..Event::synthetic("alert")
        }
    }

    #[test]
    fn test_malware_signature_scores_high() {
        let (scorer, _) = scorer();
        let mut event = alert("ET MALWARE Trojan.Gen C2 Communication", 1);
        event.details = serde_json::json!({ "payload_printable": "POST /gate.php HTTP/1.1" });

        let result = scorer.evaluate(&event);
        assert!(result.score >= 60, "expected >= 60, got {}", result.score);
        assert!(matches!(result.category, ThreatCategory::Malware | ThreatCategory::Exploit));
        assert!(result.confidence >= 0.7);
        assert_eq!(result.method, EvalMethod::Rule);
    }

    #[test]
    fn test_benign_https_capped_low() {
        let (scorer, _) = scorer();
        let mut event = alert("ET INFO HTTPS request to legitimate CDN", 4);
        event.dest_port = Some(443);

        let result = scorer.evaluate(&event);
        assert!(result.score < 50, "expected < 50, got {}", result.score);
        assert!(result.score <= 15);
        assert_eq!(result.category, ThreatCategory::Benign);
        assert_eq!(result.action, ActionHint::Allow);
    }

    #[test]
    fn test_severity_four_without_risky_keyword_is_benign() {
        let (scorer, _) = scorer();
        let result = scorer.evaluate(&alert("ET POLICY curl user agent observed", 4));
        assert_eq!(result.category, ThreatCategory::Benign);
    }

    #[test]
    fn test_unknown_signature_has_low_confidence() {
        let (scorer, _) = scorer();
        let result = scorer.evaluate(&alert("XYZZY frobnication observed", 3));
        assert_eq!(result.category, ThreatCategory::Unknown);
        assert!((result.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_score_always_in_range() {
        let (scorer, _) = scorer();
        let signatures = [
            "",
            "ET EXPLOIT buffer overflow attempt shellcode",
            "ET SCAN nmap OS detection",
            "ET DOS udp flood amplification",
            "brute force password spray against admin",
            "completely unremarkable text",
        ];
        for (i, sig) in signatures.iter().enumerate() {
            let mut event = alert(sig, (i % 5 + 1) as u8);
            event.dest_port = Some(22);
            let result = scorer.evaluate(&event);
            assert!(result.score <= 100);
        }
    }

    #[test]
    fn test_category_floor_applied() {
        let (scorer, _) = scorer();
        // Low severity keeps the additive small, yet sqli floors at 60
        let result = scorer.evaluate(&alert("union select from users", 2));
        assert_eq!(result.category, ThreatCategory::Sqli);
        assert!(result.score >= 60);
    }

    #[test]
    fn test_frequency_raises_score() {
        let (scorer, clock) = scorer();
        let event = alert("ET SCAN nmap probe", 3);

        let first = scorer.evaluate(&event).score;
        for _ in 0..8 {
            clock.advance(1.0);
            scorer.evaluate(&event);
        }
        clock.advance(1.0);
        let later = scorer.evaluate(&event).score;
        assert!(later > first, "repeat offender should score higher ({later} vs {first})");
    }

    #[test]
    fn test_frequency_window_expires() {
        let (scorer, clock) = scorer();
        for _ in 0..12 {
            assert!(scorer.record_and_count("sig", "1.2.3.4") >= 1);
        }
        assert!(scorer.peek_count("sig", "1.2.3.4") >= 12);

        clock.advance(FREQUENCY_WINDOW_SECS + 1.0);
        assert_eq!(scorer.peek_count("sig", "1.2.3.4"), 0);
        assert_eq!(scorer.record_and_count("sig", "1.2.3.4"), 1);
    }

    #[test]
    fn test_reputation_classes() {
        let (scorer, _) = scorer();
        assert_eq!(scorer.reputation_feature(Some("192.168.1.50")), 0.3);
        assert_eq!(scorer.reputation_feature(Some("127.0.0.1")), 0.2);
        assert_eq!(scorer.reputation_feature(Some("224.0.0.1")), 0.8);
        assert_eq!(scorer.reputation_feature(Some("not-an-ip")), 0.9);
        assert_eq!(scorer.reputation_feature(Some("8.8.8.8")), 0.5);
        assert_eq!(scorer.reputation_feature(Some("fd00::1")), 0.3);
        // Cached second lookup returns the same class
        assert_eq!(scorer.reputation_feature(Some("8.8.8.8")), 0.5);
    }

    #[test]
    fn test_protocol_anomaly_http_off_port() {
        let (scorer, _) = scorer();
        assert!(scorer.protocol_feature("tcp", Some(9999), "http/1.1 get /") > 0.0);
        assert_eq!(scorer.protocol_feature("tcp", Some(80), "http/1.1 get /"), 0.0);
        assert!(scorer.protocol_feature("udp", None, &"A".repeat(1500)) > 0.0);
    }

    #[test]
    fn test_payload_feature_buckets() {
        let (scorer, _) = scorer();
        assert_eq!(scorer.payload_feature(""), 0.0);
        assert!(scorer.payload_feature("eval(atob('...'))") >= 0.2);
        let long: String = "abcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*()_+-=[]{}|;'"
            .chars()
            .cycle()
            .take(1200)
            .collect();
        assert!(scorer.payload_feature(&long) >= 0.6);
    }
}
