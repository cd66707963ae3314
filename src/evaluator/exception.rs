//! Exception matcher: the deterministic first evaluation stage.
//!
//! Two constant-time tests against each incoming event, in order: source
//! address in the configured denylist, then critical-pattern substring in the
//! signature (case-insensitive). A hit short-circuits the rest of the
//! pipeline with a fixed block verdict.

use std::collections::HashSet;

use tracing::warn;

use crate::config::SocConfig;
use crate::types::{Event, ScoreResult};

#[derive(Debug, Clone)]
pub struct ExceptionMatcher {
    denylist: HashSet<String>,
    /// Upper-cased critical-pattern substrings
    critical_patterns: Vec<String>,
}

impl ExceptionMatcher {
    pub fn new(soc: &SocConfig) -> Self {
        Self {
            denylist: soc.denylist_ips.iter().cloned().collect(),
            critical_patterns: soc
                .critical_signatures
                .iter()
                .map(|p| p.to_ascii_uppercase())
                .collect(),
        }
    }

    /// Check an event against the exception lists.
    pub fn check(&self, event: &Event) -> Option<ScoreResult> {
        if let Some(src_ip) = &event.src_ip {
            if self.denylist.contains(src_ip) {
                warn!("Exception block: denylisted source {}", src_ip);
                return Some(ScoreResult::exception());
            }
        }

        if !event.signature.is_empty() {
            let signature_upper = event.signature.to_ascii_uppercase();
            for pattern in &self.critical_patterns {
                if signature_upper.contains(pattern.as_str()) {
                    warn!("Exception block: critical signature {:?}", event.signature);
                    return Some(ScoreResult::exception());
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionHint, EvalMethod};

    fn soc() -> SocConfig {
        SocConfig {
            denylist_ips: vec!["192.168.1.100".to_string()],
            critical_signatures: vec!["metasploit".to_string(), "Cobalt Strike".to_string()],
            ..SocConfig::default()
        }
    }

    fn alert(src_ip: &str, signature: &str) -> Event {
        Event {
            signature: signature.to_string(),
            src_ip: Some(src_ip.to_string()),
            ..Event::synthetic("alert")
        }
    }

    #[test]
    fn test_denylisted_source_hits() {
        let matcher = ExceptionMatcher::new(&soc());
        let result = matcher.check(&alert("192.168.1.100", "anything at all")).unwrap();
        assert_eq!(result.score, 95);
        assert_eq!(result.method, EvalMethod::Exception);
        assert_eq!(result.action, ActionHint::Block);
    }

    #[test]
    fn test_critical_signature_case_insensitive() {
        let matcher = ExceptionMatcher::new(&soc());
        assert!(matcher.check(&alert("10.0.0.1", "ET EXPLOIT METASPLOIT payload")).is_some());
        assert!(matcher.check(&alert("10.0.0.1", "cobalt strike beacon")).is_some());
    }

    #[test]
    fn test_no_wildcards_in_denylist() {
        let matcher = ExceptionMatcher::new(&soc());
        // Exact set membership only
        assert!(matcher.check(&alert("192.168.1.101", "benign")).is_none());
        assert!(matcher.check(&alert("192.168.1.10", "benign")).is_none());
    }

    #[test]
    fn test_clean_event_passes() {
        let matcher = ExceptionMatcher::new(&soc());
        assert!(matcher.check(&alert("10.0.0.1", "ET SCAN nmap probe")).is_none());
        assert!(matcher.check(&Event::synthetic("decay_tick")).is_none());
    }
}
