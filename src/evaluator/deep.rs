//! Remote deep evaluator.
//!
//! Optional third evaluation stage: a compact prompt built from the
//! signature, a category hint and the destination host is POSTed to an
//! LLM-style HTTP service, and one JSON object is extracted from the free-text
//! response with progressively looser patterns. Every failure mode (HTTP
//! error, timeout, unparseable response) lands in a deterministic
//! keyword-based fallback, so a deep-stage result is never missing.

use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AiConfig;
use crate::types::{clamp_score, ActionHint, EvalMethod, Event, ScoreResult, ThreatCategory};

/// Keyword tiers used by the fallback scorer.
const CRITICAL_KEYWORDS: [&str; 6] = ["malware", "c2", "c&c", "botnet", "ransomware", "trojan"];
const HIGH_KEYWORDS: [&str; 5] = ["exploit", "attack", "brute", "injection", "vulnerability"];
const MEDIUM_KEYWORDS: [&str; 4] = ["suspicious", "anomaly", "reconnaissance", "scan"];

/// Hostnames that are malicious on sight.
const BAD_DOMAINS: [&str; 3] = ["malware-c2", "botnet", "phishing"];

pub struct DeepEvaluator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    eval_retries: u32,
    json_patterns: Vec<Regex>,
}

impl DeepEvaluator {
    pub fn new(ai: &AiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ai.timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            client,
            endpoint: ai.endpoint.clone(),
            model: ai.model.clone(),
            eval_retries: ai.deep_eval_retries,
            json_patterns: vec![
                Regex::new(r#"(?is)\{[^{}]*"score"\s*:\s*\d+[^{}]*\}"#).expect("score pattern"),
                Regex::new(r#"(?is)\{[^{}]*"risk"\s*:\s*\d+[^{}]*\}"#).expect("risk pattern"),
                Regex::new(r"(?is)\{[^{}]*\}").expect("object pattern"),
            ],
        }
    }

    /// Evaluate with retries and exponential backoff; on exhaustion the
    /// deterministic fallback result is returned instead.
    pub async fn evaluate(&self, event: &Event, hint: Option<ThreatCategory>) -> ScoreResult {
        let mut attempt = 0u32;
        loop {
            match self.evaluate_once(event, hint).await {
                Ok(result) => return result,
                Err(e) if attempt < self.eval_retries => {
                    let wait = 0.5 * f64::from(1u32 << attempt);
                    debug!("Deep eval attempt {} failed ({e}), retrying in {wait}s", attempt + 1);
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("Deep evaluation failed after {} attempts: {e}", attempt + 1);
                    return self.fallback(event, hint);
                }
            }
        }
    }

    async fn evaluate_once(
        &self,
        event: &Event,
        hint: Option<ThreatCategory>,
    ) -> Result<ScoreResult, anyhow::Error> {
        let prompt = self.build_prompt(event, hint);

        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.01,
                "num_predict": 30,
                "top_k": 5,
                "top_p": 0.5
            }
        });

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("deep endpoint returned {}", response.status());
        }

        let data: Value = response.json().await?;
        let raw = data.get("response").and_then(Value::as_str).unwrap_or("");

        match self.extract_json(raw) {
            Some(parsed) => Ok(normalize_response(&parsed)),
            None => {
                debug!("No usable JSON in deep response, using fallback");
                Ok(self.fallback(event, hint))
            }
        }
    }

    fn build_prompt(&self, event: &Event, hint: Option<ThreatCategory>) -> String {
        let signature: String = event.signature.chars().take(50).collect();
        let category = hint.map(|c| c.as_str()).unwrap_or("unknown");
        format!("Analyze: {} Host: {} Category: {}", signature, hostname(event), category)
    }

    /// Search the response body for a JSON object carrying a usable
    /// score/risk field, loosest pattern last.
    fn extract_json(&self, text: &str) -> Option<Value> {
        if text.is_empty() {
            return None;
        }

        if let Ok(direct) = serde_json::from_str::<Value>(text.trim()) {
            if has_usable_score(&direct) {
                return Some(direct);
            }
        }

        for pattern in &self.json_patterns {
            for m in pattern.find_iter(text) {
                if let Ok(parsed) = serde_json::from_str::<Value>(m.as_str()) {
                    if has_usable_score(&parsed) {
                        return Some(parsed);
                    }
                }
            }
        }

        None
    }

    /// Deterministic keyword-based verdict from the same fields the remote
    /// prompt would have seen.
    pub fn fallback(&self, event: &Event, hint: Option<ThreatCategory>) -> ScoreResult {
        let haystack = format!(
            "{} {} {}",
            event.signature,
            hint.map(|c| c.as_str()).unwrap_or(""),
            hostname(event)
        )
        .to_ascii_lowercase();

        let host = hostname(event).to_ascii_lowercase();
        let (score, category, explanation) = if BAD_DOMAINS.iter().any(|d| host.contains(d)) {
            (95, ThreatCategory::Malware, "known hostile domain".to_string())
        } else if let Some(k) = CRITICAL_KEYWORDS.iter().find(|k| haystack.contains(*k)) {
            (85, ThreatCategory::Malware, format!("critical keyword: {k}"))
        } else if let Some(k) = HIGH_KEYWORDS.iter().find(|k| haystack.contains(*k)) {
            (70, hint.unwrap_or(ThreatCategory::Exploit), format!("high-risk keyword: {k}"))
        } else if let Some(k) = MEDIUM_KEYWORDS.iter().find(|k| haystack.contains(*k)) {
            (50, hint.unwrap_or(ThreatCategory::Scan), format!("medium keyword: {k}"))
        } else {
            (30, hint.unwrap_or(ThreatCategory::Unknown), "no known pattern".to_string())
        };

        ScoreResult {
            score,
            category,
            action: ActionHint::from_score(score),
            method: EvalMethod::Fallback,
            confidence: 0.6,
            explanation,
        }
    }
}

/// JSON is usable when it carries a numeric `score` or `risk`.
fn has_usable_score(data: &Value) -> bool {
    data.get("score").map(Value::is_number).unwrap_or(false)
        || data.get("risk").map(Value::is_number).unwrap_or(false)
}

/// Normalize a parsed remote verdict to the standard result shape.
fn normalize_response(data: &Value) -> ScoreResult {
    let score = if let Some(score) = data.get("score").and_then(Value::as_i64) {
        clamp_score(score)
    } else if let Some(risk) = data.get("risk").and_then(Value::as_i64) {
        // Risk 1-5 maps onto 20-100
        if (1..=5).contains(&risk) {
            (risk * 20) as u8
        } else {
            clamp_score(risk)
        }
    } else {
        50
    };

    let explanation: String = data
        .get("explanation")
        .or_else(|| data.get("reason"))
        .and_then(Value::as_str)
        .unwrap_or("remote analysis")
        .chars()
        .take(100)
        .collect();

    let action = data
        .get("action")
        .and_then(Value::as_str)
        .and_then(ActionHint::parse)
        .unwrap_or_else(|| ActionHint::from_score(score));

    let category = data
        .get("category")
        .and_then(Value::as_str)
        .map(ThreatCategory::parse)
        .unwrap_or(ThreatCategory::Unknown);

    ScoreResult {
        score,
        category,
        action,
        method: EvalMethod::Deep,
        confidence: 0.8,
        explanation,
    }
}

fn hostname(event: &Event) -> String {
    event
        .details
        .get("http")
        .and_then(|h| h.get("hostname"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> DeepEvaluator {
        DeepEvaluator::new(&AiConfig {
            endpoint: "http://127.0.0.1:9/api/generate".to_string(),
            timeout_secs: 1,
            deep_eval_retries: 0,
            ..AiConfig::default()
        })
    }

    fn alert(signature: &str) -> Event {
        Event { signature: signature.to_string(), ..Event::synthetic("alert") }
    }

    #[test]
    fn test_extract_json_direct() {
        let e = evaluator();
        let parsed = e.extract_json(r#"{"score": 77, "action": "delay"}"#).unwrap();
        assert_eq!(parsed["score"], 77);
    }

    #[test]
    fn test_extract_json_embedded_in_prose() {
        let e = evaluator();
        let text = r#"Here is my assessment: {"risk": 4, "reason": "c2 traffic"} hope it helps"#;
        let parsed = e.extract_json(text).unwrap();
        assert_eq!(parsed["risk"], 4);
    }

    #[test]
    fn test_extract_json_skips_objects_without_score() {
        let e = evaluator();
        let text = r#"{"note": "no verdict here"} then {"score": 12}"#;
        let parsed = e.extract_json(text).unwrap();
        assert_eq!(parsed["score"], 12);
    }

    #[test]
    fn test_extract_json_rejects_garbage() {
        let e = evaluator();
        assert!(e.extract_json("no json at all").is_none());
        assert!(e.extract_json("").is_none());
        assert!(e.extract_json(r#"{"note": "still no verdict"}"#).is_none());
    }

    #[test]
    fn test_normalize_score_clamped() {
        let r = normalize_response(&serde_json::json!({"score": 250}));
        assert_eq!(r.score, 100);
        let r = normalize_response(&serde_json::json!({"score": -5}));
        assert_eq!(r.score, 0);
    }

    #[test]
    fn test_normalize_risk_mapping() {
        let r = normalize_response(&serde_json::json!({"risk": 1}));
        assert_eq!(r.score, 20);
        let r = normalize_response(&serde_json::json!({"risk": 5}));
        assert_eq!(r.score, 100);
    }

    #[test]
    fn test_normalize_invalid_action_derived_from_score() {
        let r = normalize_response(&serde_json::json!({"score": 85, "action": "nuke"}));
        assert_eq!(r.action, ActionHint::Block);
        let r = normalize_response(&serde_json::json!({"score": 10, "action": "nuke"}));
        assert_eq!(r.action, ActionHint::Allow);
    }

    #[test]
    fn test_normalize_explanation_truncated() {
        let long = "x".repeat(500);
        let r = normalize_response(&serde_json::json!({"score": 50, "explanation": long}));
        assert_eq!(r.explanation.len(), 100);
    }

    #[test]
    fn test_fallback_keyword_tiers() {
        let e = evaluator();
        let r = e.fallback(&alert("ransomware download observed"), None);
        assert_eq!(r.score, 85);
        assert_eq!(r.action, ActionHint::Block);
        assert_eq!(r.method, EvalMethod::Fallback);

        let r = e.fallback(&alert("possible exploit attempt"), None);
        assert_eq!(r.score, 70);

        let r = e.fallback(&alert("suspicious connection"), None);
        assert_eq!(r.score, 50);
        assert_eq!(r.action, ActionHint::Monitor);

        let r = e.fallback(&alert("nothing interesting"), None);
        assert_eq!(r.score, 30);
    }

    #[test]
    fn test_fallback_bad_domain() {
        let e = evaluator();
        let mut event = alert("tls connection");
        event.details = serde_json::json!({"http": {"hostname": "cdn.malware-c2.example"}});
        let r = e.fallback(&event, None);
        assert_eq!(r.score, 95);
        assert_eq!(r.category, ThreatCategory::Malware);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_falls_back() {
        let e = evaluator();
        let r = e.evaluate(&alert("suspicious beacon"), Some(ThreatCategory::Unknown)).await;
        assert_eq!(r.method, EvalMethod::Fallback);
        assert!(r.score <= 100);
    }
}
