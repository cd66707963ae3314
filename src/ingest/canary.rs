//! Honeypot log normalization.
//!
//! The honeypot's record formats vary; any JSON object carrying a source
//! address (under one of a few known keys) becomes a `canary` event with
//! severity 0.

use serde_json::Value;
use tracing::debug;

use crate::types::Event;

/// Keys the honeypot is known to use for the peer address.
const SRC_KEYS: [&str; 3] = ["src_ip", "src", "remote_addr"];

/// Keys the honeypot is known to use for the record timestamp.
const TS_KEYS: [&str; 2] = ["timestamp", "time"];

/// Parse one raw honeypot log line into a `canary` event, or drop it.
pub fn parse_canary_line(line: &str) -> Option<Event> {
    let record: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("Skipping malformed honeypot line: {e}");
            return None;
        }
    };

    let obj = record.as_object()?;

    let src_ip = SRC_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(value_to_string)?;

    let timestamp = TS_KEYS.iter().find_map(|k| obj.get(*k)).and_then(value_to_string);

    Some(Event {
        name: "canary".to_string(),
        severity: 0,
        signature: String::new(),
        src_ip: Some(src_ip),
        dest_ip: None,
        dest_port: None,
        proto: None,
        timestamp,
        details: record.clone(),
    })
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
