//! PII redaction over serialized telemetry events.
//!
//! Credit-card numbers, SSNs, and email addresses are replaced with
//! `[REDACTED]` in every string field before an event reaches the queue.
//! Redaction walks string values rather than the raw JSON text so a large
//! numeric field can never be rewritten into invalid JSON.

use once_cell::sync::Lazy;
use regex::Regex;

use super::TelemetryEvent;

const REPLACEMENT: &str = "[REDACTED]";

static CREDIT_CARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d[ -]?){13,16}\b").expect("credit card pattern compiles")
});

static SSN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn pattern compiles"));

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
        .expect("email pattern compiles")
});

/// Redact one string.
pub fn redact_text(text: &str) -> String {
    let text = CREDIT_CARD.replace_all(text, REPLACEMENT);
    let text = SSN.replace_all(&text, REPLACEMENT);
    EMAIL.replace_all(&text, REPLACEMENT).into_owned()
}

fn redact_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            let redacted = redact_text(s);
            if redacted != *s {
                *s = redacted;
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact_value),
        serde_json::Value::Object(map) => map.values_mut().for_each(redact_value),
        _ => {}
    }
}

/// Redact every string field of a serialized event. Events that fail the
/// round trip (which would indicate a schema bug, not bad input) pass
/// through unredacted rather than being dropped.
pub fn redact_event(event: TelemetryEvent) -> TelemetryEvent {
    let Ok(mut value) = serde_json::to_value(&event) else {
        return event;
    };
    redact_value(&mut value);
    serde_json::from_value(value).unwrap_or(event)
}
