use std::time::Duration;

use base64::{prelude::BASE64_STANDARD, Engine};
use serde_json::Value;
use time::OffsetDateTime;

/// Credential used to resume a conference session after a transport reconnect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectionTicket {
    raw: String,
    not_after_ms: Option<i64>,
}

impl ReconnectionTicket {
    /// Never fails: a ticket whose expiry cannot be decoded is still usable,
    /// it is just refreshed on the fallback schedule.
    pub fn parse(raw: &str) -> Self {
        let not_after_ms = BASE64_STANDARD
            .decode(raw.trim())
            .ok()
            .and_then(|json| serde_json::from_slice::<Value>(&json).ok())
            .and_then(|json| match json.get("notAfter")? {
                Value::Number(x) => x.as_i64(),
                Value::String(x) => x.parse().ok(),
                _ => None,
            });
        Self {
            raw: raw.to_owned(),
            not_after_ms,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn not_after_ms(&self) -> Option<i64> {
        self.not_after_ms
    }

    pub fn refresh_delay(&self, now_ms: i64, fallback: Duration) -> Duration {
        match self.not_after_ms {
            Some(not_after) if not_after > now_ms => {
                Duration::from_millis((not_after - now_ms) as u64)
            }
            _ => fallback,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.not_after_ms, Some(not_after) if not_after <= now_ms)
    }
}

pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
pub(crate) fn encode_ticket(not_after_ms: i64) -> String {
    BASE64_STANDARD.encode(
        serde_json::json!({ "participantId": "p", "notAfter": not_after_ms }).to_string(),
    )
}
