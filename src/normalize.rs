//! Feed message normalization.
//!
//! Turns one raw text frame from the exchange into zero or more
//! [`BookChange`]s. Every kind of malformed input is a recoverable drop:
//! the offending message or entry is counted, logged and skipped.
//!
//! Inbound update shape:
//!
//! ```json
//! {"type":"update","socket_sequence":1,"timestampms":1700000000123,
//!  "events":[{"type":"change","side":"bid","price":"100.5",
//!             "remaining":"2.0","reason":"place"}]}
//! ```

use crate::models::{now_ms, BookChange, Reason, Side};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Which entries a normalizer admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeMode {
    /// Live change stream: every book-mutation reason.
    Stream,
    /// Checkpoint capture: `initial` rows only.
    Checkpoint,
}

/// One parsed `update` message.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedUpdate {
    pub timestamp_ms: i64,
    /// True for the full-book reply that follows the handshake.
    pub snapshot: bool,
    pub changes: Vec<BookChange>,
}

#[derive(Debug, Default)]
pub struct NormalizerStats {
    pub messages: AtomicU64,
    pub updates: AtomicU64,
    pub heartbeats: AtomicU64,
    pub dropped_messages: AtomicU64,
    pub dropped_entries: AtomicU64,
    pub changes: AtomicU64,
}

impl NormalizerStats {
    pub fn summary(&self) -> String {
        format!(
            "messages={} updates={} heartbeats={} changes={} dropped_messages={} dropped_entries={}",
            self.messages.load(Ordering::Relaxed),
            self.updates.load(Ordering::Relaxed),
            self.heartbeats.load(Ordering::Relaxed),
            self.changes.load(Ordering::Relaxed),
            self.dropped_messages.load(Ordering::Relaxed),
            self.dropped_entries.load(Ordering::Relaxed),
        )
    }
}

pub struct EventNormalizer {
    mode: NormalizeMode,
    stats: NormalizerStats,
}

impl EventNormalizer {
    pub fn new(mode: NormalizeMode) -> Self {
        Self {
            mode,
            stats: NormalizerStats::default(),
        }
    }

    pub fn stats(&self) -> &NormalizerStats {
        &self.stats
    }

    /// Normalize a message using the current time as ingestion time.
    pub fn normalize(&self, raw: &str) -> Vec<BookChange> {
        self.parse_update(raw, now_ms())
            .map(|update| update.changes)
            .unwrap_or_default()
    }

    /// Parse a raw frame. Returns `None` for anything that is not an `update`.
    ///
    /// `ingest_ms` is used when the message carries no `timestampms`.
    pub fn parse_update(&self, raw: &str, ingest_ms: i64) -> Option<FeedUpdate> {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);

        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                self.stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, len = raw.len(), "dropping unparseable feed message");
                return None;
            }
        };

        match value.get("type").and_then(Value::as_str) {
            Some("update") => {}
            Some("heartbeat") => {
                self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
                trace!("heartbeat");
                return None;
            }
            other => {
                self.stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
                warn!(msg_type = ?other, "dropping non-update feed message");
                return None;
            }
        }
        self.stats.updates.fetch_add(1, Ordering::Relaxed);

        let embedded_ts = value.get("timestampms").and_then(Value::as_i64);
        let timestamp_ms = embedded_ts.unwrap_or(ingest_ms);
        let snapshot = match value.get("socket_sequence").and_then(Value::as_u64) {
            Some(seq) => seq == 0,
            None => embedded_ts.is_none(),
        };

        let events = match value.get("events").and_then(Value::as_array) {
            Some(events) => events.as_slice(),
            None => {
                warn!("update message without events array");
                &[]
            }
        };

        let mut changes = Vec::with_capacity(events.len());
        for event in events {
            if let Some(change) = self.normalize_event(event, timestamp_ms) {
                changes.push(change);
            }
        }
        self.stats
            .changes
            .fetch_add(changes.len() as u64, Ordering::Relaxed);

        Some(FeedUpdate {
            timestamp_ms,
            snapshot,
            changes,
        })
    }

    fn normalize_event(&self, event: &Value, timestamp_ms: i64) -> Option<BookChange> {
        let event_type = event.get("type").and_then(Value::as_str);
        if event_type != Some("change") {
            // Trade prints and auction events carry no book state.
            debug!(event_type = ?event_type, "skipping non-change event");
            return None;
        }

        let side = match event.get("side").and_then(Value::as_str).map(Side::from_str) {
            Some(Ok(side)) => side,
            other => return self.drop_entry("side", &format!("{:?}", other)),
        };

        let price = match parse_decimal(event.get("price")) {
            Some(p) => p,
            None => return self.drop_entry("price", &field_text(event.get("price"))),
        };
        let remaining = match parse_decimal(event.get("remaining")) {
            Some(r) => r,
            None => return self.drop_entry("remaining", &field_text(event.get("remaining"))),
        };

        let reason = match event
            .get("reason")
            .and_then(Value::as_str)
            .and_then(Reason::from_feed)
        {
            Some(r) => r,
            None => return self.drop_entry("reason", &field_text(event.get("reason"))),
        };

        if self.mode == NormalizeMode::Checkpoint && reason != Reason::Initial {
            self.stats.dropped_entries.fetch_add(1, Ordering::Relaxed);
            warn!(reason = %reason, "dropping non-initial entry from checkpoint snapshot");
            return None;
        }

        Some(BookChange::new(timestamp_ms, side, price, remaining, reason))
    }

    fn drop_entry(&self, field: &'static str, value: &str) -> Option<BookChange> {
        self.stats.dropped_entries.fetch_add(1, Ordering::Relaxed);
        warn!(field, value, "dropping malformed change entry");
        None
    }
}

/// Decimals arrive as strings; bare JSON numbers are accepted too.
fn parse_decimal(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn field_text(value: Option<&Value>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "<missing>".to_string(),
    }
}
