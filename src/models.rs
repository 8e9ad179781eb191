//! Normalized order-book records.
//!
//! `BookChange` is what the normalizer produces from a feed message.
//! `ChangeRecord` is a `BookChange` that has been admitted to the change log
//! and carries its process-wide sequence id.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current wall-clock time in epoch milliseconds.
#[inline]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Side / Reason
// =============================================================================

/// Book side of a price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }
}

impl FromStr for Side {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bid" => Ok(Side::Bid),
            "ask" => Ok(Side::Ask),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a record exists.
///
/// `Connect` and `Disconnect` are connection-lifecycle markers. `Place`,
/// `Trade` and `Cancel` mutate the book. `Initial` rows belong to a full
/// snapshot rather than an incremental change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reason {
    Connect,
    Disconnect,
    Place,
    Trade,
    Cancel,
    Initial,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Connect => "connect",
            Reason::Disconnect => "disconnect",
            Reason::Place => "place",
            Reason::Trade => "trade",
            Reason::Cancel => "cancel",
            Reason::Initial => "initial",
        }
    }

    /// Reasons the exchange itself can put on a `change` event.
    pub fn from_feed(s: &str) -> Option<Self> {
        match s {
            "place" => Some(Reason::Place),
            "trade" => Some(Reason::Trade),
            "cancel" => Some(Reason::Cancel),
            "initial" => Some(Reason::Initial),
            _ => None,
        }
    }

    #[inline]
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Reason::Connect | Reason::Disconnect)
    }
}

impl FromStr for Reason {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(Reason::Connect),
            "disconnect" => Ok(Reason::Disconnect),
            other => Reason::from_feed(other).ok_or_else(|| UnknownValue(other.to_string())),
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A string that did not map onto one of the enumerations above.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value '{0}'")]
pub struct UnknownValue(pub String);

// =============================================================================
// Records
// =============================================================================

/// One normalized book mutation or lifecycle event, not yet sequenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookChange {
    /// Event time in epoch milliseconds.
    pub timestamp_ms: i64,
    /// `None` for lifecycle events.
    pub side: Option<Side>,
    pub price: Decimal,
    /// Remaining size at `price` after the mutation.
    pub remaining: Decimal,
    pub reason: Reason,
}

impl BookChange {
    pub fn new(
        timestamp_ms: i64,
        side: Side,
        price: Decimal,
        remaining: Decimal,
        reason: Reason,
    ) -> Self {
        Self {
            timestamp_ms,
            side: Some(side),
            price,
            remaining,
            reason,
        }
    }

    /// Connection lifecycle marker (zero price and remaining, no side).
    pub fn lifecycle(timestamp_ms: i64, reason: Reason) -> Self {
        debug_assert!(reason.is_lifecycle());
        Self {
            timestamp_ms,
            side: None,
            price: Decimal::ZERO,
            remaining: Decimal::ZERO,
            reason,
        }
    }
}

/// A `BookChange` admitted to the change log.
///
/// Immutable once built: the sequence id defines replay order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub sequence_id: u64,
    pub timestamp_ms: i64,
    pub side: Option<Side>,
    pub price: Decimal,
    pub remaining: Decimal,
    pub reason: Reason,
}

impl ChangeRecord {
    pub fn from_change(sequence_id: u64, change: BookChange) -> Self {
        Self {
            sequence_id,
            timestamp_ms: change.timestamp_ms,
            side: change.side,
            price: change.price,
            remaining: change.remaining,
            reason: change.reason,
        }
    }

    pub fn as_change(&self) -> BookChange {
        BookChange {
            timestamp_ms: self.timestamp_ms,
            side: self.side,
            price: self.price,
            remaining: self.remaining,
            reason: self.reason,
        }
    }
}

/// Marks the capture time of one full-book checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    pub timestamp_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_parsing() {
        assert_eq!(Reason::from_feed("place"), Some(Reason::Place));
        assert_eq!(Reason::from_feed("initial"), Some(Reason::Initial));
        // Lifecycle reasons never come from the exchange.
        assert_eq!(Reason::from_feed("connect"), None);
        assert_eq!("connect".parse::<Reason>(), Ok(Reason::Connect));
        assert!("bogus".parse::<Reason>().is_err());
    }

    #[test]
    fn test_side_round_trip_through_str() {
        for side in [Side::Bid, Side::Ask] {
            assert_eq!(side.as_str().parse::<Side>(), Ok(side));
        }
        assert_eq!(
            "BID".parse::<Side>(),
            Err(UnknownValue("BID".to_string()))
        );
    }

    #[test]
    fn test_lifecycle_record_is_zeroed() {
        let change = BookChange::lifecycle(1_700_000_000_000, Reason::Disconnect);
        let record = ChangeRecord::from_change(7, change.clone());
        assert_eq!(record.side, None);
        assert!(record.price.is_zero());
        assert!(record.remaining.is_zero());
        assert_eq!(record.as_change(), change);
    }
}
