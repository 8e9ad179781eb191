//! Offline book reconstruction.
//!
//! The book at time `t` is the latest checkpoint taken at or before `t` with
//! every persisted change in `[checkpoint, t]` applied in persisted order.
//! A disconnect recorded before the checkpoint and not yet followed by a
//! connect leaves the rebuilt book stale.

use crate::models::{BookChange, CheckpointMarker, Reason, Side};
use crate::storage::SqliteSink;
use anyhow::Result;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::debug;

/// Aggregate price levels per side.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    /// Set by a `disconnect` until the next `connect`.
    stale: bool,
    last_timestamp_ms: Option<i64>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, change: &BookChange) {
        self.last_timestamp_ms = Some(change.timestamp_ms);
        match change.reason {
            // A fresh session re-sends the whole book.
            Reason::Connect => {
                self.bids.clear();
                self.asks.clear();
                self.stale = false;
            }
            Reason::Disconnect => self.stale = true,
            Reason::Place | Reason::Trade | Reason::Cancel | Reason::Initial => {
                let Some(side) = change.side else {
                    return;
                };
                let levels = match side {
                    Side::Bid => &mut self.bids,
                    Side::Ask => &mut self.asks,
                };
                if change.remaining.is_zero() {
                    levels.remove(&change.price);
                } else {
                    levels.insert(change.price, change.remaining);
                }
            }
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn last_timestamp_ms(&self) -> Option<i64> {
        self.last_timestamp_ms
    }

    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next_back().map(|(p, s)| (*p, *s))
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(p, s)| (*p, *s))
    }

    pub fn mid(&self) -> Option<Decimal> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some((bid + ask) / Decimal::TWO)
    }

    pub fn bid_volume(&self) -> Decimal {
        self.bids.values().copied().sum()
    }

    pub fn ask_volume(&self) -> Decimal {
        self.asks.values().copied().sum()
    }

    pub fn level_count(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Top `n` levels: bids best-first (descending), asks best-first (ascending).
    pub fn depth(&self, n: usize) -> (Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>) {
        let bids = self.bids.iter().rev().take(n).map(|(p, s)| (*p, *s)).collect();
        let asks = self.asks.iter().take(n).map(|(p, s)| (*p, *s)).collect();
        (bids, asks)
    }
}

/// A book rebuilt from storage.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub book: OrderBook,
    pub checkpoint: CheckpointMarker,
    pub checkpoint_rows: usize,
    pub changes_applied: usize,
}

/// Rebuild the book as of `at_ms`. `None` if no checkpoint precedes it.
pub fn reconstruct_at(store: &SqliteSink, at_ms: i64) -> Result<Option<Reconstruction>> {
    let Some(checkpoint) = store.latest_checkpoint_at_or_before(at_ms)? else {
        return Ok(None);
    };

    let mut book = OrderBook::new();
    if store.last_lifecycle_before(checkpoint.timestamp_ms)? == Some(Reason::Disconnect) {
        book.stale = true;
    }
    let rows = store.load_checkpoint_rows(&checkpoint)?;
    for row in &rows {
        book.apply(row);
    }

    let changes = store.load_changes_between(checkpoint.timestamp_ms, at_ms)?;
    for record in &changes {
        book.apply(&record.as_change());
    }
    debug!(
        checkpoint_ms = checkpoint.timestamp_ms,
        rows = rows.len(),
        changes = changes.len(),
        "book reconstructed"
    );

    Ok(Some(Reconstruction {
        book,
        checkpoint,
        checkpoint_rows: rows.len(),
        changes_applied: changes.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeRecord;
    use crate::storage::PersistenceSink;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn level(ts: i64, side: Side, price: &str, size: &str, reason: Reason) -> BookChange {
        BookChange::new(ts, side, dec(price), dec(size), reason)
    }

    #[test]
    fn test_apply_sets_and_removes_levels() {
        let mut book = OrderBook::new();
        book.apply(&level(1, Side::Bid, "100", "1", Reason::Initial));
        book.apply(&level(1, Side::Bid, "99.5", "3", Reason::Initial));
        book.apply(&level(1, Side::Ask, "101", "2", Reason::Initial));
        assert_eq!(book.best_bid(), Some((dec("100"), dec("1"))));
        assert_eq!(book.mid(), Some(dec("100.5")));

        book.apply(&level(2, Side::Bid, "100", "0", Reason::Cancel));
        assert_eq!(book.best_bid(), Some((dec("99.5"), dec("3"))));
        book.apply(&level(3, Side::Ask, "101", "0.5", Reason::Trade));
        assert_eq!(book.ask_volume(), dec("0.5"));

        let (bids, asks) = book.depth(5);
        assert_eq!(bids, vec![(dec("99.5"), dec("3"))]);
        assert_eq!(asks, vec![(dec("101"), dec("0.5"))]);
    }

    #[test]
    fn test_lifecycle_markers() {
        let mut book = OrderBook::new();
        book.apply(&level(1, Side::Bid, "100", "1", Reason::Place));
        book.apply(&BookChange::lifecycle(2, Reason::Disconnect));
        assert!(book.is_stale());
        assert_eq!(book.level_count(), (1, 0));

        book.apply(&BookChange::lifecycle(3, Reason::Connect));
        assert!(!book.is_stale());
        assert_eq!(book.level_count(), (0, 0));
        assert_eq!(book.last_timestamp_ms(), Some(3));
    }

    #[test]
    fn test_reconstruct_from_checkpoint_and_changes() {
        let store = SqliteSink::open_memory().unwrap();
        assert!(reconstruct_at(&store, 1_000).unwrap().is_none());

        let marker = CheckpointMarker { timestamp_ms: 100 };
        let rows = vec![
            level(100, Side::Bid, "99", "1", Reason::Initial),
            level(100, Side::Ask, "101", "1", Reason::Initial),
        ];
        store.append_checkpoint_rows(&marker, &rows).unwrap();
        store.append_checkpoint_marker(&marker, rows.len()).unwrap();

        let changes = vec![
            // Before the checkpoint: already reflected in it.
            ChangeRecord::from_change(1, level(50, Side::Bid, "98", "7", Reason::Place)),
            ChangeRecord::from_change(2, level(150, Side::Bid, "100", "2", Reason::Place)),
            ChangeRecord::from_change(3, level(200, Side::Ask, "101", "0", Reason::Cancel)),
        ];
        store.append_changes(&changes).unwrap();

        let at_150 = reconstruct_at(&store, 150).unwrap().unwrap();
        assert_eq!(at_150.checkpoint.timestamp_ms, 100);
        assert_eq!(at_150.changes_applied, 1);
        assert_eq!(at_150.book.best_bid(), Some((dec("100"), dec("2"))));
        assert_eq!(at_150.book.best_ask(), Some((dec("101"), dec("1"))));

        let at_250 = reconstruct_at(&store, 250).unwrap().unwrap();
        assert_eq!(at_250.changes_applied, 2);
        assert_eq!(at_250.book.best_ask(), None);
        assert_eq!(at_250.book.level_count(), (2, 0));
        assert!(!at_250.book.is_stale());
    }

    #[test]
    fn test_disconnect_before_checkpoint_keeps_book_stale() {
        let store = SqliteSink::open_memory().unwrap();
        store
            .append_changes(&[
                ChangeRecord::from_change(1, BookChange::lifecycle(10, Reason::Connect)),
                ChangeRecord::from_change(2, level(20, Side::Bid, "99", "1", Reason::Place)),
                ChangeRecord::from_change(3, BookChange::lifecycle(90, Reason::Disconnect)),
            ])
            .unwrap();

        let marker = CheckpointMarker { timestamp_ms: 100 };
        let rows = vec![level(100, Side::Bid, "99", "1", Reason::Initial)];
        store.append_checkpoint(&marker, &rows).unwrap();

        let at_150 = reconstruct_at(&store, 150).unwrap().unwrap();
        assert_eq!(at_150.changes_applied, 0);
        assert!(at_150.book.is_stale());
        assert_eq!(at_150.book.level_count(), (1, 0));

        // The reader comes back after the checkpoint.
        store
            .append_changes(&[ChangeRecord::from_change(
                4,
                BookChange::lifecycle(200, Reason::Connect),
            )])
            .unwrap();
        let at_250 = reconstruct_at(&store, 250).unwrap().unwrap();
        assert!(!at_250.book.is_stale());
    }
}
