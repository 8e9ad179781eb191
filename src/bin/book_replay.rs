//! Book Replay CLI
//!
//! Rebuilds the order book at a point in time from the recorded checkpoint
//! and change tables and prints the top of book.
//!
//! Usage:
//!   book_replay --config book_monitor.toml --at 1700000000000 --depth 10
//!   book_replay --config book_monitor.toml            # latest recorded state

use anyhow::{Context, Result};
use book_monitor::models::now_ms;
use book_monitor::replay::reconstruct_at;
use book_monitor::storage::SqliteSink;
use book_monitor::MonitorConfig;
use chrono::{TimeZone, Utc};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "book_replay")]
#[command(about = "Reconstruct a recorded order book at a point in time")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, env = "BOOK_MONITOR_CONFIG", default_value = "book_monitor.toml")]
    config: PathBuf,

    /// Epoch milliseconds to reconstruct at (default: now)
    #[arg(long)]
    at: Option<i64>,

    /// Price levels to print per side
    #[arg(long, default_value = "10")]
    depth: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "book_monitor=warn".into()),
        )
        .init();

    let args = Args::parse();
    let config = MonitorConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    let store = SqliteSink::open(&config.storage).context("Failed to open book store")?;

    let at_ms = args.at.unwrap_or_else(now_ms);
    let Some(replayed) = reconstruct_at(&store, at_ms)? else {
        println!("No checkpoint at or before {}", format_ms(at_ms));
        return Ok(());
    };

    let book = &replayed.book;
    println!("=== Book at {} ===", format_ms(at_ms));
    println!(
        "checkpoint: {} ({} rows), changes applied: {}",
        format_ms(replayed.checkpoint.timestamp_ms),
        replayed.checkpoint_rows,
        replayed.changes_applied
    );
    if book.is_stale() {
        println!("WARNING: feed was disconnected at this time; book may be stale");
    }

    let (bids, asks) = book.depth(args.depth);
    println!();
    println!("{:>20} {:>20}", "ASK PRICE", "SIZE");
    for (price, size) in asks.iter().rev() {
        println!("{:>20} {:>20}", price, size);
    }
    println!("{:-^41}", "");
    for (price, size) in &bids {
        println!("{:>20} {:>20}", price, size);
    }
    println!("{:>20} {:>20}", "BID PRICE", "SIZE");
    println!();

    match book.mid() {
        Some(mid) => println!("mid: {}", mid),
        None => println!("mid: n/a (one side empty)"),
    }
    let (bid_levels, ask_levels) = book.level_count();
    println!(
        "bid volume: {} over {} levels, ask volume: {} over {} levels",
        book.bid_volume(),
        bid_levels,
        book.ask_volume(),
        ask_levels
    );

    Ok(())
}

fn format_ms(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => format!("{} ({})", dt.format("%Y-%m-%d %H:%M:%S%.3f UTC"), ms),
        None => ms.to_string(),
    }
}
