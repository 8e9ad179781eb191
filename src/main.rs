//! book-monitor
//!
//! Records an exchange order-book change feed to SQLite with periodic
//! checkpoints. Type `help` on stdin for commands; `exit`, Ctrl+C or closing
//! stdin stops the monitor after a final flush.
//!
//! Usage:
//!   book-monitor --config book_monitor.toml
//!   RUST_LOG=book_monitor=debug book-monitor

use anyhow::{Context, Result};
use book_monitor::control::{self, ControlExit};
use book_monitor::feed::WsTransport;
use book_monitor::storage::SqliteSink;
use book_monitor::{MonitorConfig, MonitorService};
use clap::Parser;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "book-monitor")]
#[command(about = "Record an exchange order-book change feed with periodic checkpoints")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, env = "BOOK_MONITOR_CONFIG", default_value = "book_monitor.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let config = MonitorConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    let sink = SqliteSink::open(&config.storage).context("Failed to open book store")?;
    info!(run_id = %sink.run_id(), db = %config.storage.database_path, "book store ready");

    let transport = Arc::new(WsTransport::new(config.connect_timeout()));
    let sink = Arc::new(sink);
    let service = MonitorService::new(config, sink.clone(), transport);
    let running = service.start();

    println!("book-monitor running. Type 'help' for commands.");
    let lines = control::spawn_stdin_reader();
    let mut stdout = std::io::stdout();
    tokio::select! {
        exit = control::run_control_loop(lines, &mut stdout) => match exit {
            ControlExit::ExitCommand => info!("exit requested"),
            ControlExit::InputClosed => warn!("stdin closed, shutting down"),
        },
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "ctrl-c handler failed, shutting down");
            } else {
                info!("ctrl-c received");
            }
        }
    }

    let report = running.coordinator.shutdown().await?;
    info!(
        feed = %running.reader.stats().summary(),
        flush = %running.flush.stats().summary(),
        checkpoints = %running.checkpoints.stats().summary(),
        store = %sink.stats().summary(),
        final_flush_rows = report.final_flush_rows,
        "monitor stopped"
    );
    if !report.workers_panicked.is_empty() {
        error!(workers = ?report.workers_panicked, "workers panicked during run");
    }

    println!("Program terminated.");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "book_monitor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Crate-root .env when run from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
