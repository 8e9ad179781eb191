//! Scripted in-memory feed transport shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use book_monitor::feed::{FeedSession, FeedTransport};
use book_monitor::{FeedError, MonitorConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One step of a scripted session.
#[derive(Debug, Clone)]
pub enum Step {
    /// Deliver a text frame.
    Message(String),
    /// Fail the read, ending the session.
    ReadError,
}

/// What one `open` call does.
#[derive(Debug, Clone)]
pub enum Script {
    Refuse,
    /// Play the steps, then stay silent until closed.
    Session(Vec<Step>),
}

/// Pops one script per open. Opens past the end are refused.
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            sent: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn refusing() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl FeedTransport for ScriptedTransport {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn FeedSession>, FeedError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().pop_front().unwrap_or(Script::Refuse);
        match script {
            Script::Refuse => Err(FeedError::Connect {
                endpoint: endpoint.to_string(),
                message: "connection refused".to_string(),
            }),
            Script::Session(steps) => Ok(Box::new(ScriptedSession {
                steps: steps.into(),
                closes: Arc::clone(&self.closes),
                sent: Arc::clone(&self.sent),
            })),
        }
    }
}

struct ScriptedSession {
    steps: VecDeque<Step>,
    closes: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl FeedSession for ScriptedSession {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, FeedError> {
        match self.steps.pop_front() {
            Some(Step::Message(text)) => Ok(text),
            Some(Step::ReadError) => Err(FeedError::Read("connection reset".to_string())),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self, _reason: &str) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn msg(text: &str) -> Step {
    Step::Message(text.to_string())
}

/// Config pointing at a scripted endpoint with short timers.
pub fn test_config(database_path: &str) -> MonitorConfig {
    let toml = format!(
        r#"
        [feed]
        url = "wss://feed.test/v1/marketdata/btcusd"
        connect_retry_ms = 1000
        checkpoint_max_attempts = 8

        [recorder]
        flush_interval_ms = 1000
        checkpoint_interval_ms = 3600000

        [storage]
        database_path = "{}"
        "#,
        database_path
    );
    MonitorConfig::from_toml(&toml).expect("test config is valid")
}
