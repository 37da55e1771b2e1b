//! Observable session log
//!
//! Every accepted or rejected command and every frame in or out is appended
//! here so a front end can render what the charge point did. Entries are
//! kept in arrival order and mirrored to `tracing`.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Live subscribers that fall this far behind start losing entries
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Frame written to the transport
    Sent,
    /// Frame read from the transport
    Received,
    /// Command accepted or request confirmed by the backend
    Accepted,
    /// Command refused by a guard
    Rejected,
    Info,
    /// Protocol anomaly or transport loss
    Failure,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogKind::Sent => "SENT",
            LogKind::Received => "RECV",
            LogKind::Accepted => "OK",
            LogKind::Rejected => "REJECTED",
            LogKind::Info => "INFO",
            LogKind::Failure => "FAIL",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: LogKind,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.format("%H:%M:%S"),
            self.kind,
            self.message
        )
    }
}

/// Bounded append-only log with live subscription
#[derive(Debug)]
pub struct EventLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    live: broadcast::Sender<LogEntry>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(SUBSCRIBER_BUFFER)),
            capacity,
            live,
        }
    }

    pub fn record(&mut self, kind: LogKind, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
        };

        match kind {
            LogKind::Sent | LogKind::Received => debug!("{}", entry.message),
            LogKind::Failure | LogKind::Rejected => warn!("{}", entry.message),
            LogKind::Accepted | LogKind::Info => info!("{}", entry.message),
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());

        // No subscribers is fine
        let _ = self.live.send(entry);
    }

    /// Snapshot, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
