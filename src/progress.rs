//! Progress notifications
//!
//! The engine reports what it is doing through a single narrow capability, the
//! [`ProgressSink`]. Delivery is best-effort: a sink must never block the
//! caller, and lost messages are acceptable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::project::ProjectId;

/// Severity of a progress message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Success => "success",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Level::Info),
            "success" => Some(Level::Success),
            "warning" => Some(Level::Warning),
            "error" => Some(Level::Error),
            _ => None,
        }
    }
}

/// A single progress message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub time: DateTime<Utc>,
    pub message: String,
    pub level: Level,
    pub project_id: Option<ProjectId>,
}

/// Fire-and-forget receiver of progress messages
pub trait ProgressSink: Send + Sync {
    fn emit(&self, message: &str, level: Level, project_id: Option<ProjectId>);

    fn info(&self, message: &str, project_id: Option<ProjectId>) {
        self.emit(message, Level::Info, project_id);
    }

    fn success(&self, message: &str, project_id: Option<ProjectId>) {
        self.emit(message, Level::Success, project_id);
    }

    fn warning(&self, message: &str, project_id: Option<ProjectId>) {
        self.emit(message, Level::Warning, project_id);
    }

    fn error(&self, message: &str, project_id: Option<ProjectId>) {
        self.emit(message, Level::Error, project_id);
    }
}

/// Forwards progress to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, message: &str, level: Level, project_id: Option<ProjectId>) {
        match level {
            Level::Info | Level::Success => info!(project = ?project_id, "{}", message),
            Level::Warning => warn!(project = ?project_id, "{}", message),
            Level::Error => error!(project = ?project_id, "{}", message),
        }
    }
}

/// Publishes progress on a broadcast channel for live subscribers
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl ProgressSink for BroadcastSink {
    fn emit(&self, message: &str, level: Level, project_id: Option<ProjectId>) {
        // No subscribers is not an error; the message is simply dropped
        let _ = self.sender.send(ProgressEvent {
            time: Utc::now(),
            message: message.to_string(),
            level,
            project_id,
        });
    }
}

/// Fans a message out to several sinks
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn ProgressSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(&mut self, sink: Box<dyn ProgressSink>) {
        self.sinks.push(sink);
    }

    pub fn with_sink(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.add_sink(sink);
        self
    }
}

impl ProgressSink for MultiSink {
    fn emit(&self, message: &str, level: Level, project_id: Option<ProjectId>) {
        for sink in &self.sinks {
            sink.emit(message, level, project_id);
        }
    }
}
