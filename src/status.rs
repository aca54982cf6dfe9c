//! User-facing status: toast-style messages and per-operation progress.
//!
//! Both the pipeline and the fleet synchroniser report through a shared [`StatusHub`].
//! Consumers subscribe to the broadcast channels; a hub with no subscribers simply
//! drops what it is sent.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::contract::ProgressFn;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Success(String),
    Error(String),
    Info(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub operation: String,
    pub fraction: f64,
}

#[derive(Clone)]
pub struct StatusHub {
    messages: broadcast::Sender<Message>,
    progress: broadcast::Sender<ProgressUpdate>,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHub {
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (progress, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { messages, progress }
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.messages.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.progress.subscribe()
    }

    pub fn success(&self, message: impl Into<String>) {
        let _ = self.messages.send(Message::Success(message.into()));
    }

    pub fn info(&self, message: impl Into<String>) {
        let _ = self.messages.send(Message::Info(message.into()));
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(%message, "reporting error to user");
        let _ = self.messages.send(Message::Error(message));
    }

    /// Begin tracking progress for `operation`; reports 0.
    pub fn start(&self, operation: &str) -> ProgressTracker {
        info!(operation, "operation started");
        let tracker = ProgressTracker {
            operation: operation.to_owned(),
            last: Arc::new(Mutex::new(0.0)),
            sender: self.progress.clone(),
        };
        tracker.emit(0.0);
        tracker
    }

    /// Tracker that does not reset the operation to 0 (used for cache hits that
    /// report completion straight away).
    pub fn resume(&self, operation: &str) -> ProgressTracker {
        ProgressTracker {
            operation: operation.to_owned(),
            last: Arc::new(Mutex::new(0.0)),
            sender: self.progress.clone(),
        }
    }
}

/// Reports the progress of one multi-step operation. Every reported fraction is
/// clamped to `[0, 1]` and never lower than the previous one.
#[derive(Clone)]
pub struct ProgressTracker {
    operation: String,
    last: Arc<Mutex<f64>>,
    sender: broadcast::Sender<ProgressUpdate>,
}

impl ProgressTracker {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn report(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        {
            let mut last = self.last.lock();
            if fraction < *last {
                return;
            }
            *last = fraction;
        }
        self.emit(fraction);
    }

    pub fn complete(&self) {
        self.report(1.0);
    }

    /// A callback for a remote sub-call whose own `[0, 1]` progress occupies
    /// `[start, start + width]` of this operation.
    pub fn slice(&self, start: f64, width: f64) -> ProgressFn {
        let tracker = self.clone();
        Arc::new(move |p: f64| tracker.report(start + p.clamp(0.0, 1.0) * width))
    }

    pub fn last(&self) -> f64 {
        *self.last.lock()
    }

    fn emit(&self, fraction: f64) {
        debug!(operation = %self.operation, fraction, "progress");
        let _ = self.sender.send(ProgressUpdate {
            operation: self.operation.clone(),
            fraction,
        });
    }
}
