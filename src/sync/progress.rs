//! Progress reporting for sync sessions.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Which side of the transfer a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncRole {
    Sender,
    Receiver,
}

/// Protocol state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Transferring,
    Completed,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "IDLE",
            SyncStatus::Scanning => "SCANNING",
            SyncStatus::Connecting => "CONNECTING",
            SyncStatus::Connected => "CONNECTED",
            SyncStatus::Transferring => "TRANSFERRING",
            SyncStatus::Completed => "COMPLETED",
            SyncStatus::Error => "ERROR",
        }
    }

    /// COMPLETED and ERROR end a session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Completed | SyncStatus::Error)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest `(status, percent, message)` of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub status: SyncStatus,
    pub percent: u8,
    pub message: Option<String>,
}

impl SyncProgress {
    /// Percent is clamped to 100.
    pub fn new(status: SyncStatus, percent: u8, message: impl Into<String>) -> Self {
        Self {
            status,
            percent: percent.min(100),
            message: Some(message.into()),
        }
    }

    pub fn idle() -> Self {
        Self {
            status: SyncStatus::Idle,
            percent: 0,
            message: None,
        }
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::idle()
    }
}

impl fmt::Display for SyncProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>3}%] {}", self.percent, self.status)?;
        if let Some(message) = &self.message {
            write!(f, " {}", message)?;
        }
        Ok(())
    }
}

type Subscriber = Arc<dyn Fn(&SyncProgress) + Send + Sync>;

/// Single-slot progress observer.
///
/// `subscribe` replaces the previous subscriber rather than adding one.
/// `publish` calls the subscriber synchronously, once per call, with no
/// buffering or coalescing.
#[derive(Clone, Default)]
pub struct ProgressNotifier {
    subscriber: Arc<Mutex<Option<Subscriber>>>,
    latest: Arc<Mutex<SyncProgress>>,
}

impl ProgressNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: impl Fn(&SyncProgress) + Send + Sync + 'static) {
        *self.subscriber.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    pub fn unsubscribe(&self) {
        *self.subscriber.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn publish(&self, progress: SyncProgress) {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = progress.clone();
        let subscriber = self
            .subscriber
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(subscriber) = subscriber {
            subscriber(&progress);
        }
    }

    /// Last published value.
    pub fn latest(&self) -> SyncProgress {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
