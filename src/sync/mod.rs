//! Peer-to-peer sync.
//!
//! The orchestrator drives one session at a time in either the sender or
//! the receiver role, calling the storage manager at the right protocol
//! points and publishing every state transition through a
//! [`ProgressNotifier`].

mod context;
mod error;
mod orchestrator;
mod progress;

#[cfg(test)]
mod orchestrator_test;

#[cfg(test)]
pub use context::MockProfileCache;
pub use context::{AppContext, InMemoryProfileCache, ProfileCache};
pub use error::{SyncError, SyncResult};
pub use orchestrator::SyncOrchestrator;
pub use progress::{ProgressNotifier, SyncProgress, SyncRole, SyncStatus};
