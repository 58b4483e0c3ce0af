//! Persistence bridge: mirrors accepted events into the durable store.
//!
//! The SQLite connection lives on a dedicated blocking worker. Callers talk
//! to it through [`PersistenceBridge`], a handle that sends
//! [`StoreCommand`]s over a bounded channel. Event writes are
//! fire-and-forget: when the queue is full the write is dropped and logged,
//! so ingestion never waits on disk.
//!
//! ```text
//! ingest ──try_send(Write)──▶ ┌──────────────┐
//! clear / load ──send+oneshot▶│ store worker │──▶ SQLite (WAL)
//!                             └──────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `PersistenceError::Closed`

mod store;

pub use store::EventStore;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use hookscope_core::{EventId, HookEvent};

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by the durable store.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Stored event {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Store worker has shut down")]
    Closed,

    #[error("Durable store is not available")]
    Unavailable,
}

// ============================================================================
// Commands
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T, PersistenceError>>;

/// Work items for the store worker.
pub enum StoreCommand {
    /// Upsert one event, then enforce the row limit.
    Write(Box<HookEvent>),
    LoadRecent { limit: usize, respond_to: Reply<Vec<HookEvent>> },
    Get { id: EventId, respond_to: Reply<Option<HookEvent>> },
    Clear { respond_to: Reply<usize> },
    Count { respond_to: Reply<usize> },
    Preference { respond_to: Reply<Option<bool>> },
    SetPreference { enabled: bool, respond_to: Reply<()> },
}

// ============================================================================
// Bridge Handle
// ============================================================================

/// Handle to the durable store worker.
///
/// Dropping the last handle closes the queue; the worker finishes the
/// writes already queued and exits.
pub struct PersistenceBridge {
    sender: mpsc::Sender<StoreCommand>,
    enabled: AtomicBool,
    capacity: usize,
}

impl PersistenceBridge {
    /// Opens the database at `path` and starts the worker.
    pub async fn open(
        path: &Path,
        queue_capacity: usize,
        max_rows: usize,
    ) -> Result<Self, PersistenceError> {
        let path = path.to_path_buf();
        let store = tokio::task::spawn_blocking(move || EventStore::open(&path))
            .await
            .map_err(|_| PersistenceError::Closed)??;
        Ok(Self::spawn(store, queue_capacity, max_rows))
    }

    /// Starts a worker owning `store`. Persistence starts disabled.
    pub fn spawn(store: EventStore, queue_capacity: usize, max_rows: usize) -> Self {
        let capacity = queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        tokio::task::spawn_blocking(move || run_worker(store, receiver, max_rows));
        Self {
            sender,
            enabled: AtomicBool::new(false),
            capacity,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Switches mirroring on or off and remembers the choice.
    ///
    /// Takes effect for events accepted after this call; already queued
    /// writes still complete.
    pub async fn set_enabled(&self, enabled: bool) -> Result<(), PersistenceError> {
        self.enabled.store(enabled, Ordering::Release);
        info!(enabled, "Persistence toggled");
        self.request(|respond_to| StoreCommand::SetPreference {
            enabled,
            respond_to,
        })
        .await
    }

    /// Applies a previously stored preference without writing it back.
    pub(crate) fn restore_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Queues an event write if persistence is enabled.
    ///
    /// Returns true if the write was queued. Never waits.
    pub fn enqueue(&self, event: &HookEvent) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self
            .sender
            .try_send(StoreCommand::Write(Box::new(event.clone())))
        {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event_id = %event.id(), "Persistence queue full, dropping write");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(event_id = %event.id(), "Store worker gone, dropping write");
                false
            }
        }
    }

    /// Writes waiting in the queue.
    pub fn pending_writes(&self) -> usize {
        self.capacity.saturating_sub(self.sender.capacity())
    }

    pub async fn load_recent(&self, limit: usize) -> Result<Vec<HookEvent>, PersistenceError> {
        self.request(|respond_to| StoreCommand::LoadRecent { limit, respond_to })
            .await
    }

    pub async fn get(&self, id: &EventId) -> Result<Option<HookEvent>, PersistenceError> {
        let id = id.clone();
        self.request(|respond_to| StoreCommand::Get { id, respond_to })
            .await
    }

    /// Deletes every stored event. Queued writes ahead of it land first.
    pub async fn clear(&self) -> Result<usize, PersistenceError> {
        self.request(|respond_to| StoreCommand::Clear { respond_to })
            .await
    }

    pub async fn count(&self) -> Result<usize, PersistenceError> {
        self.request(|respond_to| StoreCommand::Count { respond_to })
            .await
    }

    /// Enabled flag remembered from a previous run.
    pub async fn stored_preference(&self) -> Result<Option<bool>, PersistenceError> {
        self.request(|respond_to| StoreCommand::Preference { respond_to })
            .await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> StoreCommand,
    ) -> Result<T, PersistenceError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| PersistenceError::Closed)?;
        rx.await.map_err(|_| PersistenceError::Closed)?
    }
}

// ============================================================================
// Worker
// ============================================================================

fn run_worker(store: EventStore, mut receiver: mpsc::Receiver<StoreCommand>, max_rows: usize) {
    debug!(max_rows, "Store worker started");

    while let Some(command) = receiver.blocking_recv() {
        match command {
            StoreCommand::Write(event) => {
                if let Err(e) = store.upsert(&event) {
                    error!(event_id = %event.id(), error = %e, "Failed to persist event");
                    continue;
                }
                if let Err(e) = store.enforce_row_limit(max_rows) {
                    warn!(error = %e, "Failed to trim durable store");
                }
            }
            StoreCommand::LoadRecent { limit, respond_to } => {
                let _ = respond_to.send(store.load_recent(limit));
            }
            StoreCommand::Get { id, respond_to } => {
                let _ = respond_to.send(store.get(&id));
            }
            StoreCommand::Clear { respond_to } => {
                let result = store.clear();
                if let Ok(removed) = &result {
                    info!(removed, "Cleared durable store");
                }
                let _ = respond_to.send(result);
            }
            StoreCommand::Count { respond_to } => {
                let _ = respond_to.send(store.count());
            }
            StoreCommand::Preference { respond_to } => {
                let _ = respond_to.send(store.persistence_preference());
            }
            StoreCommand::SetPreference {
                enabled,
                respond_to,
            } => {
                let _ = respond_to.send(store.set_persistence_preference(enabled));
            }
        }
    }

    debug!("Store worker stopped");
}
