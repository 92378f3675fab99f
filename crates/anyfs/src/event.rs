//! Deferrable events raised by the facade and the credential manager.
//!
//! Listeners are plain synchronous callbacks. A listener that needs the
//! triggering operation to wait takes a deferral from the event before
//! returning and completes it later, typically from a spawned task.

use crate::barrier::{Deferral, Deferrals};
use crate::error::Result;

/// What a change event reports about a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    DirectoryCreated,
    DirectoryUpdated,
    DirectoryCopied,
    DirectoryMoved,
    DirectoryDeleted,
    FileWritten,
    FileUpdated,
    FileCopied,
    FileMoved,
    FileDeleted,
}

/// Raised after a mutating facade operation has updated the caches.
///
/// The operation does not return to its caller until every deferral taken
/// from this event has been completed.
pub struct ChangeEvent {
    kind: ChangeKind,
    id: String,
    parent_id: Option<String>,
    deferrals: Deferrals,
}

impl ChangeEvent {
    pub(crate) fn new(kind: ChangeKind, id: String, parent_id: Option<String>) -> Self {
        ChangeEvent {
            kind,
            id,
            parent_id,
            deferrals: Deferrals::new(),
        }
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// Normalized identifier of the affected entry.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The affected parent directory, when the operation has one (the
    /// target directory for moves and copies).
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn deferral(&self) -> Result<Deferral> {
        self.deferrals.deferral()
    }

    pub(crate) async fn wait(&self) {
        self.deferrals.wait().await;
    }
}

/// Raised after a (global or scoped) cache refresh.
pub struct RefreshedEvent {
    dir_id: Option<String>,
    deferrals: Deferrals,
}

impl RefreshedEvent {
    pub(crate) fn new(dir_id: Option<String>) -> Self {
        RefreshedEvent {
            dir_id,
            deferrals: Deferrals::new(),
        }
    }

    /// `None` for a global refresh, the normalized directory identifier for
    /// a scoped one.
    pub fn dir_id(&self) -> Option<&str> {
        self.dir_id.as_deref()
    }

    pub fn deferral(&self) -> Result<Deferral> {
        self.deferrals.deferral()
    }

    pub(crate) async fn wait(&self) {
        self.deferrals.wait().await;
    }
}

/// Raised by the credential manager when the persisted connection string
/// changes, so a host can store it before the triggering operation returns.
pub struct ConnectionStringEvent {
    connection_string: String,
    deferrals: Deferrals,
}

impl ConnectionStringEvent {
    pub(crate) fn new(connection_string: String) -> Self {
        ConnectionStringEvent {
            connection_string,
            deferrals: Deferrals::new(),
        }
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn deferral(&self) -> Result<Deferral> {
        self.deferrals.deferral()
    }

    pub(crate) async fn wait(&self) {
        self.deferrals.wait().await;
    }
}
