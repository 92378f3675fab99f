//! The entry data model shared by every provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Whether an entry names a directory or a file. Immutable after
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Directory,
    File,
}

/// A directory or file as reported by a provider.
///
/// Entries are shared as `Arc<Entry>` once cached and are superseded by new
/// instances on update/move/rename rather than mutated in place. The
/// `with_*` builders configure an entry at construction time; the fallible
/// `set_*` methods refuse to touch a read-only entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    kind: EntryKind,
    id: String,
    name: String,
    read_only: bool,
    size: Option<u64>,
    thumbnail: Option<String>,
    link: Option<String>,
    created: Option<DateTime<Utc>>,
    modified: Option<DateTime<Utc>>,
    owner: Option<String>,
    permissions: Option<String>,
    content_type: Option<String>,
    count: Option<u64>,
}

impl Entry {
    pub fn directory(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(EntryKind::Directory, id, name)
    }

    pub fn file(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(EntryKind::File, id, name)
    }

    fn new(kind: EntryKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Entry {
            kind,
            id: id.into(),
            name: name.into(),
            read_only: false,
            size: None,
            thumbnail: None,
            link: None,
            created: None,
            modified: None,
            owner: None,
            permissions: None,
            content_type: None,
            count: None,
        }
    }

    // Construction-time configuration.

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_thumbnail(mut self, url: impl Into<String>) -> Self {
        self.thumbnail = Some(url.into());
        self
    }

    pub fn with_link(mut self, url: impl Into<String>) -> Self {
        self.link = Some(url.into());
        self
    }

    pub fn with_created(mut self, when: DateTime<Utc>) -> Self {
        self.created = Some(when);
        self
    }

    pub fn with_modified(mut self, when: DateTime<Utc>) -> Self {
        self.modified = Some(when);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    // Accessors.

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnail.as_deref()
    }

    pub fn has_thumbnail(&self) -> bool {
        self.thumbnail
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn permissions(&self) -> Option<&str> {
        self.permissions.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Reported child count, when the provider opts into counts.
    pub fn count(&self) -> Option<u64> {
        self.count
    }

    // Mutation. Refused once the entry is read-only.

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.writable()?;
        self.name = name.into();
        Ok(())
    }

    pub fn set_permissions(&mut self, permissions: impl Into<String>) -> Result<()> {
        self.writable()?;
        self.permissions = Some(permissions.into());
        Ok(())
    }

    /// Best-effort cache-side count patch; saturates at zero. Counts are
    /// advisory, so this is allowed even on read-only entries.
    pub fn adjust_count(&mut self, delta: i64) {
        if let Some(count) = self.count {
            let patched = (count as i64).saturating_add(delta).max(0);
            self.count = Some(patched as u64);
        }
    }

    pub fn mark_read_only(&mut self) {
        self.read_only = true;
    }

    fn writable(&self) -> Result<()> {
        if self.read_only {
            Err(Error::usage("entry is read-only"))
        } else {
            Ok(())
        }
    }
}

/// Capacity information for the backing drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub used: Option<u64>,
    pub total: Option<u64>,
    pub max_upload: Option<u64>,
}

impl Drive {
    pub fn new(used: Option<u64>, total: Option<u64>, max_upload: Option<u64>) -> Self {
        Drive {
            used,
            total,
            max_upload,
        }
    }

    pub fn available(&self) -> Option<u64> {
        match (self.used, self.total) {
            (Some(used), Some(total)) => Some(total.saturating_sub(used)),
            _ => None,
        }
    }
}
