//! The override contracts implemented by storage providers and credential
//! collaborators.
//!
//! A provider implements only the hooks it supports; every capability hook
//! defaults to "not permitted" and every action hook to a `NotSupported`
//! failure, so the facade can gate operations without knowing the backend.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::entry::{Drive, Entry};
use crate::error::{Error, Result};
use crate::ticket::Ticket;

/// Streamed file content.
pub type FileContent = Pin<Box<dyn AsyncRead + Send>>;

/// How a provider addresses its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// Identifiers are hierarchical paths; the parent id is derived by
    /// string manipulation and needs no remote call.
    FullPathAsId,
    /// Identifiers are flat and provider-assigned; parent resolution
    /// requires fetching the item's metadata.
    OpaqueId,
}

/// One search result: the entry plus the directory it was found in.
#[derive(Clone)]
pub struct SearchHit {
    pub directory_id: String,
    pub entry: Arc<Entry>,
}

/// The storage override contract consumed by the facade.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str {
        ""
    }

    fn addressing(&self) -> Addressing {
        Addressing::FullPathAsId
    }

    /// Whether the provider reports child counts that the facade should
    /// keep patched on create/delete/move/copy.
    fn show_count_in_directories(&self) -> bool {
        false
    }

    /// Whether uploaded file names must carry an extension.
    fn file_name_extension_required(&self) -> bool {
        false
    }

    /// Maps a content type to a file extension (with leading dot).
    /// MIME tables live outside this crate; the default knows nothing.
    fn extension_for(&self, _content_type: &str) -> Option<String> {
        None
    }

    // Access.

    async fn check_access(
        &self,
        _dir_id: &str,
        _prompt: bool,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn invalidate_access(&self, _dir_id: &str) -> Result<()> {
        Ok(())
    }

    // Reads.

    async fn drive(&self, _cancel: &CancellationToken) -> Result<Option<Drive>> {
        Ok(None)
    }

    async fn trash_id(&self, _dir_id: &str, _cancel: &CancellationToken) -> Result<Option<String>> {
        Ok(None)
    }

    async fn directories(&self, _dir_id: &str, _cancel: &CancellationToken) -> Result<Vec<Entry>> {
        Ok(Vec::new())
    }

    async fn files(&self, _dir_id: &str, _cancel: &CancellationToken) -> Result<Vec<Entry>> {
        Ok(Vec::new())
    }

    async fn directory(
        &self,
        _dir_id: &str,
        _full: bool,
        _cancel: &CancellationToken,
    ) -> Result<Option<Entry>> {
        Ok(None)
    }

    async fn file(
        &self,
        _file_id: &str,
        _full: bool,
        _cancel: &CancellationToken,
    ) -> Result<Option<Entry>> {
        Ok(None)
    }

    /// Resolves the parent of a directory entry under opaque addressing.
    fn directory_parent_id(&self, _directory: &Entry) -> Result<Option<String>> {
        Err(Error::not_supported("directory_parent_id"))
    }

    /// Resolves the parent of a file entry under opaque addressing.
    fn file_parent_id(&self, _file: &Entry) -> Result<Option<String>> {
        Err(Error::not_supported("file_parent_id"))
    }

    // Capability checks. Entry-derived defaults receive the cached entry.

    fn can_open_directory_thumbnail(&self, directory: Option<&Entry>) -> bool {
        directory.is_some_and(Entry::has_thumbnail)
    }

    fn can_open_file_thumbnail(&self, file: Option<&Entry>) -> bool {
        file.is_some_and(Entry::has_thumbnail)
    }

    fn can_directory_link(&self, directory: Option<&Entry>) -> bool {
        directory.is_some_and(|d| d.link().is_some())
    }

    fn can_file_link(&self, file: Option<&Entry>) -> bool {
        file.is_some_and(|f| f.link().is_some())
    }

    async fn can_open_file(&self, _file_id: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(false)
    }

    async fn can_write_file(&self, _dir_id: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(false)
    }

    async fn can_create_directory(
        &self,
        _dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn can_update_directory(
        &self,
        _dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn can_update_file(&self, _file_id: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(false)
    }

    async fn can_copy_directory(
        &self,
        _source_dir_id: &str,
        _target_dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn can_copy_file(
        &self,
        _source_file_id: &str,
        _target_dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn can_move_directory(
        &self,
        _source_dir_id: &str,
        _target_dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn can_move_file(
        &self,
        _source_file_id: &str,
        _target_dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn can_delete_directory(
        &self,
        _dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn can_delete_file(&self, _file_id: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(false)
    }

    async fn can_search(&self, _dir_id: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(false)
    }

    // Actions.

    async fn open_file(&self, _file_id: &str, _cancel: &CancellationToken) -> Result<FileContent> {
        Err(Error::not_supported("open_file"))
    }

    async fn write_file(
        &self,
        _dir_id: &str,
        _file: Entry,
        _content: FileContent,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        Err(Error::not_supported("write_file"))
    }

    async fn create_directory(
        &self,
        _dir_id: &str,
        _directory: Entry,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        Err(Error::not_supported("create_directory"))
    }

    async fn update_directory(
        &self,
        _dir_id: &str,
        _directory: Entry,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        Err(Error::not_supported("update_directory"))
    }

    async fn update_file(
        &self,
        _file_id: &str,
        _file: Entry,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        Err(Error::not_supported("update_file"))
    }

    async fn copy_directory(
        &self,
        _source_dir_id: &str,
        _target_dir_id: &str,
        _directory: Option<Entry>,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        Err(Error::not_supported("copy_directory"))
    }

    async fn copy_file(
        &self,
        _source_file_id: &str,
        _target_dir_id: &str,
        _file: Option<Entry>,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        Err(Error::not_supported("copy_file"))
    }

    async fn move_directory(
        &self,
        _source_dir_id: &str,
        _target_dir_id: &str,
        _directory: Option<Entry>,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        Err(Error::not_supported("move_directory"))
    }

    async fn move_file(
        &self,
        _source_file_id: &str,
        _target_dir_id: &str,
        _file: Option<Entry>,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        Err(Error::not_supported("move_file"))
    }

    /// Deletes a directory, returning the deleted entry when the provider
    /// can still describe it (for trash routing).
    async fn delete_directory(
        &self,
        _dir_id: &str,
        _send_to_trash: bool,
        _cancel: &CancellationToken,
    ) -> Result<Option<Entry>> {
        Err(Error::not_supported("delete_directory"))
    }

    async fn delete_file(
        &self,
        _file_id: &str,
        _send_to_trash: bool,
        _cancel: &CancellationToken,
    ) -> Result<Option<Entry>> {
        Err(Error::not_supported("delete_file"))
    }

    async fn search(
        &self,
        _dir_id: &str,
        _query: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        Err(Error::not_supported("search"))
    }

    /// Invoked at the start of [`FileSystem::refresh`](crate::fs::FileSystem::refresh),
    /// before the caches are dropped.
    async fn refresh(&self, _dir_id: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// Everything an interactive login needs from the manager.
pub struct LoginRequest {
    pub scopes: Vec<String>,
    /// True when a previously declined scope is being requested again, so
    /// the login surface can call the denial out explicitly.
    pub requesting_denied_scope: bool,
    pub connection_string: Option<String>,
}

/// An opaque function capable of running an interactive login and
/// producing a ticket. The UI behind it is out of scope.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn login(&self, request: LoginRequest, cancel: &CancellationToken) -> Result<Ticket>;
}

/// The credential hooks a filesystem supplies to its credential manager.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Redeems a persisted connection string for a fresh ticket without
    /// user interaction.
    async fn refresh_ticket(
        &self,
        connection_string: &str,
        cancel: &CancellationToken,
    ) -> Result<Ticket>;

    /// Runs an interactive login through the broker.
    async fn login(
        &self,
        broker: &dyn Broker,
        connection_string: Option<&str>,
        scopes: &[String],
        requesting_denied_scope: bool,
        cancel: &CancellationToken,
    ) -> Result<Ticket>;

    /// Scopes required to access the given directory.
    fn scopes(&self, _dir_id: &str) -> Vec<String> {
        Vec::new()
    }
}
