//! The filesystem facade.
//!
//! Wraps a [`Provider`] with identifier normalization, capability gating,
//! the four weak caches, change/refresh events, thumbnail fetching, and
//! OAuth error remapping. The facade owns no storage of its own; every
//! cache entry is advisory and weakly held (see [`crate::cache`]).

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use diagnostics::{log_debug, log_info};
use tokio_util::sync::CancellationToken;

use crate::auth::CredentialManager;
use crate::cache::{ListEdit, Listing, WeakCache};
use crate::entry::{Drive, Entry};
use crate::error::{Error, Result};
use crate::event::{ChangeEvent, ChangeKind, RefreshedEvent};
use crate::path;
use crate::provider::{Addressing, FileContent, Provider, SearchHit};

/// The four identity-keyed caches. Directory and file entries are cached
/// singly and per parent listing; the listing observers keep the single
/// caches mirrored.
struct Caches {
    dirs: WeakCache<Entry>,
    files: WeakCache<Entry>,
    dir_lists: WeakCache<Listing<Entry>>,
    file_lists: WeakCache<Listing<Entry>>,
}

type RefreshObserver = Box<dyn Fn(&RefreshedEvent) + Send + Sync>;
type ChangeObserver = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

/// A provider-agnostic asynchronous filesystem.
pub struct FileSystem {
    provider: Arc<dyn Provider>,
    credentials: Option<Arc<CredentialManager>>,
    caches: Arc<Caches>,
    http: reqwest::Client,
    /// Shared by check_access and invalidate_access so an invalidation
    /// never interleaves with an authentication in flight.
    access_lock: tokio::sync::Mutex<()>,
    refreshed_observers: Mutex<Vec<RefreshObserver>>,
    changed_observers: Mutex<Vec<ChangeObserver>>,
}

fn child_id(addressing: Addressing, parent_dir_id: &str, local_id: &str) -> String {
    match addressing {
        Addressing::FullPathAsId => path::combine(parent_dir_id, local_id),
        Addressing::OpaqueId => path::normalize(local_id),
    }
}

impl FileSystem {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self::build(provider, None)
    }

    /// A facade whose access checks run through a credential manager
    /// instead of the provider's own `check_access` hook.
    pub fn with_credentials(provider: Arc<dyn Provider>, credentials: Arc<CredentialManager>) -> Self {
        Self::build(provider, Some(credentials))
    }

    fn build(provider: Arc<dyn Provider>, credentials: Option<Arc<CredentialManager>>) -> Self {
        FileSystem {
            provider,
            credentials,
            caches: Arc::new(Caches {
                dirs: WeakCache::new(),
                files: WeakCache::new(),
                dir_lists: WeakCache::new(),
                file_lists: WeakCache::new(),
            }),
            http: reqwest::Client::new(),
            access_lock: tokio::sync::Mutex::new(()),
            refreshed_observers: Mutex::new(Vec::new()),
            changed_observers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }

    pub fn addressing(&self) -> Addressing {
        self.provider.addressing()
    }

    pub fn credentials(&self) -> Option<&Arc<CredentialManager>> {
        self.credentials.as_ref()
    }

    /// Registers a listener for [`RefreshedEvent`]s.
    pub fn on_refreshed(&self, observer: impl Fn(&RefreshedEvent) + Send + Sync + 'static) {
        self.refreshed_observers
            .lock()
            .expect("facade lock poisoned")
            .push(Box::new(observer));
    }

    /// Registers a listener for [`ChangeEvent`]s raised by mutating
    /// operations.
    pub fn on_changed(&self, observer: impl Fn(&ChangeEvent) + Send + Sync + 'static) {
        self.changed_observers
            .lock()
            .expect("facade lock poisoned")
            .push(Box::new(observer));
    }

    // Id algebra.

    /// The full identifier of a child directory given its parent and the
    /// local id the provider reported.
    pub fn directory_id(&self, parent_dir_id: &str, local_id: &str) -> String {
        child_id(self.provider.addressing(), &path::normalize(parent_dir_id), local_id)
    }

    /// The full identifier of a child file given its parent and the local
    /// id the provider reported.
    pub fn file_id(&self, parent_dir_id: &str, local_id: &str) -> String {
        child_id(self.provider.addressing(), &path::normalize(parent_dir_id), local_id)
    }

    /// The parent identifier, or `None` for the root. Path addressing
    /// derives it without a provider call; opaque addressing fetches the
    /// entry and asks the provider.
    pub async fn directory_parent_id(
        &self,
        dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let dir_id = path::normalize(dir_id);
        if dir_id.is_empty() {
            return Ok(None);
        }
        match self.provider.addressing() {
            Addressing::FullPathAsId => Ok(Some(path::parent(&dir_id))),
            Addressing::OpaqueId => match self.directory(&dir_id, false, cancel).await? {
                Some(directory) => self.provider.directory_parent_id(&directory),
                None => Ok(None),
            },
        }
    }

    pub async fn file_parent_id(
        &self,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let file_id = path::normalize(file_id);
        if file_id.is_empty() {
            return Ok(None);
        }
        match self.provider.addressing() {
            Addressing::FullPathAsId => Ok(Some(path::parent(&file_id))),
            Addressing::OpaqueId => match self.file(&file_id, false, cancel).await? {
                Some(file) => self.provider.file_parent_id(&file),
                None => Ok(None),
            },
        }
    }

    /// The display path of a directory. Under opaque addressing this walks
    /// the parent chain, which may issue one provider call per level.
    pub async fn full_path(&self, dir_id: &str, cancel: &CancellationToken) -> Result<String> {
        let dir_id = path::normalize(dir_id);
        match self.provider.addressing() {
            Addressing::FullPathAsId => Ok(dir_id),
            Addressing::OpaqueId => {
                let mut full = String::new();
                let mut current = Some(dir_id);
                while let Some(id) = current.filter(|id| !id.trim().is_empty()) {
                    self.ensure_live(cancel)?;
                    full = path::combine(&id, &full);
                    current = self.directory_parent_id(&id, cancel).await?;
                }
                Ok(full)
            }
        }
    }

    pub async fn full_file_path(
        &self,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let file_id = path::normalize(file_id);
        match self.provider.addressing() {
            Addressing::FullPathAsId => Ok(file_id),
            Addressing::OpaqueId => {
                let parent = self.file_parent_id(&file_id, cancel).await?.unwrap_or_default();
                let parent_path = self.full_path(&parent, cancel).await?;
                Ok(path::combine(&parent_path, &file_id))
            }
        }
    }

    /// A filesystem-safe relative path unique to the directory, suitable
    /// as a local cache key.
    pub fn unique_directory_path(&self, dir_id: &str) -> String {
        path::valid_path(&path::normalize(dir_id))
    }

    /// A filesystem-safe relative path unique to the file, extended with
    /// the content-type extension when the name carries none.
    pub async fn unique_file_path(
        &self,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let file_id = path::normalize(file_id);
        match self.provider.addressing() {
            Addressing::FullPathAsId => Ok(path::valid_path(&file_id)),
            Addressing::OpaqueId => {
                let parent = self.file_parent_id(&file_id, cancel).await?;
                let dir_path = match parent.as_deref() {
                    Some(parent) if !parent.is_empty() => {
                        let full = self.full_path(parent, cancel).await?;
                        path::valid_path(&full)
                    }
                    _ => String::new(),
                };
                let file = self
                    .file(&file_id, false, cancel)
                    .await?
                    .ok_or_else(|| Error::usage("unknown file id"))?;
                let mut name = file.name().to_string();
                if !path::has_extension(&name)
                    && let Some(content_type) = file.content_type()
                    && let Some(extension) = self.provider.extension_for(content_type)
                {
                    name.push_str(&extension);
                }
                Ok(path::combine(&dir_path, &path::valid_segment(&name)))
            }
        }
    }

    /// Whether `dir_id` lies under `ancestor_id` (inclusive). The root is
    /// an ancestor of everything.
    pub async fn is_subdirectory(
        &self,
        dir_id: &str,
        ancestor_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let ancestor = path::normalize(ancestor_id);
        if ancestor.is_empty() {
            return Ok(true);
        }
        let mut current = path::normalize(dir_id);
        loop {
            if current == ancestor {
                return Ok(true);
            }
            if current.is_empty() {
                return Ok(false);
            }
            match self.directory_parent_id(&current, cancel).await? {
                Some(parent) => current = parent,
                None => return Ok(false),
            }
        }
    }

    // Access.

    /// Serialized with [`FileSystem::invalidate_access`]. With a credential
    /// manager attached this authenticates for the directory's scopes;
    /// otherwise the provider's own hook decides.
    pub async fn check_access(
        &self,
        dir_id: &str,
        prompt: bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let dir_id = path::normalize(dir_id);
        let _guard = self.access_lock.lock().await;
        let checked = match &self.credentials {
            Some(manager) => {
                let scopes = manager.scopes(&dir_id);
                manager.authenticate(&scopes, prompt, cancel).await.map(|_| true)
            }
            None => self.provider.check_access(&dir_id, prompt, cancel).await,
        };
        checked.map_err(Self::process_error)
    }

    /// Drops cached credentials so the next access check starts over.
    pub async fn invalidate_access(&self, dir_id: &str) -> Result<()> {
        let dir_id = path::normalize(dir_id);
        let _guard = self.access_lock.lock().await;
        if let Some(manager) = &self.credentials {
            manager.invalidate();
        }
        self.provider.invalidate_access(&dir_id).await
    }

    // Reads.

    pub async fn drive(&self, cancel: &CancellationToken) -> Result<Option<Drive>> {
        self.ensure_live(cancel)?;
        self.provider.drive(cancel).await.map_err(Self::process_error)
    }

    pub async fn trash_id(
        &self,
        dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let dir_id = path::normalize(dir_id);
        self.provider.trash_id(&dir_id, cancel).await.map_err(Self::process_error)
    }

    pub async fn exists_directory(
        &self,
        dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let dir_id = path::normalize(dir_id);
        if dir_id.is_empty() {
            return Ok(true);
        }
        Ok(self.directory(&dir_id, false, cancel).await?.is_some())
    }

    /// Child directories of `dir_id`. A cached listing is returned as-is;
    /// otherwise the provider is asked once and the listing is watched so
    /// later edits keep the single cache mirrored.
    pub async fn directories(
        &self,
        dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Listing<Entry>>> {
        let dir_id = path::normalize(dir_id);
        if let Some(listing) = self.caches.dir_lists.get(&dir_id) {
            return Ok(listing);
        }
        self.ensure_live(cancel)?;
        let fetched = self
            .provider
            .directories(&dir_id, cancel)
            .await
            .map_err(Self::process_error)?;
        let listing = Listing::new(fetched.into_iter().map(Arc::new).collect());
        self.watch_directories(&dir_id, &listing);
        Ok(listing)
    }

    pub async fn files(
        &self,
        dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Listing<Entry>>> {
        let dir_id = path::normalize(dir_id);
        if let Some(listing) = self.caches.file_lists.get(&dir_id) {
            return Ok(listing);
        }
        self.ensure_live(cancel)?;
        let fetched = self
            .provider
            .files(&dir_id, cancel)
            .await
            .map_err(Self::process_error)?;
        let listing = Listing::new(fetched.into_iter().map(Arc::new).collect());
        self.watch_files(&dir_id, &listing);
        Ok(listing)
    }

    /// A single directory. `full` bypasses the cache on the way in; a
    /// provider miss still falls back to the cache, and under path
    /// addressing to a scan of the parent's already-loaded listing.
    pub async fn directory(
        &self,
        dir_id: &str,
        full: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Entry>>> {
        let dir_id = path::normalize(dir_id);
        if !full && let Some(directory) = self.caches.dirs.get(&dir_id) {
            return Ok(Some(directory));
        }
        self.ensure_live(cancel)?;
        let mut directory = self
            .provider
            .directory(&dir_id, full, cancel)
            .await
            .map_err(Self::process_error)?
            .map(Arc::new);
        if directory.is_none() && let Some(cached) = self.caches.dirs.get(&dir_id) {
            return Ok(Some(cached));
        }
        if directory.is_none() && self.provider.addressing() == Addressing::FullPathAsId {
            let parent = path::parent(&dir_id);
            if let Some(listing) = self.caches.dir_lists.get(&parent) {
                directory = listing.find(|d| path::combine(&parent, d.id()) == dir_id);
            }
        }
        if let Some(directory) = &directory {
            self.caches.dirs.insert(&dir_id, directory);
        }
        Ok(directory)
    }

    pub async fn file(
        &self,
        file_id: &str,
        full: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Entry>>> {
        let file_id = path::normalize(file_id);
        if !full && let Some(file) = self.caches.files.get(&file_id) {
            return Ok(Some(file));
        }
        self.ensure_live(cancel)?;
        let file = self
            .provider
            .file(&file_id, full, cancel)
            .await
            .map_err(Self::process_error)?
            .map(Arc::new);
        if file.is_none() && let Some(cached) = self.caches.files.get(&file_id) {
            return Ok(Some(cached));
        }
        if let Some(file) = &file {
            self.caches.files.insert(&file_id, file);
        }
        Ok(file)
    }

    // Thumbnails and links.

    pub async fn can_open_directory_thumbnail(
        &self,
        dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let directory = self.directory(dir_id, false, cancel).await?;
        Ok(self.provider.can_open_directory_thumbnail(directory.as_deref()))
    }

    pub async fn can_open_file_thumbnail(
        &self,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let file = self.file(file_id, false, cancel).await?;
        Ok(self.provider.can_open_file_thumbnail(file.as_deref()))
    }

    /// Fetches the directory's thumbnail bytes. `None` when the entry is
    /// unknown or carries no thumbnail URL.
    pub async fn open_directory_thumbnail(
        &self,
        dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        let Some(directory) = self.directory(dir_id, false, cancel).await? else {
            return Ok(None);
        };
        let Some(url) = directory.thumbnail().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        self.fetch_thumbnail(url, cancel).await.map(Some)
    }

    pub async fn open_file_thumbnail(
        &self,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        let Some(file) = self.file(file_id, false, cancel).await? else {
            return Ok(None);
        };
        let Some(url) = file.thumbnail().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        self.fetch_thumbnail(url, cancel).await.map(Some)
    }

    async fn fetch_thumbnail(&self, url: &str, cancel: &CancellationToken) -> Result<Bytes> {
        self.ensure_live(cancel)?;
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = self.http.get(url).send() => response?,
        };
        let success = response.status().is_success();
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            body = response.bytes() => body?,
        };
        if success {
            Ok(body)
        } else {
            // The error payload is kept so the caller can render it.
            Err(Error::Image(body))
        }
    }

    pub async fn can_directory_link(
        &self,
        dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let directory = self.directory(dir_id, false, cancel).await?;
        Ok(self.provider.can_directory_link(directory.as_deref()))
    }

    pub async fn can_file_link(&self, file_id: &str, cancel: &CancellationToken) -> Result<bool> {
        let file = self.file(file_id, false, cancel).await?;
        Ok(self.provider.can_file_link(file.as_deref()))
    }

    pub async fn directory_link(
        &self,
        dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let directory = self.directory(dir_id, false, cancel).await?;
        Ok(directory.and_then(|d| d.link().map(str::to_string)))
    }

    pub async fn file_link(
        &self,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let file = self.file(file_id, false, cancel).await?;
        Ok(file.and_then(|f| f.link().map(str::to_string)))
    }

    // Capability checks.

    pub async fn can_open_file(&self, file_id: &str, cancel: &CancellationToken) -> Result<bool> {
        let file_id = path::normalize(file_id);
        self.provider.can_open_file(&file_id, cancel).await
    }

    pub async fn can_write_file(&self, dir_id: &str, cancel: &CancellationToken) -> Result<bool> {
        let dir_id = path::normalize(dir_id);
        self.provider.can_write_file(&dir_id, cancel).await
    }

    pub async fn can_create_directory(
        &self,
        dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let dir_id = path::normalize(dir_id);
        self.provider.can_create_directory(&dir_id, cancel).await
    }

    pub async fn can_update_directory(
        &self,
        dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let dir_id = path::normalize(dir_id);
        self.provider.can_update_directory(&dir_id, cancel).await
    }

    pub async fn can_update_file(&self, file_id: &str, cancel: &CancellationToken) -> Result<bool> {
        let file_id = path::normalize(file_id);
        self.provider.can_update_file(&file_id, cancel).await
    }

    pub async fn can_copy_directory(
        &self,
        source_dir_id: &str,
        target_dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let source = path::normalize(source_dir_id);
        let target = path::normalize(target_dir_id);
        self.provider.can_copy_directory(&source, &target, cancel).await
    }

    pub async fn can_copy_file(
        &self,
        source_file_id: &str,
        target_dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let source = path::normalize(source_file_id);
        let target = path::normalize(target_dir_id);
        self.provider.can_copy_file(&source, &target, cancel).await
    }

    /// Always false when the target already is the source's parent.
    pub async fn can_move_directory(
        &self,
        source_dir_id: &str,
        target_dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let source = path::normalize(source_dir_id);
        let target = path::normalize(target_dir_id);
        if let Some(parent) = self.directory_parent_id(&source, cancel).await?
            && parent == target
        {
            return Ok(false);
        }
        self.provider.can_move_directory(&source, &target, cancel).await
    }

    pub async fn can_move_file(
        &self,
        source_file_id: &str,
        target_dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let source = path::normalize(source_file_id);
        let target = path::normalize(target_dir_id);
        if let Some(parent) = self.file_parent_id(&source, cancel).await?
            && parent == target
        {
            return Ok(false);
        }
        self.provider.can_move_file(&source, &target, cancel).await
    }

    pub async fn can_delete_directory(
        &self,
        dir_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let dir_id = path::normalize(dir_id);
        self.provider.can_delete_directory(&dir_id, cancel).await
    }

    pub async fn can_delete_file(&self, file_id: &str, cancel: &CancellationToken) -> Result<bool> {
        let file_id = path::normalize(file_id);
        self.provider.can_delete_file(&file_id, cancel).await
    }

    pub async fn can_search(&self, dir_id: &str, cancel: &CancellationToken) -> Result<bool> {
        let dir_id = path::normalize(dir_id);
        self.provider.can_search(&dir_id, cancel).await
    }

    // Content.

    pub async fn open_file(
        &self,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> Result<FileContent> {
        let file_id = path::normalize(file_id);
        if !self.can_open_file(&file_id, cancel).await? {
            return Err(Error::usage("cannot open the file with the specified id"));
        }
        self.provider.open_file(&file_id, cancel).await.map_err(Self::process_error)
    }

    /// Uploads `content` as a new or replaced file under `dir_id`. When the
    /// provider requires extensions, a missing one is completed from the
    /// entry's content type before the upload.
    pub async fn write_file(
        &self,
        dir_id: &str,
        mut file: Entry,
        content: FileContent,
        cancel: &CancellationToken,
    ) -> Result<Arc<Entry>> {
        let dir_id = path::normalize(dir_id);
        if !self.can_write_file(&dir_id, cancel).await? {
            return Err(Error::usage("cannot upload a file to the specified dir id"));
        }
        if self.provider.file_name_extension_required()
            && !path::has_extension(file.name())
            && let Some(content_type) = file.content_type().map(str::to_string)
            && let Some(extension) = self.provider.extension_for(&content_type)
        {
            let name = format!("{}{}", file.name(), extension);
            file.set_name(name)?;
        }
        let uploaded = self
            .provider
            .write_file(&dir_id, file, content, cancel)
            .await
            .map_err(Self::process_error)?;
        let uploaded = Arc::new(uploaded);
        self.add_or_replace_file_in_cache(&dir_id, &uploaded);
        if self.provider.show_count_in_directories() {
            self.adjust_directory_count(&dir_id, 1, cancel).await?;
        }
        let full_id = self.file_id(&dir_id, uploaded.id());
        self.raise_changed(ChangeKind::FileWritten, full_id, Some(dir_id)).await;
        Ok(uploaded)
    }

    // Mutations.

    pub async fn create_directory(
        &self,
        dir_id: &str,
        directory: Entry,
        cancel: &CancellationToken,
    ) -> Result<Arc<Entry>> {
        let dir_id = path::normalize(dir_id);
        if !self.can_create_directory(&dir_id, cancel).await? {
            return Err(Error::usage("cannot create a folder at the specified dir id"));
        }
        let created = self
            .provider
            .create_directory(&dir_id, directory, cancel)
            .await
            .map_err(Self::process_error)?;
        let created = Arc::new(created);
        self.add_dir_to_cache(&dir_id, &created);
        if self.provider.show_count_in_directories() {
            self.adjust_directory_count(&dir_id, 1, cancel).await?;
        }
        let full_id = self.directory_id(&dir_id, created.id());
        log_debug!("created directory {id}", id: full_id.clone());
        self.raise_changed(ChangeKind::DirectoryCreated, full_id, Some(dir_id)).await;
        Ok(created)
    }

    pub async fn update_directory(
        &self,
        dir_id: &str,
        directory: Entry,
        cancel: &CancellationToken,
    ) -> Result<Arc<Entry>> {
        let dir_id = path::normalize(dir_id);
        if !self.can_update_directory(&dir_id, cancel).await? {
            return Err(Error::usage("cannot update the folder with the specified dir id"));
        }
        let parent = self.directory_parent_id(&dir_id, cancel).await?;
        let original = self.directory(&dir_id, false, cancel).await?;
        let updated = self
            .provider
            .update_directory(&dir_id, directory, cancel)
            .await
            .map_err(Self::process_error)?;
        let updated = Arc::new(updated);
        self.replace_directory_in_cache(parent.as_deref(), original.as_ref(), &updated);
        let full_id = child_id(
            self.provider.addressing(),
            parent.as_deref().unwrap_or(""),
            updated.id(),
        );
        self.raise_changed(ChangeKind::DirectoryUpdated, full_id, parent).await;
        Ok(updated)
    }

    pub async fn update_file(
        &self,
        file_id: &str,
        file: Entry,
        cancel: &CancellationToken,
    ) -> Result<Arc<Entry>> {
        let file_id = path::normalize(file_id);
        if !self.can_update_file(&file_id, cancel).await? {
            return Err(Error::usage("cannot update the file with the specified id"));
        }
        let parent = self.file_parent_id(&file_id, cancel).await?;
        let original = self.file(&file_id, false, cancel).await?;
        let updated = self
            .provider
            .update_file(&file_id, file, cancel)
            .await
            .map_err(Self::process_error)?;
        let updated = Arc::new(updated);
        self.replace_file_in_cache(parent.as_deref(), original.as_ref(), &updated);
        let full_id = child_id(
            self.provider.addressing(),
            parent.as_deref().unwrap_or(""),
            updated.id(),
        );
        self.raise_changed(ChangeKind::FileUpdated, full_id, parent).await;
        Ok(updated)
    }

    pub async fn copy_directory(
        &self,
        source_dir_id: &str,
        target_dir_id: &str,
        directory: Option<Entry>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Entry>> {
        let source = path::normalize(source_dir_id);
        let target = path::normalize(target_dir_id);
        if !self.can_copy_directory(&source, &target, cancel).await? {
            return Err(Error::usage("cannot copy the directory to the specified target"));
        }
        let copied = self
            .provider
            .copy_directory(&source, &target, directory, cancel)
            .await
            .map_err(Self::process_error)?;
        let copied = Arc::new(copied);
        self.add_dir_to_cache(&target, &copied);
        if self.provider.show_count_in_directories() {
            self.adjust_directory_count(&target, 1, cancel).await?;
        }
        let full_id = self.directory_id(&target, copied.id());
        self.raise_changed(ChangeKind::DirectoryCopied, full_id, Some(target)).await;
        Ok(copied)
    }

    pub async fn copy_file(
        &self,
        source_file_id: &str,
        target_dir_id: &str,
        file: Option<Entry>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Entry>> {
        let source = path::normalize(source_file_id);
        let target = path::normalize(target_dir_id);
        if !self.can_copy_file(&source, &target, cancel).await? {
            return Err(Error::usage("cannot copy the file to the specified target"));
        }
        let copied = self
            .provider
            .copy_file(&source, &target, file, cancel)
            .await
            .map_err(Self::process_error)?;
        let copied = Arc::new(copied);
        self.add_file_to_cache(&target, &copied);
        if self.provider.show_count_in_directories() {
            self.adjust_directory_count(&target, 1, cancel).await?;
        }
        let full_id = self.file_id(&target, copied.id());
        self.raise_changed(ChangeKind::FileCopied, full_id, Some(target)).await;
        Ok(copied)
    }

    pub async fn move_directory(
        &self,
        source_dir_id: &str,
        target_dir_id: &str,
        directory: Option<Entry>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Entry>> {
        let source = path::normalize(source_dir_id);
        let target = path::normalize(target_dir_id);
        if !self.can_move_directory(&source, &target, cancel).await? {
            return Err(Error::usage("cannot move the directory to the specified target"));
        }
        let source_parent = self.directory_parent_id(&source, cancel).await?;
        let moved = self
            .provider
            .move_directory(&source, &target, directory, cancel)
            .await
            .map_err(Self::process_error)?;
        let moved = Arc::new(moved);
        self.remove_dir_from_cache(source_parent.as_deref(), &source);
        self.add_dir_to_cache(&target, &moved);
        if self.provider.show_count_in_directories() {
            if let Some(source_parent) = source_parent.as_deref() {
                self.adjust_directory_count(source_parent, -1, cancel).await?;
            }
            self.adjust_directory_count(&target, 1, cancel).await?;
        }
        let full_id = self.directory_id(&target, moved.id());
        self.raise_changed(ChangeKind::DirectoryMoved, full_id, Some(target)).await;
        Ok(moved)
    }

    pub async fn move_file(
        &self,
        source_file_id: &str,
        target_dir_id: &str,
        file: Option<Entry>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Entry>> {
        let source = path::normalize(source_file_id);
        let target = path::normalize(target_dir_id);
        if !self.can_move_file(&source, &target, cancel).await? {
            return Err(Error::usage("cannot move the file to the specified target"));
        }
        let source_parent = self.file_parent_id(&source, cancel).await?;
        let moved = self
            .provider
            .move_file(&source, &target, file, cancel)
            .await
            .map_err(Self::process_error)?;
        let moved = Arc::new(moved);
        self.remove_file_from_cache(source_parent.as_deref(), &source);
        self.add_file_to_cache(&target, &moved);
        if self.provider.show_count_in_directories() {
            if let Some(source_parent) = source_parent.as_deref() {
                self.adjust_directory_count(source_parent, -1, cancel).await?;
            }
            self.adjust_directory_count(&target, 1, cancel).await?;
        }
        let full_id = self.file_id(&target, moved.id());
        self.raise_changed(ChangeKind::FileMoved, full_id, Some(target)).await;
        Ok(moved)
    }

    /// Deletes a directory, routing the deleted entry into the trash
    /// listing when the provider reports both.
    pub async fn delete_directory(
        &self,
        dir_id: &str,
        send_to_trash: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Entry>>> {
        let dir_id = path::normalize(dir_id);
        if !self.can_delete_directory(&dir_id, cancel).await? {
            return Err(Error::usage("cannot delete the folder with the specified dir id"));
        }
        let parent = self.directory_parent_id(&dir_id, cancel).await?;
        let trash = if send_to_trash {
            self.provider.trash_id(&dir_id, cancel).await.map_err(Self::process_error)?
        } else {
            None
        };
        let deleted = self
            .provider
            .delete_directory(&dir_id, send_to_trash, cancel)
            .await
            .map_err(Self::process_error)?
            .map(Arc::new);
        self.remove_dir_from_cache(parent.as_deref(), &dir_id);
        if let (Some(deleted), Some(trash)) = (&deleted, trash.as_deref()) {
            self.add_dir_to_cache(trash, deleted);
        }
        if self.provider.show_count_in_directories()
            && let Some(parent) = parent.as_deref().filter(|p| !p.trim().is_empty())
        {
            self.adjust_directory_count(parent, -1, cancel).await?;
        }
        self.raise_changed(ChangeKind::DirectoryDeleted, dir_id, parent).await;
        Ok(deleted)
    }

    pub async fn delete_file(
        &self,
        file_id: &str,
        send_to_trash: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Entry>>> {
        let file_id = path::normalize(file_id);
        if !self.can_delete_file(&file_id, cancel).await? {
            return Err(Error::usage("cannot delete the file with the specified id"));
        }
        let parent = self.file_parent_id(&file_id, cancel).await?;
        let trash = if send_to_trash {
            // The file's trash is looked up through its parent directory.
            self.provider
                .trash_id(parent.as_deref().unwrap_or(""), cancel)
                .await
                .map_err(Self::process_error)?
        } else {
            None
        };
        let deleted = self
            .provider
            .delete_file(&file_id, send_to_trash, cancel)
            .await
            .map_err(Self::process_error)?
            .map(Arc::new);
        self.remove_file_from_cache(parent.as_deref(), &file_id);
        if let (Some(deleted), Some(trash)) = (&deleted, trash.as_deref()) {
            self.add_file_to_cache(trash, deleted);
        }
        if self.provider.show_count_in_directories()
            && let Some(parent) = parent.as_deref().filter(|p| !p.trim().is_empty())
        {
            self.adjust_directory_count(parent, -1, cancel).await?;
        }
        self.raise_changed(ChangeKind::FileDeleted, file_id, parent).await;
        Ok(deleted)
    }

    // Search.

    /// Searches under `dir_id`. Hits are watched so entries discovered by
    /// search land in the single caches.
    pub async fn search(
        &self,
        dir_id: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Listing<SearchHit>>> {
        let dir_id = path::normalize(dir_id);
        if !self.can_search(&dir_id, cancel).await? {
            return Err(Error::usage("cannot search at the specified dir id"));
        }
        let hits = self
            .provider
            .search(&dir_id, query, cancel)
            .await
            .map_err(Self::process_error)?;
        let listing = Listing::new(hits.into_iter().map(Arc::new).collect());
        self.watch_search(&listing);
        Ok(listing)
    }

    // Refresh.

    /// Drops caches globally (`None`) or for one directory, after giving
    /// the provider a chance to drop its own state. Listeners observe a
    /// [`RefreshedEvent`] and may defer the return.
    pub async fn refresh(&self, dir_id: Option<&str>) -> Result<()> {
        let dir_id = dir_id.map(path::normalize);
        self.provider
            .refresh(dir_id.as_deref())
            .await
            .map_err(Self::process_error)?;
        match dir_id.as_deref() {
            None => {
                self.caches.dir_lists.clear();
                self.caches.file_lists.clear();
                self.caches.files.clear();
                self.caches.dirs.clear();
                log_info!("refreshed all caches");
            }
            Some(dir_id) => {
                self.caches.dir_lists.remove(dir_id);
                self.caches.file_lists.remove(dir_id);
                let cancel = CancellationToken::new();
                for (key, _) in self.caches.files.live_entries() {
                    if self.file_parent_id(&key, &cancel).await?.as_deref() == Some(dir_id) {
                        self.caches.files.remove(&key);
                    }
                }
                for (key, _) in self.caches.dirs.live_entries() {
                    if self.directory_parent_id(&key, &cancel).await?.as_deref() == Some(dir_id) {
                        self.caches.dirs.remove(&key);
                    }
                }
            }
        }
        let event = RefreshedEvent::new(dir_id);
        {
            let observers = self.refreshed_observers.lock().expect("facade lock poisoned");
            for observer in observers.iter() {
                observer(&event);
            }
        }
        event.wait().await;
        Ok(())
    }

    // Cache maintenance.

    fn watch_directories(&self, dir_id: &str, listing: &Arc<Listing<Entry>>) {
        self.caches.dir_lists.insert(dir_id, listing);
        let caches = self.caches.clone();
        let addressing = self.provider.addressing();
        let parent = dir_id.to_string();
        listing.observe(move |edit| match edit {
            ListEdit::Inserted(directory) => {
                caches.dirs.insert(&child_id(addressing, &parent, directory.id()), directory);
            }
            ListEdit::Removed(directory) => {
                caches.dirs.remove(&child_id(addressing, &parent, directory.id()));
            }
            ListEdit::Replaced { old, new } => {
                caches.dirs.remove(&child_id(addressing, &parent, old.id()));
                caches.dirs.insert(&child_id(addressing, &parent, new.id()), new);
            }
            ListEdit::Reset(items) => {
                for directory in items {
                    caches
                        .dirs
                        .insert(&child_id(addressing, &parent, directory.id()), directory);
                }
            }
        });
        for directory in listing.items() {
            self.caches
                .dirs
                .insert(&child_id(addressing, dir_id, directory.id()), &directory);
        }
    }

    fn watch_files(&self, dir_id: &str, listing: &Arc<Listing<Entry>>) {
        self.caches.file_lists.insert(dir_id, listing);
        let caches = self.caches.clone();
        let addressing = self.provider.addressing();
        let parent = dir_id.to_string();
        listing.observe(move |edit| match edit {
            ListEdit::Inserted(file) => {
                caches.files.insert(&child_id(addressing, &parent, file.id()), file);
            }
            ListEdit::Removed(file) => {
                caches.files.remove(&child_id(addressing, &parent, file.id()));
            }
            ListEdit::Replaced { old, new } => {
                caches.files.remove(&child_id(addressing, &parent, old.id()));
                caches.files.insert(&child_id(addressing, &parent, new.id()), new);
            }
            ListEdit::Reset(items) => {
                for file in items {
                    caches.files.insert(&child_id(addressing, &parent, file.id()), file);
                }
            }
        });
        for file in listing.items() {
            self.caches
                .files
                .insert(&child_id(addressing, dir_id, file.id()), &file);
        }
    }

    fn watch_search(&self, listing: &Arc<Listing<SearchHit>>) {
        fn mirror(caches: &Caches, addressing: Addressing, hit: &SearchHit, add: bool) {
            let full_id = child_id(addressing, &hit.directory_id, hit.entry.id());
            let cache = if hit.entry.is_directory() {
                &caches.dirs
            } else {
                &caches.files
            };
            if add {
                cache.insert(&full_id, &hit.entry);
            } else {
                cache.remove(&full_id);
            }
        }
        let caches = self.caches.clone();
        let addressing = self.provider.addressing();
        listing.observe(move |edit| match edit {
            ListEdit::Inserted(hit) => mirror(&caches, addressing, hit, true),
            ListEdit::Removed(hit) => mirror(&caches, addressing, hit, false),
            // A replaced search row does not change entry identity.
            ListEdit::Replaced { .. } => {}
            ListEdit::Reset(items) => {
                for hit in items {
                    mirror(&caches, addressing, hit, true);
                }
            }
        });
        for hit in listing.items() {
            mirror(&self.caches, addressing, &hit, true);
        }
    }

    fn add_dir_to_cache(&self, parent_dir_id: &str, directory: &Arc<Entry>) {
        let full_id = child_id(self.provider.addressing(), parent_dir_id, directory.id());
        self.caches.dirs.insert(&full_id, directory);
        if let Some(listing) = self.caches.dir_lists.get(parent_dir_id) {
            listing.insert(directory.clone());
        }
    }

    fn add_file_to_cache(&self, dir_id: &str, file: &Arc<Entry>) {
        let full_id = child_id(self.provider.addressing(), dir_id, file.id());
        self.caches.files.insert(&full_id, file);
        if let Some(listing) = self.caches.file_lists.get(dir_id) {
            listing.insert(file.clone());
        }
    }

    /// Replaces an existing row for the same id when one is cached, so a
    /// re-upload never duplicates the file in an open listing.
    fn add_or_replace_file_in_cache(&self, dir_id: &str, file: &Arc<Entry>) {
        let addressing = self.provider.addressing();
        let full_id = child_id(addressing, dir_id, file.id());
        self.caches.files.insert(&full_id, file);
        if let Some(listing) = self.caches.file_lists.get(dir_id) {
            let replaced = listing.replace_where(
                |existing| child_id(addressing, dir_id, existing.id()) == full_id,
                file.clone(),
            );
            if replaced.is_none() {
                listing.insert(file.clone());
            }
        }
    }

    fn replace_directory_in_cache(
        &self,
        parent_id: Option<&str>,
        original: Option<&Arc<Entry>>,
        updated: &Arc<Entry>,
    ) {
        let addressing = self.provider.addressing();
        let parent = parent_id.unwrap_or("");
        let new_id = child_id(addressing, parent, updated.id());
        if let Some(original) = original {
            let old_id = child_id(addressing, parent, original.id());
            if old_id != new_id {
                self.caches.dirs.remove(&old_id);
            }
            self.caches.dirs.insert(&new_id, updated);
            if let Some(listing) = self.caches.dir_lists.get(parent) {
                listing.replace_where(|d| d.id() == original.id(), updated.clone());
            }
        } else {
            self.caches.dirs.insert(&new_id, updated);
        }
    }

    fn replace_file_in_cache(
        &self,
        parent_id: Option<&str>,
        original: Option<&Arc<Entry>>,
        updated: &Arc<Entry>,
    ) {
        let addressing = self.provider.addressing();
        let parent = parent_id.unwrap_or("");
        let new_id = child_id(addressing, parent, updated.id());
        if let Some(original) = original {
            let old_id = child_id(addressing, parent, original.id());
            if old_id != new_id {
                self.caches.files.remove(&old_id);
            }
            self.caches.files.insert(&new_id, updated);
            if let Some(listing) = self.caches.file_lists.get(parent) {
                listing.replace_where(|f| f.id() == original.id(), updated.clone());
            }
        } else {
            self.caches.files.insert(&new_id, updated);
        }
    }

    fn remove_dir_from_cache(&self, parent_id: Option<&str>, dir_id: &str) {
        self.caches.dirs.remove(dir_id);
        if let Some(parent) = parent_id
            && let Some(listing) = self.caches.dir_lists.get(parent)
        {
            let addressing = self.provider.addressing();
            listing.remove_where(|d| child_id(addressing, parent, d.id()) == dir_id);
        }
    }

    fn remove_file_from_cache(&self, parent_id: Option<&str>, file_id: &str) {
        self.caches.files.remove(file_id);
        if let Some(parent) = parent_id
            && let Some(listing) = self.caches.file_lists.get(parent)
        {
            let addressing = self.provider.addressing();
            listing.remove_where(|f| child_id(addressing, parent, f.id()) == file_id);
        }
    }

    /// Best-effort count patch on the cached directory entry and its row
    /// in the parent listing. A cold cache is left alone; the next fetch
    /// reports the authoritative count.
    async fn adjust_directory_count(
        &self,
        dir_id: &str,
        delta: i64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if dir_id.trim().is_empty() {
            return Ok(());
        }
        let Some(cached) = self.caches.dirs.get(dir_id) else {
            return Ok(());
        };
        if cached.count().is_none() {
            return Ok(());
        }
        let mut patched = (*cached).clone();
        patched.adjust_count(delta);
        let patched = Arc::new(patched);
        self.caches.dirs.insert(dir_id, &patched);
        let parent = self.directory_parent_id(dir_id, cancel).await?;
        if let Some(parent) = parent.as_deref()
            && let Some(listing) = self.caches.dir_lists.get(parent)
        {
            let addressing = self.provider.addressing();
            listing.replace_where(
                |d| child_id(addressing, parent, d.id()) == dir_id,
                patched.clone(),
            );
        }
        Ok(())
    }

    // Events and errors.

    async fn raise_changed(&self, kind: ChangeKind, id: String, parent_id: Option<String>) {
        let event = ChangeEvent::new(kind, id, parent_id);
        {
            let observers = self.changed_observers.lock().expect("facade lock poisoned");
            for observer in observers.iter() {
                observer(&event);
            }
        }
        event.wait().await;
    }

    fn ensure_live(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Remaps bare OAuth protocol errors surfaced by providers to
    /// `AccessDenied`; everything else passes through unchanged.
    fn process_error(error: Error) -> Error {
        if let Error::Provider(source) = &error {
            match source.to_string().as_str() {
                "invalid_grant" | "unauthorized_client" | "expired_token" => {
                    return Error::AccessDenied;
                }
                _ => {}
            }
        }
        error
    }
}
