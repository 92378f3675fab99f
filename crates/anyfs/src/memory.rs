//! An in-memory provider.
//!
//! Backs the test suite and serves as the reference implementation of the
//! override contract. Directory buckets are keyed by the identifier the
//! facade uses for that directory, so the same state works under both
//! addressing modes.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::entry::{Drive, Entry};
use crate::error::{Error, Result};
use crate::path;
use crate::provider::{Addressing, FileContent, Provider, SearchHit};

#[derive(Default)]
struct State {
    /// Parent directory id to child directory entries (local ids).
    dirs: HashMap<String, Vec<Entry>>,
    /// Parent directory id to child file entries (local ids).
    files: HashMap<String, Vec<Entry>>,
    /// Full file id to content bytes.
    contents: HashMap<String, Vec<u8>>,
    trash: Option<String>,
}

pub struct MemoryProvider {
    state: Mutex<State>,
    addressing: Addressing,
    show_counts: bool,
    drive: Option<Drive>,
}

fn full_id(addressing: Addressing, parent: &str, local: &str) -> String {
    match addressing {
        Addressing::FullPathAsId => path::combine(parent, local),
        Addressing::OpaqueId => path::normalize(local),
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        MemoryProvider {
            state: Mutex::new(State::default()),
            addressing: Addressing::FullPathAsId,
            show_counts: false,
            drive: None,
        }
    }

    pub fn with_addressing(mut self, addressing: Addressing) -> Self {
        self.addressing = addressing;
        self
    }

    /// Enables trash routing: deleted entries land under `trash_dir_id`.
    pub fn with_trash(self, trash_dir_id: &str) -> Self {
        {
            let mut state = self.state.lock().expect("memory state poisoned");
            let trash = path::normalize(trash_dir_id);
            state.dirs.entry(trash.clone()).or_default();
            state.files.entry(trash.clone()).or_default();
            state.trash = Some(trash);
        }
        self
    }

    pub fn with_counts(mut self) -> Self {
        self.show_counts = true;
        self
    }

    pub fn with_drive(mut self, drive: Drive) -> Self {
        self.drive = Some(drive);
        self
    }

    // Test fixture setup.

    pub fn add_directory(&self, parent_dir_id: &str, directory: Entry) {
        let parent = path::normalize(parent_dir_id);
        let child = full_id(self.addressing, &parent, directory.id());
        let mut state = self.state.lock().expect("memory state poisoned");
        state.dirs.entry(child.clone()).or_default();
        state.files.entry(child).or_default();
        state.dirs.entry(parent).or_default().push(directory);
    }

    pub fn add_file(&self, dir_id: &str, file: Entry, content: &[u8]) {
        let parent = path::normalize(dir_id);
        let id = full_id(self.addressing, &parent, file.id());
        let mut state = self.state.lock().expect("memory state poisoned");
        state.contents.insert(id, content.to_vec());
        state.files.entry(parent).or_default().push(file);
    }

    pub fn file_count(&self, dir_id: &str) -> usize {
        let state = self.state.lock().expect("memory state poisoned");
        state
            .files
            .get(&path::normalize(dir_id))
            .map_or(0, Vec::len)
    }

    fn find_dir(&self, state: &State, dir_id: &str) -> Option<(String, Entry)> {
        for (parent, children) in &state.dirs {
            for child in children {
                if full_id(self.addressing, parent, child.id()) == dir_id {
                    return Some((parent.clone(), child.clone()));
                }
            }
        }
        None
    }

    fn find_file(&self, state: &State, file_id: &str) -> Option<(String, Entry)> {
        for (parent, children) in &state.files {
            for child in children {
                if full_id(self.addressing, parent, child.id()) == file_id {
                    return Some((parent.clone(), child.clone()));
                }
            }
        }
        None
    }

    fn remove_dir_entry(&self, state: &mut State, dir_id: &str) -> Option<(String, Entry)> {
        let (parent, _) = self.find_dir(state, dir_id)?;
        let children = state.dirs.get_mut(&parent)?;
        let index = children
            .iter()
            .position(|child| full_id(self.addressing, &parent, child.id()) == dir_id)?;
        Some((parent.clone(), children.remove(index)))
    }

    fn remove_file_entry(&self, state: &mut State, file_id: &str) -> Option<(String, Entry)> {
        let (parent, _) = self.find_file(state, file_id)?;
        let children = state.files.get_mut(&parent)?;
        let index = children
            .iter()
            .position(|child| full_id(self.addressing, &parent, child.id()) == file_id)?;
        Some((parent.clone(), children.remove(index)))
    }

    /// Moves a directory's own buckets (and, under path addressing, every
    /// bucket beneath it) from `old_id` to `new_id`.
    fn rekey_buckets(&self, state: &mut State, old_id: &str, new_id: &str) {
        if old_id == new_id {
            return;
        }
        let rekey = |key: &str| -> Option<String> {
            if key == old_id {
                Some(new_id.to_string())
            } else if self.addressing == Addressing::FullPathAsId
                && key.starts_with(&format!("{old_id}/"))
            {
                Some(format!("{new_id}{}", &key[old_id.len()..]))
            } else {
                None
            }
        };
        for map in [&mut state.dirs, &mut state.files] {
            let moved: Vec<(String, String)> = map
                .keys()
                .filter_map(|key| rekey(key).map(|new| (key.clone(), new)))
                .collect();
            for (old, new) in moved {
                if let Some(bucket) = map.remove(&old) {
                    map.insert(new, bucket);
                }
            }
        }
        let moved: Vec<(String, String)> = state
            .contents
            .keys()
            .filter_map(|key| rekey(key).map(|new| (key.clone(), new)))
            .collect();
        for (old, new) in moved {
            if let Some(bytes) = state.contents.remove(&old) {
                state.contents.insert(new, bytes);
            }
        }
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn addressing(&self) -> Addressing {
        self.addressing
    }

    fn show_count_in_directories(&self) -> bool {
        self.show_counts
    }

    async fn drive(&self, _cancel: &CancellationToken) -> Result<Option<Drive>> {
        Ok(self.drive)
    }

    async fn trash_id(&self, _dir_id: &str, _cancel: &CancellationToken) -> Result<Option<String>> {
        let state = self.state.lock().expect("memory state poisoned");
        Ok(state.trash.clone())
    }

    async fn directories(&self, dir_id: &str, _cancel: &CancellationToken) -> Result<Vec<Entry>> {
        let state = self.state.lock().expect("memory state poisoned");
        Ok(state.dirs.get(dir_id).cloned().unwrap_or_default())
    }

    async fn files(&self, dir_id: &str, _cancel: &CancellationToken) -> Result<Vec<Entry>> {
        let state = self.state.lock().expect("memory state poisoned");
        Ok(state.files.get(dir_id).cloned().unwrap_or_default())
    }

    async fn directory(
        &self,
        dir_id: &str,
        _full: bool,
        _cancel: &CancellationToken,
    ) -> Result<Option<Entry>> {
        let state = self.state.lock().expect("memory state poisoned");
        Ok(self.find_dir(&state, dir_id).map(|(_, entry)| entry))
    }

    async fn file(
        &self,
        file_id: &str,
        _full: bool,
        _cancel: &CancellationToken,
    ) -> Result<Option<Entry>> {
        let state = self.state.lock().expect("memory state poisoned");
        Ok(self.find_file(&state, file_id).map(|(_, entry)| entry))
    }

    fn directory_parent_id(&self, directory: &Entry) -> Result<Option<String>> {
        let state = self.state.lock().expect("memory state poisoned");
        for (parent, children) in &state.dirs {
            if children.iter().any(|child| child.id() == directory.id()) {
                return Ok(Some(parent.clone()));
            }
        }
        Ok(None)
    }

    fn file_parent_id(&self, file: &Entry) -> Result<Option<String>> {
        let state = self.state.lock().expect("memory state poisoned");
        for (parent, children) in &state.files {
            if children.iter().any(|child| child.id() == file.id()) {
                return Ok(Some(parent.clone()));
            }
        }
        Ok(None)
    }

    async fn can_open_file(&self, _file_id: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(true)
    }

    async fn can_write_file(&self, _dir_id: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(true)
    }

    async fn can_create_directory(
        &self,
        _dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn can_update_directory(
        &self,
        _dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn can_update_file(&self, _file_id: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(true)
    }

    async fn can_copy_directory(
        &self,
        _source_dir_id: &str,
        _target_dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn can_copy_file(
        &self,
        _source_file_id: &str,
        _target_dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn can_move_directory(
        &self,
        _source_dir_id: &str,
        _target_dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn can_move_file(
        &self,
        _source_file_id: &str,
        _target_dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn can_delete_directory(
        &self,
        _dir_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn can_delete_file(&self, _file_id: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(true)
    }

    async fn can_search(&self, _dir_id: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(true)
    }

    async fn open_file(&self, file_id: &str, _cancel: &CancellationToken) -> Result<FileContent> {
        let state = self.state.lock().expect("memory state poisoned");
        let bytes = state
            .contents
            .get(file_id)
            .cloned()
            .ok_or_else(|| Error::provider(format!("no content for file {file_id}")))?;
        Ok(Box::pin(std::io::Cursor::new(bytes)))
    }

    async fn write_file(
        &self,
        dir_id: &str,
        file: Entry,
        mut content: FileContent,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        let mut bytes = Vec::new();
        content
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| Error::Provider(e.into()))?;
        let id = full_id(self.addressing, dir_id, file.id());
        let mut state = self.state.lock().expect("memory state poisoned");
        state.contents.insert(id.clone(), bytes);
        let bucket = state.files.entry(dir_id.to_string()).or_default();
        match bucket
            .iter()
            .position(|f| full_id(self.addressing, dir_id, f.id()) == id)
        {
            Some(index) => bucket[index] = file.clone(),
            None => bucket.push(file.clone()),
        }
        Ok(file)
    }

    async fn create_directory(
        &self,
        dir_id: &str,
        directory: Entry,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        let child = full_id(self.addressing, dir_id, directory.id());
        let mut state = self.state.lock().expect("memory state poisoned");
        state.dirs.entry(child.clone()).or_default();
        state.files.entry(child).or_default();
        state
            .dirs
            .entry(dir_id.to_string())
            .or_default()
            .push(directory.clone());
        Ok(directory)
    }

    async fn update_directory(
        &self,
        dir_id: &str,
        directory: Entry,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        let mut state = self.state.lock().expect("memory state poisoned");
        let (parent, _) = self
            .remove_dir_entry(&mut state, dir_id)
            .ok_or_else(|| Error::provider(format!("no directory {dir_id}")))?;
        let new_id = full_id(self.addressing, &parent, directory.id());
        self.rekey_buckets(&mut state, dir_id, &new_id);
        state
            .dirs
            .entry(parent)
            .or_default()
            .push(directory.clone());
        Ok(directory)
    }

    async fn update_file(
        &self,
        file_id: &str,
        file: Entry,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        let mut state = self.state.lock().expect("memory state poisoned");
        let (parent, _) = self
            .remove_file_entry(&mut state, file_id)
            .ok_or_else(|| Error::provider(format!("no file {file_id}")))?;
        let new_id = full_id(self.addressing, &parent, file.id());
        if new_id != file_id
            && let Some(bytes) = state.contents.remove(file_id)
        {
            state.contents.insert(new_id, bytes);
        }
        state.files.entry(parent).or_default().push(file.clone());
        Ok(file)
    }

    async fn copy_directory(
        &self,
        source_dir_id: &str,
        target_dir_id: &str,
        directory: Option<Entry>,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        let mut state = self.state.lock().expect("memory state poisoned");
        let source = self
            .find_dir(&state, source_dir_id)
            .map(|(_, entry)| entry)
            .ok_or_else(|| Error::provider(format!("no directory {source_dir_id}")))?;
        let copied = directory.unwrap_or(source);
        let child = full_id(self.addressing, target_dir_id, copied.id());
        state.dirs.entry(child.clone()).or_default();
        state.files.entry(child).or_default();
        state
            .dirs
            .entry(target_dir_id.to_string())
            .or_default()
            .push(copied.clone());
        Ok(copied)
    }

    async fn copy_file(
        &self,
        source_file_id: &str,
        target_dir_id: &str,
        file: Option<Entry>,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        let mut state = self.state.lock().expect("memory state poisoned");
        let source = self
            .find_file(&state, source_file_id)
            .map(|(_, entry)| entry)
            .ok_or_else(|| Error::provider(format!("no file {source_file_id}")))?;
        let copied = file.unwrap_or(source);
        let new_id = full_id(self.addressing, target_dir_id, copied.id());
        if let Some(bytes) = state.contents.get(source_file_id).cloned() {
            state.contents.insert(new_id, bytes);
        }
        state
            .files
            .entry(target_dir_id.to_string())
            .or_default()
            .push(copied.clone());
        Ok(copied)
    }

    async fn move_directory(
        &self,
        source_dir_id: &str,
        target_dir_id: &str,
        directory: Option<Entry>,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        let mut state = self.state.lock().expect("memory state poisoned");
        let (_, removed) = self
            .remove_dir_entry(&mut state, source_dir_id)
            .ok_or_else(|| Error::provider(format!("no directory {source_dir_id}")))?;
        let moved = directory.unwrap_or(removed);
        let new_id = full_id(self.addressing, target_dir_id, moved.id());
        self.rekey_buckets(&mut state, source_dir_id, &new_id);
        state
            .dirs
            .entry(target_dir_id.to_string())
            .or_default()
            .push(moved.clone());
        Ok(moved)
    }

    async fn move_file(
        &self,
        source_file_id: &str,
        target_dir_id: &str,
        file: Option<Entry>,
        _cancel: &CancellationToken,
    ) -> Result<Entry> {
        let mut state = self.state.lock().expect("memory state poisoned");
        let (_, removed) = self
            .remove_file_entry(&mut state, source_file_id)
            .ok_or_else(|| Error::provider(format!("no file {source_file_id}")))?;
        let moved = file.unwrap_or(removed);
        let new_id = full_id(self.addressing, target_dir_id, moved.id());
        if let Some(bytes) = state.contents.remove(source_file_id) {
            state.contents.insert(new_id, bytes);
        }
        state
            .files
            .entry(target_dir_id.to_string())
            .or_default()
            .push(moved.clone());
        Ok(moved)
    }

    async fn delete_directory(
        &self,
        dir_id: &str,
        send_to_trash: bool,
        _cancel: &CancellationToken,
    ) -> Result<Option<Entry>> {
        let mut state = self.state.lock().expect("memory state poisoned");
        let Some((_, removed)) = self.remove_dir_entry(&mut state, dir_id) else {
            return Ok(None);
        };
        let trash = state.trash.clone().filter(|_| send_to_trash);
        match trash {
            Some(trash) => {
                let new_id = full_id(self.addressing, &trash, removed.id());
                self.rekey_buckets(&mut state, dir_id, &new_id);
                state.dirs.entry(trash).or_default().push(removed.clone());
            }
            None => {
                state.dirs.remove(dir_id);
                state.files.remove(dir_id);
            }
        }
        Ok(Some(removed))
    }

    async fn delete_file(
        &self,
        file_id: &str,
        send_to_trash: bool,
        _cancel: &CancellationToken,
    ) -> Result<Option<Entry>> {
        let mut state = self.state.lock().expect("memory state poisoned");
        let Some((_, removed)) = self.remove_file_entry(&mut state, file_id) else {
            return Ok(None);
        };
        let trash = state.trash.clone().filter(|_| send_to_trash);
        match trash {
            Some(trash) => {
                let new_id = full_id(self.addressing, &trash, removed.id());
                if let Some(bytes) = state.contents.remove(file_id) {
                    state.contents.insert(new_id, bytes);
                }
                state.files.entry(trash).or_default().push(removed.clone());
            }
            None => {
                state.contents.remove(file_id);
            }
        }
        Ok(Some(removed))
    }

    async fn search(
        &self,
        dir_id: &str,
        query: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        let state = self.state.lock().expect("memory state poisoned");
        let query = query.to_lowercase();
        let in_scope = |bucket: &str| -> bool {
            match self.addressing {
                Addressing::FullPathAsId => {
                    dir_id.is_empty()
                        || bucket == dir_id
                        || bucket.starts_with(&format!("{dir_id}/"))
                }
                Addressing::OpaqueId => true,
            }
        };
        let mut hits = Vec::new();
        for map in [&state.dirs, &state.files] {
            for (bucket, children) in map {
                if !in_scope(bucket) {
                    continue;
                }
                for child in children {
                    if child.name().to_lowercase().contains(&query) {
                        hits.push(SearchHit {
                            directory_id: bucket.clone(),
                            entry: std::sync::Arc::new(child.clone()),
                        });
                    }
                }
            }
        }
        Ok(hits)
    }
}
