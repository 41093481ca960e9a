//! JSON documents with atomic replace-on-save semantics.
//!
//! Each document keeps its contents in memory behind a mutex. Every update
//! rewrites the whole file through a temp file in the same directory followed
//! by a rename, so readers only ever see a complete document.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::StoreError;

/// Load a document, treating a missing or unparsable file as empty.
pub fn load_document<T: DeserializeOwned + Default>(path: &Path) -> T {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!("Store: {} does not exist yet, starting empty", path.display());
            return T::default();
        }
        Err(e) => {
            tracing::warn!("Store: Failed to read {}, starting empty: {}", path.display(), e);
            return T::default();
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!("Store: {} is corrupt, starting empty: {}", path.display(), e);
            T::default()
        }
    }
}

/// Serialize `doc` to a temp file next to `path`, fsync it and rename it into place.
pub fn save_document<T: Serialize>(path: &Path, doc: &T) -> Result<(), StoreError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(&temp_prefix(path))
        .suffix(".tmp")
        .tempfile_in(parent_dir(path))?;

    serde_json::to_writer_pretty(&mut tmp, doc)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;

    // Temp files are created 0600; the dashboard runs as another user.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file().set_permissions(fs::Permissions::from_mode(0o644))?;
    }

    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

fn temp_prefix(path: &Path) -> OsString {
    let mut prefix = OsString::from(".");
    prefix.push(path.file_name().unwrap_or_default());
    prefix.push(".");
    prefix
}

/// Remove temp files an interrupted save left behind.
fn remove_stale_temp_files(path: &Path) {
    let prefix = temp_prefix(path);
    let prefix = prefix.to_string_lossy();

    let entries = match fs::read_dir(parent_dir(path)) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(prefix.as_ref()) && name.ends_with(".tmp") {
            match fs::remove_file(entry.path()) {
                Ok(()) => tracing::info!("Store: Removed stale temp file {}", entry.path().display()),
                Err(e) => tracing::warn!(
                    "Store: Failed to remove stale temp file {}: {}",
                    entry.path().display(),
                    e
                ),
            }
        }
    }
}

struct DocumentState<T> {
    value: T,
    dirty: bool,
}

/// A JSON document guarded by its own lock.
pub struct Document<T> {
    path: PathBuf,
    state: Mutex<DocumentState<T>>,
}

impl<T> Document<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Open the document at `path`, loading whatever is on disk.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        remove_stale_temp_files(&path);
        let value = load_document(&path);
        Self {
            path,
            state: Mutex::new(DocumentState { value, dirty: false }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the in-memory contents.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock().value)
    }

    /// Mutate the document and save it.
    ///
    /// The mutation is kept in memory even when the save fails; the document
    /// stays dirty and the next update or [`Document::flush`] writes it again.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, StoreError> {
        let mut state = self.lock();
        let out = f(&mut state.value);
        state.dirty = true;
        save_document(&self.path, &state.value)?;
        state.dirty = false;
        Ok(out)
    }

    /// Write the document if an earlier save failed. Returns whether a write happened.
    pub fn flush(&self) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if !state.dirty {
            return Ok(false);
        }
        save_document(&self.path, &state.value)?;
        state.dirty = false;
        Ok(true)
    }

    fn lock(&self) -> MutexGuard<'_, DocumentState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> Document<BTreeMap<String, S>>
where
    S: Serialize + DeserializeOwned + Clone,
{
    /// Replace the given entries in one save, leaving every other entry as it
    /// was. Returns how many entries were merged; nothing is written for none.
    pub fn merge_and_save<K: Into<String>>(
        &self,
        entries: impl IntoIterator<Item = (K, S)>,
    ) -> Result<usize, StoreError> {
        let entries: Vec<(String, S)> = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        if entries.is_empty() {
            return Ok(0);
        }
        self.update(|doc| {
            let merged = entries.len();
            doc.extend(entries);
            merged
        })
    }

    pub fn get(&self, key: &str) -> Option<S> {
        self.read(|doc| doc.get(key).cloned())
    }
}
