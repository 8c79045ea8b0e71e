//! Persisted selection of controls that the poller publishes.
//!
//! The backing file is a single JSON object `{"enabled": {"<uuid>": bool}}`.
//! Every mutation rewrites the whole file; batch pruning goes through
//! [`SelectionStore::sync_from`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};


/// On-disk layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct SelectionFile {
    #[serde(default)]
    enabled: BTreeMap<String, Value>,
}

/// Durable write of the selection file failed
#[derive(Debug)]
pub enum PersistenceError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize(serde_json::Error),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Io { path, source } => {
                write!(f, "failed to write selection file {}: {}", path.display(), source)
            }
            PersistenceError::Serialize(e) => write!(f, "failed to serialize selection: {}", e),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistenceError::Io { source, .. } => Some(source),
            PersistenceError::Serialize(e) => Some(e),
        }
    }
}

/// Enabled flag per control uuid, guarded by a single lock.
pub struct SelectionStore {
    path: PathBuf,
    enabled: Mutex<BTreeMap<String, bool>>,
}

impl SelectionStore {
    /// Load the store from `path`.
    ///
    /// A missing file starts empty. An unreadable or corrupt file is logged and
    /// also starts empty; it never blocks startup.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let enabled = load_file(&path);
        debug!(path = %path.display(), entries = enabled.len(), "Selection store loaded");
        Self {
            path,
            enabled: Mutex::new(enabled),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the full mapping, including disabled entries.
    pub fn as_mapping(&self) -> BTreeMap<String, bool> {
        self.enabled.lock().unwrap().clone()
    }

    pub fn is_enabled(&self, uuid: &str) -> bool {
        self.enabled
            .lock()
            .unwrap()
            .get(uuid)
            .copied()
            .unwrap_or(false)
    }

    /// Set the flag for `uuid` and persist the whole mapping.
    ///
    /// On a failed write the previous flag is restored.
    pub fn set_enabled(&self, uuid: &str, enabled: bool) -> Result<(), PersistenceError> {
        let mut map = self.enabled.lock().unwrap();
        let previous = map.insert(uuid.to_string(), enabled);
        if let Err(e) = save_file(&self.path, &map) {
            match previous {
                Some(flag) => map.insert(uuid.to_string(), flag),
                None => map.remove(uuid),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Ids whose flag is currently true.
    pub fn enabled_ids(&self) -> HashSet<String> {
        self.enabled
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(uuid, _)| uuid.clone())
            .collect()
    }

    /// Drop every stored id not contained in `known`.
    ///
    /// Persists only when something was removed; a failed write keeps the
    /// entries. Returns the number of pruned ids.
    pub fn sync_from<I, S>(&self, known: I) -> Result<usize, PersistenceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let known: HashSet<String> = known.into_iter().map(|s| s.as_ref().to_string()).collect();

        let mut map = self.enabled.lock().unwrap();
        let (kept, stale): (BTreeMap<_, _>, BTreeMap<_, _>) = std::mem::take(&mut *map)
            .into_iter()
            .partition(|(uuid, _)| known.contains(uuid));
        *map = kept;

        if stale.is_empty() {
            return Ok(0);
        }
        if let Err(e) = save_file(&self.path, &map) {
            map.extend(stale);
            return Err(e);
        }
        debug!(pruned = stale.len(), "Pruned stale selection entries");
        Ok(stale.len())
    }
}

fn load_file(path: &Path) -> BTreeMap<String, bool> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read selection file, starting empty");
            return BTreeMap::new();
        }
    };

    match serde_json::from_str::<SelectionFile>(&contents) {
        Ok(file) => file
            .enabled
            .into_iter()
            .map(|(uuid, value)| (uuid, is_truthy(&value)))
            .collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Selection file is corrupt, starting empty");
            BTreeMap::new()
        }
    }
}

/// Coerce hand-edited values (`1`, `"yes"`, `null`) into a flag.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Full rewrite via a temporary file and rename.
fn save_file(path: &Path, map: &BTreeMap<String, bool>) -> Result<(), PersistenceError> {
    let io_err = |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = SelectionFile {
        enabled: map
            .iter()
            .map(|(uuid, enabled)| (uuid.clone(), Value::Bool(*enabled)))
            .collect(),
    };
    let json = serde_json::to_string_pretty(&file).map_err(PersistenceError::Serialize)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = fs::File::create(&tmp_path).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp_path, path).map_err(io_err)?;

    Ok(())
}
