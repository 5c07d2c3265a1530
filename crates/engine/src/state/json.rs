//! JSON files on disk, one per stack.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dirs_next::{config_dir, home_dir};
use tracing::{debug, warn};

use super::{StackState, StateStore, StateStoreError, validate_stack_name};

/// Environment variable overriding the state directory.
pub const STATE_PATH_ENV: &str = "STRATA_STATE_PATH";

/// Directory under the Strata config directory holding stack files.
pub const STATE_DIR_NAME: &str = "state";

/// JSON-backed state store persisted on disk.
pub struct JsonStateStore {
    directory: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStateStore {
    /// Create a store rooted at the provided directory (or the default one when omitted).
    pub fn new<P: Into<Option<PathBuf>>>(directory: P) -> Self {
        let directory = match directory.into() {
            Some(directory) => expand_tilde_path(directory),
            None => default_state_dir(),
        };
        Self {
            directory,
            write_lock: Mutex::new(()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the file holding one stack's state.
    pub fn stack_path(&self, stack_name: &str) -> PathBuf {
        self.directory.join(format!("{stack_name}.json"))
    }
}

impl StateStore for JsonStateStore {
    fn load(&self, stack_name: &str) -> Result<Option<StackState>, StateStoreError> {
        validate_stack_name(stack_name)?;
        let path = self.stack_path(stack_name);
        match fs::read_to_string(&path) {
            // An unreadable file still describes live resources; it is left in place.
            Ok(content) => serde_json::from_str::<StackState>(&content).map(Some).map_err(|error| {
                warn!("Failed to parse state file at {}: {}", path.display(), error);
                StateStoreError::Serialization(error)
            }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(StateStoreError::Io(error)),
        }
    }

    fn save(&self, state: &StackState) -> Result<(), StateStoreError> {
        validate_stack_name(&state.stack_name)?;
        let _guard = self.write_lock.lock().expect("state lock poisoned");
        fs::create_dir_all(&self.directory)?;

        let path = self.stack_path(&state.stack_name);
        let staging = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&staging, content)?;
        fs::rename(&staging, &path)?;
        debug!(stack = %state.stack_name, path = %path.display(), "saved stack state");
        Ok(())
    }

    fn remove(&self, stack_name: &str) -> Result<(), StateStoreError> {
        validate_stack_name(stack_name)?;
        let _guard = self.write_lock.lock().expect("state lock poisoned");
        match fs::remove_file(self.stack_path(stack_name)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(StateStoreError::Io(error)),
        }
    }

    fn list_stacks(&self) -> Result<Vec<String>, StateStoreError> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(StateStoreError::Io(error)),
        };

        let mut stacks = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|extension| extension == "json")
                && let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
                && validate_stack_name(stem).is_ok()
            {
                stacks.push(stem.to_string());
            }
        }
        stacks.sort();
        Ok(stacks)
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde_path(path: PathBuf) -> PathBuf {
    if let Some(first) = path.components().next()
        && first.as_os_str() != "~"
    {
        return path;
    }

    let input = path.to_string_lossy();
    let trimmed = input.trim();

    if trimmed == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }

    if let Some(rest) = trimmed.strip_prefix("~/") {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }

    PathBuf::from(trimmed)
}

/// `STRATA_STATE_PATH` when set, else `<config_dir>/strata/state`.
pub fn default_state_dir() -> PathBuf {
    if let Ok(path) = env::var(STATE_PATH_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde_path(PathBuf::from(path));
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("strata")
        .join(STATE_DIR_NAME)
}
