use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use ::log::debug;
use serde::{Deserialize, Serialize};

use super::{NodeId, RaftError, Term};

/// The part of a node's state that must outlive the process: the newest
/// term it has seen and whom it voted for in that term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// Holds a node's [`PersistentState`], either in memory only or mirrored to
/// a JSON file that is read back on restart.
#[derive(Debug, Default)]
pub struct ServerStore {
    state: PersistentState,
    path: Option<PathBuf>,
}

impl ServerStore {
    /// A store that forgets everything when the node stops.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the store at `path`. A missing or empty file means a fresh node.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RaftError> {
        let mut store = Self {
            state: PersistentState::default(),
            path: Some(path.as_ref().to_path_buf()),
        };
        store.load_from_disk()?;
        Ok(store)
    }

    pub fn state(&self) -> &PersistentState {
        &self.state
    }

    pub fn term(&self) -> Term {
        self.state.term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.state.voted_for.as_ref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records `term` and `voted_for`. Returns `Ok(false)` when nothing
    /// changed, in which case the disk is not touched.
    pub fn save(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<bool, RaftError> {
        let next = PersistentState { term, voted_for };
        if next == self.state {
            return Ok(false);
        }
        self.state = next;
        self.save_to_disk()?;
        Ok(true)
    }

    fn load_from_disk(&mut self) -> Result<(), RaftError> {
        let path = match &self.path {
            Some(path) if path.exists() => path,
            _ => return Ok(()),
        };

        let raw = fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(());
        }
        self.state = serde_json::from_str(&raw)
            .map_err(|e| RaftError::Serialization(e.to_string()))?;
        debug!(
            "Loaded term {} and vote {:?} from {}",
            self.state.term,
            self.state.voted_for,
            path.display()
        );
        Ok(())
    }

    fn save_to_disk(&self) -> Result<(), RaftError> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let encoded = serde_json::to_string_pretty(&self.state)
            .map_err(|e| RaftError::Serialization(e.to_string()))?;

        // Write beside the target and rename, so a crash mid-write never
        // leaves a torn file behind.
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(encoded.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
