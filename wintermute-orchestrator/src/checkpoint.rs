//! Filesystem checkpoints: run state written after every successful node so
//! a failed run can resume at the next node.
//!
//! Files are named `<seq:03>-<node>.json` under `<root>/<run_id>/`, so the
//! latest checkpoint is simply the lexicographically last file.

use std::path::{Path, PathBuf};

use wintermute_core::error::{InfraError, WintermuteError};
use wintermute_core::state::RunState;

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

/// The most recent checkpoint of a run.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub seq: u32,
    pub node: String,
    pub state: RunState,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn default_root() -> Self {
        Self::new(".checkpoints")
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn save(
        &self,
        run_id: &str,
        seq: u32,
        node: &str,
        state: &RunState,
    ) -> Result<PathBuf, WintermuteError> {
        let dir = self.run_dir(run_id);
        std::fs::create_dir_all(&dir).map_err(InfraError::Io)?;
        let path = dir.join(format!("{seq:03}-{node}.json"));
        let payload =
            serde_json::to_vec_pretty(state).map_err(|e| InfraError::Serde(e.to_string()))?;
        std::fs::write(&path, payload).map_err(InfraError::Io)?;
        tracing::debug!(run_id, node, seq, "checkpoint saved");
        Ok(path)
    }

    /// Latest checkpoint for a run, or `None` when nothing was saved.
    pub fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>, WintermuteError> {
        let dir = self.run_dir(run_id);
        if !dir.exists() {
            return Ok(None);
        }

        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .map_err(InfraError::Io)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".json"))
            .collect();
        names.sort();

        let Some(latest) = names.last() else {
            return Ok(None);
        };
        let (seq, node) = parse_name(latest).ok_or_else(|| {
            InfraError::Config(format!("unrecognized checkpoint file name '{latest}'"))
        })?;

        let raw = std::fs::read_to_string(dir.join(latest)).map_err(InfraError::Io)?;
        let state: RunState =
            serde_json::from_str(&raw).map_err(|e| InfraError::Serde(e.to_string()))?;
        Ok(Some(Checkpoint { seq, node, state }))
    }

    pub fn clear(&self, run_id: &str) -> Result<(), WintermuteError> {
        let dir = self.run_dir(run_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(InfraError::Io)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn parse_name(name: &str) -> Option<(u32, String)> {
    let stem = name.strip_suffix(".json")?;
    let (seq, node) = stem.split_once('-')?;
    Some((seq.parse().ok()?, node.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn save_and_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let mut state = RunState::new("topic", "rust", "run-1", "dossier");
        store.save("run-1", 1, "ingest", &state).unwrap();
        state.insert("claims", json!([{"text": "x"}]));
        store.save("run-1", 2, "extract_claims", &state).unwrap();

        let checkpoint = store.latest("run-1").unwrap().unwrap();
        assert_eq!(checkpoint.seq, 2);
        assert_eq!(checkpoint.node, "extract_claims");
        assert!(checkpoint.state.contains("claims"));
    }

    #[test]
    fn double_digit_sequences_sort_after_single() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let state = RunState::new("topic", "rust", "run-2", "dossier");
        for seq in 1..=11 {
            store.save("run-2", seq, "loop_node", &state).unwrap();
        }
        let checkpoint = store.latest("run-2").unwrap().unwrap();
        assert_eq!(checkpoint.seq, 11);
    }

    #[test]
    fn missing_run_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.latest("never-ran").unwrap().is_none());
    }

    #[test]
    fn node_names_with_dashes_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let state = RunState::new("topic", "rust", "run-3", "dossier");
        store.save("run-3", 7, "qa-gate-check", &state).unwrap();
        let checkpoint = store.latest("run-3").unwrap().unwrap();
        assert_eq!(checkpoint.seq, 7);
        assert_eq!(checkpoint.node, "qa-gate-check");
    }

    #[test]
    fn clear_removes_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let state = RunState::new("topic", "rust", "run-4", "dossier");
        store.save("run-4", 1, "ingest", &state).unwrap();
        store.clear("run-4").unwrap();
        assert!(store.latest("run-4").unwrap().is_none());
    }
}
