//! Definition persistence
//!
//! Agent cards, chain steps and the default loop count survive restarts in
//! a single JSON document. Writes go to a sibling temp file first and are
//! renamed into place, so a crash mid-write leaves the previous document.
//! Workspaces and their saved sessions live in [`workspace`].

pub mod workspace;

pub use workspace::{JsonWorkspaceStore, SavedSession, WorkspaceMeta};

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use sdk::errors::EngineError;
use sdk::types::{AgentCard, ChainStep, RunDefinitions};

/// Storage for run definitions
pub trait DefinitionStore: Send + Sync {
    /// Load the stored definitions; a missing store yields defaults
    fn load(&self) -> Result<RunDefinitions, EngineError>;

    fn save(&self, definitions: &RunDefinitions) -> Result<(), EngineError>;

    /// Register an agent card, replacing one with the same name
    fn upsert_agent(&self, card: AgentCard) -> Result<RunDefinitions, EngineError> {
        let mut definitions = self.load()?;
        match definitions.agents.iter_mut().find(|a| a.name == card.name) {
            Some(existing) => *existing = card,
            None => definitions.agents.push(card),
        }
        self.save(&definitions)?;
        Ok(definitions)
    }

    /// Remove an agent card by name; returns whether one was removed
    fn remove_agent(&self, name: &str) -> Result<bool, EngineError> {
        let mut definitions = self.load()?;
        let before = definitions.agents.len();
        definitions.agents.retain(|a| a.name != name);
        let removed = definitions.agents.len() != before;
        if removed {
            self.save(&definitions)?;
        }
        Ok(removed)
    }

    /// Replace the stored chain steps
    fn set_chain(&self, steps: Vec<ChainStep>) -> Result<(), EngineError> {
        let mut definitions = self.load()?;
        definitions.chain_steps = steps;
        self.save(&definitions)
    }
}

/// Pretty-printed JSON file store
#[derive(Debug, Clone)]
pub struct JsonDefinitionStore {
    path: PathBuf,
}

impl JsonDefinitionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        temp_path(&self.path)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "store.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `content` next to `path` and rename it into place
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            EngineError::Persistence(format!("Failed to create {:?}: {}", parent, e))
        })?;
    }

    let temp = temp_path(path);
    fs::write(&temp, content)
        .map_err(|e| EngineError::Persistence(format!("Failed to write {:?}: {}", temp, e)))?;
    fs::rename(&temp, path)
        .map_err(|e| EngineError::Persistence(format!("Failed to replace {:?}: {}", path, e)))
}

impl DefinitionStore for JsonDefinitionStore {
    fn load(&self) -> Result<RunDefinitions, EngineError> {
        if !self.path.exists() {
            debug!("No definitions at {:?}, using defaults", self.path);
            return Ok(RunDefinitions::default());
        }

        let content = fs::read_to_string(&self.path).map_err(|e| {
            EngineError::Persistence(format!("Failed to read {:?}: {}", self.path, e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            EngineError::Persistence(format!("Failed to parse {:?}: {}", self.path, e))
        })
    }

    fn save(&self, definitions: &RunDefinitions) -> Result<(), EngineError> {
        let content = serde_json::to_string_pretty(definitions).map_err(|e| {
            EngineError::Persistence(format!("Failed to serialize definitions: {}", e))
        })?;
        write_atomic(&self.path, &content)?;

        debug!(
            "Saved {} agents and {} chain steps to {:?}",
            definitions.agents.len(),
            definitions.chain_steps.len(),
            self.path
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::types::FeedTarget;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = tempdir().unwrap();
        let store = JsonDefinitionStore::new(dir.path().join("defs.json"));
        assert_eq!(store.load().unwrap(), RunDefinitions::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let store = JsonDefinitionStore::new(dir.path().join("nested").join("defs.json"));

        let defs = RunDefinitions {
            agents: vec![AgentCard::new("analyst", "qwen2.5:7b", "You analyse.")
                .with_feed(FeedTarget::Scratchpad)],
            chain_steps: vec![ChainStep::new("draft", "llama3.1:8b")],
            loop_count: 3,
        };
        store.save(&defs).unwrap();

        assert_eq!(store.load().unwrap(), defs);
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_upsert_and_remove_agent() {
        let dir = tempdir().unwrap();
        let store = JsonDefinitionStore::new(dir.path().join("defs.json"));

        store.upsert_agent(AgentCard::new("a", "m1", "first")).unwrap();
        store.upsert_agent(AgentCard::new("b", "m1", "second")).unwrap();
        let defs = store.upsert_agent(AgentCard::new("a", "m2", "replaced")).unwrap();

        assert_eq!(defs.agents.len(), 2);
        assert_eq!(defs.agents[0].name, "a");
        assert_eq!(defs.agents[0].model, "m2");

        assert!(store.remove_agent("a").unwrap());
        assert!(!store.remove_agent("a").unwrap());
        assert_eq!(store.load().unwrap().agents.len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_persistence_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("defs.json");
        fs::write(&path, "{ not json").unwrap();

        let store = JsonDefinitionStore::new(path);
        assert!(matches!(store.load(), Err(EngineError::Persistence(_))));
    }
}
