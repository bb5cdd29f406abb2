//! Workspaces
//!
//! A workspace is a named case folder under the workspaces root. It holds a
//! `metadata.json` describing the case and one JSON document per saved
//! session (the request together with the report it produced).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use sdk::errors::EngineError;
use sdk::types::RunRequest;

use super::write_atomic;
use crate::run::RunReport;

const METADATA_FILE: &str = "metadata.json";

/// Metadata of one workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Saved session ids, oldest first
    #[serde(default)]
    pub sessions: Vec<String>,
}

/// A run saved into a workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSession {
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    pub request: RunRequest,
    pub report: RunReport,
}

/// Workspace folders of pretty-printed JSON documents
#[derive(Debug, Clone)]
pub struct JsonWorkspaceStore {
    root: PathBuf,
}

impl JsonWorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create an empty workspace; an existing one is left untouched
    pub fn create(
        &self,
        name: &str,
        description: Option<String>,
    ) -> Result<WorkspaceMeta, EngineError> {
        validate_name(name)?;
        let dir = self.root.join(name);
        if dir.join(METADATA_FILE).exists() {
            return Err(EngineError::InvalidRequest(format!(
                "Workspace {} already exists",
                name
            )));
        }

        let meta = WorkspaceMeta {
            name: name.to_string(),
            description: description.filter(|d| !d.trim().is_empty()),
            created_at: Utc::now(),
            sessions: Vec::new(),
        };
        self.write_meta(&meta)?;
        info!("Created workspace {} at {:?}", name, dir);
        Ok(meta)
    }

    /// Metadata of an existing workspace
    pub fn get(&self, name: &str) -> Result<WorkspaceMeta, EngineError> {
        validate_name(name)?;
        let path = self.root.join(name).join(METADATA_FILE);
        if !path.exists() {
            return Err(EngineError::UnknownWorkspace(name.to_string()));
        }
        read_json(&path)
    }

    /// Every workspace under the root, sorted by name
    ///
    /// Folders without readable metadata are skipped.
    pub fn list(&self) -> Result<Vec<WorkspaceMeta>, EngineError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.root).map_err(|e| {
            EngineError::Persistence(format!("Failed to read {:?}: {}", self.root, e))
        })?;

        let mut workspaces = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path().join(METADATA_FILE);
            if !path.is_file() {
                continue;
            }
            match read_json::<WorkspaceMeta>(&path) {
                Ok(meta) => workspaces.push(meta),
                Err(e) => warn!("Skipping workspace at {:?}: {}", entry.path(), e),
            }
        }
        workspaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workspaces)
    }

    /// Save a finished run into a workspace and return the stored session
    pub fn save_session(
        &self,
        name: &str,
        request: &RunRequest,
        report: &RunReport,
    ) -> Result<SavedSession, EngineError> {
        let mut meta = self.get(name)?;

        let saved_at = Utc::now();
        let short_run: String = report.run_id.chars().filter(|c| *c != '-').take(8).collect();
        let session = SavedSession {
            session_id: format!("session_{}_{}", saved_at.format("%Y%m%dT%H%M%S"), short_run),
            saved_at,
            request: request.clone(),
            report: report.clone(),
        };

        let path = self.session_path(name, &session.session_id);
        let content = serde_json::to_string_pretty(&session)
            .map_err(|e| EngineError::Persistence(format!("Failed to serialize session: {}", e)))?;
        write_atomic(&path, &content)?;

        // The session file lands before the metadata that lists it
        meta.sessions.push(session.session_id.clone());
        self.write_meta(&meta)?;

        info!("Saved session {} to workspace {}", session.session_id, name);
        Ok(session)
    }

    /// Saved sessions of a workspace, oldest first
    pub fn sessions(&self, name: &str) -> Result<Vec<SavedSession>, EngineError> {
        self.get(name)?;
        let dir = self.root.join(name);
        let entries = fs::read_dir(&dir)
            .map_err(|e| EngineError::Persistence(format!("Failed to read {:?}: {}", dir, e)))?;

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_session = path.extension().is_some_and(|ext| ext == "json")
                && path.file_name().is_some_and(|n| n != METADATA_FILE);
            if !is_session {
                continue;
            }
            match read_json::<SavedSession>(&path) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Skipping session file {:?}: {}", path, e),
            }
        }
        sessions.sort_by(|a, b| {
            a.saved_at
                .cmp(&b.saved_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        debug!("Loaded {} sessions from workspace {}", sessions.len(), name);
        Ok(sessions)
    }

    fn session_path(&self, name: &str, session_id: &str) -> PathBuf {
        self.root.join(name).join(format!("{}.json", session_id))
    }

    fn write_meta(&self, meta: &WorkspaceMeta) -> Result<(), EngineError> {
        let content = serde_json::to_string_pretty(meta).map_err(|e| {
            EngineError::Persistence(format!("Failed to serialize workspace metadata: {}", e))
        })?;
        write_atomic(&self.root.join(&meta.name).join(METADATA_FILE), &content)
    }
}

/// Workspace names become folder names
fn validate_name(name: &str) -> Result<(), EngineError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidRequest(format!(
            "Invalid workspace name {:?}: use letters, digits, '-', '_' or '.'",
            name
        )))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, EngineError> {
    let content = fs::read_to_string(path)
        .map_err(|e| EngineError::Persistence(format!("Failed to read {:?}: {}", path, e)))?;
    serde_json::from_str(&content)
        .map_err(|e| EngineError::Persistence(format!("Failed to parse {:?}: {}", path, e)))
}
