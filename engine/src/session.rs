//! Session
//!
//! Owns the ingested files of one operator session and the fractal store
//! that indexes them. The orchestrator reads files through
//! [`Session::active_files`]; only the session mutates them.

use std::sync::Arc;
use tracing::{debug, info};

use sdk::errors::EngineError;
use sdk::types::FileEntry;

use crate::context::{FractalStore, IndexStatus};

pub struct Session {
    files: Vec<FileEntry>,
    store: Arc<FractalStore>,
    auto_index: bool,
}

impl Session {
    pub fn new(store: Arc<FractalStore>) -> Self {
        Self {
            files: Vec::new(),
            store,
            auto_index: false,
        }
    }

    /// Index every file as soon as it is added or its text changes
    pub fn with_auto_index(mut self, auto_index: bool) -> Self {
        self.auto_index = auto_index;
        self
    }

    pub fn store(&self) -> &FractalStore {
        &self.store
    }

    /// Ingest extracted text and return the new file id
    pub async fn add_file(&mut self, name: impl Into<String>, text: impl Into<String>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let entry = FileEntry::new(id.clone(), name, text);
        info!("Added file {} ({} chars)", entry.name, entry.char_len());

        if self.auto_index {
            self.store.index(&entry).await;
        }
        self.files.push(entry);
        id
    }

    pub fn file(&self, id: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.id == id)
    }

    /// All files in ingestion order
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Files taking part in context injection, in ingestion order
    pub fn active_files(&self) -> Vec<FileEntry> {
        self.files.iter().filter(|f| f.active).cloned().collect()
    }

    pub fn set_active(&mut self, id: &str, active: bool) -> Result<(), EngineError> {
        let file = self.file_mut(id)?;
        file.active = active;
        debug!("File {} active={}", id, active);
        Ok(())
    }

    /// Replace a file's text; its index is dropped and rebuilt on demand
    pub async fn update_text(&mut self, id: &str, text: impl Into<String>) -> Result<(), EngineError> {
        let auto_index = self.auto_index;
        let store = Arc::clone(&self.store);
        let file = self.file_mut(id)?;
        file.text = text.into();

        store.invalidate(id).await;
        if auto_index {
            store.index(file).await;
        }
        Ok(())
    }

    pub async fn remove_file(&mut self, id: &str) -> Result<FileEntry, EngineError> {
        let position = self
            .files
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| EngineError::UnknownFile(id.to_string()))?;
        self.store.remove(id).await;
        Ok(self.files.remove(position))
    }

    /// Build (or confirm) the index of every active file
    ///
    /// Returns how many indexes were actually rebuilt.
    pub async fn index_active_files(&self) -> usize {
        let mut built = 0;
        for file in self.files.iter().filter(|f| f.active) {
            if self.store.index(file).await == IndexStatus::Built {
                built += 1;
            }
        }
        built
    }

    fn file_mut(&mut self, id: &str) -> Result<&mut FileEntry, EngineError> {
        self.files
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| EngineError::UnknownFile(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{IndexParams, KeywordOverlapScorer, TextChunker};

    fn session() -> Session {
        let store = FractalStore::new(
            TextChunker::new(32, 8).unwrap(),
            IndexParams::default(),
            Arc::new(KeywordOverlapScorer),
        );
        Session::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_add_and_toggle() {
        let mut session = session();
        let a = session.add_file("a.txt", "alpha").await;
        let b = session.add_file("b.txt", "beta").await;
        assert_ne!(a, b);

        session.set_active(&a, false).unwrap();
        let active = session.active_files();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "b.txt");
    }

    #[tokio::test]
    async fn test_unknown_file() {
        let mut session = session();
        assert!(matches!(
            session.set_active("nope", true),
            Err(EngineError::UnknownFile(_))
        ));
        assert!(session.remove_file("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_update_text_invalidates_index() {
        let mut session = session();
        let id = session.add_file("a.txt", "original text here").await;
        assert_eq!(session.index_active_files().await, 1);
        assert_eq!(session.index_active_files().await, 0);

        session.update_text(&id, "replacement text").await.unwrap();
        assert!(!session.store().is_indexed(&id).await);
        assert_eq!(session.index_active_files().await, 1);
    }

    #[tokio::test]
    async fn test_auto_index_on_add() {
        let mut session = session().with_auto_index(true);
        let id = session.add_file("a.txt", "indexed immediately").await;
        assert!(session.store().is_indexed(&id).await);

        let removed = session.remove_file(&id).await.unwrap();
        assert_eq!(removed.name, "a.txt");
        assert!(!session.store().is_indexed(&id).await);
    }
}
