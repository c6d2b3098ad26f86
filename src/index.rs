//! Remembers which file inside a multi-file archive the user picked for a game.

use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::store::{quote, IniStore, StoreError};

/// Name of the selection index file inside the config directory.
pub const INDEX_FILE: &str = "game-index.ini";

const SELECTED_FILE_KEY: &str = "SelectedFile";

/// Game id → selected file, persisted after every change.
#[derive(Debug, Clone)]
pub struct CacheIndex {
    path: PathBuf,
    store: Option<IniStore>,
}

impl CacheIndex {
    /// Load the index. A missing or unreadable file behaves as an empty index.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let store = if path.exists() {
            match IniStore::load(&path) {
                Ok(store) => Some(store),
                Err(e) => {
                    error!("Error parsing game index file from {}: {}", path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        Self { path, store }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Selected file for `game_id`, or an empty string when none was recorded.
    pub fn get_selected_file(&self, game_id: &str) -> String {
        let selected = self
            .store
            .as_ref()
            .and_then(|s| s.get_value(game_id, SELECTED_FILE_KEY))
            .unwrap_or_default()
            .to_string();

        if !selected.is_empty() {
            info!("Selected {} for game {} in index.", selected, game_id);
        }
        selected
    }

    /// Record a selection and write the index straight away.
    pub fn set_selected_file(&mut self, game_id: &str, selected_file: &str) -> Result<(), StoreError> {
        info!("Writing selected {} for game {} to index.", selected_file, game_id);
        self.store
            .get_or_insert_with(IniStore::new)
            .set_value(game_id, SELECTED_FILE_KEY, quote(selected_file));
        self.save()
    }

    fn save(&self) -> Result<(), StoreError> {
        match &self.store {
            Some(store) => store.save(&self.path),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_missing_index_is_empty() {
        let dir = tempdir().unwrap();
        let index = CacheIndex::load(dir.path().join(INDEX_FILE));
        assert_eq!(index.get_selected_file("any"), "");
    }

    #[test]
    fn test_set_persists_immediately() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(INDEX_FILE);

        let mut index = CacheIndex::load(&path);
        index.set_selected_file("game-1", " Disc 1/Track 01.bin")?;
        assert!(path.exists());

        // A fresh load sees the value, including its leading space
        let reloaded = CacheIndex::load(&path);
        assert_eq!(reloaded.get_selected_file("game-1"), " Disc 1/Track 01.bin");
        assert_eq!(reloaded.get_selected_file("game-2"), "");
        Ok(())
    }

    #[test]
    fn test_corrupt_index_is_replaced_on_write() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(INDEX_FILE);
        std::fs::write(&path, "not an ini line\n")?;

        let mut index = CacheIndex::load(&path);
        assert_eq!(index.get_selected_file("game-1"), "");

        index.set_selected_file("game-1", "game.cue")?;
        assert_eq!(CacheIndex::load(&path).get_selected_file("game-1"), "game.cue");
        Ok(())
    }
}
