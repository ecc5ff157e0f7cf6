//! The persisted list of discovered sets (`sets_metadata.json`), the input
//! for later scrape runs.

use crate::atomic_file::write_atomic;
use crate::error::{Error, Result};
use crate::models::SetMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "sets_metadata.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetCatalog {
    pub discovered_at: DateTime<Utc>,
    pub total_sets: usize,
    pub sets: Vec<SetMetadata>,
}

impl Default for SetCatalog {
    fn default() -> Self {
        Self {
            discovered_at: Utc::now(),
            total_sets: 0,
            sets: Vec::new(),
        }
    }
}

impl SetCatalog {
    pub fn path_in(output_dir: &Path) -> PathBuf {
        output_dir.join(METADATA_FILE)
    }

    /// Loads the catalog at `path`; a missing file is an empty catalog.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::io(path, e)),
        };
        let mut catalog: Self = serde_json::from_str(&content)?;
        catalog.total_sets = catalog.sets.len();
        Ok(catalog)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path, json.as_bytes())?;
        log::info!("Saved {} sets to {}", self.sets.len(), path.display());
        Ok(())
    }

    /// Adds sets not already known by ID. Known entries, and their source
    /// tags, are left untouched. Returns how many were added.
    pub fn merge<I>(&mut self, sets: I) -> usize
    where
        I: IntoIterator<Item = SetMetadata>,
    {
        let mut added = 0;
        for set in sets {
            if self.find(&set.id).is_none() {
                self.sets.push(set);
                added += 1;
            }
        }
        self.total_sets = self.sets.len();
        self.discovered_at = Utc::now();
        added
    }

    pub fn find(&self, id: &str) -> Option<&SetMetadata> {
        self.sets.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
