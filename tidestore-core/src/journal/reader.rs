//! Journal replay

use super::{parse_segment_id, JournalConfig, JournalEntry};
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Reads journal segments back in order
pub struct JournalReader {
    config: JournalConfig,
}

impl JournalReader {
    pub fn new(config: JournalConfig) -> Self {
        Self { config }
    }

    /// Read every intact entry from every segment, oldest first
    ///
    /// A torn, corrupt or undecodable frame ends replay of its segment;
    /// entries before it and later segments are still read.
    pub fn replay(&self) -> Result<Vec<JournalEntry>> {
        let mut entries = Vec::new();

        for path in self.segments()? {
            match Self::read_segment(&path) {
                Ok(segment_entries) => {
                    info!(
                        "Replayed {} journal entries from {:?}",
                        segment_entries.len(),
                        path
                    );
                    entries.extend(segment_entries);
                }
                Err(e) => warn!("Error reading journal segment {:?}: {}", path, e),
            }
        }

        Ok(entries)
    }

    fn segments(&self) -> Result<Vec<PathBuf>> {
        if !self.config.dir.exists() {
            return Ok(Vec::new());
        }

        let mut segments: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_segment_id) {
                segments.push((id, entry.path()));
            }
        }
        segments.sort_by_key(|(id, _)| *id);

        Ok(segments.into_iter().map(|(_, path)| path).collect())
    }

    fn read_segment(path: &Path) -> Result<Vec<JournalEntry>> {
        let data = fs::read(path)?;
        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match JournalEntry::decode(&data[offset..]) {
                Ok(Some((entry, consumed))) => {
                    entries.push(entry);
                    offset += consumed;
                }
                Ok(None) => {
                    warn!("Torn journal entry at offset {} in {:?}", offset, path);
                    break;
                }
                Err(e) => {
                    warn!(
                        "Unreadable journal entry at offset {} in {:?}, truncating: {}",
                        offset, path, e
                    );
                    break;
                }
            }
        }

        Ok(entries)
    }
}
