//! Write-ahead journal for the embedded column store
//!
//! Every bucket upsert and bulk row insert is appended to a segmented,
//! checksummed journal before it is applied in memory. Reopening the
//! store replays the journal to rebuild both tables.

mod entry;
mod reader;
mod writer;

pub use entry::{JournalEntry, JournalEntryType};
pub use reader::JournalReader;
pub use writer::JournalWriter;

use std::path::PathBuf;

/// Journal sync policy
#[derive(Debug, Clone, Copy, Default)]
pub enum SyncPolicy {
    /// Sync after every append
    #[default]
    Immediate,
    /// Sync after N appends
    EveryN(usize),
    /// Sync when at least this many milliseconds passed since the last sync
    Interval { millis: u64 },
    /// Leave syncing to the OS
    None,
}

/// Journal configuration
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Directory holding the segment files
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
    /// Segment size in bytes before rotating
    pub segment_size: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/journal"),
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::JOURNAL_SEGMENT_SIZE,
        }
    }
}

impl JournalConfig {
    /// Journal rooted at `dir` with default settings
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }
}

const SEGMENT_PREFIX: &str = "journal_";
const SEGMENT_SUFFIX: &str = ".seg";

fn segment_file_name(segment_id: u64) -> String {
    format!("{}{:020}{}", SEGMENT_PREFIX, segment_id, SEGMENT_SUFFIX)
}

fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)
        .and_then(|s| s.strip_suffix(SEGMENT_SUFFIX))
        .and_then(|s| s.parse().ok())
}
