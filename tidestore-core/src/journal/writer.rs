//! Journal writer

use super::{segment_file_name, parse_segment_id, JournalConfig, JournalEntry, SyncPolicy};
use crate::Result;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// Appends entries to the active journal segment
pub struct JournalWriter {
    config: JournalConfig,
    inner: Mutex<WriterInner>,
}

struct WriterInner {
    file: BufWriter<File>,
    segment_id: u64,
    bytes_written: usize,
    appends_since_sync: usize,
    last_sync: Instant,
}

impl JournalWriter {
    /// Open the journal, continuing in a fresh segment after any existing ones
    pub fn open(config: JournalConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let segment_id = Self::latest_segment(&config.dir)? + 1;
        let file = Self::open_segment(&config.dir, segment_id)?;

        Ok(Self {
            config,
            inner: Mutex::new(WriterInner {
                file: BufWriter::new(file),
                segment_id,
                bytes_written: 0,
                appends_since_sync: 0,
                last_sync: Instant::now(),
            }),
        })
    }

    /// Append one entry, syncing according to the policy
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let frame = entry.encode()?;
        let mut inner = self.inner.lock();

        if inner.bytes_written > 0 && inner.bytes_written + frame.len() > self.config.segment_size {
            self.rotate(&mut inner)?;
        }

        inner.file.write_all(&frame)?;
        inner.bytes_written += frame.len();
        inner.appends_since_sync += 1;

        if self.should_sync(&inner) {
            Self::sync_inner(&mut inner)?;
        } else {
            inner.file.flush()?;
        }

        Ok(())
    }

    /// Force the active segment to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)
    }

    /// Id of the segment currently appended to
    pub fn current_segment(&self) -> u64 {
        self.inner.lock().segment_id
    }

    fn sync_inner(inner: &mut WriterInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_data()?;
        inner.appends_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn should_sync(&self, inner: &WriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.appends_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    fn rotate(&self, inner: &mut WriterInner) -> Result<()> {
        Self::sync_inner(inner)?;

        inner.segment_id += 1;
        inner.file = BufWriter::new(Self::open_segment(&self.config.dir, inner.segment_id)?);
        inner.bytes_written = 0;

        Ok(())
    }

    fn latest_segment(dir: &Path) -> Result<u64> {
        let mut max_id = 0u64;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_segment_id) {
                max_id = max_id.max(id);
            }
        }
        Ok(max_id)
    }

    fn open_segment(dir: &Path, segment_id: u64) -> Result<File> {
        let path = dir.join(segment_file_name(segment_id));
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }
}
