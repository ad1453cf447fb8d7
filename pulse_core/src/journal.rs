//! Summary journal for the companion side.
//!
//! Every summary received from the host is appended to a JSONL (JSON Lines)
//! file under an exclusive `fs2` lock. Entries are never deduplicated: a
//! summary delivered twice is journaled twice.

use crate::{Result, SessionSummary};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One journaled summary
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub summary: SessionSummary,
}

/// Destination for received summaries
pub trait SummarySink: Send {
    fn append(&mut self, summary: &SessionSummary) -> Result<()>;
}

pub struct JsonlSummaryJournal {
    path: PathBuf,
}

impl JsonlSummaryJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl SummarySink for JsonlSummaryJournal {
    fn append(&mut self, summary: &SessionSummary) -> Result<()> {
        self.ensure_parent_dir()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let entry = JournalEntry {
            received_at: Utc::now(),
            summary: summary.clone(),
        };
        let mut writer = std::io::BufWriter::new(&file);
        writer.write_all(serde_json::to_string(&entry)?.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);

        file.unlock()?;
        tracing::debug!("Journaled summary for session {}", summary.session_id);
        Ok(())
    }
}

/// Read every entry; malformed lines are skipped
pub fn read_summaries(path: &Path) -> Result<Vec<JournalEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut entries = Vec::new();
    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!("Failed to parse summary at line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} summaries from journal", entries.len());
    Ok(entries)
}
