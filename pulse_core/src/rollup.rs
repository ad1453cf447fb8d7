//! CSV rollup of the companion summary journal.
//!
//! Rows are appended to the CSV and fsynced before the journal is renamed to
//! `.processed`, so a crash mid-rollup never loses a summary.

use crate::journal::{read_summaries, JournalEntry};
use crate::Result;
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

#[derive(Debug, serde::Serialize)]
struct CsvRow {
    session_id: i64,
    received_at: String,
    started_at: String,
    ended_at: String,
    duration_sec: i64,
    avg_heart_rate: i32,
    calories: f32,
    distance: f32,
}

fn millis_to_rfc3339(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

impl From<&JournalEntry> for CsvRow {
    fn from(entry: &JournalEntry) -> Self {
        let s = &entry.summary;
        CsvRow {
            session_id: s.session_id.get(),
            received_at: entry.received_at.to_rfc3339(),
            started_at: millis_to_rfc3339(s.start_timestamp),
            ended_at: millis_to_rfc3339(s.end_timestamp),
            duration_sec: s.duration_sec,
            avg_heart_rate: s.avg_heart_rate,
            calories: s.calories,
            distance: s.distance,
        }
    }
}

/// Where a journal goes once rolled up
pub fn processed_path(journal_path: &Path) -> PathBuf {
    let mut name = journal_path.as_os_str().to_owned();
    name.push(".processed");
    PathBuf::from(name)
}

/// Append journal entries to the CSV and archive the journal.
///
/// Returns the number of summaries written. An empty or missing journal is
/// left untouched.
pub fn journal_to_csv_and_archive(journal_path: &Path, csv_path: &Path) -> Result<usize> {
    let entries = read_summaries(journal_path)?;
    if entries.is_empty() {
        tracing::info!("No summaries in journal to roll up");
        return Ok(0);
    }

    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;
    let needs_headers = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);
    for entry in &entries {
        writer.serialize(CsvRow::from(entry))?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    file.sync_all()?;
    tracing::info!("Wrote {} summaries to CSV", entries.len());

    let archived = processed_path(journal_path);
    std::fs::rename(journal_path, &archived)?;
    tracing::info!("Archived journal to {:?}", archived);

    Ok(entries.len())
}

/// Remove `.processed` journals from a directory
pub fn cleanup_processed_journals(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "processed") {
            std::fs::remove_file(&path)?;
            tracing::debug!("Removed processed journal: {:?}", path);
            count += 1;
        }
    }

    if count > 0 {
        tracing::info!("Cleaned up {} processed journals", count);
    }
    Ok(count)
}
