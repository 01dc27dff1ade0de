#![allow(clippy::missing_errors_doc)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use moodcast_core::{clamp_rating, format_iso_date, parse_iso_date, MoodError, RatingRecord};
use time::Date;
use tracing::warn;

pub const CSV_HEADER: &str = "date,rating";

/// Flat-file rating store: a `date,rating` header followed by one record
/// per line, ascending by date. Every mutation is a full read-modify-rewrite
/// cycle, which keeps the on-disk file sorted and de-duplicated by
/// construction. Callers serialize upserts; a single logical owner per store
/// is assumed.
#[derive(Debug, Clone)]
pub struct CsvRatingStore {
    path: PathBuf,
}

impl CsvRatingStore {
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Guarantees the backing file exists with the correct header.
    /// Idempotent, safe to call before every operation.
    pub fn ensure(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
        }

        if !self.path.exists() {
            fs::write(&self.path, format!("{CSV_HEADER}\n")).with_context(|| {
                format!("failed to create rating store at {}", self.path.display())
            })?;
        }

        Ok(())
    }

    /// Reads the full history, ascending by date.
    ///
    /// Reads are lenient: a row with a malformed date or an unparseable or
    /// non-finite rating is skipped with a warning so one corrupt line never
    /// blocks the rest of the history. Ratings are clamped on read as well.
    pub fn list(&self) -> Result<Vec<RatingRecord>> {
        self.ensure()?;
        let body = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read rating store at {}", self.path.display()))?;

        let mut records: Vec<RatingRecord> = Vec::new();
        for line in body.lines().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_row(line) {
                Some(record) => records.push(record),
                None => warn!(row = line, "skipping malformed rating row"),
            }
        }

        records.sort_by_key(|record| record.date);
        Ok(records)
    }

    /// Inserts or replaces the record for `date` and returns the new history.
    ///
    /// Rejects non-finite ratings with [`MoodError::InvalidInput`] before any
    /// mutation. The whole file is rewritten atomically from the sorted
    /// in-memory set, so partial writes never corrupt the store.
    pub fn upsert(&self, date: Date, rating: f64) -> Result<Vec<RatingRecord>> {
        let record = RatingRecord::new(date, rating)?;

        let mut records = self.list()?;
        if let Some(existing) = records.iter_mut().find(|existing| existing.date == date) {
            existing.rating = record.rating;
        } else {
            records.push(record);
        }
        records.sort_by_key(|record| record.date);

        self.rewrite(&records)?;
        Ok(records)
    }

    fn rewrite(&self, records: &[RatingRecord]) -> Result<()> {
        let mut body = String::from(CSV_HEADER);
        for record in records {
            let date = format_iso_date(record.date)?;
            body.push('\n');
            body.push_str(&date);
            body.push(',');
            body.push_str(&record.rating.to_string());
        }
        if !records.is_empty() {
            body.push('\n');
        }

        let staging = self.path.with_extension("csv.tmp");
        fs::write(&staging, body).with_context(|| {
            format!("failed to stage rating store at {}", staging.display())
        })?;
        fs::rename(&staging, &self.path).with_context(|| {
            format!("failed to replace rating store at {}", self.path.display())
        })?;
        Ok(())
    }
}

fn parse_row(line: &str) -> Option<RatingRecord> {
    let (date_raw, rating_raw) = line.split_once(',')?;
    let date = parse_iso_date(date_raw.trim()).ok()?;
    let rating: f64 = rating_raw.trim().parse().ok()?;
    if !rating.is_finite() {
        return None;
    }
    Some(RatingRecord {
        date,
        rating: clamp_rating(rating),
    })
}

/// Recovers the typed validation error behind the [`anyhow::Error`]
/// returned by [`CsvRatingStore::upsert`].
#[must_use]
pub fn as_invalid_input(err: &anyhow::Error) -> Option<&MoodError> {
    err.downcast_ref::<MoodError>()
}
