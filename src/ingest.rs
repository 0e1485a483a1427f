//! Reading tabular observations into the deduplicated record table.

use crate::merge::RecordTable;
use crate::record::{RawRow, Record};
use crate::AuditError;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

/// Inclusive UTC bounds on observation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl Default for DateRange {
    fn default() -> Self {
        DateRange { since: DateTime::<Utc>::MIN_UTC, until: DateTime::<Utc>::MAX_UTC }
    }
}

impl DateRange {
    pub fn contains(&self, record: &Record) -> bool {
        record.within(self.since, self.until)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub rows: usize,
    pub skipped: usize,
    pub out_of_range: usize,
}

/// Parses rows from CSV and folds them into `table`. Bad rows are logged and skipped.
/// A merge across cluster ids aborts, since it means the table keying is broken.
pub fn ingest_csv<R: Read>(reader: R, range: &DateRange, table: &mut RecordTable) -> Result<IngestStats, AuditError> {
    let mut csv_reader = csv::ReaderBuilder::new().flexible(true).trim(csv::Trim::All).from_reader(reader);
    let mut stats = IngestStats::default();

    for (index, result) in csv_reader.deserialize::<RawRow>().enumerate() {
        // Header is line 1.
        let line = index + 2;
        stats.rows += 1;

        let row = match result {
            Ok(row) => row,
            Err(e) => {
                warn!(row = line, error = %AuditError::from(e), "skipping unreadable row");
                stats.skipped += 1;
                continue;
            }
        };
        let record = match Record::from_row(&row) {
            Ok(record) => record,
            Err(e) => {
                let cid = row.cid.as_deref().unwrap_or_default();
                warn!(row = line, cid, error = %e.at_row(line), "skipping malformed row");
                stats.skipped += 1;
                continue;
            }
        };
        if !range.contains(&record) {
            stats.out_of_range += 1;
            continue;
        }
        table.insert(record)?;
    }

    info!(
        rows = stats.rows,
        skipped = stats.skipped,
        out_of_range = stats.out_of_range,
        clusters = table.len(),
        "ingested observations"
    );
    Ok(stats)
}

pub fn ingest_path(path: &Path, range: &DateRange) -> Result<(RecordTable, IngestStats), AuditError> {
    let file = File::open(path).map_err(|e| AuditError::Config(format!("cannot open {}: {}", path.display(), e)))?;
    let mut table = RecordTable::new();
    let stats = ingest_csv(file, range, &mut table)?;
    Ok((table, stats))
}
