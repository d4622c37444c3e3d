//! Filters raw daily station files down to the target-ID universe.
//!
//! Raw files are district-wide; this keeps only rows whose station ID (the
//! second column) is in the target set built from the filtered metadata,
//! preserving the original headerless schema and naming the output after the
//! input (`<stem>_extract.txt`).

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::output::atomic_write;
use crate::reading;

/// Leading characters of raw daily station file names.
pub const STATION_PREAMBLE: &str = "d04_text_station";

/// Suffix appended to extracted files.
pub const EXTRACT_SUFFIX: &str = "_extract.txt";

#[derive(Debug, Default, PartialEq)]
pub struct ExtractReport {
    pub files_processed: usize,
    pub files_skipped: usize,
    pub rows_extracted: usize,
}

/// Sorted list of file names in `dir` starting with `preamble`.
pub fn matching_files(dir: &Path, preamble: &str) -> Result<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .with_context(|| format!("reading station dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with(preamble))
        .collect();
    names.sort();
    Ok(names)
}

/// Extracts target-station rows from every raw daily file in `station_dir`.
///
/// A malformed file (wrong column count, unparseable ID) fails that file
/// only: it is logged, counted as skipped, and the batch continues.
pub fn extract_station_targets(
    station_dir: &Path,
    preamble: &str,
    target_ids: &BTreeSet<u32>,
    out_dir: &Path,
) -> Result<ExtractReport> {
    let mut report = ExtractReport::default();

    for name in matching_files(station_dir, preamble)? {
        info!(file = %name, "extracting");
        match extract_file(&station_dir.join(&name), target_ids, out_dir, &name) {
            Ok(rows) => {
                report.files_processed += 1;
                report.rows_extracted += rows;
            }
            Err(e) => {
                warn!(file = %name, error = %e, "file failed, skipping");
                report.files_skipped += 1;
            }
        }
    }

    info!(
        files_processed = report.files_processed,
        files_skipped = report.files_skipped,
        rows_extracted = report.rows_extracted,
        "extraction complete"
    );
    Ok(report)
}

fn extract_file(
    path: &Path,
    target_ids: &BTreeSet<u32>,
    out_dir: &Path,
    name: &str,
) -> Result<usize> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reading::open_raw(path)?);

    let mut wtr = csv::Writer::from_writer(Vec::new());
    let mut kept = 0usize;

    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < reading::CSV_HEADER.len() {
            anyhow::bail!("row has {} columns", rec.len());
        }
        let id: u32 = rec[1]
            .trim()
            .parse()
            .with_context(|| format!("bad station id {:?}", &rec[1]))?;
        if target_ids.contains(&id) {
            wtr.write_record(&rec)?;
            kept += 1;
        }
    }

    let stem = name.split('.').next().unwrap_or(name);
    let out_path = out_dir.join(format!("{stem}{EXTRACT_SUFFIX}"));
    atomic_write(&out_path, &wtr.into_inner()?)?;
    Ok(kept)
}
