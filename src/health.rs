//! Detector health detail reports: joining and daily lane-health averages.
//!
//! The daily sweep saves one tab-delimited Detector Health Detail report per
//! day, one row per lane. The join stacks every daily file into one table
//! tagged with its file date; the summary reduces each station to one value
//! per day, the fraction of its lanes reported healthy (status code 0).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::output::{atomic_write, write_csv};

/// Status code the portal uses for a healthy lane.
const STATUS_GOOD: i64 = 0;

#[derive(Debug, Default, PartialEq)]
pub struct HealthReport {
    pub files_processed: usize,
    pub files_skipped: usize,
    pub rows_joined: usize,
}

/// Every daily report stacked into one table, each row tagged with the date
/// embedded in its source filename.
#[derive(Debug, Default, Clone)]
pub struct JoinedHealth {
    pub header: Vec<String>,
    pub rows: Vec<(NaiveDate, Vec<String>)>,
}

/// Date prefix of a daily report filename, e.g. `2014_01_02_detail.txt`.
fn file_date(name: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(name.get(..10)?, "%Y_%m_%d").ok()
}

/// Stacks every date-prefixed daily report in `dir` into one table, in
/// filename-sorted (chronological) order. The first readable file fixes the
/// column set; a file that cannot be read or whose header differs is logged
/// and skipped.
pub fn join_health(dir: &Path) -> Result<(JoinedHealth, HealthReport)> {
    let mut names: Vec<(NaiveDate, String)> = std::fs::read_dir(dir)
        .with_context(|| format!("reading health dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|n| Some((file_date(&n)?, n)))
        .collect();
    names.sort();

    let mut joined = JoinedHealth::default();
    let mut report = HealthReport::default();

    for (date, name) in names {
        match read_daily(&dir.join(&name), date, &mut joined) {
            Ok(rows) => {
                report.files_processed += 1;
                report.rows_joined += rows;
            }
            Err(e) => {
                warn!(file = %name, error = %e, "health file failed, skipping");
                report.files_skipped += 1;
            }
        }
    }

    info!(
        files_processed = report.files_processed,
        files_skipped = report.files_skipped,
        rows_joined = report.rows_joined,
        "health reports joined"
    );
    Ok((joined, report))
}

fn read_daily(path: &Path, date: NaiveDate, joined: &mut JoinedHealth) -> Result<usize> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)?;

    let header: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
    if joined.header.is_empty() {
        joined.header = header;
    } else if joined.header != header {
        anyhow::bail!("header differs from the first report");
    }

    let mut added = 0usize;
    for rec in rdr.records() {
        let rec = rec?;
        joined
            .rows
            .push((date, rec.iter().map(str::to_string).collect()));
        added += 1;
    }
    Ok(added)
}

impl JoinedHealth {
    /// Writes the joined table tab-delimited with a leading `Date` column.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(Vec::new());
        wtr.write_record(
            std::iter::once("Date".to_string()).chain(self.header.iter().cloned()),
        )?;
        for (date, cols) in &self.rows {
            wtr.write_record(
                std::iter::once(date.format("%Y_%m_%d").to_string()).chain(cols.iter().cloned()),
            )?;
        }
        atomic_write(path, &wtr.into_inner()?)
    }
}

/// Per-station daily lane-health averages, one cell per (station, day).
#[derive(Debug, Default, PartialEq)]
pub struct HealthSummary {
    cells: BTreeMap<u32, BTreeMap<NaiveDate, f64>>,
}

/// Reduces the joined table to per-station daily averages: for each station
/// and day, the fraction of its lane rows whose `Status` is the healthy
/// code. Rows with an unparseable `VDS` or `Status` are skipped and counted.
pub fn daily_health(joined: &JoinedHealth) -> Result<HealthSummary> {
    let col = |name: &str| joined.header.iter().position(|h| h == name);
    let (vds_c, status_c) = match (col("VDS"), col("Status")) {
        (Some(v), Some(s)) => (v, s),
        _ => anyhow::bail!("joined health table missing VDS/Status columns"),
    };

    // (healthy lanes, total lanes) per station-day.
    let mut counts: BTreeMap<(u32, NaiveDate), (u64, u64)> = BTreeMap::new();
    let mut skipped = 0usize;
    for (date, cols) in &joined.rows {
        let parsed = (
            cols.get(vds_c).and_then(|s| s.trim().parse::<u32>().ok()),
            cols.get(status_c).and_then(|s| s.trim().parse::<i64>().ok()),
        );
        let (Some(vds), Some(status)) = parsed else {
            skipped += 1;
            continue;
        };
        let entry = counts.entry((vds, *date)).or_insert((0, 0));
        if status == STATUS_GOOD {
            entry.0 += 1;
        }
        entry.1 += 1;
    }
    if skipped > 0 {
        warn!(skipped, "health rows without usable VDS/Status skipped");
    }

    let mut summary = HealthSummary::default();
    for ((vds, date), (good, total)) in counts {
        summary
            .cells
            .entry(vds)
            .or_default()
            .insert(date, good as f64 / total as f64);
    }
    Ok(summary)
}

impl HealthSummary {
    /// Every day any station reported, ascending.
    pub fn days(&self) -> BTreeSet<NaiveDate> {
        self.cells.values().flat_map(|d| d.keys().copied()).collect()
    }

    pub fn station_day(&self, vds: u32, date: NaiveDate) -> Option<f64> {
        self.cells.get(&vds)?.get(&date).copied()
    }

    /// Mean of the station's daily averages over the days it reported.
    pub fn year_average(&self, vds: u32) -> Option<f64> {
        let days = self.cells.get(&vds)?;
        if days.is_empty() {
            return None;
        }
        Some(days.values().sum::<f64>() / days.len() as f64)
    }

    /// Writes the wide table: one row per station, `Year_Avg` first, then
    /// one column per day. A station that did not report on a day gets an
    /// empty cell.
    pub fn write(&self, path: &Path) -> Result<()> {
        let days: Vec<NaiveDate> = self.days().into_iter().collect();
        let header: Vec<String> = ["VDS", "Year_Avg"]
            .into_iter()
            .map(str::to_string)
            .chain(days.iter().map(|d| d.format("%Y_%m_%d").to_string()))
            .collect();
        let header_refs: Vec<&str> = header.iter().map(String::as_str).collect();

        let rows = self.cells.iter().map(|(vds, by_day)| {
            let year_avg = by_day.values().sum::<f64>() / by_day.len() as f64;
            std::iter::once(vds.to_string())
                .chain(std::iter::once(year_avg.to_string()))
                .chain(days.iter().map(|d| {
                    by_day.get(d).map(|v| v.to_string()).unwrap_or_default()
                }))
                .collect::<Vec<String>>()
        });
        write_csv(path, Some(&header_refs), rows)
    }
}
