//! Station metadata snapshots: joining, moving-ID detection, filtering.
//!
//! The portal publishes a tab-delimited metadata snapshot per day. The join
//! stacks every snapshot into one table tagged with its source date, and the
//! moving-ID filter drops stations whose recorded location is not constant
//! across snapshots (a known portal bug; those ID-to-location mappings
//! cannot be trusted).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::output::atomic_write;

/// Leading characters of metadata snapshot filenames. Filters out hidden
/// files and other cruft in the directory.
pub const META_PREAMBLE: &str = "d04_text_meta";

const TABLE_HEADER: [&str; 8] = [
    "ID",
    "Latitude",
    "Longitude",
    "County",
    "Fwy",
    "Dir",
    "Type",
    "Date",
];

/// One snapshot-date record of a station's static attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaRow {
    pub id: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub county: String,
    pub freeway: String,
    pub direction: String,
    pub station_type: String,
    pub date: NaiveDate,
}

/// Joined metadata snapshots, rows in chronological (file) order.
#[derive(Debug, Default, Clone)]
pub struct MetaTable {
    pub rows: Vec<MetaRow>,
}

/// Parses the snapshot date embedded in the trailing characters of a file
/// stem, e.g. `d04_text_meta_2014_01_15.txt` -> 2014-01-15.
pub fn snapshot_date(filename: &str) -> Option<NaiveDate> {
    let stem = filename.strip_suffix(".txt").unwrap_or(filename);
    if stem.len() < 10 {
        return None;
    }
    NaiveDate::parse_from_str(&stem[stem.len() - 10..], "%Y_%m_%d").ok()
}

/// Concatenates every snapshot file in `dir` whose name starts with
/// `preamble`, in filename-sorted (chronological) order, tagging each row
/// with its snapshot date. `date_range` optionally restricts which files
/// are read, by their filename-embedded dates.
pub fn join_meta(
    dir: &Path,
    preamble: &str,
    date_range: Option<(NaiveDate, NaiveDate)>,
) -> Result<MetaTable> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .with_context(|| format!("reading metadata dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with(preamble))
        .collect();
    names.sort();

    let mut table = MetaTable::default();
    for name in names {
        let Some(date) = snapshot_date(&name) else {
            warn!(file = %name, "no snapshot date in filename, skipping");
            continue;
        };
        if let Some((start, end)) = date_range {
            if date < start || date > end {
                continue;
            }
        }
        read_snapshot(&dir.join(&name), date, &mut table.rows)
            .with_context(|| format!("reading snapshot {name}"))?;
    }

    info!(rows = table.rows.len(), "metadata snapshots joined");
    Ok(table)
}

/// Reads one tab-delimited snapshot file, appending parsed rows. Rows with
/// missing or unparseable ID/coordinates are skipped and logged.
fn read_snapshot(path: &Path, date: NaiveDate, rows: &mut Vec<MetaRow>) -> Result<()> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)?;

    let headers = rdr.headers()?.clone();
    let col = |name: &str| headers.iter().position(|h| h == name);
    let (id_c, lat_c, lon_c) = match (col("ID"), col("Latitude"), col("Longitude")) {
        (Some(a), Some(b), Some(c)) => (a, b, c),
        _ => anyhow::bail!("snapshot missing ID/Latitude/Longitude columns"),
    };
    let county_c = col("County");
    let fwy_c = col("Fwy");
    let dir_c = col("Dir");
    let type_c = col("Type");

    let mut skipped = 0usize;
    for rec in rdr.records() {
        let rec = rec?;
        let field = |i: Option<usize>| i.and_then(|i| rec.get(i)).unwrap_or("").trim().to_string();

        let parsed = (
            rec.get(id_c).and_then(|s| s.trim().parse::<u32>().ok()),
            rec.get(lat_c).and_then(|s| s.trim().parse::<f64>().ok()),
            rec.get(lon_c).and_then(|s| s.trim().parse::<f64>().ok()),
        );
        let (Some(id), Some(latitude), Some(longitude)) = parsed else {
            skipped += 1;
            continue;
        };

        rows.push(MetaRow {
            id,
            latitude,
            longitude,
            county: field(county_c),
            freeway: field(fwy_c),
            direction: field(dir_c),
            station_type: field(type_c),
            date,
        });
    }

    if skipped > 0 {
        warn!(file = %path.display(), skipped, "rows without usable ID/location skipped");
    }
    Ok(())
}

impl MetaTable {
    /// IDs whose earliest-first sequence of snapshots shows more than one
    /// distinct (latitude, longitude) pair.
    pub fn detect_moving_ids(&self) -> BTreeSet<u32> {
        let mut by_date = self.rows.clone();
        by_date.sort_by_key(|r| r.date);

        let mut locations: BTreeMap<u32, Vec<(u64, u64)>> = BTreeMap::new();
        for row in &by_date {
            let key = (row.latitude.to_bits(), row.longitude.to_bits());
            let seen = locations.entry(row.id).or_default();
            if !seen.contains(&key) {
                seen.push(key);
            }
        }

        locations
            .into_iter()
            .filter(|(_, locs)| locs.len() > 1)
            .map(|(id, _)| id)
            .collect()
    }

    /// Rows for stations that did not move. Empty input yields empty output.
    pub fn filter_moving(&self) -> MetaTable {
        let moving = self.detect_moving_ids();
        MetaTable {
            rows: self
                .rows
                .iter()
                .filter(|r| !moving.contains(&r.id))
                .cloned()
                .collect(),
        }
    }

    /// Rows for the moving (untrustworthy) stations.
    pub fn moving_rows(&self) -> MetaTable {
        let moving = self.detect_moving_ids();
        MetaTable {
            rows: self
                .rows
                .iter()
                .filter(|r| moving.contains(&r.id))
                .cloned()
                .collect(),
        }
    }

    /// Rows whose location satisfies an externally supplied point-in-region
    /// predicate (longitude, latitude).
    pub fn filter_region<F: Fn(f64, f64) -> bool>(&self, in_region: F) -> MetaTable {
        MetaTable {
            rows: self
                .rows
                .iter()
                .filter(|r| in_region(r.longitude, r.latitude))
                .cloned()
                .collect(),
        }
    }

    /// The deduplicated, ascending set of station IDs.
    pub fn target_ids(&self) -> BTreeSet<u32> {
        self.rows.iter().map(|r| r.id).collect()
    }

    /// Writes the table tab-delimited with a header, atomically.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(Vec::new());
        wtr.write_record(TABLE_HEADER)?;
        for r in &self.rows {
            wtr.write_record([
                r.id.to_string(),
                r.latitude.to_string(),
                r.longitude.to_string(),
                r.county.clone(),
                r.freeway.clone(),
                r.direction.clone(),
                r.station_type.clone(),
                r.date.format("%Y_%m_%d").to_string(),
            ])?;
        }
        atomic_write(path, &wtr.into_inner()?)
    }

    /// Reads a table previously written by [`MetaTable::write`].
    pub fn read(path: &Path) -> Result<MetaTable> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(path)
            .with_context(|| format!("reading metadata table {}", path.display()))?;

        let mut rows = Vec::new();
        for rec in rdr.records() {
            let rec = rec?;
            if rec.len() < TABLE_HEADER.len() {
                anyhow::bail!("metadata table row has {} columns", rec.len());
            }
            rows.push(MetaRow {
                id: rec[0].trim().parse().context("ID")?,
                latitude: rec[1].trim().parse().context("Latitude")?,
                longitude: rec[2].trim().parse().context("Longitude")?,
                county: rec[3].to_string(),
                freeway: rec[4].to_string(),
                direction: rec[5].to_string(),
                station_type: rec[6].to_string(),
                date: NaiveDate::parse_from_str(rec[7].trim(), "%Y_%m_%d").context("Date")?,
            });
        }
        Ok(MetaTable { rows })
    }
}
