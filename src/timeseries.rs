//! Per-sensor time-series extraction, chunked to bound peak memory.
//!
//! The full cross product of stations x days for a year-scale study does not
//! fit in memory, so the target-ID set is split into chunks and the daily
//! files are streamed once per chunk. More chunks means less memory and more
//! passes over the files; the count is a caller-tunable knob.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::extract::matching_files;
use crate::output::write_csv;
use crate::reading::{self, StationReading};

pub const TS_FILE: &str = "time_series.csv";
pub const SUMMARY_FILE: &str = "summary.csv";

const SUMMARY_HEADER: [&str; 4] = ["First_Day", "Last_Day", "Total_Observations", "Length_Std"];

/// Aggregate measures for one station's time series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSummary {
    pub first_day: NaiveDate,
    pub last_day: NaiveDate,
    pub total_observations: usize,
    pub length_std: f64,
}

#[derive(Debug, Default, PartialEq)]
pub struct TimeSeriesReport {
    pub stations_written: usize,
    pub empty_stations: usize,
    pub files_read: usize,
    pub files_skipped: usize,
}

/// Splits the ascending ID list into `n_chunks` contiguous equal groups,
/// remainder appended to the last group. Deterministic for a fixed ID set.
pub fn partition_ids(ids: &[u32], n_chunks: usize) -> Vec<Vec<u32>> {
    let n_chunks = n_chunks.max(1);
    let per_chunk = ids.len() / n_chunks;

    let mut chunks: Vec<Vec<u32>> = (0..n_chunks)
        .map(|i| ids[per_chunk * i..per_chunk * (i + 1)].to_vec())
        .collect();
    if let Some(last) = chunks.last_mut() {
        last.extend_from_slice(&ids[per_chunk * n_chunks..]);
    }
    chunks
}

/// Computes the summary record, or `None` for an empty series.
pub fn summarize(rows: &[StationReading]) -> Option<SeriesSummary> {
    let first = rows.first()?;
    let last = rows.last()?;

    let lengths: Vec<f64> = rows.iter().filter_map(|r| r.length).collect();
    let length_std = if lengths.is_empty() {
        0.0
    } else {
        let mean = lengths.iter().sum::<f64>() / lengths.len() as f64;
        let var = lengths.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / lengths.len() as f64;
        (var.sqrt() * 100.0).round() / 100.0
    };

    Some(SeriesSummary {
        first_day: first.timestamp.date(),
        last_day: last.timestamp.date(),
        total_observations: rows.len(),
        length_std,
    })
}

/// Builds one time-series directory per target station under `out_dir`.
///
/// For each chunk of IDs, every extracted daily file in `station_dir` is
/// read once (in filename-sorted, hence chronological, order), matching rows
/// are buffered per station, and at the end of the pass each station gets
/// `time_series.csv` plus `summary.csv`. Stations with zero observations
/// still get both artifacts (summary header-only), so absence is visible
/// downstream. Per-file memory is released between files and all chunk
/// buffers are dropped before the next chunk begins.
pub fn generate_time_series(
    target_ids: &[u32],
    station_dir: &Path,
    preamble: &str,
    out_dir: &Path,
    n_chunks: usize,
) -> Result<TimeSeriesReport> {
    let fnames = matching_files(station_dir, preamble)?;
    let chunks = partition_ids(target_ids, n_chunks);
    let mut report = TimeSeriesReport::default();

    for (chunk_no, chunk) in chunks.iter().enumerate() {
        if chunk.is_empty() {
            continue;
        }
        info!(chunk = chunk_no, stations = chunk.len(), "processing chunk");

        let members: HashSet<u32> = chunk.iter().copied().collect();
        let mut buffers: BTreeMap<u32, Vec<StationReading>> =
            chunk.iter().map(|id| (*id, Vec::new())).collect();

        for name in &fnames {
            let rows = match reading::read_raw_file(&station_dir.join(name)) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(file = %name, error = %e, "daily file failed, skipping");
                    if chunk_no == 0 {
                        report.files_skipped += 1;
                    }
                    continue;
                }
            };
            if chunk_no == 0 {
                report.files_read += 1;
            }
            for row in rows {
                if members.contains(&row.station) {
                    buffers
                        .get_mut(&row.station)
                        .expect("buffer exists for every chunk member")
                        .push(row);
                }
            }
            // `rows` dropped here; peak memory stays one file + chunk buffers.
        }

        for (id, rows) in buffers {
            write_station(out_dir, id, &rows)?;
            if rows.is_empty() {
                report.empty_stations += 1;
            }
            report.stations_written += 1;
        }
        // Chunk buffers freed before the next chunk starts.
    }

    info!(
        stations_written = report.stations_written,
        empty_stations = report.empty_stations,
        files_read = report.files_read,
        files_skipped = report.files_skipped,
        "time-series generation complete"
    );
    Ok(report)
}

fn write_station(out_dir: &Path, id: u32, rows: &[StationReading]) -> Result<()> {
    let station_dir = out_dir.join(id.to_string());

    write_csv(
        &station_dir.join(TS_FILE),
        Some(&reading::CSV_HEADER),
        rows.iter().map(|r| r.to_record()),
    )?;

    let summary_rows: Vec<Vec<String>> = summarize(rows)
        .map(|s| {
            vec![vec![
                s.first_day.format("%m/%d/%Y").to_string(),
                s.last_day.format("%m/%d/%Y").to_string(),
                s.total_observations.to_string(),
                s.length_std.to_string(),
            ]]
        })
        .unwrap_or_default();

    write_csv(
        &station_dir.join(SUMMARY_FILE),
        Some(&SUMMARY_HEADER),
        summary_rows,
    )
}

/// One station's parsed series and the directory it lives in.
#[derive(Debug)]
pub struct StationSeries {
    pub id: u32,
    pub dir: PathBuf,
    pub rows: Vec<StationReading>,
}

/// Loads every per-station series under `series_dir` (the numeric
/// subdirectories, ascending). A station whose `time_series.csv` is missing
/// or malformed is logged and counted, not fatal, so one bad station cannot
/// abort a whole analysis batch. Returns the loaded stations and the
/// skipped count.
pub fn load_station_series(series_dir: &Path) -> Result<(Vec<StationSeries>, usize)> {
    let mut ids: Vec<(u32, PathBuf)> = std::fs::read_dir(series_dir)
        .with_context(|| format!("reading series dir {}", series_dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let id: u32 = e.file_name().to_str()?.parse().ok()?;
            Some((id, e.path()))
        })
        .collect();
    ids.sort_by_key(|(id, _)| *id);

    let mut stations = Vec::with_capacity(ids.len());
    let mut skipped = 0usize;
    for (id, dir) in ids {
        match read_time_series(&dir.join(TS_FILE)) {
            Ok(rows) => stations.push(StationSeries { id, dir, rows }),
            Err(e) => {
                warn!(station = id, error = %e, "station series unreadable, skipping");
                skipped += 1;
            }
        }
    }
    Ok((stations, skipped))
}

/// Reads one station's `time_series.csv` back (header row present).
pub fn read_time_series(path: &Path) -> Result<Vec<StationReading>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut rows = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        rows.push(StationReading::from_record(&rec)?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn raw_line(day: u32, slot: u32, station: u32, length: f64) -> String {
        format!(
            "01/{day:02}/2014 {:02}:{:02}:00,{station},4,101,N,ML,{length},20,100,353,0.0617,62.5",
            slot * 5 / 60,
            slot * 5 % 60,
        )
    }

    #[test]
    fn test_partition_even_split() {
        let ids: Vec<u32> = (1..=8).collect();
        let chunks = partition_ids(&ids, 4);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], vec![1, 2]);
        assert_eq!(chunks[3], vec![7, 8]);
    }

    #[test]
    fn test_partition_remainder_on_last_chunk() {
        let ids: Vec<u32> = (1..=10).collect();
        let chunks = partition_ids(&ids, 3);
        assert_eq!(chunks[0], vec![1, 2, 3]);
        assert_eq!(chunks[1], vec![4, 5, 6]);
        assert_eq!(chunks[2], vec![7, 8, 9, 10]);
    }

    #[test]
    fn test_partition_more_chunks_than_ids() {
        let chunks = partition_ids(&[1, 2], 5);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 2);
        assert_eq!(chunks.last().unwrap(), &vec![1, 2]);
    }

    #[test]
    fn test_summarize() {
        let rows: Vec<StationReading> = [
            raw_line(1, 0, 5, 0.5),
            raw_line(1, 1, 5, 0.7),
            raw_line(2, 0, 5, 0.5),
        ]
        .iter()
        .map(|l| reading::read_raw_rows(l.as_bytes()).unwrap().remove(0))
        .collect();

        let s = summarize(&rows).unwrap();
        assert_eq!(s.first_day, NaiveDate::from_ymd_opt(2014, 1, 1).unwrap());
        assert_eq!(s.last_day, NaiveDate::from_ymd_opt(2014, 1, 2).unwrap());
        assert_eq!(s.total_observations, 3);
        // Population std of [0.5, 0.7, 0.5], rounded to 2 decimals.
        assert!((s.length_std - 0.09).abs() < 1e-9);
    }

    #[test]
    fn test_summarize_empty_is_none() {
        assert!(summarize(&[]).is_none());
    }

    #[test]
    fn test_generate_time_series_splits_by_station() {
        let data_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();

        std::fs::write(
            data_dir.path().join("d04_text_station_5min_2014_01_01_extract.txt"),
            format!("{}\n{}\n", raw_line(1, 0, 10, 0.5), raw_line(1, 0, 20, 0.6)),
        )
        .unwrap();
        std::fs::write(
            data_dir.path().join("d04_text_station_5min_2014_01_02_extract.txt"),
            format!("{}\n", raw_line(2, 0, 10, 0.5)),
        )
        .unwrap();

        let report = generate_time_series(
            &[10, 20, 30],
            data_dir.path(),
            "d04_text_station",
            out_dir.path(),
            2,
        )
        .unwrap();

        assert_eq!(report.stations_written, 3);
        assert_eq!(report.empty_stations, 1); // station 30 never observed
        assert_eq!(report.files_read, 2);

        let ts10 = read_time_series(&out_dir.path().join("10").join(TS_FILE)).unwrap();
        assert_eq!(ts10.len(), 2);
        // Chronological order across daily files.
        assert!(ts10[0].timestamp < ts10[1].timestamp);

        let ts30 = read_time_series(&out_dir.path().join("30").join(TS_FILE)).unwrap();
        assert!(ts30.is_empty());

        // Empty summary is emitted, not omitted: header only.
        let summary30 =
            std::fs::read_to_string(out_dir.path().join("30").join(SUMMARY_FILE)).unwrap();
        assert_eq!(summary30.lines().count(), 1);

        let summary10 =
            std::fs::read_to_string(out_dir.path().join("10").join(SUMMARY_FILE)).unwrap();
        assert!(summary10.contains("01/01/2014"));
        assert!(summary10.contains("01/02/2014"));
    }

    #[test]
    fn test_load_station_series_skips_malformed_station() {
        let series_dir = TempDir::new().unwrap();

        let good = series_dir.path().join("10");
        std::fs::create_dir(&good).unwrap();
        std::fs::write(
            good.join(TS_FILE),
            format!("{}\n{}\n", reading::CSV_HEADER.join(","), raw_line(1, 0, 10, 0.5)),
        )
        .unwrap();

        // Malformed rows and a station directory with no series file at all.
        let bad = series_dir.path().join("20");
        std::fs::create_dir(&bad).unwrap();
        std::fs::write(
            bad.join(TS_FILE),
            format!("{}\nnot,a,row\n", reading::CSV_HEADER.join(",")),
        )
        .unwrap();
        std::fs::create_dir(series_dir.path().join("30")).unwrap();

        // Non-numeric cruft must be ignored entirely.
        std::fs::create_dir(series_dir.path().join("logs")).unwrap();

        let (stations, skipped) = load_station_series(series_dir.path()).unwrap();
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].id, 10);
        assert_eq!(stations[0].rows.len(), 1);
        assert_eq!(skipped, 2);
    }

    #[test]
    fn test_chunk_count_does_not_change_output() {
        let data_dir = TempDir::new().unwrap();
        std::fs::write(
            data_dir.path().join("d04_text_station_5min_2014_01_01_extract.txt"),
            format!("{}\n{}\n", raw_line(1, 0, 1, 0.5), raw_line(1, 0, 2, 0.5)),
        )
        .unwrap();

        let out_a = TempDir::new().unwrap();
        let out_b = TempDir::new().unwrap();
        generate_time_series(&[1, 2], data_dir.path(), "d04", out_a.path(), 1).unwrap();
        generate_time_series(&[1, 2], data_dir.path(), "d04", out_b.path(), 2).unwrap();

        for id in ["1", "2"] {
            let a = std::fs::read_to_string(out_a.path().join(id).join(TS_FILE)).unwrap();
            let b = std::fs::read_to_string(out_b.path().join(id).join(TS_FILE)).unwrap();
            assert_eq!(a, b);
        }
    }
}
