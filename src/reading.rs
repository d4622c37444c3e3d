//! Row model for the PeMS station 5-minute files.
//!
//! Raw daily files are comma-delimited with no header. Only the first 12
//! columns (the station-level aggregates) are kept; the trailing lane-level
//! columns are dropped.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::NaiveDateTime;
use csv::StringRecord;
use flate2::read::GzDecoder;
use thiserror::Error;

/// Number of 5-minute observation slots in one day.
pub const SLOTS_PER_DAY: usize = 288;

/// Observation resolution in minutes.
pub const SLOT_MINUTES: i64 = 5;

/// Timestamp format used by the portal, e.g. `01/15/2014 08:35:00`.
pub const TS_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

/// Column names for station-level aggregates, matching the PeMS docs.
pub const CSV_HEADER: [&str; 12] = [
    "Timestamp",
    "Station",
    "District",
    "Fwy",
    "Dir",
    "Type",
    "Length",
    "Samples",
    "Observed",
    "Total_Flow",
    "Avg_Occ",
    "Avg_Speed",
];

#[derive(Debug, Error)]
pub enum ReadingError {
    #[error("expected at least {expected} columns, got {got}")]
    TooFewColumns { expected: usize, got: usize },

    #[error("bad timestamp {value:?}")]
    Timestamp { value: String },

    #[error("bad value {value:?} in column {column}")]
    Field { column: &'static str, value: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

/// One 5-minute observation for one station.
///
/// `length`, `total_flow`, `avg_occupancy` and `avg_speed` are optional
/// because the portal leaves them empty when a detector reported nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct StationReading {
    pub timestamp: NaiveDateTime,
    pub station: u32,
    pub district: u16,
    pub freeway: u16,
    pub direction: String,
    pub station_type: String,
    pub length: Option<f64>,
    pub samples: u32,
    pub observed_pct: f64,
    pub total_flow: Option<f64>,
    pub avg_occupancy: Option<f64>,
    pub avg_speed: Option<f64>,
}

impl StationReading {
    /// Parses one record of a raw (headerless) station file.
    pub fn from_record(rec: &StringRecord) -> Result<Self, ReadingError> {
        if rec.len() < CSV_HEADER.len() {
            return Err(ReadingError::TooFewColumns {
                expected: CSV_HEADER.len(),
                got: rec.len(),
            });
        }

        let timestamp = NaiveDateTime::parse_from_str(&rec[0], TS_FORMAT).map_err(|_| {
            ReadingError::Timestamp {
                value: rec[0].to_string(),
            }
        })?;

        Ok(StationReading {
            timestamp,
            station: parse_field(&rec[1], "Station")?,
            district: parse_field(&rec[2], "District")?,
            freeway: parse_field(&rec[3], "Fwy")?,
            direction: rec[4].to_string(),
            station_type: rec[5].to_string(),
            length: parse_opt(&rec[6], "Length")?,
            samples: parse_field(&rec[7], "Samples")?,
            observed_pct: parse_field(&rec[8], "Observed")?,
            total_flow: parse_opt(&rec[9], "Total_Flow")?,
            avg_occupancy: parse_opt(&rec[10], "Avg_Occ")?,
            avg_speed: parse_opt(&rec[11], "Avg_Speed")?,
        })
    }

    /// Serializes the reading back into the 12-column record form.
    pub fn to_record(&self) -> Vec<String> {
        vec![
            self.timestamp.format(TS_FORMAT).to_string(),
            self.station.to_string(),
            self.district.to_string(),
            self.freeway.to_string(),
            self.direction.clone(),
            self.station_type.clone(),
            fmt_opt(self.length),
            self.samples.to_string(),
            self.observed_pct.to_string(),
            fmt_opt(self.total_flow),
            fmt_opt(self.avg_occupancy),
            fmt_opt(self.avg_speed),
        ]
    }

    /// Time-of-day bin index in `0..SLOTS_PER_DAY`.
    pub fn time_bin(&self) -> usize {
        use chrono::Timelike;
        let minutes = self.timestamp.hour() as i64 * 60 + self.timestamp.minute() as i64;
        (minutes / SLOT_MINUTES) as usize
    }
}

fn parse_field<T: std::str::FromStr>(s: &str, column: &'static str) -> Result<T, ReadingError> {
    s.trim().parse().map_err(|_| ReadingError::Field {
        column,
        value: s.to_string(),
    })
}

fn parse_opt(s: &str, column: &'static str) -> Result<Option<f64>, ReadingError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    parse_field(s, column).map(Some)
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

/// Opens a raw station file, transparently decoding gzip by extension.
pub fn open_raw(path: &Path) -> Result<Box<dyn Read>, ReadingError> {
    let file = File::open(path)?;
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Ok(Box::new(GzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Reads every row of a headerless station file.
///
/// A malformed row fails the whole file; callers treat that as a per-file
/// recoverable error and move on to the next file.
pub fn read_raw_rows<R: Read>(reader: R) -> Result<Vec<StationReading>, ReadingError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut rows = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        rows.push(StationReading::from_record(&rec)?);
    }
    Ok(rows)
}

/// Reads a raw daily file from disk, gzip-aware.
pub fn read_raw_file(path: &Path) -> Result<Vec<StationReading>, ReadingError> {
    read_raw_rows(open_raw(path)?)
}
