//! Histogram distributions of flow or speed over time-of-day bins.
//!
//! For one station and one weekday (or combined day group), every reading is
//! bucketed into one of 288 five-minute time-of-day bins and one value bin
//! from a caller-supplied edge list. The proportions matrix normalizes each
//! time-of-day row to sum to 1; the variance matrices follow the scaled
//! binomial model.

use std::path::Path;

use chrono::{Datelike, Weekday};
use thiserror::Error;
use tracing::debug;

use crate::output::write_csv;
use crate::reading::{SLOTS_PER_DAY, StationReading};

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("unknown metric {0:?}; expected \"count\" or \"speed\"")]
    UnknownMetric(String),

    #[error("bin edges must be strictly ascending with at least two entries")]
    BadBinEdges,

    #[error("distributions have different bin edges")]
    BinEdgeMismatch,

    #[error("no distributions given")]
    Empty,
}

/// Which reading field is histogrammed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Vehicle count (`Total_Flow`). Named `count` on the CLI surface.
    Flow,
    /// Average speed (`Avg_Speed`).
    Speed,
}

impl std::str::FromStr for Metric {
    type Err = DistributionError;

    /// Anything outside the fixed set is a configuration error, rejected
    /// before any I/O happens.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "count" | "flow" => Ok(Metric::Flow),
            "speed" => Ok(Metric::Speed),
            other => Err(DistributionError::UnknownMetric(other.to_string())),
        }
    }
}

impl Metric {
    fn value(&self, r: &StationReading) -> Option<f64> {
        match self {
            Metric::Flow => r.total_flow,
            Metric::Speed => r.avg_speed,
        }
    }
}

/// Distribution table for one station and one day group.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    pub bin_edges: Vec<f64>,
    /// `totals[time_bin][value_bin]` = observation count. 288 rows.
    pub totals: Vec<Vec<u64>>,
    /// Each row of `totals` divided by its row sum; rows listed in
    /// `empty_rows` are left at zero instead of becoming NaN.
    pub proportions: Vec<Vec<f64>>,
    /// `rt^3 / (rt - 1) * p * (1 - p)` per cell (variance of the scaled
    /// binomial count); zero where the row total is below 2.
    pub var_totals: Vec<Vec<f64>>,
    /// `p * (1 - p)` per cell.
    pub var_proportions: Vec<Vec<f64>>,
    /// Time-of-day bins with zero observations, flagged explicitly.
    pub empty_rows: Vec<usize>,
    /// Readings whose value fell outside the bin edges (skipped, counted).
    pub out_of_range: usize,
}

fn check_edges(bin_edges: &[f64]) -> Result<(), DistributionError> {
    if bin_edges.len() < 2 || bin_edges.windows(2).any(|w| w[0] >= w[1]) {
        return Err(DistributionError::BadBinEdges);
    }
    Ok(())
}

/// Half-open value bin `[e_i, e_{i+1})`, or `None` when out of range.
fn value_bin(bin_edges: &[f64], v: f64) -> Option<usize> {
    let idx = bin_edges.partition_point(|e| *e <= v);
    if idx == 0 || idx == bin_edges.len() {
        None
    } else {
        Some(idx - 1)
    }
}

/// Builds the distribution of `metric` over the readings falling on any of
/// `days`. A single-element slice gives a per-weekday table; several
/// elements give a combined day group directly.
pub fn build(
    rows: &[StationReading],
    metric: Metric,
    bin_edges: &[f64],
    days: &[Weekday],
) -> Result<Distribution, DistributionError> {
    check_edges(bin_edges)?;
    let n_bins = bin_edges.len() - 1;

    let mut totals = vec![vec![0u64; n_bins]; SLOTS_PER_DAY];
    let mut out_of_range = 0usize;

    for r in rows {
        if !days.contains(&r.timestamp.weekday()) {
            continue;
        }
        let Some(v) = metric.value(r) else { continue };
        match value_bin(bin_edges, v) {
            Some(b) => totals[r.time_bin()][b] += 1,
            None => out_of_range += 1,
        }
    }

    if out_of_range > 0 {
        debug!(out_of_range, "readings outside the histogram range skipped");
    }
    Ok(derive_from_totals(bin_edges.to_vec(), totals, out_of_range))
}

/// Computes proportions and variance matrices from raw counts.
fn derive_from_totals(bin_edges: Vec<f64>, totals: Vec<Vec<u64>>, out_of_range: usize) -> Distribution {
    let n_bins = bin_edges.len() - 1;
    let mut proportions = vec![vec![0.0; n_bins]; SLOTS_PER_DAY];
    let mut var_totals = vec![vec![0.0; n_bins]; SLOTS_PER_DAY];
    let mut var_proportions = vec![vec![0.0; n_bins]; SLOTS_PER_DAY];
    let mut empty_rows = Vec::new();

    for (t, row) in totals.iter().enumerate() {
        let rt: u64 = row.iter().sum();
        if rt == 0 {
            empty_rows.push(t);
            continue;
        }
        let rt_f = rt as f64;
        for (b, &count) in row.iter().enumerate() {
            let p = count as f64 / rt_f;
            proportions[t][b] = p;
            var_proportions[t][b] = p * (1.0 - p);
            if rt >= 2 {
                var_totals[t][b] = rt_f.powi(3) / (rt_f - 1.0) * p * (1.0 - p);
            }
        }
    }

    Distribution {
        bin_edges,
        totals,
        proportions,
        var_totals,
        var_proportions,
        empty_rows,
        out_of_range,
    }
}

/// Combines per-day distributions into one day group by summing `totals`
/// element-wise and recomputing the derived matrices from the summed counts
/// (summing counts first keeps the weighting by sample size correct).
pub fn group_days(tables: &[&Distribution]) -> Result<Distribution, DistributionError> {
    let first = tables.first().ok_or(DistributionError::Empty)?;
    let n_bins = first.bin_edges.len() - 1;

    let mut totals = vec![vec![0u64; n_bins]; SLOTS_PER_DAY];
    let mut out_of_range = 0usize;
    for table in tables {
        if table.bin_edges != first.bin_edges {
            return Err(DistributionError::BinEdgeMismatch);
        }
        for (t, row) in table.totals.iter().enumerate() {
            for (b, &count) in row.iter().enumerate() {
                totals[t][b] += count;
            }
        }
        out_of_range += table.out_of_range;
    }

    Ok(derive_from_totals(first.bin_edges.clone(), totals, out_of_range))
}

/// `HH:MM` label for a time-of-day bin.
pub fn time_label(bin: usize) -> String {
    format!("{:02}:{:02}", bin * 5 / 60, bin * 5 % 60)
}

impl Distribution {
    /// Writes the four matrices as CSV files under `dir`, named
    /// `<prefix>_totals.csv` etc. Header is the value-bin lower edges;
    /// the index column is the `HH:MM` time-of-day label.
    pub fn write(&self, dir: &Path, prefix: &str) -> anyhow::Result<()> {
        let header: Vec<String> = std::iter::once("Time".to_string())
            .chain(
                self.bin_edges[..self.bin_edges.len() - 1]
                    .iter()
                    .map(|e| e.to_string()),
            )
            .collect();
        let header_refs: Vec<&str> = header.iter().map(String::as_str).collect();

        let write_matrix = |name: &str, cells: &dyn Fn(usize, usize) -> String| {
            let n_bins = self.bin_edges.len() - 1;
            let rows = (0..SLOTS_PER_DAY).map(|t| {
                std::iter::once(time_label(t))
                    .chain((0..n_bins).map(|b| cells(t, b)))
                    .collect::<Vec<String>>()
            });
            write_csv(
                &dir.join(format!("{prefix}_{name}.csv")),
                Some(&header_refs),
                rows,
            )
        };

        write_matrix("totals", &|t, b| self.totals[t][b].to_string())?;
        write_matrix("proportions", &|t, b| self.proportions[t][b].to_string())?;
        write_matrix("var_totals", &|t, b| self.var_totals[t][b].to_string())?;
        write_matrix("var_proportions", &|t, b| {
            self.var_proportions[t][b].to_string()
        })?;
        Ok(())
    }
}
