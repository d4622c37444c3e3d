//! Clock-time window statistics reconstructed from histogram tables.
//!
//! The raw readings are gone by this stage; only the binned counts survive.
//! Each value bin is represented by its midpoint, weighted by its count, and
//! percentiles, mean, and spread are computed from that reconstruction. The
//! coarseness this introduces is bounded by the bin width.

use chrono::NaiveTime;
use thiserror::Error;

use crate::analysis::distribution::Distribution;
use crate::reading::{SLOT_MINUTES, SLOTS_PER_DAY};

/// Percentile ranks reported by [`time_period_summary`].
pub const PERCENTILES: [u32; 7] = [5, 15, 25, 50, 75, 85, 95];

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("no observations in the selected time window")]
    EmptySelection,

    #[error("distributions have different bin edges")]
    BinEdgeMismatch,
}

/// Statistics for one clock-time window across a set of distributions.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodSummary {
    /// One value per rank in [`PERCENTILES`], nearest-rank over the
    /// midpoint-weighted reconstruction.
    pub percentiles: Vec<f64>,
    pub mean: f64,
    pub std: f64,
    pub observations: u64,
}

fn bin_time(bin: usize) -> NaiveTime {
    let minutes = (bin * SLOT_MINUTES as usize) as u32;
    NaiveTime::from_hms_opt(minutes / 60, minutes % 60, 0)
        .unwrap_or(NaiveTime::MIN)
}

/// Whether the time-of-day bin falls in the inclusive clock range
/// `[start, end]`. When `start > end` the range wraps midnight, so a bin is
/// in it when it is at-or-after `start` or at-or-before `end`.
fn in_clock_range(bin: usize, start: NaiveTime, end: NaiveTime) -> bool {
    let t = bin_time(bin);
    if start <= end {
        start <= t && t <= end
    } else {
        t >= start || t <= end
    }
}

fn midpoints(bin_edges: &[f64]) -> Vec<f64> {
    bin_edges.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect()
}

/// Summarizes the value distribution over a clock-time window, pooled across
/// `dists` (typically one table per station or per day group). Both window
/// endpoints are included; a window that wraps midnight (e.g. 22:00-02:00)
/// selects the late-evening and early-morning bins.
pub fn time_period_summary(
    dists: &[&Distribution],
    start: NaiveTime,
    end: NaiveTime,
) -> Result<PeriodSummary, SummaryError> {
    let first = dists.first().ok_or(SummaryError::EmptySelection)?;
    let mids = midpoints(&first.bin_edges);

    // Pooled per-value-bin counts over the selected time bins.
    let mut counts = vec![0u64; mids.len()];
    for dist in dists {
        if dist.bin_edges != first.bin_edges {
            return Err(SummaryError::BinEdgeMismatch);
        }
        for t in 0..SLOTS_PER_DAY {
            if !in_clock_range(t, start, end) {
                continue;
            }
            for (b, &count) in dist.totals[t].iter().enumerate() {
                counts[b] += count;
            }
        }
    }

    let n: u64 = counts.iter().sum();
    if n == 0 {
        return Err(SummaryError::EmptySelection);
    }

    let mean = weighted_sum(&mids, &counts, |m| m) / n as f64;
    let var = weighted_sum(&mids, &counts, |m| (m - mean).powi(2)) / n as f64;

    let percentiles = PERCENTILES
        .iter()
        .map(|&p| nearest_rank(&mids, &counts, n, p))
        .collect();

    Ok(PeriodSummary {
        percentiles,
        mean,
        std: var.sqrt(),
        observations: n,
    })
}

fn weighted_sum(mids: &[f64], counts: &[u64], f: impl Fn(f64) -> f64) -> f64 {
    mids.iter()
        .zip(counts)
        .map(|(&m, &c)| f(m) * c as f64)
        .sum()
}

/// Nearest-rank percentile: the midpoint of the bin holding the
/// `ceil(p/100 * n)`-th pooled observation (bins in ascending value order).
fn nearest_rank(mids: &[f64], counts: &[u64], n: u64, p: u32) -> f64 {
    let rank = (p as u64 * n).div_ceil(100).max(1);
    let mut seen = 0u64;
    for (&m, &c) in mids.iter().zip(counts) {
        seen += c;
        if seen >= rank {
            return m;
        }
    }
    *mids.last().unwrap_or(&0.0)
}

/// Per-time-bin weighted mean of bin midpoints, pooled across `dists`:
/// the typical daily profile. Bins with no observations anywhere yield
/// `None`.
pub fn trendline(dists: &[&Distribution]) -> Result<Vec<Option<f64>>, SummaryError> {
    let first = dists.first().ok_or(SummaryError::EmptySelection)?;
    let mids = midpoints(&first.bin_edges);

    let mut out = Vec::with_capacity(SLOTS_PER_DAY);
    for t in 0..SLOTS_PER_DAY {
        let mut counts = vec![0u64; mids.len()];
        for dist in dists {
            if dist.bin_edges != first.bin_edges {
                return Err(SummaryError::BinEdgeMismatch);
            }
            for (b, &count) in dist.totals[t].iter().enumerate() {
                counts[b] += count;
            }
        }
        let n: u64 = counts.iter().sum();
        out.push(if n == 0 {
            None
        } else {
            Some(weighted_sum(&mids, &counts, |m| m) / n as f64)
        });
    }
    Ok(out)
}

/// Parses `HH:MM` into a clock time.
pub fn parse_clock(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::distribution::{Metric, build};
    use crate::reading::StationReading;
    use chrono::Weekday;
    use csv::StringRecord;

    fn reading(ts: &str, flow: f64) -> StationReading {
        let line = format!("{ts},400001,4,101,N,ML,0.58,10,100,{flow},0.0617,62.5");
        let rec = StringRecord::from(line.split(',').collect::<Vec<_>>());
        StationReading::from_record(&rec).unwrap()
    }

    fn clock(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    // 01/06/2014 is a Monday.
    fn dist(rows: &[StationReading]) -> Distribution {
        build(rows, Metric::Flow, &[0.0, 10.0, 20.0, 30.0], &[Weekday::Mon]).unwrap()
    }

    #[test]
    fn test_in_clock_range_plain_and_wrapped() {
        let bin_2300 = 23 * 12;
        let bin_0100 = 12;
        assert!(in_clock_range(bin_2300, clock(22, 0), clock(23, 55)));
        assert!(!in_clock_range(bin_0100, clock(22, 0), clock(23, 55)));

        // Wrapped window 22:00-02:00 takes both sides of midnight.
        assert!(in_clock_range(bin_2300, clock(22, 0), clock(2, 0)));
        assert!(in_clock_range(bin_0100, clock(22, 0), clock(2, 0)));
        assert!(!in_clock_range(12 * 12, clock(22, 0), clock(2, 0)));
    }

    #[test]
    fn test_summary_from_midpoints() {
        // Two observations in [0,10) and two in [10,20): midpoints 5 and 15.
        let rows = vec![
            reading("01/06/2014 08:00:00", 5.0),
            reading("01/06/2014 08:00:00", 5.0),
            reading("01/06/2014 08:05:00", 15.0),
            reading("01/06/2014 08:05:00", 15.0),
        ];
        let d = dist(&rows);
        let s = time_period_summary(&[&d], clock(8, 0), clock(9, 0)).unwrap();

        assert_eq!(s.observations, 4);
        assert!((s.mean - 10.0).abs() < 1e-12);
        assert!((s.std - 5.0).abs() < 1e-12);
        // Median rank 2 lands in the first bin.
        assert_eq!(s.percentiles.len(), PERCENTILES.len());
        assert_eq!(s.percentiles[3], 5.0);
        assert_eq!(s.percentiles[6], 15.0); // p95
    }

    #[test]
    fn test_wrapped_window_equals_union_of_parts() {
        let rows = vec![
            reading("01/06/2014 23:00:00", 5.0),
            reading("01/06/2014 23:30:00", 15.0),
            reading("01/06/2014 01:00:00", 25.0),
        ];
        let d = dist(&rows);

        let wrapped = time_period_summary(&[&d], clock(22, 0), clock(2, 0)).unwrap();
        let evening = time_period_summary(&[&d], clock(22, 0), clock(23, 55)).unwrap();
        let morning = time_period_summary(&[&d], clock(0, 0), clock(2, 0)).unwrap();

        assert_eq!(
            wrapped.observations,
            evening.observations + morning.observations
        );
        assert_eq!(wrapped.observations, 3);
    }

    #[test]
    fn test_empty_window_is_an_error() {
        let d = dist(&[reading("01/06/2014 08:00:00", 5.0)]);
        assert!(matches!(
            time_period_summary(&[&d], clock(12, 0), clock(13, 0)),
            Err(SummaryError::EmptySelection)
        ));
    }

    #[test]
    fn test_mismatched_edges_rejected() {
        let a = dist(&[reading("01/06/2014 08:00:00", 5.0)]);
        let b = build(
            &[reading("01/06/2014 08:00:00", 5.0)],
            Metric::Flow,
            &[0.0, 30.0],
            &[Weekday::Mon],
        )
        .unwrap();
        assert!(matches!(
            time_period_summary(&[&a, &b], clock(8, 0), clock(9, 0)),
            Err(SummaryError::BinEdgeMismatch)
        ));
    }

    #[test]
    fn test_trendline_profiles_each_time_bin() {
        let rows = vec![
            reading("01/06/2014 08:00:00", 5.0),
            reading("01/06/2014 08:00:00", 15.0),
        ];
        let d = dist(&rows);
        let trend = trendline(&[&d]).unwrap();

        assert_eq!(trend.len(), SLOTS_PER_DAY);
        let bin_0800 = 8 * 12;
        assert!((trend[bin_0800].unwrap() - 10.0).abs() < 1e-12);
        assert!(trend[0].is_none());
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("08:30"), Some(clock(8, 30)));
        assert_eq!(parse_clock("8:30"), Some(clock(8, 30)));
        assert!(parse_clock("junk").is_none());
    }
}
