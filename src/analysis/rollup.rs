//! Reindexing onto the canonical 5-minute grid and temporal rollup.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;
use tracing::warn;

use crate::reading::{SLOT_MINUTES, SLOTS_PER_DAY, StationReading};

#[derive(Debug, Error)]
pub enum RollupError {
    #[error("aggregation period must be at least 1 row")]
    BadAggPeriod,
}

/// The canonical, complete timestamp grid: one slot per 5 minutes from
/// midnight of `start` for `days` days.
pub fn expected_grid(start: NaiveDate, days: u32) -> Vec<NaiveDateTime> {
    let origin = start.and_time(NaiveTime::MIN);
    (0..days as i64 * SLOTS_PER_DAY as i64)
        .map(|i| origin + Duration::minutes(i * SLOT_MINUTES))
        .collect()
}

/// One grid slot: either the observed reading or an explicit gap.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSlot {
    pub timestamp: NaiveDateTime,
    pub reading: Option<StationReading>,
}

/// Reindexes a series onto `grid`: exactly one slot per grid timestamp,
/// missing slots marked `None`, never interpolated. Reindexing an
/// already-complete series is a no-op. Observations whose timestamps fall
/// outside the grid are dropped with a warning.
pub fn reindex(rows: Vec<StationReading>, grid: &[NaiveDateTime]) -> Vec<SeriesSlot> {
    let mut by_ts: std::collections::BTreeMap<NaiveDateTime, StationReading> =
        rows.into_iter().map(|r| (r.timestamp, r)).collect();

    let slots: Vec<SeriesSlot> = grid
        .iter()
        .map(|ts| SeriesSlot {
            timestamp: *ts,
            reading: by_ts.remove(ts),
        })
        .collect();

    if !by_ts.is_empty() {
        warn!(
            dropped = by_ts.len(),
            "observations outside the expected grid were dropped"
        );
    }
    slots
}

/// One aggregated window. `speed` is `None` exactly when the window carried
/// no flow: the flow-weighted harmonic mean is undefined there, and the
/// condition is surfaced (never coerced to 0 or NaN) so consumers can decide
/// policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupRow {
    pub window_start: NaiveDateTime,
    pub sample_sum: u32,
    pub flow_sum: f64,
    pub speed: Option<f64>,
}

impl RollupRow {
    pub fn is_zero_flow(&self) -> bool {
        self.speed.is_none()
    }
}

#[derive(Debug, PartialEq)]
pub struct RollupOutput {
    pub rows: Vec<RollupRow>,
    pub zero_flow_windows: usize,
    /// Trailing rows that did not fill a whole window. Dropped, by the
    /// documented divisibility edge case.
    pub dropped_rows: usize,
}

/// Re-aggregates consecutive `agg_period`-row windows of a reindexed series.
///
/// Per window: samples and flow are summed and speed is the flow-weighted
/// harmonic mean `flow_sum / sum(flow_i / speed_i)` — the correct average of
/// speeds carrying different flow volumes. A trailing partial window (when
/// the slot count is not divisible by `agg_period`) is dropped.
pub fn rollup(slots: &[SeriesSlot], agg_period: usize) -> Result<RollupOutput, RollupError> {
    if agg_period == 0 {
        return Err(RollupError::BadAggPeriod);
    }

    let mut out = RollupOutput {
        rows: Vec::with_capacity(slots.len() / agg_period),
        zero_flow_windows: 0,
        dropped_rows: slots.len() % agg_period,
    };

    for window in slots.chunks_exact(agg_period) {
        let mut sample_sum = 0u32;
        let mut flow_sum = 0.0f64;
        let mut inverse_speed_flow = 0.0f64; // sum of flow_i / speed_i

        for slot in window {
            let Some(r) = &slot.reading else { continue };
            sample_sum += r.samples;
            if let Some(flow) = r.total_flow {
                flow_sum += flow;
                if let Some(speed) = r.avg_speed {
                    if flow > 0.0 && speed > 0.0 {
                        inverse_speed_flow += flow / speed;
                    }
                }
            }
        }

        let speed = if flow_sum > 0.0 && inverse_speed_flow > 0.0 {
            Some(flow_sum / inverse_speed_flow)
        } else {
            out.zero_flow_windows += 1;
            None
        };

        out.rows.push(RollupRow {
            window_start: window[0].timestamp,
            sample_sum,
            flow_sum,
            speed,
        });
    }

    Ok(out)
}
