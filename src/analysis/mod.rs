//! Temporal and statistical aggregation of per-sensor time series.
//!
//! This module reindexes series onto the canonical 5-minute grid, rolls
//! windows up with a flow-weighted harmonic mean, builds time-of-day by
//! value-bin histograms, and summarizes clock-time ranges across stations.

pub mod distribution;
pub mod rollup;
pub mod summary;
