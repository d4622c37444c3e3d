//! End-to-end run of the offline stages: metadata join and moving-ID filter,
//! station extraction, time-series generation, rollup, and distributions,
//! all over synthetic daily files on temp directories.

use chrono::{NaiveDate, Weekday};
use tempfile::TempDir;

use pems_pipeline::analysis::distribution::{self, Metric};
use pems_pipeline::analysis::rollup::{expected_grid, reindex, rollup};
use pems_pipeline::analysis::summary::{PERCENTILES, time_period_summary};
use pems_pipeline::extract::{STATION_PREAMBLE, extract_station_targets};
use pems_pipeline::meta::{META_PREAMBLE, join_meta};
use pems_pipeline::timeseries::{TS_FILE, generate_time_series, read_time_series};

const META_HEADER: &str = "ID\tFwy\tDir\tCounty\tLatitude\tLongitude\tType\n";

fn meta_line(id: u32, lat: f64, lon: f64) -> String {
    format!("{id}\t101\tN\t75\t{lat}\t{lon}\tML\n")
}

fn raw_line(date: &str, slot: u32, station: u32, flow: u32, speed: f64) -> String {
    format!(
        "{date} {:02}:{:02}:00,{station},4,101,N,ML,0.58,20,100,{flow},0.0617,{speed}",
        slot * 5 / 60,
        slot * 5 % 60,
    )
}

#[test]
fn test_full_offline_pipeline() {
    let meta_dir = TempDir::new().unwrap();
    let raw_dir = TempDir::new().unwrap();
    let extract_dir = TempDir::new().unwrap();
    let series_dir = TempDir::new().unwrap();

    // Two metadata snapshots: station 100 is stable, 200 moves between them.
    std::fs::write(
        meta_dir.path().join("d04_text_meta_2014_01_06.txt"),
        format!("{META_HEADER}{}{}", meta_line(100, 37.0, -122.0), meta_line(200, 37.5, -122.5)),
    )
    .unwrap();
    std::fs::write(
        meta_dir.path().join("d04_text_meta_2014_01_07.txt"),
        format!("{META_HEADER}{}{}", meta_line(100, 37.0, -122.0), meta_line(200, 37.6, -122.5)),
    )
    .unwrap();

    let table = join_meta(meta_dir.path(), META_PREAMBLE, None).unwrap();
    assert_eq!(table.rows.len(), 4);

    let kept = table.filter_moving();
    let targets = kept.target_ids();
    assert_eq!(targets.iter().copied().collect::<Vec<u32>>(), vec![100]);

    // Two raw daily files (2014-01-06 is a Monday), both stations present;
    // only station 100 must survive extraction.
    for (day, flow) in [("01/06/2014", 60), ("01/07/2014", 120)] {
        let mut body = String::new();
        for slot in 0..4 {
            body.push_str(&raw_line(day, slot, 100, flow, 60.0));
            body.push('\n');
            body.push_str(&raw_line(day, slot, 200, 999, 10.0));
            body.push('\n');
        }
        let name = format!(
            "d04_text_station_5min_2014_01_{:02}.txt",
            day[3..5].parse::<u32>().unwrap()
        );
        std::fs::write(raw_dir.path().join(name), body).unwrap();
    }

    let report =
        extract_station_targets(raw_dir.path(), STATION_PREAMBLE, &targets, extract_dir.path())
            .unwrap();
    assert_eq!(report.files_processed, 2);
    assert_eq!(report.rows_extracted, 8);

    let target_vec: Vec<u32> = targets.into_iter().collect();
    let ts_report = generate_time_series(
        &target_vec,
        extract_dir.path(),
        STATION_PREAMBLE,
        series_dir.path(),
        2,
    )
    .unwrap();
    assert_eq!(ts_report.stations_written, 1);
    assert_eq!(ts_report.empty_stations, 0);

    let rows = read_time_series(&series_dir.path().join("100").join(TS_FILE)).unwrap();
    assert_eq!(rows.len(), 8);
    assert!(rows.iter().all(|r| r.station == 100));
    assert!(rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    // Rollup over a 2-day grid, hourly windows: the first window of each day
    // holds the 4 observed slots, everything else is zero-flow.
    let grid = expected_grid(NaiveDate::from_ymd_opt(2014, 1, 6).unwrap(), 2);
    let slots = reindex(rows.clone(), &grid);
    let out = rollup(&slots, 12).unwrap();
    assert_eq!(out.rows.len(), 48);
    assert_eq!(out.rows[0].flow_sum, 4.0 * 60.0);
    assert!((out.rows[0].speed.unwrap() - 60.0).abs() < 1e-9);
    assert_eq!(out.rows[24].flow_sum, 4.0 * 120.0);
    assert_eq!(out.zero_flow_windows, 46);

    // Distribution of Monday flows: all 4 observations land in [50, 100).
    let dist = distribution::build(&rows, Metric::Flow, &[0.0, 50.0, 100.0, 150.0], &[Weekday::Mon])
        .unwrap();
    for t in 0..4 {
        assert_eq!(dist.totals[t], vec![0, 1, 0]);
    }
    assert_eq!(dist.out_of_range, 0);

    // Tuesday flows are 120, one value bin up.
    let tue =
        distribution::build(&rows, Metric::Flow, &[0.0, 50.0, 100.0, 150.0], &[Weekday::Tue])
            .unwrap();
    for t in 0..4 {
        assert_eq!(tue.totals[t], vec![0, 0, 1]);
    }

    // Pooled early-morning window over both day tables.
    let stats = time_period_summary(
        &[&dist, &tue],
        chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        chrono::NaiveTime::from_hms_opt(0, 15, 0).unwrap(),
    )
    .unwrap();
    assert_eq!(stats.observations, 8);
    assert_eq!(stats.percentiles.len(), PERCENTILES.len());
    // Midpoints 75 and 125, four observations each.
    assert!((stats.mean - 100.0).abs() < 1e-9);
}
