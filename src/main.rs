//! CLI entry point for the PeMS pipeline.
//!
//! Provides subcommands for the download stages (link batches, daily detail
//! sweeps, route sweeps), the metadata join/filter, station-row extraction,
//! per-sensor time-series generation, and the rollup/distribution analyses.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime, Weekday};
use clap::{Parser, Subcommand};
use pems_pipeline::analysis::distribution::{self, Distribution, Metric};
use pems_pipeline::analysis::rollup::{expected_grid, reindex, rollup};
use pems_pipeline::analysis::summary::{self, PERCENTILES};
use pems_pipeline::download::{download_daily, download_links, download_route_sweep};
use pems_pipeline::extract::{self, STATION_PREAMBLE};
use pems_pipeline::fetch::{
    CancelSource, CancelToken, Credentials, HttpTransport, PortalSession, RetryPolicy, cancel_pair,
};
use pems_pipeline::health;
use pems_pipeline::links::{DEFAULT_MARKER, extract_download_links};
use pems_pipeline::meta::{self, MetaTable};
use pems_pipeline::output::{Manifest, write_csv};
use pems_pipeline::timeseries::{self, TS_FILE, generate_time_series};
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

const DEFAULT_BASE_URL: &str = "http://pems.dot.ca.gov/";

#[derive(Parser)]
#[command(name = "pems_pipeline")]
#[command(about = "Download and aggregate PeMS traffic sensor data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct SessionArgs {
    /// Portal base URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// First backoff delay in seconds (doubles per consecutive failure)
    #[arg(long, default_value_t = 10)]
    base_delay: u64,

    /// Give up after this many retries per request (default: retry forever)
    #[arg(long)]
    max_retries: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download every file linked from a saved clearinghouse HTML page
    DownloadLinks {
        /// Saved HTML page listing the download anchors
        #[arg(value_name = "HTML_PAGE")]
        page: PathBuf,

        /// Substring an href must contain to count as a download link
        #[arg(long, default_value = DEFAULT_MARKER)]
        marker: String,

        /// Directory to save files into
        #[arg(short, long, default_value = "downloads")]
        out_dir: PathBuf,

        #[command(flatten)]
        session: SessionArgs,
    },
    /// Sweep a date range one day at a time, fetching one detail report per day
    DownloadDaily {
        /// First day of the sweep (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,

        /// Last day of the sweep, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end: NaiveDate,

        /// Static report query parameter, key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_kv)]
        params: Vec<(String, String)>,

        /// Directory to save reports into
        #[arg(short, long, default_value = "daily")]
        out_dir: PathBuf,

        #[command(flatten)]
        session: SessionArgs,
    },
    /// Download per-route performance series over multi-day date windows
    DownloadRoutes {
        /// Route id (repeatable)
        #[arg(short, long = "route", required = true)]
        routes: Vec<String>,

        /// First day of the sweep (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,

        /// Last day of the sweep, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end: NaiveDate,

        /// Query window length in days
        #[arg(long, default_value_t = 45, value_parser = clap::value_parser!(u64).range(1..))]
        delta: u64,

        /// Static report query parameter, key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_kv)]
        params: Vec<(String, String)>,

        /// Directory to save reports into
        #[arg(short, long, default_value = "routes")]
        out_dir: PathBuf,

        #[command(flatten)]
        session: SessionArgs,
    },
    /// Join daily detector health reports and compute lane-health averages
    ProcessHealth {
        /// Directory holding the daily health detail reports
        #[arg(short = 'd', long)]
        health_dir: PathBuf,

        /// Where to write the joined, date-tagged table
        #[arg(long, default_value = "joined_health_detail.txt")]
        joined_output: PathBuf,

        /// Where to write the per-station daily average table
        #[arg(long, default_value = "daily_health.csv")]
        summary_output: PathBuf,
    },
    /// Join metadata snapshots, drop moving-ID stations, write the table
    ProcessMeta {
        /// Directory holding the daily metadata snapshot files
        #[arg(short, long)]
        meta_dir: PathBuf,

        /// Only join snapshots dated on or after this day (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Only join snapshots dated on or before this day (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Where to write the joined, filtered table
        #[arg(short, long, default_value = "joined_meta.txt")]
        output: PathBuf,

        /// Also write the rows of stations whose location moved
        #[arg(long)]
        moving_output: Option<PathBuf>,
    },
    /// Filter raw daily station files down to the stations in a metadata table
    Extract {
        /// Joined metadata table (from process-meta)
        #[arg(short, long)]
        meta_table: PathBuf,

        /// Directory holding the raw daily station files
        #[arg(short, long)]
        station_dir: PathBuf,

        /// Leading characters of raw station filenames
        #[arg(long, default_value = STATION_PREAMBLE)]
        preamble: String,

        /// Directory to write the extracted files into
        #[arg(short, long, default_value = "extracted")]
        out_dir: PathBuf,
    },
    /// Build one time-series directory per station from extracted files
    TimeSeries {
        /// Joined metadata table (from process-meta)
        #[arg(short, long)]
        meta_table: PathBuf,

        /// Directory holding the extracted daily files
        #[arg(short, long)]
        station_dir: PathBuf,

        /// Leading characters of extracted filenames
        #[arg(long, default_value = STATION_PREAMBLE)]
        preamble: String,

        /// Directory to write per-station directories into
        #[arg(short, long, default_value = "series")]
        out_dir: PathBuf,

        /// Number of station chunks (more chunks, less memory, more passes)
        #[arg(long, default_value_t = 4)]
        chunks: usize,
    },
    /// Reindex each station's series onto the 5-minute grid and roll it up
    Rollup {
        /// Directory of per-station series directories (from time-series)
        #[arg(short, long)]
        series_dir: PathBuf,

        /// First day of the expected grid (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,

        /// Number of days in the expected grid
        #[arg(long)]
        days: u32,

        /// Rows per rollup window (e.g. 12 for hourly from 5-minute data)
        #[arg(long, default_value_t = 12)]
        agg_period: usize,
    },
    /// Build per-day-group histogram distributions for each station
    Distributions {
        /// Directory of per-station series directories (from time-series)
        #[arg(short, long)]
        series_dir: PathBuf,

        /// Which reading field to histogram: count or speed
        #[arg(long, default_value = "count")]
        metric: String,

        /// Comma-separated ascending value bin edges
        #[arg(long, value_parser = parse_edges)]
        bin_edges: Edges,

        /// Day group: weekdays, weekends, all, or comma-separated day names
        #[arg(long, default_value = "weekdays")]
        days: String,
    },
    /// Pool station distributions over a clock-time window and report stats
    Summarize {
        /// Directory of per-station series directories (from time-series)
        #[arg(short, long)]
        series_dir: PathBuf,

        /// Which reading field to histogram: count or speed
        #[arg(long, default_value = "count")]
        metric: String,

        /// Comma-separated ascending value bin edges
        #[arg(long, value_parser = parse_edges)]
        bin_edges: Edges,

        /// Day group: weekdays, weekends, all, or comma-separated day names
        #[arg(long, default_value = "weekdays")]
        days: String,

        /// Window start, HH:MM (inclusive)
        #[arg(long)]
        from: String,

        /// Window end, HH:MM (inclusive; before `from` wraps past midnight)
        #[arg(long)]
        to: String,

        /// Where to write the summary CSV
        #[arg(short, long, default_value = "period_summary.csv")]
        output: PathBuf,
    },
}

/// Newtype so clap can carry a parsed edge list through its value parser.
#[derive(Clone)]
struct Edges(Vec<f64>);

fn parse_kv(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {s:?}"))
}

fn parse_edges(s: &str) -> Result<Edges, String> {
    let edges: Result<Vec<f64>, _> = s.split(',').map(|e| e.trim().parse::<f64>()).collect();
    match edges {
        Ok(e) if e.len() >= 2 => Ok(Edges(e)),
        Ok(_) => Err("need at least two bin edges".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_day_group(s: &str) -> Result<Vec<Weekday>> {
    use Weekday::*;
    Ok(match s {
        "weekdays" => vec![Mon, Tue, Wed, Thu, Fri],
        "weekends" => vec![Sat, Sun],
        "all" => vec![Mon, Tue, Wed, Thu, Fri, Sat, Sun],
        other => other
            .split(',')
            .map(|d| Weekday::from_str(d.trim()).map_err(|_| anyhow::anyhow!("bad day {d:?}")))
            .collect::<Result<Vec<_>>>()?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/pems_pipeline.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("pems_pipeline.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::DownloadLinks {
            page,
            marker,
            out_dir,
            session,
        } => {
            let html = std::fs::read_to_string(&page)
                .with_context(|| format!("reading link page {}", page.display()))?;
            let links = extract_download_links(&html, &marker);
            info!(links = links.len(), "links extracted from page");

            let (portal, cancel) = open_session(&session).await?;
            let report = download_links(&portal, &links, &out_dir, &cancel).await?;
            finish_download(&out_dir, "download-links", report)?;
        }
        Commands::DownloadDaily {
            start,
            end,
            params,
            out_dir,
            session,
        } => {
            let (portal, cancel) = open_session(&session).await?;
            let report = download_daily(&portal, &params, start, end, &out_dir, &cancel).await?;
            finish_download(&out_dir, "download-daily", report)?;
        }
        Commands::DownloadRoutes {
            routes,
            start,
            end,
            delta,
            params,
            out_dir,
            session,
        } => {
            let (portal, cancel) = open_session(&session).await?;
            let report = download_route_sweep(
                &portal, &params, &routes, start, end, delta, &out_dir, &cancel,
            )
            .await?;
            finish_download(&out_dir, "download-routes", report)?;
        }
        Commands::ProcessHealth {
            health_dir,
            joined_output,
            summary_output,
        } => {
            let (joined, report) = health::join_health(&health_dir)?;
            joined.write(&joined_output)?;

            let summary = health::daily_health(&joined)?;
            summary.write(&summary_output)?;

            info!(
                files_processed = report.files_processed,
                files_skipped = report.files_skipped,
                rows_joined = report.rows_joined,
                joined = %joined_output.display(),
                summary = %summary_output.display(),
                "health stage complete"
            );
        }
        Commands::ProcessMeta {
            meta_dir,
            start,
            end,
            output,
            moving_output,
        } => {
            let range = match (start, end) {
                (Some(s), Some(e)) => Some((s, e)),
                (None, None) => None,
                _ => anyhow::bail!("--start and --end must be given together"),
            };
            let table = meta::join_meta(&meta_dir, meta::META_PREAMBLE, range)?;
            let moving = table.detect_moving_ids();
            if !moving.is_empty() {
                warn!(moving = moving.len(), "stations with inconsistent locations dropped");
            }

            let kept = table.filter_moving();
            kept.write(&output)?;
            info!(
                rows = kept.rows.len(),
                stations = kept.target_ids().len(),
                output = %output.display(),
                "metadata table written"
            );

            if let Some(path) = moving_output {
                table.moving_rows().write(&path)?;
            }
        }
        Commands::Extract {
            meta_table,
            station_dir,
            preamble,
            out_dir,
        } => {
            let targets = MetaTable::read(&meta_table)?.target_ids();
            info!(stations = targets.len(), "extracting target stations");
            let report =
                extract::extract_station_targets(&station_dir, &preamble, &targets, &out_dir)?;

            let mut manifest = Manifest::new("extract");
            for name in extract::matching_files(&out_dir, &preamble)? {
                manifest.push(&out_dir.join(name));
            }
            manifest.write(&out_dir)?;
            info!(
                files_processed = report.files_processed,
                files_skipped = report.files_skipped,
                rows_extracted = report.rows_extracted,
                "extract stage complete"
            );
        }
        Commands::TimeSeries {
            meta_table,
            station_dir,
            preamble,
            out_dir,
            chunks,
        } => {
            let targets: Vec<u32> = MetaTable::read(&meta_table)?
                .target_ids()
                .into_iter()
                .collect();
            let report =
                generate_time_series(&targets, &station_dir, &preamble, &out_dir, chunks)?;

            let mut manifest = Manifest::new("time-series");
            for id in &targets {
                manifest.push(&out_dir.join(id.to_string()).join(TS_FILE));
            }
            manifest.write(&out_dir)?;
            info!(
                stations_written = report.stations_written,
                empty_stations = report.empty_stations,
                "time-series stage complete"
            );
        }
        Commands::Rollup {
            series_dir,
            start,
            days,
            agg_period,
        } => {
            let grid = expected_grid(start, days);
            let mut manifest = Manifest::new("rollup");
            let (stations, skipped) = timeseries::load_station_series(&series_dir)?;
            let processed = stations.len();

            for station in stations {
                let slots = reindex(station.rows, &grid);
                let out = rollup(&slots, agg_period)?;
                if out.zero_flow_windows > 0 {
                    info!(
                        station = station.id,
                        zero_flow_windows = out.zero_flow_windows,
                        "zero-flow windows"
                    );
                }

                let path = station.dir.join("rollup.csv");
                write_csv(
                    &path,
                    Some(&["Window_Start", "Samples", "Total_Flow", "Rollup_Speed", "Zero_Flow"]),
                    out.rows.iter().map(|r| {
                        vec![
                            r.window_start
                                .format(pems_pipeline::reading::TS_FORMAT)
                                .to_string(),
                            r.sample_sum.to_string(),
                            r.flow_sum.to_string(),
                            r.speed.map(|s| s.to_string()).unwrap_or_default(),
                            r.is_zero_flow().to_string(),
                        ]
                    }),
                )?;
                manifest.push(&path);
            }
            manifest.write(&series_dir)?;
            info!(processed, skipped, "rollup stage complete");
        }
        Commands::Distributions {
            series_dir,
            metric,
            bin_edges,
            days,
        } => {
            let metric: Metric = metric.parse()?;
            let group = parse_day_group(&days)?;
            let prefix = format!("{}_{}", metric_name(metric), days.replace(',', "_"));
            let mut manifest = Manifest::new("distributions");

            let (stations, skipped) = timeseries::load_station_series(&series_dir)?;
            let processed = stations.len();

            let mut dists: Vec<Distribution> = Vec::new();
            for station in &stations {
                let dist = distribution::build(&station.rows, metric, &bin_edges.0, &group)?;
                if dist.out_of_range > 0 {
                    warn!(
                        station = station.id,
                        skipped = dist.out_of_range,
                        "values outside the bin range"
                    );
                }
                dist.write(&station.dir, &prefix)?;
                manifest.push(&station.dir.join(format!("{prefix}_totals.csv")));
                dists.push(dist);
            }

            // Pooled daily profile across every station in the group.
            if !dists.is_empty() {
                let refs: Vec<&Distribution> = dists.iter().collect();
                let trend = summary::trendline(&refs)?;
                let path = series_dir.join(format!("{prefix}_trendline.csv"));
                write_csv(
                    &path,
                    Some(&["Time", "Mean"]),
                    trend.iter().enumerate().map(|(t, v)| {
                        vec![
                            distribution::time_label(t),
                            v.map(|m| m.to_string()).unwrap_or_default(),
                        ]
                    }),
                )?;
                manifest.push(&path);
            }
            manifest.write(&series_dir)?;
            info!(processed, skipped, "distributions stage complete");
        }
        Commands::Summarize {
            series_dir,
            metric,
            bin_edges,
            days,
            from,
            to,
            output,
        } => {
            let metric: Metric = metric.parse()?;
            let group = parse_day_group(&days)?;
            let from = parse_clock_arg(&from)?;
            let to = parse_clock_arg(&to)?;

            let (stations, skipped) = timeseries::load_station_series(&series_dir)?;
            if skipped > 0 {
                warn!(skipped, "unreadable station series left out of the pool");
            }
            let mut dists: Vec<Distribution> = Vec::new();
            for station in &stations {
                dists.push(distribution::build(&station.rows, metric, &bin_edges.0, &group)?);
            }
            let refs: Vec<&Distribution> = dists.iter().collect();
            let stats = summary::time_period_summary(&refs, from, to)?;

            info!(
                observations = stats.observations,
                mean = stats.mean,
                std = stats.std,
                median = stats.percentiles[3],
                "time period summary"
            );

            let mut rows: Vec<Vec<String>> = PERCENTILES
                .iter()
                .zip(&stats.percentiles)
                .map(|(p, v)| vec![format!("p{p}"), v.to_string()])
                .collect();
            rows.push(vec!["mean".to_string(), stats.mean.to_string()]);
            rows.push(vec!["std".to_string(), stats.std.to_string()]);
            rows.push(vec![
                "observations".to_string(),
                stats.observations.to_string(),
            ]);
            write_csv(&output, Some(&["Statistic", "Value"]), rows)?;
        }
    }

    Ok(())
}

fn metric_name(metric: Metric) -> &'static str {
    match metric {
        Metric::Flow => "count",
        Metric::Speed => "speed",
    }
}

fn parse_clock_arg(s: &str) -> Result<NaiveTime> {
    summary::parse_clock(s).with_context(|| format!("expected HH:MM, got {s:?}"))
}

/// Builds the authenticated session from env credentials and wires Ctrl+C
/// into the cancellation token every long-running fetch loop checks.
async fn open_session(
    args: &SessionArgs,
) -> Result<(PortalSession<HttpTransport>, CancelToken)> {
    let credentials = Credentials {
        username: std::env::var("PEMS_USERNAME").context("PEMS_USERNAME must be set")?,
        password: std::env::var("PEMS_PASSWORD").context("PEMS_PASSWORD must be set")?,
    };
    let policy = RetryPolicy {
        base_delay: Duration::from_secs(args.base_delay),
        max_retries: args.max_retries,
    };

    let session = PortalSession::new(HttpTransport::new()?, &args.base_url, credentials, policy);
    session.login().await?;

    let (src, token) = cancel_pair();
    tokio::spawn(watch_ctrl_c(src));
    Ok((session, token))
}

async fn watch_ctrl_c(src: CancelSource) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupt received, finishing current item and stopping");
        src.cancel();
    }
}

fn finish_download(
    out_dir: &Path,
    stage: &str,
    report: pems_pipeline::download::DownloadReport,
) -> Result<()> {
    let mut manifest = Manifest::new(stage);
    for entry in std::fs::read_dir(out_dir)? {
        let entry = entry?;
        if entry.path().is_file() && entry.file_name() != "manifest.json" {
            manifest.push(&entry.path());
        }
    }
    manifest.write(out_dir)?;
    info!(
        downloaded = report.downloaded,
        skipped = report.skipped,
        "download stage complete"
    );
    Ok(())
}
