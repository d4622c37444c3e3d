//! Batch download drivers.
//!
//! Three driving sequences, all sharing the same session/retry machinery:
//! an explicit link list scraped from a clearinghouse page, a day-by-day
//! sweep of detail reports, and a route-id x date-window sweep of
//! performance time series. Each unit of work derives a deterministic
//! output filename so re-runs overwrite instead of duplicating.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{Datelike, Days, NaiveDate, NaiveTime};
use tracing::{info, warn};

use crate::fetch::{CancelToken, PortalSession, SessionError, Transport};
use crate::output::atomic_write;

#[derive(Debug, Default, PartialEq)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub skipped: usize,
}

/// Start dates of consecutive `delta`-day query windows covering
/// `start..=end`. A zero `delta` yields no windows; callers reject it as a
/// configuration error before getting here.
pub fn date_windows(start: NaiveDate, end: NaiveDate, delta: u64) -> Vec<NaiveDate> {
    if delta == 0 {
        return Vec::new();
    }
    let days = (end - start).num_days().max(0) as u64;
    (0..=days / delta)
        .filter_map(|n| start.checked_add_days(Days::new(n * delta)))
        .collect()
}

fn set_param(params: &mut Vec<(String, String)>, key: &str, value: String) {
    match params.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value,
        None => params.push((key.to_string(), value)),
    }
}

fn epoch_start(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

fn epoch_end(date: NaiveDate) -> i64 {
    epoch_start(date) + 3600 * 23 + 60 * 59 + 59
}

fn set_start_date(params: &mut Vec<(String, String)>, date: NaiveDate) {
    set_param(params, "s_time_id", epoch_start(date).to_string());
    set_param(params, "s_yy", date.year().to_string());
    set_param(params, "s_mm", date.month().to_string());
    set_param(params, "s_dd", date.day().to_string());
}

fn set_end_date(params: &mut Vec<(String, String)>, date: NaiveDate) {
    set_param(params, "e_time_id", epoch_end(date).to_string());
    set_param(params, "e_yy", date.year().to_string());
    set_param(params, "e_mm", date.month().to_string());
    set_param(params, "e_dd", date.day().to_string());
}

/// Last path-ish segment of a link, used when the response carries no
/// `Content-Disposition` name.
fn filename_from_link(link: &str) -> String {
    let tail = link.rsplit('/').next().unwrap_or(link);
    let tail = tail.rsplit('=').next().unwrap_or(tail);
    if tail.is_empty() {
        "download.bin".to_string()
    } else {
        tail.to_string()
    }
}

fn resolve_link(base_url: &str, link: &str) -> String {
    if link.starts_with("http") {
        link.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            link.trim_start_matches('/')
        )
    }
}

/// Saves one fetched body, preferring the server-provided attachment name.
fn persist_response(
    out_dir: &Path,
    fallback_name: &str,
    filename: Option<&str>,
    body: &[u8],
) -> Result<PathBuf> {
    let name = filename.unwrap_or(fallback_name);
    let path = out_dir.join(name);
    atomic_write(&path, body)?;
    Ok(path)
}

/// Downloads every link in `links` through an authenticated session.
///
/// Per-item failures (a bad status after retries were exhausted, say) skip
/// that link and continue; cancellation aborts the whole batch.
pub async fn download_links<T: Transport>(
    session: &PortalSession<T>,
    links: &[String],
    out_dir: &Path,
    cancel: &CancelToken,
) -> Result<DownloadReport> {
    let mut report = DownloadReport::default();

    for (i, link) in links.iter().enumerate() {
        info!(iteration = i, link = %link, "downloading link");
        let url = resolve_link(session.base_url(), link);

        match session.fetch_with_retry(&url, &[], cancel).await {
            Ok(resp) => {
                persist_response(
                    out_dir,
                    &filename_from_link(link),
                    resp.filename.as_deref(),
                    &resp.body,
                )?;
                report.downloaded += 1;
            }
            Err(SessionError::Cancelled) => return Err(SessionError::Cancelled.into()),
            Err(e) => {
                warn!(link = %link, error = %e, "link download failed, skipping");
                report.skipped += 1;
            }
        }
    }

    info!(
        downloaded = report.downloaded,
        skipped = report.skipped,
        "link batch complete"
    );
    Ok(report)
}

/// Sweeps `start..=end` one day at a time, fetching one detail report per
/// day. Output files are named `YYYY_MM_DD_detail.txt`.
pub async fn download_daily<T: Transport>(
    session: &PortalSession<T>,
    static_params: &[(String, String)],
    start: NaiveDate,
    end: NaiveDate,
    out_dir: &Path,
    cancel: &CancelToken,
) -> Result<DownloadReport> {
    let mut report = DownloadReport::default();

    for date in date_windows(start, end, 1) {
        info!(date = %date, "downloading daily report");
        let mut params = static_params.to_vec();
        set_start_date(&mut params, date);

        let name = format!(
            "{}_{:02}_{:02}_detail.txt",
            date.year(),
            date.month(),
            date.day()
        );

        match session.fetch_base(&params, cancel).await {
            Ok(resp) => {
                persist_response(out_dir, &name, None, &resp.body)?;
                report.downloaded += 1;
            }
            Err(SessionError::Cancelled) => return Err(SessionError::Cancelled.into()),
            Err(e) => {
                warn!(date = %date, error = %e, "daily download failed, skipping");
                report.skipped += 1;
            }
        }
    }

    info!(
        downloaded = report.downloaded,
        skipped = report.skipped,
        "daily sweep complete"
    );
    Ok(report)
}

/// Downloads performance time series for every route id over `delta`-day
/// date windows. Output files are named `<route>_<y>_<m>_<d>_route.txt`
/// after the window start.
pub async fn download_route_sweep<T: Transport>(
    session: &PortalSession<T>,
    static_params: &[(String, String)],
    route_ids: &[String],
    start: NaiveDate,
    end: NaiveDate,
    delta: u64,
    out_dir: &Path,
    cancel: &CancelToken,
) -> Result<DownloadReport> {
    anyhow::ensure!(delta >= 1, "window length must be at least 1 day");
    let mut report = DownloadReport::default();
    let windows = date_windows(start, end, delta);

    for route_id in route_ids {
        info!(route_id = %route_id, "starting route sweep");
        let mut params = static_params.to_vec();
        set_param(&mut params, "route_id", route_id.clone());

        // Full windows, then the remainder up to the end date.
        let mut spans: Vec<(NaiveDate, NaiveDate)> = windows
            .windows(2)
            .filter_map(|w| Some((w[0], w[1].checked_sub_days(Days::new(1))?)))
            .collect();
        if let Some(last) = windows.last() {
            spans.push((*last, end));
        }

        for (ws, we) in spans {
            if ws > we {
                continue;
            }
            let mut params = params.clone();
            set_start_date(&mut params, ws);
            set_end_date(&mut params, we);

            let name = format!(
                "{}_{}_{}_{}_route.txt",
                route_id,
                ws.year(),
                ws.month(),
                ws.day()
            );

            match session.fetch_base(&params, cancel).await {
                Ok(resp) => {
                    persist_response(out_dir, &name, None, &resp.body)?;
                    report.downloaded += 1;
                }
                Err(SessionError::Cancelled) => return Err(SessionError::Cancelled.into()),
                Err(e) => {
                    warn!(route_id = %route_id, window_start = %ws, error = %e,
                          "route window failed, skipping");
                    report.skipped += 1;
                }
            }
        }
    }

    info!(
        downloaded = report.downloaded,
        skipped = report.skipped,
        "route sweep complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{Credentials, PortalResponse, RetryPolicy, Transport, TransportError};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    struct RecordingTransport {
        requests: Arc<Mutex<Vec<String>>>,
        filename: Option<String>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn post_form(
            &self,
            _url: &str,
            _form: &[(String, String)],
        ) -> Result<PortalResponse, TransportError> {
            Ok(PortalResponse {
                body: b"logout".to_vec(),
                filename: None,
            })
        }

        async fn get(
            &self,
            url: &str,
            params: &[(String, String)],
        ) -> Result<PortalResponse, TransportError> {
            let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            self.requests
                .lock()
                .unwrap()
                .push(format!("{url}?{}", query.join("&")));
            Ok(PortalResponse {
                body: b"data".to_vec(),
                filename: self.filename.clone(),
            })
        }
    }

    fn session(
        filename: Option<String>,
    ) -> (PortalSession<RecordingTransport>, Arc<Mutex<Vec<String>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let session = PortalSession::new(
            RecordingTransport {
                requests: Arc::clone(&requests),
                filename,
            },
            "http://portal.test",
            Credentials {
                username: "u".to_string(),
                password: "p".to_string(),
            },
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_retries: None,
            },
        );
        (session, requests)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_date_windows_daily() {
        let days = date_windows(date(2014, 1, 1), date(2014, 1, 4), 1);
        assert_eq!(days.len(), 4);
        assert_eq!(days[0], date(2014, 1, 1));
        assert_eq!(days[3], date(2014, 1, 4));
    }

    #[test]
    fn test_date_windows_multi_day_delta() {
        let starts = date_windows(date(2014, 1, 1), date(2014, 3, 31), 45);
        assert_eq!(starts[0], date(2014, 1, 1));
        assert_eq!(starts[1], date(2014, 2, 15));
        assert_eq!(starts.len(), 2);
    }

    #[test]
    fn test_date_windows_zero_delta_yields_nothing() {
        assert!(date_windows(date(2014, 1, 1), date(2014, 1, 4), 0).is_empty());
    }

    #[tokio::test]
    async fn test_route_sweep_rejects_zero_delta() {
        let (s, _requests) = session(None);
        let dir = TempDir::new().unwrap();

        let err = download_route_sweep(
            &s,
            &[],
            &["275".to_string()],
            date(2014, 1, 1),
            date(2014, 3, 31),
            0,
            dir.path(),
            &CancelToken::never(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("at least 1 day"));
    }

    #[test]
    fn test_filename_from_link() {
        assert_eq!(
            filename_from_link("/?dnode=Clearinghouse&download=352071"),
            "352071"
        );
        assert_eq!(filename_from_link("x/download/1.txt"), "1.txt");
    }

    #[test]
    fn test_resolve_link() {
        assert_eq!(
            resolve_link("http://portal.test/", "/?download=1"),
            "http://portal.test/?download=1"
        );
        assert_eq!(
            resolve_link("http://portal.test/", "http://other.test/f.txt"),
            "http://other.test/f.txt"
        );
    }

    #[tokio::test]
    async fn test_download_links_uses_content_disposition_name() {
        let (s, _requests) = session(Some("d04_text_station_5min_2014_01_15.txt.gz".to_string()));
        let dir = TempDir::new().unwrap();

        let report = download_links(
            &s,
            &["/?download=1".to_string()],
            dir.path(),
            &CancelToken::never(),
        )
        .await
        .unwrap();

        assert_eq!(report.downloaded, 1);
        assert!(
            dir.path()
                .join("d04_text_station_5min_2014_01_15.txt.gz")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_download_daily_names_and_params() {
        let (s, requests) = session(None);
        let dir = TempDir::new().unwrap();

        let report = download_daily(
            &s,
            &[("report_form".to_string(), "1".to_string())],
            date(2014, 1, 1),
            date(2014, 1, 3),
            dir.path(),
            &CancelToken::never(),
        )
        .await
        .unwrap();

        assert_eq!(report.downloaded, 3);
        assert!(dir.path().join("2014_01_02_detail.txt").exists());

        let requests = requests.lock().unwrap();
        assert!(requests[0].contains("s_yy=2014"));
        assert!(requests[0].contains("s_time_id=1388534400"));
        assert!(requests[0].contains("report_form=1"));
    }

    #[tokio::test]
    async fn test_route_sweep_covers_remainder_window() {
        let (s, requests) = session(None);
        let dir = TempDir::new().unwrap();

        let report = download_route_sweep(
            &s,
            &[],
            &["275".to_string()],
            date(2014, 1, 1),
            date(2014, 3, 31),
            45,
            dir.path(),
            &CancelToken::never(),
        )
        .await
        .unwrap();

        // One full 45-day window plus the remainder up to 3/31.
        assert_eq!(report.downloaded, 2);
        assert!(dir.path().join("275_2014_1_1_route.txt").exists());
        assert!(dir.path().join("275_2014_2_15_route.txt").exists());

        let requests = requests.lock().unwrap();
        // First window must end the day before the second begins, padded to
        // the last second of that day.
        assert!(requests[0].contains("e_mm=2"));
        assert!(requests[0].contains("e_dd=14"));
        assert!(requests[1].contains("e_mm=3"));
        assert!(requests[1].contains("e_dd=31"));
    }
}
