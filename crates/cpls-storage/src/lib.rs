//! Resilient CSV download + local data-directory bookkeeping for CPLS.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use cpls_core::FetchOutcome;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cpls-storage";

/// Leading body bytes inspected before the stream is trusted as tabular.
pub const SNIFF_LIMIT: usize = 500;

/// The export endpoint serves an HTML interstitial to unknown clients, so
/// downloads identify as a desktop browser.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

const CSV_ACCEPT: &str = "text/csv,application/csv,application/octet-stream;q=0.9,*/*;q=0.8";

/// Sniff whether a body sample looks like comma-delimited text.
///
/// HTML markers anywhere in the first [`SNIFF_LIMIT`] bytes reject the body
/// outright; otherwise the sample must hold at least one comma and one line
/// break.
pub fn looks_like_tabular(sample: &[u8]) -> bool {
    let head = &sample[..sample.len().min(SNIFF_LIMIT)];
    let lower = head.to_ascii_lowercase();
    if contains_subslice(&lower, b"<html") || contains_subslice(&lower, b"<!doctype") {
        return false;
    }
    lower.contains(&b',') && (lower.contains(&b'\n') || lower.contains(&b'\r'))
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Transient statuses worth another attempt; everything else non-200 is final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status.as_u16() {
        429 | 500 | 502 | 503 | 504 => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_request_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay slept after the (attempt_index + 1)-th failed attempt: base * 2^index.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: BROWSER_USER_AGENT.to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Classified failure of a single download attempt.
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Terminal(String),
}

/// Downloads one CSV export to disk with retry, streaming validation, and
/// atomic publication.
#[derive(Debug, Clone)]
pub struct CsvFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

struct StreamTally {
    bytes: u64,
    lines: u64,
    sha256: String,
}

impl CsvFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(CSV_ACCEPT));
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building download client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Fetch `url` into `dest`. Expected failures come back as a non-ok
    /// [`FetchOutcome`], never as a panic or error.
    pub async fn fetch(&self, url: &str, dest: &Path) -> FetchOutcome {
        let mut last_error = String::from("download failed before any attempt completed");

        for attempt in 1..=self.backoff.max_retries {
            info!(attempt, max_retries = self.backoff.max_retries, url, "starting download attempt");
            match self.try_fetch(url, dest).await {
                Ok(outcome) => return outcome,
                Err(FetchFailure::Terminal(message)) => {
                    warn!(url, %message, "download failed terminally");
                    return FetchOutcome::failure(message);
                }
                Err(FetchFailure::Transient(message)) => {
                    warn!(url, %message, "download attempt failed");
                    last_error = message;
                    if attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt - 1);
                        info!(delay_ms = delay.as_millis() as u64, "retrying download");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        FetchOutcome::failure(last_error)
    }

    async fn try_fetch(&self, url: &str, dest: &Path) -> Result<FetchOutcome, FetchFailure> {
        let response = self.client.get(url).send().await.map_err(|err| {
            let message = format!("request error for {url}: {err}");
            match classify_request_error(&err) {
                RetryDisposition::Retryable => FetchFailure::Transient(message),
                RetryDisposition::NonRetryable => FetchFailure::Terminal(message),
            }
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => {
                    FetchFailure::Transient(format!("transient HTTP status {status} for {url}"))
                }
                RetryDisposition::NonRetryable => {
                    FetchFailure::Terminal(format!("unexpected HTTP status {status} for {url}"))
                }
            });
        }

        let part_path = partial_path(dest);
        match self.stream_to_part(response, &part_path).await {
            Ok(tally) => match fs::rename(&part_path, dest).await {
                Ok(()) => {
                    info!(
                        bytes = tally.bytes,
                        lines = tally.lines,
                        path = %dest.display(),
                        "download complete"
                    );
                    Ok(FetchOutcome {
                        ok: true,
                        message: "ok".to_string(),
                        bytes: tally.bytes,
                        lines: tally.lines,
                        sha256: Some(tally.sha256),
                    })
                }
                Err(err) => {
                    discard_partial(&part_path).await;
                    Err(FetchFailure::Transient(format!(
                        "publishing {}: {err}",
                        dest.display()
                    )))
                }
            },
            Err(failure) => {
                discard_partial(&part_path).await;
                Err(failure)
            }
        }
    }

    async fn stream_to_part(
        &self,
        response: reqwest::Response,
        part_path: &Path,
    ) -> Result<StreamTally, FetchFailure> {
        if let Some(parent) = part_path.parent() {
            fs::create_dir_all(parent).await.map_err(|err| {
                FetchFailure::Transient(format!("creating {}: {err}", parent.display()))
            })?;
        }
        let mut file = fs::File::create(part_path).await.map_err(|err| {
            FetchFailure::Transient(format!("opening {}: {err}", part_path.display()))
        })?;

        let mut stream = response.bytes_stream();
        let mut sample: Vec<u8> = Vec::with_capacity(SNIFF_LIMIT);
        let mut validated = false;
        let mut bytes = 0u64;
        let mut lines = 0u64;
        let mut hasher = Sha256::new();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|err| FetchFailure::Transient(format!("streaming body: {err}")))?;
            if chunk.is_empty() {
                continue;
            }

            if !validated {
                sample.extend_from_slice(&chunk);
                if sample.len() >= SNIFF_LIMIT {
                    if !looks_like_tabular(&sample) {
                        return Err(FetchFailure::Terminal(
                            "response does not look like tabular data".to_string(),
                        ));
                    }
                    validated = true;
                }
            }

            lines += chunk.iter().filter(|byte| **byte == b'\n').count() as u64;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(|err| {
                FetchFailure::Transient(format!("writing {}: {err}", part_path.display()))
            })?;
            bytes += chunk.len() as u64;
        }

        // Short bodies never hit the sniff limit; validate whatever arrived.
        if !validated && !looks_like_tabular(&sample) {
            return Err(FetchFailure::Terminal(
                "short response body failed tabular validation".to_string(),
            ));
        }

        file.flush().await.map_err(|err| {
            FetchFailure::Transient(format!("flushing {}: {err}", part_path.display()))
        })?;
        drop(file);

        Ok(StreamTally {
            bytes,
            lines,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    PathBuf::from(format!("{}.part", dest.display()))
}

async fn discard_partial(part_path: &Path) {
    if let Err(err) = fs::remove_file(part_path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %part_path.display(), error = %err, "failed to remove partial file");
        }
    }
}

/// Local directory holding timestamped CSV exports.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating data directory {}", self.root.display()))
    }

    pub fn csv_filename(prefix: &str, stamp: DateTime<Utc>) -> String {
        let safe_prefix = prefix.trim().replace(' ', "").to_lowercase();
        format!("cqc_{}_{}.csv", safe_prefix, stamp.format("%Y%m%d_%H%M%SZ"))
    }

    pub fn csv_path(&self, prefix: &str, stamp: DateTime<Utc>) -> PathBuf {
        self.root.join(Self::csv_filename(prefix, stamp))
    }

    /// Best-effort deletion of `cqc_*.csv` files older than `max_age`.
    /// Returns the number of files removed; failures are logged, not raised.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let mut removed = 0usize;
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %self.root.display(), error = %err, "cleanup scan failed");
                }
                return 0;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if !(name.starts_with("cqc_") && name.ends_with(".csv")) {
                continue;
            }
            let age = entry
                .metadata()
                .await
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| modified.elapsed().ok());
            match age {
                Some(age) if age > max_age => {
                    info!(path = %entry.path().display(), "deleting aged export");
                    match fs::remove_file(entry.path()).await {
                        Ok(()) => removed += 1,
                        Err(err) => {
                            warn!(path = %entry.path().display(), error = %err, "cleanup delete failed");
                        }
                    }
                }
                _ => {}
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn html_markers_reject_regardless_of_csv_shape() {
        assert!(!looks_like_tabular(b"<html><body>a,b\nc,d</body></html>"));
        assert!(!looks_like_tabular(b"<!DOCTYPE html><p>a,b\n</p>"));
        assert!(!looks_like_tabular(b"prefix <HTML> a,b\nc,d"));
    }

    #[test]
    fn comma_and_newline_accept_plain_bodies() {
        assert!(looks_like_tabular(b"id,name\n1,Alice\n"));
        assert!(looks_like_tabular(b"id,name\r\n1,Alice\r\n"));
    }

    #[test]
    fn bodies_missing_comma_or_newline_are_rejected() {
        assert!(!looks_like_tabular(b"just plain text with no structure"));
        assert!(!looks_like_tabular(b"a,b,c no line break"));
        assert!(!looks_like_tabular(b"line one\nline two\n"));
        assert!(!looks_like_tabular(b""));
    }

    #[test]
    fn sniffing_only_considers_the_first_500_bytes() {
        let mut body = vec![b'x'; SNIFF_LIMIT];
        body.extend_from_slice(b"<html>,\n");
        // HTML marker past the window is invisible, but so are the comma
        // and newline, so the sample still fails.
        assert!(!looks_like_tabular(&body));

        let mut body = b"a,b\n".to_vec();
        body.resize(SNIFF_LIMIT, b'x');
        body.extend_from_slice(b"<html>");
        assert!(looks_like_tabular(&body));
    }

    #[test]
    fn transient_status_set_is_exact() {
        for code in [429u16, 500, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status), RetryDisposition::Retryable, "{code}");
        }
        for code in [301u16, 400, 401, 403, 404, 418, 501] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status), RetryDisposition::NonRetryable, "{code}");
        }
    }

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(6),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(6));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(6));
    }

    #[test]
    fn csv_filenames_are_timestamped_and_sanitized() {
        let stamp = Utc.with_ymd_and_hms(2026, 8, 7, 9, 30, 5).single().unwrap();
        assert_eq!(
            DataDir::csv_filename("Home Care", stamp),
            "cqc_homecare_20260807_093005Z.csv"
        );
    }

    #[tokio::test]
    async fn cleanup_removes_only_aged_export_files() {
        let dir = tempdir().expect("tempdir");
        let data_dir = DataDir::new(dir.path());
        std::fs::write(dir.path().join("cqc_homecare_old.csv"), "a,b\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();
        std::fs::write(dir.path().join("other.csv"), "keep me too").unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = data_dir.cleanup_older_than(Duration::from_millis(1)).await;

        assert_eq!(removed, 1);
        assert!(!dir.path().join("cqc_homecare_old.csv").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("other.csv").exists());
    }

    #[tokio::test]
    async fn cleanup_of_missing_directory_is_a_noop() {
        let data_dir = DataDir::new("/definitely/not/a/real/path");
        assert_eq!(data_dir.cleanup_older_than(Duration::from_secs(1)).await, 0);
    }
}
