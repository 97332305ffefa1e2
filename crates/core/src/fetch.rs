//! Downloads missing model artifacts into the models directory.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ArtifactSource, FetchSources};
use crate::model::{artifact_present, ArtifactKind, ModelPaths};

const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DOWNLOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const DOWNLOAD_RETRY_BACKOFF_MS: u64 = 250;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchOutcome {
    AlreadyPresent,
    Downloaded { bytes: u64 },
    NoSource,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchEntry {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    #[serde(flatten)]
    pub outcome: FetchOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub entries: Vec<FetchEntry>,
}

impl FetchReport {
    /// True when every artifact is on disk after the run.
    pub fn complete(&self) -> bool {
        self.entries.iter().all(|entry| {
            matches!(
                entry.outcome,
                FetchOutcome::AlreadyPresent | FetchOutcome::Downloaded { .. }
            )
        })
    }
}

pub struct ArtifactFetcher {
    paths: ModelPaths,
    sources: FetchSources,
}

impl ArtifactFetcher {
    pub fn new(paths: ModelPaths, sources: FetchSources) -> Self {
        Self { paths, sources }
    }

    fn source(&self, kind: ArtifactKind) -> Option<&ArtifactSource> {
        match kind {
            ArtifactKind::Network => self.sources.network.as_ref(),
            ArtifactKind::Weights => self.sources.weights.as_ref(),
            ArtifactKind::ClusterPoints => self.sources.cluster_points.as_ref(),
        }
    }

    /// Artifacts whose file is absent or empty.
    pub fn missing_artifacts(&self) -> Vec<ArtifactKind> {
        ArtifactKind::ALL
            .into_iter()
            .filter(|&kind| !artifact_present(self.paths.path(kind)))
            .collect()
    }

    /// Download every missing artifact that has a configured source.
    ///
    /// Individual failures are recorded in the report, not returned.
    pub fn ensure_present(&self) -> FetchReport {
        let mut report = FetchReport::default();
        let missing = self.missing_artifacts();

        for kind in ArtifactKind::ALL {
            let path = self.paths.path(kind).to_path_buf();
            let outcome = if !missing.contains(&kind) {
                FetchOutcome::AlreadyPresent
            } else if let Some(source) = self.source(kind) {
                match fetch_artifact(source, &path) {
                    Ok(bytes) => {
                        info!(artifact = kind.label(), path = %path.display(), bytes, "Artifact downloaded");
                        FetchOutcome::Downloaded { bytes }
                    }
                    Err(err) => {
                        warn!(artifact = kind.label(), error = %format!("{err:#}"), "Artifact download failed");
                        FetchOutcome::Failed {
                            error: format!("{err:#}"),
                        }
                    }
                }
            } else {
                warn!(
                    artifact = kind.label(),
                    path = %path.display(),
                    "Artifact missing and no download source configured"
                );
                FetchOutcome::NoSource
            };
            report.entries.push(FetchEntry {
                kind,
                path,
                outcome,
            });
        }

        report
    }
}

/// Download `source` to `dest`, verifying the digest when one is configured.
pub fn fetch_artifact(source: &ArtifactSource, dest: &Path) -> Result<u64> {
    let url = parse_http_url(&source.url)?;
    let redacted = redacted_url_for_display(&url);
    debug!(url = %redacted, dest = %dest.display(), "Downloading artifact");

    let expected = source
        .sha256
        .as_deref()
        .map(|digest| digest.trim().to_ascii_lowercase());
    download_to_file(&url, &redacted, dest, expected.as_deref())?;

    let size = fs::metadata(dest)
        .with_context(|| format!("failed to stat downloaded file: {}", dest.display()))?
        .len();
    Ok(size)
}

fn parse_http_url(raw: &str) -> Result<Url> {
    let parsed = Url::parse(raw).with_context(|| {
        format!(
            "invalid artifact URL: {}",
            crate::logging::redact_sensitive_text(raw)
        )
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => {
            let redacted = redacted_url_for_display(&parsed);
            bail!("unsupported artifact URL scheme '{scheme}' for '{redacted}' (expected http/https)")
        }
    }
}

fn download_to_file(url: &Url, redacted_url: &str, dest: &Path, sha256: Option<&str>) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(DOWNLOAD_CONNECT_TIMEOUT)
        .timeout(DOWNLOAD_REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client for artifact fetcher")?;

    for attempt in 1..=DOWNLOAD_MAX_ATTEMPTS {
        match download_once(&client, url, redacted_url, dest, sha256) {
            Ok(()) => return Ok(()),
            Err(DownloadAttemptError { retryable, error }) => {
                if retryable && attempt < DOWNLOAD_MAX_ATTEMPTS {
                    debug!(
                        url = %redacted_url,
                        attempt,
                        max_attempts = DOWNLOAD_MAX_ATTEMPTS,
                        error = %error,
                        "download attempt failed; retrying"
                    );

                    let backoff_ms = DOWNLOAD_RETRY_BACKOFF_MS.saturating_mul(attempt as u64);
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                    continue;
                }

                if retryable {
                    return Err(anyhow!(
                        "download failed after {DOWNLOAD_MAX_ATTEMPTS} attempts for {redacted_url}: {error}"
                    ));
                }

                return Err(error);
            }
        }
    }

    Err(anyhow!(
        "download failed after {DOWNLOAD_MAX_ATTEMPTS} attempts for {redacted_url}"
    ))
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn download_once(
    client: &reqwest::blocking::Client,
    url: &Url,
    redacted_url: &str,
    dest: &Path,
    sha256: Option<&str>,
) -> std::result::Result<(), DownloadAttemptError> {
    let mut response = client.get(url.as_str()).send().map_err(|err| {
        let wrapped = anyhow!("failed to start download from {redacted_url}");
        if is_retryable_reqwest_error(&err) {
            DownloadAttemptError::retryable(wrapped)
        } else {
            DownloadAttemptError::fatal(wrapped)
        }
    })?;

    if !response.status().is_success() {
        let status = response.status();
        let wrapped = anyhow!(
            "download request returned HTTP {} for {}",
            status.as_u16(),
            redacted_url
        );

        if is_retryable_status(status) {
            return Err(DownloadAttemptError::retryable(wrapped));
        }
        return Err(DownloadAttemptError::fatal(wrapped));
    }

    if let Some(parent_dir) = dest.parent() {
        fs::create_dir_all(parent_dir)
            .with_context(|| format!("failed to create models dir: {}", parent_dir.display()))
            .map_err(DownloadAttemptError::fatal)?;
    }

    let tmp_path = partial_path(dest);
    cleanup_file_if_exists(&tmp_path);

    let mut tmp_file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))
        .map_err(DownloadAttemptError::fatal)?;
    let mut tmp_guard = TempFileCleanupGuard::new(&tmp_path);

    response.copy_to(&mut tmp_file).map_err(|err| {
        let wrapped = anyhow!("failed while reading HTTP body from {redacted_url}");
        if is_retryable_reqwest_error(&err) {
            DownloadAttemptError::retryable(wrapped)
        } else {
            DownloadAttemptError::fatal(wrapped)
        }
    })?;

    tmp_file
        .flush()
        .with_context(|| format!("failed to flush temp file: {}", tmp_path.display()))
        .map_err(DownloadAttemptError::fatal)?;
    tmp_file
        .sync_all()
        .with_context(|| format!("failed to fsync temp file: {}", tmp_path.display()))
        .map_err(DownloadAttemptError::fatal)?;
    drop(tmp_file);

    if let Some(expected) = sha256 {
        let actual = sha256_file(&tmp_path).map_err(DownloadAttemptError::fatal)?;
        if actual != expected {
            return Err(DownloadAttemptError::fatal(anyhow!(
                "checksum mismatch for {redacted_url}: expected {expected}, got {actual}"
            )));
        }
    }

    fs::rename(&tmp_path, dest)
        .with_context(|| {
            format!(
                "failed to atomically move {} -> {}",
                tmp_path.display(),
                dest.display()
            )
        })
        .map_err(DownloadAttemptError::fatal)?;

    tmp_guard.disarm();
    Ok(())
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
}

fn is_retryable_reqwest_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

struct DownloadAttemptError {
    retryable: bool,
    error: anyhow::Error,
}

impl DownloadAttemptError {
    fn retryable(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            error,
        }
    }

    fn fatal(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            error,
        }
    }
}

struct TempFileCleanupGuard<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> TempFileCleanupGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn disarm(&mut self) {
        self.keep = true;
    }
}

impl Drop for TempFileCleanupGuard<'_> {
    fn drop(&mut self) {
        if !self.keep {
            cleanup_file_if_exists(self.path);
        }
    }
}

fn cleanup_file_if_exists(path: &Path) {
    let _ = fs::remove_file(path);
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn redacted_url_for_display(url: &Url) -> String {
    if url.query().is_none() {
        return url.to_string();
    }

    let mut no_query = url.clone();
    no_query.set_query(None);
    format!("{no_query}?<redacted>")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::thread;

    use tempfile::tempdir;

    enum ServerResponse {
        Success(Vec<u8>),
        Status { code: u16, reason: &'static str },
    }

    fn spawn_sequence_server(
        responses: Vec<ServerResponse>,
    ) -> (String, Arc<AtomicUsize>, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub server");
        let addr = listener.local_addr().expect("stub addr");
        let request_count = Arc::new(AtomicUsize::new(0));
        let request_count_for_thread = Arc::clone(&request_count);

        let handle = thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = listener.accept().expect("accept");
                request_count_for_thread.fetch_add(1, Ordering::SeqCst);
                consume_request_headers(&mut stream);

                match response {
                    ServerResponse::Success(body) => {
                        write_response(&mut stream, 200, "OK", &body);
                    }
                    ServerResponse::Status { code, reason } => {
                        write_response(&mut stream, code, reason, b"");
                    }
                }

                let _ = stream.flush();
            }
        });

        (format!("http://{addr}"), request_count, handle)
    }

    fn consume_request_headers(stream: &mut TcpStream) {
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut buffer = [0u8; 4096];
        let _ = stream.read(&mut buffer);
    }

    fn write_response(stream: &mut TcpStream, status: u16, reason: &str, body: &[u8]) {
        let headers = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(headers.as_bytes()).expect("write headers");
        stream.write_all(body).expect("write body");
    }

    fn source(url: String, sha256: Option<String>) -> ArtifactSource {
        ArtifactSource { url, sha256 }
    }

    fn paths_in(dir: &Path) -> ModelPaths {
        ModelPaths {
            network: dir.join("net.onnx"),
            weights: dir.join("net.bin"),
            cluster_points: dir.join("pts.npy"),
        }
    }

    #[test]
    fn download_writes_file_and_removes_partial() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("models").join("pts.npy");
        let (base, _, handle) = spawn_sequence_server(vec![ServerResponse::Success(b"payload".to_vec())]);

        let bytes = fetch_artifact(&source(format!("{base}/pts.npy"), None), &dest).expect("download");
        handle.join().expect("server thread");

        assert_eq!(bytes, 7);
        assert_eq!(fs::read(&dest).expect("read dest"), b"payload");
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn retryable_status_is_retried() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("net.bin");
        let (base, count, handle) = spawn_sequence_server(vec![
            ServerResponse::Status {
                code: 503,
                reason: "Service Unavailable",
            },
            ServerResponse::Success(b"weights".to_vec()),
        ]);

        fetch_artifact(&source(format!("{base}/net.bin"), None), &dest).expect("download after retry");
        handle.join().expect("server thread");

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(fs::read(&dest).expect("read dest"), b"weights");
    }

    #[test]
    fn client_error_status_is_not_retried() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("net.bin");
        let (base, count, handle) = spawn_sequence_server(vec![ServerResponse::Status {
            code: 404,
            reason: "Not Found",
        }]);

        let err = fetch_artifact(&source(format!("{base}/net.bin?token=secret"), None), &dest)
            .expect_err("404 must fail");
        handle.join().expect("server thread");

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let message = format!("{err:#}");
        assert!(message.contains("HTTP 404"), "{message}");
        assert!(!message.contains("secret"), "query must be redacted: {message}");
        assert!(!dest.exists());
    }

    #[test]
    fn checksum_mismatch_discards_download() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("pts.npy");
        let (base, _, handle) = spawn_sequence_server(vec![ServerResponse::Success(b"payload".to_vec())]);

        let err = fetch_artifact(&source(format!("{base}/pts.npy"), Some("00".repeat(32))), &dest)
            .expect_err("checksum mismatch");
        handle.join().expect("server thread");

        assert!(format!("{err:#}").contains("checksum mismatch"));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn checksum_match_is_case_insensitive() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("pts.npy");
        let digest = format!("{:x}", Sha256::digest(b"payload")).to_ascii_uppercase();
        let (base, _, handle) = spawn_sequence_server(vec![ServerResponse::Success(b"payload".to_vec())]);

        fetch_artifact(&source(format!("{base}/pts.npy"), Some(digest)), &dest).expect("verified download");
        handle.join().expect("server thread");
        assert!(dest.exists());
    }

    #[test]
    fn non_http_scheme_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let err = fetch_artifact(
            &source("file:///etc/passwd".to_string(), None),
            &dir.path().join("x"),
        )
        .expect_err("file scheme");
        assert!(err.to_string().contains("unsupported artifact URL scheme"));
    }

    #[test]
    fn ensure_present_reports_each_artifact() {
        let dir = tempdir().expect("tempdir");
        let paths = paths_in(dir.path());
        fs::write(&paths.network, b"graph").expect("write network");
        fs::write(&paths.weights, b"").expect("write empty weights");

        let (base, _, handle) = spawn_sequence_server(vec![ServerResponse::Success(b"points".to_vec())]);
        let sources = FetchSources {
            network: None,
            weights: None,
            cluster_points: Some(source(format!("{base}/pts.npy"), None)),
        };
        let fetcher = ArtifactFetcher::new(paths.clone(), sources);

        assert_eq!(
            fetcher.missing_artifacts(),
            vec![ArtifactKind::Weights, ArtifactKind::ClusterPoints]
        );

        let report = fetcher.ensure_present();
        handle.join().expect("server thread");

        let outcomes: Vec<_> = report.entries.iter().map(|e| e.outcome.clone()).collect();
        assert_eq!(
            outcomes,
            vec![
                FetchOutcome::AlreadyPresent,
                FetchOutcome::NoSource,
                FetchOutcome::Downloaded { bytes: 6 },
            ]
        );
        assert!(!report.complete());
        assert_eq!(fetcher.missing_artifacts(), vec![ArtifactKind::Weights]);
    }

    #[test]
    fn report_serializes_with_flat_status() {
        let report = FetchReport {
            entries: vec![FetchEntry {
                kind: ArtifactKind::ClusterPoints,
                path: PathBuf::from("models/pts_in_hull.npy"),
                outcome: FetchOutcome::Downloaded { bytes: 5088 },
            }],
        };
        let json = serde_json::to_value(&report).expect("serialize report");
        assert_eq!(json["entries"][0]["kind"], "cluster_points");
        assert_eq!(json["entries"][0]["status"], "downloaded");
        assert_eq!(json["entries"][0]["bytes"], 5088);
    }

    #[test]
    fn redaction_hides_query_only() {
        let url = Url::parse("https://host.example/a/b.onnx?sig=abc&exp=1").expect("url");
        assert_eq!(
            redacted_url_for_display(&url),
            "https://host.example/a/b.onnx?<redacted>"
        );
    }
}
