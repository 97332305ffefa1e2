//! Logging setup shared by the server and the one-shot CLI commands: filter
//! selection, the rolling file sink, secret redaction and the crash hook.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::{self, Write},
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=warn,hyper=warn,reqwest=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "recolor";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";
pub const REDACTION_PLACEHOLDER: &str = "***REDACTED***";

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static CRASH_REPORT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeLogMode {
    /// One-shot commands (`colorize`, `fetch-models`, `inspect-model`).
    Cli,
    Server,
}

impl RuntimeLogMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Server => "server",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub mode: RuntimeLogMode,
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub include_noise_filter_when_implicit: bool,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeLogMode::Server,
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            include_noise_filter_when_implicit: true,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

/// `user_filter` is what the operator asked for; `effective_filter` adds the
/// noise directives when the choice was implicit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub effective_filter: String,
    pub noise_applied: bool,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    ConsoleOnly {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::ConsoleOnly {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::ConsoleOnly { reason, .. } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed { crash_dir: PathBuf },
    AlreadyInstalled { crash_dir: PathBuf },
    Disabled { reason: String },
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the
/// default. Noise directives are only prepended for the last two.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let (user_filter, explicit) = if let Some(filter) = options.cli_log_filter.as_deref() {
        (filter.to_string(), true)
    } else if options.verbose >= 2 {
        ("trace".to_string(), true)
    } else if options.verbose == 1 {
        ("debug".to_string(), true)
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        (filter.to_string(), false)
    } else {
        (options.default_log_filter.clone(), false)
    };

    let noise_applied = !explicit
        && options.include_noise_filter_when_implicit
        && !options.noise_filter.trim().is_empty();
    let effective_filter = if noise_applied {
        format!("{},{user_filter}", options.noise_filter.trim())
    } else {
        user_filter.clone()
    };

    LoggingFilterPlan {
        user_filter,
        effective_filter,
        noise_applied,
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::ConsoleOnly {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready {
            log_dir,
            retention_files,
            appender,
        },
        Err(error) => FileSinkPlan::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

/// Wraps a [`MakeWriter`] so every line passes through [`redact_sensitive_text`].
#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

pub fn redacting_make_writer<M>(inner: M) -> RedactingMakeWriter<M> {
    RedactingMakeWriter { inner }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata))
    }
}

/// Buffers until newline so a secret split across writes is still caught.
#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    fn emit(&mut self, chunk: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(chunk);
        self.inner
            .write_all(redact_sensitive_text(&text).as_bytes())
    }

    fn drain_lines(&mut self) -> io::Result<()> {
        while let Some(end) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            self.emit(&line)?;
        }
        Ok(())
    }

    fn drain_all(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.emit(&rest)?;
        }
        Ok(())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.drain_lines()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain_all()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.drain_all();
        let _ = self.inner.flush();
    }
}

/// Mask URL userinfo and the values of secret-looking `key=value` /
/// `key: value` pairs, e.g. signed download URLs in artifact sources.
pub fn redact_sensitive_text(input: &str) -> String {
    redact_sensitive_assignments(&redact_url_credentials(input))
}

fn redact_url_credentials(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut cursor = 0;

    while let Some(offset) = input[cursor..].find("://") {
        let authority_start = cursor + offset + 3;
        let authority_end = input[authority_start..]
            .find(|ch: char| {
                matches!(
                    ch,
                    '/' | '?' | '#' | ' ' | '\t' | '\r' | '\n' | '"' | '\'' | '<' | '>'
                )
            })
            .map(|offset| authority_start + offset)
            .unwrap_or(input.len());

        match input[authority_start..authority_end].rfind('@') {
            Some(at) if at > 0 => {
                output.push_str(&input[cursor..authority_start]);
                output.push_str(REDACTION_PLACEHOLDER);
                output.push_str(&input[authority_start + at..authority_end]);
            }
            _ => output.push_str(&input[cursor..authority_end]),
        }
        cursor = authority_end;
    }

    output.push_str(&input[cursor..]);
    output
}

fn redact_sensitive_assignments(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = String::with_capacity(input.len());
    let mut cursor = 0usize;
    let mut index = 0usize;

    while index < bytes.len() {
        if bytes[index] != b'=' && bytes[index] != b':' {
            index += 1;
            continue;
        }

        let mut key_start = index;
        while key_start > 0 {
            let previous = bytes[key_start - 1];
            if previous.is_ascii_alphanumeric() || previous == b'_' || previous == b'-' {
                key_start -= 1;
            } else {
                break;
            }
        }

        if key_start == index || !is_sensitive_key(&input[key_start..index].to_ascii_lowercase()) {
            index += 1;
            continue;
        }

        let mut value_start = index + 1;
        while value_start < bytes.len() && bytes[value_start].is_ascii_whitespace() {
            value_start += 1;
        }
        if input[value_start..]
            .get(..7)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("bearer "))
        {
            value_start += 7;
        }
        if value_start >= bytes.len() {
            index += 1;
            continue;
        }

        let (secret_start, secret_end) = match bytes[value_start] {
            quote @ (b'\'' | b'"') => {
                let start = value_start + 1;
                let end = input[start..]
                    .find(quote as char)
                    .map(|offset| start + offset)
                    .unwrap_or(input.len());
                (start, end)
            }
            _ => (value_start, unquoted_value_end(bytes, value_start)),
        };

        if secret_end > secret_start {
            output.push_str(&input[cursor..secret_start]);
            output.push_str(REDACTION_PLACEHOLDER);
            cursor = secret_end;
            index = secret_end;
        } else {
            index += 1;
        }
    }

    output.push_str(&input[cursor..]);
    output
}

fn unquoted_value_end(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|&b| {
            b.is_ascii_whitespace() || matches!(b, b'&' | b',' | b';' | b')' | b']' | b'}' | b'"' | b'\'')
        })
        .map(|offset| start + offset)
        .unwrap_or(bytes.len())
}

fn is_sensitive_key(key: &str) -> bool {
    if matches!(
        key,
        "key" | "pwd" | "passwd" | "authorization" | "sig" | "signature" | "x-amz-signature"
    ) {
        return true;
    }

    key.contains("token")
        || key.contains("secret")
        || key.contains("password")
        || key.ends_with("_key")
        || key.ends_with("-key")
        || key.ends_with("apikey")
}

// ---------------------------------------------------------------------------
// Crash reports
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CrashReport {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    location: String,
    payload: String,
    backtrace_policy: &'static str,
    backtrace: String,
}

/// Install a process-wide hook that writes one report per panic under
/// `<data_dir>/logs/crash/` before delegating to the previous hook.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(crash_dir) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Disabled {
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Disabled {
            reason: format!(
                "failed to create crash report directory {}: {error}",
                crash_dir.display()
            ),
        };
    }

    let _install_guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_panic(&hook_dir, info);
        previous_hook(info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

fn record_panic(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the report must not recurse into the hook.
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_crash_report(crash_dir, &CrashReport::capture(info))
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write crash report under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash report under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let (backtrace_policy, backtrace) = match backtrace.status() {
            BacktraceStatus::Captured => ("captured", backtrace.to_string()),
            BacktraceStatus::Disabled => (
                "disabled (set RUST_BACKTRACE=1 to enable)",
                "<disabled by backtrace policy>".to_string(),
            ),
            BacktraceStatus::Unsupported => {
                ("unsupported", "<backtrace unsupported on this platform>".to_string())
            }
            _ => ("unknown", "<backtrace status unknown>".to_string()),
        };

        Self {
            timestamp: chrono::Utc::now(),
            thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: panic_payload_to_string(info.payload()),
            backtrace_policy,
            backtrace,
        }
    }
}

fn write_crash_report(crash_dir: &Path, report: &CrashReport) -> io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;

    let sequence = CRASH_REPORT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(format!(
        "panic-{}-{sequence:06}.log",
        report.timestamp.format("%Y%m%d-%H%M%S-%f")
    ));

    let mut file = fs::File::create(&path)?;
    writeln!(file, "service={}", DEFAULT_LOG_FILE_PREFIX)?;
    writeln!(file, "version={}", env!("CARGO_PKG_VERSION"))?;
    writeln!(file, "timestamp_utc={}", report.timestamp.to_rfc3339())?;
    writeln!(file, "thread={}", report.thread_name)?;
    writeln!(file, "location={}", report.location)?;
    writeln!(file, "payload={}", redact_sensitive_text(&report.payload))?;
    writeln!(file, "backtrace_policy={}", report.backtrace_policy)?;
    writeln!(file, "backtrace:")?;
    writeln!(file, "{}", report.backtrace)?;
    file.flush()?;

    Ok(path)
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(payload) = payload.downcast_ref::<&str>() {
        (*payload).to_string()
    } else if let Some(payload) = payload.downcast_ref::<String>() {
        payload.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
