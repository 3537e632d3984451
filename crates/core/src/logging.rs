//! Tracing setup shared by the server and the CLI.
//!
//! The console gets the selected filter, with chatty dependencies and the callback diagnostics
//! quieted unless the operator picked a filter explicitly. The daily file sink under
//! `<data_dir>/logs` always records the diagnostics at debug, and every event written to it
//! passes through [`redact_sensitive_text`] first.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fs;
use std::io::{self, Write};
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Canonical signing strings and both signatures of a rejected callback.
pub const SIGNATURE_DIAGNOSTICS_TARGET: &str = "signature_diagnostics";
/// Raw bodies of callbacks whose payload failed validation.
pub const PAYLOAD_DIAGNOSTICS_TARGET: &str = "payload_diagnostics";
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_RETENTION_FILES: usize = 14;
pub const REDACTED: &str = "***REDACTED***";

const LOG_FILE_PREFIX: &str = "vidhook";
const QUIET_DEPENDENCIES: [&str; 2] = ["hyper=warn", "reqwest=warn"];
const DIAGNOSTIC_TARGETS: [&str; 2] = [SIGNATURE_DIAGNOSTICS_TARGET, PAYLOAD_DIAGNOSTICS_TARGET];

static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static CRASH_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOrigin {
    Flag,
    Verbosity,
    Environment,
    Default,
}

impl FilterOrigin {
    fn is_implicit(self) -> bool {
        matches!(self, FilterOrigin::Environment | FilterOrigin::Default)
    }
}

/// Filter directives for the console and file sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub origin: FilterOrigin,
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// `--log-filter` wins over `-v`/`-vv`, which win over `RUST_LOG`, which wins over `info`.
    pub fn select(cli_filter: Option<&str>, verbose: u8, rust_log: Option<&str>) -> Self {
        let (origin, base) = if let Some(filter) = non_blank(cli_filter) {
            (FilterOrigin::Flag, filter.to_string())
        } else if verbose >= 2 {
            (FilterOrigin::Verbosity, "trace".to_string())
        } else if verbose == 1 {
            (FilterOrigin::Verbosity, "debug".to_string())
        } else if let Some(filter) = non_blank(rust_log) {
            (FilterOrigin::Environment, filter.to_string())
        } else {
            (FilterOrigin::Default, DEFAULT_LOG_FILTER.to_string())
        };

        let mut console = Vec::new();
        let mut file = Vec::new();
        if origin.is_implicit() {
            console.extend(QUIET_DEPENDENCIES.iter().map(|d| d.to_string()));
            console.extend(DIAGNOSTIC_TARGETS.iter().map(|t| format!("{t}=off")));
            file.extend(QUIET_DEPENDENCIES.iter().map(|d| d.to_string()));
        }
        console.push(base.clone());
        file.push(base.clone());
        for target in DIAGNOSTIC_TARGETS {
            if !names_target(&base, target) {
                file.push(format!("{target}=debug"));
            }
        }

        Self {
            origin,
            console: console.join(","),
            file: file.join(","),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn names_target(filter: &str, target: &str) -> bool {
    filter
        .split(',')
        .filter_map(|directive| directive.trim().split(['=', '[']).next())
        .any(|name| name == target)
}

/// Daily-rotated log file under `<data_dir>/logs`, keeping [`LOG_RETENTION_FILES`] files.
pub fn open_log_appender(data_dir: &Path) -> Result<RollingFileAppender> {
    let log_dir = data_dir.join(LOG_DIR_NAME);
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(LOG_RETENTION_FILES)
        .build(&log_dir)
        .with_context(|| format!("failed to open rolling log file under {}", log_dir.display()))
}

#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
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

/// Collects one formatted event and writes it redacted on flush or drop, so a value split
/// across several `write` calls is still masked.
#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    event: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            event: Vec::new(),
        }
    }

    fn emit(&mut self) -> io::Result<()> {
        if self.event.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&self.event).into_owned();
        self.event.clear();
        self.inner.write_all(redact_sensitive_text(&text).as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.event.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.emit();
        let _ = self.inner.flush();
    }
}

/// Mask URL userinfo and the values of credential-like `key=value` / `key: value` pairs.
pub fn redact_sensitive_text(input: &str) -> String {
    redact_assignments(&redact_url_userinfo(input))
}

fn redact_url_userinfo(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(scheme_end) = rest.find("://") {
        let authority_start = scheme_end + 3;
        out.push_str(&rest[..authority_start]);
        rest = &rest[authority_start..];

        let authority_len = rest
            .find(|ch: char| ch.is_whitespace() || "/?#\"'<>".contains(ch))
            .unwrap_or(rest.len());
        let authority = &rest[..authority_len];
        match authority.rfind('@') {
            Some(at) if at > 0 => {
                out.push_str(REDACTED);
                out.push_str(&authority[at..]);
            }
            _ => out.push_str(authority),
        }
        rest = &rest[authority_len..];
    }

    out.push_str(rest);
    out
}

fn redact_assignments(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut copied = 0;
    let mut index = 0;

    while index < bytes.len() {
        if !matches!(bytes[index], b'=' | b':') {
            index += 1;
            continue;
        }

        // JSON-style `"key":` pairs close the key with a quote.
        let key_end = if index > 0 && matches!(bytes[index - 1], b'"' | b'\'') {
            index - 1
        } else {
            index
        };
        let mut key_start = key_end;
        while key_start > 0 && is_key_byte(bytes[key_start - 1]) {
            key_start -= 1;
        }
        if key_start == key_end || !is_sensitive_key(&input[key_start..key_end]) {
            index += 1;
            continue;
        }

        let (value_start, value_end) = value_span(input, index + 1);
        if value_end <= value_start {
            index += 1;
            continue;
        }
        out.push_str(&input[copied..value_start]);
        out.push_str(REDACTED);
        copied = value_end;
        index = value_end;
    }

    out.push_str(&input[copied..]);
    out
}

fn is_key_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    matches!(
        key.as_str(),
        "key" | "sig" | "pwd" | "passwd" | "authorization"
    ) || key.contains("token")
        || key.contains("secret")
        || key.contains("password")
        || ["api_key", "api-key", "apikey", "access_key", "signing_key", "private_key"]
            .iter()
            .any(|suffix| key.ends_with(suffix))
}

/// Byte span of the value after a separator: a quoted string, or text up to the next delimiter.
/// A leading `Bearer ` scheme is kept visible.
fn value_span(input: &str, from: usize) -> (usize, usize) {
    let bytes = input.as_bytes();
    let mut start = from;
    while start < bytes.len() && bytes[start].is_ascii_whitespace() {
        start += 1;
    }
    if input
        .get(start..start + 7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("bearer "))
    {
        start += 7;
    }
    if start >= bytes.len() {
        return (start, start);
    }

    if matches!(bytes[start], b'"' | b'\'') {
        let quote = bytes[start];
        let content_start = start + 1;
        let end = bytes[content_start..]
            .iter()
            .position(|byte| *byte == quote)
            .map_or(bytes.len(), |offset| content_start + offset);
        return (content_start, end);
    }

    let end = bytes[start..]
        .iter()
        .position(|byte| {
            byte.is_ascii_whitespace() || b"&,;)]}\"'".contains(byte)
        })
        .map_or(bytes.len(), |offset| start + offset);
    (start, end)
}

/// Install a process-wide panic hook that writes a crash report under
/// `<data_dir>/logs/crash` before deferring to the previous hook. Later calls keep the first
/// directory.
pub fn install_crash_reporter(data_dir: &Path) -> Result<PathBuf> {
    if let Some(dir) = CRASH_DIR.get() {
        return Ok(dir.clone());
    }

    let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    fs::create_dir_all(&crash_dir)
        .with_context(|| format!("failed to create crash directory {}", crash_dir.display()))?;

    let mut installed_here = false;
    let dir = CRASH_DIR.get_or_init(|| {
        installed_here = true;
        crash_dir
    });
    if installed_here {
        let previous = panic::take_hook();
        let hook_dir = dir.clone();
        panic::set_hook(Box::new(move |info| {
            report_panic(&hook_dir, info);
            previous(info);
        }));
    }
    Ok(dir.clone())
}

fn report_panic(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    if CRASH_WRITE_IN_PROGRESS.swap(true, Ordering::AcqRel) {
        return;
    }

    let location = info
        .location()
        .map(|location| location.to_string())
        .unwrap_or_else(|| "<unknown>".to_string());
    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_crash_report(crash_dir, &location, &panic_message(info.payload()))
    }));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => eprintln!(
            "Warning: failed to write crash report under '{}': {err}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash reporter panicked while writing under '{}'",
            crash_dir.display()
        ),
    }

    CRASH_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn write_crash_report(crash_dir: &Path, location: &str, message: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;

    let now = Utc::now();
    let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(format!(
        "crash-{}-{sequence:04}.log",
        now.format("%Y%m%dT%H%M%S%.3fZ")
    ));

    let mut file = fs::File::create(&path)?;
    writeln!(file, "time={}", now.to_rfc3339())?;
    writeln!(
        file,
        "thread={}",
        std::thread::current().name().unwrap_or("<unnamed>")
    )?;
    writeln!(file, "location={location}")?;
    writeln!(file, "message={}", redact_sensitive_text(message))?;
    writeln!(file, "backtrace:\n{}", Backtrace::capture())?;
    file.flush()?;
    Ok(path)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
