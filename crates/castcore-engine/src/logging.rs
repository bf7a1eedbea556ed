//! Centralized timestamped logging
//!
//! All logs should go through `logi!`, `logw!`, or `loge!` so they include:
//!   <timestamp> [TAG][thread] message
//!
//! Info lines go to stdout, warnings and errors to stderr. `init()` optionally adds an
//! append-only file sink that receives every line.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

static LOG_FILE: OnceLock<Mutex<Option<std::fs::File>>> = OnceLock::new();
static RUN_ID: OnceLock<String> = OnceLock::new();

/// Initialize logging. Call once at startup.
/// - If `log_file` is Some, every log line is also appended to that path.
///
/// Returns the generated run_id.
pub fn init(log_file: Option<PathBuf>) -> String {
    let rid = RUN_ID
        .get_or_init(|| {
            // Short correlation id: time xor pid (good enough for grouping a session's lines)
            let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos() as u64;
            format!("{:08x}", nanos ^ (std::process::id() as u64))
        })
        .clone();

    let sink = LOG_FILE.get_or_init(|| Mutex::new(None));

    if let Some(path) = log_file {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => {
                if let Ok(mut guard) = sink.lock() {
                    *guard = Some(f);
                }
            }
            Err(e) => {
                // The macros route through log_line, which is fine here: the sink is still empty.
                log_line("WARN", "LOG", &format!("failed to open log file {}: {e}", path.display()));
            }
        }
    }

    rid
}

/// Current run id (empty if init() wasn't called).
pub fn run_id() -> &'static str {
    RUN_ID.get().map(|s| s.as_str()).unwrap_or("")
}

// NOTE: We use the `time` crate purely for formatting timestamps with millisecond precision.
// Local time is used when available; it falls back to UTC.
pub fn log_timestamp() -> String {
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let Ok(fmt) = time::format_description::parse(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]",
    ) else {
        return "<time-format-error>".to_string();
    };
    now.format(&fmt).unwrap_or_else(|_| "<time-format-error>".to_string())
}

pub fn log_thread_name() -> String {
    std::thread::current().name().unwrap_or("thread").to_string()
}

/// Write one fully formatted line to the console + optional file sink.
///
/// Public because the exported macros expand to it in downstream crates.
#[doc(hidden)]
pub fn log_line(level: &str, tag: &str, msg: &str) {
    let line = format!("{} [{}][{}] {}", log_timestamp(), tag, log_thread_name(), msg);

    if level == "INFO" {
        println!("{line}");
    } else {
        eprintln!("{line}");
    }

    if let Some(m) = LOG_FILE.get() {
        if let Ok(mut guard) = m.lock() {
            if let Some(f) = guard.as_mut() {
                let _ = writeln!(f, "{line}");
                let _ = f.flush();
            }
        }
    }
}

/// Info log: printed to stdout
#[macro_export]
macro_rules! logi {
    ($tag:expr, $($arg:tt)*) => {{
        $crate::logging::log_line("INFO", $tag, &format!($($arg)*));
    }};
}

/// Warning log: printed to stderr
#[macro_export]
macro_rules! logw {
    ($tag:expr, $($arg:tt)*) => {{
        $crate::logging::log_line("WARN", $tag, &format!($($arg)*));
    }};
}

/// Error log: printed to stderr
#[macro_export]
macro_rules! loge {
    ($tag:expr, $($arg:tt)*) => {{
        $crate::logging::log_line("ERROR", $tag, &format!($($arg)*));
    }};
}
