//! Device option validation
//!
//! Bad options never stop a device from opening. Each problem becomes a `ValidationIssue`
//! saying what is wrong, where it came from and what to do; the option falls back to its
//! default.

use serde_json::Value;

use crate::audio::AudioCadence;
use crate::config::TransferMethod;
use crate::{loge, logi, logw};

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub level: IssueLevel,
    pub path: String,
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueLevel {
    Warn,
    Error,
}

impl ValidationIssue {
    pub fn warn(path: impl Into<String>, message: impl Into<String>, hint: Option<String>) -> Self {
        Self { level: IssueLevel::Warn, path: path.into(), message: message.into(), hint }
    }
    pub fn error(path: impl Into<String>, message: impl Into<String>, hint: Option<String>) -> Self {
        Self { level: IssueLevel::Error, path: path.into(), message: message.into(), hint }
    }
}

pub fn emit_issues(tag: &str, issues: &[ValidationIssue]) {
    for it in issues {
        let hint = it.hint.as_deref().map(|h| format!(" (hint: {h})")).unwrap_or_default();
        match it.level {
            IssueLevel::Warn => logw!(tag, "{}: {}{}", it.path, it.message, hint),
            IssueLevel::Error => loge!(tag, "{}: {}{}", it.path, it.message, hint),
        }
    }
}

/// One-line summary, also when there is nothing to report.
pub fn emit_summary(tag: &str, label: &str, issues: &[ValidationIssue]) {
    let warns = issues.iter().filter(|i| i.level == IssueLevel::Warn).count();
    let errs = issues.iter().filter(|i| i.level == IssueLevel::Error).count();
    if errs == 0 && warns == 0 {
        logi!(tag, "validation: {label} OK (0 issues)");
    } else {
        logw!(tag, "validation: {label} issues found (errors={errs} warnings={warns})");
    }
}

const BOOL_KEYS: &[&str] = &["verbose", "stereo", "vflip", "clock_video"];
const STRING_KEYS: &[&str] = &["name", "groups"];

/// Check `device.json` field types and values.
pub fn validate_device_json(value: &Value) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let Some(obj) = value.as_object() else {
        issues.push(ValidationIssue::error(
            "device.json:/",
            "top level must be a JSON object",
            Some("expected something like { \"method\": \"ipbo\", \"ring_buffer_size\": 5 }".into()),
        ));
        return issues;
    };

    for (key, v) in obj {
        let path = format!("device.json:/{key}");
        match key.as_str() {
            k if BOOL_KEYS.contains(&k) => {
                if !v.is_boolean() {
                    issues.push(ValidationIssue::error(path, "expected true or false", None));
                }
            }
            k if STRING_KEYS.contains(&k) => {
                if !v.is_string() {
                    issues.push(ValidationIssue::error(path, "expected a string", None));
                }
            }
            "method" => match v.as_str() {
                Some(s) => issues.extend(check_method(&path, s)),
                None => issues.push(ValidationIssue::error(path, "expected a string", method_hint())),
            },
            "ring_buffer_size" => match v.as_i64() {
                Some(n) => issues.extend(check_ring_size(&path, n)),
                None => issues.push(ValidationIssue::error(path, "expected an integer", ring_hint())),
            },
            "audio_cadence" => match v.as_str() {
                Some(s) => issues.extend(check_cadence(&path, s)),
                None => issues.push(ValidationIssue::error(path, "expected a string", cadence_hint())),
            },
            _ => issues.push(ValidationIssue::warn(path, format!("unknown key '{key}' ignored"), None)),
        }
    }
    issues
}

fn method_hint() -> Option<String> {
    Some("use \"ipbo\" (pipelined) or \"basic\" (direct readback)".into())
}

fn ring_hint() -> Option<String> {
    Some("ring_buffer_size must be an integer of at least 1".into())
}

fn cadence_hint() -> Option<String> {
    Some("use \"rounded\" or \"distributed\"".into())
}

pub fn check_method(path: &str, s: &str) -> Option<ValidationIssue> {
    match TransferMethod::parse(s) {
        Some(_) => None,
        None => Some(ValidationIssue::error(path, format!("unknown transfer method '{s}'"), method_hint())),
    }
}

pub fn check_ring_size(path: &str, n: i64) -> Option<ValidationIssue> {
    if n >= 1 {
        None
    } else {
        Some(ValidationIssue::error(path, format!("ring buffer size {n} is out of range"), ring_hint()))
    }
}

pub fn check_cadence(path: &str, s: &str) -> Option<ValidationIssue> {
    match <AudioCadence as clap::ValueEnum>::from_str(s, true) {
        Ok(_) => None,
        Err(_) => Some(ValidationIssue::error(path, format!("unknown audio cadence '{s}'"), cadence_hint())),
    }
}
