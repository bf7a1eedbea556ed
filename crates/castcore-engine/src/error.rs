use std::{fmt, path::PathBuf};

#[derive(Debug)]
pub enum DeviceError {
    /// I/O error reading a file.
    Io { path: PathBuf, source: std::io::Error },
    /// JSON parse error for a config file.
    Json { path: PathBuf, source: serde_json::Error },

    /// Config is syntactically valid but semantically invalid.
    InvalidConfig { path: PathBuf, msg: String },

    /// A GPU call failed (buffer creation, readback).
    Gpu { op: &'static str, msg: String },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Io { path, source } => {
                write!(f, "I/O error for {}: {}", path.display(), source)
            }
            DeviceError::Json { path, source } => {
                write!(f, "JSON parse error for {}: {}", path.display(), source)
            }
            DeviceError::InvalidConfig { path, msg } => {
                write!(f, "Invalid config {}: {}", path.display(), msg)
            }
            DeviceError::Gpu { op, msg } => write!(f, "GPU {op} failed: {msg}"),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::Io { source, .. } => Some(source),
            DeviceError::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}
