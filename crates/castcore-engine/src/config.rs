//! Device options
//!
//! Resolution order, lowest to highest precedence:
//!   built-in defaults -> device JSON file -> environment -> `open()` arguments
//!
//! Environment and arguments are parsed together by clap (every option has a fixed
//! `CASTCORE_NDI_*` variable). Problems are returned as `ValidationIssue`s and the affected
//! option keeps its lower-precedence value; resolution itself never fails.

use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser};
use serde::Deserialize;
use serde_json::Value;

use crate::audio::AudioCadence;
use crate::error::DeviceError;
use crate::validate::{self, ValidationIssue};

pub const DEFAULT_RING_BUFFER_SIZE: usize = 5;
pub const DEFAULT_SENDER_NAME: &str = "castcore";

/// How frames leave the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMethod {
    /// Asynchronous reads through the pack-buffer ring, one frame of latency (`ipbo`).
    #[default]
    Pipelined,
    /// Blocking read in the same call (`basic`).
    DirectReadback,
}

impl TransferMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ipbo" | "pipelined" => Some(TransferMethod::Pipelined),
            "basic" | "direct" | "direct-readback" => Some(TransferMethod::DirectReadback),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TransferMethod::Pipelined => "ipbo",
            TransferMethod::DirectReadback => "basic",
        }
    }
}

/// Fully resolved options of one device session.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceOptions {
    pub help: bool,
    /// Per-frame diagnostics in the log.
    pub verbose: bool,
    pub method: TransferMethod,
    pub ring_buffer_size: usize,
    /// Two eyes per output tick; doubles the ring and the frame slots.
    pub stereo: bool,
    pub audio_cadence: AudioCadence,
    /// Flip rows to top-down before handing frames to the transport.
    pub vflip: bool,
    pub sender_name: String,
    pub groups: Option<String>,
    pub clock_video: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            help: false,
            verbose: false,
            method: TransferMethod::default(),
            ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
            stereo: false,
            audio_cadence: AudioCadence::default(),
            vflip: true,
            sender_name: DEFAULT_SENDER_NAME.to_string(),
            groups: None,
            clock_video: true,
        }
    }
}

/// Command-line style device arguments. Every option can also come from the environment.
#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "castcore-ndi",
    about = "Network video output device options",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct DeviceArgs {
    /// Print these options to the log
    #[arg(long, env = "CASTCORE_NDI_HELP")]
    pub help: bool,

    /// Log per-frame transfer diagnostics
    #[arg(long, env = "CASTCORE_NDI_VERBOSE")]
    pub verbose: bool,

    /// Transfer method: ipbo (pipelined) or basic (direct readback)
    #[arg(long, env = "CASTCORE_NDI_METHOD")]
    pub method: Option<String>,

    /// Number of transfer buffers and frame slots (at least 1)
    #[arg(long, env = "CASTCORE_NDI_RING_BUFFER_SIZE", allow_hyphen_values = true)]
    pub ring_buffer_size: Option<String>,

    /// Two eyes per frame
    #[arg(long, env = "CASTCORE_NDI_STEREO")]
    pub stereo: bool,

    /// Audio samples per frame: rounded or distributed
    #[arg(long, env = "CASTCORE_NDI_AUDIO_CADENCE")]
    pub audio_cadence: Option<String>,

    /// Sender name announced on the network
    #[arg(long, env = "CASTCORE_NDI_NAME")]
    pub name: Option<String>,

    /// Comma-separated sender groups
    #[arg(long, env = "CASTCORE_NDI_GROUPS")]
    pub groups: Option<String>,

    /// Send frames bottom-up as read from the GPU
    #[arg(long)]
    pub no_vflip: bool,

    /// Do not let the transport pace submissions
    #[arg(long)]
    pub no_clock_video: bool,

    /// Device JSON file, or a directory holding device(.<os>).json
    #[arg(long, env = "CASTCORE_DEVICE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// `device.json` contents. Every key is optional; unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceJson {
    pub verbose: Option<bool>,
    pub method: Option<String>,
    pub ring_buffer_size: Option<i64>,
    pub stereo: Option<bool>,
    pub audio_cadence: Option<String>,
    pub vflip: Option<bool>,
    pub name: Option<String>,
    pub groups: Option<String>,
    pub clock_video: Option<bool>,
}

/// A JSON file loaded from disk (path + parsed value).
#[derive(Debug, Clone)]
pub struct LoadedJson {
    pub path: PathBuf,
    pub value: Value,
}

/// Choose `<stem>.<os>.json` if present in `dir`, otherwise `<stem>.json`.
pub fn pick_platform_json(dir: &Path, stem: &str) -> PathBuf {
    let os = if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "other"
    };

    let platform = dir.join(format!("{stem}.{os}.json"));
    if platform.exists() {
        platform
    } else {
        dir.join(format!("{stem}.json"))
    }
}

/// A directory resolves to its `device(.<os>).json`; anything else is taken as the file.
pub fn device_config_path(given: &Path) -> PathBuf {
    if given.is_dir() {
        pick_platform_json(given, "device")
    } else {
        given.to_path_buf()
    }
}

pub fn load_json_file(path: &Path) -> Result<LoadedJson, DeviceError> {
    let src = std::fs::read_to_string(path).map_err(|e| DeviceError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let value: Value = serde_json::from_str(&src).map_err(|e| DeviceError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    if !value.is_object() {
        return Err(DeviceError::InvalidConfig {
            path: path.to_path_buf(),
            msg: "device.json must be a JSON object".into(),
        });
    }
    Ok(LoadedJson { path: path.to_path_buf(), value })
}

/// Rendered option help.
pub fn usage() -> String {
    DeviceArgs::command().render_help().to_string()
}

/// Parse `args` (and the environment). Unparseable arguments are reported and dropped;
/// the environment is still honoured.
pub fn parse_args(args: &[String]) -> (DeviceArgs, Vec<ValidationIssue>) {
    match DeviceArgs::try_parse_from(args) {
        Ok(parsed) => (parsed, Vec::new()),
        Err(e) => {
            let msg = e.to_string();
            let first = msg.lines().next().unwrap_or("invalid arguments").trim_start_matches("error: ");
            let issue = ValidationIssue::error(
                "args",
                first.to_string(),
                Some("arguments ignored; using environment and defaults (pass --help for options)".into()),
            );
            let fallback = DeviceArgs::try_parse_from(std::iter::empty::<String>()).unwrap_or_default();
            (fallback, vec![issue])
        }
    }
}

/// Resolve options from the `open()` argument vector, the environment and the JSON file.
pub fn resolve_options(args: &[String]) -> (DeviceOptions, Vec<ValidationIssue>) {
    let (parsed, mut issues) = parse_args(args);
    let mut opts = DeviceOptions::default();

    if let Some(given) = parsed.config.as_deref() {
        let path = device_config_path(given);
        match load_json_file(&path) {
            Ok(loaded) => {
                issues.extend(validate::validate_device_json(&loaded.value));
                match serde_json::from_value::<DeviceJson>(loaded.value) {
                    Ok(json) => apply_json(&mut opts, &json, &path, &mut issues),
                    Err(e) => issues.push(ValidationIssue::error(
                        path.display().to_string(),
                        format!("ignored: {e}"),
                        None,
                    )),
                }
            }
            Err(DeviceError::Io { path, source }) if source.kind() == std::io::ErrorKind::NotFound => {
                issues.push(ValidationIssue::warn(
                    path.display().to_string(),
                    "device config not found; using defaults",
                    None,
                ));
            }
            Err(e) => issues.push(ValidationIssue::error(path.display().to_string(), e.to_string(), None)),
        }
    }

    apply_args(&mut opts, &parsed, &mut issues);
    (opts, issues)
}

fn apply_json(opts: &mut DeviceOptions, json: &DeviceJson, path: &Path, issues: &mut Vec<ValidationIssue>) {
    let origin = |key: &str| format!("{}:/{key}", path.display());

    if let Some(v) = json.verbose {
        opts.verbose = v;
    }
    if let Some(m) = json.method.as_deref() {
        set_method(opts, m, &origin("method"), issues, false);
    }
    if let Some(n) = json.ring_buffer_size {
        set_ring_size(opts, n, &origin("ring_buffer_size"), issues, false);
    }
    if let Some(v) = json.stereo {
        opts.stereo = v;
    }
    if let Some(c) = json.audio_cadence.as_deref() {
        set_cadence(opts, c, &origin("audio_cadence"), issues, false);
    }
    if let Some(v) = json.vflip {
        opts.vflip = v;
    }
    if let Some(n) = &json.name {
        opts.sender_name = n.clone();
    }
    if let Some(g) = &json.groups {
        opts.groups = Some(g.clone());
    }
    if let Some(v) = json.clock_video {
        opts.clock_video = v;
    }
}

fn apply_args(opts: &mut DeviceOptions, args: &DeviceArgs, issues: &mut Vec<ValidationIssue>) {
    // Flags only ever switch something on; a JSON `true` survives an absent flag.
    opts.help |= args.help;
    opts.verbose |= args.verbose;
    opts.stereo |= args.stereo;
    if args.no_vflip {
        opts.vflip = false;
    }
    if args.no_clock_video {
        opts.clock_video = false;
    }

    if let Some(m) = args.method.as_deref() {
        set_method(opts, m, "--method", issues, true);
    }
    if let Some(s) = args.ring_buffer_size.as_deref() {
        match s.trim().parse::<i64>() {
            Ok(n) => set_ring_size(opts, n, "--ring-buffer-size", issues, true),
            Err(_) => issues.push(ValidationIssue::error(
                "--ring-buffer-size",
                format!("'{s}' is not an integer"),
                Some("ring buffer size must be an integer of at least 1".into()),
            )),
        }
    }
    if let Some(c) = args.audio_cadence.as_deref() {
        set_cadence(opts, c, "--audio-cadence", issues, true);
    }
    if let Some(n) = &args.name {
        opts.sender_name = n.clone();
    }
    if let Some(g) = &args.groups {
        opts.groups = Some(g.clone());
    }
}

// `report` is false for JSON values: validate_device_json already flagged them.
fn set_method(opts: &mut DeviceOptions, s: &str, origin: &str, issues: &mut Vec<ValidationIssue>, report: bool) {
    match TransferMethod::parse(s) {
        Some(m) => opts.method = m,
        None if report => issues.extend(validate::check_method(origin, s)),
        None => {}
    }
}

fn set_ring_size(opts: &mut DeviceOptions, n: i64, origin: &str, issues: &mut Vec<ValidationIssue>, report: bool) {
    match usize::try_from(n) {
        Ok(size) if size >= 1 => opts.ring_buffer_size = size,
        _ if report => issues.extend(validate::check_ring_size(origin, n)),
        _ => {}
    }
}

fn set_cadence(opts: &mut DeviceOptions, s: &str, origin: &str, issues: &mut Vec<ValidationIssue>, report: bool) {
    match <AudioCadence as clap::ValueEnum>::from_str(s, true) {
        Ok(c) => opts.audio_cadence = c,
        Err(_) if report => issues.extend(validate::check_cadence(origin, s)),
        Err(_) => {}
    }
}
