//! Per-channel log files on top of the `log` facade.
//!
//! Each channel is a log target with its own size-rotated file. Every record
//! is also passed to an `env_logger` console logger, so `RUST_LOG` still
//! controls what shows up on the terminal.

use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub mod channels {
    pub const APPLICATION: &str = "application";
    pub const TELEMETRY: &str = "telemetry";
    pub const ALERTS: &str = "alerts";
    pub const ERRORS: &str = "errors";
}

const MAX_FILE_BYTES: u64 = 1024 * 1024;
const FILE_LEVEL: LevelFilter = LevelFilter::Info;

fn file_name_for(channel: &str) -> &'static str {
    match channel {
        channels::TELEMETRY => "telemetry.log",
        channels::ALERTS => "alert.log",
        channels::ERRORS => "error.log",
        _ => "application.log",
    }
}

/// Route a record target to its channel. Anything that is not one of the
/// named channels belongs to the application log.
fn channel_for(target: &str) -> &'static str {
    match target {
        channels::TELEMETRY => channels::TELEMETRY,
        channels::ALERTS => channels::ALERTS,
        channels::ERRORS => channels::ERRORS,
        _ => channels::APPLICATION,
    }
}

/// Append-only file that rolls over to `<name>.1` once it reaches `max_bytes`.
struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    file: File,
    written: u64,
}

impl RotatingFile {
    fn open(path: PathBuf, max_bytes: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            file,
            written,
        })
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".1");
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let backup = self.backup_path();
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        fs::rename(&self.path, &backup)?;
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.written > 0 && self.written + len > self.max_bytes {
            self.rotate()?;
        }
        writeln!(self.file, "{}", line)?;
        self.written += len;
        Ok(())
    }
}

pub struct ChannelLogger {
    console: env_logger::Logger,
    files: HashMap<&'static str, Mutex<RotatingFile>>,
}

impl ChannelLogger {
    pub fn new(log_dir: &Path, console: env_logger::Logger) -> io::Result<Self> {
        Self::with_max_bytes(log_dir, console, MAX_FILE_BYTES)
    }

    fn with_max_bytes(log_dir: &Path, console: env_logger::Logger, max_bytes: u64) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let mut files = HashMap::new();
        for channel in [
            channels::APPLICATION,
            channels::TELEMETRY,
            channels::ALERTS,
            channels::ERRORS,
        ] {
            let file = RotatingFile::open(log_dir.join(file_name_for(channel)), max_bytes)?;
            files.insert(channel, Mutex::new(file));
        }
        Ok(Self { console, files })
    }

    fn max_level(&self) -> LevelFilter {
        self.console.filter().max(FILE_LEVEL)
    }
}

impl Log for ChannelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= FILE_LEVEL || self.console.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if record.level() <= FILE_LEVEL {
            let channel = channel_for(record.target());
            if let Some(file) = self.files.get(channel) {
                let line = format!(
                    "{} - {} - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
                    record.level(),
                    record.args()
                );
                if let Err(e) = file.lock().write_line(&line) {
                    eprintln!("failed to write {} log: {}", channel, e);
                }
            }
        }

        if self.console.matches(record) {
            self.console.log(record);
        }
    }

    fn flush(&self) {
        for file in self.files.values() {
            let _ = file.lock().file.flush();
        }
        self.console.flush();
    }
}

/// Install the channel logger as the global `log` backend.
pub fn init(log_dir: &Path) -> Result<(), String> {
    let console = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .build();
    let logger = ChannelLogger::new(log_dir, console)
        .map_err(|e| format!("Failed to open log files in {}: {}", log_dir.display(), e))?;

    log::set_max_level(logger.max_level());
    log::set_boxed_logger(Box::new(logger)).map_err(|e| format!("Logger already set: {}", e))
}
