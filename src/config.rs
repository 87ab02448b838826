use crate::error::SaveLoopError;
use crate::store::DEFAULT_RETENTION;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_RUN_COMMAND: &str = r"C:\Program Files\Steam\steam.exe -applaunch 570940";
pub const DEFAULT_PROCESS_NAME: &str = "DarkSoulsRemastered.exe";
pub const DEFAULT_BACKUP_DELAY_SECS: u64 = 10;

fn default_run_command() -> String {
    DEFAULT_RUN_COMMAND.to_string()
}

fn default_process_name() -> String {
    DEFAULT_PROCESS_NAME.to_string()
}

fn default_backup_delay() -> u64 {
    DEFAULT_BACKUP_DELAY_SECS
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("save")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backup")
}

fn default_retention() -> usize {
    DEFAULT_RETENTION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// The game's live save file.
    pub save_file: PathBuf,
    #[serde(default = "default_run_command")]
    pub run_command: String,
    /// Executable name used to find and terminate the game.
    #[serde(default = "default_process_name")]
    pub process_name: String,
    /// Automatic backups younger than this are ignored by
    /// restore-latest-and-restart, since they may already show the death.
    #[serde(default = "default_backup_delay")]
    pub backup_delay_secs: u64,
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default = "default_retention")]
    pub retention: usize,
    #[serde(default)]
    pub timings: Timings,
}

/// Poll, stabilization and kill-retry timings, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub poll_interval_ms: u64,
    pub stability_interval_ms: u64,
    pub stability_threshold: u32,
    pub kill_initial_delay_ms: u64,
    pub kill_retry_delay_ms: u64,
    pub kill_max_attempts: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
            stability_interval_ms: 100,
            stability_threshold: 10,
            kill_initial_delay_ms: 500,
            kill_retry_delay_ms: 250,
            kill_max_attempts: 18,
        }
    }
}

impl Timings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stability_interval(&self) -> Duration {
        Duration::from_millis(self.stability_interval_ms)
    }

    pub fn kill_initial_delay(&self) -> Duration {
        Duration::from_millis(self.kill_initial_delay_ms)
    }

    pub fn kill_retry_delay(&self) -> Duration {
        Duration::from_millis(self.kill_retry_delay_ms)
    }
}

impl Config {
    pub fn with_save_file(save_file: impl Into<PathBuf>) -> Self {
        Self {
            save_file: save_file.into(),
            run_command: default_run_command(),
            process_name: default_process_name(),
            backup_delay_secs: default_backup_delay(),
            save_dir: default_save_dir(),
            backup_dir: default_backup_dir(),
            retention: default_retention(),
            timings: Timings::default(),
        }
    }

    /// Reads a `.json` config, or the line format used by older setups:
    ///
    /// ```text
    /// save-file
    /// run-command
    /// exe-name
    /// [backup-delay]
    /// ```
    pub fn load(path: &Path) -> crate::Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            SaveLoopError::Configuration(format!("Unable to read {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&text)?)
        } else {
            Self::parse_lines(&text)
        }
    }

    pub fn parse_lines(text: &str) -> crate::Result<Self> {
        let mut lines = text.lines().map(str::trim);

        let save_file = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| SaveLoopError::Configuration("Save file path missing".to_string()))?;
        let mut config = Self::with_save_file(save_file);

        if let Some(line) = lines.next().filter(|l| !l.is_empty()) {
            config.run_command = line.to_string();
        }
        if let Some(line) = lines.next().filter(|l| !l.is_empty()) {
            config.process_name = line.to_string();
        }
        if let Some(line) = lines.next().filter(|l| !l.is_empty()) {
            config.backup_delay_secs = line.parse().map_err(|_| {
                SaveLoopError::Configuration(format!("Invalid backup delay: {}", line))
            })?;
        }
        Ok(config)
    }

    /// Fails with [`SaveLoopError::SaveFileMissing`] when there is nothing to protect.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.save_file.is_file() {
            return Err(SaveLoopError::SaveFileMissing(self.save_file.clone()));
        }
        if self.process_name.trim().is_empty() {
            return Err(SaveLoopError::Configuration("Executable name is empty".to_string()));
        }
        Ok(())
    }

    /// Entries carry the live file's extension, e.g. `backup12.sl2`.
    pub fn entry_extension(&self) -> Option<String> {
        self.save_file
            .extension()
            .map(|ext| ext.to_string_lossy().to_string())
    }

    pub fn backup_delay(&self) -> Duration {
        Duration::from_secs(self.backup_delay_secs)
    }

    pub fn log_summary(&self) {
        info!("Save file: {}", self.save_file.display());
        info!("Run command: {}", self.run_command);
        info!("Executable: {}", self.process_name);
        info!("Backup delay: {} s", self.backup_delay_secs);
        info!(
            "Save dir: {}, backup dir: {}, keeping {} of each",
            self.save_dir.display(),
            self.backup_dir.display(),
            self.retention
        );
    }

    pub fn example() -> Self {
        Self::with_save_file(
            r"C:\Users\USERNAME\Documents\NBGI\DARK SOULS REMASTERED\NUMBER\DRAKS0005.sl2",
        )
    }
}
