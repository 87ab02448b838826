use crate::config::Config;
use crate::stability::StabilityDetector;
use crate::state::SharedState;
use crate::store::BackupEntry;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Watches the live save file's modification time and stores an automatic
/// backup each time the game finishes rewriting it.
pub struct BackupPoller {
    state: SharedState,
    live: PathBuf,
    detector: StabilityDetector,
    interval: Duration,
    last_observed: Option<SystemTime>,
}

impl BackupPoller {
    /// The file's current modification time counts as already seen.
    pub fn new(
        state: SharedState,
        live: impl Into<PathBuf>,
        detector: StabilityDetector,
        interval: Duration,
    ) -> Self {
        let live = live.into();
        let last_observed = modified_time(&live);
        Self {
            state,
            live,
            detector,
            interval,
            last_observed,
        }
    }

    pub fn from_config(state: SharedState, config: &Config) -> Self {
        let timings = &config.timings;
        Self::new(
            state,
            &config.save_file,
            StabilityDetector::new(timings.stability_interval(), timings.stability_threshold),
            timings.poll_interval(),
        )
    }

    pub async fn run(mut self) {
        info!(
            "Watching {} every {:?}",
            self.live.display(),
            self.interval
        );
        loop {
            sleep(self.interval).await;
            self.poll_once().await;
        }
    }

    /// One pass of the loop without the idle sleep.
    pub async fn poll_once(&mut self) -> Option<BackupEntry> {
        let modified = match fs::metadata(&self.live).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!("Unable to read {}: {}", self.live.display(), e);
                return None;
            }
        };
        if self.last_observed == Some(modified) {
            return None;
        }
        self.last_observed = Some(modified);

        if self.state.lock().await.skip.is_active() {
            debug!("Change to {} ignored during skip window", self.live.display());
            return None;
        }

        self.detector.wait_until_stable(&self.live).await;

        let mut state = self.state.lock().await;
        // A command may have replaced the file while it was settling.
        if state.skip.is_active() {
            debug!("Backup abandoned, a command touched {}", self.live.display());
            self.last_observed = modified_time(&self.live);
            return None;
        }
        // Later write passes are part of this same save.
        self.last_observed = modified_time(&self.live);

        match state.backups.commit(&self.live) {
            Ok(entry) => {
                info!("Backup: {}", entry.file_name());
                Some(entry)
            }
            Err(e) => {
                warn!("Unable to back up: {}", e);
                None
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
