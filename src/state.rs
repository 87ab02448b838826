use crate::config::Config;
use crate::store::{Category, VersionStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Suppresses automatic backups until a deadline, so writes made by a command are
/// not mistaken for progress in the game.
#[derive(Debug, Clone, Default)]
pub struct SkipWindow {
    until: Option<Instant>,
}

impl SkipWindow {
    /// Replaces the current deadline with `now + duration`.
    pub fn suppress_for(&mut self, duration: Duration) {
        self.until = Some(Instant::now() + duration);
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Instant::now())
    }

    pub fn is_active_at(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| now < until)
    }

    pub fn until(&self) -> Option<Instant> {
        self.until
    }
}

/// Everything the poller and the dispatcher share. Always accessed through
/// [`SharedState`], whose lock is the single critical section for store reads,
/// commits, live-file copies and the skip window.
pub struct SaverState {
    pub saves: VersionStore,
    pub backups: VersionStore,
    pub skip: SkipWindow,
    /// Time of the entry last restored from history.
    pub restore_point: Option<DateTime<Utc>>,
}

pub type SharedState = Arc<Mutex<SaverState>>;

impl SaverState {
    pub fn new(saves: VersionStore, backups: VersionStore) -> Self {
        Self {
            saves,
            backups,
            skip: SkipWindow::default(),
            restore_point: None,
        }
    }

    /// Opens both stores next to each other as described by `config`.
    pub fn open(config: &Config) -> crate::Result<Self> {
        let extension = config.entry_extension();
        let saves = VersionStore::open(
            &config.save_dir,
            Category::Manual,
            extension.as_deref(),
            config.retention,
        )?;
        let backups = VersionStore::open(
            &config.backup_dir,
            Category::Automatic,
            extension.as_deref(),
            config.retention,
        )?;
        Ok(Self::new(saves, backups))
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    pub fn store(&self, category: Category) -> &VersionStore {
        match category {
            Category::Manual => &self.saves,
            Category::Automatic => &self.backups,
        }
    }

    pub fn store_mut(&mut self, category: Category) -> &mut VersionStore {
        match category {
            Category::Manual => &mut self.saves,
            Category::Automatic => &mut self.backups,
        }
    }
}
