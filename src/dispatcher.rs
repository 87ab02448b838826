use crate::audio::{AudioCue, Cue};
use crate::config::Config;
use crate::error::SaveLoopError;
use crate::process::{ProcessController, ProcessHost, StopOutcome};
use crate::state::{SaverState, SharedState};
use crate::store::{restore_file, select_older_than, BackupEntry};
use chrono::Utc;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    ManualSave,
    RestoreLastSave,
    RestorePreviousBackup,
    Restart,
    Stop,
    RestoreLatestAndRestart,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::ManualSave,
        Command::RestoreLastSave,
        Command::RestorePreviousBackup,
        Command::Restart,
        Command::Stop,
        Command::RestoreLatestAndRestart,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::ManualSave => "manual-save",
            Command::RestoreLastSave => "restore-last-save",
            Command::RestorePreviousBackup => "restore-previous-backup",
            Command::Restart => "restart",
            Command::Stop => "stop",
            Command::RestoreLatestAndRestart => "restore-latest-and-restart",
        }
    }

    /// How long automatic backups stay suppressed after the command ran.
    pub fn skip_duration(self) -> Duration {
        let secs = match self {
            Command::ManualSave => 10,
            Command::Restart | Command::Stop => 15,
            Command::RestoreLastSave
            | Command::RestorePreviousBackup
            | Command::RestoreLatestAndRestart => 20,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Command {
    type Err = SaveLoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(command) = Command::ALL.into_iter().find(|c| c.name() == s) {
            return Ok(command);
        }
        // Hotkey names used by older configurations.
        match s {
            "save" => Ok(Command::ManualSave),
            "replaceWithLastSave" => Ok(Command::RestoreLastSave),
            "replaceWithPreviousBackup" => Ok(Command::RestorePreviousBackup),
            "replaceWithLatestAndRestart" => Ok(Command::RestoreLatestAndRestart),
            _ => Err(SaveLoopError::UnknownCommand(s.to_string())),
        }
    }
}

/// What a command did. Failures other than a missing save file end up here too,
/// since they never stop the program.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Saved(BackupEntry),
    Restored(BackupEntry),
    RestoredAndRestarted(BackupEntry),
    Restarted,
    Stopped,
    NoEntries,
    Failed(String),
}

/// Runs operator commands one at a time under the shared state lock, which also
/// keeps the poller from committing while the live file is being replaced.
pub struct CommandDispatcher<P, A> {
    state: SharedState,
    live: PathBuf,
    process_name: String,
    run_command: String,
    backup_delay: Duration,
    process: ProcessController<P>,
    audio: A,
}

impl<P: ProcessHost, A: AudioCue> CommandDispatcher<P, A> {
    pub fn new(state: SharedState, config: &Config, host: P, audio: A) -> Self {
        Self {
            state,
            live: config.save_file.clone(),
            process_name: config.process_name.clone(),
            run_command: config.run_command.clone(),
            backup_delay: config.backup_delay(),
            process: ProcessController::new(host, &config.timings),
            audio,
        }
    }

    /// Only [`SaveLoopError::SaveFileMissing`] is returned as an error; the caller
    /// is expected to shut down on it.
    pub async fn handle(&self, command: Command) -> crate::Result<Outcome> {
        let mut state = self.state.lock().await;

        if !self.live.exists() {
            error!("Save file not found: {}", self.live.display());
            self.audio.play(Cue::Error);
            return Err(SaveLoopError::SaveFileMissing(self.live.clone()));
        }

        let outcome = match command {
            Command::ManualSave => self.manual_save(&mut state),
            Command::RestoreLastSave => self.restore_last_save(&mut state),
            Command::RestorePreviousBackup => self.restore_previous_backup(&mut state),
            Command::Restart => {
                info!("Restart game.");
                self.stop_game().await;
                self.start_game();
                Outcome::Restarted
            }
            Command::Stop => {
                info!("Stop game.");
                self.stop_game().await;
                Outcome::Stopped
            }
            Command::RestoreLatestAndRestart => self.restore_latest_and_restart(&mut state).await,
        };

        let suppress = match &outcome {
            Outcome::NoEntries => false,
            // A failed restore may still have touched the live file or the game.
            Outcome::Failed(_) => command != Command::ManualSave,
            _ => true,
        };
        if suppress {
            state.skip.suppress_for(command.skip_duration());
        }
        Ok(outcome)
    }

    /// Handles commands as they arrive until `shutdown` completes. Running out of
    /// commands does not end the loop, since the poller keeps working without them.
    pub async fn serve<F: Future>(
        &self,
        mut commands: mpsc::Receiver<Command>,
        shutdown: F,
    ) -> crate::Result<()> {
        tokio::pin!(shutdown);
        let mut open = true;
        loop {
            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                command = commands.recv(), if open => match command {
                    Some(command) => {
                        debug!("Command: {}", command);
                        self.handle(command).await?;
                    }
                    None => {
                        open = false;
                        info!("Command input closed, automatic backups continue until shutdown");
                    }
                },
            }
        }
    }

    fn manual_save(&self, state: &mut SaverState) -> Outcome {
        match state.saves.commit(&self.live) {
            Ok(entry) => {
                info!("Save: {}", entry.file_name());
                self.audio.play(Cue::Save);
                Outcome::Saved(entry)
            }
            Err(e) => {
                warn!("Unable to save: {}", e);
                self.audio.play(Cue::Error);
                Outcome::Failed(e.to_string())
            }
        }
    }

    fn restore_last_save(&self, state: &mut SaverState) -> Outcome {
        let Some(entry) = state.saves.latest().cloned() else {
            return self.no_entries("save");
        };
        info!("Replace with last save: {}", entry.describe());
        self.audio.play(Cue::Replace);
        self.replace_live(entry, Outcome::Restored)
    }

    fn restore_previous_backup(&self, state: &mut SaverState) -> Outcome {
        let backups = state.backups.entries();
        let entry = match state.restore_point {
            Some(point) => select_older_than(backups, point),
            // Nothing restored yet: the newest backup is likely the unwanted state.
            None => backups.get(backups.len().saturating_sub(2)),
        };
        let Some(entry) = entry.cloned() else {
            return self.no_entries("backup");
        };

        info!("Replace with previous backup: {}", entry.describe());
        self.audio.play(Cue::Replace);
        state.restore_point = Some(entry.modified);
        self.replace_live(entry, Outcome::Restored)
    }

    async fn restore_latest_and_restart(&self, state: &mut SaverState) -> Outcome {
        let delay = chrono::Duration::from_std(self.backup_delay)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - delay;

        let mut chosen = state.backups.newest_older_than(cutoff).cloned();
        if let Some(save) = state.saves.latest() {
            if chosen.as_ref().map_or(true, |backup| backup.modified < save.modified) {
                chosen = Some(save.clone());
            }
        }
        let Some(entry) = chosen else {
            return self.no_entries("backup or save");
        };

        info!(
            "Replace with last {} and restart: {}",
            entry.category,
            entry.describe()
        );
        state.restore_point = Some(entry.modified);
        self.stop_game().await;
        self.audio.play(Cue::Replace);
        let outcome = self.replace_live(entry, Outcome::RestoredAndRestarted);
        self.start_game();
        outcome
    }

    fn replace_live(&self, entry: BackupEntry, done: fn(BackupEntry) -> Outcome) -> Outcome {
        match restore_file(&entry.path, &self.live) {
            Ok(()) => done(entry),
            Err(e) => {
                warn!("Unable to replace save file: {}", e);
                self.audio.play(Cue::Error);
                Outcome::Failed(e.to_string())
            }
        }
    }

    fn no_entries(&self, what: &str) -> Outcome {
        warn!("{}", SaveLoopError::NoEntries(what.to_string()));
        self.audio.play(Cue::Error);
        Outcome::NoEntries
    }

    async fn stop_game(&self) {
        match self.process.stop(&self.process_name).await {
            Ok(StopOutcome::Stopped { .. }) => self.audio.play(Cue::Stop),
            Ok(StopOutcome::NotRunning) => {}
            Err(e) => warn!("Unable to stop: {}", e),
        }
    }

    fn start_game(&self) {
        self.audio.play(Cue::Start);
        if let Err(e) = self.process.start(&self.run_command) {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::poller::BackupPoller;
    use crate::process::tests::{fast_timings, FakeHost};
    use crate::stability::StabilityDetector;
    use crate::store::Category;
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::SystemTime;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    pub(crate) struct RecordingAudio(Arc<Mutex<Vec<Cue>>>);

    impl RecordingAudio {
        pub fn cues(&self) -> Vec<Cue> {
            self.0.lock().unwrap().clone()
        }
    }

    impl AudioCue for RecordingAudio {
        fn play(&self, cue: Cue) {
            self.0.lock().unwrap().push(cue);
        }
    }

    pub(crate) struct Fixture {
        pub tmp_dir: TempDir,
        pub config: Config,
        pub state: SharedState,
        pub host: FakeHost,
        pub audio: RecordingAudio,
        pub dispatcher: CommandDispatcher<FakeHost, RecordingAudio>,
    }

    pub(crate) fn fixture_with(host: FakeHost) -> Fixture {
        let tmp_dir = TempDir::new().unwrap();
        let live = tmp_dir.path().join("DRAKS0005.sl2");
        fs::write(&live, b"current").unwrap();

        let mut config = Config::with_save_file(&live);
        config.save_dir = tmp_dir.path().join("save");
        config.backup_dir = tmp_dir.path().join("backup");
        config.run_command = "game --windowed".to_string();
        config.process_name = "game.exe".to_string();
        config.backup_delay_secs = 10;
        config.timings = fast_timings(3);

        let state = SaverState::open(&config).unwrap().into_shared();
        let audio = RecordingAudio::default();
        let dispatcher = CommandDispatcher::new(state.clone(), &config, host.clone(), audio.clone());
        Fixture {
            tmp_dir,
            config,
            state,
            host,
            audio,
            dispatcher,
        }
    }

    pub(crate) fn fixture() -> Fixture {
        fixture_with(FakeHost::default())
    }

    /// Writes the live file as the game would, with a modification time
    /// `secs_ago` seconds in the past.
    pub(crate) fn game_writes(path: &Path, content: &[u8], secs_ago: u64) {
        fs::write(path, content).unwrap();
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .unwrap();
    }

    async fn commit_as(fixture: &Fixture, category: Category, content: &[u8], secs_ago: u64) -> BackupEntry {
        game_writes(&fixture.config.save_file, content, secs_ago);
        let mut state = fixture.state.lock().await;
        state.store_mut(category).commit(&fixture.config.save_file).unwrap()
    }

    fn live_content(fixture: &Fixture) -> Vec<u8> {
        fs::read(&fixture.config.save_file).unwrap()
    }

    #[test]
    fn test_command_names_round_trip() {
        for command in Command::ALL {
            assert_eq!(command.name().parse::<Command>().unwrap(), command);
        }
        assert_eq!("save".parse::<Command>().unwrap(), Command::ManualSave);
        assert_eq!(
            " replaceWithLatestAndRestart\n".parse::<Command>().unwrap(),
            Command::RestoreLatestAndRestart
        );
        assert!(matches!(
            "quicksave".parse::<Command>(),
            Err(SaveLoopError::UnknownCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_last_save_scenario() {
        let fixture = fixture();
        commit_as(&fixture, Category::Automatic, b"auto", 30).await;
        game_writes(&fixture.config.save_file, b"current", 5);

        let outcome = fixture.dispatcher.handle(Command::RestoreLastSave).await.unwrap();
        assert_eq!(outcome, Outcome::NoEntries);
        assert_eq!(live_content(&fixture), b"current");
        assert!(!fixture.state.lock().await.skip.is_active());

        let Outcome::Saved(entry) = fixture.dispatcher.handle(Command::ManualSave).await.unwrap() else {
            panic!("expected a manual save");
        };
        assert_eq!(entry.sequence, 1);
        assert_eq!(entry.category, Category::Manual);

        game_writes(&fixture.config.save_file, b"died to a boss", 0);
        let outcome = fixture.dispatcher.handle(Command::RestoreLastSave).await.unwrap();
        assert_eq!(outcome, Outcome::Restored(entry));
        assert_eq!(live_content(&fixture), b"current");
        assert!(fixture.state.lock().await.skip.is_active());
        assert_eq!(fixture.audio.cues(), vec![Cue::Error, Cue::Save, Cue::Replace]);
    }

    #[tokio::test]
    async fn test_restore_previous_backup_walks_backwards() {
        let fixture = fixture();
        let t1 = commit_as(&fixture, Category::Automatic, b"t1", 300).await;
        let t2 = commit_as(&fixture, Category::Automatic, b"t2", 200).await;
        commit_as(&fixture, Category::Automatic, b"t3", 100).await;

        let first = fixture.dispatcher.handle(Command::RestorePreviousBackup).await.unwrap();
        assert_eq!(first, Outcome::Restored(t2.clone()));
        assert_eq!(live_content(&fixture), b"t2");

        let second = fixture.dispatcher.handle(Command::RestorePreviousBackup).await.unwrap();
        assert_eq!(second, Outcome::Restored(t1.clone()));
        assert_ne!(first, second);
        assert_eq!(live_content(&fixture), b"t1");
        assert_eq!(fixture.state.lock().await.restore_point, Some(t1.modified));
    }

    #[tokio::test]
    async fn test_restore_previous_backup_with_single_entry() {
        let fixture = fixture();
        let only = commit_as(&fixture, Category::Automatic, b"only", 60).await;
        let outcome = fixture.dispatcher.handle(Command::RestorePreviousBackup).await.unwrap();
        assert_eq!(outcome, Outcome::Restored(only));
    }

    #[tokio::test]
    async fn test_restore_previous_backup_without_entries() {
        let fixture = fixture();
        let outcome = fixture.dispatcher.handle(Command::RestorePreviousBackup).await.unwrap();
        assert_eq!(outcome, Outcome::NoEntries);
        assert_eq!(live_content(&fixture), b"current");
        assert_eq!(fixture.audio.cues(), vec![Cue::Error]);
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let fixture = fixture();
        let outcome = fixture.dispatcher.handle(Command::Stop).await.unwrap();
        assert_eq!(outcome, Outcome::Stopped);
        assert_eq!(fixture.host.kill_count(), 0);
        assert!(fixture.state.lock().await.skip.is_active());
    }

    #[tokio::test]
    async fn test_restart_stops_then_starts() {
        let fixture = fixture_with(FakeHost::running(2));
        let outcome = fixture.dispatcher.handle(Command::Restart).await.unwrap();
        assert_eq!(outcome, Outcome::Restarted);
        assert_eq!(fixture.host.kill_count(), 2);
        assert_eq!(fixture.host.spawned(), vec!["game --windowed".to_string()]);
        assert_eq!(fixture.audio.cues(), vec![Cue::Stop, Cue::Start]);
    }

    #[tokio::test]
    async fn test_restart_continues_when_stop_fails() {
        let fixture = fixture_with(FakeHost::running(u32::MAX));
        let outcome = fixture.dispatcher.handle(Command::Restart).await.unwrap();
        assert_eq!(outcome, Outcome::Restarted);
        assert_eq!(fixture.host.kill_count(), 3);
        assert_eq!(fixture.host.spawned().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_latest_skips_fresh_backups() {
        let fixture = fixture_with(FakeHost::running(1));
        let old = commit_as(&fixture, Category::Automatic, b"alive", 100).await;
        commit_as(&fixture, Category::Automatic, b"dying", 2).await;

        let outcome = fixture
            .dispatcher
            .handle(Command::RestoreLatestAndRestart)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::RestoredAndRestarted(old.clone()));
        assert_eq!(live_content(&fixture), b"alive");
        assert_eq!(fixture.host.kill_count(), 1);
        assert_eq!(fixture.host.spawned().len(), 1);
        assert_eq!(fixture.state.lock().await.restore_point, Some(old.modified));
    }

    #[tokio::test]
    async fn test_restore_latest_prefers_newer_manual_save() {
        let fixture = fixture();
        commit_as(&fixture, Category::Automatic, b"auto", 100).await;
        let save = commit_as(&fixture, Category::Manual, b"fog wall", 50).await;
        commit_as(&fixture, Category::Automatic, b"dying", 1).await;

        let outcome = fixture
            .dispatcher
            .handle(Command::RestoreLatestAndRestart)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::RestoredAndRestarted(save));
        assert_eq!(live_content(&fixture), b"fog wall");
    }

    #[tokio::test]
    async fn test_restore_latest_without_entries_does_nothing() {
        let fixture = fixture_with(FakeHost::running(1));
        let outcome = fixture
            .dispatcher
            .handle(Command::RestoreLatestAndRestart)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NoEntries);
        assert_eq!(fixture.host.kill_count(), 0);
        assert!(fixture.host.spawned().is_empty());
    }

    #[tokio::test]
    async fn test_failed_manual_save_sets_no_skip_window() {
        let fixture = fixture();
        fs::remove_dir_all(&fixture.config.save_dir).unwrap();
        fs::write(&fixture.config.save_dir, b"not a directory").unwrap();

        let outcome = fixture.dispatcher.handle(Command::ManualSave).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(_)));
        let state = fixture.state.lock().await;
        assert!(state.saves.is_empty());
        assert!(!state.skip.is_active());
        assert_eq!(fixture.audio.cues(), vec![Cue::Error]);
    }

    #[tokio::test]
    async fn test_failed_restore_still_sets_skip_window() {
        let fixture = fixture();
        let saved = commit_as(&fixture, Category::Manual, b"saved state", 60).await;
        game_writes(&fixture.config.save_file, b"current", 0);
        fs::remove_file(&saved.path).unwrap();

        let outcome = fixture.dispatcher.handle(Command::RestoreLastSave).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert_eq!(live_content(&fixture), b"current");
        assert!(fixture.state.lock().await.skip.is_active());
        assert_eq!(fixture.audio.cues(), vec![Cue::Replace, Cue::Error]);
    }

    #[tokio::test]
    async fn test_closed_command_input_keeps_backups_running() {
        let fixture = fixture();
        let live = fixture.config.save_file.clone();
        let poller = tokio::spawn(
            BackupPoller::new(
                fixture.state.clone(),
                &live,
                StabilityDetector::new(Duration::from_millis(1), 2),
                Duration::from_millis(5),
            )
            .run(),
        );

        let (tx, rx) = mpsc::channel::<Command>(1);
        drop(tx);
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let watch = async {
            // Give the loop time to see the closed input first.
            tokio::time::sleep(Duration::from_millis(20)).await;
            game_writes(&live, b"lit a bonfire", 30);
            let mut backed_up = false;
            for _ in 0..200 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if !fixture.state.lock().await.backups.is_empty() {
                    backed_up = true;
                    break;
                }
            }
            let _ = stop.send(());
            backed_up
        };

        let (served, backed_up) = tokio::join!(
            fixture.dispatcher.serve(rx, async {
                let _ = stopped.await;
            }),
            watch
        );
        poller.abort();
        assert!(served.is_ok());
        assert!(backed_up);
    }

    #[tokio::test]
    async fn test_serve_stops_on_missing_save_file() {
        let fixture = fixture();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Command::ManualSave).await.unwrap();
        tx.send(Command::ManualSave).await.unwrap();
        drop(tx);

        fixture
            .dispatcher
            .serve(rx, tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(fixture.state.lock().await.saves.len(), 2);

        fs::remove_file(&fixture.config.save_file).unwrap();
        let (tx, rx) = mpsc::channel(1);
        tx.send(Command::RestoreLastSave).await.unwrap();
        let err = fixture
            .dispatcher
            .serve(rx, std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_missing_save_file_is_fatal() {
        let fixture = fixture();
        fs::remove_file(&fixture.config.save_file).unwrap();
        let err = fixture.dispatcher.handle(Command::ManualSave).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(fixture.state.lock().await.saves.is_empty());
        assert_eq!(fixture.audio.cues(), vec![Cue::Error]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_poller_commit_and_restore_do_not_interleave() {
        let fixture = fixture();
        let saved = commit_as(&fixture, Category::Manual, b"saved state", 60).await;
        let live = fixture.config.save_file.clone();

        let mut poller = BackupPoller::new(
            fixture.state.clone(),
            &live,
            StabilityDetector::new(Duration::from_millis(1), 3),
            Duration::from_millis(5),
        );
        game_writes(&live, b"fresh progress", 0);

        let Fixture {
            tmp_dir: _tmp_dir,
            state,
            dispatcher,
            ..
        } = fixture;
        let dispatcher = Arc::new(dispatcher);
        let restore = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.handle(Command::RestoreLastSave).await }
        });
        let backup = tokio::spawn(async move { poller.poll_once().await });

        let outcome = restore.await.unwrap().unwrap();
        let backup = backup.await.unwrap();
        assert_eq!(outcome, Outcome::Restored(saved));
        assert_eq!(fs::read(&live).unwrap(), b"saved state");

        let state = state.lock().await;
        assert!(state.backups.len() <= 1);
        assert_eq!(state.backups.len(), usize::from(backup.is_some()));
        for entry in state.backups.entries() {
            let content = fs::read(&entry.path).unwrap();
            assert!(content == b"fresh progress" || content == b"saved state");
        }
    }
}
