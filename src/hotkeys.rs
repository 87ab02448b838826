use crate::dispatcher::Command;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::io::{self, Write};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// F1 restore last save, F2 previous backup, F3 restart, F4 stop,
/// F5 restore latest and restart, F8 manual save.
pub fn command_for_key(code: KeyCode) -> Option<Command> {
    match code {
        KeyCode::F(1) => Some(Command::RestoreLastSave),
        KeyCode::F(2) => Some(Command::RestorePreviousBackup),
        KeyCode::F(3) => Some(Command::Restart),
        KeyCode::F(4) => Some(Command::Stop),
        KeyCode::F(5) => Some(Command::RestoreLatestAndRestart),
        KeyCode::F(8) => Some(Command::ManualSave),
        _ => None,
    }
}

fn is_quit(key: &KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c')
}

struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Reads function keys from the terminal on a dedicated thread. The channel
/// closes on Ctrl-C, or when the receiver goes away.
pub fn spawn_key_listener(tx: mpsc::Sender<Command>) -> io::Result<std::thread::JoinHandle<()>> {
    let guard = RawModeGuard::enable()?;
    info!("Hotkeys: F1 last save, F2 previous backup, F3 restart, F4 stop, F5 latest + restart, F8 save, Ctrl-C quit");

    Ok(std::thread::spawn(move || {
        let _guard = guard;
        loop {
            match event::poll(Duration::from_millis(250)) {
                Ok(false) => {
                    if tx.is_closed() {
                        break;
                    }
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    warn!("Keyboard error: {}", e);
                    break;
                }
            }

            let key = match event::read() {
                Ok(CEvent::Key(key)) if key.kind == KeyEventKind::Press => key,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Keyboard error: {}", e);
                    break;
                }
            };
            if is_quit(&key) {
                info!("Quit.");
                break;
            }
            if let Some(command) = command_for_key(key.code) {
                debug!("Hotkey {:?}: {}", key.code, command);
                if tx.blocking_send(command).is_err() {
                    break;
                }
            }
        }
    }))
}

/// Reads one command name per line from stdin; the channel closes at end of input.
pub fn spawn_line_reader(tx: mpsc::Sender<Command>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Unable to read stdin: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<Command>() {
                Ok(command) => {
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("{}", e),
            }
        }
    })
}

/// Raw mode turns off output post-processing, so log lines need an explicit
/// carriage return.
pub struct CrlfWriter<W>(pub W);

impl<W: Write> Write for CrlfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for chunk in buf.split_inclusive(|b| *b == b'\n') {
            match chunk.strip_suffix(b"\n") {
                Some(line) => {
                    self.0.write_all(line)?;
                    self.0.write_all(b"\r\n")?;
                }
                None => self.0.write_all(chunk)?,
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
