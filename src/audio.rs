use std::io::Write;
use tracing::debug;

/// Symbolic feedback for the operator, who is usually looking at the game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    Save,
    Replace,
    Start,
    Stop,
    Error,
}

/// Plays a cue without blocking the caller. Implementations swallow their own
/// failures.
pub trait AudioCue: Send + Sync {
    fn play(&self, cue: Cue);
}

/// Rings the terminal bell, twice for errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

impl AudioCue for TerminalBell {
    fn play(&self, cue: Cue) {
        let rings = if cue == Cue::Error { "\x07\x07" } else { "\x07" };
        let mut stderr = std::io::stderr();
        if let Err(e) = stderr.write_all(rings.as_bytes()).and_then(|_| stderr.flush()) {
            debug!("Unable to play {:?}: {}", cue, e);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl AudioCue for Silent {
    fn play(&self, cue: Cue) {
        debug!("Cue: {:?}", cue);
    }
}
