use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SaveLoopError {
    #[error("File does not exist: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("Error copying file from {} to {}: {source}", .from.display(), .to.display())]
    CopyFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No sequence numbers left in {}", .0.display())]
    SequenceExhausted(PathBuf),

    #[error("No {0} files.")]
    NoEntries(String),

    #[error("Unable to terminate process {process} after {attempts} attempts")]
    TerminationFailed { process: String, attempts: u32 },

    #[error("Save file not found: {}", .0.display())]
    SaveFileMissing(PathBuf),

    #[error("Process query error: {0}")]
    ProcessQuery(String),

    #[error("Unable to start {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SaveLoopError {
    /// Only a missing live save file ends the program.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SaveLoopError::SaveFileMissing(_))
    }
}
