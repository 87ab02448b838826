pub mod audio;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hotkeys;
pub mod poller;
pub mod process;
pub mod stability;
pub mod state;
pub mod store;

pub use audio::{AudioCue, Cue};
pub use config::{Config, Timings};
pub use dispatcher::{Command, CommandDispatcher, Outcome};
pub use error::SaveLoopError;
pub use poller::BackupPoller;
pub use process::{ProcessController, ProcessHost, StopOutcome, SystemProcessHost};
pub use stability::StabilityDetector;
pub use state::{SaverState, SharedState, SkipWindow};
pub use store::{BackupEntry, Category, VersionStore};

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, SaveLoopError>;
