use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use saveloop::{
    audio::{Silent, TerminalBell},
    hotkeys::{spawn_key_listener, spawn_line_reader, CrlfWriter},
    AudioCue, BackupPoller, Command, CommandDispatcher, Config, Cue, SaverState, SystemProcessHost,
};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "saveloop")]
#[command(about = "Keeps a history of your game's save file and rewinds it on a hotkey.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StoreArgs {
    /// Config file: JSON, or lines of save-file, run-command, exe-name, [backup-delay]
    config: PathBuf,

    /// Directory for manual saves
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Directory for automatic backups
    #[arg(long)]
    backup_dir: Option<PathBuf>,
}

impl StoreArgs {
    fn load(&self) -> anyhow::Result<Config> {
        let mut config = Config::load(&self.config)
            .with_context(|| format!("Unable to load config {}", self.config.display()))?;
        if let Some(dir) = &self.save_dir {
            config.save_dir = dir.clone();
        }
        if let Some(dir) = &self.backup_dir {
            config.backup_dir = dir.clone();
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the save file and act on commands
    Run {
        #[command(flatten)]
        store: StoreArgs,

        /// Read function keys from the terminal instead of command names from stdin
        #[arg(long)]
        hotkeys: bool,

        /// Do not ring the terminal bell
        #[arg(short, long)]
        quiet: bool,
    },
    /// List stored saves and backups
    List {
        #[command(flatten)]
        store: StoreArgs,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print an example JSON config
    ExampleConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(matches!(cli.command, Commands::Run { hotkeys: true, .. }));

    match cli.command {
        Commands::Run {
            store,
            hotkeys,
            quiet,
        } => {
            let result = if quiet {
                run(&store, hotkeys, Silent).await
            } else {
                run(&store, hotkeys, TerminalBell).await
            };
            let code = match result {
                Ok(()) => 0,
                Err(e) => {
                    error!("{:#}", e);
                    1
                }
            };
            // A pending stdin read would otherwise keep the runtime from shutting down.
            std::process::exit(code);
        }
        Commands::List { store, json } => list(&store, json)?,
        Commands::ExampleConfig => {
            println!("{}", serde_json::to_string_pretty(&Config::example())?);
        }
    }

    Ok(())
}

fn init_logging(raw_terminal: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if raw_terminal {
        builder
            .with_writer(|| CrlfWriter(std::io::stderr()))
            .init();
    } else {
        builder.with_writer(std::io::stderr).init();
    }
}

async fn run<A: AudioCue>(store: &StoreArgs, hotkeys: bool, audio: A) -> anyhow::Result<()> {
    info!("Config: {}", store.config.display());
    let config = store.load()?;
    config.log_summary();
    if let Err(e) = config.validate() {
        audio.play(Cue::Error);
        return Err(e.into());
    }

    let state = SaverState::open(&config).context("Unable to open save directories")?;
    info!(
        "{} saves, {} backups on record",
        state.saves.len(),
        state.backups.len()
    );
    let state = state.into_shared();

    let poller = tokio::spawn(BackupPoller::from_config(state.clone(), &config).run());

    let (tx, rx) = mpsc::channel::<Command>(16);
    let dispatcher = CommandDispatcher::new(state, &config, SystemProcessHost, audio);

    let result = if hotkeys {
        let thread = spawn_key_listener(tx).context("Unable to capture the keyboard")?;
        // Ctrl-C arrives as a key in raw mode and ends the listener thread.
        let mut listener = tokio::task::spawn_blocking(move || thread.join());
        let result = dispatcher.serve(rx, &mut listener).await;
        // The listener notices the closed channel and restores the terminal.
        if !listener.is_finished() {
            let _ = listener.await;
        }
        result
    } else {
        info!(
            "Reading commands from stdin: {}",
            Command::ALL.map(Command::name).join(", ")
        );
        spawn_line_reader(tx);
        dispatcher
            .serve(rx, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Unable to listen for Ctrl-C: {}", e);
                }
            })
            .await
    };

    poller.abort();
    info!("Shutting down.");
    result.map_err(Into::into)
}

fn list(store: &StoreArgs, json: bool) -> anyhow::Result<()> {
    let config = store.load()?;
    let state = SaverState::open(&config)?;

    if json {
        let listing = serde_json::json!({
            "saves": state.saves.entries(),
            "backups": state.backups.entries(),
        });
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    for versions in [&state.saves, &state.backups] {
        println!(
            "{} files in {} ({}/{}):",
            versions.category(),
            versions.dir().display(),
            versions.len(),
            versions.retention_cap()
        );
        println!("{}", "─".repeat(50));
        for entry in versions.entries() {
            println!("  {}", entry.describe());
        }
        println!();
    }
    Ok(())
}
