//! Gopherbot CLI entry point.

use gopherbot::bot::{Bot, BotOptions};
use gopherbot::cli::{self, DumpSource};
use gopherbot::config::Paths;
use gopherbot::logging::{self, LogTarget};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gopherbot")]
#[command(about = "A ChatOps robot for running plugins, jobs and tasks from chat")]
struct Cli {
    /// Log file, or "stderr"
    #[arg(short, long, global = true)]
    log: Option<String>,

    /// Omit timestamps and colors from log lines
    #[arg(short, long, global = true)]
    plainlog: bool,

    /// Protocol to use instead of the configured one
    #[arg(short = 'o', long = "override", global = true)]
    protocol: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the robot (default)
    Run,
    /// Encrypt a string or file with the robot's key
    Encrypt {
        /// Read input from a file, "-" for stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Write raw binary instead of base64
        #[arg(short, long)]
        binary: bool,
        text: Option<String>,
    },
    /// Decrypt a base64 string or encrypted file
    Decrypt {
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(short, long)]
        binary: bool,
        text: Option<String>,
    },
    /// Print a brain memory
    Fetch {
        /// Print base64 instead of raw bytes
        #[arg(short, long)]
        base64: bool,
        key: String,
    },
    /// Store a brain memory from a file or stdin
    Store { key: String, file: Option<PathBuf> },
    /// Delete a brain memory
    Delete { key: String },
    /// List brain memories
    List,
    /// Start a new robot from the protocol's answerfile template
    Init { protocol: String },
    /// Print a configuration file after template expansion
    Dump {
        #[arg(value_enum)]
        source: DumpSource,
        relpath: String,
    },
    /// Strictly check every YAML file in a configuration repository
    Validate { repo: Option<PathBuf> },
    /// Print the version
    Version,
    #[command(name = gopherbot::rpc::CHILD_COMMAND, hide = true)]
    PipelineChild,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    // The child speaks the pipeline protocol on stdout and never logs there.
    if matches!(command, Command::PipelineChild) {
        std::process::exit(gopherbot::rpc::child::run_stdio().await);
    }

    let terminal = cli
        .protocol
        .clone()
        .or_else(|| std::env::var("GOPHER_PROTOCOL").ok())
        .is_some_and(|protocol| protocol == "terminal");
    let quiet_console = terminal || !matches!(command, Command::Run);
    let target = LogTarget::resolve(
        cli.log.as_deref(),
        std::env::var("GOPHER_LOGFILE").ok().as_deref(),
        quiet_console,
    );
    let level = std::env::var("GOPHER_LOGLEVEL").unwrap_or_default();
    let _guard = match logging::init(&target, &level, cli.plainlog) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("failed to initialize logging: {error:#}");
            std::process::exit(1);
        }
    };

    if let Err(error) = dispatch(command, cli.protocol).await {
        eprintln!("{error:#}");
        std::process::exit(1);
    }
}

async fn dispatch(command: Command, protocol: Option<String>) -> anyhow::Result<()> {
    let paths = Paths::from_env();
    match command {
        Command::Run => run(paths, protocol).await,
        Command::Encrypt { file, binary, text } => cli::encrypt(&paths, file.as_deref(), binary, text.as_deref()),
        Command::Decrypt { file, binary, text } => cli::decrypt(&paths, file.as_deref(), binary, text.as_deref()),
        Command::Fetch { base64, key } => cli::fetch(&paths, &key, base64).await,
        Command::Store { key, file } => cli::store(&paths, &key, file.as_deref()).await,
        Command::Delete { key } => cli::delete(&paths, &key).await,
        Command::List => cli::list(&paths).await,
        Command::Init { protocol } => cli::init(&paths, &protocol),
        Command::Dump { source, relpath } => {
            print!("{}", cli::dump(&paths, source, &relpath)?);
            Ok(())
        }
        Command::Validate { repo } => {
            let repo = repo.unwrap_or_else(|| paths.config_dir.clone());
            let checked = cli::validate(&repo)?;
            println!("{checked} configuration file(s) OK");
            Ok(())
        }
        Command::Version => {
            println!("Gopherbot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        // Served before logging starts.
        Command::PipelineChild => Ok(()),
    }
}

/// Run the robot, starting it again in-process after a `restart`.
async fn run(paths: Paths, protocol: Option<String>) -> anyhow::Result<()> {
    loop {
        let mut options = BotOptions::from_env(paths.clone());
        if protocol.is_some() {
            options.protocol = protocol.clone();
        }
        let (bot, incoming) = Bot::new(options).await.context("failed to start robot")?;

        let signals = bot.clone();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                signals.request_shutdown(false);
            }
        });

        let restart = bot.run(incoming).await?;
        watcher.abort();
        if !restart {
            return Ok(());
        }
        tracing::info!("restarting robot");
    }
}
