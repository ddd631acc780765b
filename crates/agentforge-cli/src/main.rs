//! agentforge CLI
//!
//! Controls and observes a running `agentforged` over its HTTP API.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use agentforge_cli::client::DaemonClient;
use agentforge_cli::feature_cmd::{self, FeatureAction};
use agentforge_cli::policy_cmd;
use agentforge_cli::run_cmd;
use agentforge_cli::schedule_cmd::{self, ScheduleAction};
use agentforge_core::model::RunSettings;

#[derive(Parser, Debug)]
#[command(name = "agentforge")]
#[command(version, about = "Control the agentforge build orchestrator", long_about = None)]
struct Cli {
    /// Daemon base URL
    #[arg(long, default_value = "http://127.0.0.1:8765", env = "AGENTFORGE_URL")]
    daemon_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show run state, progress and agents
    Status,
    /// Start a run
    Start {
        /// Coding-agent concurrency (1-5)
        #[arg(short, long)]
        concurrency: Option<u8>,
        #[arg(short, long)]
        model: Option<String>,
        /// Skip regression testing agents
        #[arg(long)]
        yolo: bool,
    },
    /// Stop the current run
    Stop {
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Pause the current run; agents finish, no new ones start
    Pause,
    /// Resume a paused run
    Resume,
    /// Stream orchestrator events
    Watch {
        /// Print raw JSON envelopes
        #[arg(long)]
        json: bool,
    },
    /// Manage the feature backlog
    #[command(subcommand)]
    Features(FeatureAction),
    /// Manage run schedules
    #[command(subcommand)]
    Schedules(ScheduleAction),
    /// Inspect the command policy
    #[command(subcommand)]
    Policy(PolicyAction),
}

#[derive(Subcommand, Debug)]
enum PolicyAction {
    /// Check whether a command line would be allowed (exit 2 when denied)
    Check {
        /// Project whose policy files to load
        #[arg(short, long, default_value = ".")]
        project: PathBuf,
        /// Ask the running daemon instead of reading policy files
        #[arg(long)]
        remote: bool,
        /// Command line to evaluate
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    agentforge_core::tracing_init::init_tracing("agentforge_cli=warn", false);

    let client = DaemonClient::new(&cli.daemon_url)?;
    match cli.command {
        Command::Status => run_cmd::status(&client).await?,
        Command::Start {
            concurrency,
            model,
            yolo,
        } => {
            let settings = RunSettings {
                max_concurrency: concurrency,
                model,
                yolo,
            };
            run_cmd::start(&client, settings).await?;
        }
        Command::Stop { reason } => run_cmd::stop(&client, reason.as_deref()).await?,
        Command::Pause => run_cmd::pause(&client).await?,
        Command::Resume => run_cmd::resume(&client).await?,
        Command::Watch { json } => run_cmd::watch(&client, json).await?,
        Command::Features(action) => feature_cmd::run(&client, action).await?,
        Command::Schedules(action) => schedule_cmd::run(&client, action).await?,
        Command::Policy(PolicyAction::Check {
            project,
            remote,
            command,
        }) => {
            let line = command.join(" ");
            let decision = if remote {
                policy_cmd::check_remote(&client, &line).await?
            } else {
                policy_cmd::check_local(&project, &line)?
            };
            policy_cmd::write_decision(&mut io::stdout(), &line, &decision)?;
            io::stdout().flush()?;
            if !decision.is_allowed() {
                return Ok(ExitCode::from(2));
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
