use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nibbler::config::EngineConfig;
use nibbler::contract::{Contract, ContractValidator};
use nibbler::error::EngineError;
use nibbler::gate::StdioPrompt;
use nibbler::job::{JobManager, JobOutcome};
use nibbler::runner::{ChildProcessRunner, Runner};
use nibbler::state::{JobMode, JobState};

#[derive(Parser)]
#[command(name = "nibbler", about = "Contract-driven job engine for multi-role coding agents")]
struct Cli {
    /// Repository root (default: current directory)
    #[arg(short, long, default_value = ".")]
    project: PathBuf,

    /// Program to spawn for agent sessions (must speak the NIBBLER_EVENT protocol)
    #[arg(long, default_value = "cursor-agent")]
    agent_command: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new job at the contract's entry phase
    Build {
        /// Free-text description of the work to do
        description: String,
    },
    /// Re-enter an existing job, optionally at a different phase
    Fix {
        job_id: String,
        #[arg(long)]
        phase: Option<String>,
    },
    /// Resume a paused or interrupted job
    Resume { job_id: String },
    /// Cancel a running job
    Cancel { job_id: String },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    let result = rt.block_on(run(cli));

    match result {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome).unwrap_or_default());
            if matches!(outcome, JobOutcome::Ok) {
                std::process::exit(0);
            }
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    }
}

async fn run(cli: Cli) -> Result<JobOutcome, EngineError> {
    let project = cli.project.canonicalize().unwrap_or_else(|_| cli.project.clone());
    let engine_config = EngineConfig::load(&project)?;
    let contract = Contract::load(&project)?;
    ContractValidator::validate(&contract).map_err(EngineError::InvalidContract)?;

    let runner: Arc<dyn Runner> = Arc::new(ChildProcessRunner::new(cli.agent_command.clone()));
    let prompt = Arc::new(StdioPrompt);
    let manager = JobManager::new(project.clone(), engine_config, runner, prompt);

    match cli.command {
        Commands::Build { description } => {
            manager.run_contract_job(&contract, JobMode::Build, description).await
        }
        Commands::Fix { job_id, phase } => {
            let job = load_job(&project, &job_id)?;
            let phase_id = phase.unwrap_or_else(|| job.current_phase_id.clone());
            manager.run_contract_job_from_phase(job, &contract, &phase_id).await
        }
        Commands::Resume { job_id } => {
            let job = load_job(&project, &job_id)?;
            manager.resume_contract_job(job, &contract).await
        }
        Commands::Cancel { job_id } => {
            let job = load_job(&project, &job_id)?;
            manager.cancel_job(job, &contract).await
        }
    }
}

fn load_job(project_root: &Path, job_id: &str) -> Result<JobState, EngineError> {
    let status_path = project_root.join(".nibbler/jobs").join(job_id).join("status.json");
    Ok(JobState::read(&status_path)?)
}
