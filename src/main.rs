use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use flowaudit::{AuditConfig, PipelineDriver, Stage};

#[derive(Parser)]
#[command(name = "flowaudit")]
#[command(about = "Automated smart-contract audit pipeline driving a sandboxed analysis agent")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the audit pipeline for one project or the whole dataset
    Run {
        /// Project to audit; omit to run every project in the manifest
        #[arg(long)]
        project_id: Option<String>,

        /// Dataset base directory holding datasets.json
        #[arg(long, env = "DATASET_BASE")]
        dataset_base: Option<PathBuf>,

        /// Stage to execute
        #[arg(long, value_enum, default_value_t = StageArg::All)]
        stage: StageArg,

        /// Inter-project parallelism
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Per-call agent deadline in seconds
        #[arg(long)]
        timeout_sec: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StageArg {
    Plan,
    Reason,
    Validate,
    All,
}

impl From<StageArg> for Stage {
    fn from(stage: StageArg) -> Self {
        match stage {
            StageArg::Plan => Stage::Plan,
            StageArg::Reason => Stage::Reason,
            StageArg::Validate => Stage::Validate,
            StageArg::All => Stage::All,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Run {
            project_id,
            dataset_base,
            stage,
            max_parallel,
            timeout_sec,
        } => {
            let work_dir = PathBuf::from(".");
            let mut config = AuditConfig::from_dir(&work_dir)?;
            config.apply_env();
            if let Some(base) = dataset_base {
                config.dataset_base = base;
            }
            if let Some(n) = max_parallel {
                config.max_project_parallel = n.max(1);
            }
            if let Some(t) = timeout_sec {
                config.agent.timeout_sec = t.max(1);
            }
            if config.dataset_base.as_os_str().is_empty() {
                anyhow::bail!("--dataset-base (or DATASET_BASE) is required");
            }

            let driver = PipelineDriver::new(config)?;

            // One cancellation root: Ctrl-C stops scheduling, signals running
            // subprocesses, and lets database writes settle.
            let cancel = driver.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling run");
                    cancel.cancel();
                }
            });

            let projects: Vec<String> = project_id.into_iter().collect();
            let summary = driver.run(&projects, stage.into()).await?;

            println!(
                "planned={} reasoned={} validated={} errors={}",
                summary.planned(),
                summary.reasoned(),
                summary.validated(),
                summary.errors()
            );
            std::process::exit(summary.exit_code());
        }
    }
}
