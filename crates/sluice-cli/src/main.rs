mod config;
mod pipeline_cmds;
mod run_cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sluice_db::pool;

use config::SluiceConfig;

#[derive(Parser)]
#[command(name = "sluice", about = "Durable ETL pipeline runner")]
struct Cli {
    /// Database URL (overrides SLUICE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sluice config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = config::DEFAULT_DB_URL)]
        db_url: String,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the database (create it if needed, run migrations)
    DbInit,
    /// Run the pipeline runner loop until interrupted
    Run {
        /// Seconds between ticks (default from config, then 5)
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Execution attempts per claimed pipeline
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Pipeline management
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Show run history for a pipeline
    Runs {
        /// Pipeline name
        pipeline: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// List the transforms compiled into this binary
    Transforms,
}

#[derive(Subcommand)]
enum PipelineCommands {
    /// Create a pipeline
    Create(pipeline_cmds::CreateArgs),
    /// List all pipelines
    List,
    /// Show one pipeline with its checkpoint
    Show {
        /// Pipeline name
        name: String,
    },
    /// Patch a pipeline definition (rejected while it is RUNNING)
    Update(pipeline_cmds::UpdateArgs),
    /// Append a step to a multi-step pipeline
    AddStep(pipeline_cmds::AddStepArgs),
    /// Request a run
    Run {
        /// Pipeline name
        name: String,
    },
    /// Request a pause (applies on the next batch boundary)
    Pause {
        /// Pipeline name
        name: String,
    },
    /// Drop the checkpoint so the next incremental run starts from scratch
    Reset {
        /// Pipeline name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SluiceConfig::resolve(cli.database_url.as_deref())?;

    match cli.command {
        Commands::Init { db_url, force } => run_cmd::init(&db_url, force),
        Commands::DbInit => run_cmd::db_init(&config).await,
        Commands::Run {
            poll_interval,
            max_attempts,
        } => run_cmd::run(config, poll_interval, max_attempts).await,
        Commands::Pipeline { command } => {
            let db_pool = pool::create_pool(&config.db_url).await?;
            let result = match command {
                PipelineCommands::Create(args) => {
                    pipeline_cmds::create(&db_pool, &config.catalog, &args).await
                }
                PipelineCommands::List => pipeline_cmds::list(&db_pool).await,
                PipelineCommands::Show { name } => pipeline_cmds::show(&db_pool, &name).await,
                PipelineCommands::Update(args) => {
                    pipeline_cmds::update(&db_pool, &config.catalog, &args).await
                }
                PipelineCommands::AddStep(args) => {
                    pipeline_cmds::add_step(&db_pool, &config.catalog, &args).await
                }
                PipelineCommands::Run { name } => {
                    pipeline_cmds::request_run(&db_pool, &name).await
                }
                PipelineCommands::Pause { name } => {
                    pipeline_cmds::request_pause(&db_pool, &name).await
                }
                PipelineCommands::Reset { name } => {
                    pipeline_cmds::reset_checkpoint(&db_pool, &name).await
                }
            };
            db_pool.close().await;
            result
        }
        Commands::Runs { pipeline, limit } => {
            let db_pool = pool::create_pool(&config.db_url).await?;
            let result = pipeline_cmds::runs(&db_pool, &pipeline, limit).await;
            db_pool.close().await;
            result
        }
        Commands::Transforms => {
            let registry = run_cmd::builtin_registry();
            for name in registry.list() {
                println!("{name}");
            }
            Ok(())
        }
    }
}
