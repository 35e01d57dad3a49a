use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "forq")]
#[command(version)]
#[command(about = "Redis-backed distributed job processor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    Dedicated {
        #[command(subcommand)]
        command: DedicatedCommand,
    },
    /// Internal: execute one claimed job in this process. Spawned by the
    /// worker loop; not part of the operator surface.
    #[command(hide = true, name = "exec-job")]
    ExecJob {
        job_id: String,
        #[arg(long)]
        queue: String,
        #[arg(long)]
        worker: String,
        #[arg(long)]
        config: Option<String>,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    Run {
        #[arg(long)]
        config: Option<String>,
        #[arg(long, action = clap::ArgAction::Append)]
        queue: Vec<String>,
        /// Poll instead of blocking-pop.
        #[arg(long, default_value_t = false)]
        poll: bool,
    },
}

#[derive(Subcommand)]
enum JobCommand {
    Enqueue {
        class: String,
        #[arg(long, default_value = "default")]
        queue: String,
        #[arg(long)]
        data: Option<String>,
        #[arg(long, conflicts_with = "delay")]
        run_at: Option<i64>,
        /// Seconds from now; shorthand for --run-at.
        #[arg(long)]
        delay: Option<i64>,
        #[arg(long)]
        config: Option<String>,
    },
    Show {
        job_id: String,
        #[arg(long)]
        config: Option<String>,
    },
    Cancel {
        job_id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
        #[arg(long)]
        config: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    List {
        #[arg(long)]
        config: Option<String>,
    },
    Stats {
        #[arg(long)]
        config: Option<String>,
    },
}

#[derive(Subcommand)]
enum DedicatedCommand {
    Set {
        worker_id: String,
        #[arg(long)]
        config: Option<String>,
    },
    Remove {
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    forq::telemetry::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Worker { command } => match command {
            WorkerCommand::Run {
                config,
                queue,
                poll,
            } => commands::worker::run_worker(config.as_deref(), queue, poll).await,
        },
        Commands::Job { command } => match command {
            JobCommand::Enqueue {
                class,
                queue,
                data,
                run_at,
                delay,
                config,
            } => {
                commands::job::enqueue(
                    config.as_deref(),
                    &queue,
                    &class,
                    data.as_deref(),
                    run_at,
                    delay,
                )
                .await
            }
            JobCommand::Show { job_id, config } => {
                commands::job::show(config.as_deref(), &job_id).await
            }
            JobCommand::Cancel {
                job_id,
                reason,
                config,
            } => commands::job::cancel(config.as_deref(), &job_id, &reason).await,
        },
        Commands::Queue { command } => match command {
            QueueCommand::List { config } => commands::queue::list(config.as_deref()).await,
            QueueCommand::Stats { config } => commands::queue::stats(config.as_deref()).await,
        },
        Commands::Dedicated { command } => match command {
            DedicatedCommand::Set { worker_id, config } => {
                commands::worker::dedicated_set(config.as_deref(), &worker_id).await
            }
            DedicatedCommand::Remove { config } => {
                commands::worker::dedicated_remove(config.as_deref()).await
            }
        },
        Commands::ExecJob {
            job_id,
            queue,
            worker,
            config,
        } => {
            let code =
                commands::worker::exec_job(config.as_deref(), &job_id, &queue, &worker).await?;
            std::process::exit(code);
        }
    }
}
