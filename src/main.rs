use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use distributed_compute::codestore::{ArtifactName, CodeStore};
use distributed_compute::config::{self, CoordinatorConfig, WorkerConfig};
use distributed_compute::coordinator::handlers::router;
use distributed_compute::coordinator::{
    AccessPolicy, AllowAll, JobCoordinator, JobFactoryRegistry, JobId, JobSubmission,
    PrioritySerialScheduler, SecuredCoordinator, TokenPolicy,
};
use distributed_compute::jobs::{
    install_builtin_modules, register_job_factories, register_task_workers,
};
use distributed_compute::sync::sync_directory;
use distributed_compute::worker::{HttpCoordinatorClient, TaskWorkerRegistry, WorkerRuntime};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Coordinator, worker and client commands of the compute platform
#[derive(Parser)]
#[command(name = "compute-node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job coordinator and its code store
    Coordinator {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        bind: Option<SocketAddr>,

        #[arg(long)]
        store_dir: Option<PathBuf>,
    },

    /// Run a worker pulling tasks from a coordinator
    Worker {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        coordinator: Option<String>,

        #[arg(long)]
        token: Option<String>,

        /// Number of execution slots
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Upload changed artifacts from a directory
    Sync {
        dir: PathBuf,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Submit a job and print its id
    Submit {
        /// Artifact holding the job module
        module: String,

        /// Job parameters as JSON
        #[arg(long, default_value = "{}")]
        params: String,

        #[arg(long)]
        description: Option<String>,

        /// Attach the logic to a job created earlier
        #[arg(long)]
        job_id: Option<JobId>,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Print the status of a job
    Status {
        job_id: JobId,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Cancel a job
    Cancel {
        job_id: JobId,

        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long, default_value = "http://127.0.0.1:7070")]
    coordinator: String,

    #[arg(long)]
    token: Option<String>,
}

impl ClientArgs {
    fn connect(self) -> HttpCoordinatorClient {
        HttpCoordinatorClient::new(self.coordinator, self.token)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Coordinator {
            config,
            bind,
            store_dir,
        } => {
            let mut config: CoordinatorConfig = config::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(store_dir) = store_dir {
                config.store_dir = store_dir;
            }
            run_coordinator(config).await
        }
        Commands::Worker {
            config,
            coordinator,
            token,
            concurrency,
        } => {
            let mut config: WorkerConfig = config::load(config.as_deref())?;
            if let Some(url) = coordinator {
                config.coordinator_url = url;
            }
            if token.is_some() {
                config.token = token;
            }
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            run_worker(config).await
        }
        Commands::Sync { dir, client } => {
            let report = sync_directory(&dir, &client.connect()).await?;
            print_json(&report)
        }
        Commands::Submit {
            module,
            params,
            description,
            job_id,
            client,
        } => {
            ArtifactName::parse(&module)?;
            let params = serde_json::from_str(&params).context("--params is not valid JSON")?;
            let job_id = client
                .connect()
                .submit_job(JobSubmission::new(module, params), job_id, description)
                .await?;
            println!("{}", job_id);
            Ok(())
        }
        Commands::Status { job_id, client } => {
            let report = client.connect().job_status(job_id).await?;
            print_json(&report)
        }
        Commands::Cancel { job_id, client } => {
            client.connect().cancel_job(job_id).await?;
            tracing::info!("Cancelled job {}", job_id);
            Ok(())
        }
    }
}

async fn run_coordinator(config: CoordinatorConfig) -> Result<()> {
    // 1. Code store:
    let store = CodeStore::open(&config.store_dir)
        .with_context(|| format!("opening code store at {}", config.store_dir.display()))?;
    if config.install_builtin_modules {
        install_builtin_modules(&store)?;
    }

    // 2. Job logic:
    let factories = JobFactoryRegistry::new();
    register_job_factories(&factories);

    let coordinator = JobCoordinator::with_finished_capacity(
        store,
        factories,
        Box::new(PrioritySerialScheduler::new()),
        config.finished_jobs_retained,
    );
    coordinator.set_idle_time(config.idle_seconds);

    // 3. Access control:
    let policy: Arc<dyn AccessPolicy> = if config.tokens.is_empty() {
        tracing::warn!("No tokens configured, every caller gets every permission");
        Arc::new(AllowAll)
    } else {
        Arc::new(TokenPolicy::new(config.tokens.clone()))
    };
    let app = router(SecuredCoordinator::new(coordinator, policy));

    // 4. HTTP server:
    tracing::info!("Coordinator listening on {}", config.bind);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}

async fn run_worker(config: WorkerConfig) -> Result<()> {
    let registry = TaskWorkerRegistry::new();
    register_task_workers(&registry);

    let client = Arc::new(HttpCoordinatorClient::from_config(&config));
    tracing::info!("Worker connecting to {}", config.coordinator_url);

    let runtime = WorkerRuntime::new(client, registry, config);

    let shutdown = runtime.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing running tasks");
            shutdown.cancel();
        }
    });

    runtime.run().await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
