use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use jobmesh::api;
use jobmesh::config::{FeederConfig, PoolConfig, PushConfig, RetryConfig, RunnerConfig};
use jobmesh::scheduler::{Competencies, Job, NewJob, Runner};
use jobmesh::shutdown::install_shutdown_handler;
use jobmesh::store::Page;
use jobmesh::worker::ShellProcessorFactory;
use jobmesh::{Registry, RunnerNode};

#[derive(Parser, Debug)]
#[command(name = "jobmesh")]
#[command(version)]
#[command(about = "A job registry with self-scheduling runner pools")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a registry with one local runner
    Serve(ServeArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Runner inspection commands
    Runner {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: RunnerCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to bind both HTTP servers to
    #[arg(long, default_value = "127.0.0.1", env = "JOBMESH_HOST")]
    host: String,

    /// Port for the registry API
    #[arg(long, default_value = "8080", env = "JOBMESH_API_PORT")]
    api_port: u16,

    /// Port for the runner's callback endpoint
    #[arg(long, default_value = "8081", env = "JOBMESH_RUNNER_PORT")]
    runner_port: u16,

    /// Number of worker slots
    #[arg(long, default_value = "4", env = "JOBMESH_CAPACITY")]
    capacity: usize,

    /// Job categories this runner executes (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "shell", env = "JOBMESH_CATEGORIES")]
    categories: Vec<String>,

    /// Job names this runner executes (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "run", env = "JOBMESH_NAMES")]
    names: Vec<String>,

    /// How long an idle worker slot waits for a job before re-checking shutdown, in milliseconds
    #[arg(long, default_value = "1000", env = "JOBMESH_WORKER_WAIT_TIMEOUT_MS")]
    worker_wait_timeout_ms: u64,

    /// Runner time-to-live in seconds; heartbeats run at 66% of it
    #[arg(long, default_value = "60", env = "JOBMESH_TTL_SECS")]
    ttl_secs: u64,

    /// Attempts for a job status write that hits transport errors
    #[arg(long, default_value = "5", env = "JOBMESH_UPDATE_MAX_RETRIES")]
    max_retries: u32,

    /// Base backoff between job status write attempts, in milliseconds
    #[arg(long, default_value = "2000", env = "JOBMESH_UPDATE_RETRY_DELAY_MS")]
    retry_delay_ms: u64,

    /// Seconds between periodic pulls of pending jobs
    #[arg(long, default_value = "30", env = "JOBMESH_PULL_INTERVAL_SECS")]
    pull_interval_secs: u64,

    /// Pending jobs fetched per pull (clamped to 10..=20)
    #[arg(long, default_value = "10", env = "JOBMESH_PULL_PAGE_SIZE")]
    pull_page_size: usize,

    /// Idle runners fetched per page when pushing a job
    #[arg(long, default_value = "10", env = "JOBMESH_PUSH_PAGE_SIZE")]
    push_page_size: usize,

    /// Push scan restarts allowed after disconnecting unreachable runners
    #[arg(long, default_value = "3", env = "JOBMESH_PUSH_MAX_RESTARTS")]
    push_max_restarts: u32,

    /// Seconds in-flight jobs get to finish on shutdown
    #[arg(long, default_value = "30", env = "JOBMESH_SHUTDOWN_GRACE_SECS")]
    shutdown_grace_secs: u64,

    /// Timeout for pushing a job to a runner, in milliseconds
    #[arg(long, default_value = "5000", env = "JOBMESH_CALLBACK_TIMEOUT_MS")]
    callback_timeout_ms: u64,
}

impl ServeArgs {
    fn push_config(&self) -> PushConfig {
        PushConfig {
            page_size: self.push_page_size,
            max_restarts: self.push_max_restarts,
        }
    }

    fn runner_config(&self, callback: String) -> RunnerConfig {
        RunnerConfig {
            pool: PoolConfig {
                worker_wait_timeout: Duration::from_millis(self.worker_wait_timeout_ms),
                shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
                ..PoolConfig::with_capacity(self.capacity)
            },
            feeder: FeederConfig {
                page_size: self.pull_page_size,
                interval: Duration::from_secs(self.pull_interval_secs),
            },
            retry: RetryConfig::new(self.max_retries, Duration::from_millis(self.retry_delay_ms)),
            ..RunnerConfig::new(
                callback,
                Competencies::new(self.categories.clone(), self.names.clone()),
            )
        }
        .with_ttl(Duration::from_secs(self.ttl_secs))
    }
}

// =============================================================================
// Client Arguments (shared by job and runner commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Registry API address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080", env = "JOBMESH_ADDR")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// Job category (routing key)
        #[arg(long, short = 'c', default_value = "shell")]
        category: String,

        /// Job name (routing key)
        #[arg(long, short = 'n', default_value = "run")]
        name: String,

        /// Account the job is billed to
        #[arg(long)]
        account: Option<String>,

        /// Program and arguments, e.g. `-- echo hello`
        #[arg(trailing_var_arg = true)]
        arguments: Vec<String>,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List jobs
    List {
        /// Only jobs in this run status (pending, running, done)
        #[arg(long)]
        run: Option<String>,

        /// Only jobs in this category
        #[arg(long)]
        category: Option<String>,

        /// Page index, starting at 0
        #[arg(long, default_value = "0")]
        page: usize,

        /// Jobs per page (max 100)
        #[arg(long, default_value = "20")]
        size: usize,
    },
}

#[derive(clap::Subcommand, Debug)]
enum RunnerCommands {
    /// List registered runners
    List,
}

// =============================================================================
// Server
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let shutdown = install_shutdown_handler()?;

    let registry = Registry::with_http_callbacks(
        Duration::from_millis(args.callback_timeout_ms),
        args.push_config(),
    )
    .await?;

    let api_addr: SocketAddr = format!("{}:{}", args.host, args.api_port).parse()?;
    let runner_addr: SocketAddr = format!("{}:{}", args.host, args.runner_port).parse()?;
    let api_listener = TcpListener::bind(api_addr).await?;
    let runner_listener = TcpListener::bind(runner_addr).await?;
    let callback = format!("http://{}", runner_listener.local_addr()?);

    let config = args.runner_config(callback);

    tracing::info!(
        api_addr = %api_addr,
        runner_addr = %runner_addr,
        capacity = config.pool.capacity,
        "Starting jobmesh"
    );

    let node = RunnerNode::start(
        config,
        registry.job_store(),
        registry.runner_store(),
        Arc::new(ShellProcessorFactory::new()),
    )
    .await?;

    let api_server = tokio::spawn(api::serve(api_listener, registry.router(), shutdown.clone()));
    let runner_server = tokio::spawn(api::serve(runner_listener, node.router(), shutdown.clone()));

    shutdown.cancelled().await;

    let report = node.shutdown().await;
    tracing::info!(
        completed_slots = report.completed_slots,
        aborted_jobs = report.aborted_jobs.len(),
        "Runner drained"
    );

    for server in [api_server, runner_server] {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "HTTP server failed"),
            Err(e) => tracing::error!(error = %e, "HTTP server task failed"),
        }
    }

    Ok(())
}

// =============================================================================
// Client
// =============================================================================

async fn expect_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, Box<dyn std::error::Error>> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let message = body["error"].as_str().unwrap_or("request failed").to_string();
    Err(format!("{status}: {message}").into())
}

async fn handle_job_submit(
    http: &reqwest::Client,
    client: &ClientArgs,
    spec: NewJob,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/api/jobs", client.addr.trim_end_matches('/'));
    let response = expect_success(http.post(&url).json(&spec).send().await?).await?;
    let job: Job = response.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", job.id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/api/jobs/{}", client.addr.trim_end_matches('/'), job_id);
    let response = expect_success(http.get(&url).send().await?).await?;
    let job: Job = response.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            println!("Job ID:    {}", job.id);
            println!("Category:  {}", job.category);
            println!("Name:      {}", job.name);
            println!("Status:    {}", job.status);
            println!("Version:   {}", job.version);
            println!("Submitted: {}", job.processing.submitted);
            if let Some(started) = job.processing.started {
                println!("Started:   {}", started);
            }
            if let Some(finished) = job.processing.finished {
                println!("Finished:  {}", finished);
            }
            if let Some(result) = &job.result {
                println!("Result:");
                println!("{}", serde_json::to_string_pretty(result)?);
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    http: &reqwest::Client,
    client: &ClientArgs,
    run: Option<String>,
    category: Option<String>,
    page: usize,
    size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/api/jobs", client.addr.trim_end_matches('/'));
    let mut query = vec![("page", page.to_string()), ("size", size.to_string())];
    if let Some(run) = run {
        query.push(("run", run));
    }
    if let Some(category) = category {
        query.push(("category", category));
    }
    let response = expect_success(http.get(&url).query(&query).send().await?).await?;
    let jobs: Page<Job> = response.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<38} {:<16} {:<24} ARGUMENTS", "JOB ID", "STATUS", "CATEGORY/NAME");
            println!("{}", "-".repeat(96));
            for job in &jobs.items {
                println!(
                    "{:<38} {:<16} {:<24} {}",
                    job.id,
                    job.status.to_string(),
                    format!("{}/{}", job.category, job.name),
                    job.arguments.join(" ")
                );
            }
            println!();
            println!("Showing {} of {} jobs", jobs.items.len(), jobs.total);
            if jobs.has_more {
                println!("(Use --page {} for more)", page + 1);
            }
        }
    }
    Ok(())
}

async fn handle_runner_list(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/api/runners", client.addr.trim_end_matches('/'));
    let response = expect_success(http.get(&url).send().await?).await?;
    let runners: Vec<Runner> = response.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&runners)?),
        OutputFormat::Table => {
            println!("{:<38} {:<14} {:<26} LAST PING", "RUNNER ID", "STATUS", "CALLBACK");
            println!("{}", "-".repeat(100));
            for runner in &runners {
                println!(
                    "{:<38} {:<14} {:<26} {}",
                    runner.id,
                    runner.runtime.status.to_string(),
                    runner.callback,
                    runner.runtime.last_ping
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
        }
        Commands::Job { client, command } => {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?;

            match command {
                JobCommands::Submit {
                    category,
                    name,
                    account,
                    arguments,
                } => {
                    let mut spec = NewJob::new(category, name).with_args(arguments);
                    if let Some(account) = account {
                        spec = spec.with_account(account);
                    }
                    handle_job_submit(&http, &client, spec).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&http, &client, job_id).await?;
                }
                JobCommands::List {
                    run,
                    category,
                    page,
                    size,
                } => {
                    handle_job_list(&http, &client, run, category, page, size).await?;
                }
            }
        }
        Commands::Runner { client, command } => {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?;

            match command {
                RunnerCommands::List => handle_runner_list(&http, &client).await?,
            }
        }
    }

    Ok(())
}
