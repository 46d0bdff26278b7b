use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use jobworker::config::WorkerConfig;
use jobworker::grpc::worker_service::state_from_wire;
use jobworker::grpc::{self, JOB_ID_METADATA};
use jobworker::node::Node;
use jobworker::proto::worker_service_client::WorkerServiceClient;
use jobworker::proto::{JobState, QueryRequest, StartRequest, StopRequest, StreamRequest};
use jobworker::shutdown::install_shutdown_handler;
use jobworker::tls::TlsIdentity;

#[derive(Parser, Debug)]
#[command(name = "jobworker")]
#[command(version)]
#[command(about = "Run and observe arbitrary Linux processes over mTLS gRPC")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a worker server
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Path to a TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    listen_addr: Option<IpAddr>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Directory for job output logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Path to CA certificate used to verify clients (PEM format)
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to server certificate (PEM format)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to server private key (PEM format)
    #[arg(long)]
    key: Option<PathBuf>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Path to a TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Server hostname, must match the server certificate
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Path to CA certificate used to verify the server (PEM format)
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (PEM format)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to client private key (PEM format)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Start a process on the worker
    Start {
        /// Executable to run
        process_name: String,

        /// Arguments passed to the process
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Stop a running job
    Stop {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Get status of a job
    Query {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Follow the output of a job until interrupted
    Stream {
        /// The job ID (UUID)
        job_id: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobStartOutput {
    job_id: String,
}

#[derive(Serialize)]
struct JobQueryOutput {
    job_id: String,
    process_id: i64,
    status: jobworker::worker::JobState,
    exit_code: i64,
    started_at_ms: i64,
    finished_at_ms: Option<i64>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn format_timestamp_ms(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(t) => t.to_rfc3339(),
        None => ms.to_string(),
    }
}

fn load_config(path: &Option<PathBuf>) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(WorkerConfig::load(path)?),
        None => Ok(WorkerConfig::default()),
    }
}

/// Connect using the `[client]` section of the config file, with flags
/// taking precedence.
async fn create_client(
    args: &ClientArgs,
) -> Result<WorkerServiceClient<Channel>, Box<dyn std::error::Error>> {
    let mut config = load_config(&args.config)?;
    if let Some(host) = &args.host {
        config.server.hostname = host.clone();
    }
    if let Some(port) = args.port {
        config.server.listen_port = port;
    }
    let tls = &mut config.client.tls;
    if args.ca_cert.is_some() {
        tls.ca_cert_path = args.ca_cert.clone();
    }
    if args.cert.is_some() {
        tls.cert_path = args.cert.clone();
    }
    if args.key.is_some() {
        tls.key_path = args.key.clone();
    }

    if !config.client.tls.is_complete() {
        return Err("mTLS requires --ca-cert, --cert and --key (or a [client] config section)".into());
    }

    let identity = TlsIdentity::load(&config.client.tls).await?;
    let client = grpc::connect(
        &config.server.endpoint(),
        &identity,
        &config.server.hostname,
    )
    .await?;
    Ok(client)
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = load_config(&args.config)?;
    if let Some(addr) = args.listen_addr {
        config.server.listen_addr = addr;
    }
    if let Some(port) = args.port {
        config.server.listen_port = port;
    }
    if let Some(log_dir) = args.log_dir {
        config.global.log_dir = log_dir;
    }
    if args.ca_cert.is_some() {
        config.server.tls.ca_cert_path = args.ca_cert;
    }
    if args.cert.is_some() {
        config.server.tls.cert_path = args.cert;
    }
    if args.key.is_some() {
        config.server.tls.key_path = args.key;
    }

    if !config.server.tls.is_complete() {
        return Err("mTLS requires --ca-cert, --cert and --key (or a [server] config section)".into());
    }

    tracing::info!(
        listen_addr = %config.server.socket_addr(),
        log_dir = %config.global.log_dir.display(),
        "Starting jobworker"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Node::new(config).await?;
    node.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_start(
    client: &mut WorkerServiceClient<Channel>,
    process_name: String,
    args: Vec<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = match client
        .start(StartRequest { process_name, args })
        .await
    {
        Ok(response) => response.into_inner(),
        Err(status) => {
            eprintln!("Error: Job start failed: {}", status.message());
            if let Some(job_id) = status.metadata().get(JOB_ID_METADATA) {
                eprintln!("Job ID: {}", job_id.to_str().unwrap_or_default());
            }
            std::process::exit(1);
        }
    };

    match output_format {
        OutputFormat::Json => {
            let output = JobStartOutput {
                job_id: response.job_id,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job started successfully!");
            println!("Job ID: {}", response.job_id);
        }
    }
    Ok(())
}

async fn handle_job_stop(
    client: &mut WorkerServiceClient<Channel>,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    client
        .stop(StopRequest {
            job_id: job_id.clone(),
        })
        .await?;
    println!("Job {} stopped", job_id);
    Ok(())
}

async fn handle_job_query(
    client: &mut WorkerServiceClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .query(QueryRequest {
            job_id: job_id.clone(),
        })
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = JobQueryOutput {
                job_id,
                process_id: response.process_id,
                status: state_from_wire(response.status),
                exit_code: response.exit_code,
                started_at_ms: response.started_at_ms,
                finished_at_ms: response.finished_at_ms,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:      {}", job_id);
            println!("Status:      {}", state_from_wire(response.status));
            println!("Process ID:  {}", response.process_id);
            if response.status != JobState::Running as i32 {
                println!("Exit Code:   {}", response.exit_code);
            }
            println!("Started:     {}", format_timestamp_ms(response.started_at_ms));
            if let Some(finished_at_ms) = response.finished_at_ms {
                println!("Finished:    {}", format_timestamp_ms(finished_at_ms));
            }
        }
    }
    Ok(())
}

/// Copy output chunks to stdout until the server ends the stream or the user
/// interrupts.
async fn handle_job_stream(
    client: &mut WorkerServiceClient<Channel>,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = client
        .stream(StreamRequest { job_id })
        .await?
        .into_inner();
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = stream.next() => match message {
                Some(Ok(response)) => {
                    stdout.write_all(&response.chunk)?;
                    stdout.flush()?;
                }
                Some(Err(status)) => return Err(status.into()),
                None => break,
            },
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let mut grpc_client = create_client(&client).await?;

            match command {
                JobCommands::Start { process_name, args } => {
                    handle_job_start(&mut grpc_client, process_name, args, &client.output).await?;
                }
                JobCommands::Stop { job_id } => {
                    handle_job_stop(&mut grpc_client, job_id).await?;
                }
                JobCommands::Query { job_id } => {
                    handle_job_query(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::Stream { job_id } => {
                    handle_job_stream(&mut grpc_client, job_id).await?;
                }
            }
        }
    }

    Ok(())
}
