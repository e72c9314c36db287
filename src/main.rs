use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tonic::Code;
use tracing_subscriber::EnvFilter;

use remote_worker::cache::Digest;
use remote_worker::config::{SandboxConfig, WorkerConfig};
use remote_worker::node::WorkerNode;
use remote_worker::proto::byte_stream_client::ByteStreamClient;
use remote_worker::proto::content_addressable_storage_client::ContentAddressableStorageClient;
use remote_worker::proto::execute_request::ActionSource;
use remote_worker::proto::execution_client::ExecutionClient;
use remote_worker::proto::watcher_client::WatcherClient;
use remote_worker::proto::{
    self, batch_update_blobs_request, operation::Outcome, BatchUpdateBlobsRequest,
    ExecuteRequest, ExecutionStage, ReadRequest, WatchRequest,
};
use remote_worker::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "remote-worker")]
#[command(version)]
#[command(about = "Remote build-action execution worker with a content-addressable cache")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a worker
    Server(ServerArgs),

    /// Submit an action for execution
    Execute {
        #[command(flatten)]
        client: ClientArgs,

        #[command(flatten)]
        action: ExecuteArgs,
    },

    /// Follow an operation until it finishes
    Watch {
        #[command(flatten)]
        client: ClientArgs,

        /// The operation ID (UUID)
        operation_id: String,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Directory for per-action scratch directories. Without it only the
    /// cache services are served.
    #[arg(long)]
    work_path: Option<PathBuf>,

    /// Run every action under the isolation wrapper
    #[arg(long)]
    sandboxing: bool,

    /// Path to the isolation wrapper (default: <work-path>/linux-sandbox)
    #[arg(long, requires = "sandboxing")]
    sandbox_binary: Option<PathBuf>,

    /// Write the process id to this file once listening
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Port for the diagnostics dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Timeout for actions that don't set one
    #[arg(long, default_value = "600")]
    default_timeout_secs: u64,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Worker address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
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

#[derive(Parser, Debug)]
struct ExecuteArgs {
    /// Execute even if the action cache has a result
    #[arg(long)]
    skip_cache: bool,

    /// Local file (relative path) to upload and stage at the same path
    #[arg(long = "input")]
    inputs: Vec<PathBuf>,

    /// File the command is expected to produce
    #[arg(long = "output-file")]
    output_files: Vec<String>,

    /// Environment variable for the command
    #[arg(long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Per-action timeout
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Follow the operation and print its stdout when it completes
    #[arg(long)]
    wait: bool,

    /// The command line to run
    #[arg(last = true, required = true)]
    argv: Vec<String>,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ExecuteOutput {
    operation_id: String,
    action_digest: String,
}

#[derive(Serialize)]
struct OperationOutput {
    operation_id: String,
    stage: String,
    action_digest: String,
    cached_result: bool,
    exit_code: Option<i32>,
    stdout_digest: Option<String>,
    stderr_digest: Option<String>,
    output_files: Vec<String>,
    error_kind: Option<String>,
    error: Option<String>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_env(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {}", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in {}", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn stage_to_string(stage: i32) -> String {
    match ExecutionStage::try_from(stage) {
        Ok(ExecutionStage::Queued) => "QUEUED".to_string(),
        Ok(ExecutionStage::Executing) => "EXECUTING".to_string(),
        Ok(ExecutionStage::Completed) => "COMPLETED".to_string(),
        Ok(ExecutionStage::Error) => "ERROR".to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

fn digest_to_string(digest: Option<&proto::Digest>) -> String {
    digest
        .map(|d| format!("{}/{}", d.hash, d.size_bytes))
        .unwrap_or_default()
}

fn operation_output(op: &proto::Operation) -> OperationOutput {
    let mut output = OperationOutput {
        operation_id: op.operation_id.clone(),
        stage: stage_to_string(op.stage),
        action_digest: digest_to_string(op.action_digest.as_ref()),
        cached_result: op.cached_result,
        exit_code: None,
        stdout_digest: None,
        stderr_digest: None,
        output_files: Vec::new(),
        error_kind: None,
        error: None,
    };
    match &op.outcome {
        Some(Outcome::Result(result)) => {
            output.exit_code = Some(result.exit_code);
            output.stdout_digest = Some(digest_to_string(result.stdout_digest.as_ref()));
            output.stderr_digest = Some(digest_to_string(result.stderr_digest.as_ref()));
            output.output_files = result
                .output_files
                .iter()
                .map(|f| format!("{} {}", f.path, digest_to_string(f.digest.as_ref())))
                .collect();
        }
        Some(Outcome::Error(error)) => {
            output.exit_code = error.exit_code;
            output.error_kind = Some(error.kind.clone());
            output.error = Some(error.message.clone());
        }
        None => {}
    }
    output
}

async fn connect(args: &ClientArgs) -> Result<Channel, Box<dyn std::error::Error>> {
    Ok(Channel::from_shared(args.addr.clone())?.connect().await?)
}

async fn read_blob(
    channel: Channel,
    digest: &proto::Digest,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut client = ByteStreamClient::new(channel);
    let mut stream = client
        .read(ReadRequest {
            resource_name: format!("blobs/{}/{}", digest.hash, digest.size_bytes),
            read_offset: 0,
            read_limit: 0,
        })
        .await?
        .into_inner();

    let mut data = Vec::with_capacity(digest.size_bytes.max(0) as usize);
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?.data);
    }
    Ok(data)
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let config = WorkerConfig {
        listen_addr,
        work_path: args.work_path,
        sandbox: SandboxConfig {
            enabled: args.sandboxing,
            binary_path: args.sandbox_binary,
        },
        pid_file: args.pid_file,
        dashboard_addr,
        default_timeout: Duration::from_secs(args.default_timeout_secs),
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        work_path = ?config.work_path,
        sandboxing = config.sandbox.enabled,
        dashboard_addr = ?config.dashboard_addr,
        "Starting remote worker"
    );

    let shutdown = install_shutdown_handler();
    let node = WorkerNode::new(config).await?;
    node.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_execute(
    channel: Channel,
    args: ExecuteArgs,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut input_files = Vec::with_capacity(args.inputs.len());
    let mut uploads = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        let data = tokio::fs::read(path).await?;
        let mode = tokio::fs::metadata(path).await?.permissions().mode();
        let digest: proto::Digest = Digest::of(&data).into();
        input_files.push(proto::InputFile {
            path: path.to_string_lossy().into_owned(),
            digest: Some(digest.clone()),
            is_executable: mode & 0o111 != 0,
        });
        uploads.push(batch_update_blobs_request::Request {
            digest: Some(digest),
            data,
        });
    }

    if !uploads.is_empty() {
        let mut cas = ContentAddressableStorageClient::new(channel.clone());
        let response = cas
            .batch_update_blobs(BatchUpdateBlobsRequest { requests: uploads })
            .await?
            .into_inner();
        for r in response.responses {
            if r.code != Code::Ok as i32 {
                eprintln!(
                    "Error: Upload of {} failed: {}",
                    digest_to_string(r.digest.as_ref()),
                    r.message
                );
                std::process::exit(1);
            }
        }
    }

    let action = proto::Action {
        arguments: args.argv,
        environment_variables: args
            .env
            .into_iter()
            .map(|(name, value)| proto::EnvironmentVariable { name, value })
            .collect(),
        input_files,
        output_files: args.output_files,
        timeout_ms: args.timeout_secs.map(|s| s * 1000).unwrap_or(0),
    };

    let mut client = ExecutionClient::new(channel.clone());
    let response = match client
        .execute(ExecuteRequest {
            action_source: Some(ActionSource::Action(action)),
            skip_cache_lookup: args.skip_cache,
        })
        .await
    {
        Ok(response) => response.into_inner(),
        Err(status) => {
            eprintln!("Error: Execution request failed: {}", status.message());
            std::process::exit(1);
        }
    };

    if !args.wait {
        match output_format {
            OutputFormat::Json => {
                let output = ExecuteOutput {
                    operation_id: response.operation_id,
                    action_digest: digest_to_string(response.action_digest.as_ref()),
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Action submitted!");
                println!("Operation ID:  {}", response.operation_id);
                println!(
                    "Action digest: {}",
                    digest_to_string(response.action_digest.as_ref())
                );
            }
        }
        return Ok(());
    }

    handle_watch(channel, response.operation_id, output_format).await
}

async fn handle_watch(
    channel: Channel,
    operation_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = WatcherClient::new(channel.clone());
    let mut stream = client
        .watch(WatchRequest { operation_id })
        .await?
        .into_inner();

    let mut last: Option<proto::Operation> = None;
    while let Some(result) = stream.next().await {
        let op = match result {
            Ok(op) => op,
            Err(e) => {
                eprintln!("Stream error: {}", e);
                std::process::exit(1);
            }
        };
        match output_format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string(&operation_output(&op))?);
            }
            OutputFormat::Table => {
                println!("{:<38} {}", op.operation_id, stage_to_string(op.stage));
            }
        }
        last = Some(op);
    }

    let Some(op) = last else {
        eprintln!("Error: Stream ended without an operation");
        std::process::exit(1);
    };

    if let OutputFormat::Table = output_format {
        let summary = operation_output(&op);
        println!();
        println!("Stage:         {}", summary.stage);
        println!("Cached:        {}", summary.cached_result);
        if let Some(exit_code) = summary.exit_code {
            println!("Exit Code:     {}", exit_code);
        }
        if !summary.output_files.is_empty() {
            println!("Outputs:");
            for line in &summary.output_files {
                println!("  {}", line);
            }
        }
        if let (Some(kind), Some(error)) = (&summary.error_kind, &summary.error) {
            println!("Error:         {} ({})", error, kind);
        }
        if let Some(Outcome::Result(result)) = &op.outcome {
            if let Some(stdout) = &result.stdout_digest {
                let data = read_blob(channel.clone(), stdout).await?;
                if !data.is_empty() {
                    println!("Stdout:");
                    for line in String::from_utf8_lossy(&data).lines() {
                        println!("  {}", line);
                    }
                }
            }
        }
        if let Some(Outcome::Error(error)) = &op.outcome {
            if !error.stderr_tail.is_empty() {
                println!("Stderr:");
                for line in error.stderr_tail.lines() {
                    println!("  {}", line);
                }
            }
        }
    }

    if op.stage == ExecutionStage::Error as i32 {
        std::process::exit(1);
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
        Commands::Execute { client, action } => {
            let channel = connect(&client).await?;
            handle_execute(channel, action, &client.output).await?;
        }
        Commands::Watch {
            client,
            operation_id,
        } => {
            let channel = connect(&client).await?;
            handle_watch(channel, operation_id, &client.output).await?;
        }
    }

    Ok(())
}
