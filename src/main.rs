//! nbrelay CLI entry point.
//!
//! Runs the relay as a standalone process, or a self-contained notebook
//! host and a one-shot controller for trying the bridge end to end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;
use nbrelay::client::ControllerClient;
use nbrelay::host::{HostConfig, HostEndpoint};
use nbrelay::protocol::CellType;
use nbrelay::relay::{RelayConfig, RelayServer};
use nbrelay::session::{notebook_name, EchoExecutor, InMemoryNotebook};
use nbrelay::{DEFAULT_MAX_PORT_ATTEMPTS, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT_SECS};

#[derive(Parser, Debug)]
#[command(name = "nbrelay")]
#[command(about = "Request/response relay between notebook frontends and tool controllers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server (default if no command specified)
    Serve {
        /// First port to try; busy ports are probed upward from here
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// How many consecutive ports to probe
        #[arg(long, default_value_t = DEFAULT_MAX_PORT_ATTEMPTS)]
        max_port_attempts: u32,

        /// Deadline for every forwarded request, in seconds
        #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
        request_timeout_secs: u64,
    },

    /// Run a self-contained in-memory notebook host against a relay
    Host {
        /// Relay port to connect to
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Where to save the notebook
        #[arg(long, default_value = "scratch.ipynb")]
        notebook: PathBuf,

        /// Kernel name reported in notebook metadata
        #[arg(long, default_value = "python3")]
        kernel: String,
    },

    /// Insert and execute one code cell through the relay, then print the reply
    Exec {
        /// Cell source to execute
        code: String,

        /// Relay port to connect to
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Position to insert the cell at
        #[arg(long, default_value_t = 0)]
        position: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        None | Some(Commands::Serve { .. }) => {
            let (port, max_port_attempts, request_timeout_secs) = match cli.command {
                Some(Commands::Serve {
                    port,
                    max_port_attempts,
                    request_timeout_secs,
                }) => (port, max_port_attempts, request_timeout_secs),
                _ => (
                    DEFAULT_PORT,
                    DEFAULT_MAX_PORT_ATTEMPTS,
                    DEFAULT_REQUEST_TIMEOUT_SECS,
                ),
            };
            serve(port, max_port_attempts, request_timeout_secs).await
        }
        Some(Commands::Host {
            port,
            notebook,
            kernel,
        }) => host(port, notebook, kernel).await,
        Some(Commands::Exec {
            code,
            port,
            position,
        }) => exec(code, port, position).await,
    }
}

async fn serve(port: u16, max_port_attempts: u32, request_timeout_secs: u64) -> anyhow::Result<()> {
    let server = RelayServer::bind(RelayConfig {
        port,
        max_port_attempts,
        request_timeout: Duration::from_secs(request_timeout_secs),
        ..Default::default()
    })
    .await?;

    info!("nbrelay serving on port {}", server.port());
    server.run().await
}

async fn host(port: u16, notebook: PathBuf, kernel: String) -> anyhow::Result<()> {
    let session = Arc::new(InMemoryNotebook::new(
        notebook_name(&notebook),
        notebook,
        kernel,
        Arc::new(EchoExecutor),
    ));

    let endpoint = HostEndpoint::new(
        session,
        HostConfig {
            port,
            ..Default::default()
        },
    );
    endpoint.run().await
}

async fn exec(code: String, port: u16, position: usize) -> anyhow::Result<()> {
    let client = ControllerClient::connect("127.0.0.1", port).await?;
    let body = client
        .insert_and_execute(position, CellType::Code, &code)
        .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
