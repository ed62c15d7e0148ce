//! Entry point: load config, wire the agent pool and dispatchers, and run
//! the JSON-RPC HTTP listener until shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use nexus_core::config::Config;
use nexus_core::detection;
use nexus_core::global_dispatcher::GlobalDispatcher;
use nexus_core::pool::AgentPool;
use nexus_core::pool::SharedComponents;
use nexus_core::session::EchoSession;
use nexus_core::session::Session;
use nexus_core::token_store::DEFAULT_PORT;
use nexus_core::token_store::ServerTokenManager;

/// Nexus agent server
#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Override the default config directory (`~/.nexus3`, or
    /// `$NEXUS3_CONFIG_DIR`).
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP JSON-RPC server (default).
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Check once whether a Nexus server is listening on host:port.
    Probe {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        #[arg(long, default_value_t = 2)]
        timeout_secs: u64,
    },
    /// Poll until a Nexus server is listening on host:port, or time out.
    WaitForServer {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        #[arg(long, default_value_t = 200)]
        poll_interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_dir = cli.config_dir.unwrap_or_else(Config::default_config_dir);

    match cli.command.unwrap_or(Command::Serve { host: None, port: None }) {
        Command::Serve { host, port } => run_serve(config_dir, host, port).await,
        Command::Probe { host, port, timeout_secs } => run_probe(config_dir, host, port, timeout_secs).await,
        Command::WaitForServer { host, port, timeout_secs, poll_interval_ms } => {
            run_wait_for_server(config_dir, host, port, timeout_secs, poll_interval_ms).await
        }
    }
}

async fn run_serve(config_dir: PathBuf, host_arg: Option<String>, port_arg: Option<u16>) -> anyhow::Result<()> {
    let config = Config::load(&config_dir)?;
    let host = host_arg.unwrap_or_else(|| config.host.clone());
    let port = port_arg.unwrap_or(config.port);

    let token_manager = ServerTokenManager::new(port, config_dir.clone(), config.strict_token_permissions);
    let token = token_manager.generate_fresh()?;
    tracing::info!(%host, %port, token_path = %token_manager.token_path().display(), "starting nexus-server");

    let mcp_manager = Arc::new(nexus_core::mcp_manager::McpManager::new(config.mcp_servers.clone()));
    let shared = Arc::new(SharedComponents::new(config_dir.join("logs")).with_mcp_manager(mcp_manager));
    let session_factory: Box<dyn Fn() -> Arc<dyn Session> + Send + Sync> =
        Box::new(|| Arc::new(EchoSession) as Arc<dyn Session>);
    let pool = Arc::new(AgentPool::new(shared, session_factory));
    let global_dispatcher = Arc::new(GlobalDispatcher::new(pool.clone()));

    let http_server = nexus_core::http::HttpServer::new(pool.clone(), global_dispatcher.clone(), Some(token));

    let result = tokio::select! {
        result = http_server.run(&host, port) => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
            global_dispatcher.request_shutdown();
            Ok(())
        }
    };

    token_manager.delete();
    result
}

async fn run_probe(config_dir: PathBuf, host: String, port: u16, timeout_secs: u64) -> anyhow::Result<()> {
    let result = detection::detect_server(&host, port, Duration::from_secs(timeout_secs), &config_dir).await;
    println!("{result:?}");
    Ok(())
}

async fn run_wait_for_server(
    config_dir: PathBuf,
    host: String,
    port: u16,
    timeout_secs: u64,
    poll_interval_ms: u64,
) -> anyhow::Result<()> {
    let found = detection::wait_for_server(
        &host,
        port,
        Duration::from_secs(timeout_secs),
        Duration::from_millis(poll_interval_ms),
        &config_dir,
    )
    .await;
    if found {
        println!("server is up");
        Ok(())
    } else {
        anyhow::bail!("no nexus server detected on {host}:{port} within {timeout_secs}s")
    }
}
