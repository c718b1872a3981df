use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

use mcpcache::config::{read_credential, ProxyConfig};
use mcpcache::{CallCache, ProxyServer, UpstreamClient, UpstreamConfig};

/// Caching network proxy for Model Context Protocol tool servers
///
/// Spawns the given tool-server command as a subprocess and exposes it over
/// a resumable WebSocket transport, memoizing tool invocations.
#[derive(Parser, Debug)]
#[command(name = "mcpcache")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen host
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listen port (falls back to the PORT environment variable, then 8080)
    #[arg(short, long)]
    port: Option<u16>,

    /// Environment variable holding the upstream API credential
    #[arg(long, default_value = "MCP_API_KEY")]
    credential_env: String,

    /// Flag under which the credential is passed to the upstream command
    #[arg(long, default_value = "--api-key")]
    credential_flag: String,

    /// Upstream request timeout in seconds
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,

    /// How long a disconnected session stays resumable, in seconds
    #[arg(long, default_value_t = 300)]
    session_retention_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Upstream tool-server command and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn setup_logging(log_level: &str, log_file: Option<PathBuf>) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true);

    if let Some(log_path) = log_file {
        let file = std::fs::File::create(log_path)?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, args.log_file.clone())?;

    info!("Starting mcpcache v{}", env!("CARGO_PKG_VERSION"));

    // Validate the credential before anything else is attempted
    let credential = match read_credential(&args.credential_env) {
        Ok(credential) => credential,
        Err(e) => {
            eprintln!("{}", e);
            return Err(e.into());
        }
    };

    let (program, command_args) = match args.command.split_first() {
        Some((first, rest)) => (first.clone(), rest.to_vec()),
        None => {
            eprintln!("Missing upstream tool-server command");
            std::process::exit(2);
        }
    };

    let upstream_config = UpstreamConfig {
        program,
        args: command_args,
        credential_flag: args.credential_flag.clone(),
        credential,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
    };

    let upstream = match UpstreamClient::connect(upstream_config).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to connect to upstream tool server: {}", e);
            return Err(e.into());
        }
    };

    let config = ProxyConfig {
        host: args.host.clone(),
        port: ProxyConfig::resolve_port(args.port),
        session_retention: Duration::from_secs(args.session_retention_secs),
    };

    let cache = Arc::new(CallCache::new());
    let server = ProxyServer::bind(&config, upstream, cache).await?;

    info!("Proxy ready on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    server.close().await;

    Ok(())
}
