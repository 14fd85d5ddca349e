use clap::Parser;
use cloudide_relay::{RelayServer, ServerConfig};

/// Collaborative editing relay for CloudIDE+.
#[derive(Debug, Parser)]
#[command(name = "cloudide-relay", version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "RELAY_BIND_ADDR", default_value = "127.0.0.1:5000")]
    bind: String,

    /// Origins allowed to connect, comma separated (empty = any)
    #[arg(long = "allowed-origin", env = "FRONTEND_URL", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Maximum participants per session
    #[arg(long, env = "RELAY_MAX_PARTICIPANTS", default_value_t = 100)]
    max_participants: usize,

    /// Largest accepted WebSocket message in bytes
    #[arg(long, env = "RELAY_MAX_MESSAGE_BYTES", default_value_t = 10 * 1024 * 1024)]
    max_message_bytes: usize,

    /// Seconds open connections get to close on shutdown
    #[arg(long, env = "RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    shutdown_grace_secs: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: args.bind,
            allowed_origins: args
                .allowed_origins
                .into_iter()
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            max_participants_per_session: args.max_participants,
            max_message_bytes: args.max_message_bytes,
            shutdown_grace_secs: args.shutdown_grace_secs,
            ..Self::default()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl+C"),
        _ = terminate => log::info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    if config.allowed_origins.is_empty() {
        log::warn!("No allowed origins configured, accepting WebSocket handshakes from any origin");
    }

    let server = RelayServer::new(config);
    log::info!("Starting cloudide-relay on {}", server.bind_addr());

    if let Err(e) = server.run_until(shutdown_signal()).await {
        log::error!("Relay server failed: {e}");
        std::process::exit(1);
    }

    let stats = server.stats().await;
    log::info!(
        "Relay stopped: {} connections served, {} changes relayed",
        stats.total_connections,
        stats.changes_relayed
    );
}
