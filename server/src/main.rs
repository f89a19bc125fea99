use clap::Parser;
use log::{error, info, warn};
use server::config::ServerConfig;
use server::context::SyncContext;
use server::network::Server;
use server::persistence::{FileSnapshotStore, PersistenceBridge, RetryPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, restores persisted sessions and runs the sync server.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "3000")]
        port: u16,
        /// Maximum number of players per game
        #[clap(short, long, default_value_t = shared::DEFAULT_MAX_PLAYERS)]
        max_players: usize,
        /// Meeples per player in every new game
        #[clap(long, default_value_t = shared::DEFAULT_MEEPLES)]
        meeples: u32,
        /// Name given to games started without one
        #[clap(long, default_value = shared::DEFAULT_GAME_NAME)]
        game_name: String,
        /// Time a probed user gets to answer, in milliseconds
        #[clap(long, default_value = "3000")]
        probe_interval_ms: u64,
        /// Directory for game snapshots; persistence is off when omitted
        #[clap(short, long)]
        data_dir: Option<PathBuf>,
        /// Write attempts per snapshot before giving up
        #[clap(long, default_value = "3")]
        sync_attempts: u32,
        /// Delay before retrying a failed snapshot write, in milliseconds
        #[clap(long, default_value = "200")]
        sync_backoff_ms: u64,
    }

    let args = Args::parse();

    let config = ServerConfig {
        max_players: args.max_players.max(1),
        meeples: args.meeples,
        default_game_name: args.game_name,
        probe_interval: Duration::from_millis(args.probe_interval_ms),
        data_dir: args.data_dir,
        retry: RetryPolicy {
            attempts: args.sync_attempts.max(1),
            backoff: Duration::from_millis(args.sync_backoff_ms),
        },
    };

    let (context, failures) = match &config.data_dir {
        Some(dir) => {
            let store = FileSnapshotStore::new(dir)?;
            let restored = store.load_all().unwrap_or_else(|e| {
                warn!("Could not read {}, starting empty: {}", store.dir().display(), e);
                Vec::new()
            });
            info!("Persisting games to {}", store.dir().display());

            let (bridge, failures) = PersistenceBridge::spawn(Arc::new(store), config.retry);
            let mut context = SyncContext::new(&config, bridge);
            context.restore_sessions(restored);
            (context, Some(failures))
        }
        None => {
            warn!("No data directory given, games will not be persisted");
            (SyncContext::new(&config, PersistenceBridge::disabled()), None)
        }
    };

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::bind(&address, context, failures).await?;

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
