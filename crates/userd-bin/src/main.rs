//! userd binary entry point.
//!
//! `userd run` starts the outbox dispatcher daemon. The remaining
//! subcommands are thin admin wrappers over the mutation service for
//! operating the store without an API layer in front of it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use userd_core::{init_logging, Config, Paths};
use userd_database::{queries, Database, DeliveryStatus, PoolConfig};
use userd_outbox::{Dispatcher, DispatcherConfig, RedisEventChannel};
use userd_service::{UserInput, UserService};

/// userd command-line interface.
#[derive(Parser)]
#[command(name = "userd")]
#[command(about = "User record service with transactional outbox dispatch")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Base directory for runtime files (config, database, logs). Defaults to ~/.userd
    #[arg(long, global = true, env = "USERD_BASE_DIR")]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the outbox dispatcher
    Run {
        /// Redis connection URL for the event channel
        #[arg(long, env = "USERD_REDIS_URL")]
        redis_url: Option<String>,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "1000")]
        poll_interval_ms: u64,

        /// Maximum entries claimed per pass
        #[arg(long, default_value = "32")]
        batch_size: usize,

        /// Retry ceiling before an entry is dead-lettered
        #[arg(long, default_value = "10")]
        max_attempts: i64,
    },
    /// Create a user
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        age: Option<i64>,
    },
    /// Get a user by id
    Get { id: i64 },
    /// List all users
    List,
    /// Update a user's name, email, and age
    Update {
        id: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        age: Option<i64>,
    },
    /// Delete a user by id
    Delete { id: i64 },
    /// Show outbox delivery counters
    OutboxStatus,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    paths.ensure_dirs()?;
    let config = Config::load(&paths)?;

    let db = Database::open(&paths.database_file(), PoolConfig::default())?;

    match cli.command {
        Commands::Run {
            redis_url,
            poll_interval_ms,
            batch_size,
            max_attempts,
        } => {
            let redis_url = redis_url.unwrap_or(config.redis_url);

            let channel = RedisEventChannel::connect(&redis_url, config.event_stream).await?;
            info!(
                redis_url = %redis_url,
                stream = channel.stream_key(),
                db = db.path(),
                "Configuration loaded"
            );

            let dispatcher_config = DispatcherConfig {
                poll_interval: Duration::from_millis(poll_interval_ms),
                batch_size,
                max_attempts,
                ..DispatcherConfig::default()
            };
            let dispatcher = Dispatcher::new(db, Arc::new(channel), dispatcher_config);

            tokio::select! {
                _ = dispatcher.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, exiting...");
                }
            }
        }
        Commands::Create { name, email, age } => {
            let service = UserService::new(db);
            let user = service.create(UserInput { name, email, age })?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Commands::Get { id } => {
            let service = UserService::new(db);
            let user = service.get(id)?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Commands::List => {
            let service = UserService::new(db);
            let users = service.list()?;
            println!("{}", serde_json::to_string_pretty(&users)?);
        }
        Commands::Update {
            id,
            name,
            email,
            age,
        } => {
            let service = UserService::new(db);
            let user = service.update(id, UserInput { name, email, age })?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Commands::Delete { id } => {
            let service = UserService::new(db);
            let user = service.delete(id)?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Commands::OutboxStatus => {
            let (pending, delivered, dead) = db.with_conn(|conn| {
                Ok((
                    queries::count_outbox_by_status(conn, DeliveryStatus::Pending)?,
                    queries::count_outbox_by_status(conn, DeliveryStatus::Delivered)?,
                    queries::count_outbox_by_status(conn, DeliveryStatus::Dead)?,
                ))
            })?;
            println!(
                "{}",
                serde_json::json!({
                    "pending": pending,
                    "delivered": delivered,
                    "dead": dead,
                })
            );
        }
    }

    Ok(())
}
