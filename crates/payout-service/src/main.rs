use clap::{Parser, ValueEnum};
use payout_core::StoreConfig;
use payout_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "payoutd", version, about = "Payout fee, audit and withdrawal service")]
struct Cli {
    /// Optional TOML file layered over the built-in defaults.
    #[arg(long, env = "PAYOUT_CONFIG")]
    config: Option<PathBuf>,
    /// REST socket address to bind, e.g. 127.0.0.1:8092. Overrides the config file.
    #[arg(long, env = "PAYOUT_LISTEN")]
    listen: Option<SocketAddr>,
    /// Store backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "PAYOUT_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for transactions, withdrawals, challenges and the journal.
    #[arg(long, env = "PAYOUT_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "PAYOUT_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Log passcodes instead of delivering them. Local runs only.
    #[arg(long, env = "PAYOUT_DEV_PASSCODES")]
    dev_passcodes: bool,
}

fn resolve_storage(cli: &Cli, configured: StoreConfig) -> anyhow::Result<StoreConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StoreConfig::Memory,
        StorageMode::Postgres => match (resolved_url, configured) {
            (Some(database_url), _) => StoreConfig::postgres(database_url, cli.pg_max_connections),
            (None, configured @ StoreConfig::Postgres { .. }) => configured,
            (None, StoreConfig::Memory) => {
                anyhow::bail!("storage=postgres requires --database-url or DATABASE_URL")
            }
        },
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StoreConfig::postgres(database_url, cli.pg_max_connections),
            None => configured,
        },
    };

    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "payout_service=info,payout_core=info,info".to_string()
        }))
        .init();

    let cli = Cli::parse();
    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    config.storage = resolve_storage(&cli, config.storage.clone())?;
    config.dev_passcodes |= cli.dev_passcodes;
    info!(storage = config.storage.label(), "payout-service starting");

    let listen_addr = config.listen_addr;
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("payout-service REST listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
