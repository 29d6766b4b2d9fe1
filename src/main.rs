//! Thin binary wiring the core together: the full account-management CLI
//! lives elsewhere and talks to these pieces through their library APIs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use caam::config::Config;
use caam::coordinator::{server, AuthRequest, PaneCoordinator};
use caam::health::HealthStore;
use caam::pool::{AuthPool, PoolMonitor};
use caam::provider::FileSet;
use caam::vault::Vault;

const STATE_FLUSH_SECONDS: u64 = 30;

#[derive(Parser, Debug)]
#[command(name = "caam", version, about = "Coding-agent account manager core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the monitor, pane coordinator and local HTTP API
    Daemon {
        /// Override the coordinator API port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the pool summary as JSON
    Status,
    /// Pool maintenance
    Pool {
        #[command(subcommand)]
        command: PoolCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PoolCommands {
    /// Import every vault profile into the pool and save the snapshot
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default tracing subscriber")?;

    let config = Config::load().context("loading config")?;

    match cli.command {
        Commands::Daemon { port } => run_daemon(config, port).await,
        Commands::Status => {
            let pool = AuthPool::new(config.pool.options());
            pool.load(&config.pool.state_path())
                .await
                .context("loading pool state")?;
            println!("{}", serde_json::to_string_pretty(&pool.summary())?);
            Ok(())
        }
        Commands::Pool {
            command: PoolCommands::Sync,
        } => {
            let vault = Vault::new(config.vault.root_path());
            let pool = AuthPool::new(config.pool.options());
            let state_path = config.pool.state_path();
            pool.load(&state_path).await.context("loading pool state")?;
            let seen = pool
                .load_from_vault(&vault)
                .await
                .context("importing vault profiles")?;
            pool.save(&state_path).await.context("saving pool state")?;
            println!("synced {seen} vault profiles into the pool");
            Ok(())
        }
    }
}

async fn run_daemon(config: Config, port: Option<u16>) -> Result<()> {
    let state_path = config.pool.state_path();
    let vault = Vault::new(config.vault.root_path());

    let pool = Arc::new(AuthPool::new(config.pool.options()));
    pool.load(&state_path).await.context("loading pool state")?;
    pool.load_from_vault(&vault)
        .await
        .context("importing vault profiles")?;

    let monitor = Arc::new(PoolMonitor::new(
        Arc::clone(&pool),
        config.monitor.monitor_config(),
    ));
    monitor.start().context("starting monitor")?;

    let health = Arc::new(
        HealthStore::open(config.health.path(), config.health.half_life())
            .context("opening health store")?,
    );

    let client = caam::pane::connect(config.coordinator.backend)
        .await
        .context("selecting pane backend")?;

    // Every captured auth URL means the active profile just hit a limit:
    // penalize it so rotation steers away until the penalty decays.
    let on_auth_request = {
        let health = Arc::clone(&health);
        let vault_root = config.vault.root_path();
        Arc::new(move |request: AuthRequest| {
            let Some(provider) = request.provider else {
                return;
            };
            let health = Arc::clone(&health);
            let vault = Vault::new(vault_root.clone());
            tokio::spawn(async move {
                let set = FileSet::for_provider(provider);
                match vault.active_profile(&set).await {
                    Ok(Some(profile)) => {
                        if let Err(e) = health.record_rate_limit(provider, &profile, None) {
                            tracing::warn!(error = %e, "Recording rate limit failed");
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(provider = %provider, "Rate limit on unrecognized profile");
                    }
                    Err(e) => tracing::warn!(error = %e, "Active-profile lookup failed"),
                }
            });
        }) as Arc<dyn Fn(AuthRequest) + Send + Sync>
    };

    let coordinator = Arc::new(
        PaneCoordinator::new(client, config.coordinator.coordinator_config())
            .on_auth_request(on_auth_request),
    );
    coordinator.start().context("starting coordinator")?;

    let http_port = port.unwrap_or(config.coordinator.http_port);
    let api = tokio::spawn(server::serve(Arc::clone(&coordinator), http_port));

    let flusher = {
        let pool = Arc::clone(&pool);
        let state_path = state_path.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(STATE_FLUSH_SECONDS));
            loop {
                interval.tick().await;
                if let Err(e) = pool.save(&state_path).await {
                    tracing::warn!(error = %e, "Periodic state flush failed");
                }
            }
        })
    };

    println!("caam daemon started");
    println!("   API:     http://127.0.0.1:{http_port}");
    println!("   Backend: {}", coordinator.backend());
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    coordinator.stop();
    monitor.stop();
    api.abort();
    flusher.abort();
    pool.save(&state_path)
        .await
        .context("saving pool state on shutdown")?;

    Ok(())
}
