use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chatfabric::config::ServerConfig;
use chatfabric::engine::chat_engine::ChatEngine;
use chatfabric::engine::notifier::spawn_server_notifications;
use chatfabric::store::{ListStore, MemoryStore, PubSub, RedisStore};
use chatfabric::web::app_state::AppState;
use chatfabric::web::router::build_router;

#[derive(Parser, Debug)]
#[command(name = "chatfabric-server", version, about = "Horizontally scalable chat relay")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "chatfabric.toml")]
    config: PathBuf,

    /// Number of instances to run in this process (overrides the config file).
    #[arg(short, long)]
    instances: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(&args.config)?;
    if let Some(instances) = args.instances {
        config.server.instances = instances;
        config.validate()?;
    }

    let base_addr: SocketAddr = config
        .server
        .web_address
        .parse()
        .with_context(|| format!("invalid web_address {}", config.server.web_address))?;

    match config.bus.store_url.clone() {
        Some(url) => {
            let store = RedisStore::open(&url).context("invalid bus.store_url")?;
            info!("using redis as the shared store");
            serve_instances(&config, base_addr, Arc::new(store)).await
        }
        None => {
            // Instances in this process share one in-memory store; nothing
            // outside the process can join them.
            info!("no bus.store_url set, using an in-process store");
            serve_instances(&config, base_addr, Arc::new(MemoryStore::new())).await
        }
    }
}

/// Run `server.instances` engines on consecutive ports until Ctrl-C.
async fn serve_instances<S>(
    config: &ServerConfig,
    base_addr: SocketAddr,
    store: Arc<S>,
) -> anyhow::Result<()>
where
    S: PubSub + ListStore + 'static,
{
    let shutdown = CancellationToken::new();
    let mut engines = Vec::new();
    let mut tasks = Vec::new();

    for index in 0..config.server.instances {
        let name = if config.server.instances == 1 {
            config.server.instance_name.clone()
        } else {
            format!("{}-{}", config.server.instance_name, index + 1)
        };

        let engine = Arc::new(ChatEngine::new(name.clone(), config, store.clone()));
        engine.start().await?;

        if let Some(notifier) = spawn_server_notifications(
            engine.clone(),
            config.chat.notification_interval(),
            config.chat.notifications_enabled,
            shutdown.clone(),
        ) {
            tasks.push(notifier);
        }

        let port = base_addr
            .port()
            .checked_add(index as u16)
            .context("instance port out of range")?;
        let addr = SocketAddr::new(base_addr.ip(), port);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        let app = build_router(Arc::new(AppState {
            engine: engine.clone(),
        }));
        let cancel = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            info!(instance = %name, %addr, "instance listening");
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
            {
                error!(instance = %name, error = %e, "server error");
            }
        }));

        engines.push(engine);
    }

    info!(
        instances = engines.len(),
        max_history = config.chat.max_history_messages,
        queue_capacity = config.bus.queue_capacity,
        "chatfabric started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "task ended abnormally");
        }
    }
    for engine in &engines {
        engine.shutdown().await;
    }

    info!("chatfabric stopped");
    Ok(())
}
