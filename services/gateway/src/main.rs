use gateway::config::{DEFAULT_CONFIG_PATH, load_config_from_path};
use gateway::guard::AbuseGuard;
use gateway::handler::HandlerContext;
use gateway::http::{self, ApiState};
use gateway::listener::Listener;
use gateway::session::SessionTable;
use gateway::sink::StorageWorker;
use gateway::storage::FixStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");

    // Parse optional --config <path> argument.
    let args: Vec<String> = std::env::args().collect();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) => match args.get(i + 1) {
            Some(p) => PathBuf::from(p),
            None => {
                eprintln!("FATAL: --config requires a path argument");
                std::process::exit(1);
            }
        },
        None => PathBuf::from(DEFAULT_CONFIG_PATH),
    };

    let cfg = match load_config_from_path(&config_path) {
        Ok(cfg) => {
            info!(
                path = %config_path.display(),
                tcp_enabled = cfg.tcp.enabled,
                http_enabled = cfg.http.enabled,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let store = match FixStore::open(Path::new(&cfg.storage.sqlite_path)) {
        Ok(store) => {
            info!(path = %cfg.storage.sqlite_path, "fix store opened");
            store.into_shared()
        }
        Err(e) => {
            eprintln!("FATAL: failed to open fix store: {}", e);
            std::process::exit(1);
        }
    };

    let (storage, worker) = StorageWorker::new(store.clone(), cfg.storage.queue_depth);
    let worker_task = worker.spawn();

    let sessions = SessionTable::new();
    let guard = AbuseGuard::new(cfg.guard);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener_task = if cfg.tcp.enabled {
        let ctx = HandlerContext::new(sessions.clone(), guard.clone(), Arc::new(storage));
        match Listener::bind(&cfg.tcp, ctx).await {
            Ok(listener) => Some(tokio::spawn(listener.run(shutdown_rx.clone()))),
            Err(e) => {
                eprintln!("FATAL: failed to start tracker listener: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        info!("tracker listener disabled");
        drop(storage);
        None
    };

    if cfg.http.enabled {
        if cfg.http.api_keys.is_empty() {
            tracing::warn!("no API keys configured; every /api request will be rejected");
        }
        let state = ApiState::new(store.clone(), cfg.http.api_keys.clone());
        let mut rx = shutdown_rx.clone();
        let shutdown = async move {
            let _ = rx.wait_for(|stop| *stop).await;
        };
        if let Err(e) = http::serve(&cfg.http.bind, state, shutdown).await {
            eprintln!("FATAL: failed to start query API on {}: {}", cfg.http.bind, e);
            std::process::exit(1);
        }
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Some(task) = listener_task {
        let _ = task.await;
    }
    // Handlers still holding a storage handle keep the worker alive; do not
    // wait on it past the listener.
    worker_task.abort();
    info!("gateway stopped");
}
