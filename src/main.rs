use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

mod api;
mod backend;
mod config;
mod context;
mod device;
mod hardware;
mod lifecycle;
mod pipeline;
mod planner;
mod printer;
mod reconcile;
mod settings;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::config();

    if let Err(e) = std::fs::create_dir_all(config.overlay_dir()) {
        eprintln!("Error creating data directory: {}", e);
        std::process::exit(1);
    }
    log::info!("data directory: {}", config.data_dir().display());

    roost_db::migrations::migrate(config.db_url())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error migrating database: {}", e);
            std::process::exit(1);
        });

    // The processing executable is a hard requirement
    if !hardware::check_ffmpeg_available().await {
        log::error!("ffmpeg not found, cannot continue");
        std::process::exit(1);
    }
    if !hardware::check_v4l2ctl_available().await {
        log::warn!("v4l2-ctl not found, device probing will be degraded");
    }

    let encoders = hardware::detect_encoders().await;

    let db = roost_db::RoostDatabase::open(config.db_url())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error opening database: {}", e);
            std::process::exit(1);
        });

    let backend = backend::BackendClient::new(config.backend_api_base());
    let backend_up = backend.wait_for_available(Duration::from_secs(30)).await;
    if !backend_up {
        log::warn!("streaming backend not reachable, streams will start once it is");
    }

    let telemetry = {
        let client = printer::TelemetryClient::new(config.telemetry_url());
        if client.is_available().await {
            log::info!("printer telemetry found at {}", config.telemetry_url());
            Some(client)
        } else {
            log::warn!("printer telemetry not reachable, overlays and framerate switching disabled");
            None
        }
    };

    let ctx = Arc::new(context::Context::new(db, backend, telemetry, encoders));

    // Reality resync: connection state from a previous run is meaningless
    match ctx.db.connect() {
        Ok(conn) => {
            if let Err(e) = roost_db::camera::reset_connections(&conn).await {
                log::warn!("resetting camera connection state failed: {:#}", e);
            }
        }
        Err(e) => log::warn!("resetting camera connection state failed: {:#}", e),
    }

    if backend_up {
        let removed = reconcile::remove_stale_paths(&ctx).await;
        if removed > 0 {
            log::info!("removed {} stale backend path(s)", removed);
        }
    }

    let cancel = CancellationToken::new();

    api::start_api_server(Arc::clone(&ctx), cancel.clone());

    tokio::spawn(lifecycle::run_print_monitor(
        Arc::clone(&ctx),
        cancel.clone(),
    ));
    tokio::spawn(lifecycle::run_sync_loop(Arc::clone(&ctx), cancel.clone()));

    let (watcher, events) = device::watch::DeviceWatcher::new(
        config.debounce_delay(),
        config.device_poll_interval(),
        cancel.clone(),
    );
    tokio::spawn(lifecycle::run_device_events(Arc::clone(&ctx), events));
    watcher.start();
    watcher.scan_existing().await;

    log::info!("roost is running");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    std::process::exit(0);
}
