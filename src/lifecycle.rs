use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use roost_db::camera::CameraRecord;

use crate::config::config;
use crate::context::Context;
use crate::device::watch::DeviceEvent;
use crate::device::{DeviceInfo, control, probe};
use crate::hardware::estimate_capability;
use crate::printer::{Hysteresis, PrintState, Transition, overlay_path, render_overlay};
use crate::reconcile;

/// Consume device watcher events until the channel closes.
pub async fn run_device_events(ctx: Arc<Context>, mut events: mpsc::Receiver<DeviceEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DeviceEvent::Connected(device) => {
                if let Err(e) = on_connect(&ctx, &device).await {
                    log::error!("handling connect of {}: {:#}", device.path, e);
                }
            }
            DeviceEvent::Disconnected { path } => {
                if let Err(e) = on_disconnect(&ctx, &path).await {
                    log::error!("handling disconnect of {}: {:#}", path, e);
                }
            }
            DeviceEvent::Rejected(rejection) => {
                log::warn!(
                    "camera rejected at {}: {} ({})",
                    rejection.path,
                    rejection.hardware_id,
                    rejection.reason
                );
                ctx.record_rejection(rejection).await;
            }
        }
    }
}

async fn on_connect(ctx: &Context, device: &DeviceInfo) -> anyhow::Result<()> {
    log::info!("camera connected: {} at {}", device.hardware_name, device.path);
    let conn = ctx.db.connect()?;

    if roost_db::camera::is_ignored(&device.hardware_id, &conn).await? {
        log::info!("camera {} is ignored, skipping", device.hardware_id);
        return Ok(());
    }

    // Capture hardware default control values while the device is idle;
    // the pipeline's one-shot control push is reduced against these.
    let controls = control::list_controls(&device.path).await;
    {
        let defaults = controls
            .iter()
            .map(|c| (c.name.clone(), c.default))
            .collect();
        let mut map = ctx.control_defaults.write().await;
        map.insert(device.path.clone(), defaults);
    }

    let capabilities = probe::probe_capabilities(&device.path).await;

    let record = match roost_db::camera::by_hardware_id(&device.hardware_id, &conn).await? {
        Some(mut record) => {
            record.connected = true;
            record.device_path = Some(device.path.clone());
            if !capabilities.is_empty() {
                record.capabilities = capabilities;
            }
            roost_db::camera::update(&record, &conn).await?;
            log::info!("reconnected known camera: {}", record.friendly_name);
            record
        }
        None => {
            let active_count = roost_db::camera::query_all(&conn)
                .await?
                .iter()
                .filter(|c| c.connected)
                .count();

            let rating = estimate_capability(&ctx.encoders);
            let settings = crate::planner::plan(
                &capabilities,
                rating,
                active_count + 1,
                ctx.encoders.best(),
            );

            let mut record =
                CameraRecord::new(&device.hardware_name, device.serial_number.as_deref(), &device.path);
            record.settings = settings;
            record.capabilities = capabilities;
            roost_db::camera::insert(&record, &conn).await?;
            log::info!("created camera record {} for {}", record.id, record.hardware_id);
            record
        }
    };

    if !record.enabled {
        log::info!("camera {} is disabled, not starting a stream", record.friendly_name);
        return Ok(());
    }

    if record.settings.overlay.is_some() {
        write_overlay_for(ctx, &record).await;
    }

    let Some(command) = reconcile::build_command(ctx, &record).await else {
        return Ok(());
    };
    reconcile::add_or_update_stream(ctx, &reconcile::stream_name(&record.id), &command).await?;
    log::info!("stream running for camera {}", record.friendly_name);
    Ok(())
}

async fn on_disconnect(ctx: &Context, path: &str) -> anyhow::Result<()> {
    log::info!("camera disconnected: {}", path);

    {
        let mut defaults = ctx.control_defaults.write().await;
        defaults.remove(path);
    }

    let conn = ctx.db.connect()?;
    let Some(record) = roost_db::camera::by_device_path(path, &conn).await? else {
        log::debug!("no camera record bound to {}", path);
        return Ok(());
    };

    roost_db::camera::mark_disconnected(&record.hardware_id, &conn).await?;
    reconcile::remove_stream(ctx, &reconcile::stream_name(&record.id)).await?;
    Ok(())
}

/// Confirmed printer state transition: rebuild the pipeline for every
/// connected, enabled camera that defines a distinct framerate for the
/// new state. The command changed, so the reconciler force-restarts.
pub async fn on_print_state_change(ctx: &Context, transition: Transition) {
    log::info!(
        "print state changed: {:?} -> {:?}",
        transition.from,
        transition.to
    );

    let conn = match ctx.db.connect() {
        Ok(conn) => conn,
        Err(e) => {
            log::error!("state change: db connect failed: {:#}", e);
            return;
        }
    };
    let records = match roost_db::camera::query_all(&conn).await {
        Ok(records) => records,
        Err(e) => {
            log::error!("state change: loading cameras failed: {:#}", e);
            return;
        }
    };

    for record in records {
        if !record.connected || !record.enabled {
            continue;
        }
        if record.settings.printing_framerate.is_none()
            && record.settings.standby_framerate.is_none()
        {
            continue;
        }
        let Some(command) = reconcile::build_command(ctx, &record).await else {
            continue;
        };
        let name = reconcile::stream_name(&record.id);
        if let Err(e) = reconcile::add_or_update_stream(ctx, &name, &command).await {
            // Isolated: the next camera still gets its switch
            log::error!("framerate switch for {} failed: {:#}", record.friendly_name, e);
        }
    }
}

/// Printer telemetry loop: poll, drive the hysteresis machine, refresh
/// overlay files. Poll cadence is short while printing, long on standby.
pub async fn run_print_monitor(ctx: Arc<Context>, cancel: CancellationToken) {
    let Some(telemetry) = ctx.telemetry.as_ref() else {
        log::info!("no telemetry endpoint, print monitoring disabled");
        return;
    };
    let mut machine = Hysteresis::new(config().standby_delay());

    loop {
        match telemetry.poll_status().await {
            Ok(status) => {
                let active = status.is_active();
                {
                    let mut snapshot = ctx.print_state.write().await;
                    snapshot.status = status;
                }
                if let Some(transition) = machine.observe(active, Instant::now()) {
                    {
                        let mut snapshot = ctx.print_state.write().await;
                        snapshot.state = transition.to;
                    }
                    on_print_state_change(&ctx, transition).await;
                }
                write_overlays(&ctx).await;
            }
            Err(e) => {
                // Transient: retried on the next poll
                log::debug!("telemetry poll failed: {:#}", e);
            }
        }

        let interval = match machine.state() {
            PrintState::Printing => config().printing_poll_interval(),
            PrintState::Standby => config().standby_poll_interval(),
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Refresh the overlay text file of every connected camera that renders
/// one.
async fn write_overlays(ctx: &Context) {
    let conn = match ctx.db.connect() {
        Ok(conn) => conn,
        Err(_) => return,
    };
    let Ok(records) = roost_db::camera::query_all(&conn).await else {
        return;
    };
    for record in records {
        if record.connected && record.enabled && record.settings.overlay.is_some() {
            write_overlay_for(ctx, &record).await;
        }
    }
}

async fn write_overlay_for(ctx: &Context, record: &CameraRecord) {
    let Some(overlay) = record.settings.overlay.as_ref() else {
        return;
    };
    let snapshot = ctx.print_snapshot().await;
    let text = render_overlay(&snapshot.status, overlay);
    let path = overlay_path(&config().overlay_dir(), &record.id);
    if let Err(e) = tokio::fs::write(&path, text).await {
        log::error!("writing overlay {}: {:#}", path.display(), e);
    }
}

/// Periodic drift correction against the streaming backend.
pub async fn run_sync_loop(ctx: Arc<Context>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(config().sync_interval()) => {}
        }
        let report = reconcile::sync_cycle(&ctx).await;
        for error in report.errors.iter().take(3) {
            log::warn!("sync: {}", error);
        }
    }
}
