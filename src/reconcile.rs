use std::time::Duration;

use serde::Serialize;

use roost_db::camera::{CameraRecord, CameraSettings};

use crate::backend::{ConfiguredPath, PathConfig};
use crate::context::Context;
use crate::pipeline::{PipelineSpec, control_deltas};
use crate::settings::{
    SettingsOverride, ValidationRejection, effective_settings, validate_against_capabilities,
};

/// Pause between delete and re-create on a force restart, giving the
/// backend time to reap the old publisher process.
const RESTART_GAP: Duration = Duration::from_millis(300);

/// Project a camera id onto its backend path name. Pure and stable:
/// the same camera always maps to the same path.
pub fn stream_name(camera_id: &str) -> String {
    camera_id.replace(' ', "_").to_lowercase()
}

/// Whether a backend path name is one of ours. Camera ids are UUIDs, so
/// any path that parses as one is managed by this daemon; everything else
/// is never touched.
pub fn is_managed_path(name: &str) -> bool {
    uuid::Uuid::parse_str(name).is_ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesiredStream {
    pub name: String,
    /// `None` means the path must not exist (camera disabled or device
    /// absent).
    pub command: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamAction {
    Create { name: String, command: String },
    ForceRestart { name: String, command: String },
    Delete { name: String },
}

impl StreamAction {
    pub fn name(&self) -> &str {
        match self {
            StreamAction::Create { name, .. }
            | StreamAction::ForceRestart { name, .. }
            | StreamAction::Delete { name } => name,
        }
    }
}

/// Compare desired state against the backend's actual paths and produce
/// the corrective actions. A force restart is planned only when the
/// configured command differs from the one we want; matching paths are
/// left alone.
pub fn plan_actions(desired: &[DesiredStream], actual: &[ConfiguredPath]) -> Vec<StreamAction> {
    let mut actions = Vec::new();

    for want in desired {
        let current = actual.iter().find(|p| p.name == want.name);
        match (&want.command, current) {
            (Some(command), None) => actions.push(StreamAction::Create {
                name: want.name.clone(),
                command: command.clone(),
            }),
            (Some(command), Some(path)) => {
                if path.run_on_init.as_deref() != Some(command.as_str()) {
                    actions.push(StreamAction::ForceRestart {
                        name: want.name.clone(),
                        command: command.clone(),
                    });
                }
            }
            (None, Some(_)) => actions.push(StreamAction::Delete {
                name: want.name.clone(),
            }),
            (None, None) => {}
        }
    }

    // Orphans: managed-looking paths nobody wants anymore
    for path in actual {
        if is_managed_path(&path.name) && !desired.iter().any(|d| d.name == path.name) {
            actions.push(StreamAction::Delete {
                name: path.name.clone(),
            });
        }
    }

    actions
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncReport {
    pub checked: usize,
    pub created: usize,
    pub restarted: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn corrections(&self) -> u64 {
        (self.created + self.restarted + self.removed) as u64
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncStats {
    pub cycles: u64,
    pub corrections: u64,
    pub failed_cycles: u64,
}

/// Apply printer-state framerate selection to a settings value. Only
/// cameras that define a distinct framerate for the state change at all.
pub fn settings_for_state(settings: &CameraSettings, printing: bool) -> CameraSettings {
    let mut adjusted = settings.clone();
    let target = if printing {
        settings.printing_framerate
    } else {
        settings.standby_framerate
    };
    if let Some(framerate) = target {
        adjusted.framerate = framerate;
    }
    adjusted
}

/// Resolve the settings the pipeline builder sees for this record right
/// now: persisted, adjusted for print state, then the override on top.
pub async fn resolved_settings(ctx: &Context, record: &CameraRecord) -> CameraSettings {
    let printing = ctx.is_printing().await;
    let base = settings_for_state(&record.settings, printing);
    let overrides = ctx.overrides.read().await;
    effective_settings(&base, overrides.get(&record.id))
}

/// Build the pipeline command for a connected camera from its resolved
/// settings.
pub async fn build_command(ctx: &Context, record: &CameraRecord) -> Option<String> {
    let device_path = record.device_path.clone()?;
    let settings = resolved_settings(ctx, record).await;
    let name = stream_name(&record.id);

    let overlay_file = settings.overlay.as_ref().map(|_| {
        crate::printer::overlay_path(&crate::config::config().overlay_dir(), &record.id)
            .to_string_lossy()
            .into_owned()
    });

    let defaults = ctx.control_defaults.read().await;
    let deltas = match defaults.get(&device_path) {
        Some(defaults) => control_deltas(&settings.controls, defaults),
        None => settings.controls.clone(),
    };

    let spec = PipelineSpec {
        device_path: &device_path,
        stream_name: &name,
        settings: &settings,
        overlay_path: overlay_file.as_deref(),
        controls: &deltas,
        rtsp_port: crate::config::config().rtsp_port(),
    };
    Some(spec.command())
}

/// Load desired state fresh from the store. Always called at apply time so
/// reconciliation never works from a stale snapshot.
async fn desired_streams(ctx: &Context) -> anyhow::Result<Vec<DesiredStream>> {
    let conn = ctx.db.connect()?;
    let records = roost_db::camera::query_all(&conn).await?;

    let mut desired = Vec::with_capacity(records.len());
    for record in records {
        let name = stream_name(&record.id);
        let command = if record.enabled && record.connected {
            build_command(ctx, &record).await
        } else {
            None
        };
        desired.push(DesiredStream { name, command });
    }
    Ok(desired)
}

/// One drift-correction cycle: reload desired state, diff against the
/// backend, apply corrections. Per-path failures are isolated; one
/// camera's failure never blocks the rest of the cycle.
pub async fn sync_cycle(ctx: &Context) -> SyncReport {
    let mut report = SyncReport::default();

    let desired = match desired_streams(ctx).await {
        Ok(desired) => desired,
        Err(e) => {
            report.errors.push(format!("loading desired state: {:#}", e));
            record_stats(ctx, &report).await;
            return report;
        }
    };
    report.checked = desired.len();

    let actual = match ctx.backend.list_paths().await {
        Ok(actual) => actual,
        Err(e) => {
            // Transient: retried on the next cycle
            report.errors.push(format!("listing backend paths: {:#}", e));
            record_stats(ctx, &report).await;
            return report;
        }
    };

    for action in plan_actions(&desired, &actual) {
        let name = action.name().to_string();
        match apply_action(ctx, &action).await {
            Ok(()) => match action {
                StreamAction::Create { .. } => report.created += 1,
                StreamAction::ForceRestart { .. } => report.restarted += 1,
                StreamAction::Delete { .. } => report.removed += 1,
            },
            Err(e) => {
                log::warn!("sync: {} failed: {:#}", name, e);
                report.errors.push(format!("{}: {:#}", name, e));
            }
        }
    }

    if report.corrections() > 0 {
        log::info!(
            "sync: created {}, restarted {}, removed {}",
            report.created,
            report.restarted,
            report.removed
        );
    }
    record_stats(ctx, &report).await;
    report
}

async fn record_stats(ctx: &Context, report: &SyncReport) {
    let mut stats = ctx.sync_stats.lock().await;
    stats.cycles += 1;
    stats.corrections += report.corrections();
    if !report.errors.is_empty() {
        stats.failed_cycles += 1;
    }
}

async fn apply_action(ctx: &Context, action: &StreamAction) -> anyhow::Result<()> {
    match action {
        StreamAction::Create { name, command } => {
            ctx.backend
                .add_path(&PathConfig::publisher(name, command))
                .await
        }
        StreamAction::ForceRestart { name, command } => {
            force_restart(ctx, name, command).await
        }
        StreamAction::Delete { name } => ctx.backend.delete_path(name).await,
    }
}

/// Delete-then-recreate. Guarantees the new pipeline command takes effect
/// at the cost of a brief service gap.
async fn force_restart(ctx: &Context, name: &str, command: &str) -> anyhow::Result<()> {
    ctx.backend.delete_path(name).await?;
    tokio::time::sleep(RESTART_GAP).await;
    ctx.backend
        .add_path(&PathConfig::publisher(name, command))
        .await
}

/// Idempotent create-or-update for one stream. Force restart only when
/// the generated command changed; a matching command gets a soft update
/// that reasserts path metadata without restarting the running process.
pub async fn add_or_update_stream(ctx: &Context, name: &str, command: &str) -> anyhow::Result<()> {
    let existing = ctx
        .backend
        .list_paths()
        .await?
        .into_iter()
        .find(|p| p.name == name);

    let config = PathConfig::publisher(name, command);
    match existing {
        None => ctx.backend.add_path(&config).await,
        Some(path) if path.run_on_init.as_deref() == Some(command) => {
            ctx.backend.patch_path(&config).await
        }
        Some(_) => force_restart(ctx, name, command).await,
    }
}

pub async fn remove_stream(ctx: &Context, name: &str) -> anyhow::Result<()> {
    ctx.backend.delete_path(name).await
}

/// Startup cleanup: drop every managed-looking path left over from a
/// previous run. The first sync cycle rebuilds what should exist.
pub async fn remove_stale_paths(ctx: &Context) -> usize {
    let paths = match ctx.backend.list_paths().await {
        Ok(paths) => paths,
        Err(e) => {
            log::warn!("could not list backend paths for cleanup: {:#}", e);
            return 0;
        }
    };
    let mut removed = 0;
    for path in paths {
        if is_managed_path(&path.name) {
            match ctx.backend.delete_path(&path.name).await {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("cleanup of {} failed: {:#}", path.name, e),
            }
        }
    }
    removed
}

// ------------------------------------------------------------------------
// Override layer
// ------------------------------------------------------------------------

#[derive(Debug)]
pub enum OverrideError {
    CameraNotFound,
    Rejected(ValidationRejection),
    Internal(anyhow::Error),
}

impl std::fmt::Display for OverrideError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverrideError::CameraNotFound => write!(f, "camera not found"),
            OverrideError::Rejected(rejection) => write!(f, "{}", rejection),
            OverrideError::Internal(e) => write!(f, "{:#}", e),
        }
    }
}

impl From<anyhow::Error> for OverrideError {
    fn from(e: anyhow::Error) -> Self {
        OverrideError::Internal(e)
    }
}

/// Set a transient override for a camera. The combined settings are
/// validated against the cached capabilities unless `validate` is false;
/// a rejection carries concrete valid alternatives. On success one
/// immediate reconciliation runs.
pub async fn set_override(
    ctx: &Context,
    camera_id: &str,
    patch: SettingsOverride,
    validate: bool,
) -> Result<SyncReport, OverrideError> {
    let conn = ctx.db.connect().map_err(OverrideError::Internal)?;
    let record = roost_db::camera::by_id(camera_id, &conn)
        .await
        .map_err(OverrideError::Internal)?
        .ok_or(OverrideError::CameraNotFound)?;

    if validate {
        let candidate = effective_settings(&record.settings, Some(&patch));
        validate_against_capabilities(&candidate, &record.capabilities)
            .map_err(OverrideError::Rejected)?;
    }

    {
        let mut overrides = ctx.overrides.write().await;
        overrides.insert(camera_id.to_string(), patch);
    }
    log::info!("override set for camera {}", camera_id);
    Ok(sync_cycle(ctx).await)
}

/// Clear a camera's override and reconcile back to persisted settings.
/// Returns `None` when no override was set.
pub async fn clear_override(ctx: &Context, camera_id: &str) -> Option<SyncReport> {
    let had_override = {
        let mut overrides = ctx.overrides.write().await;
        overrides.remove(camera_id).is_some()
    };
    if !had_override {
        return None;
    }
    log::info!("override cleared for camera {}", camera_id);
    Some(sync_cycle(ctx).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(name: &str, command: Option<&str>) -> ConfiguredPath {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "runOnInit": command,
        }))
        .unwrap()
    }

    const CAM_A: &str = "7c9a1e0c-63d1-4c55-9c3b-0d2f8a3d9b10";
    const CAM_B: &str = "f2b6d9e4-1c3a-4a88-b7a1-5e6f7a8b9c0d";
    const ORPHAN: &str = "0a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c4d";

    #[test]
    fn test_stream_name_projection() {
        assert_eq!(stream_name("Front Door Cam"), "front_door_cam");
        assert_eq!(stream_name(CAM_A), CAM_A);
        // Pure and stable
        assert_eq!(stream_name("A b"), stream_name("A b"));
    }

    #[test]
    fn test_managed_path_pattern() {
        assert!(is_managed_path(CAM_A));
        assert!(!is_managed_path("webrtc_publisher"));
        assert!(!is_managed_path("cam_1"));
        assert!(!is_managed_path(""));
    }

    #[test]
    fn test_plan_creates_missing_stream() {
        let desired = vec![DesiredStream {
            name: CAM_A.to_string(),
            command: Some("ffmpeg -a".to_string()),
        }];
        let actions = plan_actions(&desired, &[]);
        assert_eq!(
            actions,
            vec![StreamAction::Create {
                name: CAM_A.to_string(),
                command: "ffmpeg -a".to_string()
            }]
        );
    }

    #[test]
    fn test_plan_leaves_matching_stream_alone() {
        let desired = vec![DesiredStream {
            name: CAM_A.to_string(),
            command: Some("ffmpeg -a".to_string()),
        }];
        let actual = vec![path(CAM_A, Some("ffmpeg -a"))];
        assert!(plan_actions(&desired, &actual).is_empty());
    }

    #[test]
    fn test_plan_force_restarts_on_command_change() {
        let desired = vec![DesiredStream {
            name: CAM_A.to_string(),
            command: Some("ffmpeg -new".to_string()),
        }];
        let actual = vec![path(CAM_A, Some("ffmpeg -old"))];
        assert_eq!(
            plan_actions(&desired, &actual),
            vec![StreamAction::ForceRestart {
                name: CAM_A.to_string(),
                command: "ffmpeg -new".to_string()
            }]
        );
    }

    #[test]
    fn test_plan_removes_disabled_camera_path() {
        let desired = vec![DesiredStream {
            name: CAM_A.to_string(),
            command: None,
        }];
        let actual = vec![path(CAM_A, Some("ffmpeg -a"))];
        assert_eq!(
            plan_actions(&desired, &actual),
            vec![StreamAction::Delete {
                name: CAM_A.to_string()
            }]
        );
    }

    #[test]
    fn test_plan_removes_only_the_orphan() {
        // Two desired cameras in sync, one orphaned managed path, one
        // foreign path: exactly the orphan is removed
        let desired = vec![
            DesiredStream {
                name: CAM_A.to_string(),
                command: Some("ffmpeg -a".to_string()),
            },
            DesiredStream {
                name: CAM_B.to_string(),
                command: Some("ffmpeg -b".to_string()),
            },
        ];
        let actual = vec![
            path(CAM_A, Some("ffmpeg -a")),
            path(CAM_B, Some("ffmpeg -b")),
            path(ORPHAN, Some("ffmpeg -old")),
            path("external_relay", Some("gst-launch")),
        ];

        let actions = plan_actions(&desired, &actual);
        assert_eq!(
            actions,
            vec![StreamAction::Delete {
                name: ORPHAN.to_string()
            }]
        );
    }

    #[test]
    fn test_plan_never_touches_foreign_paths() {
        let actual = vec![
            path("external_relay", Some("gst-launch")),
            path("studio_feed", None),
        ];
        assert!(plan_actions(&[], &actual).is_empty());
    }

    #[test]
    fn test_plan_absent_and_unwanted_is_noop() {
        let desired = vec![DesiredStream {
            name: CAM_A.to_string(),
            command: None,
        }];
        assert!(plan_actions(&desired, &[]).is_empty());
    }

    #[test]
    fn test_settings_for_state() {
        let mut settings = CameraSettings::default();
        settings.framerate = 30;
        settings.printing_framerate = Some(15);
        settings.standby_framerate = Some(5);

        assert_eq!(settings_for_state(&settings, true).framerate, 15);
        assert_eq!(settings_for_state(&settings, false).framerate, 5);

        // Without distinct framerates the base value is kept
        settings.printing_framerate = None;
        settings.standby_framerate = None;
        assert_eq!(settings_for_state(&settings, true).framerate, 30);
        assert_eq!(settings_for_state(&settings, false).framerate, 30);
    }
}
