use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use turso::Connection;

const MODULE_NAME: &str = "camera";
const IGNORE_MODULE_NAME: &str = "camera_ignore";

/// Closed set of encoder profiles the pipeline knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncoderKind {
    #[default]
    #[serde(rename = "libx264")]
    Libx264,
    #[serde(rename = "h264_vaapi")]
    Vaapi,
    #[serde(rename = "h264_rkmpp")]
    Rkmpp,
    #[serde(rename = "h264_v4l2m2m")]
    V4l2m2m,
}

impl EncoderKind {
    pub fn codec_name(&self) -> &'static str {
        match self {
            EncoderKind::Libx264 => "libx264",
            EncoderKind::Vaapi => "h264_vaapi",
            EncoderKind::Rkmpp => "h264_rkmpp",
            EncoderKind::V4l2m2m => "h264_v4l2m2m",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, EncoderKind::Libx264)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlayPosition {
    TopLeft,
    TopCenter,
    TopRight,
    BottomLeft,
    #[default]
    BottomCenter,
    BottomRight,
}

/// Print status overlay configuration: which telemetry fields the camera
/// renders plus drawtext appearance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlaySettings {
    pub show_progress: bool,
    pub show_layer: bool,
    pub show_eta: bool,
    pub show_elapsed: bool,
    pub show_filename: bool,
    pub show_hotend_temp: bool,
    pub show_bed_temp: bool,
    pub show_fan_speed: bool,
    pub show_state: bool,
    pub show_labels: bool,
    pub multiline: bool,
    pub font_size: u32,
    pub position: OverlayPosition,
    pub color: String,
    pub standby_text: Option<String>,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            show_progress: true,
            show_layer: true,
            show_eta: true,
            show_elapsed: false,
            show_filename: false,
            show_hotend_temp: false,
            show_bed_temp: false,
            show_fan_speed: false,
            show_state: false,
            show_labels: true,
            multiline: false,
            font_size: 24,
            position: OverlayPosition::BottomCenter,
            color: "white".to_string(),
            standby_text: None,
        }
    }
}

/// Per-camera stream settings. Every field has a defined default so the
/// pipeline builder always receives a fully-resolved value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    pub format: String,
    pub resolution: String,
    pub framerate: u32,
    pub encoder: EncoderKind,
    pub bitrate: String,
    pub preset: String,
    pub rotation: u16,
    /// Named control values applied once before the pipeline starts.
    #[serde(default)]
    pub controls: BTreeMap<String, i64>,
    #[serde(default)]
    pub overlay: Option<OverlaySettings>,
    /// Framerate while the printer is active; `None` = keep `framerate`.
    #[serde(default)]
    pub printing_framerate: Option<u32>,
    /// Framerate while the printer is on standby; `None` = keep `framerate`.
    #[serde(default)]
    pub standby_framerate: Option<u32>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            format: "mjpeg".to_string(),
            resolution: "1280x720".to_string(),
            framerate: 30,
            encoder: EncoderKind::Libx264,
            bitrate: "4M".to_string(),
            preset: "ultrafast".to_string(),
            rotation: 0,
            controls: BTreeMap::new(),
            overlay: None,
            printing_framerate: None,
            standby_framerate: None,
        }
    }
}

/// One discrete resolution with its supported framerates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionCaps {
    pub resolution: String,
    pub framerates: Vec<u32>,
}

/// One capture format with its resolution set, in probe order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatCaps {
    pub format: String,
    pub modes: Vec<ResolutionCaps>,
}

impl FormatCaps {
    pub fn mode(&self, resolution: &str) -> Option<&ResolutionCaps> {
        self.modes.iter().find(|m| m.resolution == resolution)
    }
}

/// Probed device capabilities: format -> resolution -> framerate set.
/// Probe order is preserved so closest-match ties resolve to the first
/// entry the device reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub formats: Vec<FormatCaps>,
}

impl Capabilities {
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    pub fn format(&self, format: &str) -> Option<&FormatCaps> {
        self.formats.iter().find(|f| f.format == format)
    }

    /// Record one (format, resolution, fps) triple, creating the format and
    /// resolution entries as needed. Duplicate framerates are dropped.
    pub fn add_mode(&mut self, format: &str, resolution: &str, fps: u32) {
        let fmt = match self.formats.iter_mut().find(|f| f.format == format) {
            Some(f) => f,
            None => {
                self.formats.push(FormatCaps {
                    format: format.to_string(),
                    modes: Vec::new(),
                });
                self.formats.last_mut().unwrap()
            }
        };
        let mode = match fmt.modes.iter_mut().find(|m| m.resolution == resolution) {
            Some(m) => m,
            None => {
                fmt.modes.push(ResolutionCaps {
                    resolution: resolution.to_string(),
                    framerates: Vec::new(),
                });
                fmt.modes.last_mut().unwrap()
            }
        };
        if !mode.framerates.contains(&fps) {
            mode.framerates.push(fps);
        }
    }

    /// Ensure the format entry exists even when no modes were parsed yet.
    pub fn add_format(&mut self, format: &str) {
        if self.format(format).is_none() {
            self.formats.push(FormatCaps {
                format: format.to_string(),
                modes: Vec::new(),
            });
        }
    }
}

/// Persisted per-camera record. Created on first sighting of a hardware id
/// and never destroyed automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraRecord {
    pub id: String,
    pub hardware_id: String,
    pub hardware_name: String,
    pub serial_number: Option<String>,
    pub friendly_name: String,
    pub enabled: bool,
    pub connected: bool,
    pub device_path: Option<String>,
    pub settings: CameraSettings,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Id assigned by the external fleet-telemetry service, written back
    /// after registration.
    #[serde(default)]
    pub registration_id: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl CameraRecord {
    pub fn new(hardware_name: &str, serial_number: Option<&str>, device_path: &str) -> Self {
        let hardware_id = match serial_number {
            Some(serial) => format!("{}-{}", hardware_name, serial),
            None => hardware_name.to_string(),
        };
        let now = now_text();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hardware_id,
            hardware_name: hardware_name.to_string(),
            serial_number: serial_number.map(|s| s.to_string()),
            friendly_name: hardware_name.to_string(),
            enabled: true,
            connected: true,
            device_path: Some(device_path.to_string()),
            settings: CameraSettings::default(),
            capabilities: Capabilities::default(),
            registration_id: None,
            created_at: Some(now.clone()),
            updated_at: Some(now),
        }
    }
}

fn now_text() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub async fn query_all(conn: &Connection) -> anyhow::Result<Vec<CameraRecord>> {
    let kvs = crate::kv::by_module(MODULE_NAME, conn).await?;
    let mut cameras = Vec::new();
    for kv in kvs {
        if let Some(json) = kv.value {
            if let Ok(camera) = serde_json::from_str::<CameraRecord>(&json) {
                cameras.push(camera);
            }
        }
    }
    Ok(cameras)
}

pub async fn by_hardware_id(
    hardware_id: &str,
    conn: &Connection,
) -> anyhow::Result<Option<CameraRecord>> {
    let kv = crate::kv::by_module_and_key(MODULE_NAME, hardware_id, conn).await?;
    if let Some(kv) = kv {
        if let Some(json) = kv.value {
            return Ok(Some(serde_json::from_str(&json)?));
        }
    }
    Ok(None)
}

pub async fn by_id(id: &str, conn: &Connection) -> anyhow::Result<Option<CameraRecord>> {
    Ok(query_all(conn).await?.into_iter().find(|c| c.id == id))
}

pub async fn by_device_path(
    device_path: &str,
    conn: &Connection,
) -> anyhow::Result<Option<CameraRecord>> {
    Ok(query_all(conn)
        .await?
        .into_iter()
        .find(|c| c.device_path.as_deref() == Some(device_path)))
}

pub async fn insert(record: &CameraRecord, conn: &Connection) -> anyhow::Result<()> {
    if by_hardware_id(&record.hardware_id, conn).await?.is_some() {
        return Err(anyhow::anyhow!(
            "camera with hardware id '{}' already exists",
            record.hardware_id
        ));
    }
    let value = serde_json::to_string(record)?;
    conn.execute(
        "INSERT INTO kvs (module, key, value) VALUES (?1, ?2, ?3)",
        (MODULE_NAME, record.hardware_id.as_str(), value.as_str()),
    )
    .await?;
    Ok(())
}

pub async fn update(record: &CameraRecord, conn: &Connection) -> anyhow::Result<()> {
    let mut record = record.clone();
    record.updated_at = Some(now_text());
    let value = serde_json::to_string(&record)?;
    crate::kv::upsert(MODULE_NAME, &record.hardware_id, &value, conn).await
}

pub async fn mark_connected(
    hardware_id: &str,
    device_path: &str,
    conn: &Connection,
) -> anyhow::Result<()> {
    if let Some(mut record) = by_hardware_id(hardware_id, conn).await? {
        record.connected = true;
        record.device_path = Some(device_path.to_string());
        update(&record, conn).await?;
    }
    Ok(())
}

pub async fn mark_disconnected(hardware_id: &str, conn: &Connection) -> anyhow::Result<()> {
    if let Some(mut record) = by_hardware_id(hardware_id, conn).await? {
        record.connected = false;
        record.device_path = None;
        update(&record, conn).await?;
    }
    Ok(())
}

/// Mark every record disconnected. Run at startup before the first device
/// scan so stale connection state from a previous run never survives.
pub async fn reset_connections(conn: &Connection) -> anyhow::Result<usize> {
    let mut count = 0;
    for mut record in query_all(conn).await? {
        if record.connected || record.device_path.is_some() {
            record.connected = false;
            record.device_path = None;
            update(&record, conn).await?;
            count += 1;
        }
    }
    Ok(count)
}

pub async fn delete(hardware_id: &str, conn: &Connection) -> anyhow::Result<bool> {
    crate::kv::delete(MODULE_NAME, hardware_id, conn).await
}

pub async fn is_ignored(hardware_id: &str, conn: &Connection) -> anyhow::Result<bool> {
    Ok(
        crate::kv::by_module_and_key(IGNORE_MODULE_NAME, hardware_id, conn)
            .await?
            .is_some(),
    )
}

pub async fn ignore(hardware_id: &str, reason: &str, conn: &Connection) -> anyhow::Result<()> {
    crate::kv::upsert(IGNORE_MODULE_NAME, hardware_id, reason, conn).await
}

pub async fn unignore(hardware_id: &str, conn: &Connection) -> anyhow::Result<bool> {
    crate::kv::delete(IGNORE_MODULE_NAME, hardware_id, conn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RoostDatabase;

    async fn test_conn() -> Connection {
        let db = RoostDatabase::open(":memory:").await.unwrap();
        let conn = db.connect().unwrap();
        conn.execute_batch(include_str!("../migrations/0001_create_kvs.sql"))
            .await
            .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let conn = test_conn().await;
        let record = CameraRecord::new("HD Webcam C920", Some("A1B2C3"), "/dev/video0");
        insert(&record, &conn).await.unwrap();

        let found = by_hardware_id("HD Webcam C920-A1B2C3", &conn)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, record.id);
        assert!(found.connected);
        assert_eq!(found.device_path.as_deref(), Some("/dev/video0"));

        // Duplicate hardware id is refused
        let dup = CameraRecord::new("HD Webcam C920", Some("A1B2C3"), "/dev/video2");
        assert!(insert(&dup, &conn).await.is_err());
    }

    #[tokio::test]
    async fn test_connection_flags() {
        let conn = test_conn().await;
        let record = CameraRecord::new("USB Camera", None, "/dev/video1");
        insert(&record, &conn).await.unwrap();

        mark_disconnected("USB Camera", &conn).await.unwrap();
        let found = by_hardware_id("USB Camera", &conn).await.unwrap().unwrap();
        assert!(!found.connected);
        assert!(found.device_path.is_none());

        mark_connected("USB Camera", "/dev/video3", &conn)
            .await
            .unwrap();
        let found = by_hardware_id("USB Camera", &conn).await.unwrap().unwrap();
        assert!(found.connected);
        assert_eq!(found.device_path.as_deref(), Some("/dev/video3"));
    }

    #[tokio::test]
    async fn test_reset_connections() {
        let conn = test_conn().await;
        insert(
            &CameraRecord::new("Cam A", None, "/dev/video0"),
            &conn,
        )
        .await
        .unwrap();
        insert(
            &CameraRecord::new("Cam B", None, "/dev/video1"),
            &conn,
        )
        .await
        .unwrap();

        let reset = reset_connections(&conn).await.unwrap();
        assert_eq!(reset, 2);
        for record in query_all(&conn).await.unwrap() {
            assert!(!record.connected);
            assert!(record.device_path.is_none());
        }
    }

    #[test]
    fn test_capabilities_add_mode_preserves_order() {
        let mut caps = Capabilities::default();
        caps.add_mode("mjpeg", "1920x1080", 30);
        caps.add_mode("mjpeg", "1280x720", 30);
        caps.add_mode("mjpeg", "1280x720", 60);
        caps.add_mode("yuyv", "640x480", 30);

        assert_eq!(caps.formats[0].format, "mjpeg");
        assert_eq!(caps.formats[0].modes[0].resolution, "1920x1080");
        assert_eq!(caps.formats[0].modes[1].framerates, vec![30, 60]);
        assert_eq!(caps.formats[1].format, "yuyv");
    }
}
