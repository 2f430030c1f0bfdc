use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::device::{DeviceInfo, device_info, run_command};

/// Path substrings that identify codec/ISP/memory-to-memory nodes rather
/// than capture sensors.
const CODEC_PATH_PATTERNS: &[&str] = &["dec", "enc", "m2m", "isp", "iep", "rga"];

/// Card-name substrings that identify hardware codec devices.
const CODEC_CARD_PATTERNS: &[&str] = &[
    "rkvdec", "rkvenc", "rkisp", "rga", "hantro", "cedrus", "decoder", "encoder", "m2m",
    "mem2mem", "isp",
];

pub const DUPLICATE_REASON: &str = "duplicate without unique serial";

#[derive(Debug, Clone, Serialize)]
pub struct RejectedCamera {
    pub path: String,
    pub hardware_id: String,
    pub reason: String,
}

#[derive(Debug)]
pub enum DeviceEvent {
    Connected(DeviceInfo),
    Disconnected { path: String },
    Rejected(RejectedCamera),
}

#[derive(Default)]
struct WatchState {
    /// Active bindings: device path -> hardware id.
    known: HashMap<String, String>,
    /// Pending debounce entries: device path -> cancel handle.
    pending: HashMap<String, CancellationToken>,
}

enum BindDecision {
    Accepted,
    DuplicateOf(String),
}

impl WatchState {
    /// Bind a path to a hardware id. A second device resolving to an
    /// already-bound hardware id on a different path is refused, never
    /// merged.
    fn bind(&mut self, path: &str, hardware_id: &str) -> BindDecision {
        for (existing_path, existing_id) in &self.known {
            if existing_id == hardware_id && existing_path != path {
                return BindDecision::DuplicateOf(existing_path.clone());
            }
        }
        self.known.insert(path.to_string(), hardware_id.to_string());
        BindDecision::Accepted
    }

    fn unbind(&mut self, path: &str) -> bool {
        self.known.remove(path).is_some()
    }
}

/// Maintains the live set of capture-class devices and reports debounced
/// connect/disconnect events over a channel.
pub struct DeviceWatcher {
    events: mpsc::Sender<DeviceEvent>,
    state: Arc<Mutex<WatchState>>,
    debounce: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl DeviceWatcher {
    pub fn new(
        debounce: Duration,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<DeviceEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let watcher = Arc::new(Self {
            events: tx,
            state: Arc::new(Mutex::new(WatchState::default())),
            debounce,
            poll_interval,
            cancel,
        });
        (watcher, rx)
    }

    /// Start the event source: udev monitoring when available, polling
    /// diff otherwise.
    pub fn start(self: &Arc<Self>) {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            match watcher.udev_monitor().await {
                Ok(()) => {}
                Err(e) => {
                    log::info!("udev monitor unavailable ({:#}), falling back to polling", e);
                    watcher.polling_monitor().await;
                }
            }
        });
    }

    /// Synthesize connect candidates for devices already present at
    /// startup.
    pub async fn scan_existing(self: &Arc<Self>) {
        for path in find_video_devices().await {
            self.schedule_connect(path).await;
        }
    }

    async fn udev_monitor(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut child = tokio::process::Command::new("udevadm")
            .args([
                "monitor",
                "--udev",
                "--subsystem-match=video4linux",
                "--property",
            ])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("no stdout from udevadm"))?;
        log::info!("watching devices via udev events");

        let mut lines = BufReader::new(stdout).lines();
        let mut action: Option<String> = None;
        let mut devname: Option<String> = None;

        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Ok(());
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                // udevadm exited; let the caller fall back to polling
                return Err(anyhow::anyhow!("udevadm monitor stream ended"));
            };

            let line = line.trim();
            if line.is_empty() {
                // Property block complete
                if let (Some(action), Some(path)) = (action.take(), devname.take()) {
                    match action.as_str() {
                        "add" => self.schedule_connect(path).await,
                        "remove" => self.handle_disconnect(&path).await,
                        _ => {}
                    }
                }
                continue;
            }
            if let Some(value) = line.strip_prefix("ACTION=") {
                action = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("DEVNAME=") {
                devname = Some(value.to_string());
            }
        }
    }

    async fn polling_monitor(self: &Arc<Self>) {
        log::info!("watching devices via polling diff");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let current = find_video_devices().await;
            let tracked: Vec<String> = {
                let state = self.state.lock().await;
                state
                    .known
                    .keys()
                    .chain(state.pending.keys())
                    .cloned()
                    .collect()
            };

            for path in &current {
                if !tracked.contains(path) {
                    self.schedule_connect(path.clone()).await;
                }
            }
            for path in tracked {
                if !current.contains(&path) {
                    self.handle_disconnect(&path).await;
                }
            }
        }
    }

    /// Schedule a connect report after the debounce interval. The pending
    /// entry is a cancellable timer handle, not a dedicated thread.
    pub async fn schedule_connect(self: &Arc<Self>, path: String) {
        let token = {
            let mut state = self.state.lock().await;
            if state.pending.contains_key(&path) || state.known.contains_key(&path) {
                return;
            }
            let token = CancellationToken::new();
            state.pending.insert(path.clone(), token.clone());
            token
        };

        let watcher = Arc::clone(self);
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = watcher.cancel.cancelled() => return,
                _ = tokio::time::sleep(debounce) => {}
            }
            watcher.finish_connect(&path).await;
        });
    }

    /// Runs after the debounce interval: the device must still be present
    /// and a capture device; identity resolution happens here, not before.
    async fn finish_connect(self: &Arc<Self>, path: &str) {
        {
            let mut state = self.state.lock().await;
            if state.pending.remove(path).is_none() {
                // Canceled by a disconnect while waiting
                return;
            }
        }

        if !std::path::Path::new(path).exists() {
            return;
        }
        if !is_capture_device(path).await {
            return;
        }
        let Some(info) = device_info(path).await else {
            log::warn!("could not resolve identity for {}", path);
            return;
        };

        let decision = {
            let mut state = self.state.lock().await;
            state.bind(path, &info.hardware_id)
        };
        match decision {
            BindDecision::Accepted => {
                let _ = self.events.send(DeviceEvent::Connected(info)).await;
            }
            BindDecision::DuplicateOf(existing) => {
                log::warn!(
                    "rejecting {}: hardware id '{}' already bound to {}",
                    path,
                    info.hardware_id,
                    existing
                );
                let _ = self
                    .events
                    .send(DeviceEvent::Rejected(RejectedCamera {
                        path: path.to_string(),
                        hardware_id: info.hardware_id,
                        reason: DUPLICATE_REASON.to_string(),
                    }))
                    .await;
            }
        }
    }

    /// Path disappeared: cancel any pending debounce for it, and report a
    /// disconnect if it had an active binding.
    pub async fn handle_disconnect(self: &Arc<Self>, path: &str) {
        let was_known = {
            let mut state = self.state.lock().await;
            if let Some(token) = state.pending.remove(path) {
                token.cancel();
            }
            state.unbind(path)
        };
        if was_known {
            let _ = self
                .events
                .send(DeviceEvent::Disconnected {
                    path: path.to_string(),
                })
                .await;
        }
    }

    #[cfg(test)]
    async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

/// List `/dev/video*` nodes that pass the capture-device filter.
pub async fn find_video_devices() -> Vec<String> {
    let mut paths = Vec::new();
    let Ok(entries) = std::fs::read_dir("/dev") else {
        return paths;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("video") {
            paths.push(format!("/dev/{}", name));
        }
    }
    paths.sort();

    let mut devices = Vec::new();
    for path in paths {
        if is_capture_device(&path).await {
            devices.push(path);
        }
    }
    devices
}

/// Check whether a node is a capture-class device rather than a codec,
/// ISP, or converter. Prefers the udev capability tags, falling back to
/// `v4l2-ctl --all` output.
pub async fn is_capture_device(device_path: &str) -> bool {
    if is_codec_path(device_path) {
        return false;
    }

    if let Ok(output) = run_command("udevadm", &["info", device_path], Duration::from_secs(5)).await
    {
        if output.status.success() {
            return String::from_utf8_lossy(&output.stdout).contains(":capture:");
        }
    }

    let Ok(output) = run_command(
        "v4l2-ctl",
        &["--device", device_path, "--all"],
        Duration::from_secs(5),
    )
    .await
    else {
        return false;
    };
    if !output.status.success() {
        return false;
    }
    capability_flags_ok(&String::from_utf8_lossy(&output.stdout))
}

fn is_codec_path(device_path: &str) -> bool {
    let lower = device_path.to_lowercase();
    CODEC_PATH_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Inspect `v4l2-ctl --all` output: the device must report capture, must
/// not also report output (capture+output means a converter, not a
/// sensor), and must not carry a codec card name.
fn capability_flags_ok(all_output: &str) -> bool {
    let lower = all_output.to_lowercase();
    if CODEC_CARD_PATTERNS.iter().any(|p| lower.contains(p)) {
        return false;
    }
    if !all_output.contains("Video Capture") {
        return false;
    }
    if all_output.contains("Video Output") {
        return false;
    }
    true
}
