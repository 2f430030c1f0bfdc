use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Deserialize;

use roost_db::camera::OverlaySettings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The effective printer state after hysteresis has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintState {
    Printing,
    Standby,
}

/// Point-in-time snapshot of printer telemetry. Absent telemetry fields
/// default rather than failing the poll.
#[derive(Debug, Clone, Default)]
pub struct PrintStatus {
    pub state: String,
    pub progress: f64,
    pub filename: String,
    pub current_layer: u32,
    pub total_layers: u32,
    pub time_elapsed: u64,
    pub time_remaining: u64,
    pub hotend_temp: f64,
    pub hotend_target: f64,
    pub bed_temp: f64,
    pub bed_target: f64,
    pub fan_speed: f64,
}

impl PrintStatus {
    /// Paused still counts as active: the job is not over and the camera
    /// should keep its printing framerate.
    pub fn is_active(&self) -> bool {
        matches!(self.state.as_str(), "printing" | "paused")
    }
}

// ------------------------------------------------------------------------
// Telemetry client
// ------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct PrintStatsObject {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    print_duration: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct DisplayStatusObject {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VirtualSdcardObject {
    #[serde(default)]
    progress: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct HeaterObject {
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    target: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct FanObject {
    #[serde(default)]
    speed: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusObjects {
    #[serde(default)]
    print_stats: PrintStatsObject,
    #[serde(default)]
    display_status: DisplayStatusObject,
    #[serde(default)]
    virtual_sdcard: VirtualSdcardObject,
    #[serde(default)]
    extruder: HeaterObject,
    #[serde(default)]
    heater_bed: HeaterObject,
    #[serde(default)]
    fan: FanObject,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    status: StatusObjects,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

/// Bounded-timeout polling client for the printer telemetry endpoint.
pub struct TelemetryClient {
    base_url: String,
    http: reqwest::Client,
}

impl TelemetryClient {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub async fn is_available(&self) -> bool {
        self.http
            .get(format!("{}/server/info", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    pub async fn poll_status(&self) -> anyhow::Result<PrintStatus> {
        let url = format!(
            "{}/printer/objects/query?print_stats&display_status&virtual_sdcard&extruder&heater_bed&fan",
            self.base_url
        );
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "telemetry returned {}",
                response.status()
            ));
        }
        let body: QueryResponse = response.json().await?;
        Ok(status_from_objects(body.result.status))
    }
}

fn status_from_objects(objects: StatusObjects) -> PrintStatus {
    let mut status = PrintStatus {
        state: normalize_state(objects.print_stats.state.as_deref()),
        filename: objects.print_stats.filename.unwrap_or_default(),
        time_elapsed: objects.print_stats.print_duration.unwrap_or(0.0).max(0.0) as u64,
        progress: (objects.virtual_sdcard.progress.unwrap_or(0.0) * 100.0).clamp(0.0, 100.0),
        hotend_temp: objects.extruder.temperature.unwrap_or(0.0),
        hotend_target: objects.extruder.target.unwrap_or(0.0),
        bed_temp: objects.heater_bed.temperature.unwrap_or(0.0),
        bed_target: objects.heater_bed.target.unwrap_or(0.0),
        fan_speed: objects.fan.speed.unwrap_or(0.0) * 100.0,
        ..Default::default()
    };

    // Layer info comes through the display message, e.g. "Layer 12/240"
    if let Some(message) = objects.display_status.message {
        if let Some((current, total)) = parse_layer_message(&message) {
            status.current_layer = current;
            status.total_layers = total;
        }
    }

    // Remaining time is extrapolated from progress and elapsed time
    if status.progress > 0.0 && status.time_elapsed > 0 {
        let total_estimate = status.time_elapsed as f64 / (status.progress / 100.0);
        status.time_remaining = (total_estimate - status.time_elapsed as f64).max(0.0) as u64;
    }

    status
}

fn normalize_state(state: Option<&str>) -> String {
    match state {
        Some("printing") => "printing",
        Some("paused") => "paused",
        Some("complete") => "complete",
        Some("error") | Some("cancelled") => "error",
        _ => "standby",
    }
    .to_string()
}

fn parse_layer_message(message: &str) -> Option<(u32, u32)> {
    let rest = message.split("Layer").nth(1)?;
    let (current, total) = rest.split_once('/')?;
    Some((current.trim().parse().ok()?, total.trim().parse().ok()?))
}

// ------------------------------------------------------------------------
// Hysteresis state machine
// ------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: PrintState,
    pub to: PrintState,
}

/// Two-state machine with an asymmetric delay: activation fires
/// immediately, deactivation only after the inactive condition has held
/// for the full delay window. Any active sample cancels a pending
/// deactivation and resets the timer.
pub struct Hysteresis {
    state: PrintState,
    pending_standby_since: Option<Instant>,
    delay: Duration,
}

impl Hysteresis {
    pub fn new(delay: Duration) -> Self {
        Self {
            state: PrintState::Standby,
            pending_standby_since: None,
            delay,
        }
    }

    pub fn state(&self) -> PrintState {
        self.state
    }

    pub fn observe(&mut self, active: bool, now: Instant) -> Option<Transition> {
        if active {
            self.pending_standby_since = None;
            if self.state == PrintState::Standby {
                self.state = PrintState::Printing;
                return Some(Transition {
                    from: PrintState::Standby,
                    to: PrintState::Printing,
                });
            }
            return None;
        }

        if self.state != PrintState::Printing {
            return None;
        }
        match self.pending_standby_since {
            None => {
                self.pending_standby_since = Some(now);
                None
            }
            Some(since) if now.duration_since(since) >= self.delay => {
                self.pending_standby_since = None;
                self.state = PrintState::Standby;
                Some(Transition {
                    from: PrintState::Printing,
                    to: PrintState::Standby,
                })
            }
            Some(_) => None,
        }
    }
}

// ------------------------------------------------------------------------
// Overlay rendering
// ------------------------------------------------------------------------

pub fn overlay_path(overlay_dir: &Path, camera_id: &str) -> PathBuf {
    overlay_dir.join(format!("camera_{}.txt", camera_id))
}

/// Render the overlay text for one camera from the latest telemetry
/// snapshot, honoring the camera's field selection. A plain template
/// render, nothing more.
pub fn render_overlay(status: &PrintStatus, overlay: &OverlaySettings) -> String {
    if !status.is_active() {
        if status.state == "complete" {
            return "Complete".to_string();
        }
        return overlay
            .standby_text
            .clone()
            .unwrap_or_else(|| "On Standby".to_string());
    }

    let mut parts: Vec<String> = Vec::new();
    let labeled = |label: &str, value: String| -> String {
        if overlay.show_labels {
            format!("{}: {}", label, value)
        } else {
            value
        }
    };

    if overlay.show_progress {
        parts.push(labeled("Progress", format!("{:.1}%", status.progress)));
    }
    if overlay.show_layer && status.total_layers > 0 {
        parts.push(labeled(
            "Layer",
            format!("{}/{}", status.current_layer, status.total_layers),
        ));
    }
    if overlay.show_eta && status.time_remaining > 0 {
        parts.push(labeled("ETA", format_time(status.time_remaining)));
    }
    if overlay.show_elapsed && status.time_elapsed > 0 {
        parts.push(labeled("Elapsed", format_time(status.time_elapsed)));
    }
    if overlay.show_filename && !status.filename.is_empty() {
        let mut name = status.filename.clone();
        if name.len() > 20 {
            name.truncate(17);
            name.push_str("...");
        }
        parts.push(labeled("File", name));
    }
    if overlay.show_hotend_temp {
        parts.push(labeled(
            "Hotend",
            format!("{:.0}/{:.0}C", status.hotend_temp, status.hotend_target),
        ));
    }
    if overlay.show_bed_temp {
        parts.push(labeled(
            "Bed",
            format!("{:.0}/{:.0}C", status.bed_temp, status.bed_target),
        ));
    }
    if overlay.show_fan_speed {
        parts.push(labeled("Fan", format!("{:.0}%", status.fan_speed)));
    }
    if overlay.show_state {
        let mut state = status.state.clone();
        if let Some(first) = state.get_mut(..1) {
            first.make_ascii_uppercase();
        }
        parts.push(labeled("State", state));
    }

    if parts.is_empty() {
        return "Printing...".to_string();
    }
    let separator = if overlay.multiline { "\n" } else { "  " };
    parts.join(separator)
}

pub fn format_time(seconds: u64) -> String {
    if seconds == 0 {
        return "--:--".to_string();
    }
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --------------------------------------------------------------------
    // Hysteresis
    // --------------------------------------------------------------------

    #[test]
    fn test_activation_fires_immediately() {
        let mut machine = Hysteresis::new(Duration::from_secs(30));
        let now = Instant::now();
        let transition = machine.observe(true, now).unwrap();
        assert_eq!(transition.from, PrintState::Standby);
        assert_eq!(transition.to, PrintState::Printing);
        // A second active sample does not fire again
        assert!(machine.observe(true, now + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_short_inactive_gaps_never_deactivate() {
        let mut machine = Hysteresis::new(Duration::from_secs(30));
        let start = Instant::now();
        machine.observe(true, start);

        // Alternate inactive/active with gaps shorter than the window
        let mut now = start;
        for _ in 0..20 {
            now += Duration::from_secs(10);
            assert!(machine.observe(false, now).is_none());
            now += Duration::from_secs(10);
            assert!(machine.observe(true, now).is_none());
        }
        assert_eq!(machine.state(), PrintState::Printing);
    }

    #[test]
    fn test_sustained_inactive_run_of_exact_delay_transitions_once() {
        let mut machine = Hysteresis::new(Duration::from_secs(30));
        let start = Instant::now();
        machine.observe(true, start);

        let mut transitions = 0;
        let mut now = start + Duration::from_secs(1);
        // Inactive samples every 10s; the run reaches exactly 30s of
        // sustained inactivity on the fourth sample
        for _ in 0..4 {
            if machine.observe(false, now).is_some() {
                transitions += 1;
            }
            now += Duration::from_secs(10);
        }
        assert_eq!(transitions, 1);
        assert_eq!(machine.state(), PrintState::Standby);

        // Further inactive samples stay quiet
        assert!(machine.observe(false, now).is_none());
    }

    #[test]
    fn test_active_sample_resets_pending_timer() {
        let mut machine = Hysteresis::new(Duration::from_secs(30));
        let start = Instant::now();
        machine.observe(true, start);

        // 25s of inactivity, then one active sample
        machine.observe(false, start + Duration::from_secs(5));
        machine.observe(false, start + Duration::from_secs(29));
        machine.observe(true, start + Duration::from_secs(30));

        // Another 29s of inactivity is still below the (reset) window
        machine.observe(false, start + Duration::from_secs(31));
        assert!(
            machine
                .observe(false, start + Duration::from_secs(59))
                .is_none()
        );
        // The full window after the reset point fires the transition
        assert!(
            machine
                .observe(false, start + Duration::from_secs(61))
                .is_some()
        );
    }

    // --------------------------------------------------------------------
    // Telemetry parsing
    // --------------------------------------------------------------------

    fn parse(json: &str) -> PrintStatus {
        let response: QueryResponse = serde_json::from_str(json).unwrap();
        status_from_objects(response.result.status)
    }

    #[test]
    fn test_parse_full_response() {
        let status = parse(
            r#"{"result":{"status":{
                "print_stats":{"state":"printing","filename":"benchy.gcode","print_duration":1200.0},
                "display_status":{"message":"Layer 12/240"},
                "virtual_sdcard":{"progress":0.25},
                "extruder":{"temperature":210.3,"target":210.0},
                "heater_bed":{"temperature":60.1,"target":60.0},
                "fan":{"speed":0.75}
            }}}"#,
        );
        assert_eq!(status.state, "printing");
        assert!(status.is_active());
        assert_eq!(status.progress, 25.0);
        assert_eq!(status.current_layer, 12);
        assert_eq!(status.total_layers, 240);
        assert_eq!(status.fan_speed, 75.0);
        assert_eq!(status.time_elapsed, 1200);
        // 25% in 1200s extrapolates to 3600s remaining
        assert_eq!(status.time_remaining, 3600);
    }

    #[test]
    fn test_parse_missing_fields_default() {
        let status = parse(r#"{"result":{"status":{}}}"#);
        assert_eq!(status.state, "standby");
        assert!(!status.is_active());
        assert_eq!(status.progress, 0.0);
        assert_eq!(status.time_remaining, 0);
    }

    #[test]
    fn test_paused_counts_as_active() {
        let status = parse(
            r#"{"result":{"status":{"print_stats":{"state":"paused"}}}}"#,
        );
        assert!(status.is_active());

        let status = parse(
            r#"{"result":{"status":{"print_stats":{"state":"complete"}}}}"#,
        );
        assert!(!status.is_active());

        let status = parse(
            r#"{"result":{"status":{"print_stats":{"state":"cancelled"}}}}"#,
        );
        assert_eq!(status.state, "error");
    }

    // --------------------------------------------------------------------
    // Overlay rendering
    // --------------------------------------------------------------------

    fn printing_status() -> PrintStatus {
        PrintStatus {
            state: "printing".to_string(),
            progress: 42.5,
            filename: "benchy.gcode".to_string(),
            current_layer: 12,
            total_layers: 240,
            time_elapsed: 600,
            time_remaining: 812,
            hotend_temp: 210.3,
            hotend_target: 210.0,
            bed_temp: 60.1,
            bed_target: 60.0,
            fan_speed: 75.0,
        }
    }

    #[test]
    fn test_render_overlay_default_selection() {
        let text = render_overlay(&printing_status(), &OverlaySettings::default());
        assert_eq!(text, "Progress: 42.5%  Layer: 12/240  ETA: 13:32");
    }

    #[test]
    fn test_render_overlay_without_labels_multiline() {
        let overlay = OverlaySettings {
            show_labels: false,
            multiline: true,
            show_eta: false,
            ..OverlaySettings::default()
        };
        let text = render_overlay(&printing_status(), &overlay);
        assert_eq!(text, "42.5%\n12/240");
    }

    #[test]
    fn test_render_overlay_standby_text() {
        let mut status = printing_status();
        status.state = "standby".to_string();
        assert_eq!(
            render_overlay(&status, &OverlaySettings::default()),
            "On Standby"
        );

        let custom = OverlaySettings {
            standby_text: Some("Idle".to_string()),
            ..OverlaySettings::default()
        };
        assert_eq!(render_overlay(&status, &custom), "Idle");

        status.state = "complete".to_string();
        assert_eq!(
            render_overlay(&status, &OverlaySettings::default()),
            "Complete"
        );
    }

    #[test]
    fn test_render_overlay_nothing_selected() {
        let overlay = OverlaySettings {
            show_progress: false,
            show_layer: false,
            show_eta: false,
            ..OverlaySettings::default()
        };
        assert_eq!(render_overlay(&printing_status(), &overlay), "Printing...");
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0), "--:--");
        assert_eq!(format_time(45), "0:45");
        assert_eq!(format_time(812), "13:32");
        assert_eq!(format_time(3725), "1:02:05");
    }
}
