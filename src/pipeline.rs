use std::collections::BTreeMap;

use roost_db::camera::{CameraSettings, EncoderKind, OverlayPosition, OverlaySettings};

use crate::settings::pixel_count;

const REFERENCE_PIXELS: u64 = 1920 * 1080;
/// Bitrates below this are pointless for any stream we produce.
const BITRATE_FLOOR_MBIT: f64 = 0.5;
const VAAPI_RENDER_NODE: &str = "/dev/dri/renderD128";

/// Internal format token -> ffmpeg `-input_format` name.
const FFMPEG_INPUT_FORMATS: &[(&str, &str)] = &[
    ("mjpeg", "mjpeg"),
    ("h264", "h264"),
    ("yuyv", "yuyv422"),
    ("nv12", "nv12"),
    ("rgb24", "rgb24"),
];

fn ffmpeg_input_format(format: &str) -> &str {
    FFMPEG_INPUT_FORMATS
        .iter()
        .find(|(name, _)| *name == format)
        .map(|(_, ffmpeg)| *ffmpeg)
        .unwrap_or(format)
}

/// Everything the command synthesis depends on. Building is a pure
/// function of this value: identical specs produce byte-identical
/// commands.
pub struct PipelineSpec<'a> {
    pub device_path: &'a str,
    pub stream_name: &'a str,
    pub settings: &'a CameraSettings,
    /// Overlay text file re-read by the compositor on a short interval.
    pub overlay_path: Option<&'a str>,
    /// Control values to push once before the pipeline starts, already
    /// reduced to those differing from the hardware default.
    pub controls: &'a BTreeMap<String, i64>,
    pub rtsp_port: u16,
}

impl PipelineSpec<'_> {
    /// The full command line handed to the streaming backend as the
    /// path's init command. When controls must be pushed first, the
    /// ffmpeg invocation is wrapped in a shell with one batched
    /// `v4l2-ctl` call ahead of it.
    pub fn command(&self) -> String {
        let ffmpeg = self.argv().join(" ");
        match crate::device::control::format_control_batch(self.controls) {
            Some(batch) => format!(
                "sh -c 'v4l2-ctl -d {} --set-ctrl={}; {}'",
                self.device_path, batch, ffmpeg
            ),
            None => ffmpeg,
        }
    }

    /// The ordered ffmpeg argument sequence.
    pub fn argv(&self) -> Vec<String> {
        let settings = self.settings;
        let mut args: Vec<String> = vec![
            "ffmpeg".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
        ];

        // Device initialization must precede the input for GPU paths
        if settings.encoder == EncoderKind::Vaapi {
            args.push("-vaapi_device".into());
            args.push(VAAPI_RENDER_NODE.into());
        }

        args.extend([
            "-f".into(),
            "v4l2".into(),
            "-input_format".into(),
            ffmpeg_input_format(&settings.format).to_string(),
            "-video_size".into(),
            settings.resolution.clone(),
            "-framerate".into(),
            settings.framerate.to_string(),
            "-i".into(),
            self.device_path.to_string(),
        ]);

        let filters = self.filter_chain();
        if !filters.is_empty() {
            args.push("-vf".into());
            args.push(filters.join(","));
        }

        let bitrate = scale_bitrate(&settings.resolution, &settings.bitrate);
        args.push("-c:v".into());
        args.push(settings.encoder.codec_name().into());
        match settings.encoder {
            EncoderKind::Libx264 => {
                args.extend([
                    "-preset".into(),
                    settings.preset.clone(),
                    "-tune".into(),
                    "zerolatency".into(),
                    "-profile:v".into(),
                    "baseline".into(),
                    "-level".into(),
                    "3.1".into(),
                    "-bf".into(),
                    "0".into(),
                    "-b:v".into(),
                    bitrate.clone(),
                    "-maxrate".into(),
                    bitrate.clone(),
                    "-bufsize".into(),
                    bitrate,
                ]);
            }
            EncoderKind::Vaapi => {
                args.extend([
                    "-profile:v".into(),
                    "constrained_baseline".into(),
                    "-level".into(),
                    "31".into(),
                    "-b:v".into(),
                    bitrate,
                ]);
            }
            EncoderKind::Rkmpp | EncoderKind::V4l2m2m => {
                args.extend([
                    "-profile:v".into(),
                    "baseline".into(),
                    "-level".into(),
                    "31".into(),
                    "-b:v".into(),
                    bitrate,
                ]);
            }
        }

        args.extend([
            "-g".into(),
            (settings.framerate * 2).to_string(),
            "-f".into(),
            "rtsp".into(),
            "-rtsp_transport".into(),
            "tcp".into(),
            format!("rtsp://127.0.0.1:{}/{}", self.rtsp_port, self.stream_name),
        ]);

        args
    }

    /// The per-frame filter chain. Ordering is load-bearing:
    /// 1. pixel-format conversion (debayers raw sensor data),
    /// 2. rotation (must run on converted pixels),
    /// 3. overlay compositing (must see the final orientation),
    /// 4. hardware-surface upload (GPU paths, always last).
    fn filter_chain(&self) -> Vec<String> {
        let settings = self.settings;
        let mut filters = Vec::new();

        if settings.encoder == EncoderKind::Vaapi {
            filters.push("format=nv12".to_string());
        } else {
            // yuv420p for player compatibility; 4:2:2 sources are
            // downsampled here as well
            filters.push("format=yuv420p".to_string());
        }

        match settings.rotation {
            90 => filters.push("transpose=1".to_string()),
            180 => filters.push("transpose=1,transpose=1".to_string()),
            270 => filters.push("transpose=2".to_string()),
            _ => {}
        }

        if let (Some(path), Some(overlay)) = (self.overlay_path, settings.overlay.as_ref()) {
            filters.push(drawtext_filter(path, overlay));
        }

        if settings.encoder == EncoderKind::Vaapi {
            filters.push("hwupload".to_string());
        }

        filters
    }
}

/// Build the drawtext filter reading the overlay file. `reload=1` makes
/// the compositor re-read the file each frame interval; `expansion=none`
/// keeps literal `%` usable in the rendered text.
fn drawtext_filter(overlay_path: &str, overlay: &OverlaySettings) -> String {
    let (x, y) = match overlay.position {
        OverlayPosition::TopLeft => ("20", "20"),
        OverlayPosition::TopCenter => ("(w-text_w)/2", "20"),
        OverlayPosition::TopRight => ("w-text_w-20", "20"),
        OverlayPosition::BottomLeft => ("20", "h-th-20"),
        OverlayPosition::BottomCenter => ("(w-text_w)/2", "h-th-20"),
        OverlayPosition::BottomRight => ("w-text_w-20", "h-th-20"),
    };
    let border_color = match overlay.color.as_str() {
        "white" | "yellow" | "cyan" => "black",
        _ => "white",
    };
    format!(
        "drawtext=textfile='{}':reload=1:expansion=none:fontcolor={}:fontsize={}:borderw=2:bordercolor={}:x={}:y={}",
        escape_filter_path(overlay_path),
        overlay.color,
        overlay.font_size,
        border_color,
        x,
        y
    )
}

/// Escape characters the filter mini-language reserves inside a filter
/// option value.
pub fn escape_filter_path(path: &str) -> String {
    path.replace('\\', "/").replace(':', "\\:")
}

/// Scale the configured bitrate to the actual pixel count so small streams
/// do not waste bandwidth. Never exceeds the base, never drops below the
/// floor. Base bitrates are calibrated for 1080p.
pub fn scale_bitrate(resolution: &str, base_bitrate: &str) -> String {
    let Some(pixels) = pixel_count(resolution) else {
        return base_bitrate.to_string();
    };
    let Some(base_mbit) = parse_bitrate_mbit(base_bitrate) else {
        return base_bitrate.to_string();
    };

    let scale = pixels as f64 / REFERENCE_PIXELS as f64;
    let scaled = (base_mbit * scale).clamp(BITRATE_FLOOR_MBIT.min(base_mbit), base_mbit);
    format_bitrate_mbit(scaled)
}

/// "6M" -> 6.0, "500K" -> 0.5, "4000000" -> 4.0
fn parse_bitrate_mbit(bitrate: &str) -> Option<f64> {
    let trimmed = bitrate.trim().to_uppercase();
    if let Some(value) = trimmed.strip_suffix('M') {
        value.parse().ok()
    } else if let Some(value) = trimmed.strip_suffix('K') {
        value.parse::<f64>().ok().map(|v| v / 1000.0)
    } else {
        trimmed.parse::<f64>().ok().map(|v| v / 1_000_000.0)
    }
}

fn format_bitrate_mbit(mbit: f64) -> String {
    if mbit >= 1.0 {
        let text = format!("{:.1}M", mbit);
        text.replace(".0M", "M")
    } else {
        format!("{}K", (mbit * 1000.0).round() as u64)
    }
}

/// Reduce configured control values to those differing from the hardware
/// default; only these are worth pushing before pipeline start.
pub fn control_deltas(
    configured: &BTreeMap<String, i64>,
    defaults: &BTreeMap<String, i64>,
) -> BTreeMap<String, i64> {
    configured
        .iter()
        .filter(|(name, value)| defaults.get(*name) != Some(value))
        .map(|(name, value)| (name.clone(), *value))
        .collect()
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
