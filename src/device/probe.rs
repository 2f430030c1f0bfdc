use std::time::Duration;

use roost_db::camera::Capabilities;

use crate::device::run_command;
use crate::settings::parse_resolution;

/// Vendor format token -> canonical token. Checked against the format
/// description first, then the FourCC code.
const FORMAT_ALIASES: &[(&str, &str)] = &[
    ("Motion-JPEG", "mjpeg"),
    ("MJPG", "mjpeg"),
    ("H.264", "h264"),
    ("H264", "h264"),
    ("YUYV 4:2:2", "yuyv"),
    ("YUYV", "yuyv"),
    ("NV12", "nv12"),
    ("RGB3", "rgb24"),
];

fn alias(token: &str) -> Option<&'static str> {
    FORMAT_ALIASES
        .iter()
        .find(|(from, _)| *from == token)
        .map(|(_, to)| *to)
}

pub fn normalize_format(fourcc: &str, description: &str) -> String {
    alias(description)
        .or_else(|| alias(fourcc))
        .map(|s| s.to_string())
        .unwrap_or_else(|| fourcc.to_lowercase())
}

/// Probe the device's format/resolution/framerate capability set.
///
/// Any failure (device busy, timeout, malformed output) yields an empty
/// structure; callers treat empty capabilities as "unknown, use defaults".
pub async fn probe_capabilities(device_path: &str) -> Capabilities {
    let output = match run_command(
        "v4l2-ctl",
        &["--device", device_path, "--list-formats-ext"],
        Duration::from_secs(10),
    )
    .await
    {
        Ok(output) => output,
        Err(e) => {
            log::warn!("capability probe failed for {}: {:#}", device_path, e);
            return Capabilities::default();
        }
    };

    if !output.status.success() {
        log::warn!("capability probe returned non-zero for {}", device_path);
        return Capabilities::default();
    }

    let capabilities = parse_capabilities(&String::from_utf8_lossy(&output.stdout));
    log::debug!(
        "probed {} format(s) for {}",
        capabilities.formats.len(),
        device_path
    );
    capabilities
}

/// Parse `v4l2-ctl --list-formats-ext` output:
///
/// ```text
/// [0]: 'MJPG' (Motion-JPEG, compressed)
///     Size: Discrete 1920x1080
///         Interval: Discrete 0.033s (30.000 fps)
/// ```
pub fn parse_capabilities(output: &str) -> Capabilities {
    let mut capabilities = Capabilities::default();
    let mut current_format: Option<String> = None;
    let mut current_resolution: Option<String> = None;

    for raw in output.lines() {
        let line = raw.trim();

        if let Some((fourcc, description)) = parse_format_line(line) {
            let format = normalize_format(fourcc, description);
            capabilities.add_format(&format);
            current_format = Some(format);
            current_resolution = None;
            continue;
        }

        if let Some(resolution) = parse_size_line(line) {
            if current_format.is_some() {
                current_resolution = Some(resolution);
            }
            continue;
        }

        if let Some(fps) = parse_interval_line(line) {
            if let (Some(format), Some(resolution)) = (&current_format, &current_resolution) {
                capabilities.add_mode(format, resolution, fps);
            }
        }
    }

    capabilities
}

/// `[0]: 'MJPG' (Motion-JPEG)` -> ("MJPG", "Motion-JPEG")
fn parse_format_line(line: &str) -> Option<(&str, &str)> {
    if !line.starts_with('[') {
        return None;
    }
    let first_quote = line.find('\'')?;
    let rest = &line[first_quote + 1..];
    let second_quote = rest.find('\'')?;
    let fourcc = &rest[..second_quote];

    let tail = &rest[second_quote + 1..];
    let open = tail.find('(')?;
    let close = tail.rfind(')')?;
    if close <= open {
        return None;
    }
    // Drop trailing qualifiers like ", compressed"
    let description = tail[open + 1..close].split(',').next()?.trim();
    Some((fourcc, description))
}

/// `Size: Discrete 1920x1080` -> "1920x1080"
fn parse_size_line(line: &str) -> Option<String> {
    if !line.starts_with("Size:") {
        return None;
    }
    let token = line.split_whitespace().last()?;
    parse_resolution(token).map(|_| token.to_string())
}

/// `Interval: Discrete 0.033s (30.000 fps)` -> 30
fn parse_interval_line(line: &str) -> Option<u32> {
    if !line.starts_with("Interval:") {
        return None;
    }
    let open = line.find('(')?;
    let tail = &line[open + 1..];
    let fps_text = tail.strip_suffix("fps)").or_else(|| {
        let end = tail.find("fps)")?;
        Some(&tail[..end])
    })?;
    let fps: f64 = fps_text.trim().parse().ok()?;
    Some(fps as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "ioctl: VIDIOC_ENUM_FMT
\tType: Video Capture

\t[0]: 'MJPG' (Motion-JPEG, compressed)
\t\tSize: Discrete 1920x1080
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t\t\tInterval: Discrete 0.067s (15.000 fps)
\t\tSize: Discrete 1280x720
\t\t\tInterval: Discrete 0.017s (60.000 fps)
\t[1]: 'YUYV' (YUYV 4:2:2)
\t\tSize: Discrete 640x480
\t\t\tInterval: Discrete 0.033s (30.000 fps)
";

    #[test]
    fn test_parse_capabilities() {
        let caps = parse_capabilities(SAMPLE);
        assert_eq!(caps.formats.len(), 2);

        let mjpeg = caps.format("mjpeg").unwrap();
        assert_eq!(mjpeg.modes.len(), 2);
        assert_eq!(mjpeg.modes[0].resolution, "1920x1080");
        assert_eq!(mjpeg.modes[0].framerates, vec![30, 15]);
        assert_eq!(mjpeg.modes[1].resolution, "1280x720");
        assert_eq!(mjpeg.modes[1].framerates, vec![60]);

        let yuyv = caps.format("yuyv").unwrap();
        assert_eq!(yuyv.modes[0].resolution, "640x480");
    }

    #[test]
    fn test_format_normalization() {
        assert_eq!(normalize_format("MJPG", "Motion-JPEG"), "mjpeg");
        assert_eq!(normalize_format("H264", "H.264"), "h264");
        assert_eq!(normalize_format("YUYV", "YUYV 4:2:2"), "yuyv");
        // Unknown tokens fall through to the lowercased FourCC
        assert_eq!(normalize_format("GREY", "8-bit Greyscale"), "grey");
    }

    #[test]
    fn test_malformed_output_yields_empty() {
        assert!(parse_capabilities("").is_empty());
        assert!(parse_capabilities("completely unrelated text\nSize: nonsense").is_empty());
    }

    #[test]
    fn test_interval_line() {
        assert_eq!(
            parse_interval_line("Interval: Discrete 0.033s (30.000 fps)"),
            Some(30)
        );
        assert_eq!(parse_interval_line("Interval: Discrete 0.033s"), None);
    }
}
