use roost_db::camera::{Capabilities, CameraSettings, EncoderKind, FormatCaps, ResolutionCaps};

use crate::hardware::adjusted_rating;
use crate::settings::pixel_count;

/// One quality tier. The table below is total and non-overlapping over
/// ratings 1..=10.
pub struct QualityTier {
    pub min_rating: u8,
    pub max_rating: u8,
    pub resolution: &'static str,
    pub framerate: u32,
    pub bitrate: &'static str,
}

pub const QUALITY_TIERS: &[QualityTier] = &[
    QualityTier {
        min_rating: 1,
        max_rating: 3,
        resolution: "640x480",
        framerate: 15,
        bitrate: "1M",
    },
    QualityTier {
        min_rating: 4,
        max_rating: 5,
        resolution: "1280x720",
        framerate: 15,
        bitrate: "2M",
    },
    QualityTier {
        min_rating: 6,
        max_rating: 7,
        resolution: "1280x720",
        framerate: 30,
        bitrate: "4M",
    },
    QualityTier {
        min_rating: 8,
        max_rating: 9,
        resolution: "1920x1080",
        framerate: 30,
        bitrate: "6M",
    },
    QualityTier {
        min_rating: 10,
        max_rating: 10,
        resolution: "1920x1080",
        framerate: 60,
        bitrate: "8M",
    },
];

/// Higher is preferred: compressed formats beat raw ones, which would need
/// far more USB bandwidth and encode work.
const FORMAT_PRIORITY: &[(&str, i32)] = &[
    ("mjpeg", 100),
    ("h264", 90),
    ("yuyv", 50),
    ("yuyv422", 50),
    ("nv12", 40),
    ("rgb24", 30),
];

pub fn format_priority(format: &str) -> i32 {
    FORMAT_PRIORITY
        .iter()
        .find(|(name, _)| *name == format)
        .map(|(_, priority)| *priority)
        .unwrap_or(0)
}

pub fn tier_for(rating: u8) -> &'static QualityTier {
    let rating = rating.clamp(1, 10);
    QUALITY_TIERS
        .iter()
        .find(|t| (t.min_rating..=t.max_rating).contains(&rating))
        .expect("tier table covers 1..=10")
}

/// Compute a concrete settings bundle from probed capabilities, the host
/// capability rating, and the number of currently active devices. The
/// result is always realizable against the capabilities, or the documented
/// default bundle when none exist.
pub fn plan(
    capabilities: &Capabilities,
    rating: u8,
    active_count: usize,
    encoder: EncoderKind,
) -> CameraSettings {
    let rating = adjusted_rating(rating, active_count);
    let tier = tier_for(rating);

    let mut settings = CameraSettings {
        resolution: tier.resolution.to_string(),
        framerate: tier.framerate,
        bitrate: tier.bitrate.to_string(),
        encoder,
        ..CameraSettings::default()
    };

    if capabilities.is_empty() {
        log::info!(
            "no capabilities known, planning default bundle {} {} @{}fps",
            settings.format,
            settings.resolution,
            settings.framerate
        );
        return settings;
    }

    let format = select_format(capabilities, tier.resolution);
    settings.format = format.format.clone();
    settings.resolution = snap_resolution(tier.resolution, &format.modes);

    if let Some(mode) = format.mode(&settings.resolution) {
        settings.framerate = snap_framerate(tier.framerate, &mode.framerates);
    }

    log::info!(
        "planned {} {} @{}fps {} (rating {})",
        settings.format,
        settings.resolution,
        settings.framerate,
        settings.bitrate,
        rating
    );
    settings
}

/// Prefer the highest-priority format that carries the target resolution;
/// otherwise the highest-priority format overall. Equal priorities resolve
/// to the format the device reported first.
fn select_format<'a>(capabilities: &'a Capabilities, target_resolution: &str) -> &'a FormatCaps {
    let mut best: Option<&FormatCaps> = None;
    let mut best_priority = i32::MIN;
    for format in &capabilities.formats {
        let priority = format_priority(&format.format);
        if priority > best_priority && format.mode(target_resolution).is_some() {
            best = Some(format);
            best_priority = priority;
        }
    }
    if let Some(format) = best {
        return format;
    }

    let mut best = &capabilities.formats[0];
    let mut best_priority = format_priority(&best.format);
    for format in &capabilities.formats[1..] {
        let priority = format_priority(&format.format);
        if priority > best_priority {
            best = format;
            best_priority = priority;
        }
    }
    best
}

/// Snap to the available resolution minimizing absolute pixel-count
/// distance; ties keep the first-seen entry.
pub fn snap_resolution(target: &str, available: &[ResolutionCaps]) -> String {
    let Some(target_pixels) = pixel_count(target) else {
        return target.to_string();
    };
    let mut best: Option<(&str, u64)> = None;
    for mode in available {
        let Some(pixels) = pixel_count(&mode.resolution) else {
            continue;
        };
        let distance = pixels.abs_diff(target_pixels);
        if best.is_none_or(|(_, best_distance)| distance < best_distance) {
            best = Some((&mode.resolution, distance));
        }
    }
    best.map(|(resolution, _)| resolution.to_string())
        .unwrap_or_else(|| target.to_string())
}

/// Snap to the nearest available framerate by absolute distance; ties keep
/// the first-seen entry.
pub fn snap_framerate(target: u32, available: &[u32]) -> u32 {
    if available.is_empty() || available.contains(&target) {
        return target;
    }
    let mut best = available[0];
    let mut best_distance = best.abs_diff(target);
    for &fps in &available[1..] {
        let distance = fps.abs_diff(target);
        if distance < best_distance {
            best = fps;
            best_distance = distance;
        }
    }
    best
}

#[cfg(test)]
#[path = "planner_test.rs"]
mod planner_test;
