use std::time::Duration;

use roost_db::camera::EncoderKind;

use crate::device::run_command;

/// Hardware encoder availability on this host. Software encoding is always
/// available and not tracked here.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderSupport {
    pub vaapi: bool,
    pub rkmpp: bool,
    pub v4l2m2m: bool,
}

impl EncoderSupport {
    pub fn any_hardware(&self) -> bool {
        self.vaapi || self.rkmpp || self.v4l2m2m
    }

    pub fn best(&self) -> EncoderKind {
        if self.vaapi {
            EncoderKind::Vaapi
        } else if self.rkmpp {
            EncoderKind::Rkmpp
        } else if self.v4l2m2m {
            EncoderKind::V4l2m2m
        } else {
            EncoderKind::Libx264
        }
    }
}

/// Probe `ffmpeg -encoders` and the relevant device nodes once at startup.
pub async fn detect_encoders() -> EncoderSupport {
    let encoder_list = match run_command(
        "ffmpeg",
        &["-hide_banner", "-encoders"],
        Duration::from_secs(10),
    )
    .await
    {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).into_owned()
        }
        _ => {
            log::warn!("could not list ffmpeg encoders, assuming software only");
            return EncoderSupport::default();
        }
    };

    let have_render_node = std::path::Path::new("/dev/dri/renderD128").exists();
    let have_m2m_node = has_m2m_encoder_node();
    let support = support_from_encoder_list(&encoder_list, have_render_node, have_m2m_node);

    if support.vaapi {
        log::info!("VAAPI hardware encoder detected");
    }
    if support.rkmpp {
        log::info!("Rockchip MPP hardware encoder detected");
    }
    if support.v4l2m2m {
        log::info!("V4L2M2M hardware encoder detected");
    }
    support
}

fn support_from_encoder_list(
    encoder_list: &str,
    have_render_node: bool,
    have_m2m_node: bool,
) -> EncoderSupport {
    EncoderSupport {
        vaapi: have_render_node && encoder_list.contains("h264_vaapi"),
        rkmpp: encoder_list.contains("h264_rkmpp"),
        v4l2m2m: have_m2m_node && encoder_list.contains("h264_v4l2m2m"),
    }
}

/// A stateless M2M encoder node (e.g. /dev/video11 on a Raspberry Pi) or a
/// Pi cpuinfo signature.
fn has_m2m_encoder_node() -> bool {
    if let Ok(entries) = std::fs::read_dir("/dev") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("video1") {
                return true;
            }
        }
    }
    if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
        if cpuinfo.contains("Raspberry Pi") || cpuinfo.contains("BCM") {
            return true;
        }
    }
    false
}

pub fn cpu_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Current CPU load as a percentage, derived from the 1-minute load
/// average normalized by core count.
pub fn cpu_load_percent() -> f64 {
    let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") else {
        return 50.0;
    };
    let Some(load1) = loadavg
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
    else {
        return 50.0;
    };
    (load1 / cpu_cores() as f64 * 100.0).clamp(0.0, 100.0)
}

/// Rate this host's encoding capability on a 1-10 scale: base score from
/// the core-count bucket, minus a load penalty bucket, plus 2 when a
/// hardware encoder is present.
pub fn capability_rating(cores: usize, load_percent: f64, hardware_encoder: bool) -> u8 {
    let base: i32 = if cores >= 8 {
        8
    } else if cores >= 4 {
        6
    } else if cores >= 2 {
        4
    } else {
        2
    };

    let load_penalty: i32 = if load_percent > 80.0 {
        3
    } else if load_percent > 60.0 {
        2
    } else if load_percent > 40.0 {
        1
    } else {
        0
    };

    let encoder_bonus: i32 = if hardware_encoder { 2 } else { 0 };

    (base - load_penalty + encoder_bonus).clamp(1, 10) as u8
}

/// Reduce the rating for shared contention: each active device beyond the
/// first costs one point, but never below 1.
pub fn adjusted_rating(rating: u8, active_count: usize) -> u8 {
    let reduction = active_count.saturating_sub(1) as i32;
    (rating as i32 - reduction).max(1) as u8
}

pub fn estimate_capability(encoders: &EncoderSupport) -> u8 {
    capability_rating(cpu_cores(), cpu_load_percent(), encoders.any_hardware())
}

/// The processing executable is a hard requirement; missing means the
/// daemon cannot do its job at all.
pub async fn check_ffmpeg_available() -> bool {
    matches!(
        run_command("ffmpeg", &["-version"], Duration::from_secs(5)).await,
        Ok(output) if output.status.success()
    )
}

pub async fn check_v4l2ctl_available() -> bool {
    matches!(
        run_command("v4l2-ctl", &["--version"], Duration::from_secs(5)).await,
        Ok(output) if output.status.success()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rating_stays_in_range() {
        for cores in [1, 2, 4, 6, 8, 32] {
            for load in [0.0, 39.9, 40.1, 60.1, 80.1, 100.0] {
                for hw in [false, true] {
                    let rating = capability_rating(cores, load, hw);
                    assert!((1..=10).contains(&rating), "rating {} out of range", rating);
                }
            }
        }
    }

    #[test]
    fn test_rating_core_buckets() {
        assert_eq!(capability_rating(1, 0.0, false), 2);
        assert_eq!(capability_rating(2, 0.0, false), 4);
        assert_eq!(capability_rating(4, 0.0, false), 6);
        assert_eq!(capability_rating(8, 0.0, false), 8);
        assert_eq!(capability_rating(16, 0.0, false), 8);
    }

    #[test]
    fn test_rating_monotonic_in_load() {
        let loads = [0.0, 50.0, 70.0, 90.0];
        for window in loads.windows(2) {
            assert!(
                capability_rating(8, window[0], false) >= capability_rating(8, window[1], false)
            );
        }
    }

    #[test]
    fn test_encoder_bonus_is_exactly_two() {
        // Away from the clamp boundaries the bonus is exactly +2
        assert_eq!(
            capability_rating(4, 50.0, true) - capability_rating(4, 50.0, false),
            2
        );
        assert_eq!(
            capability_rating(2, 0.0, true) - capability_rating(2, 0.0, false),
            2
        );
    }

    #[test]
    fn test_adjusted_rating_contention() {
        assert_eq!(adjusted_rating(8, 0), 8);
        assert_eq!(adjusted_rating(8, 1), 8);
        assert_eq!(adjusted_rating(8, 3), 6);
        // Never below 1 and monotonically non-increasing in device count
        assert_eq!(adjusted_rating(2, 10), 1);
        for count in 1..8 {
            assert!(adjusted_rating(6, count) >= adjusted_rating(6, count + 1));
        }
    }

    #[test]
    fn test_support_from_encoder_list() {
        let listing = " V..... h264_vaapi\n V..... h264_v4l2m2m\n V..... libx264\n";
        let support = support_from_encoder_list(listing, true, true);
        assert!(support.vaapi);
        assert!(support.v4l2m2m);
        assert!(!support.rkmpp);
        assert_eq!(support.best(), EncoderKind::Vaapi);

        // No render node means no VAAPI even if ffmpeg lists the encoder
        let support = support_from_encoder_list(listing, false, true);
        assert!(!support.vaapi);
        assert_eq!(support.best(), EncoderKind::V4l2m2m);

        let support = support_from_encoder_list(" V..... libx264\n", true, true);
        assert!(!support.any_hardware());
        assert_eq!(support.best(), EncoderKind::Libx264);
    }
}
