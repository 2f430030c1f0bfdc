use super::*;
use crate::hardware::capability_rating;

fn caps(entries: &[(&str, &[(&str, &[u32])])]) -> Capabilities {
    let mut caps = Capabilities::default();
    for (format, modes) in entries {
        caps.add_format(format);
        for (resolution, framerates) in *modes {
            for fps in *framerates {
                caps.add_mode(format, resolution, *fps);
            }
        }
    }
    caps
}

// ------------------------------------------------------------------------
// Tier table
// ------------------------------------------------------------------------

#[test]
fn test_tier_table_total_and_non_overlapping() {
    for rating in 1u8..=10 {
        let matching = QUALITY_TIERS
            .iter()
            .filter(|t| (t.min_rating..=t.max_rating).contains(&rating))
            .count();
        assert_eq!(matching, 1, "rating {} matches {} tiers", rating, matching);
    }
}

#[test]
fn test_tier_lookup_clamps_out_of_range() {
    assert_eq!(tier_for(0).resolution, "640x480");
    assert_eq!(tier_for(11).framerate, 60);
}

#[test]
fn test_tier_values() {
    assert_eq!(tier_for(1).bitrate, "1M");
    assert_eq!(tier_for(4).resolution, "1280x720");
    assert_eq!(tier_for(7).framerate, 30);
    assert_eq!(tier_for(9).bitrate, "6M");
    assert_eq!(tier_for(10).resolution, "1920x1080");
}

// ------------------------------------------------------------------------
// Snapping
// ------------------------------------------------------------------------

fn modes(resolutions: &[&str]) -> Vec<ResolutionCaps> {
    resolutions
        .iter()
        .map(|r| ResolutionCaps {
            resolution: r.to_string(),
            framerates: vec![30],
        })
        .collect()
}

#[test]
fn test_snap_resolution_minimizes_pixel_distance() {
    let available = modes(&["640x480", "1920x1080", "1280x960"]);
    assert_eq!(snap_resolution("1280x720", &available), "1280x960");
    assert_eq!(snap_resolution("640x480", &available), "640x480");
    assert_eq!(snap_resolution("3840x2160", &available), "1920x1080");
}

#[test]
fn test_snap_resolution_tie_keeps_first_seen() {
    // 800x600 and 600x800 have identical pixel counts; the first entry wins
    let available = modes(&["800x600", "600x800"]);
    assert_eq!(snap_resolution("1024x768", &available), "800x600");

    let reversed = modes(&["600x800", "800x600"]);
    assert_eq!(snap_resolution("1024x768", &reversed), "600x800");
}

#[test]
fn test_snap_resolution_empty_keeps_target() {
    assert_eq!(snap_resolution("1280x720", &[]), "1280x720");
}

#[test]
fn test_snap_framerate() {
    assert_eq!(snap_framerate(30, &[5, 10, 15, 25]), 25);
    assert_eq!(snap_framerate(30, &[30, 60]), 30);
    assert_eq!(snap_framerate(30, &[]), 30);
    // Equidistant: first-seen wins
    assert_eq!(snap_framerate(20, &[15, 25]), 15);
    assert_eq!(snap_framerate(20, &[25, 15]), 25);
}

// ------------------------------------------------------------------------
// Planning
// ------------------------------------------------------------------------

#[test]
fn test_plan_idle_six_core_host_prefers_mjpeg() {
    // Idle 6-core host, no hardware encoder, one active camera -> rating 6,
    // tier (1280x720, 30, "4M")
    let rating = capability_rating(6, 10.0, false);
    assert_eq!(rating, 6);

    let caps = caps(&[
        ("yuyv", &[("640x480", &[30])]),
        ("mjpeg", &[("1280x720", &[30, 60]), ("1920x1080", &[30])]),
    ]);
    let settings = plan(&caps, rating, 1, EncoderKind::Libx264);
    assert_eq!(settings.format, "mjpeg");
    assert_eq!(settings.resolution, "1280x720");
    assert_eq!(settings.framerate, 30);
    assert_eq!(settings.bitrate, "4M");
}

#[test]
fn test_plan_rating_seven_example() {
    // Rating 7 maps to the same (1280x720, 30, "4M") tier
    let caps = caps(&[("mjpeg", &[("1280x720", &[30])])]);
    let settings = plan(&caps, 7, 1, EncoderKind::Libx264);
    assert_eq!(
        (
            settings.format.as_str(),
            settings.resolution.as_str(),
            settings.framerate,
            settings.bitrate.as_str()
        ),
        ("mjpeg", "1280x720", 30, "4M")
    );
}

#[test]
fn test_plan_prefers_format_with_target_resolution() {
    // mjpeg lacks the tier resolution, h264 has it: h264 wins even though
    // mjpeg has the higher priority
    let caps = caps(&[
        ("mjpeg", &[("640x480", &[30])]),
        ("h264", &[("1280x720", &[30])]),
    ]);
    let settings = plan(&caps, 6, 1, EncoderKind::Libx264);
    assert_eq!(settings.format, "h264");
    assert_eq!(settings.resolution, "1280x720");
}

#[test]
fn test_plan_snaps_when_no_format_has_target() {
    let caps = caps(&[("mjpeg", &[("1024x768", &[10, 20]), ("320x240", &[30])])]);
    let settings = plan(&caps, 6, 1, EncoderKind::Libx264);
    assert_eq!(settings.format, "mjpeg");
    assert_eq!(settings.resolution, "1024x768");
    // 30 is unavailable at that resolution; nearest is 20
    assert_eq!(settings.framerate, 20);
}

#[test]
fn test_plan_contention_lowers_tier() {
    let caps = caps(&[(
        "mjpeg",
        &[
            ("640x480", &[15, 30]),
            ("1280x720", &[15, 30]),
            ("1920x1080", &[30]),
        ],
    )]);
    // rating 8 alone -> 1080p tier
    let alone = plan(&caps, 8, 1, EncoderKind::Libx264);
    assert_eq!(alone.resolution, "1920x1080");

    // Three additional active cameras drop the adjusted rating to 5
    let crowded = plan(&caps, 8, 4, EncoderKind::Libx264);
    assert_eq!(crowded.resolution, "1280x720");
    assert_eq!(crowded.framerate, 15);
}

#[test]
fn test_plan_empty_capabilities_uses_default_bundle() {
    let settings = plan(&Capabilities::default(), 6, 1, EncoderKind::Vaapi);
    assert_eq!(settings.format, "mjpeg");
    assert_eq!(settings.resolution, "1280x720");
    assert_eq!(settings.framerate, 30);
    assert_eq!(settings.bitrate, "4M");
    assert_eq!(settings.encoder, EncoderKind::Vaapi);
}

#[test]
fn test_format_priority_order() {
    assert!(format_priority("mjpeg") > format_priority("h264"));
    assert!(format_priority("h264") > format_priority("yuyv"));
    assert!(format_priority("yuyv") > format_priority("nv12"));
    assert!(format_priority("nv12") > format_priority("rgb24"));
    assert_eq!(format_priority("unknown"), 0);
}
