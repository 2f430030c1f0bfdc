use serde::{Deserialize, Serialize};

use roost_db::camera::{Capabilities, CameraSettings};

/// Transient per-camera settings patch. Held only in memory, layered over
/// persisted settings at plan/build time, cleared explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsOverride {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub framerate: Option<u32>,
}

impl SettingsOverride {
    pub fn is_empty(&self) -> bool {
        self.format.is_none() && self.resolution.is_none() && self.framerate.is_none()
    }
}

/// The one place persisted settings and an override are combined. Callers
/// never merge fields ad hoc.
pub fn effective_settings(
    persisted: &CameraSettings,
    patch: Option<&SettingsOverride>,
) -> CameraSettings {
    let mut effective = persisted.clone();
    if let Some(patch) = patch {
        if let Some(format) = &patch.format {
            effective.format = format.clone();
        }
        if let Some(resolution) = &patch.resolution {
            effective.resolution = resolution.clone();
        }
        if let Some(framerate) = patch.framerate {
            effective.framerate = framerate;
        }
    }
    effective
}

pub fn parse_resolution(resolution: &str) -> Option<(u32, u32)> {
    let (w, h) = resolution.split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

pub fn pixel_count(resolution: &str) -> Option<u64> {
    parse_resolution(resolution).map(|(w, h)| w as u64 * h as u64)
}

/// Concrete valid alternatives returned alongside a validation rejection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Suggestions {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub formats: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resolutions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub framerates: Vec<u32>,
}

#[derive(Debug)]
pub struct ValidationRejection {
    pub reason: String,
    pub suggestions: Suggestions,
}

impl std::fmt::Display for ValidationRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for ValidationRejection {}

/// Check a fully-resolved settings value against cached capabilities.
/// Empty capabilities mean "unknown" and validate everything.
pub fn validate_against_capabilities(
    settings: &CameraSettings,
    capabilities: &Capabilities,
) -> Result<(), ValidationRejection> {
    if capabilities.is_empty() {
        return Ok(());
    }

    let Some(format) = capabilities.format(&settings.format) else {
        return Err(ValidationRejection {
            reason: format!("format '{}' is not supported by this device", settings.format),
            suggestions: Suggestions {
                formats: capabilities.formats.iter().map(|f| f.format.clone()).collect(),
                ..Default::default()
            },
        });
    };

    let Some(mode) = format.mode(&settings.resolution) else {
        return Err(ValidationRejection {
            reason: format!(
                "resolution {} is not available in format '{}'",
                settings.resolution, settings.format
            ),
            suggestions: Suggestions {
                resolutions: format.modes.iter().map(|m| m.resolution.clone()).collect(),
                ..Default::default()
            },
        });
    };

    if !mode.framerates.is_empty() && !mode.framerates.contains(&settings.framerate) {
        return Err(ValidationRejection {
            reason: format!(
                "{} fps is not available at {} in format '{}'",
                settings.framerate, settings.resolution, settings.format
            ),
            suggestions: Suggestions {
                framerates: mode.framerates.clone(),
                ..Default::default()
            },
        });
    }

    Ok(())
}
