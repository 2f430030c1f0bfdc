use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::device::run_command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    Int,
    Bool,
    Menu,
}

/// A named integer-valued device control with its range and current value.
#[derive(Debug, Clone, Serialize)]
pub struct ControlInfo {
    pub name: String,
    pub kind: ControlKind,
    pub min: i64,
    pub max: i64,
    pub step: i64,
    pub default: i64,
    pub value: i64,
    /// Menu controls only: value -> option label.
    pub options: Vec<(i64, String)>,
}

/// Enumerate the device's controls, including menu options. Button and
/// other unsupported control types are skipped.
pub async fn list_controls(device_path: &str) -> Vec<ControlInfo> {
    let output = match run_command(
        "v4l2-ctl",
        &["--device", device_path, "-L"],
        Duration::from_secs(5),
    )
    .await
    {
        Ok(output) if output.status.success() => output,
        _ => return Vec::new(),
    };

    parse_controls(&String::from_utf8_lossy(&output.stdout))
}

pub async fn get_control(device_path: &str, control: &str) -> Option<i64> {
    let query = format!("--get-ctrl={}", control);
    let output = run_command(
        "v4l2-ctl",
        &["--device", device_path, &query],
        Duration::from_secs(5),
    )
    .await
    .ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim() == control {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

pub async fn set_control(device_path: &str, control: &str, value: i64) -> anyhow::Result<()> {
    let mut single = BTreeMap::new();
    single.insert(control.to_string(), value);
    apply_controls(device_path, &single).await
}

/// Apply a batch of controls atomically in one `v4l2-ctl` call.
pub async fn apply_controls(
    device_path: &str,
    controls: &BTreeMap<String, i64>,
) -> anyhow::Result<()> {
    let Some(batch) = format_control_batch(controls) else {
        return Ok(());
    };
    let arg = format!("--set-ctrl={}", batch);
    let output = run_command(
        "v4l2-ctl",
        &["--device", device_path, &arg],
        Duration::from_secs(5),
    )
    .await?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "failed to apply controls to {}: {}",
            device_path,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    log::debug!("applied controls to {}: {}", device_path, batch);
    Ok(())
}

/// `{a: 1, b: 2}` -> `a=1,b=2`; `None` when the map is empty.
pub fn format_control_batch(controls: &BTreeMap<String, i64>) -> Option<String> {
    if controls.is_empty() {
        return None;
    }
    Some(
        controls
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Parse `v4l2-ctl -L` output:
///
/// ```text
/// brightness 0x00980900 (int)    : min=0 max=255 step=1 default=128 value=128
/// exposure_auto 0x009a0901 (menu)   : min=0 max=3 default=3 value=3
///         0: Manual Mode
///         1: Auto Mode
/// ```
pub fn parse_controls(output: &str) -> Vec<ControlInfo> {
    let mut controls: Vec<ControlInfo> = Vec::new();
    let mut in_menu = false;

    for raw in output.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(control) = parse_control_line(line) {
            in_menu = control.kind == ControlKind::Menu;
            controls.push(control);
            continue;
        }

        // Menu option lines follow their control, e.g. `1: Auto Mode`
        if in_menu {
            if let Some((value, label)) = line.split_once(':') {
                if let Ok(value) = value.trim().parse::<i64>() {
                    if let Some(last) = controls.last_mut() {
                        last.options.push((value, label.trim().to_string()));
                    }
                    continue;
                }
            }
            in_menu = false;
        }
    }

    controls
}

fn parse_control_line(line: &str) -> Option<ControlInfo> {
    let (head, attrs) = line.split_once(':')?;
    let mut tokens = head.split_whitespace();

    let name = tokens.next()?.to_string();
    let hex_id = tokens.next()?;
    if !hex_id.starts_with("0x") {
        return None;
    }
    let kind = match tokens.next()? {
        "(int)" => ControlKind::Int,
        "(bool)" => ControlKind::Bool,
        "(menu)" => ControlKind::Menu,
        _ => return None,
    };

    let mut control = ControlInfo {
        name,
        kind,
        min: 0,
        max: 0,
        step: 1,
        default: 0,
        value: 0,
        options: Vec::new(),
    };
    for attr in attrs.split_whitespace() {
        let Some((key, value)) = attr.split_once('=') else {
            continue;
        };
        let Ok(value) = value.parse::<i64>() else {
            continue;
        };
        match key {
            "min" => control.min = value,
            "max" => control.max = value,
            "step" => control.step = value,
            "default" => control.default = value,
            "value" => control.value = value,
            _ => {}
        }
    }
    Some(control)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
User Controls

                     brightness 0x00980900 (int)    : min=0 max=255 step=1 default=128 value=130
                       contrast 0x00980901 (int)    : min=0 max=255 step=1 default=128 value=128
 white_balance_temperature_auto 0x0098090c (bool)   : default=1 value=1
                  exposure_auto 0x009a0901 (menu)   : min=0 max=3 default=3 value=3
\t\t\t\t1: Manual Mode
\t\t\t\t3: Aperture Priority Mode
                 focus_absolute 0x009a090a (int)    : min=0 max=250 step=5 default=0 value=0 flags=inactive
";

    #[test]
    fn test_parse_controls() {
        let controls = parse_controls(SAMPLE);
        assert_eq!(controls.len(), 5);

        let brightness = &controls[0];
        assert_eq!(brightness.name, "brightness");
        assert_eq!(brightness.kind, ControlKind::Int);
        assert_eq!(brightness.min, 0);
        assert_eq!(brightness.max, 255);
        assert_eq!(brightness.default, 128);
        assert_eq!(brightness.value, 130);

        let auto_wb = &controls[2];
        assert_eq!(auto_wb.kind, ControlKind::Bool);
        assert_eq!(auto_wb.default, 1);

        let exposure = &controls[3];
        assert_eq!(exposure.kind, ControlKind::Menu);
        assert_eq!(
            exposure.options,
            vec![
                (1, "Manual Mode".to_string()),
                (3, "Aperture Priority Mode".to_string())
            ]
        );
    }

    #[test]
    fn test_menu_options_do_not_leak_into_next_control() {
        let controls = parse_controls(SAMPLE);
        let focus = &controls[4];
        assert_eq!(focus.name, "focus_absolute");
        assert!(focus.options.is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a real capture device at /dev/video0"]
    async fn test_get_set_roundtrip_on_live_device() {
        let controls = list_controls("/dev/video0").await;
        let brightness = controls
            .iter()
            .find(|c| c.name == "brightness")
            .expect("device exposes brightness");

        set_control("/dev/video0", "brightness", brightness.default)
            .await
            .unwrap();
        assert_eq!(
            get_control("/dev/video0", "brightness").await,
            Some(brightness.default)
        );
    }

    #[test]
    fn test_format_control_batch() {
        let mut controls = BTreeMap::new();
        controls.insert("brightness".to_string(), 140i64);
        controls.insert("contrast".to_string(), 100i64);
        assert_eq!(
            format_control_batch(&controls).as_deref(),
            Some("brightness=140,contrast=100")
        );
        assert_eq!(format_control_batch(&BTreeMap::new()), None);
    }
}
