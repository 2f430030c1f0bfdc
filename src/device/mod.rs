use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

pub mod control;
pub mod probe;
pub mod watch;

/// Identity of an OS-visible capture endpoint. The path is ephemeral and
/// may change across reconnects; `hardware_id` is the stable key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: String,
    pub hardware_name: String,
    pub serial_number: Option<String>,
    pub hardware_id: String,
}

impl DeviceInfo {
    pub fn new(path: &str, hardware_name: &str, serial_number: Option<String>) -> Self {
        let hardware_id = match &serial_number {
            Some(serial) => format!("{}-{}", hardware_name, serial),
            None => hardware_name.to_string(),
        };
        Self {
            path: path.to_string(),
            hardware_name: hardware_name.to_string(),
            serial_number,
            hardware_id,
        }
    }
}

/// Run an external command with an explicit timeout. Used for every
/// device-control subprocess so a wedged device cannot stall a loop.
pub(crate) async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> anyhow::Result<Output> {
    let output = tokio::time::timeout(timeout, Command::new(program).args(args).output())
        .await
        .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", program, timeout))??;
    Ok(output)
}

/// Query device identity: card name from `v4l2-ctl --info`, serial number
/// from the sysfs USB parent chain.
pub async fn device_info(device_path: &str) -> Option<DeviceInfo> {
    let output = run_command(
        "v4l2-ctl",
        &["--device", device_path, "--info"],
        Duration::from_secs(5),
    )
    .await
    .ok()?;
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let hardware_name = parse_card_name(&stdout).unwrap_or_else(|| "Unknown Camera".to_string());
    let serial_number = sysfs_serial_number(device_path);

    Some(DeviceInfo::new(device_path, &hardware_name, serial_number))
}

pub(crate) fn parse_card_name(info_output: &str) -> Option<String> {
    for line in info_output.lines() {
        if line.contains("Card type") {
            if let Some((_, value)) = line.split_once(':') {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Walk up the sysfs device tree looking for a `serial` attribute on a
/// parent USB device.
fn sysfs_serial_number(device_path: &str) -> Option<String> {
    let name = std::path::Path::new(device_path).file_name()?.to_str()?;
    let sysfs = std::path::Path::new("/sys/class/video4linux")
        .join(name)
        .join("device");
    let mut dir = std::fs::canonicalize(sysfs).ok()?;

    for _ in 0..5 {
        let serial_file = dir.join("serial");
        if serial_file.exists() {
            let serial = std::fs::read_to_string(serial_file).ok()?;
            let serial = serial.trim();
            if !serial.is_empty() {
                return Some(serial.to_string());
            }
            return None;
        }
        dir = dir.parent()?.to_path_buf();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_id_derivation() {
        let with_serial = DeviceInfo::new("/dev/video0", "HD Webcam C920", Some("F1D2".into()));
        assert_eq!(with_serial.hardware_id, "HD Webcam C920-F1D2");

        let without_serial = DeviceInfo::new("/dev/video2", "Generic USB Camera", None);
        assert_eq!(without_serial.hardware_id, "Generic USB Camera");
    }

    #[test]
    fn test_parse_card_name() {
        let output = "Driver Info:\n\tDriver name      : uvcvideo\n\tCard type        : HD Pro Webcam C920\n\tBus info         : usb-0000:00:14.0-1\n";
        assert_eq!(
            parse_card_name(output).as_deref(),
            Some("HD Pro Webcam C920")
        );
        assert_eq!(parse_card_name("no card line here"), None);
    }
}
