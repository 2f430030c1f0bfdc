use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

/// Runtime configuration, read once at startup. Every value has a default
/// and an environment override so a packaged install needs no config file.
pub struct RoostConfig {
    db_url: String,
    backend_api_base: String,
    rtsp_port: u16,
    api_port: u16,
    telemetry_url: String,
    data_dir: PathBuf,
    debounce_delay: Duration,
    device_poll_interval: Duration,
    sync_interval: Duration,
    printing_poll_interval: Duration,
    standby_poll_interval: Duration,
    standby_delay: Duration,
}

impl RoostConfig {
    fn from_env() -> Self {
        let data_dir = std::env::var("ROOST_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".roost")
            });
        let db_url = std::env::var("ROOST_DB_URL")
            .unwrap_or_else(|_| data_dir.join("roost.db").to_string_lossy().into_owned());

        Self {
            db_url,
            backend_api_base: env_or("ROOST_BACKEND_API", "http://127.0.0.1:9997"),
            rtsp_port: env_u16("ROOST_RTSP_PORT", 8554),
            api_port: env_u16("ROOST_API_PORT", 8686),
            telemetry_url: env_or("ROOST_TELEMETRY_URL", "http://127.0.0.1:7125"),
            data_dir,
            debounce_delay: env_secs("ROOST_DEBOUNCE", 2),
            device_poll_interval: env_secs("ROOST_DEVICE_POLL", 2),
            sync_interval: env_secs("ROOST_SYNC_INTERVAL", 30),
            printing_poll_interval: env_secs("ROOST_PRINTING_POLL", 10),
            standby_poll_interval: env_secs("ROOST_STANDBY_POLL", 30),
            standby_delay: env_secs("ROOST_STANDBY_DELAY", 30),
        }
    }

    pub fn db_url(&self) -> &str {
        &self.db_url
    }

    pub fn backend_api_base(&self) -> &str {
        &self.backend_api_base
    }

    pub fn rtsp_port(&self) -> u16 {
        self.rtsp_port
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    pub fn telemetry_url(&self) -> &str {
        &self.telemetry_url
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn overlay_dir(&self) -> PathBuf {
        self.data_dir.join("overlays")
    }

    pub fn debounce_delay(&self) -> Duration {
        self.debounce_delay
    }

    pub fn device_poll_interval(&self) -> Duration {
        self.device_poll_interval
    }

    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    pub fn printing_poll_interval(&self) -> Duration {
        self.printing_poll_interval
    }

    pub fn standby_poll_interval(&self) -> Duration {
        self.standby_poll_interval
    }

    pub fn standby_delay(&self) -> Duration {
        self.standby_delay
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

pub fn config() -> &'static RoostConfig {
    static CONFIG: LazyLock<RoostConfig> = LazyLock::new(RoostConfig::from_env);
    &CONFIG
}
