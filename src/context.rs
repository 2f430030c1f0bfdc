use std::collections::{BTreeMap, HashMap};

use tokio::sync::{Mutex, RwLock};

use crate::backend::BackendClient;
use crate::device::watch::RejectedCamera;
use crate::hardware::EncoderSupport;
use crate::printer::{PrintState, PrintStatus, TelemetryClient};
use crate::reconcile::SyncStats;
use crate::settings::SettingsOverride;

/// Everything the background loops and request handlers share. Constructed
/// once at startup and passed explicitly; nothing here is reachable as an
/// ambient global.
pub struct Context {
    pub db: roost_db::RoostDatabase,
    pub backend: BackendClient,
    pub telemetry: Option<TelemetryClient>,
    pub encoders: EncoderSupport,
    /// Transient per-camera setting patches, keyed by camera id.
    pub overrides: RwLock<HashMap<String, SettingsOverride>>,
    /// Hardware default control values per device path, captured at
    /// connect time. Used to reduce the one-shot control push to values
    /// that actually differ.
    pub control_defaults: RwLock<HashMap<String, BTreeMap<String, i64>>>,
    /// Devices refused at connect time, surfaced through the status API.
    pub rejected: Mutex<Vec<RejectedCamera>>,
    /// Latest telemetry snapshot plus the hysteresis-filtered state.
    pub print_state: RwLock<PrintSnapshot>,
    pub sync_stats: Mutex<SyncStats>,
}

#[derive(Clone)]
pub struct PrintSnapshot {
    pub status: PrintStatus,
    pub state: PrintState,
}

impl Default for PrintSnapshot {
    fn default() -> Self {
        Self {
            status: PrintStatus::default(),
            state: PrintState::Standby,
        }
    }
}

impl Context {
    pub fn new(
        db: roost_db::RoostDatabase,
        backend: BackendClient,
        telemetry: Option<TelemetryClient>,
        encoders: EncoderSupport,
    ) -> Self {
        Self {
            db,
            backend,
            telemetry,
            encoders,
            overrides: RwLock::new(HashMap::new()),
            control_defaults: RwLock::new(HashMap::new()),
            rejected: Mutex::new(Vec::new()),
            print_state: RwLock::new(PrintSnapshot::default()),
            sync_stats: Mutex::new(SyncStats::default()),
        }
    }

    pub async fn record_rejection(&self, rejection: RejectedCamera) {
        let mut rejected = self.rejected.lock().await;
        rejected.retain(|r| r.path != rejection.path);
        rejected.push(rejection);
    }

    pub async fn print_snapshot(&self) -> PrintSnapshot {
        self.print_state.read().await.clone()
    }

    pub async fn is_printing(&self) -> bool {
        self.print_state.read().await.state == PrintState::Printing
    }
}
