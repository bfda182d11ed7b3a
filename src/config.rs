use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::error::{CalibError, CalibResult};
use crate::scheduler::OrderingKind;
use crate::types::ChipId;

/// One MUX's worth of wiring: which box modules drive its control lines,
/// readout and pump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WiringEntry {
    pub mux: u32,
    #[serde(default)]
    pub ctrl: Vec<String>,
    pub read_out: String,
    pub read_in: String,
    #[serde(default)]
    pub pump: Option<String>,
}

impl WiringEntry {
    /// All module names referenced by this entry, channel suffixes included.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.ctrl
            .iter()
            .map(String::as_str)
            .chain([self.read_out.as_str(), self.read_in.as_str()])
            .chain(self.pump.as_deref())
    }
}

/// Wiring description for a chip, as stored in `wiring.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WiringConfig {
    pub chip_id: ChipId,
    pub wiring: Vec<WiringEntry>,
}

impl WiringConfig {
    pub fn from_json(raw: &str) -> CalibResult<Self> {
        let cfg: WiringConfig = serde_json::from_str(raw)
            .map_err(|e| CalibError::config(format!("malformed wiring description: {e}")))?;

        if cfg.wiring.is_empty() {
            return Err(CalibError::config(format!(
                "wiring description for chip `{}` has no MUX entries",
                cfg.chip_id
            )));
        }

        let mut seen = std::collections::BTreeSet::new();
        for entry in &cfg.wiring {
            if !seen.insert(entry.mux) {
                return Err(CalibError::config(format!(
                    "MUX {} appears more than once in the wiring description",
                    entry.mux
                )));
            }
        }

        Ok(cfg)
    }

    pub fn load(path: &Path) -> CalibResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            CalibError::config(format!("cannot read wiring file {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }
}

/// Locate the wiring file: `CALIB_WIRING_CONFIG`, then
/// `$XDG_CONFIG_HOME/calib/wiring.json`, then `./wiring.json`.
pub fn resolve_wiring_path() -> CalibResult<PathBuf> {
    if let Ok(p) = env::var("CALIB_WIRING_CONFIG") {
        return Ok(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("calib").join("wiring.json");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = PathBuf::from("wiring.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(CalibError::config(
        "Could not find wiring.json (set CALIB_WIRING_CONFIG or create ./wiring.json)",
    ))
}

/// Runtime knobs for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently running units; `None` means one per group.
    pub max_parallel_ops: Option<usize>,
    /// Timeout applied to tasks that do not declare their own.
    pub task_timeout_secs: u64,
    pub ordering: OrderingKind,
    /// Root directory for the filesystem artifact store.
    pub artifact_root: PathBuf,
    /// Reject MUXes whose modules match no box type instead of treating them as MIXED.
    pub strict_wiring: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_ops: env::var("CALIB_MAX_PARALLEL_OPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0),
            task_timeout_secs: env::var("CALIB_TASK_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            ordering: env::var("CALIB_ORDERING")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            artifact_root: env::var("CALIB_ARTIFACT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("calib_artifacts")),
            strict_wiring: env::var("CALIB_STRICT_WIRING")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

impl OrchestratorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}
