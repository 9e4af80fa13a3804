//! TOML-backed configuration.
//!
//! Two files are loaded at startup:
//! - the *checks file*: named boolean safety conditions, one table per
//!   logical group (one group per device plus `multidevice`);
//! - the *supervisor file*: `[ramp]` and `[recovery]` tables tuning
//!   the ramp protocol and the trip-recovery supervisor.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration load/parse error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

// ─── Checks file ────────────────────────────────────────────────────

/// One named safety condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckEntry {
    /// Display name, reported on failure.
    pub name: String,
    /// Boolean condition over `ChannelName.attribute` identifiers.
    pub condition: String,
    /// Human-readable description, carried into alert messages.
    #[serde(default)]
    pub description: String,
    /// Disabled entries are vacuously true.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// One group of checks (per device, or `multidevice`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckGroup {
    /// Checks belonging to this group.
    #[serde(default)]
    pub check: Vec<CheckEntry>,
}

/// The whole checks file: group name → entries.
///
/// ```toml
/// [[caen.check]]
/// name = "1bar, Vgem"
/// condition = "gem top.vset - gem bottom.vset <= 270"
/// description = "Maximum Vgem = 270 V"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ChecksConfig {
    pub groups: BTreeMap<String, CheckGroup>,
}

impl ChecksConfig {
    /// Parse from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Entries of one group; missing groups are empty, not an error.
    pub fn group(&self, name: &str) -> &[CheckEntry] {
        self.groups.get(name).map(|g| g.check.as_slice()).unwrap_or(&[])
    }
}

// ─── Supervisor file ────────────────────────────────────────────────

/// Ramp protocol tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RampConfig {
    /// Shared ramp-coordinate step size [V].
    #[serde(default = "default_step")]
    pub step: f64,
    /// Per-step convergence timeout [s].
    #[serde(default = "default_step_timeout")]
    pub step_timeout: f64,
    /// Pause between converged steps [s].
    #[serde(default = "default_settle")]
    pub settle: f64,
    /// Convergence poll interval [s]; also the cancellation latency bound.
    #[serde(default = "default_ramp_poll")]
    pub poll_interval: f64,
}

fn default_step() -> f64 {
    100.0
}
fn default_step_timeout() -> f64 {
    60.0
}
fn default_settle() -> f64 {
    2.0
}
fn default_ramp_poll() -> f64 {
    1.0
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            step: 100.0,
            step_timeout: 60.0,
            settle: 2.0,
            poll_interval: 1.0,
        }
    }
}

impl RampConfig {
    #[inline]
    pub fn step_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.step_timeout)
    }
    #[inline]
    pub fn settle_duration(&self) -> Duration {
        Duration::from_secs_f64(self.settle)
    }
    #[inline]
    pub fn poll_duration(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }
}

/// Trip-recovery supervisor tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RecoveryConfig {
    /// Alarm/interlock poll interval [s].
    #[serde(default = "default_monitor_poll")]
    pub poll_interval: f64,
    /// Trips tolerated before the supervisor gives up.
    #[serde(default = "default_max_trips")]
    pub max_trips: u32,
    /// Re-ramp attempts per recovery cycle.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause after clearing the alarm, before re-powering [s].
    #[serde(default = "default_cooldown")]
    pub cooldown: f64,
    /// Monitored voltage below which a channel counts as down [V].
    #[serde(default = "default_down_threshold")]
    pub down_threshold: f64,
    /// Bound on the wait for all channels to fall below the
    /// down-threshold [s]; exceeding it is fatal.
    #[serde(default = "default_down_timeout")]
    pub down_timeout: f64,
}

fn default_monitor_poll() -> f64 {
    2.0
}
fn default_max_trips() -> u32 {
    5
}
fn default_max_attempts() -> u32 {
    3
}
fn default_cooldown() -> f64 {
    30.0
}
fn default_down_threshold() -> f64 {
    50.0
}
fn default_down_timeout() -> f64 {
    120.0
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: 2.0,
            max_trips: 5,
            max_attempts: 3,
            cooldown: 30.0,
            down_threshold: 50.0,
            down_timeout: 120.0,
        }
    }
}

impl RecoveryConfig {
    #[inline]
    pub fn poll_duration(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }
    #[inline]
    pub fn cooldown_duration(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown)
    }
    #[inline]
    pub fn down_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.down_timeout)
    }
}

/// One channel of the armed ramp plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanChannelConfig {
    /// Channel display name (spaces allowed).
    pub name: String,
    /// Target voltage [V].
    pub target: f64,
    /// Per-channel ratio to the shared ramp coordinate.
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Convergence tolerance [V].
    #[serde(default = "default_precision")]
    pub precision: f64,
}

fn default_factor() -> f64 {
    1.0
}
fn default_precision() -> f64 {
    1.0
}

/// The supervisor file (`hvsc.toml`).
///
/// When `[[plan.channel]]` entries are present the binary arms the
/// trip-recovery supervisor with that plan at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub ramp: RampConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub plan: PlanConfig,
}

/// Optional armed ramp plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanConfig {
    #[serde(default)]
    pub channel: Vec<PlanChannelConfig>,
}

impl SupervisorConfig {
    /// Parse from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }
}
