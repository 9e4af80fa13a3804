//! Last-known readings cache.
//!
//! The poll operation is the only writer; the ramp controller, the
//! check engine's simulated mode, and the trip-recovery supervisor
//! read from here instead of contending with the device command
//! queue.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use crate::flags::ChannelStatus;

/// Last-known values for one channel, captured by a poll operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelReading {
    /// Voltage setpoint [V].
    pub vset: f64,
    /// Current setpoint [uA].
    pub iset: f64,
    /// Monitored voltage [V].
    pub vmon: f64,
    /// Monitored current [uA].
    pub imon: f64,
    /// Status word at capture time.
    pub status: ChannelStatus,
    /// Capture timestamp.
    pub at: SystemTime,
}

impl Default for ChannelReading {
    fn default() -> Self {
        Self {
            vset: 0.0,
            iset: 0.0,
            vmon: 0.0,
            imon: 0.0,
            status: ChannelStatus::empty(),
            at: SystemTime::UNIX_EPOCH,
        }
    }
}

/// Last-known device-level safety state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSnapshot {
    /// Names of the alarm bits currently active.
    pub active_alarms: Vec<String>,
    /// Hardware interlock flag.
    pub interlock: bool,
}

impl DeviceSnapshot {
    /// Returns true if any alarm bit or the interlock is active.
    #[inline]
    pub fn tripped(&self) -> bool {
        self.interlock || !self.active_alarms.is_empty()
    }
}

/// Shared cache of last-known channel readings and device snapshots.
///
/// Channel entries are keyed by condition key (spaces elided), device
/// entries by device name. Interior locking keeps callers free of
/// lock-ordering concerns; readers never block a poll for long.
#[derive(Debug, Default)]
pub struct ReadingsCache {
    channels: RwLock<HashMap<String, ChannelReading>>,
    devices: RwLock<HashMap<String, DeviceSnapshot>>,
}

impl ReadingsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh reading for `key`.
    pub fn update_channel(&self, key: &str, reading: ChannelReading) {
        let mut map = self.channels.write().unwrap_or_else(|e| e.into_inner());
        map.insert(key.to_string(), reading);
    }

    /// Last-known reading for `key`, if any poll has completed.
    pub fn channel(&self, key: &str) -> Option<ChannelReading> {
        let map = self.channels.read().unwrap_or_else(|e| e.into_inner());
        map.get(key).copied()
    }

    /// Record a fresh device-level snapshot.
    pub fn update_device(&self, device: &str, snapshot: DeviceSnapshot) {
        let mut map = self.devices.write().unwrap_or_else(|e| e.into_inner());
        map.insert(device.to_string(), snapshot);
    }

    /// Last-known device snapshot, if any poll has completed.
    pub fn device(&self, device: &str) -> Option<DeviceSnapshot> {
        let map = self.devices.read().unwrap_or_else(|e| e.into_inner());
        map.get(device).cloned()
    }

    /// Condition keys of all channels seen so far.
    pub fn channel_keys(&self) -> Vec<String> {
        let map = self.channels.read().unwrap_or_else(|e| e.into_inner());
        map.keys().cloned().collect()
    }
}
