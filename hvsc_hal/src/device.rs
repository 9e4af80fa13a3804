//! Device facade traits and error types.
//!
//! This module defines:
//! - `HvChannel` trait - one high-voltage output channel
//! - `HvDevice` trait - a power supply owning an ordered channel set
//! - `HalError` enum - error types for facade operations
//! - `AlarmStatus` - named alarm bits reported by a device
//!
//! Any facade call may fail with `HalError::CommunicationError` at any
//! time; the control core treats that as an aborted operation with the
//! last-known state left in place.

use std::collections::BTreeMap;

use hvsc_common::condition_key;
use hvsc_common::flags::ChannelStatus;
use thiserror::Error;

use crate::properties::{PropertyDescriptor, PropertyValue};

/// Error types for facade operations.
#[derive(Debug, Clone, Error)]
pub enum HalError {
    /// Driver initialization failed
    #[error("initialization failed: {0}")]
    InitFailed(String),

    /// Hardware communication error
    #[error("communication error: {0}")]
    CommunicationError(String),

    /// No channel with the given name or index
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// Property not present in the device's descriptor registry
    #[error("unsupported property '{property}' on channel '{channel}'")]
    UnsupportedProperty { channel: String, property: String },

    /// Value rejected by a property descriptor or a setter
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Channel attributes visible to the condition language.
pub const CHANNEL_ATTRIBUTES: &[&str] = &["vset", "vmon", "imon", "iset", "on"];

/// A value read through the attribute interface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttrValue {
    Num(f64),
    Bool(bool),
}

/// One high-voltage output channel.
///
/// Setters are reached only through the command serializer; getters
/// may be called by the check engine while the owning device's lock
/// is held.
pub trait HvChannel: Send {
    /// Display name (may contain spaces), unique within the device.
    fn name(&self) -> &str;

    /// Voltage setpoint [V].
    fn vset(&self) -> Result<f64, HalError>;
    /// Write the voltage setpoint [V].
    fn set_vset(&mut self, volts: f64) -> Result<(), HalError>;

    /// Current setpoint [uA].
    fn iset(&self) -> Result<f64, HalError>;
    /// Write the current setpoint [uA].
    fn set_iset(&mut self, current: f64) -> Result<(), HalError>;

    /// Monitored voltage [V].
    fn vmon(&self) -> Result<f64, HalError>;
    /// Monitored current [uA].
    fn imon(&self) -> Result<f64, HalError>;

    /// Status word.
    fn status(&self) -> Result<ChannelStatus, HalError>;

    /// Enable the output.
    fn turn_on(&mut self) -> Result<(), HalError>;
    /// Disable the output.
    fn turn_off(&mut self) -> Result<(), HalError>;

    /// Attribute lookup for the condition language.
    ///
    /// Returns `Ok(None)` for names outside [`CHANNEL_ATTRIBUTES`];
    /// the check engine turns that into a name error.
    fn attribute(&self, name: &str) -> Result<Option<AttrValue>, HalError> {
        Ok(match name {
            "vset" => Some(AttrValue::Num(self.vset()?)),
            "vmon" => Some(AttrValue::Num(self.vmon()?)),
            "imon" => Some(AttrValue::Num(self.imon()?)),
            "iset" => Some(AttrValue::Num(self.iset()?)),
            "on" => Some(AttrValue::Bool(self.status()?.is_on())),
            _ => None,
        })
    }
}

/// Named alarm bits reported by a device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmStatus {
    bits: BTreeMap<String, bool>,
}

impl AlarmStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or clear one named bit.
    pub fn set(&mut self, name: &str, active: bool) {
        self.bits.insert(name.to_string(), active);
    }

    /// Returns true if any bit is active.
    pub fn any(&self) -> bool {
        self.bits.values().any(|&v| v)
    }

    /// Names of the active bits, in stable order.
    pub fn active(&self) -> Vec<String> {
        self.bits
            .iter()
            .filter(|(_, &v)| v)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Clear every bit.
    pub fn clear(&mut self) {
        for v in self.bits.values_mut() {
            *v = false;
        }
    }
}

/// A power supply owning an ordered set of channels.
///
/// Channel order is insertion order and doubles as presentation
/// order. Ownership is exclusive: the core never shares a channel
/// between devices.
pub trait HvDevice: Send {
    /// Device name, unique within the rig.
    fn name(&self) -> &str;

    /// Number of channels.
    fn channel_count(&self) -> usize;

    /// Channel by position.
    fn channel(&self, index: usize) -> Option<&dyn HvChannel>;
    /// Mutable channel by position.
    fn channel_mut(&mut self, index: usize) -> Option<&mut dyn HvChannel>;

    /// Channel lookup by condition key (display name, spaces elided).
    fn channel_by_key(&self, key: &str) -> Option<&dyn HvChannel> {
        (0..self.channel_count())
            .filter_map(|i| self.channel(i))
            .find(|ch| condition_key(ch.name()) == key)
    }

    /// Mutable channel lookup by condition key.
    fn channel_by_key_mut(&mut self, key: &str) -> Option<&mut dyn HvChannel> {
        let idx = (0..self.channel_count()).find(|&i| {
            self.channel(i)
                .is_some_and(|ch| condition_key(ch.name()) == key)
        })?;
        self.channel_mut(idx)
    }

    /// Device-level named alarm bits.
    fn alarm_status(&self) -> Result<AlarmStatus, HalError>;

    /// Hardware interlock flag.
    fn interlock_status(&self) -> Result<bool, HalError>;

    /// Acknowledge and clear the alarm signal.
    fn clear_alarm(&mut self) -> Result<(), HalError>;

    /// Settable-property descriptors for one channel.
    ///
    /// Drivers without an advanced property surface return an empty
    /// slice; the core never discovers properties by reflection.
    fn properties(&self, _channel: usize) -> &[PropertyDescriptor] {
        &[]
    }

    /// Write one registered property.
    fn set_property(
        &mut self,
        channel: usize,
        property: &str,
        _value: PropertyValue,
    ) -> Result<(), HalError> {
        let channel = self
            .channel(channel)
            .map(|ch| ch.name().to_string())
            .unwrap_or_else(|| channel.to_string());
        Err(HalError::UnsupportedProperty {
            channel,
            property: property.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_status_active_names() {
        let mut alarm = AlarmStatus::new();
        assert!(!alarm.any());

        alarm.set("OVC CH0", true);
        alarm.set("UNV", false);
        assert!(alarm.any());
        assert_eq!(alarm.active(), vec!["OVC CH0".to_string()]);

        alarm.clear();
        assert!(!alarm.any());
        assert!(alarm.active().is_empty());
    }

    #[test]
    fn hal_error_display() {
        let err = HalError::CommunicationError("serial timeout".to_string());
        assert!(err.to_string().contains("serial timeout"));

        let err = HalError::UnsupportedProperty {
            channel: "gem top".to_string(),
            property: "rup".to_string(),
        };
        assert!(err.to_string().contains("rup"));
        assert!(err.to_string().contains("gem top"));
    }
}
