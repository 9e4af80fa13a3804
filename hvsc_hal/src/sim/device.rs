//! Simulated device implementation.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use hvsc_common::flags::ChannelStatus;
use tracing::debug;

use crate::device::{AlarmStatus, HalError, HvChannel, HvDevice};
use crate::properties::{PropertyDescriptor, PropertyValue};

/// Fraction of the monitored voltage reported as monitored current [uA/V].
const IMON_PER_VOLT: f64 = 0.001;

/// One emulated channel.
///
/// The monitored voltage slews toward the setpoint at `slew_rate`
/// volts per second, advanced lazily on every read. A rate of
/// `f64::INFINITY` makes the channel reach its target instantly,
/// which deterministic tests rely on.
pub struct SimChannel {
    name: String,
    vset: f64,
    iset: f64,
    slew_rate: f64,
    vmon: Cell<f64>,
    status: Cell<ChannelStatus>,
    last_advance: Cell<Instant>,
}

impl SimChannel {
    pub fn new(name: &str, slew_rate: f64) -> Self {
        Self {
            name: name.to_string(),
            vset: 0.0,
            iset: 0.0,
            slew_rate,
            vmon: Cell::new(0.0),
            status: Cell::new(ChannelStatus::empty()),
            last_advance: Cell::new(Instant::now()),
        }
    }

    /// Move vmon toward its target by the elapsed slew budget.
    fn advance(&self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_advance.get()).as_secs_f64();
        self.last_advance.set(now);

        let mut status = self.status.get();
        let target = if status.is_on() && !status.is_tripped() {
            self.vset
        } else {
            0.0
        };

        let vmon = self.vmon.get();
        let budget = if self.slew_rate.is_finite() {
            self.slew_rate * dt
        } else {
            f64::INFINITY
        };
        let next = if (target - vmon).abs() <= budget {
            target
        } else if target > vmon {
            vmon + budget
        } else {
            vmon - budget
        };
        self.vmon.set(next);

        status.remove(ChannelStatus::RUP | ChannelStatus::RDW);
        if next < target {
            status.insert(ChannelStatus::RUP);
        } else if next > target {
            status.insert(ChannelStatus::RDW);
        }
        self.status.set(status);
    }

    fn trip(&self) {
        let mut status = self.status.get();
        status.remove(ChannelStatus::ON);
        status.insert(ChannelStatus::TRIP);
        self.status.set(status);
        self.vmon.set(0.0);
    }

    fn clear_trip(&self) {
        let mut status = self.status.get();
        status.remove(ChannelStatus::TRIP);
        self.status.set(status);
    }
}

impl HvChannel for SimChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn vset(&self) -> Result<f64, HalError> {
        Ok(self.vset)
    }

    fn set_vset(&mut self, volts: f64) -> Result<(), HalError> {
        if !volts.is_finite() || volts < 0.0 {
            return Err(HalError::InvalidValue(format!("vset {volts}")));
        }
        debug!(channel = %self.name, volts, "sim set_vset");
        self.vset = volts;
        Ok(())
    }

    fn iset(&self) -> Result<f64, HalError> {
        Ok(self.iset)
    }

    fn set_iset(&mut self, current: f64) -> Result<(), HalError> {
        if !current.is_finite() || current < 0.0 {
            return Err(HalError::InvalidValue(format!("iset {current}")));
        }
        self.iset = current;
        Ok(())
    }

    fn vmon(&self) -> Result<f64, HalError> {
        self.advance();
        Ok(self.vmon.get())
    }

    fn imon(&self) -> Result<f64, HalError> {
        self.advance();
        Ok(self.vmon.get() * IMON_PER_VOLT)
    }

    fn status(&self) -> Result<ChannelStatus, HalError> {
        self.advance();
        Ok(self.status.get())
    }

    fn turn_on(&mut self) -> Result<(), HalError> {
        let mut status = self.status.get();
        status.remove(ChannelStatus::TRIP | ChannelStatus::KILL);
        status.insert(ChannelStatus::ON);
        self.status.set(status);
        Ok(())
    }

    fn turn_off(&mut self) -> Result<(), HalError> {
        let mut status = self.status.get();
        status.remove(ChannelStatus::ON);
        self.status.set(status);
        Ok(())
    }
}

/// A fault queued through a [`FaultInjector`].
#[derive(Debug, Clone, Copy)]
pub enum SimFault {
    /// Trip one channel and raise the matching alarm bit.
    Trip(usize),
    /// Assert or release the hardware interlock.
    Interlock(bool),
}

/// Injects faults into a [`SimDevice`] that is already owned by a
/// serializer. Faults are applied on the device's next status read.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    faults: Arc<Mutex<Vec<SimFault>>>,
}

impl FaultInjector {
    pub fn trip(&self, channel: usize) {
        self.push(SimFault::Trip(channel));
    }

    pub fn set_interlock(&self, active: bool) {
        self.push(SimFault::Interlock(active));
    }

    fn push(&self, fault: SimFault) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(fault);
    }
}

/// Simulated power supply.
pub struct SimDevice {
    name: String,
    channels: Vec<SimChannel>,
    alarm: RefCell<AlarmStatus>,
    interlock: Cell<bool>,
    comm_failure: Cell<bool>,
    faults: Arc<Mutex<Vec<SimFault>>>,
    descriptors: Vec<PropertyDescriptor>,
    property_values: Vec<BTreeMap<String, PropertyValue>>,
}

impl SimDevice {
    /// Create a device with the given channels and slew rate [V/s].
    pub fn new(name: &str, channel_names: &[&str], slew_rate: f64) -> Self {
        let channels: Vec<SimChannel> = channel_names
            .iter()
            .map(|n| SimChannel::new(n, slew_rate))
            .collect();
        let property_values = channels.iter().map(|_| BTreeMap::new()).collect();
        Self {
            name: name.to_string(),
            channels,
            alarm: RefCell::new(AlarmStatus::new()),
            interlock: Cell::new(false),
            comm_failure: Cell::new(false),
            faults: Arc::new(Mutex::new(Vec::new())),
            descriptors: vec![
                PropertyDescriptor::float("rup", 1.0, 500.0, "Ramp-up rate [V/s]"),
                PropertyDescriptor::float("rdw", 1.0, 500.0, "Ramp-down rate [V/s]"),
                PropertyDescriptor::choice("pdwn", &["RAMP", "KILL"], "Power-down mode"),
            ],
            property_values,
        }
    }

    /// Create a device whose channels reach their setpoints instantly.
    pub fn instant(name: &str, channel_names: &[&str]) -> Self {
        Self::new(name, channel_names, f64::INFINITY)
    }

    /// Handle for queueing faults after the device has been handed to
    /// a serializer.
    pub fn fault_injector(&self) -> FaultInjector {
        FaultInjector {
            faults: Arc::clone(&self.faults),
        }
    }

    /// Inject a trip on one channel: the channel drops out and the
    /// matching device alarm bit goes active.
    pub fn force_trip(&mut self, index: usize) {
        if let Some(ch) = self.channels.get(index) {
            ch.trip();
            self.alarm.borrow_mut().set(&format!("OVC CH{index}"), true);
        }
    }

    /// Assert or release the hardware interlock.
    pub fn set_interlock(&mut self, active: bool) {
        self.interlock.set(active);
    }

    /// Force every facade call to fail until released.
    pub fn set_comm_failure(&mut self, failing: bool) {
        self.comm_failure.set(failing);
    }

    fn apply_faults(&self) {
        let faults: Vec<SimFault> = self
            .faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for fault in faults {
            match fault {
                SimFault::Trip(index) => {
                    if let Some(ch) = self.channels.get(index) {
                        ch.trip();
                        self.alarm.borrow_mut().set(&format!("OVC CH{index}"), true);
                    }
                }
                SimFault::Interlock(active) => self.interlock.set(active),
            }
        }
    }

    /// Stored value of one property, if it was ever written.
    pub fn property(&self, channel: usize, name: &str) -> Option<&PropertyValue> {
        self.property_values.get(channel)?.get(name)
    }

    fn check_comm(&self) -> Result<(), HalError> {
        if self.comm_failure.get() {
            Err(HalError::CommunicationError("simulated link down".into()))
        } else {
            Ok(())
        }
    }
}

impl HvDevice for SimDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn channel(&self, index: usize) -> Option<&dyn HvChannel> {
        self.channels.get(index).map(|ch| ch as &dyn HvChannel)
    }

    fn channel_mut(&mut self, index: usize) -> Option<&mut dyn HvChannel> {
        self.channels
            .get_mut(index)
            .map(|ch| ch as &mut dyn HvChannel)
    }

    fn alarm_status(&self) -> Result<AlarmStatus, HalError> {
        self.check_comm()?;
        self.apply_faults();
        Ok(self.alarm.borrow().clone())
    }

    fn interlock_status(&self) -> Result<bool, HalError> {
        self.check_comm()?;
        self.apply_faults();
        Ok(self.interlock.get())
    }

    fn clear_alarm(&mut self) -> Result<(), HalError> {
        self.check_comm()?;
        debug!(device = %self.name, "sim clear_alarm");
        self.alarm.borrow_mut().clear();
        for ch in &self.channels {
            ch.clear_trip();
        }
        Ok(())
    }

    fn properties(&self, _channel: usize) -> &[PropertyDescriptor] {
        &self.descriptors
    }

    fn set_property(
        &mut self,
        channel: usize,
        property: &str,
        value: PropertyValue,
    ) -> Result<(), HalError> {
        self.check_comm()?;
        let descriptor = self
            .descriptors
            .iter()
            .find(|d| d.name == property)
            .ok_or_else(|| HalError::UnsupportedProperty {
                channel: channel.to_string(),
                property: property.to_string(),
            })?;
        if !descriptor.accepts(&value) {
            return Err(HalError::InvalidValue(format!(
                "{property} rejects {value:?}"
            )));
        }
        let slot = self
            .property_values
            .get_mut(channel)
            .ok_or_else(|| HalError::UnknownChannel(channel.to_string()))?;
        slot.insert(property.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_channel_reaches_setpoint() {
        let mut dev = SimDevice::instant("caen", &["gem top"]);
        let ch = dev.channel_mut(0).unwrap();
        ch.set_vset(600.0).unwrap();
        ch.turn_on().unwrap();
        assert_eq!(ch.vmon().unwrap(), 600.0);
        assert!((ch.imon().unwrap() - 0.6).abs() < 1e-9);
        assert!(ch.status().unwrap().is_on());
    }

    #[test]
    fn off_channel_decays_to_zero() {
        let mut dev = SimDevice::instant("caen", &["gem top"]);
        let ch = dev.channel_mut(0).unwrap();
        ch.set_vset(600.0).unwrap();
        ch.turn_on().unwrap();
        assert_eq!(ch.vmon().unwrap(), 600.0);
        ch.turn_off().unwrap();
        assert_eq!(ch.vmon().unwrap(), 0.0);
    }

    #[test]
    fn trip_and_clear() {
        let mut dev = SimDevice::instant("caen", &["gem top", "gem bottom"]);
        dev.channel_mut(0).unwrap().turn_on().unwrap();
        dev.force_trip(0);

        assert!(dev.alarm_status().unwrap().any());
        assert_eq!(dev.alarm_status().unwrap().active(), vec!["OVC CH0"]);
        let status = dev.channel(0).unwrap().status().unwrap();
        assert!(status.is_tripped());
        assert!(!status.is_on());

        dev.clear_alarm().unwrap();
        assert!(!dev.alarm_status().unwrap().any());
        assert!(!dev.channel(0).unwrap().status().unwrap().is_tripped());
    }

    #[test]
    fn channel_by_key_elides_spaces() {
        let dev = SimDevice::instant("caen", &["gem top"]);
        assert!(dev.channel_by_key("gemtop").is_some());
        assert!(dev.channel_by_key("gem top").is_none());
    }

    #[test]
    fn fault_injector_applies_on_next_status_read() {
        let mut dev = SimDevice::instant("caen", &["gem top"]);
        dev.channel_mut(0).unwrap().turn_on().unwrap();
        let injector = dev.fault_injector();

        injector.trip(0);
        assert_eq!(dev.alarm_status().unwrap().active(), vec!["OVC CH0"]);
        assert!(dev.channel(0).unwrap().status().unwrap().is_tripped());

        injector.set_interlock(true);
        assert!(dev.interlock_status().unwrap());
    }

    #[test]
    fn comm_failure_propagates() {
        let mut dev = SimDevice::instant("caen", &["gem top"]);
        dev.set_comm_failure(true);
        assert!(matches!(
            dev.alarm_status(),
            Err(HalError::CommunicationError(_))
        ));
        dev.set_comm_failure(false);
        assert!(dev.alarm_status().is_ok());
    }

    #[test]
    fn property_registry_validates() {
        let mut dev = SimDevice::instant("caen", &["gem top"]);
        dev.set_property(0, "rup", PropertyValue::Number(50.0))
            .unwrap();
        assert_eq!(
            dev.property(0, "rup"),
            Some(&PropertyValue::Number(50.0))
        );

        assert!(matches!(
            dev.set_property(0, "rup", PropertyValue::Number(0.0)),
            Err(HalError::InvalidValue(_))
        ));
        assert!(matches!(
            dev.set_property(0, "nonesuch", PropertyValue::Number(1.0)),
            Err(HalError::UnsupportedProperty { .. })
        ));
        assert!(dev
            .set_property(0, "pdwn", PropertyValue::Text("KILL".into()))
            .is_ok());
    }
}
