//! Device registry and manual control paths.
//!
//! A [`Rig`] owns one serializer per registered device plus the check
//! sets vetting every write:
//! - per-device check sets gate manual setpoints and multichannel
//!   apply on that device;
//! - one multi-device set expresses cross-device constraints and is
//!   evaluated by the periodic live loop and the ramp protocol.
//!
//! Live evaluation locks the involved devices in *registration order*
//! regardless of how a check set declares them, so two concurrent
//! multi-device evaluations can never deadlock.
//!
//! The trip-recovery supervisor holds a rig-wide manual lockout while
//! armed; manual ramp-protocol entry points refuse while it is held.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hvsc_common::cache::ReadingsCache;
use hvsc_common::condition_key;
use hvsc_common::config::CheckEntry;
use hvsc_common::error::CoreError;
use hvsc_common::flags::ChannelStatus;
use hvsc_hal::{HalError, HvDevice, PropertyValue};
use tracing::{debug, info};

use crate::alert::{AlertSink, Severity};
use crate::check::expr::Value;
use crate::check::{CheckFailure, CheckSet, LiveBindings};
use crate::executor::DeviceExecutor;

/// Name of the cross-device check group in the checks file.
pub const MULTIDEVICE_GROUP: &str = "multidevice";

struct DeviceSlot {
    name: String,
    executor: Arc<DeviceExecutor>,
    checks: Mutex<CheckSet>,
    channel_names: Vec<String>,
    channel_keys: Vec<String>,
}

/// The registered devices and everything vetting access to them.
pub struct Rig {
    slots: Vec<DeviceSlot>,
    multi_checks: Mutex<CheckSet>,
    cache: Arc<ReadingsCache>,
    alerts: Arc<dyn AlertSink>,
    lockout: AtomicBool,
    last_failures: Mutex<BTreeSet<String>>,
}

impl Rig {
    pub fn new(cache: Arc<ReadingsCache>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            slots: Vec::new(),
            multi_checks: Mutex::new(CheckSet::default()),
            cache,
            alerts,
            lockout: AtomicBool::new(false),
            last_failures: Mutex::new(BTreeSet::new()),
        }
    }

    /// Register a device with its check entries; returns its index.
    ///
    /// Registration order fixes the lock order for multi-device
    /// evaluation and must match across restarts.
    pub fn register_device(&mut self, device: Box<dyn HvDevice>, entries: &[CheckEntry]) -> usize {
        let name = device.name().to_string();
        let channel_names: Vec<String> = (0..device.channel_count())
            .filter_map(|i| device.channel(i).map(|ch| ch.name().to_string()))
            .collect();
        let channel_keys = channel_names.iter().map(|n| condition_key(n)).collect();
        let checks = CheckSet::from_entries(entries, &channel_names, vec![name.clone()]);

        let executor = Arc::new(DeviceExecutor::new(
            device,
            Arc::clone(&self.cache),
            Arc::clone(&self.alerts),
        ));
        info!(device = %name, channels = channel_names.len(), "device registered");
        self.slots.push(DeviceSlot {
            name,
            executor,
            checks: Mutex::new(checks),
            channel_names,
            channel_keys,
        });
        self.slots.len() - 1
    }

    /// Install the cross-device check group. Call after every device
    /// is registered so all channel names are bound.
    pub fn set_multidevice_checks(&mut self, entries: &[CheckEntry]) {
        let bound = self.display_names();
        let devices = self.slots.iter().map(|s| s.name.clone()).collect();
        *lock(&self.multi_checks) = CheckSet::from_entries(entries, &bound, devices);
    }

    pub fn cache(&self) -> &Arc<ReadingsCache> {
        &self.cache
    }

    pub fn alerts(&self) -> &Arc<dyn AlertSink> {
        &self.alerts
    }

    pub fn device_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }

    /// Every channel display name, in registration then channel order.
    pub fn display_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .flat_map(|s| s.channel_names.iter().cloned())
            .collect()
    }

    /// Every channel condition key, same order as [`display_names`].
    ///
    /// [`display_names`]: Self::display_names
    pub fn channel_keys(&self) -> Vec<String> {
        self.slots
            .iter()
            .flat_map(|s| s.channel_keys.iter().cloned())
            .collect()
    }

    /// Executor of one device, by name.
    pub fn executor(&self, device: &str) -> Option<&Arc<DeviceExecutor>> {
        self.slots
            .iter()
            .find(|s| s.name == device)
            .map(|s| &s.executor)
    }

    /// Executor of one device, by registration index.
    pub fn executor_at(&self, index: usize) -> Option<&Arc<DeviceExecutor>> {
        self.slots.get(index).map(|s| &s.executor)
    }

    /// All executors, in registration order.
    pub fn executors(&self) -> Vec<Arc<DeviceExecutor>> {
        self.slots.iter().map(|s| Arc::clone(&s.executor)).collect()
    }

    /// Locate a channel by condition key: (device index, channel index).
    pub fn find_channel(&self, key: &str) -> Option<(usize, usize)> {
        self.slots.iter().enumerate().find_map(|(si, slot)| {
            slot.channel_keys
                .iter()
                .position(|k| k == key)
                .map(|ci| (si, ci))
        })
    }

    /// Device name owning a channel key.
    pub fn device_of(&self, key: &str) -> Option<&str> {
        self.find_channel(key)
            .map(|(si, _)| self.slots[si].name.as_str())
    }

    /// Whether a control command is queued or running on any device.
    pub fn busy(&self) -> bool {
        self.slots.iter().any(|s| s.executor.busy())
    }

    // ─── Manual lockout ─────────────────────────────────────────────

    /// Take the rig-wide manual lockout; false if already held.
    pub fn lock_manual(&self) -> bool {
        self.lockout
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn unlock_manual(&self) {
        self.lockout.store(false, Ordering::SeqCst);
    }

    pub fn manual_locked(&self) -> bool {
        self.lockout.load(Ordering::SeqCst)
    }

    // ─── Live evaluation ────────────────────────────────────────────

    /// Evaluate a check set against hardware.
    ///
    /// Locks the set's devices in registration order, reads through
    /// the facade, and releases the locks before returning.
    pub fn evaluate_live(&self, set: &CheckSet) -> Result<Vec<CheckFailure>, CoreError> {
        let mut indices: Vec<usize> = Vec::new();
        for name in &set.devices {
            let idx = self
                .slots
                .iter()
                .position(|s| &s.name == name)
                .ok_or_else(|| CoreError::Validation(format!("unknown device '{name}'")))?;
            indices.push(idx);
        }
        indices.sort_unstable();
        indices.dedup();

        let guards: Vec<_> = indices
            .iter()
            .map(|&i| self.slots[i].executor.device_lock())
            .collect();
        let devices: Vec<&dyn HvDevice> = guards.iter().map(|g| g.as_ref()).collect();
        set.evaluate_all(&LiveBindings { devices: &devices })
    }

    /// One pass of the periodic live loop: every per-device set plus
    /// the multi-device set.
    ///
    /// Newly-failing checks are alerted once on their rising edge;
    /// hard evaluation errors are alerted every pass they persist.
    pub fn run_check_pass(&self) -> Result<Vec<CheckFailure>, CoreError> {
        let mut failures = Vec::new();
        for slot in &self.slots {
            let set = lock(&slot.checks).clone();
            failures.extend(self.evaluate_live(&set)?);
        }
        let multi = lock(&self.multi_checks).clone();
        failures.extend(self.evaluate_live(&multi)?);

        let mut last = lock(&self.last_failures);
        let current: BTreeSet<String> = failures.iter().map(|f| f.check.clone()).collect();
        for f in &failures {
            if !last.contains(&f.check) {
                self.alerts.alert(
                    Severity::Warning,
                    &format!("check failed: {} ({})", f.check, f.condition),
                );
            }
        }
        *last = current;
        Ok(failures)
    }

    // ─── Simulated evaluation ───────────────────────────────────────

    /// Evaluate every check set against the cache with overrides.
    ///
    /// Used by the ramp protocol, which vets a whole prospective step
    /// across all devices at once.
    pub fn evaluate_simulated_all(
        &self,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<Vec<CheckFailure>, CoreError> {
        let keys = self.channel_keys();
        let mut failures = Vec::new();
        for slot in &self.slots {
            let set = lock(&slot.checks).clone();
            failures.extend(set.evaluate_simulated(overrides, &self.cache, &keys)?);
        }
        let multi = lock(&self.multi_checks).clone();
        failures.extend(multi.evaluate_simulated(overrides, &self.cache, &keys)?);
        Ok(failures)
    }

    // ─── Manual control paths ───────────────────────────────────────

    /// Manual voltage setpoint: parse, vet against the owning
    /// device's check set, then queue the write.
    pub fn set_vset(&self, key: &str, text: &str) -> Result<(), CoreError> {
        if self.manual_locked() {
            return Err(CoreError::locked_out());
        }
        let volts = parse_volts(text)?;
        let (si, ci) = self
            .find_channel(key)
            .ok_or_else(|| CoreError::Validation(format!("unknown channel '{key}'")))?;
        let slot = &self.slots[si];

        let mut overrides = BTreeMap::new();
        overrides.insert(format!("{key}.vset"), Value::Num(volts));
        let failures =
            lock(&slot.checks).evaluate_simulated(&overrides, &self.cache, &self.channel_keys())?;
        if !failures.is_empty() {
            self.alert_refused(key, volts, &failures);
            return Err(CoreError::Safety {
                failed: failures.into_iter().map(|f| f.check).collect(),
            });
        }

        debug!(channel = key, volts, "manual vset accepted");
        slot.executor.submit("set vset", move |dev| {
            dev.channel_mut(ci)
                .ok_or_else(|| HalError::UnknownChannel(ci.to_string()))?
                .set_vset(volts)
        });
        Ok(())
    }

    /// Manual current setpoint. No condition language binding exists
    /// for prospective currents, so this validates and queues only.
    pub fn set_iset(&self, key: &str, text: &str) -> Result<(), CoreError> {
        if self.manual_locked() {
            return Err(CoreError::locked_out());
        }
        let current = parse_volts(text)?;
        let (si, ci) = self
            .find_channel(key)
            .ok_or_else(|| CoreError::Validation(format!("unknown channel '{key}'")))?;
        self.slots[si].executor.submit("set iset", move |dev| {
            dev.channel_mut(ci)
                .ok_or_else(|| HalError::UnknownChannel(ci.to_string()))?
                .set_iset(current)
        });
        Ok(())
    }

    /// Multichannel apply: vet every prospective setpoint of one
    /// device together, then queue the writes (and power-ups).
    pub fn apply_channels(
        &self,
        device: &str,
        values: &[(String, f64)],
        power_on: bool,
    ) -> Result<(), CoreError> {
        if self.manual_locked() {
            return Err(CoreError::locked_out());
        }
        let si = self
            .slots
            .iter()
            .position(|s| s.name == device)
            .ok_or_else(|| CoreError::Validation(format!("unknown device '{device}'")))?;
        let slot = &self.slots[si];

        let mut overrides = BTreeMap::new();
        let mut indices = Vec::with_capacity(values.len());
        for (key, volts) in values {
            if !volts.is_finite() || *volts < 0.0 {
                return Err(CoreError::Validation(format!(
                    "{volts} is outside the allowed range"
                )));
            }
            let ci = slot
                .channel_keys
                .iter()
                .position(|k| k == key)
                .ok_or_else(|| {
                    CoreError::Validation(format!("unknown channel '{key}' on '{device}'"))
                })?;
            overrides.insert(format!("{key}.vset"), Value::Num(*volts));
            indices.push((ci, *volts));
        }

        let failures =
            lock(&slot.checks).evaluate_simulated(&overrides, &self.cache, &self.channel_keys())?;
        if !failures.is_empty() {
            return Err(CoreError::Safety {
                failed: failures.into_iter().map(|f| f.check).collect(),
            });
        }

        for (ci, volts) in indices {
            slot.executor.submit("apply vset", move |dev| {
                let ch = dev
                    .channel_mut(ci)
                    .ok_or_else(|| HalError::UnknownChannel(ci.to_string()))?;
                ch.set_vset(volts)?;
                if power_on {
                    ch.turn_on()?;
                }
                Ok(())
            });
        }
        Ok(())
    }

    /// Queue a power-down of every channel of one device.
    pub fn turn_off_device(&self, device: &str) -> Result<(), CoreError> {
        if self.manual_locked() {
            return Err(CoreError::locked_out());
        }
        let slot = self
            .slots
            .iter()
            .find(|s| s.name == device)
            .ok_or_else(|| CoreError::Validation(format!("unknown device '{device}'")))?;
        for ci in 0..slot.channel_keys.len() {
            slot.executor.submit("turn off", move |dev| {
                dev.channel_mut(ci)
                    .ok_or_else(|| HalError::UnknownChannel(ci.to_string()))?
                    .turn_off()
            });
        }
        Ok(())
    }

    /// Acknowledge a device alarm, blocking until done.
    pub fn clear_alarm(&self, device: &str) -> Result<(), CoreError> {
        if self.manual_locked() {
            return Err(CoreError::locked_out());
        }
        let executor = self
            .executor(device)
            .ok_or_else(|| CoreError::Validation(format!("unknown device '{device}'")))?;
        executor.execute("clear alarm", |dev| dev.clear_alarm())
    }

    /// Write one advanced property, blocking until done.
    pub fn set_property(
        &self,
        key: &str,
        property: &str,
        value: PropertyValue,
    ) -> Result<(), CoreError> {
        if self.manual_locked() {
            return Err(CoreError::locked_out());
        }
        let (si, ci) = self
            .find_channel(key)
            .ok_or_else(|| CoreError::Validation(format!("unknown channel '{key}'")))?;
        let property = property.to_string();
        self.slots[si].executor.execute("set property", move |dev| {
            dev.set_property(ci, &property, value)
        })
    }

    /// Enable or disable one check in a group (device name or
    /// [`MULTIDEVICE_GROUP`]).
    pub fn set_check_enabled(&self, group: &str, name: &str, enabled: bool) -> bool {
        if group == MULTIDEVICE_GROUP {
            return lock(&self.multi_checks).set_enabled(name, enabled);
        }
        self.slots
            .iter()
            .find(|s| s.name == group)
            .is_some_and(|s| lock(&s.checks).set_enabled(name, enabled))
    }

    /// Current status word of one channel, read live under the
    /// device lock.
    pub fn live_status(&self, key: &str) -> Result<ChannelStatus, CoreError> {
        let (si, ci) = self
            .find_channel(key)
            .ok_or_else(|| CoreError::Validation(format!("unknown channel '{key}'")))?;
        let device = self.slots[si].executor.device_lock();
        let ch = device
            .channel(ci)
            .ok_or_else(|| CoreError::Validation(format!("unknown channel '{key}'")))?;
        ch.status().map_err(|e| CoreError::Comm(e.to_string()))
    }

    /// Current voltage setpoint of one channel, read live under the
    /// device lock.
    pub fn live_vset(&self, key: &str) -> Result<f64, CoreError> {
        let (si, ci) = self
            .find_channel(key)
            .ok_or_else(|| CoreError::Validation(format!("unknown channel '{key}'")))?;
        let device = self.slots[si].executor.device_lock();
        let ch = device
            .channel(ci)
            .ok_or_else(|| CoreError::Validation(format!("unknown channel '{key}'")))?;
        ch.vset().map_err(|e| CoreError::Comm(e.to_string()))
    }

    fn alert_refused(&self, key: &str, volts: f64, failures: &[CheckFailure]) {
        let names: Vec<&str> = failures.iter().map(|f| f.check.as_str()).collect();
        self.alerts.alert(
            Severity::Warning,
            &format!(
                "refused vset {volts} V on '{key}': failed {}",
                names.join(", ")
            ),
        );
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn parse_volts(text: &str) -> Result<f64, CoreError> {
    let value: f64 = text
        .trim()
        .parse()
        .map_err(|_| CoreError::Validation(format!("'{text}' is not a number")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(CoreError::Validation(format!(
            "'{text}' is outside the allowed range"
        )));
    }
    Ok(value)
}

/// Periodic live check loop: one [`run_check_pass`] per interval.
///
/// Hard evaluation errors are alerted and the loop keeps running; a
/// wrong condition set must not silence the remaining checks.
///
/// [`run_check_pass`]: Rig::run_check_pass
pub fn spawn_check_loop(
    rig: Arc<Rig>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("hvsc-checks".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                if let Err(e) = rig.run_check_pass() {
                    rig.alerts()
                        .alert(Severity::Critical, &format!("check evaluation error: {e}"));
                }
                thread::sleep(interval);
            }
        })
        .unwrap_or_else(|e| panic!("failed to spawn check loop thread: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlert;
    use hvsc_hal::SimDevice;

    fn entry(name: &str, condition: &str) -> CheckEntry {
        CheckEntry {
            name: name.into(),
            condition: condition.into(),
            description: String::new(),
            enabled: true,
        }
    }

    fn rig_with_caen(entries: &[CheckEntry]) -> (Arc<Rig>, Arc<MemoryAlert>) {
        let cache = Arc::new(ReadingsCache::new());
        let alerts = Arc::new(MemoryAlert::new());
        let mut rig = Rig::new(cache, alerts.clone() as Arc<dyn AlertSink>);
        rig.register_device(
            Box::new(SimDevice::instant("caen", &["gem top", "gem bottom"])),
            entries,
        );
        (Arc::new(rig), alerts)
    }

    fn drain(rig: &Rig, device: &str) {
        rig.executor(device)
            .unwrap()
            .execute("drain", |_| Ok(()))
            .unwrap();
    }

    #[test]
    fn manual_vset_vets_and_applies() {
        let (rig, _) = rig_with_caen(&[entry("Vgem", "gem top.vset <= 650")]);
        rig.set_vset("gemtop", "600").unwrap();
        drain(&rig, "caen");

        let status = {
            let dev = rig.executor("caen").unwrap().device_lock();
            dev.channel(0).unwrap().vset().unwrap()
        };
        assert_eq!(status, 600.0);
    }

    #[test]
    fn manual_vset_refused_by_check() {
        let (rig, alerts) = rig_with_caen(&[entry("Vgem", "gem top.vset <= 650")]);
        let err = rig.set_vset("gemtop", "700").unwrap_err();
        match err {
            CoreError::Safety { failed } => assert_eq!(failed, vec!["Vgem".to_string()]),
            other => panic!("expected safety error, got {other:?}"),
        }
        assert!(alerts.messages().iter().any(|m| m.contains("Vgem")));

        // The refused value never reached hardware.
        drain(&rig, "caen");
        let dev = rig.executor("caen").unwrap().device_lock();
        assert_eq!(dev.channel(0).unwrap().vset().unwrap(), 0.0);
    }

    #[test]
    fn manual_vset_rejects_garbage() {
        let (rig, _) = rig_with_caen(&[]);
        assert!(matches!(
            rig.set_vset("gemtop", "6oo"),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            rig.set_vset("gemtop", "-5"),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            rig.set_vset("nonesuch", "100"),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn lockout_refuses_manual_paths() {
        let (rig, _) = rig_with_caen(&[]);
        assert!(rig.lock_manual());
        assert!(!rig.lock_manual());

        assert!(matches!(
            rig.set_vset("gemtop", "100"),
            Err(CoreError::Permission { .. })
        ));
        assert!(matches!(
            rig.apply_channels("caen", &[("gemtop".into(), 100.0)], true),
            Err(CoreError::Permission { .. })
        ));
        assert!(matches!(
            rig.turn_off_device("caen"),
            Err(CoreError::Permission { .. })
        ));
        assert!(matches!(
            rig.clear_alarm("caen"),
            Err(CoreError::Permission { .. })
        ));
        assert!(matches!(
            rig.set_property("gemtop", "rup", PropertyValue::Number(50.0)),
            Err(CoreError::Permission { .. })
        ));

        rig.unlock_manual();
        assert!(rig.set_vset("gemtop", "100").is_ok());
        assert!(rig.clear_alarm("caen").is_ok());
    }

    #[test]
    fn apply_channels_vets_jointly() {
        let (rig, _) = rig_with_caen(&[entry(
            "Vgem",
            "gem top.vset - gem bottom.vset <= 270",
        )]);
        // 600/350 is fine together.
        rig.apply_channels(
            "caen",
            &[("gemtop".into(), 600.0), ("gembottom".into(), 350.0)],
            true,
        )
        .unwrap();
        drain(&rig, "caen");
        {
            let dev = rig.executor("caen").unwrap().device_lock();
            assert!(dev.channel(0).unwrap().status().unwrap().is_on());
            assert_eq!(dev.channel(1).unwrap().vset().unwrap(), 350.0);
        }

        // 700/350 violates the joint constraint even though each value
        // alone would pass against the stale cache.
        let err = rig
            .apply_channels(
                "caen",
                &[("gemtop".into(), 700.0), ("gembottom".into(), 350.0)],
                true,
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Safety { .. }));
    }

    #[test]
    fn live_pass_alerts_on_rising_edge_only() {
        let (rig, alerts) = rig_with_caen(&[entry("Vgem", "gem top.vset <= 100")]);
        {
            let mut dev = rig.executor("caen").unwrap().device_lock();
            dev.channel_mut(0).unwrap().set_vset(600.0).unwrap();
        }

        let failures = rig.run_check_pass().unwrap();
        assert_eq!(failures.len(), 1);
        rig.run_check_pass().unwrap();
        rig.run_check_pass().unwrap();

        let warnings = alerts
            .messages()
            .iter()
            .filter(|m| m.contains("check failed: Vgem"))
            .count();
        assert_eq!(warnings, 1);

        // Recovers, then fails again: a second alert.
        {
            let mut dev = rig.executor("caen").unwrap().device_lock();
            dev.channel_mut(0).unwrap().set_vset(50.0).unwrap();
        }
        assert!(rig.run_check_pass().unwrap().is_empty());
        {
            let mut dev = rig.executor("caen").unwrap().device_lock();
            dev.channel_mut(0).unwrap().set_vset(600.0).unwrap();
        }
        rig.run_check_pass().unwrap();
        let warnings = alerts
            .messages()
            .iter()
            .filter(|m| m.contains("check failed: Vgem"))
            .count();
        assert_eq!(warnings, 2);
    }

    #[test]
    fn multidevice_checks_lock_in_registration_order() {
        let cache = Arc::new(ReadingsCache::new());
        let alerts = Arc::new(MemoryAlert::new());
        let mut rig = Rig::new(cache, alerts as Arc<dyn AlertSink>);
        rig.register_device(Box::new(SimDevice::instant("caen", &["mesh left"])), &[]);
        rig.register_device(Box::new(SimDevice::instant("spellman", &["cathode"])), &[]);
        rig.set_multidevice_checks(&[entry(
            "Cathode vs mesh",
            "cathode.vset * 0.286 >= mesh left.vset",
        )]);
        let rig = Arc::new(rig);

        // Two sets declaring the devices in opposite orders; concurrent
        // evaluation must not deadlock.
        let forward = CheckSet::from_entries(
            &[entry("f", "cathode.vset >= 0")],
            &[],
            vec!["caen".into(), "spellman".into()],
        );
        let backward = CheckSet::from_entries(
            &[entry("b", "mesh left.vset >= 0")],
            &["mesh left".to_string()],
            vec!["spellman".into(), "caen".into()],
        );

        let mut handles = Vec::new();
        for set in [forward, backward] {
            let rig = Arc::clone(&rig);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    rig.evaluate_live(&set).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn set_check_enabled_by_group() {
        let (rig, _) = rig_with_caen(&[entry("Vgem", "gem top.vset <= 100")]);
        {
            let mut dev = rig.executor("caen").unwrap().device_lock();
            dev.channel_mut(0).unwrap().set_vset(600.0).unwrap();
        }
        assert_eq!(rig.run_check_pass().unwrap().len(), 1);

        assert!(rig.set_check_enabled("caen", "Vgem", false));
        assert!(rig.run_check_pass().unwrap().is_empty());
        assert!(!rig.set_check_enabled("caen", "nonesuch", false));
        assert!(!rig.set_check_enabled("nonesuch", "Vgem", false));
    }

    #[test]
    fn live_status_reads_hardware() {
        let (rig, _) = rig_with_caen(&[]);
        assert!(!rig.live_status("gemtop").unwrap().is_on());
        {
            let mut dev = rig.executor("caen").unwrap().device_lock();
            dev.channel_mut(0).unwrap().turn_on().unwrap();
        }
        assert!(rig.live_status("gemtop").unwrap().is_on());
    }

    #[test]
    fn property_write_round_trips() {
        let (rig, _) = rig_with_caen(&[]);
        rig.set_property("gemtop", "rup", PropertyValue::Number(50.0))
            .unwrap();
        let err = rig.set_property("gemtop", "rup", PropertyValue::Number(0.1));
        assert!(matches!(err, Err(CoreError::Comm(_))));
    }
}
