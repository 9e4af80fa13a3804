//! End-to-end protocol tests.
//!
//! These exercise the serializer, check engine, ramp protocol and
//! trip recovery together against simulated hardware:
//! 1. A ramp writes exactly the expected setpoint sequence, in order,
//!    and never writes a step the monitored voltage already exceeds.
//! 2. A failed safety gate aborts the ramp with no further writes.
//! 3. Concurrent submitters never overlap on one device.
//! 4. A tripped rig recovers automatically and survives disarming.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hvsc_common::cache::ReadingsCache;
use hvsc_common::config::{CheckEntry, RampConfig, RecoveryConfig};
use hvsc_common::error::CoreError;
use hvsc_common::flags::ChannelStatus;
use hvsc_core::alert::{AlertSink, MemoryAlert};
use hvsc_core::ramp::{RampAuthority, RampChannel, RampController, RampOutcome, RampPlan};
use hvsc_core::recovery::TripRecoverySupervisor;
use hvsc_core::rig::Rig;
use hvsc_hal::device::{AlarmStatus, HalError, HvChannel, HvDevice};

// ─── Recording test driver ──────────────────────────────────────────

type WriteLog = Arc<Mutex<Vec<(String, f64)>>>;

/// Instant-settling channel that records every setpoint write.
///
/// `lead` offsets the monitored voltage above the setpoint, modelling
/// a supply that reads back high.
struct RecordingChannel {
    name: String,
    vset: f64,
    iset: f64,
    on: bool,
    lead: f64,
    log: WriteLog,
}

impl HvChannel for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn vset(&self) -> Result<f64, HalError> {
        Ok(self.vset)
    }

    fn set_vset(&mut self, volts: f64) -> Result<(), HalError> {
        self.log.lock().unwrap().push((self.name.clone(), volts));
        self.vset = volts;
        Ok(())
    }

    fn iset(&self) -> Result<f64, HalError> {
        Ok(self.iset)
    }

    fn set_iset(&mut self, current: f64) -> Result<(), HalError> {
        self.iset = current;
        Ok(())
    }

    fn vmon(&self) -> Result<f64, HalError> {
        Ok(if self.on { self.vset + self.lead } else { 0.0 })
    }

    fn imon(&self) -> Result<f64, HalError> {
        Ok(0.0)
    }

    fn status(&self) -> Result<ChannelStatus, HalError> {
        Ok(if self.on {
            ChannelStatus::ON
        } else {
            ChannelStatus::empty()
        })
    }

    fn turn_on(&mut self) -> Result<(), HalError> {
        self.on = true;
        Ok(())
    }

    fn turn_off(&mut self) -> Result<(), HalError> {
        self.on = false;
        Ok(())
    }
}

struct RecordingDevice {
    name: String,
    channels: Vec<RecordingChannel>,
}

impl RecordingDevice {
    fn new(name: &str, channel_names: &[&str], log: &WriteLog) -> Self {
        Self::with_lead(name, channel_names, log, 0.0)
    }

    fn with_lead(name: &str, channel_names: &[&str], log: &WriteLog, lead: f64) -> Self {
        Self {
            name: name.to_string(),
            channels: channel_names
                .iter()
                .map(|n| RecordingChannel {
                    name: n.to_string(),
                    vset: 0.0,
                    iset: 0.0,
                    on: true,
                    lead,
                    log: Arc::clone(log),
                })
                .collect(),
        }
    }
}

impl HvDevice for RecordingDevice {
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
        Ok(AlarmStatus::new())
    }

    fn interlock_status(&self) -> Result<bool, HalError> {
        Ok(false)
    }

    fn clear_alarm(&mut self) -> Result<(), HalError> {
        Ok(())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn fast_ramp() -> RampConfig {
    RampConfig {
        step: 100.0,
        step_timeout: 2.0,
        settle: 0.01,
        poll_interval: 0.01,
    }
}

fn recording_rig(entries: &[CheckEntry]) -> (Arc<Rig>, WriteLog) {
    let log: WriteLog = Arc::new(Mutex::new(Vec::new()));
    let cache = Arc::new(ReadingsCache::new());
    let alerts = Arc::new(MemoryAlert::new());
    let mut rig = Rig::new(cache, alerts as Arc<dyn AlertSink>);
    rig.register_device(
        Box::new(RecordingDevice::new("caen", &["gem top"], &log)),
        entries,
    );
    (Arc::new(rig), log)
}

fn entry(name: &str, condition: &str) -> CheckEntry {
    CheckEntry {
        name: name.into(),
        condition: condition.into(),
        description: String::new(),
        enabled: true,
    }
}

fn plan(target: f64) -> RampPlan {
    RampPlan::new(vec![RampChannel::new("gem top", target, 1.0, 1.0).unwrap()]).unwrap()
}

// ─── Test 1: write discipline ───────────────────────────────────────

#[test]
fn ramp_writes_the_expected_sequence_in_order() {
    let (rig, log) = recording_rig(&[]);
    let ctl = RampController::new(Arc::clone(&rig), fast_ramp());

    let outcome = ctl.raise(&plan(300.0), RampAuthority::Operator).unwrap();
    assert_eq!(outcome, RampOutcome::Completed);

    let writes: Vec<f64> = log.lock().unwrap().iter().map(|(_, v)| *v).collect();
    assert_eq!(writes, vec![100.0, 200.0, 300.0]);
}

#[test]
fn overshooting_monitor_suppresses_further_writes() {
    // The supply reads back 250 V above its setpoint, so after the
    // first 100 V write every later step target is already exceeded
    // and must not be written.
    let log: WriteLog = Arc::new(Mutex::new(Vec::new()));
    let cache = Arc::new(ReadingsCache::new());
    let alerts = Arc::new(MemoryAlert::new());
    let mut rig = Rig::new(cache, alerts as Arc<dyn AlertSink>);
    rig.register_device(
        Box::new(RecordingDevice::with_lead("caen", &["gem top"], &log, 250.0)),
        &[],
    );
    let rig = Arc::new(rig);
    let ctl = RampController::new(Arc::clone(&rig), fast_ramp());

    let outcome = ctl.raise(&plan(300.0), RampAuthority::Operator).unwrap();
    assert_eq!(outcome, RampOutcome::Completed);

    let writes: Vec<f64> = log.lock().unwrap().iter().map(|(_, v)| *v).collect();
    assert_eq!(writes, vec![100.0]);
}

// ─── Test 2: safety gate aborts before writing ──────────────────────

#[test]
fn failed_gate_stops_the_ramp_with_no_further_writes() {
    let (rig, log) = recording_rig(&[entry("limit", "gem top.vset <= 250")]);
    let ctl = RampController::new(Arc::clone(&rig), fast_ramp());

    let err = ctl.raise(&plan(400.0), RampAuthority::Operator).unwrap_err();
    match err {
        CoreError::Safety { failed } => assert_eq!(failed, vec!["limit".to_string()]),
        other => panic!("expected safety abort, got {other:?}"),
    }

    let writes: Vec<f64> = log.lock().unwrap().iter().map(|(_, v)| *v).collect();
    assert_eq!(writes, vec![100.0, 200.0]);
}

// ─── Test 3: serializer never overlaps commands ─────────────────────

#[test]
fn concurrent_submitters_never_overlap_on_one_device() {
    let (rig, _) = recording_rig(&[]);
    let executor = Arc::clone(rig.executor("caen").unwrap());

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut submitters = Vec::new();
    for _ in 0..4 {
        let executor = Arc::clone(&executor);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        submitters.push(thread::spawn(move || {
            for _ in 0..10 {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                executor.submit("contend", move |_| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                });
            }
        }));
    }
    for handle in submitters {
        handle.join().unwrap();
    }
    executor.execute("drain", |_| Ok(())).unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

// ─── Test 4: trip, automatic recovery, disarm ───────────────────────

#[test]
fn trip_recovery_restores_the_ramped_state() {
    let device = hvsc_hal::SimDevice::instant("caen", &["gem top"]);
    let injector = device.fault_injector();

    let cache = Arc::new(ReadingsCache::new());
    let alerts = Arc::new(MemoryAlert::new());
    let mut rig = Rig::new(cache, Arc::clone(&alerts) as Arc<dyn AlertSink>);
    rig.register_device(Box::new(device), &[]);
    let rig = Arc::new(rig);

    // Power up and ramp to the working point first.
    {
        let mut dev = rig.executor("caen").unwrap().device_lock();
        dev.channel_mut(0).unwrap().turn_on().unwrap();
    }
    let ctl = RampController::new(Arc::clone(&rig), fast_ramp());
    ctl.raise(&plan(300.0), RampAuthority::Operator).unwrap();

    let recovery = RecoveryConfig {
        poll_interval: 0.01,
        max_trips: 3,
        max_attempts: 2,
        cooldown: 0.05,
        down_threshold: 50.0,
        down_timeout: 2.0,
    };
    let sup = Arc::new(TripRecoverySupervisor::new(
        Arc::clone(&rig),
        RampController::new(Arc::clone(&rig), fast_ramp()),
        recovery,
    ));
    let runner = {
        let sup = Arc::clone(&sup);
        thread::spawn(move || sup.run(&plan(300.0)))
    };

    thread::sleep(Duration::from_millis(100));
    assert!(rig.manual_locked());
    // Manual controls refuse while armed.
    assert!(matches!(
        rig.set_vset("gemtop", "100"),
        Err(CoreError::Permission { .. })
    ));

    injector.trip(0);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if sup.trip_count() == 1 {
            let dev = rig.executor("caen").unwrap().device_lock();
            let ch = dev.channel(0).unwrap();
            if ch.status().unwrap().is_on() && ch.vset().unwrap() == 300.0 {
                break;
            }
        }
        assert!(Instant::now() < deadline, "recovery never completed");
        thread::sleep(Duration::from_millis(20));
    }

    sup.disarm();
    runner.join().unwrap();
    assert!(!rig.manual_locked());
    // Manual controls work again after disarming.
    rig.set_vset("gemtop", "100").unwrap();

    assert!(alerts
        .messages()
        .iter()
        .any(|m| m.contains("trip detected")));
}
