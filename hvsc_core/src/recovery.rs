//! Trip detection and automatic recovery.
//!
//! Once armed with a ramp plan, the supervisor polls the cached
//! device snapshots and counts *trip edges*: a transition of the
//! tripped level from clear to active. A level that stays active is
//! one trip, however long it lasts.
//!
//! On each trip edge the supervisor runs one recovery cycle:
//! 1. wait (bounded) for every plan channel's monitored voltage to
//!    fall below the down-threshold;
//! 2. clear the alarm on every involved device and zero the plan
//!    channels' setpoints;
//! 3. cool down, interruptible by disarming;
//! 4. power the plan channels back on;
//! 5. re-run the ramp protocol, retrying on recoverable errors up to
//!    the attempt budget as long as no fresh trip is active.
//!
//! The supervisor holds the rig-wide manual lockout from arming to
//! disarming so operator controls cannot interleave with recovery.
//! Disarming waits for an in-flight recovery cycle to finish.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hvsc_common::config::RecoveryConfig;
use hvsc_common::error::CoreError;
use tracing::{info, warn};

use crate::alert::Severity;
use crate::ramp::{RampAuthority, RampController, RampOutcome, RampPlan};
use crate::rig::Rig;

/// Clear-to-active transition detector for a boolean level.
#[derive(Debug, Default)]
pub struct EdgeDetector {
    level: bool,
}

impl EdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known level, so a condition already active at
    /// arming time does not count as a new edge.
    pub fn starting_at(level: bool) -> Self {
        Self { level }
    }

    /// Feed one observation; true exactly on a rising edge.
    pub fn observe(&mut self, level: bool) -> bool {
        let edge = level && !self.level;
        self.level = level;
        edge
    }
}

/// Why a supervisor run ended.
#[derive(Debug)]
pub enum SupervisorOutcome {
    /// The operator disarmed the supervisor.
    Disarmed,
    /// More trips than the configured budget tolerates.
    TripBudgetExhausted { trips: u32 },
    /// The plan channels never discharged below the down-threshold.
    DownWaitTimeout,
    /// A recovery cycle failed beyond repair.
    RecoveryFailed { error: CoreError, attempts: u32 },
}

/// Watches for trips and re-ramps the detector automatically.
pub struct TripRecoverySupervisor {
    rig: Arc<Rig>,
    ramp: RampController,
    config: RecoveryConfig,
    disarm: Arc<AtomicBool>,
    trips: AtomicU32,
}

impl TripRecoverySupervisor {
    pub fn new(rig: Arc<Rig>, ramp: RampController, config: RecoveryConfig) -> Self {
        Self {
            rig,
            ramp,
            config,
            disarm: Arc::new(AtomicBool::new(false)),
            trips: AtomicU32::new(0),
        }
    }

    /// Shared flag the disarm control sets from another thread.
    pub fn disarm_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.disarm)
    }

    pub fn disarm(&self) {
        self.disarm.store(true, Ordering::SeqCst);
    }

    /// Trips counted since arming.
    pub fn trip_count(&self) -> u32 {
        self.trips.load(Ordering::SeqCst)
    }

    /// Arm the supervisor and monitor until disarmed or a fatal
    /// outcome. Blocks for the whole watch; run it on its own thread.
    pub fn run(&self, plan: &RampPlan) -> SupervisorOutcome {
        if !self.rig.lock_manual() {
            warn!("manual lockout already held at arming time");
        }
        self.disarm.store(false, Ordering::SeqCst);
        self.trips.store(0, Ordering::SeqCst);
        info!(channels = plan.channels.len(), "trip recovery armed");

        let outcome = self.watch(plan);
        self.rig.unlock_manual();
        match &outcome {
            SupervisorOutcome::Disarmed => info!("trip recovery disarmed"),
            other => {
                self.rig.alerts().alert(
                    Severity::Critical,
                    &format!("trip recovery stopped: {other:?}"),
                );
            }
        }
        outcome
    }

    fn watch(&self, plan: &RampPlan) -> SupervisorOutcome {
        let devices = self.involved_devices(plan);
        let mut edge = EdgeDetector::starting_at(self.trip_level(&devices));
        loop {
            if self.disarm.load(Ordering::SeqCst) {
                return SupervisorOutcome::Disarmed;
            }
            for device in &devices {
                if let Some(executor) = self.rig.executor(device) {
                    executor.submit_poll();
                }
            }
            let level = self.trip_level(&devices);
            if edge.observe(level) {
                let trips = self.trips.fetch_add(1, Ordering::SeqCst) + 1;
                self.rig.alerts().alert(
                    Severity::Critical,
                    &format!("trip detected ({trips} so far), starting recovery"),
                );
                if trips > self.config.max_trips {
                    return SupervisorOutcome::TripBudgetExhausted { trips };
                }
                if let Err(outcome) = self.recover(plan, &devices) {
                    return outcome;
                }
                self.rig
                    .alerts()
                    .alert(Severity::Info, "recovery complete, monitoring resumed");
            }
            thread::sleep(self.config.poll_duration());
        }
    }

    /// One recovery cycle; `Err` carries the terminal outcome.
    fn recover(&self, plan: &RampPlan, devices: &[String]) -> Result<(), SupervisorOutcome> {
        self.wait_for_discharge(plan, devices)?;

        for device in devices {
            if let Err(e) = self.clear_device_alarm(device) {
                return Err(SupervisorOutcome::RecoveryFailed {
                    error: e,
                    attempts: 0,
                });
            }
        }
        for ch in &plan.channels {
            if let Err(e) = self.write_channel(&ch.key, ChannelCommand::ZeroSetpoint) {
                return Err(SupervisorOutcome::RecoveryFailed {
                    error: e,
                    attempts: 0,
                });
            }
        }

        if !self.cooldown() {
            return Err(SupervisorOutcome::Disarmed);
        }

        for ch in &plan.channels {
            if let Err(e) = self.write_channel(&ch.key, ChannelCommand::PowerOn) {
                return Err(SupervisorOutcome::RecoveryFailed {
                    error: e,
                    attempts: 0,
                });
            }
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.ramp.raise(plan, RampAuthority::Recovery) {
                Ok(RampOutcome::Completed) => return Ok(()),
                Ok(RampOutcome::Cancelled) => {
                    return Err(SupervisorOutcome::RecoveryFailed {
                        error: CoreError::Cancelled,
                        attempts,
                    });
                }
                Err(e) => {
                    let fresh_trip = self.trip_level(devices);
                    if e.is_recoverable() && !fresh_trip && attempts < self.config.max_attempts {
                        warn!(attempt = attempts, error = %e, "re-ramp failed, retrying");
                        continue;
                    }
                    return Err(SupervisorOutcome::RecoveryFailed { error: e, attempts });
                }
            }
        }
    }

    /// Bounded wait for every plan channel to fall below the
    /// down-threshold.
    fn wait_for_discharge(
        &self,
        plan: &RampPlan,
        devices: &[String],
    ) -> Result<(), SupervisorOutcome> {
        let deadline = Instant::now() + self.config.down_timeout_duration();
        loop {
            for device in devices {
                if let Some(executor) = self.rig.executor(device) {
                    executor.submit_poll();
                }
            }
            thread::sleep(self.config.poll_duration().min(Duration::from_millis(100)));

            let down = plan.channels.iter().all(|ch| {
                self.rig
                    .cache()
                    .channel(&ch.key)
                    .map(|r| r.vmon < self.config.down_threshold)
                    .unwrap_or(false)
            });
            if down {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(SupervisorOutcome::DownWaitTimeout);
            }
        }
    }

    /// Cooldown pause; false if disarmed during it.
    fn cooldown(&self) -> bool {
        let mut remaining = self.config.cooldown_duration();
        let slice = Duration::from_millis(50);
        while remaining > Duration::ZERO {
            if self.disarm.load(Ordering::SeqCst) {
                return false;
            }
            let nap = remaining.min(slice);
            thread::sleep(nap);
            remaining -= nap;
        }
        true
    }

    fn trip_level(&self, devices: &[String]) -> bool {
        devices.iter().any(|d| {
            self.rig
                .cache()
                .device(d)
                .map(|s| s.tripped())
                .unwrap_or(false)
        })
    }

    fn involved_devices(&self, plan: &RampPlan) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for ch in &plan.channels {
            if let Some(device) = self.rig.device_of(&ch.key) {
                if !out.iter().any(|d| d == device) {
                    out.push(device.to_string());
                }
            }
        }
        out
    }

    // Goes through the executor directly: the rig-level path refuses
    // while the supervisor holds the manual lockout.
    fn clear_device_alarm(&self, device: &str) -> Result<(), CoreError> {
        let executor = self
            .rig
            .executor(device)
            .ok_or_else(|| CoreError::Validation(format!("unknown device '{device}'")))?;
        executor.execute("clear alarm", |dev| dev.clear_alarm())
    }

    fn write_channel(&self, key: &str, command: ChannelCommand) -> Result<(), CoreError> {
        let (si, ci) = self
            .rig
            .find_channel(key)
            .ok_or_else(|| CoreError::Validation(format!("unknown channel '{key}'")))?;
        let executor = self
            .rig
            .executor_at(si)
            .ok_or_else(|| CoreError::Validation(format!("unknown channel '{key}'")))?;
        executor.execute("recovery write", move |dev| {
            let ch = dev
                .channel_mut(ci)
                .ok_or_else(|| hvsc_hal::HalError::UnknownChannel(ci.to_string()))?;
            match command {
                ChannelCommand::ZeroSetpoint => ch.set_vset(0.0),
                ChannelCommand::PowerOn => ch.turn_on(),
            }
        })
    }
}

#[derive(Clone, Copy)]
enum ChannelCommand {
    ZeroSetpoint,
    PowerOn,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertSink, MemoryAlert};
    use hvsc_common::cache::ReadingsCache;
    use hvsc_common::config::RampConfig;
    use hvsc_hal::SimDevice;

    #[test]
    fn edge_detector_counts_transitions() {
        let mut edge = EdgeDetector::new();
        let observations = [false, true, true, false, true];
        let edges = observations.iter().filter(|&&l| edge.observe(l)).count();
        assert_eq!(edges, 2);
    }

    #[test]
    fn edge_detector_suppresses_preexisting_level() {
        let mut edge = EdgeDetector::starting_at(true);
        assert!(!edge.observe(true));
        assert!(!edge.observe(false));
        assert!(edge.observe(true));
    }

    fn fast_recovery() -> RecoveryConfig {
        RecoveryConfig {
            poll_interval: 0.01,
            max_trips: 3,
            max_attempts: 2,
            cooldown: 0.05,
            down_threshold: 50.0,
            down_timeout: 2.0,
        }
    }

    fn fast_ramp() -> RampConfig {
        RampConfig {
            step: 100.0,
            step_timeout: 2.0,
            settle: 0.01,
            poll_interval: 0.01,
        }
    }

    fn build(device: SimDevice) -> (Arc<Rig>, Arc<MemoryAlert>) {
        let cache = Arc::new(ReadingsCache::new());
        let alerts = Arc::new(MemoryAlert::new());
        let mut rig = Rig::new(cache, alerts.clone() as Arc<dyn AlertSink>);
        rig.register_device(Box::new(device), &[]);
        (Arc::new(rig), alerts)
    }

    fn plan_300() -> RampPlan {
        RampPlan::new(vec![
            crate::ramp::RampChannel::new("gem top", 300.0, 1.0, 1.0).unwrap()
        ])
        .unwrap()
    }

    #[test]
    fn recovers_after_a_trip_and_disarms_cleanly() {
        let device = SimDevice::instant("caen", &["gem top"]);
        let injector = device.fault_injector();
        let (rig, _) = build(device);
        {
            let mut dev = rig.executor("caen").unwrap().device_lock();
            let ch = dev.channel_mut(0).unwrap();
            ch.set_vset(300.0).unwrap();
            ch.turn_on().unwrap();
        }

        let ramp = RampController::new(Arc::clone(&rig), fast_ramp());
        let sup = Arc::new(TripRecoverySupervisor::new(
            Arc::clone(&rig),
            ramp,
            fast_recovery(),
        ));

        let runner = {
            let sup = Arc::clone(&sup);
            thread::spawn(move || sup.run(&plan_300()))
        };
        // Let it arm on a clean level, then inject a trip.
        thread::sleep(Duration::from_millis(100));
        assert!(rig.manual_locked());
        injector.trip(0);

        // Wait until the supervisor has recovered the channel.
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
        let outcome = runner.join().unwrap();
        assert!(matches!(outcome, SupervisorOutcome::Disarmed));
        assert!(!rig.manual_locked());
    }

    #[test]
    fn trip_budget_exhaustion_is_fatal() {
        let device = SimDevice::instant("caen", &["gem top"]);
        let injector = device.fault_injector();
        let (rig, _) = build(device);
        {
            let mut dev = rig.executor("caen").unwrap().device_lock();
            let ch = dev.channel_mut(0).unwrap();
            ch.set_vset(300.0).unwrap();
            ch.turn_on().unwrap();
        }
        let ramp = RampController::new(Arc::clone(&rig), fast_ramp());
        let mut config = fast_recovery();
        config.max_trips = 0;
        let sup = Arc::new(TripRecoverySupervisor::new(Arc::clone(&rig), ramp, config));

        let runner = {
            let sup = Arc::clone(&sup);
            thread::spawn(move || sup.run(&plan_300()))
        };
        thread::sleep(Duration::from_millis(50));
        injector.trip(0);
        let outcome = runner.join().unwrap();
        assert!(matches!(
            outcome,
            SupervisorOutcome::TripBudgetExhausted { trips: 1 }
        ));
        assert!(!rig.manual_locked());
    }

    #[test]
    fn non_recoverable_ramp_failure_aborts_recovery() {
        use hvsc_common::config::CheckEntry;

        // The gate refuses 300 V, so the re-ramp fails with a Safety
        // error, which is not retried.
        let device = SimDevice::instant("caen", &["gem top"]);
        let injector = device.fault_injector();
        let cache = Arc::new(ReadingsCache::new());
        let alerts = Arc::new(MemoryAlert::new());
        let mut rig = Rig::new(cache, alerts as Arc<dyn AlertSink>);
        rig.register_device(
            Box::new(device),
            &[CheckEntry {
                name: "limit".into(),
                condition: "gem top.vset <= 250".into(),
                description: String::new(),
                enabled: true,
            }],
        );
        let rig = Arc::new(rig);
        {
            let mut dev = rig.executor("caen").unwrap().device_lock();
            let ch = dev.channel_mut(0).unwrap();
            ch.set_vset(300.0).unwrap();
            ch.turn_on().unwrap();
        }
        let ramp = RampController::new(Arc::clone(&rig), fast_ramp());
        let sup = Arc::new(TripRecoverySupervisor::new(
            Arc::clone(&rig),
            ramp,
            fast_recovery(),
        ));

        let runner = {
            let sup = Arc::clone(&sup);
            thread::spawn(move || sup.run(&plan_300()))
        };
        thread::sleep(Duration::from_millis(50));
        injector.trip(0);
        let outcome = runner.join().unwrap();
        match outcome {
            SupervisorOutcome::RecoveryFailed { error, attempts } => {
                assert!(matches!(error, CoreError::Safety { .. }));
                assert_eq!(attempts, 1);
            }
            other => panic!("expected recovery failure, got {other:?}"),
        }
        assert!(!rig.manual_locked());
    }

    #[test]
    fn retry_budget_exhaustion_is_terminal() {
        // 1 V/s cannot converge a 100 V step inside the timeout, so
        // every re-ramp attempt times out (a recoverable kind).
        let device = SimDevice::new("caen", &["gem top"], 1.0);
        let injector = device.fault_injector();
        let (rig, _) = build(device);
        {
            let mut dev = rig.executor("caen").unwrap().device_lock();
            let ch = dev.channel_mut(0).unwrap();
            ch.set_vset(300.0).unwrap();
            ch.turn_on().unwrap();
        }
        let mut ramp_config = fast_ramp();
        ramp_config.step_timeout = 0.1;
        let ramp = RampController::new(Arc::clone(&rig), ramp_config);
        let sup = Arc::new(TripRecoverySupervisor::new(
            Arc::clone(&rig),
            ramp,
            fast_recovery(),
        ));

        let runner = {
            let sup = Arc::clone(&sup);
            thread::spawn(move || sup.run(&plan_300()))
        };
        thread::sleep(Duration::from_millis(50));
        injector.trip(0);
        let outcome = runner.join().unwrap();
        match outcome {
            SupervisorOutcome::RecoveryFailed { error, attempts } => {
                assert!(matches!(error, CoreError::Timeout { .. }));
                assert_eq!(attempts, 2);
            }
            other => panic!("expected recovery failure, got {other:?}"),
        }
    }

    #[test]
    fn down_wait_timeout_is_fatal() {
        // An interlock trips the device while its channel stays
        // powered at 300 V, so it never discharges.
        let device = SimDevice::instant("caen", &["gem top"]);
        let injector = device.fault_injector();
        let (rig, _) = build(device);
        {
            let mut dev = rig.executor("caen").unwrap().device_lock();
            let ch = dev.channel_mut(0).unwrap();
            ch.set_vset(300.0).unwrap();
            ch.turn_on().unwrap();
        }
        let ramp = RampController::new(Arc::clone(&rig), fast_ramp());
        let mut config = fast_recovery();
        config.down_timeout = 0.2;
        let sup = Arc::new(TripRecoverySupervisor::new(Arc::clone(&rig), ramp, config));

        let runner = {
            let sup = Arc::clone(&sup);
            thread::spawn(move || sup.run(&plan_300()))
        };
        thread::sleep(Duration::from_millis(50));
        injector.set_interlock(true);
        let outcome = runner.join().unwrap();
        assert!(matches!(outcome, SupervisorOutcome::DownWaitTimeout));
    }
}
