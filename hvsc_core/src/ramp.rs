//! Stepped multi-channel voltage ramp protocol.
//!
//! All channels of a plan advance together along a shared *ramp
//! coordinate*. Each step:
//! 1. advances the coordinate by the configured step size and derives
//!    per-channel targets (`round(coordinate / factor)`, clamped at
//!    the channel's final target);
//! 2. vets the whole prospective step against every check set in
//!    simulated mode; any failure aborts the ramp with nothing
//!    written;
//! 3. queues the setpoint writes, skipping channels whose monitored
//!    voltage or setpoint is already at or beyond the step target;
//! 4. waits for every monitored voltage to converge within the
//!    channel's precision, bounded by the step timeout;
//! 5. settles before the next step.
//!
//! Convergence is one-sided: while raising, only an undershoot beyond
//! the precision blocks; overshoot is already past the step target.
//! Lowering mirrors that.
//!
//! Cancellation is cooperative through a shared flag, observed at
//! step boundaries and inside the convergence wait. A cancelled ramp
//! leaves the last written setpoints in place; nothing is rolled
//! back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hvsc_common::condition_key;
use hvsc_common::config::{PlanChannelConfig, RampConfig};
use hvsc_common::error::CoreError;
use tracing::{debug, info, warn};

use crate::alert::Severity;
use crate::check::expr::Value;
use crate::rig::Rig;

/// One channel of a ramp plan.
#[derive(Debug, Clone, PartialEq)]
pub struct RampChannel {
    /// Display name.
    pub name: String,
    /// Condition key (display name with spaces elided).
    pub key: String,
    /// Final voltage target [V].
    pub target: f64,
    /// Ratio of this channel's voltage to the shared coordinate.
    pub factor: f64,
    /// Convergence tolerance [V].
    pub precision: f64,
}

impl RampChannel {
    pub fn new(name: &str, target: f64, factor: f64, precision: f64) -> Result<Self, CoreError> {
        if !target.is_finite() || target < 0.0 {
            return Err(CoreError::Validation(format!(
                "target {target} for '{name}' is outside the allowed range"
            )));
        }
        if !factor.is_finite() || factor <= 0.0 {
            return Err(CoreError::Validation(format!(
                "factor {factor} for '{name}' must be positive"
            )));
        }
        if !precision.is_finite() || precision < 0.0 {
            return Err(CoreError::Validation(format!(
                "precision {precision} for '{name}' must not be negative"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            key: condition_key(name),
            target,
            factor,
            precision,
        })
    }

    /// Parse operator-entered text fields.
    pub fn parse(
        name: &str,
        target: &str,
        factor: &str,
        precision: &str,
    ) -> Result<Self, CoreError> {
        Self::new(
            name,
            parse_field(name, "target", target)?,
            parse_field(name, "factor", factor)?,
            parse_field(name, "precision", precision)?,
        )
    }
}

fn parse_field(name: &str, what: &str, text: &str) -> Result<f64, CoreError> {
    text.trim()
        .parse()
        .map_err(|_| CoreError::Validation(format!("{what} '{text}' for '{name}' is not a number")))
}

/// A validated set of channels to ramp together.
#[derive(Debug, Clone, PartialEq)]
pub struct RampPlan {
    pub channels: Vec<RampChannel>,
}

impl RampPlan {
    pub fn new(channels: Vec<RampChannel>) -> Result<Self, CoreError> {
        if channels.is_empty() {
            return Err(CoreError::Validation("ramp plan is empty".into()));
        }
        for (i, ch) in channels.iter().enumerate() {
            if channels[..i].iter().any(|other| other.key == ch.key) {
                return Err(CoreError::Validation(format!(
                    "channel '{}' appears twice in the plan",
                    ch.name
                )));
            }
        }
        Ok(Self { channels })
    }

    pub fn from_config(entries: &[PlanChannelConfig]) -> Result<Self, CoreError> {
        let channels = entries
            .iter()
            .map(|e| RampChannel::new(&e.name, e.target, e.factor, e.precision))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(channels)
    }
}

/// How a finished ramp ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampOutcome {
    Completed,
    Cancelled,
}

/// Who is driving the ramp; recovery bypasses the manual lockout it
/// itself holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampAuthority {
    Operator,
    Recovery,
}

/// Runs ramp protocols against a rig.
pub struct RampController {
    rig: Arc<Rig>,
    config: RampConfig,
    cancel: Arc<AtomicBool>,
}

impl RampController {
    pub fn new(rig: Arc<Rig>, config: RampConfig) -> Self {
        Self {
            rig,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag a cancel control can set from any thread.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Request cancellation of the running protocol.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Ramp every plan channel up to its target.
    ///
    /// Every channel must be powered on before the ramp starts.
    pub fn raise(&self, plan: &RampPlan, authority: RampAuthority) -> Result<RampOutcome, CoreError> {
        if authority == RampAuthority::Operator && self.rig.manual_locked() {
            return Err(CoreError::locked_out());
        }
        if self.config.step <= 0.0 {
            return Err(CoreError::Validation(format!(
                "ramp step {} must be positive",
                self.config.step
            )));
        }
        for ch in &plan.channels {
            if !self.rig.live_status(&ch.key)?.is_on() {
                return Err(CoreError::not_powered(&ch.name));
            }
        }
        let result = self.run_raise(plan);
        // Protocol cleanup: a stale cancel request must not abort the
        // next run.
        self.cancel.store(false, Ordering::SeqCst);
        if let Err(e) = &result {
            self.rig
                .alerts()
                .alert(Severity::Critical, &format!("ramp aborted: {e}"));
        }
        result
    }

    /// Ramp every plan channel down from its current setpoint, then
    /// power all of them off.
    ///
    /// Channels found off are reported and skipped at the power-off
    /// stage, not an error.
    pub fn shut_down(
        &self,
        plan: &RampPlan,
        authority: RampAuthority,
    ) -> Result<RampOutcome, CoreError> {
        if authority == RampAuthority::Operator && self.rig.manual_locked() {
            return Err(CoreError::locked_out());
        }
        if self.config.step <= 0.0 {
            return Err(CoreError::Validation(format!(
                "ramp step {} must be positive",
                self.config.step
            )));
        }
        for ch in &plan.channels {
            if self.rig.find_channel(&ch.key).is_none() {
                return Err(CoreError::Validation(format!(
                    "unknown channel '{}'",
                    ch.name
                )));
            }
            if !self.rig.live_status(&ch.key)?.is_on() {
                warn!(channel = %ch.name, "shutting down a channel that is already off");
            }
        }
        let result = self.run_shut_down(plan);
        self.cancel.store(false, Ordering::SeqCst);
        if let Err(e) = &result {
            self.rig
                .alerts()
                .alert(Severity::Critical, &format!("shutdown aborted: {e}"));
        }
        result
    }

    fn run_raise(&self, plan: &RampPlan) -> Result<RampOutcome, CoreError> {
        let step = self.config.step;
        let max_coord = plan
            .channels
            .iter()
            .map(|c| (c.target * c.factor).round())
            .fold(0.0_f64, f64::max);
        let n_steps = (max_coord / step) as usize + 1;
        info!(steps = n_steps, channels = plan.channels.len(), "ramp up started");

        let mut coordinate = 0.0;
        for step_index in 0..n_steps {
            if self.cancelled() {
                info!("ramp up cancelled");
                return Ok(RampOutcome::Cancelled);
            }
            coordinate += step;
            let targets: Vec<f64> = plan
                .channels
                .iter()
                .map(|c| (coordinate / c.factor).round().min(c.target))
                .collect();
            debug!(step = step_index + 1, coordinate, ?targets, "ramp step");

            self.gate(plan, &targets)?;
            if self.cancelled() {
                return Ok(RampOutcome::Cancelled);
            }

            for (ch, &target) in plan.channels.iter().zip(&targets) {
                // A channel whose monitor already ran past the step
                // target is left alone, as is one whose setpoint is
                // already there.
                if self.cached_vmon(&ch.key, UNPOLLED_LOW) <= target
                    && self.cached_vset(&ch.key, UNPOLLED_LOW) < target
                {
                    self.submit_vset(ch, target)?;
                }
            }

            if !self.converge(plan, &targets, Direction::Raising)? {
                return Ok(RampOutcome::Cancelled);
            }
            if !self.settle() {
                return Ok(RampOutcome::Cancelled);
            }
        }
        info!("ramp up complete");
        Ok(RampOutcome::Completed)
    }

    fn run_shut_down(&self, plan: &RampPlan) -> Result<RampOutcome, CoreError> {
        let step = self.config.step;
        // Seed the descent from the cache; a channel never polled is
        // read live so its ramp-down is not skipped.
        let mut temps = Vec::with_capacity(plan.channels.len());
        for ch in &plan.channels {
            let vset = match self.rig.cache().channel(&ch.key) {
                Some(reading) => reading.vset,
                None => self.rig.live_vset(&ch.key)?,
            };
            temps.push(vset.max(0.0));
        }
        let max_coord = plan
            .channels
            .iter()
            .zip(&temps)
            .map(|(c, &v)| (v * c.factor).round())
            .fold(0.0_f64, f64::max);
        let n_steps = (max_coord / step) as usize + 1;
        info!(steps = n_steps, channels = plan.channels.len(), "ramp down started");

        for step_index in 0..n_steps {
            if self.cancelled() {
                info!("ramp down cancelled");
                return Ok(RampOutcome::Cancelled);
            }
            for (ch, temp) in plan.channels.iter().zip(temps.iter_mut()) {
                *temp = (*temp - step / ch.factor).round().max(0.0);
            }
            debug!(step = step_index + 1, targets = ?temps, "ramp down step");

            self.gate(plan, &temps)?;
            if self.cancelled() {
                return Ok(RampOutcome::Cancelled);
            }

            for (ch, &target) in plan.channels.iter().zip(&temps) {
                if self.cached_vmon(&ch.key, UNPOLLED_HIGH) >= target
                    && self.cached_vset(&ch.key, UNPOLLED_HIGH) > target
                {
                    self.submit_vset(ch, target)?;
                }
            }

            if !self.converge(plan, &temps, Direction::Lowering)? {
                return Ok(RampOutcome::Cancelled);
            }
            if !self.settle() {
                return Ok(RampOutcome::Cancelled);
            }
        }

        if self.cancelled() {
            return Ok(RampOutcome::Cancelled);
        }
        for ch in &plan.channels {
            let (si, ci) = self
                .rig
                .find_channel(&ch.key)
                .ok_or_else(|| CoreError::Validation(format!("unknown channel '{}'", ch.name)))?;
            let executor = self
                .rig
                .executor_at(si)
                .ok_or_else(|| CoreError::Validation(format!("unknown channel '{}'", ch.name)))?;
            executor.execute("turn off", move |dev| {
                dev.channel_mut(ci)
                    .ok_or_else(|| hvsc_hal::HalError::UnknownChannel(ci.to_string()))?
                    .turn_off()
            })?;
        }
        info!("ramp down complete, outputs off");
        Ok(RampOutcome::Completed)
    }

    /// Vet one prospective step against every check set.
    fn gate(&self, plan: &RampPlan, targets: &[f64]) -> Result<(), CoreError> {
        let mut overrides = BTreeMap::new();
        for (ch, &target) in plan.channels.iter().zip(targets) {
            overrides.insert(format!("{}.vset", ch.key), Value::Num(target));
        }
        let failures = self.rig.evaluate_simulated_all(&overrides)?;
        if failures.is_empty() {
            return Ok(());
        }
        Err(CoreError::Safety {
            failed: failures.into_iter().map(|f| f.check).collect(),
        })
    }

    /// Wait until every channel converged on its step target.
    ///
    /// Polls are requested each iteration and coalesce at the
    /// serializer when the device is slow. Returns false on
    /// cancellation.
    fn converge(
        &self,
        plan: &RampPlan,
        targets: &[f64],
        direction: Direction,
    ) -> Result<bool, CoreError> {
        let deadline = Instant::now() + self.config.step_timeout_duration();
        let fallback = match direction {
            Direction::Raising => UNPOLLED_LOW,
            Direction::Lowering => UNPOLLED_HIGH,
        };
        loop {
            if self.cancelled() {
                return Ok(false);
            }
            for executor in self.rig.executors() {
                executor.submit_poll();
            }
            thread::sleep(self.config.poll_duration());

            let reached = plan.channels.iter().zip(targets).all(|(ch, &target)| {
                let vmon = self.cached_vmon(&ch.key, fallback);
                match direction {
                    Direction::Raising => target - vmon <= ch.precision,
                    Direction::Lowering => vmon - target <= ch.precision,
                }
            });
            if reached {
                return Ok(true);
            }
            if Instant::now() > deadline {
                return Err(CoreError::Timeout {
                    what: "waiting for ramp step convergence".into(),
                });
            }
        }
    }

    /// Post-convergence pause, sliced so cancellation stays prompt.
    /// Returns false on cancellation.
    fn settle(&self) -> bool {
        let mut remaining = self.config.settle_duration();
        let slice = Duration::from_millis(50);
        while remaining > Duration::ZERO {
            if self.cancelled() {
                return false;
            }
            let nap = remaining.min(slice);
            thread::sleep(nap);
            remaining -= nap;
        }
        !self.cancelled()
    }

    fn submit_vset(&self, ch: &RampChannel, target: f64) -> Result<(), CoreError> {
        let (si, ci) = self
            .rig
            .find_channel(&ch.key)
            .ok_or_else(|| CoreError::Validation(format!("unknown channel '{}'", ch.name)))?;
        let executor = self
            .rig
            .executor_at(si)
            .ok_or_else(|| CoreError::Validation(format!("unknown channel '{}'", ch.name)))?;
        executor.submit("ramp vset", move |dev| {
            dev.channel_mut(ci)
                .ok_or_else(|| hvsc_hal::HalError::UnknownChannel(ci.to_string()))?
                .set_vset(target)
        });
        Ok(())
    }

    // A channel never polled must neither skip a write nor count as
    // converged; the fallback sits on the far side of every target
    // for the direction in use.
    fn cached_vset(&self, key: &str, fallback: f64) -> f64 {
        self.rig
            .cache()
            .channel(key)
            .map(|r| r.vset)
            .unwrap_or(fallback)
    }

    fn cached_vmon(&self, key: &str, fallback: f64) -> f64 {
        self.rig
            .cache()
            .channel(key)
            .map(|r| r.vmon)
            .unwrap_or(fallback)
    }
}

/// Cache fallback while raising: below every target.
const UNPOLLED_LOW: f64 = -1.0;
/// Cache fallback while lowering: above every target.
const UNPOLLED_HIGH: f64 = f64::MAX;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Raising,
    Lowering,
}
