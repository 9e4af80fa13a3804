//! Per-device command serializer.
//!
//! Every hardware access for a device goes through one FIFO queue
//! drained by one worker thread, so commands never interleave on the
//! wire regardless of how many control paths are active:
//! - `submit` enqueues a control operation and returns immediately
//! - `execute` enqueues and blocks until the operation ran, returning
//!   its result (used where the caller needs the outcome, e.g. trip
//!   recovery)
//! - `submit_poll` enqueues a full readout refresh, coalesced: if an
//!   identical poll is already queued the new one is dropped
//!
//! The worker runs each operation while holding the device lock. The
//! check engine takes the same lock directly for read-only evaluation;
//! it never enters the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use hvsc_common::cache::{ChannelReading, DeviceSnapshot, ReadingsCache};
use hvsc_common::condition_key;
use hvsc_common::error::CoreError;
use hvsc_hal::{HalError, HvDevice};
use tracing::warn;

use crate::alert::{AlertSink, Severity};

/// What kind of work an operation is; polls coalesce, controls queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Poll,
    Control,
}

type OpFn = Box<dyn FnOnce(&mut dyn HvDevice) -> Result<(), HalError> + Send>;

struct Operation {
    kind: OpKind,
    label: &'static str,
    run: OpFn,
}

#[derive(Default)]
struct Queue {
    ops: VecDeque<Operation>,
    running: Option<OpKind>,
    shutdown: bool,
}

struct Shared {
    name: String,
    device: Mutex<Box<dyn HvDevice>>,
    queue: Mutex<Queue>,
    cv: Condvar,
    cache: Arc<ReadingsCache>,
    alerts: Arc<dyn AlertSink>,
}

/// Serialized access to one device.
///
/// Dropping the executor shuts the worker down after the queue drains
/// its current operation.
pub struct DeviceExecutor {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DeviceExecutor {
    pub fn new(
        device: Box<dyn HvDevice>,
        cache: Arc<ReadingsCache>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let name = device.name().to_string();
        let shared = Arc::new(Shared {
            name: name.clone(),
            device: Mutex::new(device),
            queue: Mutex::new(Queue::default()),
            cv: Condvar::new(),
            cache,
            alerts,
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("hvsc-exec-{name}"))
                .spawn(move || worker_loop(&shared))
                .unwrap_or_else(|e| panic!("failed to spawn executor thread: {e}"))
        };
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Device name this executor serializes.
    pub fn device_name(&self) -> &str {
        &self.shared.name
    }

    /// The device lock.
    ///
    /// Held by the worker while an operation runs; the check engine
    /// locks it directly for read-only evaluation. Callers must not
    /// block on the queue while holding this.
    pub fn device_lock(&self) -> MutexGuard<'_, Box<dyn HvDevice>> {
        self.shared
            .device
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a control operation and return immediately.
    ///
    /// Failures are logged and alerted by the worker; use [`execute`]
    /// when the caller needs the result.
    ///
    /// [`execute`]: Self::execute
    pub fn submit(
        &self,
        label: &'static str,
        f: impl FnOnce(&mut dyn HvDevice) -> Result<(), HalError> + Send + 'static,
    ) {
        self.enqueue(Operation {
            kind: OpKind::Control,
            label,
            run: Box::new(f),
        });
    }

    /// Enqueue a control operation and block until it ran.
    pub fn execute<R: Send + 'static>(
        &self,
        label: &'static str,
        f: impl FnOnce(&mut dyn HvDevice) -> Result<R, HalError> + Send + 'static,
    ) -> Result<R, CoreError> {
        let (tx, rx) = mpsc::channel();
        self.enqueue(Operation {
            kind: OpKind::Control,
            label,
            run: Box::new(move |dev| {
                // The caller owns failure reporting here. A dropped
                // receiver means the caller went away; the operation
                // itself still ran.
                let _ = tx.send(f(dev));
                Ok(())
            }),
        });
        match rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CoreError::Comm(e.to_string())),
            Err(_) => Err(CoreError::Comm("executor shut down".into())),
        }
    }

    /// Enqueue a full readout refresh unless one is already pending.
    ///
    /// Returns false when the poll was coalesced into the queued one.
    pub fn submit_poll(&self) -> bool {
        let shared = Arc::clone(&self.shared);
        let op = Operation {
            kind: OpKind::Poll,
            label: "poll",
            run: Box::new(move |dev| poll_device(dev, &shared.cache, &*shared.alerts)),
        };
        // Check and push under one lock, or two racing submitters
        // could both enqueue a poll.
        let mut queue = self.lock_queue();
        if queue.shutdown || queue.ops.iter().any(|op| op.kind == OpKind::Poll) {
            return false;
        }
        queue.ops.push_back(op);
        self.shared.cv.notify_all();
        true
    }

    /// Whether a control operation is queued or running.
    ///
    /// Polls do not count: busy reflects commands in flight, which is
    /// what operator surfaces indicate.
    pub fn busy(&self) -> bool {
        let queue = self.lock_queue();
        queue.running == Some(OpKind::Control)
            || queue.ops.iter().any(|op| op.kind == OpKind::Control)
    }

    /// Pending (control, poll) queue depths. Running ops not included.
    pub fn pending(&self) -> (usize, usize) {
        let queue = self.lock_queue();
        let control = queue
            .ops
            .iter()
            .filter(|op| op.kind == OpKind::Control)
            .count();
        (control, queue.ops.len() - control)
    }

    fn enqueue(&self, op: Operation) {
        let mut queue = self.lock_queue();
        if queue.shutdown {
            warn!(device = %self.shared.name, label = op.label, "executor shut down, dropping operation");
            return;
        }
        queue.ops.push_back(op);
        self.shared.cv.notify_all();
    }

    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for DeviceExecutor {
    fn drop(&mut self) {
        {
            let mut queue = self.lock_queue();
            queue.shutdown = true;
            self.shared.cv.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let op = {
            let mut queue = shared
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(op) = queue.ops.pop_front() {
                    queue.running = Some(op.kind);
                    break op;
                }
                if queue.shutdown {
                    return;
                }
                queue = shared
                    .cv
                    .wait(queue)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };

        let result = {
            let mut device = shared
                .device
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            (op.run)(device.as_mut())
        };
        if let Err(e) = result {
            warn!(device = %shared.name, label = op.label, error = %e, "operation failed");
            if op.kind == OpKind::Control {
                shared.alerts.alert(
                    Severity::Warning,
                    &format!("command '{}' on '{}' failed: {e}", op.label, shared.name),
                );
            }
        }

        let mut queue = shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        queue.running = None;
        shared.cv.notify_all();
    }
}

/// Read every channel and the device-level state into the cache.
///
/// Reports a trip alert on the rising edge of the device snapshot's
/// tripped level, comparing against the previous cached snapshot.
fn poll_device(
    dev: &mut dyn HvDevice,
    cache: &ReadingsCache,
    alerts: &dyn AlertSink,
) -> Result<(), HalError> {
    let at = SystemTime::now();
    for i in 0..dev.channel_count() {
        let Some(ch) = dev.channel(i) else { continue };
        let reading = ChannelReading {
            vset: ch.vset()?,
            iset: ch.iset()?,
            vmon: ch.vmon()?,
            imon: ch.imon()?,
            status: ch.status()?,
            at,
        };
        cache.update_channel(&condition_key(ch.name()), reading);
    }

    let previous = cache.device(dev.name());
    let snapshot = DeviceSnapshot {
        active_alarms: dev.alarm_status()?.active(),
        interlock: dev.interlock_status()?,
    };
    if snapshot.tripped() && !previous.as_ref().is_some_and(DeviceSnapshot::tripped) {
        let mut what = snapshot.active_alarms.join(", ");
        if snapshot.interlock {
            if !what.is_empty() {
                what.push_str(", ");
            }
            what.push_str("interlock");
        }
        alerts.alert(
            Severity::Critical,
            &format!("device '{}' tripped: {what}", dev.name()),
        );
    }
    cache.update_device(dev.name(), snapshot);
    Ok(())
}

/// Periodic poll source: submits one poll per interval until shutdown.
///
/// Back-pressure is free: when the worker lags, `submit_poll` coalesces
/// and the tick is a no-op.
pub fn spawn_poller(
    executor: Arc<DeviceExecutor>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("hvsc-poll-{}", executor.device_name()))
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                executor.submit_poll();
                thread::sleep(interval);
            }
        })
        .unwrap_or_else(|e| panic!("failed to spawn poller thread: {e}"))
}
