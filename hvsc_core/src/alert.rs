//! Operator notification port.
//!
//! Check failures, trips, and recovery milestones are reported through
//! an injected [`AlertSink`] rather than a concrete popup/notifier, so
//! the core stays headless and tests can capture what was raised.

use std::sync::Mutex;

use tracing::{error, info, warn};

/// How urgent an alert is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Destination for operator-facing notifications.
pub trait AlertSink: Send + Sync {
    fn alert(&self, severity: Severity, message: &str);
}

/// Default sink: forwards alerts to the tracing pipeline.
#[derive(Debug, Default)]
pub struct TracingAlert;

impl AlertSink for TracingAlert {
    fn alert(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(target: "hvsc::alert", "{message}"),
            Severity::Warning => warn!(target: "hvsc::alert", "{message}"),
            Severity::Critical => error!(target: "hvsc::alert", "{message}"),
        }
    }
}

/// Capturing sink for tests.
#[derive(Debug, Default)]
pub struct MemoryAlert {
    events: Mutex<Vec<(Severity, String)>>,
}

impl MemoryAlert {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Severity, String)> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events().into_iter().map(|(_, m)| m).collect()
    }
}

impl AlertSink for MemoryAlert {
    fn alert(&self, severity: Severity, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((severity, message.to_string()));
    }
}
