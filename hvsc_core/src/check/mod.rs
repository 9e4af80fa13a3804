//! Named safety conditions.
//!
//! A [`Check`] pairs a display name with a boolean condition over
//! channel attributes. Conditions are compiled once at load time;
//! channel display names containing spaces are elided to their
//! condition keys first, so `gem top.vset` in the checks file matches
//! the identifier `gemtop.vset` in the compiled form.
//!
//! Two evaluation modes share the same compiled expression:
//! - *live*: identifiers resolve against hardware reads through the
//!   device facade, with the device locks held by the caller;
//! - *simulated*: identifiers resolve against the readings cache, with
//!   a set of overrides standing in for prospective setpoints. No
//!   hardware is touched.
//!
//! A check whose condition failed to compile is vacuously false: it
//! reports its own name and text as a failure on every evaluation and
//! never raises.

pub mod expr;

use std::collections::BTreeMap;

use hvsc_common::cache::ReadingsCache;
use hvsc_common::config::CheckEntry;
use hvsc_common::error::CoreError;
use tracing::warn;

use expr::{Bindings, EvalError, Expr, Value};

pub use expr::ParseError;

/// One named safety condition.
#[derive(Debug, Clone)]
pub struct Check {
    /// Display name, reported on failure.
    pub name: String,
    /// Condition text as written in the checks file.
    pub condition: String,
    /// Human-readable description.
    pub description: String,
    /// Disabled checks are vacuously true.
    pub enabled: bool,
    compiled: Option<Expr>,
}

impl Check {
    /// Compile a condition, eliding the given channel display names.
    ///
    /// Compilation failure is tolerated: the check stays usable but
    /// fails every evaluation.
    pub fn compile(name: &str, condition: &str, bound_names: &[String]) -> Self {
        let elided = elide_names(condition, bound_names);
        let compiled = match Expr::parse(&elided) {
            Ok(expr) => Some(expr),
            Err(e) => {
                warn!(check = name, condition, error = %e, "condition failed to compile");
                None
            }
        };
        Self {
            name: name.to_string(),
            condition: condition.to_string(),
            description: String::new(),
            enabled: true,
            compiled,
        }
    }

    pub fn from_entry(entry: &CheckEntry, bound_names: &[String]) -> Self {
        let mut check = Self::compile(&entry.name, &entry.condition, bound_names);
        check.description = entry.description.clone();
        check.enabled = entry.enabled;
        check
    }

    /// Whether the condition compiled.
    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// Evaluate against `bindings`.
    ///
    /// Disabled checks pass; uncompiled checks fail without error.
    /// Unbound identifiers are a hard error, distinct from an ordinary
    /// check failure.
    pub fn evaluate(&self, bindings: &dyn Bindings) -> Result<bool, CoreError> {
        if !self.enabled {
            return Ok(true);
        }
        let Some(expr) = &self.compiled else {
            return Ok(false);
        };
        match expr.eval(bindings) {
            Ok(value) => Ok(value.truthy()),
            Err(EvalError::Name(name)) => Err(CoreError::Name {
                check: self.name.clone(),
                name,
                condition: self.condition.clone(),
            }),
            Err(EvalError::Type(detail)) => Err(CoreError::Validation(format!(
                "check '{}': {detail}",
                self.name
            ))),
            Err(EvalError::Read(detail)) => Err(CoreError::Comm(detail)),
        }
    }
}

/// Elide every bound display name to its condition key.
///
/// Longer names are substituted first so `gem top hv` never gets
/// partially rewritten by `gem top`.
fn elide_names(condition: &str, bound_names: &[String]) -> String {
    let mut names: Vec<&String> = bound_names.iter().filter(|n| n.contains(' ')).collect();
    names.sort_by_key(|n| std::cmp::Reverse(n.len()));
    let mut out = condition.to_string();
    for name in names {
        out = out.replace(name.as_str(), &hvsc_common::condition_key(name));
    }
    out
}

/// One failed check, as reported to the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckFailure {
    pub check: String,
    pub condition: String,
}

/// An evaluation group: the checks plus the devices whose locks a
/// live evaluation must hold.
#[derive(Debug, Clone, Default)]
pub struct CheckSet {
    pub checks: Vec<Check>,
    /// Device names to lock for live evaluation, in any order; the
    /// rig sorts them by registration index before locking.
    pub devices: Vec<String>,
}

impl CheckSet {
    pub fn from_entries(
        entries: &[CheckEntry],
        bound_names: &[String],
        devices: Vec<String>,
    ) -> Self {
        Self {
            checks: entries
                .iter()
                .map(|e| Check::from_entry(e, bound_names))
                .collect(),
            devices,
        }
    }

    /// Evaluate every check; returns the failures.
    ///
    /// The first hard evaluation error aborts the pass: an unbound
    /// name means the condition set itself is wrong, and a safety
    /// verdict built on it would be meaningless.
    pub fn evaluate_all(&self, bindings: &dyn Bindings) -> Result<Vec<CheckFailure>, CoreError> {
        let mut failures = Vec::new();
        for check in &self.checks {
            if !check.evaluate(bindings)? {
                failures.push(CheckFailure {
                    check: check.name.clone(),
                    condition: check.condition.clone(),
                });
            }
        }
        Ok(failures)
    }

    /// Evaluate against the cache with prospective-value overrides.
    pub fn evaluate_simulated(
        &self,
        overrides: &BTreeMap<String, Value>,
        cache: &ReadingsCache,
        known_keys: &[String],
    ) -> Result<Vec<CheckFailure>, CoreError> {
        let bindings = SimulatedBindings {
            overrides,
            cache,
            known_keys,
        };
        self.evaluate_all(&bindings)
    }

    /// Enable or disable one check by name; returns false if unknown.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.checks.iter_mut().find(|c| c.name == name) {
            Some(check) => {
                check.enabled = enabled;
                true
            }
            None => false,
        }
    }
}

/// Cache-backed bindings for simulated evaluation.
///
/// Overrides win over the cache; identifiers naming a known channel
/// with no cached reading yet resolve to a zeroed reading. Anything
/// else is an unbound name.
pub struct SimulatedBindings<'a> {
    pub overrides: &'a BTreeMap<String, Value>,
    pub cache: &'a ReadingsCache,
    pub known_keys: &'a [String],
}

impl Bindings for SimulatedBindings<'_> {
    fn resolve(&self, ident: &str) -> Result<Value, EvalError> {
        if let Some(v) = self.overrides.get(ident) {
            return Ok(v.clone());
        }
        match ident.split_once('.') {
            Some((key, attr)) => {
                if !self.known_keys.iter().any(|k| k == key) {
                    return Err(EvalError::Name(ident.to_string()));
                }
                let reading = self.cache.channel(key).unwrap_or_default();
                match attr {
                    "vset" => Ok(Value::Num(reading.vset)),
                    "iset" => Ok(Value::Num(reading.iset)),
                    "vmon" => Ok(Value::Num(reading.vmon)),
                    "imon" => Ok(Value::Num(reading.imon)),
                    "on" => Ok(Value::Bool(reading.status.is_on())),
                    _ => Err(EvalError::Name(ident.to_string())),
                }
            }
            None => {
                if self.known_keys.iter().any(|k| k == ident) {
                    Ok(Value::Bool(true))
                } else {
                    Err(EvalError::Name(ident.to_string()))
                }
            }
        }
    }
}

/// Facade-backed bindings for live evaluation.
///
/// The caller holds the locks of every device in the slice for the
/// whole evaluation; reads go straight to hardware.
pub struct LiveBindings<'a> {
    pub devices: &'a [&'a dyn hvsc_hal::HvDevice],
}

impl Bindings for LiveBindings<'_> {
    fn resolve(&self, ident: &str) -> Result<Value, EvalError> {
        let (key, attr) = match ident.split_once('.') {
            Some((key, attr)) => (key, Some(attr)),
            None => (ident, None),
        };
        for dev in self.devices {
            let Some(ch) = dev.channel_by_key(key) else {
                continue;
            };
            let Some(attr) = attr else {
                return Ok(Value::Bool(true));
            };
            return match ch.attribute(attr) {
                Ok(Some(hvsc_hal::AttrValue::Num(n))) => Ok(Value::Num(n)),
                Ok(Some(hvsc_hal::AttrValue::Bool(b))) => Ok(Value::Bool(b)),
                Ok(None) => Err(EvalError::Name(ident.to_string())),
                Err(e) => Err(EvalError::Read(e.to_string())),
            };
        }
        Err(EvalError::Name(ident.to_string()))
    }
}
