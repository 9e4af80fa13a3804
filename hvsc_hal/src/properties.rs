//! Explicit property-descriptor registry.
//!
//! Each driver supplies an explicit descriptor table for its settable
//! fields; the core validates values against the descriptor before
//! the write reaches hardware.

/// Value domain of one settable property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    /// Free numeric value within an inclusive range.
    Float { min: f64, max: f64 },
    /// One of a fixed set of tokens (e.g. `RAMP`/`KILL`).
    Choice(Vec<String>),
    /// Free-form text.
    Text,
}

/// A value submitted for a property write.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
}

/// One settable property of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDescriptor {
    /// Property name as accepted by the driver (e.g. `rup`, `pdwn`).
    pub name: String,
    /// Allowed-value domain.
    pub kind: PropertyKind,
    /// Human-readable description.
    pub description: String,
}

impl PropertyDescriptor {
    pub fn float(name: &str, min: f64, max: f64, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyKind::Float { min, max },
            description: description.to_string(),
        }
    }

    pub fn choice(name: &str, values: &[&str], description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyKind::Choice(values.iter().map(|s| s.to_string()).collect()),
            description: description.to_string(),
        }
    }

    /// Whether `value` lies inside this descriptor's domain.
    pub fn accepts(&self, value: &PropertyValue) -> bool {
        match (&self.kind, value) {
            (PropertyKind::Float { min, max }, PropertyValue::Number(n)) => {
                n.is_finite() && *n >= *min && *n <= *max
            }
            (PropertyKind::Choice(values), PropertyValue::Text(t)) => {
                values.iter().any(|v| v == t)
            }
            (PropertyKind::Text, PropertyValue::Text(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_range() {
        let d = PropertyDescriptor::float("rup", 1.0, 500.0, "Ramp-up rate [V/s]");
        assert!(d.accepts(&PropertyValue::Number(50.0)));
        assert!(d.accepts(&PropertyValue::Number(1.0)));
        assert!(!d.accepts(&PropertyValue::Number(0.5)));
        assert!(!d.accepts(&PropertyValue::Number(f64::NAN)));
        assert!(!d.accepts(&PropertyValue::Text("50".into())));
    }

    #[test]
    fn choice_set() {
        let d = PropertyDescriptor::choice("pdwn", &["RAMP", "KILL"], "Power-down mode");
        assert!(d.accepts(&PropertyValue::Text("RAMP".into())));
        assert!(d.accepts(&PropertyValue::Text("KILL".into())));
        assert!(!d.accepts(&PropertyValue::Text("ramp".into())));
        assert!(!d.accepts(&PropertyValue::Number(1.0)));
    }
}
