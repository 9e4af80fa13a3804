//! HVSC Hardware Abstraction Layer
//!
//! Defines the contract every high-voltage power-supply driver must
//! satisfy to be controlled safely, and a simulation driver for
//! development and tests.
//!
//! - [`device`] - `HvChannel`/`HvDevice` traits and `HalError`
//! - [`properties`] - explicit per-channel property descriptors
//! - [`sim`] - software-emulated device

pub mod device;
pub mod properties;
pub mod sim;

pub use device::{AlarmStatus, AttrValue, HalError, HvChannel, HvDevice, CHANNEL_ATTRIBUTES};
pub use properties::{PropertyDescriptor, PropertyKind, PropertyValue};
pub use sim::{FaultInjector, SimDevice};
