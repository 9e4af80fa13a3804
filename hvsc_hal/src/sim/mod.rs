//! Simulation driver.
//!
//! Software-emulated high-voltage device for development and testing
//! without physical hardware: channels slew toward their setpoints at
//! a configurable rate, trips and interlocks can be injected, and
//! communication failures can be forced to exercise error paths.

mod device;

pub use device::{FaultInjector, SimChannel, SimDevice, SimFault};
