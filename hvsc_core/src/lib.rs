//! HVSC slow-control core.
//!
//! Coordination layer for a multi-device high-voltage rig:
//! - `executor` - per-device command serializer and periodic poller
//! - `check` - named boolean safety conditions over channel state
//! - `rig` - device registry, manual control paths, live check loop
//! - `ramp` - stepped multi-channel voltage ramp protocol
//! - `recovery` - trip detection and automatic recovery supervisor
//! - `history` - drift-threshold channel history log
//! - `alert` - operator notification port
//!
//! Hardware access goes through the `hvsc_hal` facade traits; every
//! mutating operation is funnelled through the owning device's
//! serializer so commands never interleave on the wire.

pub mod alert;
pub mod check;
pub mod executor;
pub mod history;
pub mod ramp;
pub mod recovery;
pub mod rig;

pub use hvsc_common::error::CoreError;
