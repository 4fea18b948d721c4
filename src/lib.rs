//! Library form of vmdrive: orchestrates QEMU/KVM guests over VDE-emulated
//! LANs and runs a compiled test script against them.

/// CLI argument parsing and the validated [`DriverConfig`].
pub mod config;
/// Boot order, the [`TestEnv`] script-binding surface, and cleanup.
pub mod driver;
/// Translates printable characters into QEMU `sendkey` tokens.
pub mod key_map;
/// Structured XML event log merging driver and guest-serial output.
pub mod logger;
/// Owns one guest's lifecycle: monitor/shell framing, verbs, OCR.
pub mod machine;
/// VDE switches, one per VLAN.
pub mod network;
/// Bounded-attempt polling predicate.
pub mod retry;

pub use crate::config::{Args, DriverConfig};
pub use crate::driver::{Driver, TestEnv};
pub use crate::logger::Logger;
pub use crate::machine::{Machine, MachineArgs};
pub use crate::network::Vlan;
