//! CARVE Core
//!
//! The protocol half of the firmware: G-code parsing and interpretation,
//! the motion-control entry points, the cooperative protocol loop with its
//! realtime executor, the `$` system interface, and the serial transport
//! contract.
//!
//! ## Control Flow
//!
//! Data flows linearly: serial bytes → line assembler → parser → planner →
//! segment ring → step interrupt. Control flows asynchronously: realtime
//! command bytes are extracted on the receive side and surface as flag
//! bits that the protocol loop dispatches between line reads and at every
//! motion checkpoint.

#![deny(clippy::disallowed_types)]

pub mod config;
pub mod gcode;
pub mod machine;
pub mod motion;
pub mod protocol;
pub mod report;
pub mod serial;
pub mod system;
