//! Tether driver interface
//!
//! The crate provides an interface between a platform bus driver (I2C, SPI,
//! UART register pushing) and the Tether queue engine. Limited scope
//! facilitates compatibility across versions. Driver crates should depend on
//! this crate. Tether stack users should depend on the `tether` crate instead.
//!
//! The contract is built around [`op::BusOp`], a single atomic unit of bus
//! work, and two capabilities:
//! * [`bus::BusDriver`] is implemented by the platform driver. The engine
//!   hands it operations through `begin()` and, when the driver asks for
//!   per-tick servicing, `advance()`. The driver moves the operation through
//!   its wire states and parks it at `Complete` or `Fault`.
//! * [`bus::BusHandler`] is implemented by device collaborators (sensor
//!   drivers, register maps). The engine routes finished operations back
//!   through it, and its verdict decides between reclaim and recycle.
//!
//! Interrupt-level work belongs inside the `BusDriver` implementation: an ISR
//! should flag hardware progress and return, leaving queue bookkeeping to the
//! engine's poll context. A driver may expect `begin()` to be called from that
//! poll context only.
//!
//! Drivers must not block. An operation that cannot start because the bus is
//! held by an earlier transfer is refused with `XferFault::BusBusy`, which the
//! engine treats as "retry on a later poll" rather than a failure.

#![no_std]

extern crate alloc;

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod bus;
pub mod op;

pub mod time {
    pub use embassy_time::{Duration, Instant};
}
