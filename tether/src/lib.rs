//! # Tether
//!
//! This library provides a bus-operation queue engine and a point-to-point
//! link protocol for message exchange between embedded devices. It targets
//! cooperative, poll-driven environments: every entry point makes bounded
//! forward progress and returns promptly, so the stack can be serviced from a
//! super-loop or a timer tick without blocking.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────┐   queue_io_job    ┌─────────────────────────────┐
//!  │ Devices ├──────────────────►│          BusAdapter         │
//!  │(handlers)│◄─────────────────┤ ┌───────┐ ┌──────┐ ┌──────┐ │
//!  └─────────┘    op_callback    │ │ OpPool│ │ Work │ │ Cb   │ │
//!                                │ └───────┘ │ queue│ │ queue│ │
//!  ┌─────────┐  begin / advance  │           └──────┘ └──────┘ │
//!  │ Platform│◄──────────────────┤        current slot         │
//!  │  driver │                   └─────────────────────────────┘
//!  └─────────┘
//!
//!  ┌─────────┐  provide_buffer   ┌─────────────────────────────┐
//!  │Transport├──────────────────►│            Link             │
//!  │         │◄──────────────────┤  session FSM · sync codec   │
//!  └─────────┘    LinkOutput     │  msg framing · accumulation │
//!                                └─────────────────────────────┘
//! ```
//!
//! Components:
//! * _OpPool_ preallocates operations and reclaims them through a single
//!   chokepoint, falling back to the heap only when the pool is exhausted.
//! * _BusAdapter_ owns the pool and two priority queues. Its `poll()` draws
//!   one operation at a time from the work queue, drives it through the
//!   platform driver, and drains a bounded number of completion callbacks.
//! * _Link_ is an independent session state machine over a raw byte stream:
//!   it discovers byte alignment through a fixed sync pattern, frames
//!   messages with a variable-width header, and self-heals from
//!   desynchronization by splicing a resync route into its planned states.
//!
//! ## Concurrency model
//!
//! The stack is single-threaded by design. Interrupt-level work stays inside
//! the platform driver; the adapter and link only ever run in the poll
//! context. The one sanctioned crossing is [`adapter::JobInbox`], a bounded
//! handoff guarded by a blocking mutex with critical sections limited to a
//! queue push or drain.
//!
//! ## Memory model
//!
//! All steady-state traffic runs out of the preallocated pool. Exhaustion
//! spills to the heap and is counted, not failed: the miss counters exist so
//! a deployment can size its pool, not so the engine can degrade.

#![no_std]

extern crate alloc;

pub use tether_core as core;
pub use tether_driver::{bus, op, time};

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod adapter;
pub mod link;
pub mod msg;
pub mod pool;
pub mod queue;
