//! Capabilities connecting the queue engine, the platform driver, and devices

use tether_core::{CbVerdict, XferFault};

use crate::op::BusOp;

/// Platform bus driver contract
///
/// The engine owns the operation queues; the driver owns the wire. The engine
/// calls [`begin`](BusDriver::begin) with an admitted operation once the bus
/// is free of earlier work. From that point the driver is responsible for
/// moving `op.state` forward (`Initiate`, `Addr`, `TxWait`/`RxWait`, `Stop`)
/// until it parks the operation at `Complete`, or at `Fault` via
/// [`BusOp::abort`].
///
/// Hardware progress may come from an interrupt flow. An ISR should record
/// progress in driver-internal state and return; the state is applied to the
/// operation on the next engine poll, either inside `begin`'s successor
/// states or inside [`advance`](BusDriver::advance).
///
/// None of these calls may block.
pub trait BusDriver {
    /// Starts an admitted operation on the hardware.
    ///
    /// Outcomes:
    /// * `Ok(())` — the driver took the operation and will progress it.
    /// * `Err(BusBusy)` — the wire is held; the engine re-queues the
    ///   operation and retries on a later poll. Not a failure.
    /// * any other `Err` — terminal; the engine aborts the operation with the
    ///   returned fault and routes it to completion.
    fn begin(&mut self, op: &mut BusOp) -> Result<(), XferFault>;

    /// Per-tick servicing of the in-flight operation.
    ///
    /// Called once per engine poll while the operation is on the wire, but
    /// only when [`needs_advance`](BusDriver::needs_advance) reports true.
    /// A fault returned here is attached to the operation without terminating
    /// it; termination is driven by the driver parking the state at
    /// `Complete` or `Fault`.
    fn advance(&mut self, op: &mut BusOp) -> Result<(), XferFault>;

    /// Whether the platform requires [`advance`](BusDriver::advance) calls
    /// while an operation is on the wire. `advance` is also where progress
    /// recorded by an interrupt flow gets applied to the operation, so only
    /// drivers that finish their work synchronously inside `begin` should
    /// return false.
    fn needs_advance(&self) -> bool {
        true
    }
}

/// Completion callback capability, implemented by device collaborators
///
/// The engine invokes these from its poll context, never from an interrupt.
/// A finished operation is surfaced exactly once through
/// [`op_callback`](BusHandler::op_callback); the verdict decides its fate.
pub trait BusHandler {
    /// Runs just before an operation is handed to the driver. Returning
    /// `false` withdraws it; the engine aborts the operation with `IoRecall`
    /// and routes it to completion.
    fn op_callahead(&mut self, _op: &BusOp) -> bool {
        true
    }

    /// Runs once the operation reaches a terminal state (or is purged).
    ///
    /// `Recycle` resets the operation to `Idle` and resubmits it — the
    /// engine guarantees state-machine advancement finished before this call,
    /// so re-arming the same operation here does not race the lifecycle.
    fn op_callback(&mut self, op: &mut BusOp) -> CbVerdict;
}
