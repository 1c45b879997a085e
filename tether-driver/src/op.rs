//! Bus operation object

use alloc::vec::Vec;

use tether_core::{DeviceTag, OpCode, OpState, Priority, XferFault};

/// Payload storage of an operation, tagged with who disposes of it.
///
/// `CallerOwned` marks a buffer the submitter wants back: the completion
/// handler may retrieve it with [`BusOp::take_buffer`] before the operation
/// is reclaimed. `AdapterOwned` buffers are dropped at reclaim.
#[derive(Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpBuffer {
    #[default]
    None,
    CallerOwned(Vec<u8>),
    AdapterOwned(Vec<u8>),
}

impl OpBuffer {
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            OpBuffer::None => &[],
            OpBuffer::CallerOwned(buf) | OpBuffer::AdapterOwned(buf) => buf,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            OpBuffer::None => &mut [],
            OpBuffer::CallerOwned(buf) | OpBuffer::AdapterOwned(buf) => buf,
        }
    }
}

/// A single atomic unit of bus work
///
/// The state field is monotonically non-decreasing within one lifecycle.
/// [`BusOp::set_state`] enforces this; the single sanctioned regression is
/// [`BusOp::mark_for_requeue`], which resets the operation to `Idle` for
/// resubmission. Once a terminal state is reached the operation must not be
/// advanced further.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusOp {
    opcode: OpCode,
    priority: Priority,
    state: OpState,
    fault: Option<XferFault>,
    owner: Option<DeviceTag>,
    buffer: OpBuffer,
    persistent: bool,
}

impl BusOp {
    pub fn new(opcode: OpCode) -> Self {
        Self {
            opcode,
            priority: Priority::Nominal,
            state: OpState::Idle,
            fault: None,
            owner: None,
            buffer: OpBuffer::None,
            persistent: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, owner: DeviceTag) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Attaches a buffer the submitter wants returned through the completion
    /// callback.
    pub fn with_caller_buffer(mut self, buf: Vec<u8>) -> Self {
        self.buffer = OpBuffer::CallerOwned(buf);
        self
    }

    /// Attaches a buffer the adapter disposes of at reclaim.
    pub fn with_adapter_buffer(mut self, buf: Vec<u8>) -> Self {
        self.buffer = OpBuffer::AdapterOwned(buf);
        self
    }

    /// Marks the operation as surviving reclaim: instead of being freed it is
    /// reset to `Idle` in place, and its handle stays valid for resubmission.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> OpState {
        self.state
    }

    pub fn fault(&self) -> Option<XferFault> {
        self.fault
    }

    pub fn has_fault(&self) -> bool {
        self.fault.is_some()
    }

    pub fn owner(&self) -> Option<DeviceTag> {
        self.owner
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn buffer(&self) -> &OpBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut OpBuffer {
        &mut self.buffer
    }

    /// Retrieves a caller-owned buffer, leaving `OpBuffer::None` behind.
    ///
    /// Returns `None` for adapter-owned storage; that buffer is dropped at
    /// reclaim and is not the handler's to take.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        match &self.buffer {
            OpBuffer::CallerOwned(_) => match core::mem::take(&mut self.buffer) {
                OpBuffer::CallerOwned(buf) => Some(buf),
                _ => unreachable!(),
            },
            _ => None,
        }
    }

    /// Advances the lifecycle state.
    ///
    /// The state order is monotonic: a regression, or any movement out of a
    /// terminal state, is refused with `IllegalState`. Setting the current
    /// state again is a no-op.
    pub fn set_state(&mut self, next: OpState) -> Result<(), XferFault> {
        if next < self.state || (self.state.is_terminal() && next != self.state) {
            return Err(XferFault::IllegalState);
        }
        self.state = next;
        Ok(())
    }

    /// Records a fault without touching the lifecycle state. The first
    /// recorded fault wins. Used by per-tick servicing, where fault detection
    /// and termination are separate events.
    pub fn note_fault(&mut self, fault: XferFault) {
        if self.fault.is_none() {
            self.fault = Some(fault);
        }
    }

    /// Records a fault and parks the operation in the terminal `Fault` state.
    /// The first recorded fault wins.
    pub fn abort(&mut self, fault: XferFault) {
        if self.fault.is_none() {
            self.fault = Some(fault);
        }
        self.state = OpState::Fault;
    }

    /// The single sanctioned state regression: back to `Idle`, fault cleared,
    /// ready for resubmission. Buffer and identity are retained.
    pub fn mark_for_requeue(&mut self) {
        self.state = OpState::Idle;
        self.fault = None;
    }

    /// Full reset to the freshly-constructed blank. Used when a pool slot is
    /// returned to the free list.
    pub fn wipe(&mut self) {
        *self = BusOp {
            opcode: OpCode::Undef,
            priority: Priority::Nominal,
            state: OpState::Idle,
            fault: None,
            owner: None,
            buffer: OpBuffer::None,
            persistent: false,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_state_monotonic() {
        let mut op = BusOp::new(OpCode::Tx);
        assert_eq!(op.state(), OpState::Idle);
        assert!(op.set_state(OpState::Queued).is_ok());
        assert!(op.set_state(OpState::TxWait).is_ok());

        // Regression is refused.
        assert_eq!(
            op.set_state(OpState::Queued),
            Err(XferFault::IllegalState)
        );
        assert_eq!(op.state(), OpState::TxWait);

        assert!(op.set_state(OpState::Complete).is_ok());
        assert_eq!(op.set_state(OpState::Fault), Err(XferFault::IllegalState));
    }

    #[test]
    fn test_requeue_resets() {
        let mut op = BusOp::new(OpCode::Rx);
        unwrap!(op.set_state(OpState::Queued));
        op.abort(XferFault::DevNotFound);
        assert!(op.state().is_terminal());

        op.mark_for_requeue();
        assert_eq!(op.state(), OpState::Idle);
        assert_eq!(op.fault(), None);
    }

    #[test]
    fn test_first_fault_wins() {
        let mut op = BusOp::new(OpCode::Tx);
        op.abort(XferFault::BusFault);
        op.abort(XferFault::QueueFlush);
        assert_eq!(op.fault(), Some(XferFault::BusFault));
    }

    #[test]
    fn test_buffer_ownership() {
        let mut op = BusOp::new(OpCode::Tx).with_caller_buffer(vec![1, 2, 3]);
        assert_eq!(op.buffer().as_slice(), &[1, 2, 3]);
        assert_eq!(op.take_buffer(), Some(vec![1, 2, 3]));
        assert!(op.take_buffer().is_none());

        let mut op = BusOp::new(OpCode::Tx).with_adapter_buffer(vec![4, 5]);
        assert!(op.take_buffer().is_none());
        assert_eq!(op.buffer().len(), 2);
    }
}
