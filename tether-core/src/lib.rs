//! Tether core data types
//!
//! This crate provides basic data type definitions used by other Tether crates.
//! Tether users should not depend on this crate directly. Use the `tether::core`
//! reexport instead.
#![no_std]

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidValue;

/// Queue insertion priority of a bus operation
///
/// The type has explicit numeric encoding to facilitate look-up table implementation.
/// Lower numeric values order first, thus the ordering is reversed: Background > Urgent.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Priority {
    /// Reserved for traffic that preempts everything else, e.g., a fault-recovery
    /// register write that must reach the device before any queued work.
    Urgent = 0,
    /// Latency-sensitive operations. Scheduled ahead of nominal traffic but unable
    /// to starve an urgent operation.
    High = 1,
    /// The default for all submitted work. FIFO order holds within this level, so a
    /// queue fed only at this priority behaves as a plain FIFO.
    Nominal = 2,
    /// Diagnostic or opportunistic traffic. May be deferred indefinitely while
    /// higher levels are occupied.
    Background = 3,
}

impl Priority {
    pub const MIN: Priority = Priority::Urgent;
    pub const MAX: Priority = Priority::Background;

    pub const fn try_from_u8(code: u8) -> Option<Priority> {
        if code <= Self::MAX.into_u8() {
            Some(Priority::from_u8_truncating(code))
        } else {
            None
        }
    }

    pub const fn from_u8_truncating(code: u8) -> Priority {
        match code & 0x3 {
            0 => Priority::Urgent,
            1 => Priority::High,
            2 => Priority::Nominal,
            3 => Priority::Background,
            _ => unreachable!(),
        }
    }

    pub const fn into_u8(self) -> u8 {
        self as u8
    }

    pub const fn next(self) -> Option<Self> {
        Self::try_from_u8(self.into_u8() + 1)
    }

    pub const fn prev(self) -> Option<Self> {
        if let Some(code) = self.into_u8().checked_sub(1) {
            Some(Self::from_u8_truncating(code))
        } else {
            None
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Nominal
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.into_u8()
    }
}

impl From<Priority> for usize {
    fn from(value: Priority) -> Self {
        u8::from(value).into()
    }
}

impl TryFrom<u8> for Priority {
    type Error = InvalidValue;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::try_from_u8(value).ok_or(InvalidValue)
    }
}

/// A set of priority values
///
/// Note that higher priority has a lower numerical value and is ordered first.
/// Methods are named according to numerical priority values, e.g.,
/// `new_ge(Priority::Nominal)` returns a set containing `Nominal` and `Background`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PrioritySet(u8);

impl PrioritySet {
    const MASK: u8 = (1u8 << (Priority::MAX.into_u8() + 1)) - 1;

    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(Self::MASK);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }

    pub const fn into_bits(self) -> u8 {
        self.0
    }

    pub const fn complement(self) -> Self {
        Self(!self.0 & Self::MASK)
    }

    pub const fn new_eq(priority: Priority) -> Self {
        Self(1u8 << priority.into_u8())
    }

    pub const fn new_ge(priority: Priority) -> Self {
        Self((Self::MASK << priority.into_u8()) & Self::MASK)
    }

    pub const fn new_le(priority: Priority) -> Self {
        Self(Self::MASK >> (Priority::MAX.into_u8() - priority.into_u8()))
    }

    pub const fn new_gt(priority: Priority) -> Self {
        Self::new_le(priority).complement()
    }

    pub const fn new_lt(priority: Priority) -> Self {
        Self::new_ge(priority).complement()
    }

    pub const fn contains(&self, priority: Priority) -> bool {
        (self.0 >> priority.into_u8()) & 0x1 != 0
    }

    pub const fn insert(&mut self, priority: Priority) {
        self.0 |= Self::new_eq(priority).0
    }

    pub const fn remove(&mut self, priority: Priority) {
        self.0 &= Self::new_eq(priority).complement().0
    }

    pub const fn first(&self) -> Option<Priority> {
        Priority::try_from_u8(self.0.trailing_zeros() as u8)
    }

    pub const fn last(&self) -> Option<Priority> {
        let n = u8::BITS - self.0.leading_zeros();
        Priority::try_from_u8((n as u8).wrapping_sub(1))
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == Self::NONE.0
    }
}

impl Default for PrioritySet {
    fn default() -> Self {
        PrioritySet::NONE
    }
}

impl core::ops::Not for PrioritySet {
    type Output = Self;
    fn not(self) -> Self::Output {
        self.complement()
    }
}

impl core::ops::BitAnd<PrioritySet> for PrioritySet {
    type Output = Self;
    fn bitand(self, rhs: PrioritySet) -> Self::Output {
        PrioritySet(self.0 & rhs.0)
    }
}

impl core::ops::BitAndAssign<PrioritySet> for PrioritySet {
    fn bitand_assign(&mut self, rhs: PrioritySet) {
        self.0 &= rhs.0
    }
}

impl core::ops::BitOr<PrioritySet> for PrioritySet {
    type Output = Self;
    fn bitor(self, rhs: PrioritySet) -> Self::Output {
        PrioritySet(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign<PrioritySet> for PrioritySet {
    fn bitor_assign(&mut self, rhs: PrioritySet) {
        self.0 |= rhs.0;
    }
}

impl core::iter::IntoIterator for PrioritySet {
    type Item = Priority;
    type IntoIter = PrioritySetIterator;
    fn into_iter(self) -> Self::IntoIter {
        PrioritySetIterator { residual: self }
    }
}

pub struct PrioritySetIterator {
    residual: PrioritySet,
}

impl core::iter::Iterator for PrioritySetIterator {
    type Item = Priority;
    fn next(&mut self) -> Option<Self::Item> {
        let first = self.residual.first();
        if let Some(priority) = first {
            self.residual.remove(priority);
        }
        first
    }
}

/// Direction and shape of a bus operation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum OpCode {
    Undef = 0,
    /// Read from the device into the operation buffer.
    Rx = 1,
    /// Write the operation buffer to the device.
    Tx = 2,
    /// Write, then keep bus control and read the response into the same buffer.
    TxWaitRx = 3,
    /// Write a command phase only (e.g., a register address).
    TxCmd = 4,
    /// Write a command phase, then read the response.
    TxCmdWaitRx = 5,
}

impl OpCode {
    pub const fn try_from_u8(code: u8) -> Option<OpCode> {
        match code {
            0 => Some(OpCode::Undef),
            1 => Some(OpCode::Rx),
            2 => Some(OpCode::Tx),
            3 => Some(OpCode::TxWaitRx),
            4 => Some(OpCode::TxCmd),
            5 => Some(OpCode::TxCmdWaitRx),
            _ => None,
        }
    }

    pub const fn into_u8(self) -> u8 {
        self as u8
    }

    /// True for shapes that move data from the device to the host.
    pub const fn expects_rx(self) -> bool {
        matches!(self, OpCode::Rx | OpCode::TxWaitRx | OpCode::TxCmdWaitRx)
    }

    /// True for shapes that move data from the host to the device.
    pub const fn expects_tx(self) -> bool {
        matches!(
            self,
            OpCode::Tx | OpCode::TxWaitRx | OpCode::TxCmd | OpCode::TxCmdWaitRx
        )
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        value.into_u8()
    }
}

impl TryFrom<u8> for OpCode {
    type Error = InvalidValue;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::try_from_u8(value).ok_or(InvalidValue)
    }
}

/// Lifecycle state of a bus operation
///
/// States are ordered. Within one lifecycle the state only moves forward;
/// the single sanctioned regression is a requeue back to `Idle`.
/// `Addr`, `TxWait`, `RxWait`, and `Stop` are normally driven from the
/// driver's interrupt flow; the queue engine only observes them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum OpState {
    Undef = 0,
    /// Constructed, not yet submitted.
    Idle = 1,
    /// Accepted into a work queue.
    Queued = 2,
    /// Handed to the driver; bus arbitration in progress.
    Initiate = 3,
    /// Addressing phase on the wire.
    Addr = 4,
    /// Data moving host-to-device.
    TxWait = 5,
    /// Data moving device-to-host.
    RxWait = 6,
    /// Stop/teardown phase on the wire.
    Stop = 7,
    /// Finished without fault. Terminal.
    Complete = 8,
    /// Finished with a fault attached. Terminal.
    Fault = 9,
}

impl OpState {
    pub const fn into_u8(self) -> u8 {
        self as u8
    }

    /// Terminal states must not be advanced further; the operation is either
    /// reclaimed or recycled.
    pub const fn is_terminal(self) -> bool {
        self.into_u8() >= OpState::Complete.into_u8()
    }

    /// States in which the driver holds the bus for this operation.
    pub const fn is_on_bus(self) -> bool {
        self.into_u8() >= OpState::Initiate.into_u8() && !self.is_terminal()
    }
}

impl From<OpState> for u8 {
    fn from(value: OpState) -> Self {
        value.into_u8()
    }
}

/// Fault taxonomy for bus operations
///
/// The absence of a fault is expressed as `Option::<XferFault>::None`.
/// A fault is data attached to the operation and surfaced exactly once via
/// the completion callback; it never unwinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum XferFault {
    /// Faulted with no recorded cause.
    NoReason,
    Timeout,
    BadParam,
    IllegalState,
    /// The bus was held by another transfer. Retry on a later poll.
    BusBusy,
    BusFault,
    DevFault,
    HungIrq,
    DmaFault,
    /// Probe result: nothing answered at the address. Not necessarily fatal.
    DevNotFound,
    RoRegister,
    UndefdRegister,
    /// The requester withdrew the operation before it reached the bus.
    IoRecall,
    /// Administrative cancellation: the operation was purged from a queue.
    QueueFlush,
}

impl XferFault {
    /// Faults that indicate a transient bus condition rather than a hard
    /// failure. The engine re-queues these instead of terminating.
    pub const fn is_retryable(self) -> bool {
        matches!(self, XferFault::BusBusy | XferFault::Timeout)
    }
}

/// Completion callback return code
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CbVerdict {
    /// Done with the operation; reclaim it.
    Nominal,
    /// Done, but the handler considers the result an error. Reclaimed after
    /// the engine logs a faulted result.
    Error,
    /// Reset the operation to `Idle` and resubmit it to the work queue.
    Recycle,
}

/// Identity of a device registered with an adapter
///
/// Used to route completion callbacks and to purge queued work when a device
/// detaches from the bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceTag(u8);

impl DeviceTag {
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn into_u8(self) -> u8 {
        self.0
    }
}

impl From<DeviceTag> for u8 {
    fn from(value: DeviceTag) -> Self {
        value.into_u8()
    }
}

impl From<DeviceTag> for usize {
    fn from(value: DeviceTag) -> Self {
        u8::from(value).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_set() {
        let mut set = PrioritySet::NONE;
        set.insert(Priority::High);
        set.insert(Priority::Background);

        assert_eq!(set.first(), Some(Priority::High));
        assert_eq!(set.last(), Some(Priority::Background));
    }

    #[test]
    fn test_priority_set_ge() {
        let set = PrioritySet::new_ge(Priority::Background);
        assert!(!set.contains(Priority::Nominal));
        assert!(set.contains(Priority::Background));

        let set = PrioritySet::new_ge(Priority::Urgent);
        assert_eq!(set, PrioritySet::ALL);
    }

    #[test]
    fn test_priority_set_le() {
        let set = PrioritySet::new_le(Priority::Background);
        assert_eq!(set, PrioritySet::ALL);

        let set = PrioritySet::new_le(Priority::Urgent);
        assert!(set.contains(Priority::Urgent));
        assert!(!set.contains(Priority::High));
    }

    #[test]
    fn test_priority_set_complement() {
        let set = PrioritySet::new_gt(Priority::Background);
        assert_eq!(set, PrioritySet::NONE);

        let set = PrioritySet::new_lt(Priority::Urgent);
        assert_eq!(set, PrioritySet::NONE);

        let set = !PrioritySet::new_eq(Priority::Urgent);
        assert_eq!(set.first(), Some(Priority::High));
        assert_eq!(set.last(), Some(Priority::Background));
    }

    #[test]
    fn test_op_state_order() {
        assert!(OpState::Idle < OpState::Queued);
        assert!(OpState::Queued < OpState::Initiate);
        assert!(OpState::Stop < OpState::Complete);
        assert!(OpState::Complete.is_terminal());
        assert!(OpState::Fault.is_terminal());
        assert!(!OpState::Stop.is_terminal());
        assert!(OpState::TxWait.is_on_bus());
        assert!(!OpState::Queued.is_on_bus());
    }

    #[test]
    fn test_opcode_direction() {
        assert!(OpCode::Rx.expects_rx());
        assert!(!OpCode::Rx.expects_tx());
        assert!(OpCode::TxWaitRx.expects_rx());
        assert!(OpCode::TxWaitRx.expects_tx());
        assert!(!OpCode::TxCmd.expects_rx());
    }
}
