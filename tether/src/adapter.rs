//! Bus adapter: operation admission, lifecycle advancement, reclaim
//!
//! The adapter owns the pool, the work queue, the callback queue, and a
//! single current-operation slot. `poll()` makes bounded forward progress —
//! at most one lifecycle step for the current operation plus a capped
//! callback drain — and is meant to be called repeatedly from a super-loop
//! or timer tick.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Deque;

use crate::bus::{BusDriver, BusHandler};
use crate::core::{CbVerdict, DeviceTag, OpState, XferFault};
use crate::op::BusOp;
use crate::pool::{Disposal, OpHandle, OpPool, PoolError};
use crate::queue::{OpQueue, QueueError};

/// Admission failure codes for [`BusAdapter::queue_io_job`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubmitError {
    /// The handle does not refer to a live operation.
    StaleHandle,
    /// Only `Idle` operations may be submitted.
    NotIdle,
    /// The operation is already in a queue or on the bus.
    AlreadyQueued,
    /// The depth guard refused the job. The operation was aborted with
    /// `QueueFlush` and routed to its completion callback.
    QueueFull,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdapterConfig {
    /// Preallocated operation count.
    pub pool_capacity: usize,
    /// Work-queue depth guard. `None` lets the queue grow on the heap.
    pub max_q_depth: Option<usize>,
    /// Completion callbacks serviced per poll.
    pub cb_per_event: u8,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 8,
            max_q_depth: None,
            cb_per_event: 3,
        }
    }
}

/// Diagnostic counters, snapshot form
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdapterCounters {
    pub total_xfers: u32,
    pub failed_xfers: u32,
    pub queue_floods: u32,
    pub prealloc_misses: u32,
    pub heap_frees: u32,
}

/// Owner of the operation queues and their memory
///
/// Generic over the platform driver the way the work advances; device
/// collaborators register a [`BusHandler`] and get a [`DeviceTag`] used for
/// callback routing and selective purges.
pub struct BusAdapter<D: BusDriver> {
    driver: D,
    pool: OpPool,
    work: OpQueue,
    completed: OpQueue,
    current: Option<OpHandle>,
    handlers: Vec<Option<Box<dyn BusHandler>>>,
    cb_per_event: u8,
    total_xfers: u32,
    failed_xfers: u32,
    queue_floods: u32,
}

impl<D: BusDriver> BusAdapter<D> {
    pub fn new(driver: D, config: AdapterConfig) -> Self {
        Self {
            driver,
            pool: OpPool::new(config.pool_capacity),
            work: OpQueue::new(config.max_q_depth),
            completed: OpQueue::new(None),
            current: None,
            handlers: Vec::new(),
            cb_per_event: config.cb_per_event,
            total_xfers: 0,
            failed_xfers: 0,
            queue_floods: 0,
        }
    }

    /// Registers a device collaborator and returns its routing tag.
    pub fn attach(&mut self, handler: impl BusHandler + 'static) -> DeviceTag {
        let boxed: Box<dyn BusHandler> = Box::new(handler);
        for (i, slot) in self.handlers.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(boxed);
                return DeviceTag::new(unwrap!(u8::try_from(i)));
            }
        }
        let tag = DeviceTag::new(unwrap!(u8::try_from(self.handlers.len())));
        self.handlers.push(Some(boxed));
        tag
    }

    /// Unregisters a device, first purging its queued work so no stale
    /// callback can reach a detached collaborator.
    pub fn detach(&mut self, tag: DeviceTag) {
        self.purge_queued_work_by_dev(tag);
        if let Some(slot) = self.handlers.get_mut(usize::from(tag)) {
            *slot = None;
        }
    }

    /// Stores an operation in the pool. The returned handle is what the rest
    /// of the API speaks.
    pub fn new_op(&mut self, op: BusOp) -> OpHandle {
        self.pool.alloc(op)
    }

    pub fn op(&self, handle: OpHandle) -> Option<&BusOp> {
        self.pool.get(handle)
    }

    pub fn op_mut(&mut self, handle: OpHandle) -> Option<&mut BusOp> {
        self.pool.get_mut(handle)
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn counters(&self) -> AdapterCounters {
        AdapterCounters {
            total_xfers: self.total_xfers,
            failed_xfers: self.failed_xfers,
            queue_floods: self.queue_floods,
            prealloc_misses: self.pool.prealloc_misses(),
            heap_frees: self.pool.heap_frees(),
        }
    }

    pub fn work_depth(&self) -> usize {
        self.work.len()
    }

    pub fn callback_depth(&self) -> usize {
        self.completed.len()
    }

    pub fn current_job(&self) -> Option<OpHandle> {
        self.current
    }

    /// Admits an `Idle` operation into the work queue.
    pub fn queue_io_job(&mut self, handle: OpHandle) -> Result<(), SubmitError> {
        let op = self.pool.get(handle).ok_or(SubmitError::StaleHandle)?;
        if op.state() != OpState::Idle {
            return Err(SubmitError::NotIdle);
        }
        if self.current == Some(handle) || self.completed.contains(handle) {
            return Err(SubmitError::AlreadyQueued);
        }

        let priority = op.priority();
        match self.work.push(priority, handle) {
            Ok(()) => {
                unwrap!(unwrap!(self.pool.get_mut(handle)).set_state(OpState::Queued).ok());
                Ok(())
            }
            Err(QueueError::AlreadyQueued) => Err(SubmitError::AlreadyQueued),
            Err(QueueError::Full) => {
                self.queue_floods = self.queue_floods.saturating_add(1);
                unwrap!(self.pool.get_mut(handle)).abort(XferFault::QueueFlush);
                unwrap!(self.completed.push(priority, handle).ok());
                Err(SubmitError::QueueFull)
            }
        }
    }

    /// One cooperative tick: a single lifecycle step for the current
    /// operation, then a bounded callback drain. Returns the number of
    /// operations begun or retired.
    pub fn poll(&mut self) -> u8 {
        let mut progressed = self.advance_work_queue();
        progressed += self.service_callback_queue();
        progressed
    }

    /// Advances exactly one operation by one step. Exposed separately from
    /// [`poll`](BusAdapter::poll) so a caller can split admission work from
    /// callback servicing across ticks.
    pub fn advance_work_queue(&mut self) -> u8 {
        if self.current.is_none() {
            self.current = self.work.pop();
        }
        let handle = match self.current {
            Some(handle) => handle,
            None => return 0,
        };

        let op = match self.pool.get_mut(handle) {
            Some(op) => op,
            None => {
                // A handle in the current slot always refers to a live op;
                // recover rather than wedge the adapter.
                error!("current slot held a stale handle");
                self.current = None;
                return 0;
            }
        };

        match op.state() {
            OpState::Idle | OpState::Queued => {
                if !self.run_callahead(handle) {
                    unwrap!(self.pool.get_mut(handle)).abort(XferFault::IoRecall);
                    self.route_to_completion(handle);
                    return 1;
                }
                let op = unwrap!(self.pool.get_mut(handle));
                match self.driver.begin(op) {
                    Ok(()) => {
                        if op.state() < OpState::Initiate {
                            unwrap!(op.set_state(OpState::Initiate).ok());
                        }
                        if op.state().is_terminal() {
                            self.route_to_completion(handle);
                        }
                        1
                    }
                    Err(XferFault::BusBusy) => {
                        // Not a failure: the wire is held. Surrender the
                        // current slot and retry at the head of the queue.
                        self.current = None;
                        unwrap!(self.work.push_front(op.priority(), handle).ok());
                        0
                    }
                    Err(fault) => {
                        op.abort(fault);
                        self.route_to_completion(handle);
                        1
                    }
                }
            }
            OpState::Initiate | OpState::Addr | OpState::TxWait | OpState::RxWait
            | OpState::Stop => {
                if self.driver.needs_advance() {
                    if let Err(fault) = self.driver.advance(op) {
                        op.note_fault(fault);
                    }
                }
                let op = unwrap!(self.pool.get(handle));
                if op.state().is_terminal() {
                    self.route_to_completion(handle);
                    1
                } else {
                    0
                }
            }
            OpState::Complete | OpState::Fault => {
                self.route_to_completion(handle);
                1
            }
            OpState::Undef => {
                unwrap!(self.pool.get_mut(handle)).abort(XferFault::IllegalState);
                self.route_to_completion(handle);
                1
            }
        }
    }

    /// Drains at most `cb_per_event` finished operations, invoking their
    /// callbacks and reclaiming them. The bound caps worst-case work per
    /// tick so a flood of completions cannot monopolize the caller's loop.
    pub fn service_callback_queue(&mut self) -> u8 {
        let mut serviced = 0;
        while serviced < self.cb_per_event {
            let handle = match self.completed.pop() {
                Some(handle) => handle,
                None => break,
            };
            self.finish_op(handle);
            serviced += 1;
        }
        serviced
    }

    /// Aborts and reclaims only the in-flight operation.
    pub fn purge_current_job(&mut self) {
        if let Some(handle) = self.current.take() {
            unwrap!(self.pool.get_mut(handle)).abort(XferFault::QueueFlush);
            self.finish_op(handle);
        }
    }

    /// Drains the entire work queue, aborting and reclaiming every entry.
    /// The current job is left untouched.
    pub fn purge_queued_work(&mut self) {
        for handle in self.work.take_all() {
            unwrap!(self.pool.get_mut(handle)).abort(XferFault::QueueFlush);
            self.finish_op(handle);
        }
    }

    /// Removes, aborts, and reclaims only the queued work owned by `tag`.
    /// Used when a device detaches and must not receive stale callbacks.
    pub fn purge_queued_work_by_dev(&mut self, tag: DeviceTag) {
        let pool = &self.pool;
        let owned = self
            .work
            .extract(|handle| pool.get(handle).is_some_and(|op| op.owner() == Some(tag)));
        for handle in owned {
            unwrap!(self.pool.get_mut(handle)).abort(XferFault::QueueFlush);
            self.finish_op(handle);
        }
    }

    /// Moves ops submitted from another context into the work queue.
    /// Returns the number of jobs admitted.
    pub fn drain_inbox<M: RawMutex, const N: usize>(&mut self, inbox: &JobInbox<M, N>) -> u8 {
        let mut admitted = 0;
        while let Some(op) = inbox.take() {
            let handle = self.new_op(op);
            if self.queue_io_job(handle).is_ok() {
                admitted += 1;
            }
        }
        admitted
    }

    fn run_callahead(&mut self, handle: OpHandle) -> bool {
        let op = unwrap!(self.pool.get(handle));
        let tag = match op.owner() {
            Some(tag) => tag,
            None => return true,
        };
        match self.handlers.get_mut(usize::from(tag)).and_then(Option::as_mut) {
            Some(handler) => handler.op_callahead(op),
            None => true,
        }
    }

    fn route_to_completion(&mut self, handle: OpHandle) {
        if self.current == Some(handle) {
            self.current = None;
        }
        let priority = unwrap!(self.pool.get(handle)).priority();
        unwrap!(self.completed.push(priority, handle).ok());
    }

    /// Invokes the completion callback and interprets its verdict, then
    /// funnels the operation through the reclaim chokepoint. Every finished
    /// or purged operation passes through here; no path bypasses reclaim.
    fn finish_op(&mut self, handle: OpHandle) {
        let verdict = {
            let (pool, handlers) = (&mut self.pool, &mut self.handlers);
            let op = unwrap!(pool.get_mut(handle));
            match op
                .owner()
                .and_then(|tag| handlers.get_mut(usize::from(tag)))
                .and_then(Option::as_mut)
            {
                Some(handler) => handler.op_callback(op),
                None => CbVerdict::Nominal,
            }
        };

        match verdict {
            CbVerdict::Recycle => {
                let op = unwrap!(self.pool.get_mut(handle));
                op.mark_for_requeue();
                if let Err(err) = self.queue_io_job(handle) {
                    warn!("recycled op refused: {:?}", err);
                    if err != SubmitError::QueueFull {
                        self.reclaim_op(handle);
                    }
                }
            }
            CbVerdict::Error => {
                let op = unwrap!(self.pool.get(handle));
                if let Some(fault) = op.fault() {
                    warn!("op finished with fault: {:?}", fault);
                }
                self.reclaim_op(handle);
            }
            CbVerdict::Nominal => {
                self.reclaim_op(handle);
            }
        }
    }

    /// The reclaim chokepoint: transfer accounting, then disposal.
    fn reclaim_op(&mut self, handle: OpHandle) {
        let faulted = match self.pool.get(handle) {
            Some(op) => op.has_fault(),
            None => {
                error!("reclaim of a stale handle");
                return;
            }
        };

        self.total_xfers = self.total_xfers.saturating_add(1);
        if faulted {
            self.failed_xfers = self.failed_xfers.saturating_add(1);
        }

        match self.pool.release(handle) {
            Ok(Disposal::Pooled) | Ok(Disposal::HeapFreed) | Ok(Disposal::Retained) => {}
            Err(PoolError::StaleHandle) => error!("pool refused reclaim: stale handle"),
        }
    }
}

/// Bounded cross-context submission handoff
///
/// The one sanctioned path for feeding an adapter from outside its poll
/// context (an interrupt-equivalent context or another thread). Critical
/// sections are limited to a single queue push or pop.
pub struct JobInbox<M: RawMutex, const N: usize> {
    jobs: Mutex<M, RefCell<Deque<BusOp, N>>>,
}

impl<M: RawMutex, const N: usize> JobInbox<M, N> {
    pub const fn new() -> Self {
        Self {
            jobs: Mutex::new(RefCell::new(Deque::new())),
        }
    }

    /// Submits an operation for later admission. On a full inbox the
    /// operation is handed back to the caller.
    pub fn submit(&self, op: BusOp) -> Result<(), BusOp> {
        self.jobs.lock(|cell| cell.borrow_mut().push_back(op))
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock(|cell| cell.borrow().is_empty())
    }

    fn take(&self) -> Option<BusOp> {
        self.jobs.lock(|cell| cell.borrow_mut().pop_front())
    }
}

impl<M: RawMutex, const N: usize> Default for JobInbox<M, N> {
    fn default() -> Self {
        Self::new()
    }
}
