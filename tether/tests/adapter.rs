use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use tether::adapter::{AdapterConfig, BusAdapter, JobInbox, SubmitError};
use tether::bus::{BusDriver, BusHandler};
use tether::core::{CbVerdict, OpCode, OpState, XferFault};
use tether::op::BusOp;

/// Driver that completes operations after a scripted number of advance
/// calls, optionally refusing the first few begins with a busy bus.
#[derive(Default)]
struct ScriptedDriver {
    busy_begins: u8,
    advances_to_complete: u8,
    advances_seen: u8,
    begun: u32,
}

impl BusDriver for ScriptedDriver {
    fn begin(&mut self, op: &mut BusOp) -> Result<(), XferFault> {
        if self.busy_begins > 0 {
            self.busy_begins -= 1;
            return Err(XferFault::BusBusy);
        }
        self.begun += 1;
        self.advances_seen = 0;
        if self.advances_to_complete == 0 {
            op.set_state(OpState::Complete)?;
        } else {
            op.set_state(OpState::TxWait)?;
        }
        Ok(())
    }

    fn advance(&mut self, op: &mut BusOp) -> Result<(), XferFault> {
        self.advances_seen += 1;
        if self.advances_seen >= self.advances_to_complete {
            op.set_state(OpState::Complete)?;
        }
        Ok(())
    }
}

type EventLog = Rc<RefCell<Vec<(OpState, Option<XferFault>)>>>;

/// Handler that records every completion and replays scripted verdicts.
struct Recorder {
    log: EventLog,
    verdicts: RefCell<VecDeque<CbVerdict>>,
}

impl Recorder {
    fn new(log: EventLog, verdicts: impl IntoIterator<Item = CbVerdict>) -> Self {
        Self {
            log,
            verdicts: RefCell::new(verdicts.into_iter().collect()),
        }
    }
}

impl BusHandler for Recorder {
    fn op_callback(&mut self, op: &mut BusOp) -> CbVerdict {
        self.log.borrow_mut().push((op.state(), op.fault()));
        self.verdicts
            .borrow_mut()
            .pop_front()
            .unwrap_or(CbVerdict::Nominal)
    }
}

fn flood_config() -> AdapterConfig {
    AdapterConfig {
        pool_capacity: 24,
        max_q_depth: Some(12),
        cb_per_event: 3,
    }
}

#[test]
fn test_queue_guard_flood() {
    let log: EventLog = Default::default();
    let mut adapter = BusAdapter::new(ScriptedDriver::default(), flood_config());
    let dev = adapter.attach(Recorder::new(log.clone(), []));

    let mut accepted = 0;
    let mut rejected = 0;
    for _ in 0..20 {
        let handle = adapter.new_op(BusOp::new(OpCode::Tx).with_owner(dev));
        match adapter.queue_io_job(handle) {
            Ok(()) => accepted += 1,
            Err(SubmitError::QueueFull) => rejected += 1,
            Err(err) => panic!("unexpected admission error: {:?}", err),
        }
    }
    assert_eq!(accepted, 12);
    assert_eq!(rejected, 8);
    assert_eq!(adapter.counters().queue_floods, 8);

    // Drain everything.
    for _ in 0..100 {
        adapter.poll();
    }

    let log = log.borrow();
    assert_eq!(log.len(), 20);
    let flushed = log
        .iter()
        .filter(|(_, fault)| *fault == Some(XferFault::QueueFlush))
        .count();
    assert_eq!(flushed, 8);

    let counters = adapter.counters();
    assert_eq!(counters.total_xfers, 20);
    assert_eq!(counters.failed_xfers, 8);
    assert_eq!(adapter.work_depth(), 0);
    assert_eq!(adapter.callback_depth(), 0);
}

#[test]
fn test_callback_bound_per_service() {
    let log: EventLog = Default::default();
    let mut adapter = BusAdapter::new(
        ScriptedDriver::default(),
        AdapterConfig {
            pool_capacity: 8,
            max_q_depth: None,
            cb_per_event: 3,
        },
    );
    let dev = adapter.attach(Recorder::new(log.clone(), []));

    for _ in 0..7 {
        let handle = adapter.new_op(BusOp::new(OpCode::Tx).with_owner(dev));
        adapter.queue_io_job(handle).unwrap();
    }

    // Run admissions only; completions pile up in the callback queue.
    for _ in 0..7 {
        adapter.advance_work_queue();
    }
    assert_eq!(adapter.callback_depth(), 7);

    assert_eq!(adapter.service_callback_queue(), 3);
    assert_eq!(adapter.service_callback_queue(), 3);
    assert_eq!(adapter.service_callback_queue(), 1);
    assert_eq!(adapter.service_callback_queue(), 0);
    assert_eq!(log.borrow().len(), 7);
}

#[test]
fn test_recycle_reuses_the_same_operation() {
    let log: EventLog = Default::default();
    let mut adapter = BusAdapter::new(ScriptedDriver::default(), AdapterConfig::default());
    // Two recycles, then done: three trips down the wire, one op.
    let dev = adapter.attach(Recorder::new(
        log.clone(),
        [CbVerdict::Recycle, CbVerdict::Recycle, CbVerdict::Nominal],
    ));

    let handle = adapter.new_op(BusOp::new(OpCode::TxCmd).with_owner(dev));
    adapter.queue_io_job(handle).unwrap();

    for _ in 0..20 {
        adapter.poll();
    }

    assert_eq!(log.borrow().len(), 3);
    assert_eq!(adapter.driver().begun, 3);
    assert_eq!(adapter.counters().total_xfers, 1);
    assert!(adapter.op(handle).is_none());
}

#[test]
fn test_bus_busy_is_retried_not_failed() {
    let log: EventLog = Default::default();
    let driver = ScriptedDriver {
        busy_begins: 2,
        ..Default::default()
    };
    let mut adapter = BusAdapter::new(driver, AdapterConfig::default());
    let dev = adapter.attach(Recorder::new(log.clone(), []));

    let handle = adapter.new_op(BusOp::new(OpCode::Rx).with_owner(dev));
    adapter.queue_io_job(handle).unwrap();

    for _ in 0..10 {
        adapter.poll();
    }

    assert_eq!(adapter.driver().begun, 1);
    let log = log.borrow();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0], (OpState::Complete, None));
    assert_eq!(adapter.counters().failed_xfers, 0);
}

#[test]
fn test_multi_step_lifecycle() {
    let log: EventLog = Default::default();
    let driver = ScriptedDriver {
        advances_to_complete: 3,
        ..Default::default()
    };
    let mut adapter = BusAdapter::new(driver, AdapterConfig::default());
    let dev = adapter.attach(Recorder::new(log.clone(), []));

    let handle = adapter.new_op(BusOp::new(OpCode::TxWaitRx).with_owner(dev));
    adapter.queue_io_job(handle).unwrap();

    // begin + three advances + completion handoff, one step per poll.
    for _ in 0..6 {
        adapter.poll();
    }
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(adapter.driver().advances_seen, 3);
}

#[test]
fn test_callahead_withdraws_the_job() {
    struct Withdrawer(EventLog);
    impl BusHandler for Withdrawer {
        fn op_callahead(&mut self, _op: &BusOp) -> bool {
            false
        }
        fn op_callback(&mut self, op: &mut BusOp) -> CbVerdict {
            self.0.borrow_mut().push((op.state(), op.fault()));
            CbVerdict::Nominal
        }
    }

    let log: EventLog = Default::default();
    let mut adapter = BusAdapter::new(ScriptedDriver::default(), AdapterConfig::default());
    let dev = adapter.attach(Withdrawer(log.clone()));

    let handle = adapter.new_op(BusOp::new(OpCode::Tx).with_owner(dev));
    adapter.queue_io_job(handle).unwrap();
    for _ in 0..4 {
        adapter.poll();
    }

    let log = log.borrow();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].1, Some(XferFault::IoRecall));
    assert_eq!(adapter.driver().begun, 0);
}

#[test]
fn test_purge_by_device_spares_the_rest() {
    let log_a: EventLog = Default::default();
    let log_b: EventLog = Default::default();
    let mut adapter = BusAdapter::new(ScriptedDriver::default(), AdapterConfig::default());
    let dev_a = adapter.attach(Recorder::new(log_a.clone(), []));
    let dev_b = adapter.attach(Recorder::new(log_b.clone(), []));

    for _ in 0..3 {
        let handle = adapter.new_op(BusOp::new(OpCode::Tx).with_owner(dev_a));
        adapter.queue_io_job(handle).unwrap();
        let handle = adapter.new_op(BusOp::new(OpCode::Tx).with_owner(dev_b));
        adapter.queue_io_job(handle).unwrap();
    }

    adapter.purge_queued_work_by_dev(dev_a);

    // Device A saw three flushes, synchronously.
    {
        let log_a = log_a.borrow();
        assert_eq!(log_a.len(), 3);
        assert!(log_a
            .iter()
            .all(|(_, fault)| *fault == Some(XferFault::QueueFlush)));
    }
    assert_eq!(adapter.work_depth(), 3);

    for _ in 0..20 {
        adapter.poll();
    }
    let log_b = log_b.borrow();
    assert_eq!(log_b.len(), 3);
    assert!(log_b.iter().all(|(_, fault)| fault.is_none()));
}

#[test]
fn test_purge_queued_work_spares_current() {
    let log: EventLog = Default::default();
    let driver = ScriptedDriver {
        advances_to_complete: 5,
        ..Default::default()
    };
    let mut adapter = BusAdapter::new(driver, AdapterConfig::default());
    let dev = adapter.attach(Recorder::new(log.clone(), []));

    for _ in 0..3 {
        let handle = adapter.new_op(BusOp::new(OpCode::Tx).with_owner(dev));
        adapter.queue_io_job(handle).unwrap();
    }

    // First op is mid-flight; the other two still queued.
    adapter.poll();
    assert!(adapter.current_job().is_some());
    adapter.purge_queued_work();
    assert_eq!(adapter.work_depth(), 0);
    assert!(adapter.current_job().is_some());

    for _ in 0..10 {
        adapter.poll();
    }
    let log = log.borrow();
    assert_eq!(log.len(), 3);
    let flushed = log
        .iter()
        .filter(|(_, fault)| *fault == Some(XferFault::QueueFlush))
        .count();
    assert_eq!(flushed, 2);
}

#[test]
fn test_inbox_handoff_preserves_order() {
    static INBOX: JobInbox<CriticalSectionRawMutex, 4> = JobInbox::new();

    let driver = ScriptedDriver {
        advances_to_complete: 1,
        ..Default::default()
    };
    let mut adapter = BusAdapter::new(driver, AdapterConfig::default());

    INBOX
        .submit(BusOp::new(OpCode::Tx).with_adapter_buffer(vec![1]))
        .unwrap();
    INBOX
        .submit(BusOp::new(OpCode::Tx).with_adapter_buffer(vec![2]))
        .unwrap();

    assert_eq!(adapter.drain_inbox(&INBOX), 2);
    assert!(INBOX.is_empty());
    assert_eq!(adapter.work_depth(), 2);

    // Submission order survives the handoff.
    adapter.advance_work_queue();
    let current = adapter.current_job().expect("first op should be in flight");
    assert_eq!(adapter.op(current).unwrap().buffer().as_slice(), &[1]);
}

#[test]
fn test_persistent_op_survives_reclaim() {
    let log: EventLog = Default::default();
    let mut adapter = BusAdapter::new(ScriptedDriver::default(), AdapterConfig::default());
    let dev = adapter.attach(Recorder::new(log.clone(), []));

    let handle = adapter.new_op(BusOp::new(OpCode::Rx).with_owner(dev).persistent());
    adapter.queue_io_job(handle).unwrap();
    for _ in 0..5 {
        adapter.poll();
    }

    // Reclaimed in place: the handle is still live and idle.
    let op = adapter.op(handle).expect("persistent op was freed");
    assert_eq!(op.state(), OpState::Idle);

    adapter.queue_io_job(handle).unwrap();
    for _ in 0..5 {
        adapter.poll();
    }
    assert_eq!(log.borrow().len(), 2);
    assert_eq!(adapter.driver().begun, 2);
}
