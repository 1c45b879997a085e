use std::cell::RefCell;
use std::rc::Rc;

use embassy_time::MockDriver;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tether::link::{Link, LinkConfig, LinkEvent, LinkSink, LinkState};
use tether::msg::{Message, MsgCode, SYNC_PATTERN};
use tether::time::Duration;

#[derive(Clone, Default)]
struct WireTap(Rc<RefCell<Vec<u8>>>);

impl WireTap {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

impl LinkSink for WireTap {
    fn provide_buffer(&mut self, bytes: &[u8]) -> usize {
        self.0.borrow_mut().extend_from_slice(bytes);
        bytes.len()
    }
}

fn pump(link: &mut Link, ticks: u32) {
    let time = MockDriver::get();
    for _ in 0..ticks {
        link.poll();
        time.advance(Duration::from_millis(5));
    }
}

fn establish(link: &mut Link) {
    pump(link, 8);
    assert_eq!(link.state(), LinkState::SyncCasting);

    let mut wire = Vec::new();
    wire.extend_from_slice(&SYNC_PATTERN);
    wire.extend_from_slice(&SYNC_PATTERN);
    Message::outbound(MsgCode::Application, b"up".to_vec(), 0, false, false)
        .unwrap()
        .serialize(&mut wire);
    link.provide_buffer(&wire).unwrap();

    pump(link, 10);
    assert_eq!(link.state(), LinkState::Established);
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack
        .windows(needle.len())
        .filter(|window| *window == needle)
        .count()
}

#[test]
fn test_resend_policy_and_resync_recovery() {
    let config = LinkConfig {
        // Big enough that no keepalive churn muddies the accounting.
        keepalive_interval: Duration::from_secs(10),
        ack_timeout: Duration::from_millis(60),
        max_resends: 2,
        fsm_lockout: Duration::from_millis(5),
        ..Default::default()
    };
    let mut link = Link::new(config, SmallRng::seed_from_u64(99));

    let tap = WireTap::default();
    link.set_output(tap.clone());

    let failures: Rc<RefCell<Vec<u32>>> = Default::default();
    let failures_in_cb = failures.clone();
    link.set_callback(move |_tag, event| {
        if let LinkEvent::SendFailed { msg_id, .. } = event {
            failures_in_cb.borrow_mut().push(msg_id);
        }
    });

    establish(&mut link);
    assert_eq!(link.counters().sync_losses, 0);

    // An expecting-reply message that never gets its ack: sent once, re-sent
    // twice, then dropped with a failure surfaced to the application.
    tap.take();
    let msg_id = link
        .send(MsgCode::Application, b"ping".to_vec(), true)
        .unwrap();
    assert_ne!(msg_id, 0);

    pump(&mut link, 45);
    assert_eq!(count_occurrences(&tap.take(), b"ping"), 3);
    assert_eq!(link.counters().ack_failures, 1);
    assert_eq!(*failures.borrow(), vec![msg_id]);
    assert_eq!(link.state(), LinkState::Established);

    // A burst of garbage crosses the parse-failure threshold and splices the
    // sync-recovery route in, exactly once.
    link.provide_buffer(&[0xff; 5]).unwrap();
    link.provide_buffer(&[0xff; 5]).unwrap();
    assert_eq!(link.counters().sync_losses, 1);
    let route = link.route();
    assert_eq!(
        route[..3],
        [
            LinkState::SyncBegin,
            LinkState::SyncCasting,
            LinkState::SyncTentative,
        ]
    );
    // The planned destination survived the splice.
    assert_eq!(*route.last().unwrap(), LinkState::Established);

    // The recovery route runs and the stream heals.
    pump(&mut link, 6);
    assert!(matches!(
        link.state(),
        LinkState::SyncBegin | LinkState::SyncCasting
    ));

    let mut wire = Vec::new();
    wire.extend_from_slice(&SYNC_PATTERN);
    wire.extend_from_slice(&SYNC_PATTERN);
    Message::outbound(MsgCode::Application, b"back".to_vec(), 0, false, false)
        .unwrap()
        .serialize(&mut wire);
    link.provide_buffer(&wire).unwrap();
    pump(&mut link, 10);
    assert_eq!(link.state(), LinkState::Established);
    assert_eq!(link.counters().sync_losses, 1);

    // A bare sync run mid-session means the peer fell out of alignment; the
    // link heads back into recovery on its own.
    let mut wire = Vec::new();
    wire.extend_from_slice(&SYNC_PATTERN);
    wire.extend_from_slice(&SYNC_PATTERN);
    link.provide_buffer(&wire).unwrap();
    assert_eq!(link.counters().sync_losses, 2);
    assert_eq!(
        link.route()[..3],
        [
            LinkState::SyncBegin,
            LinkState::SyncCasting,
            LinkState::SyncTentative,
        ]
    );
}
