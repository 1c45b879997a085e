//! Point-to-point link session state machine
//!
//! A `Link` rides on a raw byte-stream transport that may deliver partial,
//! coalesced, or misaligned data. It discovers byte alignment through the
//! fixed sync pattern, frames messages with the wire header, and runs a
//! session FSM whose forward path is a planned route of states consumed one
//! at a time.
//!
//! The route is the self-healing mechanism: when the stream desynchronizes
//! (sync pattern observed mid-session, or repeated header-parse failures),
//! the sync-recovery states are spliced in ahead of whatever was planned
//! next, so an in-progress hangup still completes after the stream heals.

use alloc::boxed::Box;
use alloc::vec::Vec;

use heapless::Deque;
use rand_core::RngCore;

use crate::core::InvalidValue;
use crate::msg::{
    contains_sync_pattern, cull_sync_data, Message, MsgCode, MsgHeader, ParseOutcome,
    MAX_HEADER_LEN, SYNC_PATTERN,
};
use crate::time::{Duration, Instant};

/// Depth of the planned-route queue. Deep enough for a full setup route with
/// the sync-recovery triple spliced in front.
pub const FSM_WAYPOINT_DEPTH: usize = 8;

/// Session states, mostly forward-only
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Uninit,
    /// Buffers and queues reset, fresh session tag minted.
    PendingSetup,
    /// Sync flags and inbound buffer cleared.
    SyncBegin,
    /// Emitting sync packets until the peer casts back.
    SyncCasting,
    /// Alignment believed good; waiting for non-sync data to confirm.
    SyncTentative,
    PendingAuth,
    /// The stable attractor. Left only when a new route is pushed.
    Established,
    /// Hangup sent; waiting for the peer to acknowledge.
    PendingHangup,
    /// Session over. Resets and loops back to `PendingSetup`.
    Hungup,
    /// Error-recovery parking state. Left only by an explicit `reset`.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError {
    /// The link is not in a state that can accept this request.
    NotReady,
    /// The message would exceed the MTU.
    TooBig,
    /// The message cannot be encoded.
    Unencodable,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkConfig {
    /// Largest acceptable total message length, header included.
    pub mtu: u32,
    /// Idle interval between keepalives, and between sync casts.
    pub keepalive_interval: Duration,
    /// How long an expecting-reply message may wait before churn acts on it.
    pub ack_timeout: Duration,
    /// Resends of an un-acked message before it is dropped.
    pub max_resends: u8,
    /// Debounce window after each state transition.
    pub fsm_lockout: Duration,
    /// Include the auth exchange in the setup route.
    pub requires_auth: bool,
    /// Consecutive header-parse failures that force resync.
    pub max_parse_failures: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mtu: 1024,
            keepalive_interval: Duration::from_millis(500),
            ack_timeout: Duration::from_millis(1000),
            max_resends: 2,
            fsm_lockout: Duration::from_millis(10),
            requires_auth: false,
            max_parse_failures: 3,
        }
    }
}

/// Transport capability: accepts outbound wire bytes.
pub trait LinkSink {
    /// Claims some prefix of `bytes`. Unclaimed bytes are retried on a later
    /// poll, so a congested transport exerts backpressure instead of losing
    /// data.
    fn provide_buffer(&mut self, bytes: &[u8]) -> usize;
}

/// What the link reports to the application
#[derive(Debug)]
pub enum LinkEvent {
    /// A complete inbound message, delivered once the session is established.
    Message(Message),
    /// An expecting-reply message exhausted its resends without an ack.
    SendFailed { msg_id: u32, code: MsgCode },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkCounters {
    pub msgs_sent: u32,
    pub msgs_received: u32,
    pub parse_failures: u32,
    pub ack_failures: u32,
    pub sync_losses: u32,
}

struct OutboundEntry {
    msg: Message,
    sent_at: Option<Instant>,
    resends: u8,
}

type Callback = Box<dyn FnMut(u32, LinkEvent)>;

fn elapsed(now: Instant, since: Instant) -> Duration {
    Duration::from_ticks(now.as_ticks().saturating_sub(since.as_ticks()))
}

/// Point-to-point session endpoint over a byte-stream transport
pub struct Link {
    config: LinkConfig,
    state: LinkState,
    prior_state: LinkState,
    waypoints: Deque<LinkState, FSM_WAYPOINT_DEPTH>,
    lockout_until: Option<Instant>,
    session_tag: u32,
    rng: Box<dyn RngCore>,

    inbound_buf: Vec<u8>,
    working: Option<Message>,
    inbound_ready: Vec<Message>,
    outbound: Vec<OutboundEntry>,
    outbound_wire: Vec<u8>,

    sink: Option<Box<dyn LinkSink>>,
    callback: Option<Callback>,

    casting_sync: bool,
    nonsync_seen: bool,
    auth_ok: bool,
    last_cast: Option<Instant>,
    last_tx: Option<Instant>,
    next_msg_id: u32,

    consecutive_parse_failures: u8,
    counters: LinkCounters,
}

impl Link {
    pub fn new(config: LinkConfig, rng: impl RngCore + 'static) -> Self {
        let mut link = Self {
            config,
            state: LinkState::Uninit,
            prior_state: LinkState::Uninit,
            waypoints: Deque::new(),
            lockout_until: None,
            session_tag: 0,
            rng: Box::new(rng),
            inbound_buf: Vec::new(),
            working: None,
            inbound_ready: Vec::new(),
            outbound: Vec::new(),
            outbound_wire: Vec::new(),
            sink: None,
            callback: None,
            casting_sync: false,
            nonsync_seen: false,
            auth_ok: false,
            last_cast: None,
            last_tx: None,
            next_msg_id: 0,
            consecutive_parse_failures: 0,
            counters: LinkCounters::default(),
        };
        link.plan_setup_route();
        link
    }

    pub fn set_output(&mut self, sink: impl LinkSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    pub fn set_callback(&mut self, callback: impl FnMut(u32, LinkEvent) + 'static) {
        self.callback = Some(Box::new(callback));
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn prior_state(&self) -> LinkState {
        self.prior_state
    }

    pub fn is_established(&self) -> bool {
        self.state == LinkState::Established
    }

    /// Correlation id of the current session. Zero until setup has run.
    pub fn session_tag(&self) -> u32 {
        self.session_tag
    }

    pub fn counters(&self) -> LinkCounters {
        self.counters
    }

    /// Planned future states, nearest first.
    pub fn route(&self) -> Vec<LinkState> {
        self.waypoints.iter().copied().collect()
    }

    /// Accepts inbound transport bytes. The whole buffer is claimed unless
    /// the link is parked in a state that cannot consume data.
    pub fn provide_buffer(&mut self, bytes: &[u8]) -> Result<usize, LinkError> {
        if matches!(self.state, LinkState::Disconnected) {
            return Err(LinkError::NotReady);
        }

        self.inbound_buf.extend_from_slice(bytes);

        // A stream this far out of frame is garbage; treat it as one big
        // parse failure rather than hoarding it.
        let cap = self.config.mtu as usize * 2;
        if self.inbound_buf.len() > cap {
            self.inbound_buf.clear();
            self.note_parse_failure();
        }

        self.process_inbound();
        Ok(bytes.len())
    }

    /// One cooperative tick: advance the FSM, run state upkeep, churn the
    /// outbound queue, deliver pending messages, flush wire bytes. Returns a
    /// count of visible progress (state changes plus messages moved).
    pub fn poll(&mut self) -> u8 {
        let now = Instant::now();
        let mut progress = 0;

        if self.poll_fsm(now) {
            progress += 1;
        }

        match self.state {
            LinkState::SyncCasting => {
                if self.casting_sync && self.cast_due(now) {
                    self.emit_sync(now);
                }
            }
            LinkState::SyncTentative | LinkState::Established => {
                // Keepalives double as the "non-sync data" that lets a
                // tentative peer confirm its alignment.
                if self.keepalive_due(now) && !self.has_pending(MsgCode::KeepAlive) {
                    let msg_id = self.take_msg_id();
                    let _ = self.queue_internal(MsgCode::KeepAlive, Vec::new(), true, msg_id);
                }
            }
            _ => {}
        }

        self.process_inbound();
        progress += self.churn_outbound(now);
        progress += self.dispatch_ready();
        self.flush_wire();
        progress
    }

    /// Queues an application message. Returns its correlation id (zero when
    /// no reply is expected).
    pub fn send(
        &mut self,
        code: MsgCode,
        payload: Vec<u8>,
        expects_reply: bool,
    ) -> Result<u32, LinkError> {
        match self.state {
            LinkState::Disconnected | LinkState::Hungup => return Err(LinkError::NotReady),
            _ => {}
        }
        if payload.len() + MAX_HEADER_LEN > self.config.mtu as usize {
            return Err(LinkError::TooBig);
        }

        let msg_id = if expects_reply { self.take_msg_id() } else { 0 };
        self.queue_internal(code, payload, expects_reply, msg_id)?;
        Ok(msg_id)
    }

    /// Ends the session. Graceful hangup routes through `PendingHangup` and
    /// waits for the peer's acknowledgment; abrupt hangup drops straight to
    /// `Hungup`.
    pub fn hangup(&mut self, graceful: bool) {
        self.waypoints.clear();
        if graceful && self.state == LinkState::Established {
            unwrap!(self.waypoints.push_back(LinkState::PendingHangup).ok());
        }
        unwrap!(self.waypoints.push_back(LinkState::Hungup).ok());
    }

    /// Parks the link in `Disconnected`. Only `reset` leaves it.
    pub fn disconnect(&mut self) {
        self.waypoints.clear();
        unwrap!(self.waypoints.push_back(LinkState::Disconnected).ok());
    }

    /// Plans a fresh setup route from whatever state the link is in.
    pub fn reset(&mut self) {
        self.plan_setup_route();
    }

    // ---- FSM machinery ----

    fn plan_setup_route(&mut self) {
        self.waypoints.clear();
        unwrap!(self.waypoints.push_back(LinkState::PendingSetup).ok());
        unwrap!(self.waypoints.push_back(LinkState::SyncBegin).ok());
        unwrap!(self.waypoints.push_back(LinkState::SyncCasting).ok());
        unwrap!(self.waypoints.push_back(LinkState::SyncTentative).ok());
        if self.config.requires_auth {
            unwrap!(self.waypoints.push_back(LinkState::PendingAuth).ok());
        }
        unwrap!(self.waypoints.push_back(LinkState::Established).ok());
    }

    /// Splices the sync-recovery triple ahead of the planned route. The
    /// consecutive-failure counter resets here, so a failure burst inserts
    /// the route exactly once.
    fn fsm_insert_sync_states(&mut self) {
        // Already recovering, or not yet past setup; do not stack routes.
        if matches!(
            self.state,
            LinkState::SyncBegin
                | LinkState::SyncCasting
                | LinkState::SyncTentative
                | LinkState::Uninit
                | LinkState::PendingSetup
                | LinkState::Hungup
                | LinkState::Disconnected
        ) {
            self.consecutive_parse_failures = 0;
            return;
        }

        // From the stable state the route is empty; keep the destination.
        if self.waypoints.is_empty() && self.state == LinkState::Established {
            unwrap!(self.waypoints.push_back(LinkState::Established).ok());
        }

        for state in [
            LinkState::SyncTentative,
            LinkState::SyncCasting,
            LinkState::SyncBegin,
        ] {
            if self.waypoints.push_front(state).is_err() {
                // Route overflow: the farthest plans lose to recovery.
                let _ = self.waypoints.pop_back();
                unwrap!(self.waypoints.push_front(state).ok());
            }
        }

        self.counters.sync_losses += 1;
        self.consecutive_parse_failures = 0;
    }

    fn fsm_is_waiting(&self, now: Instant) -> bool {
        self.lockout_until.is_some_and(|deadline| now < deadline)
    }

    /// Consumes at most the head of the route per call.
    fn poll_fsm(&mut self, now: Instant) -> bool {
        if self.fsm_is_waiting(now) {
            return false;
        }
        if self.waypoints.is_empty() || !self.exit_condition_met() {
            return false;
        }
        let next = unwrap!(self.waypoints.pop_front());

        match self.enter_state(next, now) {
            Ok(()) => {
                self.prior_state = self.state;
                self.state = next;
                self.lockout_until = Some(now + self.config.fsm_lockout);
                debug!("link fsm: {:?} -> {:?}", self.prior_state, self.state);
                true
            }
            Err(_) => {
                // Entry refused: restore the route head, hold position,
                // stay locked out for a beat.
                unwrap!(self.waypoints.push_front(next).ok());
                self.lockout_until = Some(now + self.config.fsm_lockout);
                false
            }
        }
    }

    fn exit_condition_met(&self) -> bool {
        match self.state {
            LinkState::Uninit | LinkState::PendingSetup | LinkState::SyncBegin => true,
            LinkState::SyncCasting => !self.casting_sync,
            LinkState::SyncTentative => self.nonsync_seen,
            LinkState::PendingAuth => self.auth_ok,
            LinkState::Established => true,
            LinkState::PendingHangup => !self.has_pending(MsgCode::Hangup),
            LinkState::Hungup => true,
            LinkState::Disconnected => false,
        }
    }

    fn enter_state(&mut self, next: LinkState, now: Instant) -> Result<(), InvalidValue> {
        match next {
            LinkState::Uninit => {}
            LinkState::PendingSetup => {
                self.session_reset();
                self.mint_session_tag();
            }
            LinkState::Hungup => {
                // Hold the teardown until the farewell bytes are out: a
                // queued hangup reply lost to the reset would leave the peer
                // resending into a dead session.
                if !self.outbound_wire.is_empty()
                    || self
                        .outbound
                        .iter()
                        .any(|e| e.sent_at.is_none() && e.msg.header().is_reply)
                {
                    return Err(InvalidValue);
                }
                self.session_reset();
                self.mint_session_tag();
                // A finished session loops back to listening for the next.
                self.plan_setup_route();
            }
            LinkState::SyncBegin => {
                self.casting_sync = false;
                self.nonsync_seen = false;
                self.inbound_buf.clear();
                self.working = None;
            }
            LinkState::SyncCasting => {
                self.casting_sync = true;
                self.emit_sync(now);
            }
            LinkState::SyncTentative => {
                self.nonsync_seen = false;
            }
            LinkState::PendingAuth => {
                self.auth_ok = false;
                let msg_id = self.take_msg_id();
                self.queue_internal(MsgCode::AuthChallenge, Vec::new(), true, msg_id)
                    .map_err(|_| InvalidValue)?;
            }
            LinkState::Established => {}
            LinkState::PendingHangup => {
                let msg_id = self.take_msg_id();
                self.queue_internal(MsgCode::Hangup, Vec::new(), true, msg_id)
                    .map_err(|_| InvalidValue)?;
            }
            LinkState::Disconnected => {
                self.session_reset();
            }
        }
        Ok(())
    }

    /// The full reset shared by `PendingSetup`, `Hungup`, and `Disconnected`.
    fn session_reset(&mut self) {
        self.inbound_buf.clear();
        self.working = None;
        self.inbound_ready.clear();
        self.outbound.clear();
        self.outbound_wire.clear();
        self.casting_sync = false;
        self.nonsync_seen = false;
        self.auth_ok = false;
        self.last_cast = None;
        self.last_tx = None;
        self.consecutive_parse_failures = 0;
    }

    fn mint_session_tag(&mut self) {
        loop {
            let tag = self.rng.next_u32();
            if tag != 0 {
                self.session_tag = tag;
                break;
            }
        }
    }

    fn take_msg_id(&mut self) -> u32 {
        loop {
            self.next_msg_id = self.next_msg_id.wrapping_add(1);
            if self.next_msg_id != 0 {
                return self.next_msg_id;
            }
        }
    }

    // ---- inbound path ----

    fn in_sync_discovery(&self) -> bool {
        matches!(self.state, LinkState::SyncBegin | LinkState::SyncCasting)
    }

    fn process_inbound(&mut self) {
        // Before the sync machinery owns the stream there is nothing to
        // parse; bytes wait (bounded) and `SyncBegin` clears them.
        if matches!(
            self.state,
            LinkState::Uninit
                | LinkState::PendingSetup
                | LinkState::Hungup
                | LinkState::Disconnected
        ) {
            return;
        }

        loop {
            // Finish the message under accumulation first; surplus bytes in
            // the buffer belong to the next header.
            if let Some(mut working) = self.working.take() {
                let taken = working.accumulate(&self.inbound_buf);
                self.inbound_buf.drain(..taken);
                if working.is_complete() {
                    self.deliver(working);
                } else {
                    self.working = Some(working);
                    return;
                }
            }

            if self.inbound_buf.is_empty() {
                return;
            }

            if self.in_sync_discovery() {
                // Hunting for alignment: everything before the first sync
                // quartet is noise from the dead stream.
                match contains_sync_pattern(&self.inbound_buf) {
                    Some(offset) => {
                        self.inbound_buf.drain(..offset);
                        cull_sync_data(&mut self.inbound_buf);
                        self.casting_sync = false;
                        // Bytes after the sync run are the peer's first real
                        // frames; they parse once the FSM leaves discovery.
                        return;
                    }
                    None => {
                        // Keep only a partial-pattern tail.
                        let tail = SYNC_PATTERN.len() - 1;
                        if self.inbound_buf.len() > tail {
                            let cut = self.inbound_buf.len() - tail;
                            self.inbound_buf.drain(..cut);
                        }
                        return;
                    }
                }
            }

            // Past discovery: a bare sync quartet at the head means the peer
            // fell back to casting. Splice in recovery and strip the run.
            if self.inbound_buf.starts_with(&SYNC_PATTERN) {
                cull_sync_data(&mut self.inbound_buf);
                if self.state != LinkState::SyncTentative {
                    self.fsm_insert_sync_states();
                }
                continue;
            }

            match MsgHeader::parse(&self.inbound_buf, self.config.mtu) {
                ParseOutcome::NeedBytes | ParseOutcome::NeedHeaderBytes => return,
                ParseOutcome::Header(header) => {
                    self.consecutive_parse_failures = 0;
                    self.inbound_buf.drain(..header.header_len());
                    self.working = Some(Message::inbound(header));
                }
                ParseOutcome::Invalid | ParseOutcome::BadChecksum | ParseOutcome::TooBig => {
                    if self.note_parse_failure() {
                        return;
                    }
                    // Slide one byte and hunt for the next plausible header.
                    self.inbound_buf.drain(..1);
                }
            }
        }
    }

    /// Records a header-parse failure. Returns true when the failure burst
    /// crossed the threshold and forced a resync.
    fn note_parse_failure(&mut self) -> bool {
        self.counters.parse_failures += 1;
        self.consecutive_parse_failures = self.consecutive_parse_failures.saturating_add(1);
        if self.consecutive_parse_failures >= self.config.max_parse_failures {
            warn!("parse failures crossed threshold; forcing resync");
            self.inbound_buf.clear();
            self.working = None;
            self.fsm_insert_sync_states();
            true
        } else {
            false
        }
    }

    fn deliver(&mut self, msg: Message) {
        self.counters.msgs_received += 1;
        self.nonsync_seen = true;

        let header = *msg.header();
        if header.is_reply {
            self.resolve_ack(&header);
        }

        match header.code {
            MsgCode::KeepAlive => {
                if header.expects_reply {
                    let _ = self.queue_internal(MsgCode::KeepAlive, Vec::new(), false, header.msg_id);
                }
            }
            MsgCode::Hangup => {
                if header.expects_reply {
                    let _ = self.queue_internal(MsgCode::Hangup, Vec::new(), false, header.msg_id);
                }
                if !header.is_reply
                    && !matches!(self.state, LinkState::PendingHangup | LinkState::Hungup)
                {
                    // Peer-initiated teardown.
                    self.waypoints.clear();
                    unwrap!(self.waypoints.push_back(LinkState::Hungup).ok());
                }
            }
            MsgCode::AuthChallenge => {
                if header.expects_reply {
                    let _ =
                        self.queue_internal(MsgCode::AuthChallenge, Vec::new(), false, header.msg_id);
                }
                self.auth_ok = true;
            }
            MsgCode::Connect
            | MsgCode::Protocol
            | MsgCode::Describe
            | MsgCode::Log
            | MsgCode::Application => {
                if !header.is_reply || !msg.payload().is_empty() {
                    // Replies with payload surface like any other message.
                    self.inbound_ready.push(msg);
                }
            }
        }
    }

    fn resolve_ack(&mut self, header: &MsgHeader) {
        if let Some(pos) = self
            .outbound
            .iter()
            .position(|entry| entry.sent_at.is_some() && entry.msg.id() == header.msg_id)
        {
            self.outbound.remove(pos);
        }
    }

    fn has_pending(&self, code: MsgCode) -> bool {
        self.outbound.iter().any(|entry| entry.msg.code() == code)
    }

    // ---- outbound path ----

    fn queue_internal(
        &mut self,
        code: MsgCode,
        payload: Vec<u8>,
        expects_reply: bool,
        msg_id: u32,
    ) -> Result<u32, LinkError> {
        let is_reply = !expects_reply && msg_id != 0;
        let msg = Message::outbound(code, payload, msg_id, expects_reply, is_reply)
            .map_err(|_| LinkError::Unencodable)?;
        self.outbound.push(OutboundEntry {
            msg,
            sent_at: None,
            resends: 0,
        });
        Ok(msg_id)
    }

    fn tx_allowed(&self, code: MsgCode) -> bool {
        match self.state {
            LinkState::Established => true,
            LinkState::PendingAuth => {
                matches!(
                    code,
                    MsgCode::AuthChallenge | MsgCode::KeepAlive | MsgCode::Hangup
                )
            }
            LinkState::PendingHangup => !matches!(code, MsgCode::Application),
            LinkState::SyncTentative => matches!(code, MsgCode::KeepAlive | MsgCode::Hangup),
            _ => false,
        }
    }

    /// Serializes due messages, re-sends overdue un-acked ones, and drops
    /// the exhausted. One pass, bounded by the queue length.
    fn churn_outbound(&mut self, now: Instant) -> u8 {
        let mut progress = 0u8;
        let mut failed: Vec<(u32, MsgCode)> = Vec::new();
        let mut i = 0;

        while i < self.outbound.len() {
            let entry = &mut self.outbound[i];

            match entry.sent_at {
                None => {
                    if self.tx_allowed(self.outbound[i].msg.code()) {
                        let entry = &mut self.outbound[i];
                        entry.msg.serialize(&mut self.outbound_wire);
                        entry.sent_at = Some(now);
                        self.counters.msgs_sent += 1;
                        self.last_tx = Some(now);
                        progress = progress.saturating_add(1);

                        if !self.outbound[i].msg.header().expects_reply {
                            self.outbound.remove(i);
                            continue;
                        }
                    }
                    i += 1;
                }
                Some(sent_at) => {
                    if elapsed(now, sent_at) >= self.config.ack_timeout {
                        if entry.resends < self.config.max_resends {
                            entry.resends += 1;
                            entry.sent_at = Some(now);
                            entry.msg.serialize(&mut self.outbound_wire);
                            self.last_tx = Some(now);
                            debug!("resending un-acked msg id {}", entry.msg.id());
                            i += 1;
                        } else {
                            let dropped = self.outbound.remove(i);
                            self.counters.ack_failures += 1;
                            failed.push((dropped.msg.id(), dropped.msg.code()));
                        }
                    } else {
                        i += 1;
                    }
                }
            }
        }

        for (msg_id, code) in failed {
            warn!("msg id {} exhausted resends", msg_id);
            self.emit_event(LinkEvent::SendFailed { msg_id, code });
            progress = progress.saturating_add(1);
        }
        progress
    }

    /// Hands completed inbound messages to the application, established
    /// sessions only.
    fn dispatch_ready(&mut self) -> u8 {
        if self.state != LinkState::Established || self.inbound_ready.is_empty() {
            return 0;
        }
        let ready = core::mem::take(&mut self.inbound_ready);
        let mut count = 0u8;
        for msg in ready {
            self.emit_event(LinkEvent::Message(msg));
            count = count.saturating_add(1);
        }
        count
    }

    fn emit_event(&mut self, event: LinkEvent) {
        let tag = self.session_tag;
        if let Some(callback) = self.callback.as_mut() {
            callback(tag, event);
        }
    }

    fn cast_due(&self, now: Instant) -> bool {
        match self.last_cast {
            Some(at) => elapsed(now, at) >= self.config.keepalive_interval,
            None => true,
        }
    }

    fn keepalive_due(&self, now: Instant) -> bool {
        match self.last_tx {
            Some(at) => elapsed(now, at) >= self.config.keepalive_interval,
            None => true,
        }
    }

    fn emit_sync(&mut self, now: Instant) {
        self.outbound_wire.extend_from_slice(&SYNC_PATTERN);
        self.last_cast = Some(now);
        self.last_tx = Some(now);
    }

    fn flush_wire(&mut self) {
        if self.outbound_wire.is_empty() {
            return;
        }
        let sink = match self.sink.as_mut() {
            Some(sink) => sink,
            None => return,
        };
        let claimed = sink.provide_buffer(&self.outbound_wire);
        let claimed = claimed.min(self.outbound_wire.len());
        self.outbound_wire.drain(..claimed);
    }
}
