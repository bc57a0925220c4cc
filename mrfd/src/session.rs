use crate::transaction::{Transaction, TsxKey};
use bytesstr::BytesStr;
use codec::Codec;
use parking_lot::{Mutex, RwLock};
use rtp::{RtpTimestamp, SequenceNumber, Ssrc};
use sip_types::Method;
use sip_types::header::typed::NameAddr;
use slotmap::SlotMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Dialog state. The names follow classic call-state terminology: the
/// `BeingX` states are transitional while a final response or ACK is
/// outstanding, the rest are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    BeingEstablished,
    Established,
    BeingCancelled,
    BeingDropped,
    BeingCleared,
    BeingFailed,
    BeingProbed,
    Failed,
    TimedOut,
    Cleared,
    Cancelled,
    Dropped,
    Registered,
    Unregistered,
}

impl SessionState {
    /// Settled states out of which no dialog activity continues
    pub fn is_final(self) -> bool {
        matches!(
            self,
            SessionState::Failed
                | SessionState::TimedOut
                | SessionState::Cleared
                | SessionState::Cancelled
                | SessionState::Dropped
                | SessionState::Unregistered
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "Idle",
            SessionState::BeingEstablished => "BeingEstablished",
            SessionState::Established => "Established",
            SessionState::BeingCancelled => "BeingCancelled",
            SessionState::BeingDropped => "BeingDropped",
            SessionState::BeingCleared => "BeingCleared",
            SessionState::BeingFailed => "BeingFailed",
            SessionState::BeingProbed => "BeingProbed",
            SessionState::Failed => "Failed",
            SessionState::TimedOut => "TimedOut",
            SessionState::Cleared => "Cleared",
            SessionState::Cancelled => "Cancelled",
            SessionState::Dropped => "Dropped",
            SessionState::Registered => "Registered",
            SessionState::Unregistered => "Unregistered",
        };
        f.write_str(s)
    }
}

/// Dialog core: everything the signaling side mutates under one lock
pub struct SessionCore {
    /// Mirror of the session's Call-ID for the message builders
    pub call_id: BytesStr,

    /// Repository the called user part selected
    pub repo_id: Option<String>,

    pub from: Option<NameAddr>,
    pub to: Option<NameAddr>,
    pub from_tag: Option<BytesStr>,
    pub to_tag: Option<BytesStr>,

    pub remote_contact: Option<NameAddr>,

    /// SIP signaling address of the peer
    pub remote_udp: Option<SocketAddr>,

    /// CSeq of the peer's requests towards us
    pub fwd_cseq: u32,

    /// CSeq counter for our own in-dialog requests
    pub bwd_cseq: u32,

    /// RSeq counter for reliable provisionals, randomized start
    pub rseq: u32,

    pub peer_supports_100rel: bool,

    pub sdp_session_id: u64,
    pub sdp_session_version: u64,
    pub sdp_hash: Option<[u8; 32]>,

    pub transactions: SlotMap<TsxKey, Transaction>,

    /// Call-ID of the linked B2BUA leg, when one exists
    pub linked_session: Option<BytesStr>,

    /// Last Reason header observed on the dialog, mirrored onto
    /// outgoing CANCEL/BYE
    pub reason: Option<BytesStr>,

    pub no_18x_timer: Option<crate::timer::TimerHandle>,
    pub no_answer_timer: Option<crate::timer::TimerHandle>,
}

impl SessionCore {
    fn new(call_id: BytesStr) -> Self {
        Self {
            call_id,
            repo_id: None,
            from: None,
            to: None,
            from_tag: None,
            to_tag: None,
            remote_contact: None,
            remote_udp: None,
            fwd_cseq: 0,
            bwd_cseq: 0,
            rseq: 0,
            peer_supports_100rel: false,
            sdp_session_id: 0,
            sdp_session_version: 0,
            sdp_hash: None,
            transactions: SlotMap::with_key(),
            linked_session: None,
            reason: None,
            no_18x_timer: None,
            no_answer_timer: None,
        }
    }

    /// Assign the To tag exactly once; later calls keep the first tag
    pub fn ensure_to_tag(&mut self) -> BytesStr {
        if let Some(tag) = &self.to_tag {
            return tag.clone();
        }

        let tag = crate::transaction::random_tag();
        self.to_tag = Some(tag.clone());
        tag
    }

    /// Next RSeq for a reliable provisional, randomized start in [1,999]
    pub fn next_rseq(&mut self) -> u32 {
        if self.rseq == 0 {
            self.rseq = rand::random_range(1..1000);
        } else {
            self.rseq += 1;
        }
        self.rseq
    }

    pub fn next_cseq(&mut self) -> u32 {
        self.bwd_cseq += 1;
        self.bwd_cseq
    }

    /// The most recent un-ACKed INVITE transaction in `direction`
    pub fn last_unacked_invite(&self, direction: Direction) -> Option<TsxKey> {
        let mut last = None;

        for (key, tsx) in &self.transactions {
            if tsx.direction == direction && tsx.method == Method::INVITE && !tsx.acked {
                last = Some(key);
            }
        }

        last
    }
}

/// Media-side state negotiated by the SDP answer
pub struct MediaState {
    pub remote_rtp: Option<SocketAddr>,
    pub local_port: u16,
    pub codec: Codec,
    pub payload_type: u8,

    /// RFC 4733 payload type offered by the peer, enables the
    /// telephone-event receive path
    pub telephone_event_pt: Option<u8>,

    /// Call hold: transmission pauses while counters keep advancing
    pub held: bool,

    pub ssrc: Ssrc,
    pub sequence_number: SequenceNumber,
    pub timestamp: RtpTimestamp,
}

impl MediaState {
    fn new() -> Self {
        Self {
            remote_rtp: None,
            local_port: 0,
            codec: Codec::Pcmu,
            payload_type: 0,
            telephone_event_pt: None,
            held: false,
            ssrc: Ssrc(0),
            sequence_number: SequenceNumber(0),
            timestamp: RtpTimestamp(0),
        }
    }
}

/// One SIP dialog and its media leg
pub struct Session {
    pub direction: Direction,
    pub call_id: BytesStr,

    state: RwLock<SessionState>,

    pub core: Mutex<SessionCore>,
    pub media: Mutex<MediaState>,

    /// Reserved media socket, shared by the receive task and the
    /// playback transmit loop
    pub media_socket: Mutex<Option<Arc<UdpSocket>>>,

    /// Last DTMF digit collected on this dialog
    pub last_dtmf: Mutex<Option<char>>,

    /// Barge-in enabled for the current playback
    pub barge_enabled: AtomicBool,

    /// Stop signal of the currently running playback, `true` means
    /// interrupted by an external event
    pub playback_stop: Mutex<Option<mpsc::Sender<bool>>>,

    /// Suppresses the delayed 200 answer after a CANCEL won the race
    pub answer_cancelled: AtomicBool,

    disposed: AtomicBool,

    /// Closed on disposal; stops the probing ticker, the max-duration
    /// handler and the RTP receive task at once
    maxdprob_done: watch::Sender<bool>,
}

impl Session {
    pub fn new(direction: Direction, call_id: BytesStr) -> Arc<Self> {
        let (maxdprob_done, _) = watch::channel(false);

        Arc::new(Self {
            direction,
            state: RwLock::new(SessionState::Idle),
            core: Mutex::new(SessionCore::new(call_id.clone())),
            call_id,
            media: Mutex::new(MediaState::new()),
            media_socket: Mutex::new(None),
            last_dtmf: Mutex::new(None),
            barge_enabled: AtomicBool::new(false),
            playback_stop: Mutex::new(None),
            answer_cancelled: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            maxdprob_done,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        tracing::debug!(call_id = %self.call_id, "state {} -> {state}", *current);
        *current = state;
    }

    /// Transition only out of one of the `expected` states. Returns
    /// whether the transition happened.
    pub fn transition(&self, expected: &[SessionState], to: SessionState) -> bool {
        let mut current = self.state.write();
        if expected.contains(&current) {
            tracing::debug!(call_id = %self.call_id, "state {} -> {to}", *current);
            *current = to;
            true
        } else {
            false
        }
    }

    pub fn is_being_established(&self) -> bool {
        self.state() == SessionState::BeingEstablished
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Subscribe to the shared done signal used by the long-running
    /// per-session tasks
    pub fn done_signal(&self) -> watch::Receiver<bool> {
        self.maxdprob_done.subscribe()
    }

    /// Tear the session down: all timers closed, tasks signalled,
    /// playback stopped. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.maxdprob_done.send(true);

        let mut core = self.core.lock();
        for (_, tsx) in core.transactions.iter_mut() {
            tsx.stop_timers();
        }
        if let Some(mut timer) = core.no_18x_timer.take() {
            timer.stop();
        }
        if let Some(mut timer) = core.no_answer_timer.take() {
            timer.stop();
        }
        drop(core);

        // silent stop: a disposed dialog emits no playback report
        if let Some(stop) = self.playback_stop.lock().take() {
            let _ = stop.try_send(false);
        }
    }

    /// Record a collected digit; returns true when it barged into a
    /// running playback
    pub fn collect_digit(&self, digit: char) -> bool {
        *self.last_dtmf.lock() = Some(digit);

        if self.barge_enabled.load(Ordering::Acquire) {
            if let Some(stop) = self.playback_stop.lock().as_ref() {
                let _ = stop.try_send(true);
                return true;
            }
        }

        false
    }

    pub fn describe(&self) -> String {
        format!(
            "Call-ID: {}, State: {}, Direction: {}",
            self.call_id,
            self.state(),
            self.direction
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn to_tag_is_assigned_once() {
        let session = Session::new(Direction::Inbound, "cid".into());
        let mut core = session.core.lock();

        let first = core.ensure_to_tag();
        let second = core.ensure_to_tag();
        assert_eq!(first, second);
    }

    #[test]
    fn rseq_starts_randomized_and_increments() {
        let session = Session::new(Direction::Inbound, "cid".into());
        let mut core = session.core.lock();

        let first = core.next_rseq();
        assert!((1..1000).contains(&first));
        assert_eq!(core.next_rseq(), first + 1);
        assert_eq!(core.next_rseq(), first + 2);
    }

    #[test]
    fn at_most_one_unacked_invite_per_direction() {
        let session = Session::new(Direction::Inbound, "cid".into());
        let mut core = session.core.lock();

        let first = core
            .transactions
            .insert(Transaction::incoming(Method::INVITE, 1, "z9hG4bKa".into()));
        core.transactions[first].acked = true;

        let second = core
            .transactions
            .insert(Transaction::incoming(Method::INVITE, 2, "z9hG4bKb".into()));

        assert_eq!(core.last_unacked_invite(Direction::Inbound), Some(second));
        assert_eq!(core.last_unacked_invite(Direction::Outbound), None);
    }

    #[test]
    fn transition_guards_state() {
        let session = Session::new(Direction::Inbound, "cid".into());
        session.set_state(SessionState::BeingEstablished);

        assert!(session.transition(
            &[SessionState::BeingEstablished],
            SessionState::Established
        ));
        assert!(!session.transition(
            &[SessionState::BeingEstablished],
            SessionState::Failed
        ));
        assert_eq!(session.state(), SessionState::Established);
    }

    #[test]
    fn dispose_is_idempotent() {
        let session = Session::new(Direction::Inbound, "cid".into());
        let mut done = session.done_signal();

        session.dispose();
        session.dispose();

        assert!(session.is_disposed());
        assert!(*done.borrow_and_update());
    }
}
