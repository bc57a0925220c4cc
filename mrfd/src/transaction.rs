use crate::session::Direction;
use bytes::Bytes;
use bytesstr::BytesStr;
use sip_types::Method;
use sip_types::header::typed::RAck;
use std::net::SocketAddr;
use tokio::sync::oneshot;

slotmap::new_key_type! {
    /// Opaque handle into a session's transaction arena. Cross links
    /// between transactions are stored as keys, never as references.
    pub struct TsxKey;
}

pub const RFC3261_BRANCH_PREFIX: &str = "z9hG4bK";

/// State kept per SIP transaction.
///
/// Paired transactions reference each other through arena keys:
/// CANCEL links its INVITE, an expected PRACK links the reliable
/// provisional's INVITE, ACK links the INVITE it acknowledges.
pub struct Transaction {
    pub direction: Direction,
    pub method: Method,
    pub cseq: u32,

    /// RSeq of the reliable provisional this transaction acknowledges
    /// (PRACK bookkeeping only)
    pub rseq: u32,

    pub via_branch: BytesStr,

    /// Full Via values of the incoming request, replayed on responses
    /// built after the request itself is gone
    pub via_values: Vec<BytesStr>,

    /// RAck sent on an outgoing PRACK
    pub rack: Option<RAck>,

    pub acked: bool,
    pub finalized: bool,

    /// In-dialog keep-alive probe marker
    pub is_probing: bool,

    /// A PRACK that matched no awaited (RSeq, CSeq) pair
    pub unexpected: bool,

    /// Response codes observed on this transaction, in order
    pub responses: Vec<u16>,

    pub linked: Option<TsxKey>,
    pub ack: Option<TsxKey>,

    /// Serialized bytes of the message this transaction retransmits
    pub sent_bytes: Option<Bytes>,
    pub target: Option<SocketAddr>,

    retransmit_stop: Option<oneshot::Sender<()>>,
    cancel_aux_stop: Option<oneshot::Sender<()>>,
}

impl Transaction {
    pub fn new(direction: Direction, method: Method, cseq: u32, via_branch: BytesStr) -> Self {
        Self {
            direction,
            method,
            cseq,
            rseq: 0,
            via_branch,
            via_values: Vec::new(),
            rack: None,
            acked: false,
            finalized: false,
            is_probing: false,
            unexpected: false,
            responses: Vec::new(),
            linked: None,
            ack: None,
            sent_bytes: None,
            target: None,
            retransmit_stop: None,
            cancel_aux_stop: None,
        }
    }

    /// An incoming request opens a transaction mirroring its CSeq and
    /// Via branch
    pub fn incoming(method: Method, cseq: u32, via_branch: BytesStr) -> Self {
        Self::new(Direction::Inbound, method, cseq, via_branch)
    }

    /// An outgoing request gets a fresh branch
    pub fn outgoing(method: Method, cseq: u32) -> Self {
        Self::new(Direction::Outbound, method, cseq, generate_branch())
    }

    /// Expected PRACK for a reliable provisional sent with `rseq`
    pub fn awaited_prack(rseq: u32, cseq: u32) -> Self {
        let mut tsx = Self::new(Direction::Inbound, Method::PRACK, cseq, BytesStr::from_static(""));
        tsx.rseq = rseq;
        tsx
    }

    pub fn record_response(&mut self, code: u16) {
        self.responses.push(code);
    }

    pub fn saw_response(&self, code: u16) -> bool {
        self.responses.contains(&code)
    }

    /// Whether any negative final response was observed. Controls the
    /// ACK Via branch: it reuses the INVITE branch iff this is true
    /// (RFC 3261 section 17.1.1.3).
    pub fn saw_negative_final(&self) -> bool {
        self.responses.iter().any(|&code| code >= 300)
    }

    pub fn arm_retransmission(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.retransmit_stop = Some(tx);
        rx
    }

    pub fn arm_cancel_aux(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.cancel_aux_stop = Some(tx);
        rx
    }

    pub fn stop_retransmission(&mut self) {
        if let Some(stop) = self.retransmit_stop.take() {
            let _ = stop.send(());
        }
    }

    pub fn stop_cancel_aux(&mut self) {
        if let Some(stop) = self.cancel_aux_stop.take() {
            let _ = stop.send(());
        }
    }

    pub fn stop_timers(&mut self) {
        self.stop_retransmission();
        self.stop_cancel_aux();
    }

    /// Finalize: no further responses expected, retransmissions stop
    pub fn finalize(&mut self) {
        self.finalized = true;
        self.stop_retransmission();
    }
}

pub fn generate_branch() -> BytesStr {
    use rand::Rng;
    use rand::distr::Alphanumeric;

    RFC3261_BRANCH_PREFIX
        .bytes()
        .chain(rand::rng().sample_iter(Alphanumeric).take(23))
        .map(char::from)
        .collect::<String>()
        .into()
}

pub fn random_tag() -> BytesStr {
    use rand::Rng;
    use rand::distr::Alphanumeric;

    rand::rng()
        .sample_iter(Alphanumeric)
        .take(12)
        .map(char::from)
        .collect::<String>()
        .into()
}

pub fn random_call_id(host: &str) -> BytesStr {
    use rand::Rng;
    use rand::distr::Alphanumeric;

    let token: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(20)
        .map(char::from)
        .collect();

    format!("{token}@{host}").into()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn branch_has_rfc3261_magic_cookie() {
        let branch = generate_branch();
        assert!(branch.as_str().starts_with(RFC3261_BRANCH_PREFIX));
        assert_eq!(branch.len(), RFC3261_BRANCH_PREFIX.len() + 23);
    }

    #[test]
    fn negative_final_detection() {
        let mut tsx = Transaction::outgoing(Method::INVITE, 1);
        tsx.record_response(180);
        assert!(!tsx.saw_negative_final());

        tsx.record_response(487);
        assert!(tsx.saw_negative_final());
        assert!(tsx.saw_response(180));
        assert!(!tsx.saw_response(200));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut tsx = Transaction::incoming(Method::INVITE, 1, "z9hG4bKx".into());
        let _rx = tsx.arm_retransmission();

        tsx.stop_timers();
        tsx.stop_timers();
        assert!(!tsx.finalized);

        tsx.finalize();
        assert!(tsx.finalized);
    }
}
