//! Dialog state machine and request/response routing.
//!
//! Workers hand every parsed PDU to [`handle_message`]; everything that
//! mutates a dialog goes through the session's core lock, which is
//! never held across an await point. Serialized messages are memoized
//! on their transaction for retransmission.

use crate::error::q850;
use crate::mrf;
use crate::msc::MscRequest;
use crate::playback;
use crate::runtime::Runtime;
use crate::session::{Direction, Session, SessionCore, SessionState};
use crate::timer;
use crate::transaction::{Transaction, TsxKey, generate_branch};
use bytes::Bytes;
use bytesstr::BytesStr;
use sip_types::header::typed::{CSeq, RAck};
use sip_types::{BodyType, CodeKind, MessageBody, Method, Name, SipMessage, SipUri, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

const ALLOWED_METHODS: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, PRACK, INFO";

/// Entry point for every parsed SIP message
pub async fn handle_message(rt: &Arc<Runtime>, msg: SipMessage, src: SocketAddr) {
    if msg.is_request() {
        handle_request(rt, msg, src).await;
    } else {
        handle_response(rt, msg, src).await;
    }
}

async fn handle_request(rt: &Arc<Runtime>, msg: SipMessage, src: SocketAddr) {
    let Some(call_id) = msg.call_id.clone() else {
        tracing::warn!(%src, "request without Call-ID dropped");
        return;
    };

    if msg.cseq.is_none() {
        tracing::warn!(%src, "request without CSeq dropped");
        return;
    }

    let method = msg.method().cloned().expect("checked is_request");
    let session = rt.sessions.load(&call_id);

    if method == Method::INVITE {
        match session {
            None => handle_initial_invite(rt, msg, src).await,
            Some(session) => handle_reinvite(rt, session, msg, src).await,
        }
        return;
    }

    let Some(session) = session else {
        if method == Method::ACK {
            tracing::debug!(%call_id, "ACK for unknown dialog dropped");
        } else if method == Method::OPTIONS {
            // dialogless keep-alive probe
            respond_dialogless(rt, &msg, StatusCode::OK, src).await;
        } else {
            tracing::debug!(%call_id, %method, "request for unknown dialog");
            respond_dialogless(rt, &msg, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST, src)
                .await;
        }
        return;
    };

    if method == Method::ACK {
        handle_ack(rt, session, msg).await;
    } else if method == Method::CANCEL {
        handle_cancel(rt, session, msg, src).await;
    } else if method == Method::BYE {
        handle_bye(rt, session, msg, src).await;
    } else if method == Method::PRACK {
        handle_prack(rt, session, msg, src).await;
    } else if method == Method::OPTIONS {
        let bytes = {
            let mut core = session.core.lock();
            let tsx = open_incoming_tsx(&mut core, &msg);
            core.transactions[tsx].finalized = true;
            let mut response = make_response(rt, &session, &mut core, &msg, StatusCode::OK, None);
            response.headers.set(Name::ALLOW, ALLOWED_METHODS);
            response.serialize()
        };
        rt.sip_send(&bytes, src).await;
    } else if method == Method::INFO {
        handle_info(rt, session, msg, src).await;
    } else {
        tracing::debug!(call_id = %session.call_id, %method, "unsupported in-dialog method");
        let bytes = {
            let mut core = session.core.lock();
            let tsx = open_incoming_tsx(&mut core, &msg);
            core.transactions[tsx].finalized = true;
            let mut response = make_response(
                rt,
                &session,
                &mut core,
                &msg,
                StatusCode::METHOD_NOT_ALLOWED,
                None,
            );
            response.headers.set(Name::ALLOW, ALLOWED_METHODS);
            response.serialize()
        };
        rt.sip_send(&bytes, src).await;
    }
}

// ==== INVITE ====

async fn handle_initial_invite(rt: &Arc<Runtime>, msg: SipMessage, src: SocketAddr) {
    let call_id = msg.call_id.clone().expect("checked by caller");
    let session = Session::new(Direction::Inbound, call_id.clone());
    session.set_state(SessionState::BeingEstablished);

    let admitted = rt.sessions.store(session.clone());

    {
        let mut core = session.core.lock();
        core.remote_udp = Some(src);
        core.from = msg.from.clone();
        core.to = msg.to.clone();
        core.from_tag = msg.from_tag().cloned();
        core.fwd_cseq = msg.cseq.as_ref().map(|c| c.cseq).unwrap_or(0);
        core.remote_contact = msg.contact.clone();
        core.peer_supports_100rel = supports_100rel(&msg);
        core.repo_id = msg.request_user().map(|u| u.to_string());
    }

    if !admitted {
        tracing::warn!(%call_id, "inbound call refused by rate limiter");
        reject_invite(
            rt,
            &session,
            &msg,
            src,
            StatusCode::SERVICE_UNAVAILABLE,
            q850::SWITCHING_CONGESTION,
            "Rate limit exceeded",
        )
        .await;
        return;
    }

    mrf::handle_offer(rt, &session, msg, src, false).await;
}

async fn handle_reinvite(
    rt: &Arc<Runtime>,
    session: Arc<Session>,
    msg: SipMessage,
    src: SocketAddr,
) {
    // duplicate INVITEs (same From-tag, Via-branch and CSeq) are
    // silently dropped
    let is_duplicate = {
        let core = session.core.lock();
        let same_leg = core.from_tag.as_deref() == msg.from_tag().map(|t| t.as_str());

        same_leg
            && core.transactions.iter().any(|(_, tsx)| {
                tsx.direction == Direction::Inbound
                    && tsx.method == Method::INVITE
                    && Some(tsx.via_branch.as_str()) == msg.via_branch.as_deref()
                    && Some(tsx.cseq) == msg.cseq.as_ref().map(|c| c.cseq)
            })
    };

    if is_duplicate {
        tracing::debug!(call_id = %session.call_id, "duplicate INVITE dropped");
        return;
    }

    if session.state() != SessionState::Established {
        let bytes = {
            let mut core = session.core.lock();
            let tsx = open_incoming_tsx(&mut core, &msg);
            core.transactions[tsx].finalized = true;
            make_response(rt, &session, &mut core, &msg, StatusCode::REQUEST_PENDING, None)
                .serialize()
        };
        rt.sip_send(&bytes, src).await;
        return;
    }

    {
        let mut core = session.core.lock();
        core.fwd_cseq = msg.cseq.as_ref().map(|c| c.cseq).unwrap_or(core.fwd_cseq);
    }

    mrf::handle_offer(rt, &session, msg, src, true).await;
}

/// Open a transaction for an incoming request and return its key
pub fn open_incoming_tsx(core: &mut SessionCore, msg: &SipMessage) -> TsxKey {
    let method = msg.method().cloned().unwrap_or(Method::OPTIONS);
    let cseq = msg.cseq.as_ref().map(|c| c.cseq).unwrap_or(0);
    let branch = msg
        .via_branch
        .clone()
        .unwrap_or_else(|| BytesStr::from_static(""));

    let mut tsx = Transaction::incoming(method, cseq, branch);
    tsx.via_values = msg.headers.get_all(&Name::VIA).cloned().collect();

    core.transactions.insert(tsx)
}

/// Send a final rejection for an inbound INVITE with Warning and Reason
/// headers, arming the response retransmission
pub async fn reject_invite(
    rt: &Arc<Runtime>,
    session: &Arc<Session>,
    msg: &SipMessage,
    src: SocketAddr,
    code: StatusCode,
    cause: u16,
    warning: &'static str,
) {
    session.set_state(SessionState::BeingFailed);

    let reject = crate::error::Reject::new(code, cause, warning);

    let (bytes, tsx) = {
        let mut core = session.core.lock();
        let tsx = open_incoming_tsx(&mut core, msg);

        let mut response = make_response(rt, session, &mut core, msg, code, None);
        response.headers.set(
            Name::WARNING,
            reject.warning_value(&rt.config.server_ipv4.to_string()),
        );
        response.headers.set(Name::REASON, reject.reason_value());

        let bytes = response.serialize();
        let transaction = &mut core.transactions[tsx];
        transaction.record_response(code.into_u16());
        transaction.finalized = true;
        transaction.sent_bytes = Some(bytes.clone());
        transaction.target = Some(src);

        (bytes, tsx)
    };

    rt.sip_send(&bytes, src).await;
    spawn_response_retransmission(rt, session, tsx);
}

// ==== ACK ====

async fn handle_ack(rt: &Arc<Runtime>, session: Arc<Session>, msg: SipMessage) {
    {
        let mut core = session.core.lock();

        let invite = core
            .transactions
            .iter()
            .find(|(_, tsx)| {
                tsx.direction == Direction::Inbound
                    && tsx.method == Method::INVITE
                    && !tsx.acked
                    && Some(tsx.cseq) == msg.cseq.as_ref().map(|c| c.cseq)
            })
            .map(|(key, _)| key);

        let Some(invite) = invite else {
            tracing::debug!(call_id = %session.call_id, "ACK without matching INVITE");
            return;
        };

        let ack = core.transactions.insert(Transaction::incoming(
            Method::ACK,
            msg.cseq.as_ref().map(|c| c.cseq).unwrap_or(0),
            msg.via_branch
                .clone()
                .unwrap_or_else(|| BytesStr::from_static("")),
        ));

        let transaction = &mut core.transactions[invite];
        transaction.acked = true;
        transaction.ack = Some(ack);
        transaction.stop_retransmission();
        transaction.stop_cancel_aux();
        core.transactions[ack].linked = Some(invite);
    }

    match session.state() {
        SessionState::BeingEstablished => {
            if session.transition(&[SessionState::BeingEstablished], SessionState::Established) {
                start_established_timers(rt, &session);
            }
        }
        SessionState::BeingFailed => {
            session.set_state(SessionState::Failed);
            rt.drop_session(&session);
        }
        SessionState::BeingCancelled => {
            session.set_state(SessionState::Cancelled);
            rt.drop_session(&session);
        }
        _ => {}
    }
}

// ==== CANCEL ====

enum CancelAction {
    TooLate(Bytes),
    Cancel {
        cancel_ok: Bytes,
        terminated: Bytes,
        invite_tsx: TsxKey,
    },
}

async fn handle_cancel(
    rt: &Arc<Runtime>,
    session: Arc<Session>,
    msg: SipMessage,
    src: SocketAddr,
) {
    let action = {
        let mut core = session.core.lock();

        let invite = core
            .transactions
            .iter()
            .find(|(_, tsx)| {
                tsx.direction == Direction::Inbound
                    && tsx.method == Method::INVITE
                    && Some(tsx.cseq) == msg.cseq.as_ref().map(|c| c.cseq)
            })
            .map(|(key, _)| key);

        let cancel_tsx = open_incoming_tsx(&mut core, &msg);
        core.transactions[cancel_tsx].finalized = true;

        let cancel_ok =
            make_response(rt, &session, &mut core, &msg, StatusCode::OK, None).serialize();

        match invite {
            Some(invite) if !core.transactions[invite].finalized => {
                core.transactions[cancel_tsx].linked = Some(invite);

                // mirror the peer's Reason header for later teardown
                if let Some(reason) = msg.headers.get(&Name::REASON) {
                    core.reason = Some(reason.clone());
                }

                let mut terminated = make_response_for_invite(
                    &session,
                    &mut core,
                    invite,
                    StatusCode::REQUEST_TERMINATED,
                );
                terminated.headers.set(
                    Name::REASON,
                    format!("Q.850;cause={}", q850::NORMAL_CALL_CLEARING),
                );

                let terminated = terminated.serialize();
                let transaction = &mut core.transactions[invite];
                transaction.record_response(StatusCode::REQUEST_TERMINATED.into_u16());
                transaction.finalized = true;
                transaction.stop_retransmission();
                transaction.sent_bytes = Some(terminated.clone());
                transaction.target = Some(src);

                CancelAction::Cancel {
                    cancel_ok,
                    terminated,
                    invite_tsx: invite,
                }
            }
            _ => CancelAction::TooLate(cancel_ok),
        }
    };

    match action {
        CancelAction::TooLate(bytes) => {
            // the 200 already went out, the CANCEL lost the race
            tracing::debug!(call_id = %session.call_id, "CANCEL after final response ignored");
            rt.sip_send(&bytes, src).await;
        }
        CancelAction::Cancel {
            cancel_ok,
            terminated,
            invite_tsx,
        } => {
            session.answer_cancelled.store(true, Ordering::Release);
            session.set_state(SessionState::BeingCancelled);
            playback::stop_silently(&session);

            rt.sip_send(&cancel_ok, src).await;
            rt.sip_send(&terminated, src).await;
            spawn_response_retransmission(rt, &session, invite_tsx);
        }
    }
}

// ==== BYE ====

async fn handle_bye(rt: &Arc<Runtime>, session: Arc<Session>, msg: SipMessage, src: SocketAddr) {
    session.set_state(SessionState::BeingDropped);
    playback::stop_silently(&session);

    let bytes = {
        let mut core = session.core.lock();

        if let Some(reason) = msg.headers.get(&Name::REASON) {
            core.reason = Some(reason.clone());
        }

        // a BYE cancels every outstanding retransmission and completes
        // pending inbound INVITE transactions
        for (_, tsx) in core.transactions.iter_mut() {
            tsx.stop_timers();
            if tsx.direction == Direction::Inbound && tsx.method == Method::INVITE {
                tsx.finalized = true;
            }
        }

        let tsx = open_incoming_tsx(&mut core, &msg);
        core.transactions[tsx].finalized = true;

        make_response(rt, &session, &mut core, &msg, StatusCode::OK, None).serialize()
    };

    rt.sip_send(&bytes, src).await;

    session.set_state(SessionState::Dropped);
    rt.drop_session(&session);
}

// ==== PRACK ====

async fn handle_prack(
    rt: &Arc<Runtime>,
    session: Arc<Session>,
    msg: SipMessage,
    src: SocketAddr,
) {
    let rack = msg.headers.get(&Name::RACK).and_then(RAck::from_value);

    let bytes = {
        let mut core = session.core.lock();

        let matched = rack.as_ref().and_then(|rack| {
            core.transactions
                .iter()
                .find(|(_, tsx)| {
                    tsx.direction == Direction::Inbound
                        && tsx.method == Method::PRACK
                        && !tsx.finalized
                        && tsx.rseq == rack.rack
                        && tsx.cseq == rack.cseq
                })
                .map(|(key, _)| key)
        });

        match matched {
            Some(awaited) => {
                // stops the reliable provisional's retransmission
                let transaction = &mut core.transactions[awaited];
                transaction.finalize();
                transaction.acked = true;

                let tsx = open_incoming_tsx(&mut core, &msg);
                core.transactions[tsx].linked = Some(awaited);
                core.transactions[tsx].finalized = true;

                make_response(rt, &session, &mut core, &msg, StatusCode::OK, None).serialize()
            }
            None => {
                tracing::warn!(call_id = %session.call_id, ?rack, "unexpected PRACK");

                let tsx = open_incoming_tsx(&mut core, &msg);
                core.transactions[tsx].unexpected = true;
                core.transactions[tsx].finalized = true;

                make_response(
                    rt,
                    &session,
                    &mut core,
                    &msg,
                    StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
                    None,
                )
                .serialize()
            }
        }
    };

    rt.sip_send(&bytes, src).await;
}

// ==== INFO ====

async fn handle_info(rt: &Arc<Runtime>, session: Arc<Session>, msg: SipMessage, src: SocketAddr) {
    let request = msg
        .body
        .get(BodyType::MscIvrXml)
        .ok_or(crate::msc::MscParseError::NoRequest)
        .and_then(|part| MscRequest::parse(&part.data));

    let (code, request) = match request {
        Ok(request) => (StatusCode::OK, Some(request)),
        Err(e) => {
            tracing::warn!(call_id = %session.call_id, "unusable INFO body: {e}");
            (StatusCode::BAD_REQUEST, None)
        }
    };

    let bytes = {
        let mut core = session.core.lock();
        core.fwd_cseq = msg.cseq.as_ref().map(|c| c.cseq).unwrap_or(core.fwd_cseq);
        let tsx = open_incoming_tsx(&mut core, &msg);
        core.transactions[tsx].finalized = true;
        make_response(rt, &session, &mut core, &msg, code, None).serialize()
    };

    rt.sip_send(&bytes, src).await;

    if let Some(request) = request {
        playback::start(rt.clone(), session, request);
    }
}

// ==== Responses to our own requests ====

enum ResponseAction {
    None,
    SendPrack { rseq: u32 },
    SendAck { bytes: Bytes, fresh: bool },
    ProbingOk,
    ProbingFailed,
    ByeDone,
    CancelDone { invite: Option<TsxKey> },
}

async fn handle_response(rt: &Arc<Runtime>, msg: SipMessage, src: SocketAddr) {
    let Some(call_id) = msg.call_id.clone() else {
        return;
    };
    let Some(cseq) = msg.cseq.clone() else {
        return;
    };
    let Some(code) = msg.status_code() else {
        return;
    };

    let Some(session) = rt.sessions.load(&call_id) else {
        tracing::debug!(%call_id, "response for unknown dialog dropped");
        return;
    };

    let action = {
        let mut core = session.core.lock();

        let matched = core
            .transactions
            .iter()
            .find(|(_, tsx)| {
                tsx.direction == Direction::Outbound
                    && tsx.method == cseq.method
                    && tsx.cseq == cseq.cseq
            })
            .map(|(key, _)| key);

        let Some(key) = matched else {
            tracing::debug!(%call_id, "response without matching transaction dropped");
            return;
        };

        // learn the remote tag from the first response carrying one
        if core.to_tag.is_none()
            && session.direction == Direction::Outbound
            && msg.to_tag().is_some()
        {
            core.to_tag = msg.to_tag().cloned();
        }

        let duplicate_final = code.is_final()
            && core.transactions[key].responses.iter().any(|&c| c >= 200);

        core.transactions[key].record_response(code.into_u16());

        if code.kind() == CodeKind::Provisional {
            if core.transactions[key].method == Method::INVITE {
                if let Some(mut no_18x) = core.no_18x_timer.take() {
                    no_18x.stop();
                }
            }

            let rseq = msg
                .headers
                .get(&Name::RSEQ)
                .and_then(|v| v.as_str().trim().parse::<u32>().ok());

            match (requires_100rel(&msg), rseq) {
                (true, Some(rseq)) => ResponseAction::SendPrack { rseq },
                _ => ResponseAction::None,
            }
        } else {
            let method = core.transactions[key].method.clone();
            core.transactions[key].finalize();

            if duplicate_final {
                // duplicate final responses trigger an ACK
                // retransmission when an ACK transaction exists
                let existing_ack = core.transactions[key]
                    .ack
                    .and_then(|ack| core.transactions[ack].sent_bytes.clone());

                match existing_ack {
                    Some(bytes) => ResponseAction::SendAck {
                        bytes,
                        fresh: false,
                    },
                    None => ResponseAction::None,
                }
            } else if method == Method::INVITE {
                if let Some(mut no_answer) = core.no_answer_timer.take() {
                    no_answer.stop();
                }

                let bytes = build_ack(rt, &mut core, key);
                ResponseAction::SendAck { bytes, fresh: true }
            } else if method == Method::OPTIONS {
                if core.transactions[key].is_probing && code.kind() != CodeKind::Success {
                    ResponseAction::ProbingFailed
                } else if core.transactions[key].is_probing {
                    ResponseAction::ProbingOk
                } else {
                    ResponseAction::None
                }
            } else if method == Method::BYE {
                ResponseAction::ByeDone
            } else if method == Method::CANCEL {
                ResponseAction::CancelDone {
                    invite: core.transactions[key].linked,
                }
            } else {
                ResponseAction::None
            }
        }
    };

    match action {
        ResponseAction::None => {}
        ResponseAction::SendPrack { rseq } => {
            send_prack(rt, &session, rseq, &cseq, src).await;
        }
        ResponseAction::SendAck { bytes, fresh } => {
            rt.sip_send(&bytes, src).await;

            if !fresh {
                return;
            }

            if code.is_negative() {
                session.set_state(SessionState::Failed);
                reroute_linked(rt, &session, code).await;
                rt.drop_session(&session);
            } else if code.kind() == CodeKind::Success {
                if session
                    .transition(&[SessionState::BeingEstablished], SessionState::Established)
                {
                    start_established_timers(rt, &session);
                }
            }
        }
        ResponseAction::ProbingOk => {
            // keep-alive answered; a probing dialog counts as registered
            session.transition(&[SessionState::BeingProbed], SessionState::Registered);
        }
        ResponseAction::ProbingFailed => {
            release_call(rt, &session, "Probing timed-out").await;
        }
        ResponseAction::ByeDone => {
            session.set_state(SessionState::Cleared);
            rt.drop_session(&session);
        }
        ResponseAction::CancelDone { invite } => {
            start_cancel_aux_timer(rt, &session, invite);
        }
    }
}

/// PRACK for an incoming reliable provisional: RAck carries the RSeq
/// and the CSeq of the response it acknowledges
async fn send_prack(
    rt: &Arc<Runtime>,
    session: &Arc<Session>,
    rseq: u32,
    response_cseq: &CSeq,
    src: SocketAddr,
) {
    let (bytes, key) = {
        let mut core = session.core.lock();
        let mut prack = make_in_dialog_request(rt, &mut core, Method::PRACK);
        let rack = RAck::new(rseq, response_cseq.cseq, response_cseq.method.clone());
        prack.headers.set(Name::RACK, rack.to_string());

        let bytes = prack.serialize();
        let key = core.transactions.insert(Transaction::outgoing(
            Method::PRACK,
            prack.cseq.as_ref().map(|c| c.cseq).unwrap_or(0),
        ));
        let transaction = &mut core.transactions[key];
        transaction.rack = Some(rack);
        transaction.sent_bytes = Some(bytes.clone());
        transaction.target = Some(src);

        (bytes, key)
    };

    rt.sip_send(&bytes, src).await;
    spawn_request_retransmission(rt, session, key);
}

/// Build the ACK for a final response on an outgoing INVITE.
///
/// The Via branch reuses the INVITE's branch iff a negative final
/// response was observed, otherwise the ACK gets a fresh branch
/// (RFC 3261 section 17.1.1.3).
fn build_ack(rt: &Arc<Runtime>, core: &mut SessionCore, invite: TsxKey) -> Bytes {
    let (branch, cseq) = {
        let tsx = &core.transactions[invite];
        let branch = if tsx.saw_negative_final() {
            tsx.via_branch.clone()
        } else {
            generate_branch()
        };
        (branch, tsx.cseq)
    };

    let uri = remote_uri(core);
    let mut ack = SipMessage::new_request(Method::ACK, uri);
    fill_in_dialog_headers(rt, core, &mut ack, branch.clone());
    ack.headers.set(Name::CSEQ, format!("{cseq} ACK"));

    let bytes = ack.serialize();

    let ack_key = core.transactions.insert(Transaction::new(
        Direction::Outbound,
        Method::ACK,
        cseq,
        branch,
    ));
    core.transactions[ack_key].sent_bytes = Some(bytes.clone());
    core.transactions[ack_key].linked = Some(invite);
    core.transactions[ack_key].finalized = true;

    let transaction = &mut core.transactions[invite];
    transaction.acked = true;
    transaction.ack = Some(ack_key);

    bytes
}

// ==== Message builders ====

fn supports_100rel(msg: &SipMessage) -> bool {
    msg.headers
        .get_all(&Name::SUPPORTED)
        .chain(msg.headers.get_all(&Name::REQUIRE))
        .any(|v| v.as_str().to_ascii_lowercase().contains("100rel"))
}

fn requires_100rel(msg: &SipMessage) -> bool {
    msg.headers
        .get_all(&Name::REQUIRE)
        .any(|v| v.as_str().to_ascii_lowercase().contains("100rel"))
}

/// Build a response to an incoming request, copying the dialog headers
/// and stamping the To tag for anything above a 100
pub fn make_response(
    rt: &Arc<Runtime>,
    session: &Arc<Session>,
    core: &mut SessionCore,
    request: &SipMessage,
    code: StatusCode,
    reason: Option<&str>,
) -> SipMessage {
    let mut response = SipMessage::new_response(code, reason);

    for via in request.headers.get_all(&Name::VIA) {
        response.headers.insert(Name::VIA, via.clone());
    }
    for rr in request.headers.get_all(&Name::RECORD_ROUTE) {
        response.headers.insert(Name::RECORD_ROUTE, rr.clone());
    }

    if let Some(from) = request.headers.get(&Name::FROM) {
        response.headers.insert(Name::FROM, from.clone());
    }

    let mut to_value = request
        .headers
        .get(&Name::TO)
        .cloned()
        .unwrap_or_else(|| BytesStr::from_static("<sip:unknown>"));

    if session.direction == Direction::Inbound
        && code.into_u16() > 100
        && request.to_tag().is_none()
    {
        let tag = core.ensure_to_tag();
        to_value = BytesStr::from(format!("{to_value};tag={tag}"));
    }
    response.headers.insert(Name::TO, to_value);

    response
        .headers
        .insert(Name::CALL_ID, session.call_id.clone());

    if let Some(cseq) = &request.cseq {
        response.headers.insert(Name::CSEQ, cseq.to_string());
    }

    if code.into_u16() > 100
        && matches!(code.kind(), CodeKind::Provisional | CodeKind::Success)
    {
        response
            .headers
            .insert(Name::CONTACT, format!("<sip:mrf@{}>", rt.local_sent_by()));
    }

    response.headers.insert(Name::SERVER, "mrfd");

    response
}

/// Same as [`make_response`] but keyed off a stored INVITE transaction
/// instead of the live request (CANCEL teardown and rerouting paths)
fn make_response_for_invite(
    session: &Arc<Session>,
    core: &mut SessionCore,
    invite: TsxKey,
    code: StatusCode,
) -> SipMessage {
    let mut response = SipMessage::new_response(code, None);

    let (via_values, cseq) = {
        let tsx = &core.transactions[invite];
        (tsx.via_values.clone(), tsx.cseq)
    };

    for via in via_values {
        response.headers.insert(Name::VIA, via);
    }

    if let Some(from) = &core.from {
        response.headers.insert(Name::FROM, from.to_string());
    }

    if core.to_tag.is_none() {
        core.ensure_to_tag();
    }
    if let Some(to) = &core.to {
        let mut to = to.clone();
        if let Some(tag) = &core.to_tag {
            to.set_tag(tag.clone());
        }
        response.headers.insert(Name::TO, to.to_string());
    }

    response
        .headers
        .insert(Name::CALL_ID, session.call_id.clone());
    response.headers.insert(Name::CSEQ, format!("{cseq} INVITE"));
    response.headers.insert(Name::SERVER, "mrfd");

    response
}

fn remote_uri(core: &SessionCore) -> SipUri {
    if let Some(contact) = &core.remote_contact {
        return contact.uri.clone();
    }

    if let Some(from) = &core.from {
        return from.uri.clone();
    }

    SipUri::new(None, "invalid", None)
}

fn fill_in_dialog_headers(
    rt: &Arc<Runtime>,
    core: &mut SessionCore,
    msg: &mut SipMessage,
    branch: BytesStr,
) {
    let via = sip_types::header::typed::Via::new(BytesStr::from(rt.local_sent_by()), branch);
    msg.headers.insert(Name::VIA, via.to_string());

    // From is the local identity (the dialog's To plus our tag), To is
    // the remote identity
    let local = match &core.to {
        Some(to) => {
            let mut local = to.clone();
            if let Some(tag) = &core.to_tag {
                local.set_tag(tag.clone());
            }
            local.to_string()
        }
        None => format!(
            "<sip:mrf@{}>;tag={}",
            rt.local_sent_by(),
            core.ensure_to_tag()
        ),
    };
    msg.headers.insert(Name::FROM, local);

    let remote = match &core.from {
        Some(from) => from.to_string(),
        None => "<sip:unknown>".to_string(),
    };
    msg.headers.insert(Name::TO, remote);

    msg.headers.insert(Name::CALL_ID, core.call_id.clone());
    msg.headers.insert(Name::MAX_FORWARDS, "70");
    msg.headers
        .insert(Name::CONTACT, format!("<sip:mrf@{}>", rt.local_sent_by()));
}

/// Build an in-dialog request towards the remote peer, advancing our
/// CSeq counter
pub fn make_in_dialog_request(
    rt: &Arc<Runtime>,
    core: &mut SessionCore,
    method: Method,
) -> SipMessage {
    let uri = remote_uri(core);
    let mut msg = SipMessage::new_request(method.clone(), uri);

    let cseq = core.next_cseq();
    fill_in_dialog_headers(rt, core, &mut msg, generate_branch());
    msg.headers.set(Name::CSEQ, format!("{cseq} {method}"));
    msg.cseq = Some(CSeq::new(cseq, method));

    msg
}

// ==== Sending with retransmission ====

/// Send an in-dialog request and arm its retransmission timer
pub async fn send_request(
    rt: &Arc<Runtime>,
    session: &Arc<Session>,
    msg: SipMessage,
    is_probing: bool,
) -> Option<TsxKey> {
    let (bytes, target, key) = {
        let mut core = session.core.lock();
        let Some(target) = core.remote_udp else {
            tracing::warn!(call_id = %session.call_id, "no remote peer to send to");
            return None;
        };

        let cseq = msg.cseq.as_ref().map(|c| c.cseq).unwrap_or(0);
        let method = msg.method().cloned().unwrap_or(Method::OPTIONS);

        let bytes = msg.serialize();
        let key = core.transactions.insert(Transaction::outgoing(method, cseq));
        let transaction = &mut core.transactions[key];
        transaction.is_probing = is_probing;
        transaction.sent_bytes = Some(bytes.clone());
        transaction.target = Some(target);

        (bytes, target, key)
    };

    rt.sip_send(&bytes, target).await;
    spawn_request_retransmission(rt, session, key);

    Some(key)
}

/// Retransmit an outgoing request with geometric backoff until stopped
/// or the retry budget is exhausted
pub fn spawn_request_retransmission(rt: &Arc<Runtime>, session: &Arc<Session>, key: TsxKey) {
    spawn_retransmission(rt.clone(), session.clone(), key, true);
}

/// Retransmit a final response until the ACK arrives
pub fn spawn_response_retransmission(rt: &Arc<Runtime>, session: &Arc<Session>, key: TsxKey) {
    spawn_retransmission(rt.clone(), session.clone(), key, false);
}

fn spawn_retransmission(rt: Arc<Runtime>, session: Arc<Session>, key: TsxKey, is_request: bool) {
    let mut stop = {
        let mut core = session.core.lock();
        let Some(tsx) = core.transactions.get_mut(key) else {
            return;
        };
        tsx.arm_retransmission()
    };

    tokio::spawn(async move {
        let mut interval = rt.config.t1;

        for _ in 0..rt.config.retx_count {
            tokio::select! {
                biased;

                _ = &mut stop => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let (bytes, target) = {
                let core = session.core.lock();
                let Some(tsx) = core.transactions.get(key) else {
                    return;
                };
                if is_request && tsx.finalized {
                    return;
                }
                if !is_request && tsx.acked {
                    return;
                }
                (tsx.sent_bytes.clone(), tsx.target)
            };

            if let (Some(bytes), Some(target)) = (bytes, target) {
                tracing::debug!(call_id = %session.call_id, "retransmitting after {interval:?}");
                rt.sip_send(&bytes, target).await;
            }

            interval *= 2;
        }

        on_transaction_timeout(&rt, &session, key).await;
    });
}

/// Retry budget exhausted: apply the per-method timeout policy
async fn on_transaction_timeout(rt: &Arc<Runtime>, session: &Arc<Session>, key: TsxKey) {
    let (method, direction, is_probing, got_success) = {
        let core = session.core.lock();
        let Some(tsx) = core.transactions.get(key) else {
            return;
        };
        (
            tsx.method.clone(),
            tsx.direction,
            tsx.is_probing,
            tsx.responses.iter().any(|&c| (200..300).contains(&c)),
        )
    };

    tracing::warn!(call_id = %session.call_id, %method, "transaction timed out");

    if direction == Direction::Inbound {
        // a final response never got its ACK (or PRACK): give up on
        // the dialog
        session.set_state(SessionState::TimedOut);
        if method == Method::PRACK {
            reroute_linked(rt, session, StatusCode::REQUEST_TIMEOUT).await;
            session.set_state(SessionState::Failed);
        }
        rt.drop_session(session);
    } else if method == Method::OPTIONS && is_probing {
        release_call(rt, session, "Probing timed-out").await;
    } else if method == Method::OPTIONS {
        // keep-alive mode
        session.set_state(SessionState::TimedOut);
        rt.drop_session(session);
    } else if method == Method::INVITE {
        session.set_state(SessionState::TimedOut);

        if got_success {
            // the 200 made it but our ACK never got through: close the
            // leg cleanly after a short pause
            let (ack, bye, target) = {
                let mut core = session.core.lock();
                let ack = build_ack(rt, &mut core, key);
                let mut bye = make_in_dialog_request(rt, &mut core, Method::BYE);
                bye.headers.set(
                    Name::REASON,
                    format!("Q.850;cause={}", q850::NORMAL_CALL_CLEARING),
                );
                (ack, bye, core.remote_udp)
            };

            if let Some(target) = target {
                rt.sip_send(&ack, target).await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            send_request(rt, session, bye, false).await;
        } else {
            reroute_linked(rt, session, StatusCode::REQUEST_TIMEOUT).await;
        }

        rt.drop_session(session);
    } else if method == Method::CANCEL || method == Method::BYE {
        {
            let mut core = session.core.lock();
            if let Some(tsx) = core.transactions.get_mut(key) {
                tsx.finalize();
            }
        }
        session.set_state(SessionState::TimedOut);
        rt.drop_session(session);
    } else if method == Method::PRACK {
        reroute_linked(rt, session, StatusCode::REQUEST_TIMEOUT).await;
        session.set_state(SessionState::Failed);
        rt.drop_session(session);
    } else {
        release_call(rt, session, "In-dialog request timed out").await;
    }
}

// ==== Rerouting ====

/// Reroute the linked inbound leg after this leg failed: equivalent to
/// a final rejection while it is still being established, a no-op
/// otherwise
pub async fn reroute_linked(rt: &Arc<Runtime>, session: &Arc<Session>, code: StatusCode) {
    let linked = {
        let core = session.core.lock();
        core.linked_session.clone()
    };

    let Some(linked) = linked else {
        return;
    };

    let Some(linked) = rt.sessions.load(&linked) else {
        return;
    };

    reroute_request(rt, &linked, code).await;
}

pub async fn reroute_request(rt: &Arc<Runtime>, session: &Arc<Session>, code: StatusCode) {
    if !session.is_being_established() {
        return;
    }

    let invite = {
        let mut core = session.core.lock();
        core.linked_session = None;
        core.last_unacked_invite(Direction::Inbound)
    };

    let Some(invite) = invite else {
        return;
    };

    session.set_state(SessionState::BeingFailed);

    let (bytes, target) = {
        let mut core = session.core.lock();
        let mut response = make_response_for_invite(session, &mut core, invite, code);
        response.headers.set(
            Name::REASON,
            format!("Q.850;cause={}", q850::NORMAL_UNSPECIFIED),
        );
        response.headers.set(
            Name::WARNING,
            format!("399 {} \"Rerouting failed\"", rt.config.server_ipv4),
        );

        let bytes = response.serialize();
        let remote_udp = core.remote_udp;
        let transaction = &mut core.transactions[invite];
        transaction.record_response(code.into_u16());
        transaction.finalized = true;
        transaction.sent_bytes = Some(bytes.clone());
        transaction.target = remote_udp;

        (bytes, remote_udp)
    };

    if let Some(target) = target {
        rt.sip_send(&bytes, target).await;
        spawn_response_retransmission(rt, session, invite);
    }
}

// ==== Teardown and timers ====

/// Release an established call: BYE towards the peer and local cleanup
pub async fn release_call(rt: &Arc<Runtime>, session: &Arc<Session>, reason_text: &str) {
    tracing::info!(call_id = %session.call_id, "releasing call: {reason_text}");

    playback::stop_silently(session);

    if matches!(
        session.state(),
        SessionState::Established | SessionState::BeingProbed
    ) {
        session.set_state(SessionState::BeingCleared);

        let bye = {
            let mut core = session.core.lock();
            let mut bye = make_in_dialog_request(rt, &mut core, Method::BYE);
            let reason = core.reason.clone().unwrap_or_else(|| {
                BytesStr::from(format!("Q.850;cause={}", q850::NORMAL_CALL_CLEARING))
            });
            bye.headers.set(Name::REASON, reason);
            bye
        };

        send_request(rt, session, bye, false).await;
    } else {
        session.set_state(SessionState::Cleared);
        rt.drop_session(session);
    }
}

/// After a CANCEL is finalized the linked INVITE gets 20 x T1 to
/// receive its 487 before the dialog is force-finalized
fn start_cancel_aux_timer(rt: &Arc<Runtime>, session: &Arc<Session>, invite: Option<TsxKey>) {
    let Some(invite) = invite else {
        return;
    };

    let stop = {
        let mut core = session.core.lock();
        let Some(tsx) = core.transactions.get_mut(invite) else {
            return;
        };
        if tsx.finalized {
            return;
        }
        tsx.arm_cancel_aux()
    };

    let rt = rt.clone();
    let session = session.clone();
    let wait = rt.config.t1 * 20;

    tokio::spawn(async move {
        let mut stop = stop;

        tokio::select! {
            biased;

            _ = &mut stop => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let still_pending = {
            let core = session.core.lock();
            core.transactions
                .get(invite)
                .map(|tsx| !tsx.finalized)
                .unwrap_or(false)
        };

        if still_pending {
            tracing::warn!(call_id = %session.call_id, "no 487 after CANCEL, force finalizing");
            session.set_state(SessionState::Cancelled);
            rt.drop_session(&session);
        }
    });
}

/// Start the in-dialog probing ticker and the max-call-duration timer
/// once the dialog is established
pub fn start_established_timers(rt: &Arc<Runtime>, session: &Arc<Session>) {
    if rt.config.probing_sec > 0 {
        let rt = rt.clone();
        let session = session.clone();
        let mut done = session.done_signal();
        let period = Duration::from_secs(rt.config.probing_sec);

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick of a tokio interval fires immediately
            tick.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = done.changed() => return,
                    _ = tick.tick() => {}
                }

                if session.is_disposed() {
                    return;
                }

                let options = {
                    let mut core = session.core.lock();
                    make_in_dialog_request(&rt, &mut core, Method::OPTIONS)
                };

                send_request(&rt, &session, options, true).await;
            }
        });
    }

    if rt.config.max_call_duration_sec > 0 {
        let rt = rt.clone();
        let session = session.clone();
        let mut done = session.done_signal();
        let duration = Duration::from_secs(rt.config.max_call_duration_sec);

        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = done.changed() => {}
                _ = tokio::time::sleep(duration) => {
                    release_call(&rt, &session, "Max call duration reached").await;
                }
            }
        });
    }
}

/// Arm the no-18x and no-answer timers of an outbound INVITE leg:
/// a missing provisional or final answer cancels the leg with Q.850
/// cause 19 and reroutes the linked inbound leg with a 487
pub fn start_outbound_establishment_timers(
    rt: &Arc<Runtime>,
    session: &Arc<Session>,
    no_18x: Duration,
    no_answer: Duration,
) {
    let mut core = session.core.lock();

    {
        let rt = rt.clone();
        let session = session.clone();
        core.no_18x_timer = Some(timer::one_shot(no_18x, move || async move {
            cancel_unanswered_leg(&rt, &session, "No provisional response").await;
        }));
    }

    {
        let rt = rt.clone();
        let session = session.clone();
        core.no_answer_timer = Some(timer::one_shot(no_answer, move || async move {
            cancel_unanswered_leg(&rt, &session, "No answer").await;
        }));
    }
}

async fn cancel_unanswered_leg(rt: &Arc<Runtime>, session: &Arc<Session>, what: &str) {
    if !session.is_being_established() {
        return;
    }

    tracing::info!(call_id = %session.call_id, "{what}, cancelling leg");
    session.set_state(SessionState::BeingCancelled);

    let prepared = {
        let mut core = session.core.lock();

        let Some(invite) = core.last_unacked_invite(Direction::Outbound) else {
            return;
        };

        // the CANCEL copies the INVITE's CSeq number and Via branch
        let (branch, cseq) = {
            let tsx = &core.transactions[invite];
            (tsx.via_branch.clone(), tsx.cseq)
        };

        let uri = remote_uri(&core);
        let mut cancel = SipMessage::new_request(Method::CANCEL, uri);
        fill_in_dialog_headers(rt, &mut core, &mut cancel, branch);
        cancel.headers.set(Name::CSEQ, format!("{cseq} CANCEL"));
        cancel.headers.set(
            Name::REASON,
            format!("Q.850;cause={}", q850::NO_ANSWER_FROM_USER),
        );

        let bytes = cancel.serialize();
        let key = core
            .transactions
            .insert(Transaction::outgoing(Method::CANCEL, cseq));
        core.transactions[key].linked = Some(invite);
        core.transactions[key].sent_bytes = Some(bytes.clone());
        core.transactions[key].target = core.remote_udp;

        core.remote_udp.map(|target| (bytes, target, key))
    };

    if let Some((bytes, target, key)) = prepared {
        rt.sip_send(&bytes, target).await;
        spawn_request_retransmission(rt, session, key);
    }

    reroute_linked(rt, session, StatusCode::REQUEST_TERMINATED).await;
}

// ==== Dialogless helpers ====

async fn respond_dialogless(
    rt: &Arc<Runtime>,
    request: &SipMessage,
    code: StatusCode,
    src: SocketAddr,
) {
    let mut response = SipMessage::new_response(code, None);

    for via in request.headers.get_all(&Name::VIA) {
        response.headers.insert(Name::VIA, via.clone());
    }
    if let Some(from) = request.headers.get(&Name::FROM) {
        response.headers.insert(Name::FROM, from.clone());
    }
    if let Some(to) = request.headers.get(&Name::TO) {
        response.headers.insert(Name::TO, to.clone());
    }
    if let Some(call_id) = &request.call_id {
        response.headers.insert(Name::CALL_ID, call_id.clone());
    }
    if let Some(cseq) = &request.cseq {
        response.headers.insert(Name::CSEQ, cseq.to_string());
    }
    response.headers.insert(Name::SERVER, "mrfd");

    rt.sip_send(&response.serialize(), src).await;
}

/// Send the MSC response for a finished playback inside a new INFO
pub async fn send_info_response(rt: &Arc<Runtime>, session: &Arc<Session>, xml: String) {
    if session.is_disposed() {
        return;
    }

    let info = {
        let mut core = session.core.lock();
        let mut info = make_in_dialog_request(rt, &mut core, Method::INFO);
        info.body = MessageBody::single(BodyType::MscIvrXml, Bytes::from(xml));
        info
    };

    send_request(rt, session, info, false).await;
}

/// Probe a peer with a dialogless OPTIONS, creating an outbound session
/// in the probing state
pub async fn probe_peer(rt: &Arc<Runtime>, target: SocketAddr) -> Arc<Session> {
    let call_id = crate::transaction::random_call_id(&rt.config.server_ipv4.to_string());
    let session = Session::new(Direction::Outbound, call_id);
    session.set_state(SessionState::BeingProbed);
    rt.sessions.store(session.clone());

    let options = {
        let mut core = session.core.lock();
        core.remote_udp = Some(target);

        let uri = SipUri::new(None, target.ip().to_string(), Some(target.port()));
        let mut options = SipMessage::new_request(Method::OPTIONS, uri);
        let cseq = core.next_cseq();
        fill_in_dialog_headers(rt, &mut core, &mut options, generate_branch());
        options.headers.set(Name::CSEQ, format!("{cseq} OPTIONS"));
        options.cseq = Some(CSeq::new(cseq, Method::OPTIONS));
        options
    };

    send_request(rt, &session, options, true).await;

    session
}
