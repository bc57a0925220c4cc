//! SDP offer validation and answer construction

use crate::error::{Reject, q850};
use crate::session::SessionCore;
use bytesstr::BytesStr;
use codec::Codec;
use rtp::{RtpTimestamp, SequenceNumber, Ssrc};
use sdp_types::{
    Connection, Direction as SdpDirection, Fmtp, Media, MediaDescription, MediaType, Origin,
    RtpMap, SessionDescription, TaggedAddress, TransportProtocol,
};
use sha2::{Digest, Sha256};
use sip_types::StatusCode;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Result of validating an SDP offer against the fixed media profile
#[derive(Debug, Clone)]
pub struct NegotiatedMedia {
    /// Remote RTP endpoint parsed from the accepted stream
    pub remote_rtp: SocketAddr,

    pub codec: Codec,
    pub payload_type: u8,

    /// Peer's RFC 4733 payload type when telephone-event was offered
    pub telephone_event_pt: Option<u8>,

    /// Offer puts the stream on hold (sendonly/inactive or a zero
    /// connection address)
    pub hold: bool,

    /// Index of the accepted m= line; every other line is rejected
    pub accepted_index: usize,

    /// Direction of the accepted stream for answer shaping
    pub offered_direction: SdpDirection,
}

fn reject(code: StatusCode, cause: u16, warning: &'static str) -> Reject {
    Reject::new(code, cause, warning)
}

/// Apply the negotiation rules to an offer.
///
/// The caller has already ensured an SDP part exists, and reserves the
/// local media port afterwards.
pub fn negotiate(offer: &SessionDescription) -> Result<NegotiatedMedia, Reject> {
    // pick the first usable audio stream
    let mut accepted = None;

    for (index, media) in offer.media_descriptions.iter().enumerate() {
        if media.media.media_type != MediaType::Audio
            || media.media.port == 0
            || media.media.proto != TransportProtocol::RtpAvp
        {
            continue;
        }

        if connection_of(offer, media).is_none() {
            continue;
        }

        accepted = Some((index, media));
        break;
    }

    let Some((accepted_index, media)) = accepted else {
        // distinguish "no audio stream at all" from "stream without a
        // usable connection address"
        let has_audio_line = offer.media_descriptions.iter().any(|media| {
            media.media.media_type == MediaType::Audio
                && media.media.port != 0
                && media.media.proto == TransportProtocol::RtpAvp
        });

        return Err(if has_audio_line {
            reject(
                StatusCode::NOT_ACCEPTABLE_HERE,
                q850::MANDATORY_IE_MISSING,
                "No usable connection address",
            )
        } else {
            reject(
                StatusCode::NOT_ACCEPTABLE_HERE,
                q850::RESOURCE_UNAVAILABLE,
                "No supported audio stream",
            )
        });
    };

    // first format that is mono, 8 kHz and within the supported set
    let mut chosen = None;
    for &pt in &media.media.fmts {
        let Some(codec) = Codec::from_payload_type(pt) else {
            continue;
        };

        if let Some(map) = media.rtpmap_for(pt) {
            if map.channels() != 1 || map.clock_rate != 8000 {
                continue;
            }
            if !map.is_encoding(codec.name()) {
                continue;
            }
        }

        chosen = Some((codec, pt));
        break;
    }

    let Some((codec, payload_type)) = chosen else {
        return Err(reject(
            StatusCode::NOT_ACCEPTABLE_HERE,
            q850::INCOMPATIBLE_DESTINATION,
            "No supported audio codec",
        ));
    };

    let telephone_event_pt = media
        .rtpmap
        .iter()
        .find(|map| map.is_encoding("telephone-event"))
        .map(|map| map.payload);

    // packetization is fixed at 20 ms
    let ptime = media.ptime.or(offer.ptime).unwrap_or(20);
    if ptime != 20 {
        return Err(reject(
            StatusCode::NOT_ACCEPTABLE_HERE,
            q850::BEARER_CAPABILITY_NOT_IMPLEMENTED,
            "Packetization other than 20ms not supported",
        ));
    }

    let connection = connection_of(offer, media).expect("checked above");
    let Some(ip) = connection.ipv4() else {
        return Err(reject(
            StatusCode::NOT_ACCEPTABLE_HERE,
            q850::CHANNEL_UNACCEPTABLE,
            "Cannot parse remote media address",
        ));
    };

    let offered_direction = media
        .direction
        .or(offer.direction)
        .unwrap_or(SdpDirection::SendRecv);

    let hold = offered_direction.is_hold() || connection.is_unspecified();

    Ok(NegotiatedMedia {
        remote_rtp: SocketAddr::V4(SocketAddrV4::new(ip, media.media.port)),
        codec,
        payload_type,
        telephone_event_pt,
        hold,
        accepted_index,
        offered_direction,
    })
}

fn connection_of<'o>(
    offer: &'o SessionDescription,
    media: &'o MediaDescription,
) -> Option<&'o Connection> {
    // a media-level connection must be a literal IPv4 address, while any
    // session-level connection counts as usable here; rule 6 rejects it
    // later if the address cannot be parsed
    media
        .connection
        .as_ref()
        .filter(|conn| conn.ipv4().is_some())
        .or(offer.connection.as_ref())
}

/// Initialize the per-dialog RTP and SDP identifiers on the first
/// successful negotiation
pub fn initial_rtp_state() -> (Ssrc, SequenceNumber, RtpTimestamp) {
    (
        Ssrc(rand::random_range(2000..9_000_000)),
        SequenceNumber(rand::random_range(1000..2000)),
        RtpTimestamp(0),
    )
}

pub fn initial_sdp_ids() -> (u64, u64) {
    (rand::random_range(1000..9000), 1)
}

/// Build the answer mirroring the offer's m= line ordering: the
/// accepted line carries the chosen format (plus telephone-event when
/// present), everything else is rejected with port zero.
pub fn build_answer(
    offer: &SessionDescription,
    negotiated: &NegotiatedMedia,
    local_ip: Ipv4Addr,
    local_port: u16,
    session_id: u64,
    session_version: u64,
) -> SessionDescription {
    let mut media_descriptions = Vec::with_capacity(offer.media_descriptions.len());

    for (index, offered) in offer.media_descriptions.iter().enumerate() {
        if index != negotiated.accepted_index {
            media_descriptions.push(offered.rejected());
            continue;
        }

        let mut fmts = vec![negotiated.payload_type];
        if let Some(te) = negotiated.telephone_event_pt {
            fmts.push(te);
        }

        let mut description = MediaDescription::new(Media {
            media_type: MediaType::Audio,
            port: local_port,
            ports_num: None,
            proto: TransportProtocol::RtpAvp,
            fmts,
        });

        description.rtpmap.push(RtpMap {
            payload: negotiated.payload_type,
            encoding: BytesStr::from_static(negotiated.codec.name()),
            clock_rate: negotiated.codec.clock_rate(),
            params: None,
        });

        if let Some(te) = negotiated.telephone_event_pt {
            description.rtpmap.push(RtpMap {
                payload: te,
                encoding: BytesStr::from_static("telephone-event"),
                clock_rate: 8000,
                params: None,
            });
            description.fmtp.push(Fmtp {
                format: te,
                params: BytesStr::from_static("0-16"),
            });
        }

        description.ptime = Some(20);
        description.direction = Some(negotiated.offered_direction.flipped());

        media_descriptions.push(description);
    }

    SessionDescription {
        origin: Origin {
            username: BytesStr::from_static("-"),
            session_id: session_id.to_string().into(),
            session_version: session_version.to_string().into(),
            address: TaggedAddress::Ip4(local_ip),
        },
        name: BytesStr::from_static("mrf"),
        connection: Some(Connection {
            address: TaggedAddress::Ip4(local_ip),
        }),
        direction: None,
        ptime: None,
        attributes: Vec::new(),
        media_descriptions,
    }
}

/// Emit the answer, bumping the o= version when the body changed since
/// the last SDP sent on this dialog (compared by SHA-256)
pub fn finalize_answer(core: &mut SessionCore, mut answer: SessionDescription) -> String {
    answer.origin.session_id = core.sdp_session_id.to_string().into();
    answer.origin.session_version = core.sdp_session_version.to_string().into();

    let emitted = answer.to_string();
    let hash: [u8; 32] = Sha256::digest(emitted.as_bytes()).into();

    match core.sdp_hash {
        None => {
            core.sdp_hash = Some(hash);
            emitted
        }
        Some(previous) if previous == hash => emitted,
        Some(_) => {
            core.sdp_session_version += 1;
            answer.origin.session_version = core.sdp_session_version.to_string().into();

            let emitted = answer.to_string();
            core.sdp_hash = Some(Sha256::digest(emitted.as_bytes()).into());
            emitted
        }
    }
}


// ==== Offer handling flow ====

use crate::dialog;
use crate::error::Reject as RejectTuple;
use crate::runtime::Runtime;
use crate::rtp_rx;
use crate::session::Session;
use crate::transaction::Transaction;
use sip_types::{BodyType, MessageBody, Name, SipMessage};
use std::sync::Arc;

/// Drive an INVITE (or re-INVITE) carrying an SDP offer through
/// validation, port reservation and the answer flow.
///
/// An initial INVITE gets a 180 (reliably when the peer supports
/// 100rel) followed by a 200 with the answer after the configured
/// delay; a CANCEL winning the race suppresses the 200. A re-INVITE is
/// answered with an immediate 200.
pub async fn handle_offer(
    rt: &Arc<Runtime>,
    session: &Arc<Session>,
    msg: SipMessage,
    src: std::net::SocketAddr,
    is_reinvite: bool,
) {
    // the body must include a decodable SDP part
    let offer = msg
        .body
        .get(BodyType::Sdp)
        .and_then(|part| std::str::from_utf8(&part.data).ok())
        .map(BytesStr::from)
        .and_then(|text| SessionDescription::parse(&text).ok());

    let Some(offer) = offer else {
        dialog::reject_invite(
            rt,
            session,
            &msg,
            src,
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            q850::BEARER_CAPABILITY_NOT_IMPLEMENTED,
            "Not supported SDP or delayed offer",
        )
        .await;
        return;
    };

    // the called user part must select a loaded prompt repository
    if !is_reinvite {
        let repo_known = session
            .core
            .lock()
            .repo_id
            .as_ref()
            .map(|repo| rt.media.get_repo(repo).is_some())
            .unwrap_or(false);

        if !repo_known {
            dialog::reject_invite(
                rt,
                session,
                &msg,
                src,
                StatusCode::NOT_FOUND,
                q850::UNALLOCATED_NUMBER,
                "MRF Repository not found",
            )
            .await;
            return;
        }
    }

    let negotiated = match negotiate(&offer) {
        Ok(negotiated) => negotiated,
        Err(RejectTuple {
            code,
            cause,
            warning,
        }) => {
            dialog::reject_invite(rt, session, &msg, src, code, cause, warning).await;
            return;
        }
    };

    // reserve a local media port once per session
    let needs_socket = session.media_socket.lock().is_none();
    if needs_socket {
        match rt.ports.reserve_socket() {
            Some((socket, port)) => {
                *session.media_socket.lock() = Some(Arc::new(socket));
                session.media.lock().local_port = port;
            }
            None => {
                dialog::reject_invite(
                    rt,
                    session,
                    &msg,
                    src,
                    StatusCode::NOT_ACCEPTABLE_HERE,
                    q850::TEMPORARY_FAILURE,
                    "No media ports available",
                )
                .await;
                return;
            }
        }
    }

    // apply the negotiation result to the media state
    let local_port = {
        let mut core = session.core.lock();

        let first_negotiation = core.sdp_session_id == 0;
        if first_negotiation {
            let (session_id, version) = initial_sdp_ids();
            core.sdp_session_id = session_id;
            core.sdp_session_version = version;
        }

        let mut media = session.media.lock();
        media.remote_rtp = Some(negotiated.remote_rtp);
        media.codec = negotiated.codec;
        media.payload_type = negotiated.payload_type;
        media.telephone_event_pt = negotiated.telephone_event_pt;
        media.held = negotiated.hold;

        if first_negotiation {
            let (ssrc, sequence_number, timestamp) = initial_rtp_state();
            media.ssrc = ssrc;
            media.sequence_number = sequence_number;
            media.timestamp = timestamp;
        }

        media.local_port
    };

    let answer_body = {
        let mut core = session.core.lock();
        let answer = build_answer(
            &offer,
            &negotiated,
            rt.config.server_ipv4,
            local_port,
            core.sdp_session_id,
            core.sdp_session_version,
        );
        finalize_answer(&mut core, answer)
    };

    if is_reinvite {
        let (bytes, tsx) = {
            let mut core = session.core.lock();
            let tsx = dialog::open_incoming_tsx(&mut core, &msg);

            let mut ok =
                dialog::make_response(rt, session, &mut core, &msg, StatusCode::OK, None);
            ok.body = MessageBody::single(BodyType::Sdp, answer_body.into_bytes());

            let bytes = ok.serialize();
            let transaction = &mut core.transactions[tsx];
            transaction.record_response(StatusCode::OK.into_u16());
            transaction.finalized = true;
            transaction.sent_bytes = Some(bytes.clone());
            transaction.target = Some(src);

            (bytes, tsx)
        };

        rt.sip_send(&bytes, src).await;
        dialog::spawn_response_retransmission(rt, session, tsx);
        return;
    }

    let invite_tsx = {
        let mut core = session.core.lock();
        dialog::open_incoming_tsx(&mut core, &msg)
    };

    // the media socket is live from here on
    rtp_rx::spawn(rt.clone(), session.clone());

    // 180 Ringing, reliably when the peer supports 100rel
    let reliable = session.core.lock().peer_supports_100rel;
    if reliable {
        let (bytes, awaited) = {
            let mut core = session.core.lock();
            let rseq = core.next_rseq();
            let cseq = msg.cseq.as_ref().map(|c| c.cseq).unwrap_or(0);

            let mut ringing =
                dialog::make_response(rt, session, &mut core, &msg, StatusCode::RINGING, None);
            ringing.headers.set(Name::REQUIRE, "100rel");
            ringing.headers.set(Name::RSEQ, rseq.to_string());

            let bytes = ringing.serialize();
            let awaited = core.transactions.insert(Transaction::awaited_prack(rseq, cseq));
            core.transactions[awaited].sent_bytes = Some(bytes.clone());
            core.transactions[awaited].target = Some(src);

            (bytes, awaited)
        };

        rt.sip_send(&bytes, src).await;
        dialog::spawn_request_retransmission(rt, session, awaited);
    } else {
        let bytes = {
            let mut core = session.core.lock();
            dialog::make_response(rt, session, &mut core, &msg, StatusCode::RINGING, None)
                .serialize()
        };
        rt.sip_send(&bytes, src).await;
    }

    // 200 with the answer after a small delay, suppressed when a CANCEL
    // wins the race
    let rt = rt.clone();
    let session = session.clone();
    let delay = rt.config.answer_delay;

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        if session.is_disposed()
            || session
                .answer_cancelled
                .load(std::sync::atomic::Ordering::Acquire)
        {
            tracing::debug!(call_id = %session.call_id, "answer suppressed after cancel");
            return;
        }

        let bytes = {
            let mut core = session.core.lock();

            if core
                .transactions
                .get(invite_tsx)
                .map(|tsx| tsx.finalized)
                .unwrap_or(true)
            {
                return;
            }

            let mut ok =
                dialog::make_response(&rt, &session, &mut core, &msg, StatusCode::OK, None);
            ok.headers.set(Name::ALLOW, "INVITE, ACK, CANCEL, BYE, OPTIONS, PRACK, INFO");
            ok.body = MessageBody::single(BodyType::Sdp, answer_body.into_bytes());

            let bytes = ok.serialize();
            let transaction = &mut core.transactions[invite_tsx];
            transaction.record_response(StatusCode::OK.into_u16());
            transaction.finalized = true;
            transaction.sent_bytes = Some(bytes.clone());
            transaction.target = Some(src);

            bytes
        };

        rt.sip_send(&bytes, src).await;
        dialog::spawn_response_retransmission(&rt, &session, invite_tsx);
    });
}
