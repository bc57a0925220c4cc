//! End-to-end call flows against a server instance on loopback UDP.

use bytes::Bytes;
use mrfd::config::Config;
use mrfd::media::MediaRepoCollection;
use mrfd::{Runtime, server};
use rtp::{RtpHeader, TelephoneEvent};
use sip_types::{BodyType, Method, SipMessage, StatusCode};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const RECV_DEADLINE: Duration = Duration::from_secs(5);

struct TestServer {
    rt: Arc<Runtime>,
    addr: SocketAddr,
    _media_dir: PathBuf,
}

/// Spin up a server on loopback with a 0.5 s prompt named "greeting"
/// under repository "3001". Each test gets its own media port range.
async fn start_server(media_ports: (u16, u16)) -> TestServer {
    let media_dir = std::env::temp_dir().join(format!(
        "mrfd-e2e-{}-{}",
        std::process::id(),
        media_ports.0
    ));
    let _ = std::fs::remove_dir_all(&media_dir);
    std::fs::create_dir_all(&media_dir).unwrap();

    // 4000 samples of a soft square wave, half a second at 8 kHz
    let mut raw = Vec::with_capacity(8000);
    for i in 0..4000i32 {
        let sample: i16 = if (i / 20) % 2 == 0 { 6000 } else { -6000 };
        raw.extend_from_slice(&sample.to_le_bytes());
    }
    std::fs::write(media_dir.join("greeting.raw"), raw).unwrap();

    let mut config = Config {
        media_dir: media_dir.to_str().unwrap().to_string(),
        repo_name: "3001".into(),
        server_ipv4: Ipv4Addr::LOCALHOST,
        media_start_port: media_ports.0,
        media_end_port: media_ports.1,
        answer_delay: Duration::from_millis(50),
        t1: Duration::from_millis(200),
        retx_count: 3,
        workers: 2,
        ..Config::default()
    };

    let media = MediaRepoCollection::load(&config.repo_name, &config.media_dir).unwrap();

    let socket = server::bind(Ipv4Addr::LOCALHOST, 0).await.unwrap();
    let addr = socket.local_addr().unwrap();
    config.sip_udp_port = addr.port();

    let rt = Runtime::new(config, media);
    rt.set_sip_socket(socket);
    rt.start_background_tasks();
    server::start(rt.clone());

    TestServer {
        rt,
        addr,
        _media_dir: media_dir,
    }
}

struct Peer {
    sip: UdpSocket,
    media: UdpSocket,
    server: SocketAddr,
}

impl Peer {
    async fn new(server: SocketAddr) -> Self {
        Self {
            sip: UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap(),
            media: UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap(),
            server,
        }
    }

    fn media_port(&self) -> u16 {
        self.media.local_addr().unwrap().port()
    }

    async fn send(&self, text: String) {
        self.sip.send_to(text.as_bytes(), self.server).await.unwrap();
    }

    /// Receive SIP messages until one matches the predicate, skipping
    /// retransmissions and unrelated traffic
    async fn recv_matching(&self, mut pred: impl FnMut(&SipMessage) -> bool) -> SipMessage {
        let deadline = tokio::time::Instant::now() + RECV_DEADLINE;
        let mut buf = vec![0u8; 8192];

        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("timed out waiting for a matching SIP message");

            let (len, _) = timeout(remaining, self.sip.recv_from(&mut buf))
                .await
                .expect("timed out waiting for SIP traffic")
                .unwrap();

            let mut rest = Bytes::copy_from_slice(&buf[..len]);
            while !rest.is_empty() {
                let Ok((msg, remainder)) = SipMessage::parse_one(&rest) else {
                    break;
                };
                rest = remainder;

                if pred(&msg) {
                    return msg;
                }
            }
        }
    }

    async fn recv_status(&self, code: StatusCode, cseq_method: &str) -> SipMessage {
        self.recv_matching(|msg| {
            msg.status_code() == Some(code)
                && msg
                    .cseq
                    .as_ref()
                    .map(|c| c.method.to_string() == cseq_method)
                    .unwrap_or(false)
        })
        .await
    }

    fn offer_sdp(&self, extra: &str) -> String {
        format!(
            "v=0\r\n\
            o=- 1337 1 IN IP4 127.0.0.1\r\n\
            s=call\r\n\
            c=IN IP4 127.0.0.1\r\n\
            t=0 0\r\n\
            m=audio {} RTP/AVP 0 101\r\n\
            a=rtpmap:0 PCMU/8000\r\n\
            a=rtpmap:101 telephone-event/8000\r\n\
            a=fmtp:101 0-16\r\n\
            a=ptime:20\r\n{extra}",
            self.media_port()
        )
    }

    fn invite(&self, call_id: &str, sdp: &str, extra_headers: &str) -> String {
        let local = self.sip.local_addr().unwrap();

        format!(
            "INVITE sip:3001@{server} SIP/2.0\r\n\
            Via: SIP/2.0/UDP {local};branch=z9hG4bKtest{call_id}\r\n\
            Max-Forwards: 70\r\n\
            From: \"Tester\" <sip:tester@{local}>;tag=ft-{call_id}\r\n\
            To: <sip:3001@{server}>\r\n\
            Call-ID: {call_id}\r\n\
            CSeq: 1 INVITE\r\n\
            Contact: <sip:tester@{local}>\r\n\
            {extra_headers}\
            Content-Type: application/sdp\r\n\
            Content-Length: {len}\r\n\
            \r\n\
            {sdp}",
            server = self.server,
            len = sdp.len(),
        )
    }

    fn in_dialog(
        &self,
        method: &str,
        call_id: &str,
        cseq: u32,
        to_tag: &str,
        extra_headers: &str,
        body: Option<(&str, &str)>,
    ) -> String {
        let local = self.sip.local_addr().unwrap();

        let (content, content_headers) = match body {
            Some((content_type, content)) => (
                content.to_string(),
                format!(
                    "Content-Type: {content_type}\r\nContent-Length: {}\r\n",
                    content.len()
                ),
            ),
            None => (String::new(), "Content-Length: 0\r\n".to_string()),
        };

        format!(
            "{method} sip:3001@{server} SIP/2.0\r\n\
            Via: SIP/2.0/UDP {local};branch=z9hG4bK{method}{call_id}{cseq}\r\n\
            Max-Forwards: 70\r\n\
            From: \"Tester\" <sip:tester@{local}>;tag=ft-{call_id}\r\n\
            To: <sip:3001@{server}>;tag={to_tag}\r\n\
            Call-ID: {call_id}\r\n\
            CSeq: {cseq} {method}\r\n\
            {extra_headers}\
            {content_headers}\
            \r\n\
            {content}",
            server = self.server,
        )
    }

    /// 200 for a request the server sent us (INFO reports)
    async fn respond_ok(&self, request: &SipMessage) {
        let mut ok = SipMessage::new_response(StatusCode::OK, None);

        for via in request.headers.get_all(&sip_types::Name::VIA) {
            ok.headers.insert(sip_types::Name::VIA, via.clone());
        }
        if let Some(from) = request.headers.get(&sip_types::Name::FROM) {
            ok.headers.insert(sip_types::Name::FROM, from.clone());
        }
        if let Some(to) = request.headers.get(&sip_types::Name::TO) {
            ok.headers.insert(sip_types::Name::TO, to.clone());
        }
        if let Some(call_id) = &request.call_id {
            ok.headers.insert(sip_types::Name::CALL_ID, call_id.clone());
        }
        if let Some(cseq) = &request.cseq {
            ok.headers.insert(sip_types::Name::CSEQ, cseq.to_string());
        }

        self.sip
            .send_to(&ok.serialize(), self.server)
            .await
            .unwrap();
    }
}

fn to_tag_of(msg: &SipMessage) -> String {
    msg.to_tag().expect("response must carry a To tag").to_string()
}

fn answer_media_port(msg: &SipMessage) -> u16 {
    let sdp = msg.body.get(BodyType::Sdp).expect("200 must carry SDP");
    let text = std::str::from_utf8(&sdp.data).unwrap();

    let line = text
        .lines()
        .find(|line| line.starts_with("m=audio"))
        .expect("answer must contain an audio line");

    line.split_whitespace().nth(1).unwrap().parse().unwrap()
}

const PLAY_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><MediaServerControl version="1.0"><request><play><prompt><audio url="greeting"/></prompt></play></request></MediaServerControl>"#;

const PLAYCOLLECT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><MediaServerControl version="1.0"><request><playcollect barge="yes"><prompt repeat="infinite"><audio url="greeting"/></prompt></playcollect></request></MediaServerControl>"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_play_reports_timeout() {
    let server = start_server((23000, 23004)).await;
    let peer = Peer::new(server.addr).await;

    let sdp = peer.offer_sdp("");
    peer.send(peer.invite("happy-1", &sdp, "")).await;

    let ringing = peer.recv_status(StatusCode::RINGING, "INVITE").await;
    let ok = peer.recv_status(StatusCode::OK, "INVITE").await;
    assert_eq!(to_tag_of(&ringing), to_tag_of(&ok));

    let answer = ok.body.get(BodyType::Sdp).unwrap();
    let answer_text = std::str::from_utf8(&answer.data).unwrap();
    assert!(answer_text.contains("a=ptime:20"));
    assert!(answer_text.contains("a=sendrecv"));
    assert!(answer_text.contains("RTP/AVP 0 101"));

    let tag = to_tag_of(&ok);
    peer.send(peer.in_dialog("ACK", "happy-1", 1, &tag, "", None))
        .await;

    // start the prompt
    peer.send(peer.in_dialog(
        "INFO",
        "happy-1",
        2,
        &tag,
        "",
        Some(("application/msc-ivr+xml", PLAY_XML)),
    ))
    .await;
    peer.recv_status(StatusCode::OK, "INFO").await;

    // RTP pacing: mu-law frames with contiguous sequence numbers and
    // timestamps advancing one frame per packet
    let mut buf = vec![0u8; 2048];
    let mut previous: Option<RtpHeader> = None;

    for i in 0..10 {
        let (len, _) = timeout(Duration::from_secs(2), peer.media.recv_from(&mut buf))
            .await
            .expect("expected RTP audio")
            .unwrap();

        let (header, payload) = RtpHeader::parse(&buf[..len]).unwrap();
        assert_eq!(header.payload_type, 0);
        assert_eq!(payload.len(), 160);

        if i == 0 {
            assert!(header.marker, "first packet of the stream carries the marker");
        }

        if let Some(previous) = previous {
            assert_eq!(
                header.sequence_number.0,
                previous.sequence_number.0.wrapping_add(1)
            );
            assert_eq!(header.timestamp.0, previous.timestamp.0.wrapping_add(160));
            assert_eq!(header.ssrc, previous.ssrc);
        }

        previous = Some(header);
    }

    // the prompt is half a second, afterwards the server reports back
    let report = peer
        .recv_matching(|msg| msg.method() == Some(&Method::INFO))
        .await;

    let xml = report.body.get(BodyType::MscIvrXml).expect("MSC report body");
    let xml = std::str::from_utf8(&xml.data).unwrap();
    assert!(xml.contains("reason=\"timeout\""), "{xml}");
    assert!(xml.contains("request=\"play\""), "{xml}");
    assert!(xml.contains("code=\"200\""), "{xml}");

    peer.respond_ok(&report).await;

    assert_eq!(server.rt.sessions.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn barge_in_interrupts_playcollect() {
    let server = start_server((23010, 23014)).await;
    let peer = Peer::new(server.addr).await;

    let sdp = peer.offer_sdp("");
    peer.send(peer.invite("barge-1", &sdp, "")).await;

    peer.recv_status(StatusCode::RINGING, "INVITE").await;
    let ok = peer.recv_status(StatusCode::OK, "INVITE").await;
    let tag = to_tag_of(&ok);
    let server_media_port = answer_media_port(&ok);

    peer.send(peer.in_dialog("ACK", "barge-1", 1, &tag, "", None))
        .await;

    peer.send(peer.in_dialog(
        "INFO",
        "barge-1",
        2,
        &tag,
        "",
        Some(("application/msc-ivr+xml", PLAYCOLLECT_XML)),
    ))
    .await;
    peer.recv_status(StatusCode::OK, "INFO").await;

    // let the playback spin up, then press 5 via telephone-event
    tokio::time::sleep(Duration::from_millis(200)).await;

    let event = TelephoneEvent {
        event: 5,
        end: true,
        volume: 10,
        duration: 160,
    };

    let mut packet = Vec::new();
    RtpHeader {
        marker: true,
        payload_type: 101,
        sequence_number: rtp::SequenceNumber(7000),
        timestamp: rtp::RtpTimestamp(111_111),
        ssrc: rtp::Ssrc(424_242),
    }
    .write(&mut packet);
    event.write(&mut packet);

    peer.media
        .send_to(&packet, (Ipv4Addr::LOCALHOST, server_media_port))
        .await
        .unwrap();

    let report = peer
        .recv_matching(|msg| msg.method() == Some(&Method::INFO))
        .await;

    let xml = report.body.get(BodyType::MscIvrXml).expect("MSC report body");
    let xml = std::str::from_utf8(&xml.data).unwrap();
    assert!(xml.contains("reason=\"interrupted\""), "{xml}");
    assert!(xml.contains("digits=\"5\""), "{xml}");
    assert!(xml.contains("request=\"playcollect\""), "{xml}");

    peer.respond_ok(&report).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsupported_ptime_rejected_with_cause_65() {
    let server = start_server((23020, 23024)).await;
    let peer = Peer::new(server.addr).await;

    let sdp = peer.offer_sdp("").replace("a=ptime:20", "a=ptime:30");
    peer.send(peer.invite("ptime-1", &sdp, "")).await;

    let rejected = peer
        .recv_status(StatusCode::NOT_ACCEPTABLE_HERE, "INVITE")
        .await;

    let warning = rejected
        .headers
        .get(&sip_types::Name::WARNING)
        .expect("488 carries a Warning header");
    assert!(warning.as_str().contains("399"));
    assert!(warning.as_str().contains("20ms"));

    let reason = rejected
        .headers
        .get(&sip_types::Name::REASON)
        .expect("488 carries a Reason header");
    assert_eq!(reason.as_str(), "Q.850;cause=65");

    let tag = to_tag_of(&rejected);
    peer.send(peer.in_dialog("ACK", "ptime-1", 1, &tag, "", None))
        .await;

    let _ = server;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn media_pool_exhaustion_rejected_with_cause_41() {
    let server = start_server((23030, 23031)).await;
    let peer = Peer::new(server.addr).await;

    // legitimately reserve both ports of the range up front
    let _a = server.rt.ports.reserve_socket().unwrap();
    let _b = server.rt.ports.reserve_socket().unwrap();
    assert_eq!(server.rt.ports.free_count(), 0);

    let sdp = peer.offer_sdp("");
    peer.send(peer.invite("pool-1", &sdp, "")).await;

    let rejected = peer
        .recv_status(StatusCode::NOT_ACCEPTABLE_HERE, "INVITE")
        .await;

    let reason = rejected.headers.get(&sip_types::Name::REASON).unwrap();
    assert_eq!(reason.as_str(), "Q.850;cause=41");

    let tag = to_tag_of(&rejected);
    peer.send(peer.in_dialog("ACK", "pool-1", 1, &tag, "", None))
        .await;

    // no port leaked by the reject path
    assert_eq!(server.rt.ports.free_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn prack_matching_and_unexpected_prack() {
    let server = start_server((23040, 23044)).await;
    let peer = Peer::new(server.addr).await;

    let sdp = peer.offer_sdp("");
    peer.send(peer.invite("prack-1", &sdp, "Supported: 100rel\r\n"))
        .await;

    let ringing = peer.recv_status(StatusCode::RINGING, "INVITE").await;
    let require = ringing.headers.get(&sip_types::Name::REQUIRE).unwrap();
    assert!(require.as_str().contains("100rel"));

    let rseq: u32 = ringing
        .headers
        .get(&sip_types::Name::RSEQ)
        .expect("reliable 180 carries RSeq")
        .as_str()
        .trim()
        .parse()
        .unwrap();
    assert!((1..1000).contains(&rseq));

    let tag = to_tag_of(&ringing);

    // matching PRACK is accepted
    peer.send(peer.in_dialog(
        "PRACK",
        "prack-1",
        2,
        &tag,
        &format!("RAck: {rseq} 1 INVITE\r\n"),
        None,
    ))
    .await;
    peer.recv_status(StatusCode::OK, "PRACK").await;

    // a PRACK for an unknown RSeq gets a 481-class answer
    peer.send(peer.in_dialog(
        "PRACK",
        "prack-1",
        3,
        &tag,
        &format!("RAck: {} 1 INVITE\r\n", rseq + 5),
        None,
    ))
    .await;
    peer.recv_status(StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST, "PRACK")
        .await;

    // the call still answers normally
    let ok = peer.recv_status(StatusCode::OK, "INVITE").await;
    peer.send(peer.in_dialog("ACK", "prack-1", 1, &to_tag_of(&ok), "", None))
        .await;

    let _ = server;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_cancel_does_not_terminate_answered_call() {
    let server = start_server((23050, 23054)).await;
    let peer = Peer::new(server.addr).await;

    let sdp = peer.offer_sdp("");
    peer.send(peer.invite("race-1", &sdp, "")).await;

    peer.recv_status(StatusCode::RINGING, "INVITE").await;
    let ok = peer.recv_status(StatusCode::OK, "INVITE").await;
    let tag = to_tag_of(&ok);

    // CANCEL arriving after the 200 must not cancel; the CANCEL itself
    // is answered but no 487 follows
    let local = peer.sip.local_addr().unwrap();
    let cancel = format!(
        "CANCEL sip:3001@{server} SIP/2.0\r\n\
        Via: SIP/2.0/UDP {local};branch=z9hG4bKtestrace-1\r\n\
        Max-Forwards: 70\r\n\
        From: \"Tester\" <sip:tester@{local}>;tag=ft-race-1\r\n\
        To: <sip:3001@{server}>\r\n\
        Call-ID: race-1\r\n\
        CSeq: 1 CANCEL\r\n\
        Content-Length: 0\r\n\
        \r\n",
        server = peer.server,
    );
    peer.send(cancel).await;
    peer.recv_status(StatusCode::OK, "CANCEL").await;

    let got_487 = timeout(Duration::from_millis(600), async {
        peer.recv_matching(|msg| msg.status_code() == Some(StatusCode::REQUEST_TERMINATED))
            .await
    })
    .await;
    assert!(got_487.is_err(), "a late CANCEL must not produce a 487");

    // the dialog is still alive: complete it and tear it down
    peer.send(peer.in_dialog("ACK", "race-1", 1, &tag, "", None))
        .await;
    peer.send(peer.in_dialog("BYE", "race-1", 2, &tag, "", None))
        .await;
    peer.recv_status(StatusCode::OK, "BYE").await;

    let _ = server;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_repository_rejected_with_404() {
    let server = start_server((23060, 23064)).await;
    let peer = Peer::new(server.addr).await;

    let sdp = peer.offer_sdp("");
    let local = peer.sip.local_addr().unwrap();

    // called user part 9999 selects no repository
    let invite = format!(
        "INVITE sip:9999@{server} SIP/2.0\r\n\
        Via: SIP/2.0/UDP {local};branch=z9hG4bKtestnorepo\r\n\
        Max-Forwards: 70\r\n\
        From: <sip:tester@{local}>;tag=ft-norepo\r\n\
        To: <sip:9999@{server}>\r\n\
        Call-ID: norepo-1\r\n\
        CSeq: 1 INVITE\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: {len}\r\n\
        \r\n\
        {sdp}",
        server = peer.server,
        len = sdp.len(),
    );
    peer.send(invite).await;

    let rejected = peer.recv_status(StatusCode::NOT_FOUND, "INVITE").await;
    let reason = rejected.headers.get(&sip_types::Name::REASON).unwrap();
    assert_eq!(reason.as_str(), "Q.850;cause=1");

    let tag = to_tag_of(&rejected);
    peer.send(peer.in_dialog("ACK", "norepo-1", 1, &tag, "", None))
        .await;

    let _ = server;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bye_tears_down_and_registry_shrinks() {
    let server = start_server((23070, 23074)).await;
    let peer = Peer::new(server.addr).await;

    let sdp = peer.offer_sdp("");
    peer.send(peer.invite("bye-1", &sdp, "")).await;

    peer.recv_status(StatusCode::RINGING, "INVITE").await;
    let ok = peer.recv_status(StatusCode::OK, "INVITE").await;
    let tag = to_tag_of(&ok);

    peer.send(peer.in_dialog("ACK", "bye-1", 1, &tag, "", None))
        .await;
    assert_eq!(server.rt.sessions.len(), 1);

    peer.send(peer.in_dialog("BYE", "bye-1", 2, &tag, "", None))
        .await;
    peer.recv_status(StatusCode::OK, "BYE").await;

    // the registry deletes after the drop delay
    tokio::time::sleep(mrfd::runtime::SESSION_DROP_DELAY + Duration::from_millis(500)).await;
    assert_eq!(server.rt.sessions.len(), 0);

    // the media port returned to the pool
    assert_eq!(server.rt.ports.free_count(), 5);
}
