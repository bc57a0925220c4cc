//! Per-session RTP receive task: source filtering and the two DTMF
//! detection paths (RFC 4733 telephone-event, in-band Goertzel).

use crate::runtime::Runtime;
use crate::session::Session;
use codec::AudioDecoder;
use dtmf::DtmfDetector;
use rtp::{RtpHeader, SAMPLES_PER_FRAME, TELEPHONE_EVENT_LEN, TelephoneEvent};
use std::sync::Arc;

pub fn spawn(rt: Arc<Runtime>, session: Arc<Session>) {
    tokio::spawn(run(rt, session));
}

async fn run(rt: Arc<Runtime>, session: Arc<Session>) {
    let Some(socket) = session.media_socket.lock().clone() else {
        return;
    };

    let mut done = session.done_signal();
    let mut detector = DtmfDetector::new();

    // in-band collection starts at a marker and buffers a fixed number
    // of frames before decoding
    let mut collecting = false;
    let mut collected: Vec<u8> = Vec::with_capacity(
        rt.config.dtmf_packets_count * SAMPLES_PER_FRAME,
    );

    // repeated telephone-events with the same timestamp denote the same
    // key press
    let mut last_event_ts: Option<u32> = None;

    let mut buffer = rt.buffers.get_rtp_rx();

    loop {
        let (len, src) = tokio::select! {
            biased;

            _ = done.changed() => break,
            received = socket.recv_from(&mut buffer) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::debug!(call_id = %session.call_id, "media recv error: {e}");
                    continue;
                }
            },
        };

        let (remote, telephone_event_pt, codec) = {
            let media = session.media.lock();
            (media.remote_rtp, media.telephone_event_pt, media.codec)
        };

        if remote != Some(src) {
            tracing::debug!(call_id = %session.call_id, %src, "RTP from unexpected source dropped");
            continue;
        }

        let Ok((header, payload)) = RtpHeader::parse(&buffer[..len]) else {
            continue;
        };

        if let Some(te_pt) = telephone_event_pt {
            if header.payload_type != te_pt || payload.len() != TELEPHONE_EVENT_LEN {
                continue;
            }

            let Some(event) = TelephoneEvent::parse(payload) else {
                continue;
            };

            if last_event_ts == Some(header.timestamp.0) {
                continue;
            }
            last_event_ts = Some(header.timestamp.0);

            if let Some(digit) = event.digit() {
                deliver(&session, digit);
            }
        } else {
            if payload.len() != SAMPLES_PER_FRAME {
                continue;
            }

            if header.marker {
                collecting = true;
                collected.clear();
            }

            if !collecting {
                continue;
            }

            collected.extend_from_slice(payload);

            if collected.len() >= rt.config.dtmf_packets_count * SAMPLES_PER_FRAME {
                let mut decoder = AudioDecoder::new(codec);
                let mut pcm = Vec::with_capacity(collected.len());
                decoder.decode(&collected, &mut pcm);

                for digit in detector.detect(&pcm) {
                    deliver(&session, digit);
                }

                collected.clear();
            }
        }
    }

    rt.buffers.put_rtp_rx(buffer);
}

fn deliver(session: &Arc<Session>, digit: char) {
    tracing::info!(call_id = %session.call_id, %digit, "DTMF digit detected");

    if session.collect_digit(digit) {
        tracing::debug!(call_id = %session.call_id, "barge-in stopped playback");
    }
}
