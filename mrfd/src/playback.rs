//! Prompt playback: the 20 ms RTP transmit loop and its controller.
//!
//! One playback task exists per running prompt request. It is stopped
//! through a bounded channel where `true` means "interrupted by an
//! external event" (barge-in) and `false` tears the playback down
//! silently (replaced by a new request, or dialog teardown).

use crate::dialog;
use crate::msc::{self, MscRequest, PlayReason};
use crate::runtime::Runtime;
use crate::session::Session;
use codec::AudioEncoder;
use rtp::{HEADER_LEN, RtpHeader, SAMPLES_PER_FRAME};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;

/// Packetization interval
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Stop a running playback without emitting a report
pub fn stop_silently(session: &Arc<Session>) {
    if let Some(stop) = session.playback_stop.lock().take() {
        let _ = stop.try_send(false);
    }
}

/// Start a playback for a parsed XML request, replacing any running one
pub fn start(rt: Arc<Runtime>, session: Arc<Session>, request: MscRequest) {
    stop_silently(&session);

    let (stop_tx, stop_rx) = mpsc::channel(1);
    *session.playback_stop.lock() = Some(stop_tx);

    session
        .barge_enabled
        .store(request.barge, Ordering::Release);
    *session.last_dtmf.lock() = None;

    tokio::spawn(run(rt, session, request, stop_rx));
}

enum TxEnd {
    Completed,
    Interrupted,
    Aborted,
}

async fn run(
    rt: Arc<Runtime>,
    session: Arc<Session>,
    request: MscRequest,
    mut stop_rx: mpsc::Receiver<bool>,
) {
    let Some(repo) = session.core.lock().repo_id.clone() else {
        tracing::warn!(call_id = %session.call_id, "playback without repository");
        return;
    };

    let Some(socket) = session.media_socket.lock().clone() else {
        tracing::warn!(call_id = %session.call_id, "playback without media socket");
        return;
    };

    let mut ticks: u64 = 0;
    let mut end = TxEnd::Completed;

    'playback: loop {
        let mut played_any = false;

        for url in &request.audios {
            let Some(pcm) = rt.media.get(&repo, url) else {
                tracing::warn!(call_id = %session.call_id, %repo, %url, "audio not found, skipped");
                continue;
            };

            played_any = true;

            match transmit_prompt(&rt, &session, &socket, &pcm, &mut stop_rx, &mut ticks).await {
                TxEnd::Completed => {}
                other => {
                    end = other;
                    break 'playback;
                }
            }
        }

        if !request.repeat_infinite || !played_any || session.is_disposed() {
            break;
        }
    }

    session.barge_enabled.store(false, Ordering::Release);

    let reason = match end {
        TxEnd::Completed => PlayReason::Timeout,
        TxEnd::Interrupted => PlayReason::Interrupted,
        TxEnd::Aborted => return,
    };

    let digits = match reason {
        PlayReason::Interrupted => *session.last_dtmf.lock(),
        PlayReason::Timeout => None,
    };

    let duration_ms = ticks * 20;
    let xml = msc::build_response(request.kind, reason, duration_ms, duration_ms, digits);

    dialog::send_info_response(&rt, &session, xml).await;
}

/// Pace one prompt onto the wire in 20 ms frames.
///
/// Every tick advances the RTP timestamp by one frame and the sequence
/// number by one; the tail frame is padded with the codec's silence
/// byte. A held call skips the socket write but keeps the counters and
/// the playback position advancing; the marker bit re-engages on the
/// first packet after the hold ends. A change of the negotiated payload
/// type restarts the loop with the new codec at the same position.
async fn transmit_prompt(
    rt: &Arc<Runtime>,
    session: &Arc<Session>,
    socket: &Arc<tokio::net::UdpSocket>,
    pcm: &[i16],
    stop_rx: &mut mpsc::Receiver<bool>,
    ticks: &mut u64,
) -> TxEnd {
    // all supported codecs emit one byte per 8 kHz sample, so the byte
    // offset survives a codec restart unchanged
    let mut offset = 0usize;

    loop {
        let (codec, payload_type) = {
            let media = session.media.lock();
            (media.codec, media.payload_type)
        };

        let mut encoder = AudioEncoder::new(codec);
        let mut encoded = Vec::with_capacity(pcm.len());
        encoder.encode(pcm, &mut encoded);

        let silence = codec.silence();
        let mut first_packet = true;

        let mut ticker = tokio::time::interval(FRAME_DURATION);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                stop = stop_rx.recv() => {
                    return match stop {
                        Some(true) => TxEnd::Interrupted,
                        Some(false) | None => TxEnd::Aborted,
                    };
                }
                _ = ticker.tick() => {}
            }

            let (held, remote, header) = {
                let mut media = session.media.lock();

                if media.payload_type != payload_type {
                    // renegotiated mid-playback, restart with the new codec
                    break;
                }

                media.timestamp.advance_frame();
                let sequence_number = media.sequence_number.increase_one();

                (
                    media.held,
                    media.remote_rtp,
                    RtpHeader {
                        marker: first_packet,
                        payload_type,
                        sequence_number,
                        timestamp: media.timestamp,
                        ssrc: media.ssrc,
                    },
                )
            };

            let mut frame = rt.buffers.get_rtp_tx();
            header.write(&mut frame);

            let end = offset + SAMPLES_PER_FRAME;
            let last = if end <= encoded.len() {
                frame.extend_from_slice(&encoded[offset..end]);
                false
            } else {
                frame.extend_from_slice(&encoded[offset.min(encoded.len())..]);
                frame.resize(HEADER_LEN + SAMPLES_PER_FRAME, silence);
                true
            };
            offset = end;
            *ticks += 1;

            if held {
                // re-engage with a marker once transmission resumes
                first_packet = true;
            } else if let Some(remote) = remote {
                if let Err(e) = socket.send_to(&frame, remote).await {
                    tracing::warn!(call_id = %session.call_id, "RTP send failed: {e}");
                }
                first_packet = false;
            }

            rt.buffers.put_rtp_tx(frame);

            if last {
                return TxEnd::Completed;
            }
        }
    }
}
