//! SIP UDP server: a single reader task feeding a bounded queue drained
//! by a worker pool.

use crate::dialog;
use crate::pool::SIP_RX_BUFFER_SIZE;
use crate::runtime::Runtime;
use bytes::Bytes;
use futures::FutureExt;
use sip_types::SipMessage;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// One received datagram on its way to a worker
pub struct Packet {
    pub data: Vec<u8>,
    pub len: usize,
    pub src: SocketAddr,
}

/// Bind the SIP socket. On failure the caller may retry with an
/// auto-picked address.
pub async fn bind(ip: Ipv4Addr, port: u16) -> std::io::Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(ip, port))).await?;
    let bound = socket.local_addr()?;

    tracing::info!("bound SIP UDP to {bound}");

    Ok(Arc::new(socket))
}

/// Spawn the reader task and the worker pool
pub fn start(rt: Arc<Runtime>) {
    let (tx, rx) = mpsc::channel::<Packet>(rt.config.queue_capacity);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    tokio::spawn(reader(rt.clone(), tx));

    for worker_id in 0..rt.config.workers.max(1) {
        tokio::spawn(worker(rt.clone(), rx.clone(), worker_id));
    }
}

async fn reader(rt: Arc<Runtime>, tx: mpsc::Sender<Packet>) {
    let socket = rt.sip_socket();

    loop {
        let mut data = rt.buffers.get_sip_rx();
        data.resize(SIP_RX_BUFFER_SIZE, 0);

        match socket.recv_from(&mut data).await {
            Ok((len, src)) => {
                if tx.send(Packet { data, len, src }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!("SIP recv error: {e}");
                rt.buffers.put_sip_rx(data);
            }
        }
    }
}

async fn worker(
    rt: Arc<Runtime>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Packet>>>,
    worker_id: usize,
) {
    loop {
        let packet = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };

        let Some(packet) = packet else {
            return;
        };

        // a panic in a handler abandons the packet, never the worker
        let result = AssertUnwindSafe(handle_packet(&rt, &packet))
            .catch_unwind()
            .await;

        if let Err(panic) = result {
            let what = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(worker_id, src = %packet.src, "handler panicked: {what}");
        }

        rt.buffers.put_sip_rx(packet.data);
    }
}

/// Parse all PDUs out of one datagram (peers may concatenate messages)
/// and route them through the dialog layer in arrival order
async fn handle_packet(rt: &Arc<Runtime>, packet: &Packet) {
    let mut remainder = Bytes::copy_from_slice(&packet.data[..packet.len]);

    while !remainder.is_empty() {
        // stray line folding between PDUs
        if remainder.iter().all(|b| b.is_ascii_whitespace()) {
            return;
        }

        match SipMessage::parse_one(&remainder) {
            Ok((msg, rest)) => {
                dialog::handle_message(rt, msg, packet.src).await;
                remainder = rest;
            }
            Err(e) => {
                tracing::warn!(src = %packet.src, "dropping unparsable PDU: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn bind_on_loopback() {
        let socket = bind(Ipv4Addr::LOCALHOST, 0).await.unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }
}
