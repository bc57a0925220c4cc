use crate::config::Config;
use crate::limiter::CallLimiter;
use crate::media::MediaRepoCollection;
use crate::metrics::Metrics;
use crate::pool::BufferPool;
use crate::ports::MediaPortPool;
use crate::registry::SessionRegistry;
use crate::session::Session;
use bytesstr::BytesStr;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Delay between final session state and registry removal, so late
/// retransmissions still find the dialog
pub const SESSION_DROP_DELAY: Duration = Duration::from_secs(2);

/// Shared state handed to every component instead of process globals
pub struct Runtime {
    pub config: Config,
    pub metrics: Metrics,
    pub limiter: Arc<CallLimiter>,
    pub sessions: SessionRegistry,
    pub ports: Arc<MediaPortPool>,
    pub media: MediaRepoCollection,
    pub buffers: BufferPool,

    sip_socket: OnceLock<Arc<UdpSocket>>,
}

impl Runtime {
    pub fn new(config: Config, media: MediaRepoCollection) -> Arc<Self> {
        let metrics = Metrics::new("mrf");
        let limiter = CallLimiter::new(config.rate_limit);
        let sessions = SessionRegistry::new(limiter.clone(), metrics.clone());
        let ports = MediaPortPool::new(
            config.server_ipv4,
            config.media_start_port,
            config.media_end_port,
        );

        Arc::new(Self {
            config,
            metrics,
            limiter,
            sessions,
            ports,
            media,
            buffers: BufferPool::new(),
            sip_socket: OnceLock::new(),
        })
    }

    /// Spawn the background housekeeping tasks (limiter tick, port
    /// reclaim)
    pub fn start_background_tasks(self: &Arc<Self>) {
        self.limiter.start(self.metrics.clone());
        self.ports.start_reclaim();
    }

    pub fn set_sip_socket(&self, socket: Arc<UdpSocket>) {
        let _ = self.sip_socket.set(socket);
    }

    pub fn sip_socket(&self) -> Arc<UdpSocket> {
        self.sip_socket
            .get()
            .expect("sip socket is set during startup")
            .clone()
    }

    /// Stateless UDP send; transport errors are logged and left to the
    /// retransmission layer
    pub async fn sip_send(&self, bytes: &[u8], target: SocketAddr) {
        if let Err(e) = self.sip_socket().send_to(bytes, target).await {
            tracing::warn!(%target, "UDP send failed: {e}");
        }
    }

    /// Local SIP contact/Via host for outgoing messages
    pub fn local_sent_by(&self) -> String {
        format!("{}:{}", self.config.server_ipv4, self.config.sip_udp_port)
    }

    /// Drop a session: dispose it, release its media port and delete it
    /// from the registry after the drop delay
    pub fn drop_session(self: &Arc<Self>, session: &Arc<Session>) {
        session.dispose();

        let port = {
            let media = session.media.lock();
            media.local_port
        };

        *session.media_socket.lock() = None;
        if port != 0 {
            self.ports.release(port);
        }

        let rt = self.clone();
        let call_id: BytesStr = session.call_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SESSION_DROP_DELAY).await;
            rt.sessions.delete(&call_id);
        });
    }
}
