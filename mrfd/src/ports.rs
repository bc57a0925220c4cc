use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortState {
    Free,
    Used,
    /// Binding failed, a background task retries the port later
    Quarantined,
}

/// Bounded allocator of media UDP ports within the configured range.
///
/// Allocation re-binds the socket under the pool lock, so a port marked
/// used always has a live socket behind it. Ports whose bind failed are
/// quarantined and retried every ten seconds.
pub struct MediaPortPool {
    ip: Ipv4Addr,
    ports: Mutex<HashMap<u16, PortState>>,
}

impl MediaPortPool {
    pub fn new(ip: Ipv4Addr, start: u16, end: u16) -> Arc<Self> {
        let mut ports = HashMap::with_capacity(usize::from(end - start) + 1);
        for port in start..=end {
            ports.insert(port, PortState::Free);
        }

        Arc::new(Self {
            ip,
            ports: Mutex::new(ports),
        })
    }

    /// Spawn the quarantine reclaim task
    pub fn start_reclaim(self: &Arc<Self>) {
        let pool = self.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(10));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tick.tick().await;
                pool.reclaim_quarantined();
            }
        });
    }

    /// Reserve a socket on a free port. Returns the bound socket, or
    /// None when the pool is depleted.
    pub fn reserve_socket(&self) -> Option<(UdpSocket, u16)> {
        let mut ports = self.ports.lock();

        let free: Vec<u16> = ports
            .iter()
            .filter(|(_, state)| **state == PortState::Free)
            .map(|(port, _)| *port)
            .collect();

        for port in free {
            match bind_nonblocking(self.ip, port) {
                Ok(socket) => {
                    ports.insert(port, PortState::Used);
                    return Some((socket, port));
                }
                Err(e) => {
                    tracing::warn!(port, "media port bind failed, quarantining: {e}");
                    ports.insert(port, PortState::Quarantined);
                }
            }
        }

        tracing::error!(ip = %self.ip, "no available media ports");
        None
    }

    /// Hand a port back to the pool. The socket must already be dropped
    /// or about to be dropped by the caller.
    pub fn release(&self, port: u16) -> bool {
        let mut ports = self.ports.lock();

        match ports.get(&port) {
            Some(PortState::Used) => {
                ports.insert(port, PortState::Free);
                true
            }
            Some(_) => {
                tracing::warn!(port, "port already released");
                false
            }
            None => false,
        }
    }

    pub fn free_count(&self) -> usize {
        self.ports
            .lock()
            .values()
            .filter(|state| **state == PortState::Free)
            .count()
    }

    fn reclaim_quarantined(&self) {
        let mut ports = self.ports.lock();

        let quarantined: Vec<u16> = ports
            .iter()
            .filter(|(_, state)| **state == PortState::Quarantined)
            .map(|(port, _)| *port)
            .collect();

        for port in quarantined {
            // a successful probe bind proves the port is usable again
            if bind_nonblocking(self.ip, port).is_ok() {
                tracing::info!(port, "reclaimed quarantined media port");
                ports.insert(port, PortState::Free);
            }
        }
    }
}

/// Bind synchronously (callers hold the pool lock) and convert into a
/// tokio socket
fn bind_nonblocking(ip: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(ip, port)))?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn reserve_and_release() {
        let pool = MediaPortPool::new(Ipv4Addr::LOCALHOST, 22000, 22003);
        assert_eq!(pool.free_count(), 4);

        let (socket, port) = pool.reserve_socket().unwrap();
        assert!((22000..=22003).contains(&port));
        assert_eq!(pool.free_count(), 3);

        drop(socket);
        assert!(pool.release(port));
        assert_eq!(pool.free_count(), 4);

        // double release is flagged
        assert!(!pool.release(port));
    }

    #[tokio::test]
    async fn depletion() {
        let pool = MediaPortPool::new(Ipv4Addr::LOCALHOST, 22010, 22011);

        let a = pool.reserve_socket();
        let b = pool.reserve_socket();
        assert!(a.is_some() && b.is_some());

        assert!(pool.reserve_socket().is_none());
        assert_eq!(pool.free_count(), 0);
    }
}
