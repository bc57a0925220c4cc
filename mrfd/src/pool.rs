use parking_lot::Mutex;
use rtp::{HEADER_LEN, SAMPLES_PER_FRAME};

/// Datagram size accepted on the SIP socket
pub const SIP_RX_BUFFER_SIZE: usize = 8192;

/// Size of a full RTP audio frame: header plus 20 ms payload
pub const RTP_FRAME_SIZE: usize = HEADER_LEN + SAMPLES_PER_FRAME;

/// Typed free lists for the three steady-state buffer workloads: SIP
/// receive, RTP receive and RTP transmit. The hot paths hand buffers
/// back after use instead of reallocating per packet.
pub struct BufferPool {
    sip_rx: FreeList,
    rtp_rx: FreeList,
    rtp_tx: FreeList,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            sip_rx: FreeList::new(SIP_RX_BUFFER_SIZE, true),
            rtp_rx: FreeList::new(RTP_FRAME_SIZE, true),
            // TX buffers grow from zero, they are filled by extending
            rtp_tx: FreeList::new(RTP_FRAME_SIZE, false),
        }
    }

    pub fn get_sip_rx(&self) -> Vec<u8> {
        self.sip_rx.get()
    }

    pub fn put_sip_rx(&self, buffer: Vec<u8>) {
        self.sip_rx.put(buffer);
    }

    pub fn get_rtp_rx(&self) -> Vec<u8> {
        self.rtp_rx.get()
    }

    pub fn put_rtp_rx(&self, buffer: Vec<u8>) {
        self.rtp_rx.put(buffer);
    }

    pub fn get_rtp_tx(&self) -> Vec<u8> {
        self.rtp_tx.get()
    }

    pub fn put_rtp_tx(&self, buffer: Vec<u8>) {
        self.rtp_tx.put(buffer);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

struct FreeList {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    filled: bool,
}

impl FreeList {
    fn new(capacity: usize, filled: bool) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            capacity,
            filled,
        }
    }

    fn get(&self) -> Vec<u8> {
        if let Some(mut buffer) = self.buffers.lock().pop() {
            if self.filled {
                buffer.resize(self.capacity, 0);
            } else {
                buffer.clear();
            }
            return buffer;
        }

        if self.filled {
            vec![0; self.capacity]
        } else {
            Vec::with_capacity(self.capacity)
        }
    }

    fn put(&self, buffer: Vec<u8>) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < 1024 {
            buffers.push(buffer);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new();

        let buffer = pool.get_sip_rx();
        assert_eq!(buffer.len(), SIP_RX_BUFFER_SIZE);
        let ptr = buffer.as_ptr();

        pool.put_sip_rx(buffer);
        let buffer = pool.get_sip_rx();
        assert_eq!(buffer.as_ptr(), ptr);
        assert_eq!(buffer.len(), SIP_RX_BUFFER_SIZE);
    }

    #[test]
    fn tx_buffers_start_empty() {
        let pool = BufferPool::new();

        let mut buffer = pool.get_rtp_tx();
        assert!(buffer.is_empty());

        buffer.extend_from_slice(&[1, 2, 3]);
        pool.put_rtp_tx(buffer);

        assert!(pool.get_rtp_tx().is_empty());
    }
}
