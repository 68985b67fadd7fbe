//! Shared socket poller.
//!
//! All tuner-side UDP sockets (RTP and RTCP of every device) register here.
//! Each registration is drained one datagram at a time and dispatched
//! synchronously to its sink, so a slow sink only stalls its own handle.
//! Shutdown cancels every registration and waits for the readers to drain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Largest single UDP datagram we accept.
const DATAGRAM_MAX: usize = 65536;

/// Grace period for reader tasks to drain on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Receiver of readable data for one registered socket.
pub trait PollSink: Send + Sync {
    fn on_readable(&self, data: &[u8]);
}

/// Registration handle returned by [`Poller::register`].
pub type PollerId = u64;

pub struct Poller {
    next_id: AtomicU64,
    readers: Mutex<HashMap<PollerId, JoinHandle<()>>>,
}

impl Poller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            readers: Mutex::new(HashMap::new()),
        })
    }

    /// Register a socket; every received datagram is handed to `sink`.
    pub fn register(&self, socket: Arc<UdpSocket>, sink: Arc<dyn PollSink>) -> PollerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_MAX];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(n) => sink.on_readable(&buf[..n]),
                    Err(e) => {
                        warn!("Poller read error: {e}");
                        break;
                    }
                }
            }
        });
        self.readers.lock().insert(id, handle);
        debug!("Poller registered handle {id}");
        id
    }

    /// Drop a registration; no further dispatches happen for this id.
    pub fn unregister(&self, id: PollerId) {
        if let Some(handle) = self.readers.lock().remove(&id) {
            handle.abort();
            debug!("Poller unregistered handle {id}");
        }
    }

    /// Number of live registrations.
    pub fn count(&self) -> usize {
        self.readers.lock().len()
    }

    /// Cancel all registrations and wait up to the drain timeout.
    pub async fn shutdown(&self) {
        let readers: Vec<(PollerId, JoinHandle<()>)> = self.readers.lock().drain().collect();
        info!("Poller shutting down, {} handles", readers.len());
        for (_, handle) in &readers {
            handle.abort();
        }
        for (id, handle) in readers {
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("Poller handle {id} did not drain in time");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        bytes: AtomicUsize,
    }

    impl PollSink for CountingSink {
        fn on_readable(&self, data: &[u8]) {
            self.bytes.fetch_add(data.len(), Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn dispatches_datagrams_to_sink() {
        let poller = Poller::new();
        let socket = Arc::new(
            crate::socket::udp_socket(Ipv4Addr::LOCALHOST, 0, 0).unwrap(),
        );
        let addr = socket.local_addr().unwrap();
        let sink = Arc::new(CountingSink {
            bytes: AtomicUsize::new(0),
        });
        let id = poller.register(Arc::clone(&socket), sink.clone());
        assert_eq!(poller.count(), 1);

        let sender = crate::socket::udp_socket(Ipv4Addr::LOCALHOST, 0, 0).unwrap();
        sender.send_to(&[0u8; 188], addr).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.bytes.load(Ordering::SeqCst) < 188 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("datagram should be dispatched");

        poller.unregister(id);
        assert_eq!(poller.count(), 0);
        poller.shutdown().await;
    }
}
