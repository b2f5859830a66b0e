//! Secondary MJPEG fan-out (§4.6b) — delivers the single newest encoded JPEG
//! to every HTTP `/stream` client. Grounded directly on the teacher's
//! `MjpegStreamHandler` (`src/stream/mjpeg.rs`): an `ArcSwap`-held latest
//! frame plus a `broadcast` notify channel, since the MJPEG drop policy
//! ("drop inter-frames freely; always deliver the newest frame available")
//! is exactly what that design already expresses — no generalization needed
//! here, unlike the primary hub.

use arc_swap::ArcSwap;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct MjpegFanOut {
    current: ArcSwap<Option<Bytes>>,
    notify: broadcast::Sender<()>,
    client_count: AtomicUsize,
}

impl MjpegFanOut {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(4);
        Self {
            current: ArcSwap::from_pointee(None),
            notify,
            client_count: AtomicUsize::new(0),
        }
    }

    pub fn publish(&self, jpeg: Bytes) {
        self.current.store(Arc::new(Some(jpeg)));
        let _ = self.notify.send(());
    }

    pub fn current(&self) -> Option<Bytes> {
        (**self.current.load()).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    /// RAII guard, mirroring the teacher's `ClientGuard`: registers on
    /// construction, unregisters on `Drop` so a dropped HTTP connection
    /// deterministically decrements the count (§4.7).
    pub fn register_client(self: &Arc<Self>) -> ClientGuard {
        self.client_count.fetch_add(1, Ordering::Relaxed);
        ClientGuard {
            fanout: self.clone(),
        }
    }
}

impl Default for MjpegFanOut {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ClientGuard {
    fanout: Arc<MjpegFanOut>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.fanout.client_count.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_guard_tracks_count() {
        let fanout = Arc::new(MjpegFanOut::new());
        assert_eq!(fanout.client_count(), 0);
        let guard1 = fanout.register_client();
        let guard2 = fanout.register_client();
        assert_eq!(fanout.client_count(), 2);
        drop(guard1);
        assert_eq!(fanout.client_count(), 1);
        drop(guard2);
        assert_eq!(fanout.client_count(), 0);
    }

    #[test]
    fn publish_updates_current() {
        let fanout = MjpegFanOut::new();
        assert!(fanout.current().is_none());
        fanout.publish(Bytes::from_static(b"jpeg"));
        assert_eq!(fanout.current(), Some(Bytes::from_static(b"jpeg")));
    }
}
