// MJPEG fan-out: a fixed table of client slots, each with its own frame
// queue. The liveview producer broadcasts every frame into all active
// queues; each HTTP client drains exactly one queue.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use qxcam_liveview::LiveviewSink;
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_MAX_CLIENTS: usize = 4;
pub const DEFAULT_FPS: f64 = 30.0;

/// How long a client waits for the next frame before its stream is treated
/// as idle and terminated.
const FRAME_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

struct Slot {
    // A slot is active while its sender is present.
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

pub struct MjpegStreamer {
    fps: f64,
    slots: Mutex<Vec<Slot>>,
}

impl MjpegStreamer {
    pub fn new(max_clients: usize, fps: f64) -> Arc<Self> {
        Arc::new(Self {
            fps,
            slots: Mutex::new((0..max_clients).map(|_| Slot { tx: None }).collect()),
        })
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(0.001))
    }

    pub fn idle_timeout(&self) -> Duration {
        FRAME_IDLE_TIMEOUT.max(self.frame_interval())
    }

    /// Claim the lowest free slot with a fresh queue. `None` when every slot
    /// is taken. The slot frees itself when the returned client is dropped.
    pub fn activate(self: &Arc<Self>) -> Option<StreamClient> {
        let mut slots = self.slots.lock();
        let index = slots.iter().position(|slot| slot.tx.is_none())?;
        let (tx, rx) = mpsc::unbounded_channel();
        slots[index].tx = Some(tx);
        debug!(slot = index, "mjpeg slot activated");
        Some(StreamClient {
            streamer: self.clone(),
            index,
            rx,
        })
    }

    /// Broadcast one frame to every active slot. Non-blocking; queues are
    /// bounded only by client consumption.
    pub fn add_frame(&self, frame: Bytes) {
        let slots = self.slots.lock();
        for slot in slots.iter() {
            if let Some(tx) = &slot.tx {
                let _ = tx.send(frame.clone());
            }
        }
    }

    pub fn active_clients(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.tx.is_some()).count()
    }

    fn release(&self, index: usize) {
        // Dropping the sender ends the queue; queued frames die with the
        // client's receiver.
        self.slots.lock()[index].tx = None;
        debug!(slot = index, "mjpeg slot released");
    }
}

impl LiveviewSink for MjpegStreamer {
    fn on_jpeg(&self, jpeg: Bytes) {
        self.add_frame(jpeg);
    }
}

/// One activated slot, bound to one HTTP client.
pub struct StreamClient {
    streamer: Arc<MjpegStreamer>,
    index: usize,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl StreamClient {
    /// Next frame in producer order, or `None` once `timeout` passes with
    /// nothing queued.
    pub async fn frame(&mut self, timeout: Duration) -> Option<Bytes> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.streamer.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_fan_out_preserves_producer_order() {
        let streamer = MjpegStreamer::new(2, 30.0);
        let mut a = streamer.activate().unwrap();
        let mut b = streamer.activate().unwrap();
        for frame in [&b"f1"[..], b"f2", b"f3"] {
            streamer.add_frame(Bytes::from_static(frame));
        }
        for client in [&mut a, &mut b] {
            assert_eq!(client.frame(SHORT).await.unwrap(), &b"f1"[..]);
            assert_eq!(client.frame(SHORT).await.unwrap(), &b"f2"[..]);
            assert_eq!(client.frame(SHORT).await.unwrap(), &b"f3"[..]);
        }
    }

    #[tokio::test]
    async fn test_admission_is_bounded() {
        let streamer = MjpegStreamer::new(2, 30.0);
        let _a = streamer.activate().unwrap();
        let _b = streamer.activate().unwrap();
        assert!(streamer.activate().is_none());
        assert_eq!(streamer.active_clients(), 2);
    }

    #[tokio::test]
    async fn test_activate_picks_lowest_free_index() {
        let streamer = MjpegStreamer::new(3, 30.0);
        let a = streamer.activate().unwrap();
        let b = streamer.activate().unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        drop(a);
        let c = streamer.activate().unwrap();
        assert_eq!(c.index(), 0);
        assert_eq!(streamer.active_clients(), 2);
        drop(b);
        drop(c);
        assert_eq!(streamer.active_clients(), 0);
    }

    #[tokio::test]
    async fn test_frames_before_activation_are_invisible() {
        let streamer = MjpegStreamer::new(1, 30.0);
        streamer.add_frame(Bytes::from_static(b"old"));
        let mut client = streamer.activate().unwrap();
        streamer.add_frame(Bytes::from_static(b"new"));
        assert_eq!(client.frame(SHORT).await.unwrap(), &b"new"[..]);
        assert_eq!(client.frame(SHORT).await, None);
    }

    #[tokio::test]
    async fn test_reactivation_starts_with_an_empty_queue() {
        let streamer = MjpegStreamer::new(1, 30.0);
        let client = streamer.activate().unwrap();
        streamer.add_frame(Bytes::from_static(b"f1"));
        drop(client);
        let mut client = streamer.activate().unwrap();
        assert_eq!(client.frame(SHORT).await, None);
    }

    #[tokio::test]
    async fn test_idle_timeout_is_at_least_one_frame_interval() {
        let streamer = MjpegStreamer::new(1, 0.001);
        assert!(streamer.idle_timeout() >= streamer.frame_interval());
    }
}
