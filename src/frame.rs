//! Single-slot frame bus shared between the capture thread and stream viewers.
//!
//! The slot only ever holds the most recent encoded frame. Every publish bumps a
//! generation counter, and readers wait for "a generation newer than the one I
//! last saw" rather than for a bare notification. Slow viewers therefore skip
//! straight to whatever is current and memory stays bounded to a single frame
//! no matter how many viewers are attached.

use bytes::Bytes;
use tokio::sync::watch;

/// One complete JPEG image.
///
/// Cloning is cheap: the encoded bytes are reference counted, so every viewer
/// of a given generation shares the same buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    jpeg: Bytes,
    width: u32,
    height: u32,
}

impl Frame {
    /// Wrap already-encoded JPEG data.
    pub fn new(jpeg: impl Into<Bytes>, width: u32, height: u32) -> Self {
        Self {
            jpeg: jpeg.into(),
            width,
            height,
        }
    }

    /// Encoded JPEG bytes.
    pub fn jpeg(&self) -> &Bytes {
        &self.jpeg
    }

    /// Size of the encoded image in bytes.
    pub fn len(&self) -> usize {
        self.jpeg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

#[derive(Debug, Default)]
struct SlotState {
    generation: u64,
    frame: Option<Frame>,
    closed: bool,
}

/// Overwrite-always frame slot with broadcast wakeup.
///
/// `publish` never waits on readers. Readers call [`FrameSlot::wait_for_next`]
/// with the last generation they observed and get back the current frame
/// together with its generation; the pair is read under one borrow so a
/// generation is never seen without its matching frame.
#[derive(Debug)]
pub struct FrameSlot {
    tx: watch::Sender<SlotState>,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    /// Create an empty slot at generation 0.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SlotState::default());
        Self { tx }
    }

    /// Replace the current frame and wake every waiter.
    ///
    /// Returns the generation assigned to `frame`.
    pub fn publish(&self, frame: Frame) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|state| {
            state.generation += 1;
            state.frame = Some(frame);
            generation = state.generation;
        });
        generation
    }

    /// Wait until the slot holds a generation newer than `last_seen`.
    ///
    /// Returns `None` once the slot has been closed.
    pub async fn wait_for_next(&self, last_seen: u64) -> Option<(Frame, u64)> {
        // Subscribing marks the current value as seen, so any publish that
        // lands after the check below is guaranteed to resolve `changed()`.
        let mut rx = self.tx.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if state.closed {
                    return None;
                }
                if state.generation > last_seen {
                    if let Some(frame) = state.frame.as_ref() {
                        return Some((frame.clone(), state.generation));
                    }
                }
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// The current frame and its generation, if anything has been published.
    pub fn current(&self) -> Option<(Frame, u64)> {
        let state = self.tx.borrow();
        state
            .frame
            .as_ref()
            .map(|frame| (frame.clone(), state.generation))
    }

    /// Generation of the most recent publish (0 before the first one).
    pub fn generation(&self) -> u64 {
        self.tx.borrow().generation
    }

    /// Number of readers currently parked in `wait_for_next`.
    pub fn waiter_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Release every waiter with `None`; later waits return immediately.
    pub fn close(&self) {
        self.tx.send_modify(|state| state.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn frame(tag: &'static [u8]) -> Frame {
        Frame::new(Bytes::from_static(tag), 640, 480)
    }

    #[test]
    fn test_publish_increments_generation() {
        let slot = FrameSlot::new();
        assert_eq!(slot.generation(), 0);
        assert!(slot.current().is_none());

        assert_eq!(slot.publish(frame(b"a")), 1);
        assert_eq!(slot.publish(frame(b"b")), 2);

        let (current, generation) = slot.current().unwrap();
        assert_eq!(generation, 2);
        assert_eq!(current.jpeg().as_ref(), b"b");
    }

    #[tokio::test]
    async fn test_waiter_blocks_until_publish() {
        let slot = Arc::new(FrameSlot::new());

        let pending = timeout(Duration::from_millis(50), slot.wait_for_next(0)).await;
        assert!(pending.is_err(), "empty slot must not satisfy a waiter");

        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.wait_for_next(0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.publish(frame(b"first"));

        let (received, generation) = timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(generation, 1);
        assert_eq!(received.jpeg().as_ref(), b"first");
    }

    #[tokio::test]
    async fn test_already_seen_generation_is_not_redelivered() {
        let slot = FrameSlot::new();
        slot.publish(frame(b"one"));

        let (_, seen) = slot.wait_for_next(0).await.unwrap();
        assert_eq!(seen, 1);

        let again = timeout(Duration::from_millis(50), slot.wait_for_next(seen)).await;
        assert!(again.is_err(), "waiter must not be satisfied by generation it saw");
    }

    #[tokio::test]
    async fn test_slow_waiter_skips_to_latest() {
        let slot = FrameSlot::new();
        for tag in [&b"1"[..], b"2", b"3"] {
            slot.publish(Frame::new(Bytes::copy_from_slice(tag), 1, 1));
        }

        let (latest, generation) = slot.wait_for_next(0).await.unwrap();
        assert_eq!(generation, 3);
        assert_eq!(latest.jpeg().as_ref(), b"3");
    }

    #[tokio::test]
    async fn test_waiters_share_the_same_frame() {
        let slot = Arc::new(FrameSlot::new());
        slot.publish(frame(b"zero"));

        let a = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.wait_for_next(1).await })
        };
        let b = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.wait_for_next(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.publish(frame(b"shared"));

        let (frame_a, gen_a) = a.await.unwrap().unwrap();
        let (frame_b, gen_b) = b.await.unwrap().unwrap();

        assert_eq!(gen_a, 2);
        assert_eq!(gen_b, 2);
        assert_eq!(frame_a.jpeg().as_ptr(), frame_b.jpeg().as_ptr());
        assert_eq!(frame_b.jpeg().as_ref(), b"shared");
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let slot = Arc::new(FrameSlot::new());
        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.wait_for_next(0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        slot.close();
        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(result.is_none());
        assert!(slot.is_closed());
        assert!(slot.wait_for_next(0).await.is_none());
    }

    #[test]
    fn test_publish_without_waiters_does_not_block() {
        let slot = FrameSlot::new();
        for _ in 0..1_000 {
            slot.publish(frame(b"x"));
        }
        assert_eq!(slot.generation(), 1_000);
        assert_eq!(slot.waiter_count(), 0);
    }
}
