//! Single-slot shared frame buffer.
//!
//! Holds the most recent frame and its grabbed flag. One producer swaps
//! new frames in, any number of readers copy the current one out. The
//! lock is held only for the swap or the copy, never across device I/O.

use super::Frame;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A snapshot of the shared buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    /// Whether the read that produced `frame` succeeded.
    pub grabbed: bool,
    /// The frame itself.
    pub frame: Frame,
}

/// Lock-guarded holder of the latest capture.
///
/// Only the latest frame is ever meaningful, so there is exactly one
/// slot. The producer keeps a second, private frame as its back buffer
/// and exchanges it with the slot on publish.
#[derive(Debug)]
pub struct FrameBuffer {
    slot: Mutex<Capture>,
}

impl FrameBuffer {
    /// Creates a buffer seeded with an initial capture.
    pub fn new(grabbed: bool, frame: Frame) -> Self {
        Self {
            slot: Mutex::new(Capture { grabbed, frame }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Capture> {
        // Both fields change in one critical section, so a poisoned slot
        // still holds a consistent capture.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes `frame`, returning the previously stored frame so the
    /// producer can reuse its allocation as the next back buffer.
    pub fn publish(&self, grabbed: bool, mut frame: Frame) -> Frame {
        let mut slot = self.lock();
        std::mem::swap(&mut slot.frame, &mut frame);
        slot.grabbed = grabbed;
        frame
    }

    /// Returns a copy of the current capture.
    pub fn snapshot(&self) -> Capture {
        self.lock().clone()
    }

    /// Returns the grabbed flag and sequence number without copying pixels.
    pub fn peek(&self) -> (bool, u64) {
        let slot = self.lock();
        (slot.grabbed, slot.frame.sequence())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn filled(value: u8, sequence: u64) -> Frame {
        Frame::new(vec![value; 32 * 8], 32, 8, 1, sequence).unwrap()
    }

    #[test]
    fn test_read_after_write() {
        let buffer = FrameBuffer::new(false, Frame::blank(32, 8, 1));
        let frame = filled(42, 1);

        buffer.publish(true, frame.clone());

        let capture = buffer.snapshot();
        assert!(capture.grabbed);
        assert_eq!(capture.frame, frame);
    }

    #[test]
    fn test_publish_returns_previous_frame() {
        let buffer = FrameBuffer::new(true, filled(1, 1));
        let previous = buffer.publish(true, filled(2, 2));
        assert_eq!(previous.sequence(), 1);
        assert_eq!(buffer.peek(), (true, 2));
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let buffer = FrameBuffer::new(true, filled(7, 1));

        let mut copy = buffer.snapshot();
        copy.grabbed = false;
        copy.frame.reuse(32, 8, 1, 99).fill(0);

        let again = buffer.snapshot();
        assert!(again.grabbed);
        assert_eq!(again.frame.sequence(), 1);
        assert!(again.frame.pixels().iter().all(|&v| v == 7));
    }

    #[test]
    fn test_concurrent_reads_never_tear() {
        // Every published frame is uniformly filled with its sequence
        // number, and grabbed is true exactly for even sequences. A torn
        // read would show mixed pixels or a flag that disagrees.
        let buffer = Arc::new(FrameBuffer::new(true, filled(0, 0)));
        let done = Arc::new(AtomicBool::new(false));

        let producer = {
            let buffer = Arc::clone(&buffer);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut back = filled(0, 0);
                for seq in 1..=2000u64 {
                    let value = (seq % 251) as u8;
                    back.reuse(32, 8, 1, seq).fill(value);
                    back = buffer.publish(seq % 2 == 0, back);
                }
                done.store(true, Ordering::Release);
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut observed = 0u64;
                    while !done.load(Ordering::Acquire) || observed == 0 {
                        let capture = buffer.snapshot();
                        let seq = capture.frame.sequence();
                        let value = (seq % 251) as u8;
                        assert!(capture.frame.pixels().iter().all(|&v| v == value));
                        assert_eq!(capture.grabbed, seq % 2 == 0);
                        observed += 1;
                    }
                })
            })
            .collect();

        producer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buffer.peek(), (true, 2000));
    }
}
