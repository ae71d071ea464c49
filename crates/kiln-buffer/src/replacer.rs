//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Selects a victim among frames for which `can_evict` returns true.
    ///
    /// Returns None if no frame qualifies.
    fn evict(&self, can_evict: &dyn Fn(FrameId) -> bool) -> Option<FrameId>;

    /// Forgets any access history for a frame.
    fn remove(&self, frame_id: FrameId);
}

/// Clock replacement algorithm implementation.
///
/// Each frame carries a reference bit set on access. The hand sweeps the
/// frames, clearing set bits and choosing the first evictable frame whose
/// bit is already clear. Two full sweeps always suffice.
pub struct ClockReplacer {
    inner: Mutex<ClockInner>,
}

struct ClockInner {
    reference_bits: Vec<bool>,
    hand: usize,
}

impl ClockReplacer {
    /// Creates a new clock replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(ClockInner {
                reference_bits: vec![false; num_frames],
                hand: 0,
            }),
        }
    }

    /// Returns the total capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().reference_bits.len()
    }
}

impl Replacer for ClockReplacer {
    fn record_access(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if let Some(bit) = inner.reference_bits.get_mut(frame_id.0 as usize) {
            *bit = true;
        }
    }

    fn evict(&self, can_evict: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        let num_frames = inner.reference_bits.len();
        if num_frames == 0 {
            return None;
        }

        for _ in 0..(2 * num_frames) {
            let hand = inner.hand;
            inner.hand = (hand + 1) % num_frames;

            let frame_id = FrameId(hand as u32);
            if !can_evict(frame_id) {
                continue;
            }
            if inner.reference_bits[hand] {
                inner.reference_bits[hand] = false;
            } else {
                return Some(frame_id);
            }
        }
        None
    }

    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if let Some(bit) = inner.reference_bits.get_mut(frame_id.0 as usize) {
            *bit = false;
        }
    }
}
