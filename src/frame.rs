//! Latest-frame publication for one session.
//!
//! - `FrameSnapshot`: an immutable captured frame with its sequence number.
//! - `SharedFrameState`: a single-slot cell holding the newest snapshot and
//!   the newest detection overlay. One producer (the session worker) swaps
//!   whole `Arc`s in; any number of readers clone them out.
//!
//! Readers never see a partially written frame: a snapshot is fully built
//! before the slot lock is taken, and the lock is only held for a pointer swap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use image::RgbImage;

use crate::detect::DetectionRecord;

/// Decoded RGB frame as produced by a source.
pub type Frame = RgbImage;

// ----------------------------------------------------------------------------
// FrameSnapshot
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct FrameSnapshot {
    /// 1-based sequence number, strictly increasing per session.
    pub frame_id: u64,
    pub captured_at: DateTime<Utc>,
    pub frame: Frame,
}

impl FrameSnapshot {
    pub fn width(&self) -> u32 {
        self.frame.width()
    }

    pub fn height(&self) -> u32 {
        self.frame.height()
    }
}

// ----------------------------------------------------------------------------
// SharedFrameState
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Slot {
    frame: Option<Arc<FrameSnapshot>>,
    overlay: Option<Arc<DetectionRecord>>,
}

/// What a reader gets back from [`SharedFrameState::snapshot`].
#[derive(Clone, Debug, Default)]
pub struct StateSnapshot {
    pub frame: Option<Arc<FrameSnapshot>>,
    pub overlay: Option<Arc<DetectionRecord>>,
}

impl StateSnapshot {
    pub fn frame_count(&self) -> u64 {
        self.frame.as_ref().map_or(0, |f| f.frame_id)
    }
}

#[derive(Default)]
pub struct SharedFrameState {
    slot: RwLock<Slot>,
    next_id: AtomicU64,
}

impl SharedFrameState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new frame and hand back the snapshot readers will see.
    ///
    /// Producer-only. The session worker is the single caller.
    pub fn publish(&self, frame: Frame) -> Arc<FrameSnapshot> {
        let frame_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = Arc::new(FrameSnapshot {
            frame_id,
            captured_at: Utc::now(),
            frame,
        });
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.frame = Some(Arc::clone(&snapshot));
        snapshot
    }

    /// Replace the overlay.
    ///
    /// Returns `false` (and leaves the slot alone) if the record refers to a
    /// frame that has not been published yet.
    pub fn publish_overlay(&self, record: DetectionRecord) -> bool {
        let record = Arc::new(record);
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let current = slot.frame.as_ref().map_or(0, |f| f.frame_id);
        if record.frame_id == 0 || record.frame_id > current {
            return false;
        }
        slot.overlay = Some(record);
        true
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        StateSnapshot {
            frame: slot.frame.clone(),
            overlay: slot.overlay.clone(),
        }
    }

    /// Sequence number of the newest visible frame, 0 before the first.
    pub fn frame_count(&self) -> u64 {
        self.snapshot().frame_count()
    }
}
