//! Page frames and the fixed frame arena.
//!
//! Frames are allocated once at cache construction and never freed until
//! teardown. A frame's payload buffer *moves* out while an engine read owns
//! it and moves back on completion; `io_pending` marks that window (and the
//! write-back window, during which the payload stays resident and servable).

use parking_lot::Mutex;
use spate_types::{FrameId, PageBuf, PageLocation};
use std::sync::atomic::{AtomicU32, Ordering};

/// Observable frame flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags {
    /// Payload holds the bytes of the installed identity.
    pub valid: bool,
    /// Payload has been modified since the last flush.
    pub dirty: bool,
    /// A read or write-back owns this frame; never evictable.
    pub io_pending: bool,
}

#[derive(Debug)]
pub(crate) struct FrameSlot {
    pub loc: Option<PageLocation>,
    pub valid: bool,
    pub dirty: bool,
    pub io_pending: bool,
    /// `None` exactly while a read owns the buffer.
    pub payload: Option<PageBuf>,
    /// Bumped on every dirtying write; guards write-back completion against
    /// clearing a dirty bit set after the flush payload was captured.
    pub dirty_seq: u64,
}

impl FrameSlot {
    pub(crate) fn flags(&self) -> FrameFlags {
        FrameFlags {
            valid: self.valid,
            dirty: self.dirty,
            io_pending: self.io_pending,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Frame {
    pub pin: AtomicU32,
    pub slot: Mutex<FrameSlot>,
}

impl Frame {
    fn new() -> Self {
        Self {
            pin: AtomicU32::new(0),
            slot: Mutex::new(FrameSlot {
                loc: None,
                valid: false,
                dirty: false,
                io_pending: false,
                payload: Some(PageBuf::zeroed()),
                dirty_seq: 0,
            }),
        }
    }

    pub(crate) fn pin_count(&self) -> u32 {
        self.pin.load(Ordering::Acquire)
    }

    /// Whether replacement may take this frame right now.
    ///
    /// Callers hold the policy lock; the check is advisory across threads
    /// but exact within one policy shard because pins are only taken under
    /// that shard's lock.
    pub(crate) fn evictable(&self) -> bool {
        self.pin_count() == 0 && !self.slot.lock().io_pending
    }
}

/// Fixed arena of page frames indexed by [`FrameId`].
#[derive(Debug)]
pub(crate) struct FrameArena {
    frames: Vec<Frame>,
}

impl FrameArena {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            frames: (0..count).map(|_| Frame::new()).collect(),
        }
    }

    pub(crate) fn get(&self, id: FrameId) -> &Frame {
        &self.frames[id.index()]
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn iter_ids(&self) -> impl Iterator<Item = FrameId> {
        (0..self.frames.len() as u32).map(FrameId)
    }

    /// Sum of all pin counts; bounded by the frame count whenever each
    /// client holds at most one pin per frame.
    pub(crate) fn total_pins(&self) -> u64 {
        self.frames.iter().map(|f| u64::from(f.pin_count())).sum()
    }
}
