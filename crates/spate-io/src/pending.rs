//! In-flight client requests: a computation plus a countdown over the pages
//! it depends on.
//!
//! Ownership is flat: the request holds `(location, frame)` pairs, frames
//! hold no back-references, and the in-flight map holds `Arc`s to requests.
//! The last page completion runs the computation; the first page failure
//! discards it.

use crate::view::UserCompute;
use parking_lot::Mutex;
use spate_aio::CompletionStatus;
use spate_types::{ByteOffset, FileId, FrameId, PageLocation, PAGE_SIZE};
use std::sync::Arc;

/// Summary of a finished client request, handed to the per-completion
/// callback installed with `set_callback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    pub file: FileId,
    pub offset: ByteOffset,
    pub len: usize,
    pub status: CompletionStatus,
}

/// Per-completion client callback.
pub type ClientCallback = Arc<dyn Fn(&RequestOutcome) + Send + Sync>;

pub(crate) enum Progress {
    /// More pages outstanding.
    NotReady,
    /// This was the last page; the caller runs the computation.
    Ready,
    /// The request already ran or failed; nothing to do.
    Spent,
}

struct PendingState {
    remaining: usize,
    compute: Option<Box<dyn UserCompute>>,
    failed: bool,
}

/// One client request in flight: `total_pages` countdown plus the attached
/// computation.
pub(crate) struct PendingRequest {
    pub(crate) file: FileId,
    pub(crate) base: ByteOffset,
    pub(crate) len: usize,
    /// `(location, frame)` per page, in page order; each entry holds one
    /// pin owned by this request.
    frames: Mutex<Vec<(PageLocation, FrameId)>>,
    state: Mutex<PendingState>,
    callback: Option<ClientCallback>,
}

impl PendingRequest {
    pub(crate) fn new(
        file: FileId,
        base: ByteOffset,
        len: usize,
        compute: Box<dyn UserCompute>,
        callback: Option<ClientCallback>,
    ) -> Arc<Self> {
        let total_pages = len.div_ceil(PAGE_SIZE);
        Arc::new(Self {
            file,
            base,
            len,
            frames: Mutex::new(Vec::with_capacity(total_pages)),
            state: Mutex::new(PendingState {
                remaining: total_pages,
                compute: Some(compute),
                failed: false,
            }),
            callback,
        })
    }

    /// Record the pinned frame backing one page.
    ///
    /// Returns `false` when the request already failed; the caller then
    /// releases the pin itself instead of handing it to the request.
    pub(crate) fn add_frame(&self, loc: PageLocation, frame: FrameId) -> bool {
        if self.state.lock().failed {
            return false;
        }
        self.frames.lock().push((loc, frame));
        true
    }

    /// Count one page as resident.
    pub(crate) fn page_done(&self) -> Progress {
        let mut state = self.state.lock();
        if state.failed || state.compute.is_none() {
            return Progress::Spent;
        }
        state.remaining -= 1;
        if state.remaining == 0 {
            Progress::Ready
        } else {
            Progress::NotReady
        }
    }

    /// Run the computation against the now-resident range.
    ///
    /// Called by whichever thread counted the last page down; pins are
    /// released afterwards and the callback (if any) fires with a success
    /// outcome.
    pub(crate) fn run(&self, cache: &spate_cache::PageCache) {
        let mut compute = {
            let mut state = self.state.lock();
            match state.compute.take() {
                Some(compute) => compute,
                None => return,
            }
        };
        {
            let frames = self.frames.lock();
            let view = crate::view::PageByteArray::new(cache, self.base.0, self.len, &frames);
            compute.run(&view);
            debug_assert!(compute.has_completed());
        }
        self.release_pins(cache);
        if let Some(cb) = &self.callback {
            cb(&RequestOutcome {
                file: self.file,
                offset: self.base,
                len: self.len,
                status: CompletionStatus::Done { bytes: self.len },
            });
        }
    }

    /// Discard the computation after a page of this request failed.
    ///
    /// The computation is dropped without running (released, never
    /// poisoned); all pins held so far are returned, and the callback fires
    /// with the error outcome. Idempotent.
    pub(crate) fn fail(&self, cache: &spate_cache::PageCache, errno: i32) {
        {
            let mut state = self.state.lock();
            if state.failed || state.compute.is_none() {
                return;
            }
            state.failed = true;
            state.compute = None;
        }
        self.release_pins(cache);
        if let Some(cb) = &self.callback {
            cb(&RequestOutcome {
                file: self.file,
                offset: self.base,
                len: self.len,
                status: CompletionStatus::Error { errno },
            });
        }
    }

    fn release_pins(&self, cache: &spate_cache::PageCache) {
        let frames = std::mem::take(&mut *self.frames.lock());
        for (_, frame) in frames {
            cache.release(frame);
        }
    }
}
