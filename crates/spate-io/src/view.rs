//! Byte-array view over the pinned frames of one completed request, and the
//! user computation contract.

use spate_cache::PageCache;
use spate_types::{FrameId, PageLocation, PAGE_SIZE};

/// Contiguous logical byte range backed by (possibly non-contiguous) page
/// frames.
///
/// The view is only constructed once every covered frame is resident and
/// pinned; extraction cannot observe a partially filled range.
pub struct PageByteArray<'a> {
    cache: &'a PageCache,
    base: u64,
    len: usize,
    frames: &'a [(PageLocation, FrameId)],
}

impl<'a> PageByteArray<'a> {
    pub(crate) fn new(
        cache: &'a PageCache,
        base: u64,
        len: usize,
        frames: &'a [(PageLocation, FrameId)],
    ) -> Self {
        debug_assert_eq!(base % PAGE_SIZE as u64, 0);
        debug_assert_eq!(frames.len(), len.div_ceil(PAGE_SIZE));
        Self {
            cache,
            base,
            len,
            frames,
        }
    }

    /// Absolute byte offset of the view's first byte.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.base
    }

    /// View length in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.len
    }

    /// Copy `dst.len()` bytes starting at `rel_off` into `dst`.
    ///
    /// Panics if the range falls outside the view; tasks are merged into a
    /// request precisely because their ranges fit it.
    pub fn copy_out(&self, rel_off: usize, dst: &mut [u8]) {
        assert!(
            rel_off + dst.len() <= self.len,
            "copy_out of [{rel_off}, {}) outside view of {} bytes",
            rel_off + dst.len(),
            self.len
        );
        let mut copied = 0_usize;
        while copied < dst.len() {
            let abs = rel_off + copied;
            let page_idx = abs / PAGE_SIZE;
            let page_off = abs % PAGE_SIZE;
            let chunk = (PAGE_SIZE - page_off).min(dst.len() - copied);
            let (_, frame) = self.frames[page_idx];
            let ok = self
                .cache
                .copy_from_frame(frame, page_off, &mut dst[copied..copied + chunk]);
            debug_assert!(ok, "view frame {} must be resident", frame.0);
            copied += chunk;
        }
    }
}

/// Deferred user work attached to a page range.
///
/// `run` is entered exactly once, after every page the computation depends
/// on is resident and valid; a computation whose request fails with an I/O
/// error is discarded without running.
pub trait UserCompute: Send {
    /// Apply the computation to the fetched byte range.
    fn run(&mut self, view: &PageByteArray<'_>);

    /// Whether `run` has been entered and returned.
    fn has_completed(&self) -> bool;
}
