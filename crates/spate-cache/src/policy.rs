//! Policy-internal access outcome shared by the replacement engines.

use spate_types::{FrameId, PageBuf, PageLocation};

/// Result of one policy access, produced inside the policy's critical
/// section. Pins for `Hit` and `Assigned` are already taken when the
/// outcome is returned.
pub(crate) enum Access {
    /// The identity is resident. `pending` means a read is in flight and
    /// the payload is not yet servable.
    Hit { frame: FrameId, pending: bool },
    /// The frame now carries the searched identity with `io_pending` set;
    /// the caller issues the read (or overwrites the whole page).
    Assigned { frame: FrameId, evicted: bool },
    /// The chosen victim is dirty: its payload must be written back before
    /// the frame can be reused. The frame keeps its old identity and stays
    /// servable while the write-back is in flight.
    Writeback {
        frame: FrameId,
        loc: PageLocation,
        payload: PageBuf,
        seq: u64,
    },
    /// Every candidate is pinned or io-pending.
    Busy,
}
