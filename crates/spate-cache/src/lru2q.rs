//! LRU-2Q replacement: a recency queue (A1) in front of a frequency queue
//! (Am).
//!
//! A miss inserts at A1's tail. A hit while in A1 promotes to Am's tail; a
//! hit in Am moves to Am's tail. Eviction scans from A1's head, falling back
//! to Am's head, skipping pinned and io-pending frames. All queue state and
//! the identity map live under one lock.

use crate::frame::FrameArena;
use crate::policy::Access;
use parking_lot::Mutex;
use spate_types::{FrameId, PageLocation};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    None,
    A1,
    Am,
}

#[derive(Debug)]
struct Lru2qState {
    map: HashMap<PageLocation, FrameId>,
    a1: VecDeque<FrameId>,
    am: VecDeque<FrameId>,
    /// Queue membership per frame, indexed by frame id.
    tag: Vec<Tag>,
    free: Vec<FrameId>,
    /// Target share of frames for A1 (~25%); reported in metrics.
    a1_target: usize,
}

#[derive(Debug)]
pub(crate) struct Lru2q {
    state: Mutex<Lru2qState>,
}

enum Victim {
    Free(FrameId),
    Clean(FrameId),
    Dirty(FrameId),
    None,
}

impl Lru2qState {
    fn remove_from(list: &mut VecDeque<FrameId>, id: FrameId) {
        if let Some(pos) = list.iter().position(|f| *f == id) {
            let _ = list.remove(pos);
        }
    }

    fn touch(&mut self, id: FrameId) {
        match self.tag[id.index()] {
            Tag::A1 => {
                Self::remove_from(&mut self.a1, id);
                self.am.push_back(id);
                self.tag[id.index()] = Tag::Am;
            }
            Tag::Am => {
                Self::remove_from(&mut self.am, id);
                self.am.push_back(id);
            }
            Tag::None => {}
        }
    }

    fn detach(&mut self, id: FrameId) {
        match self.tag[id.index()] {
            Tag::A1 => Self::remove_from(&mut self.a1, id),
            Tag::Am => Self::remove_from(&mut self.am, id),
            Tag::None => {}
        }
        self.tag[id.index()] = Tag::None;
    }

    fn select_victim(&self, arena: &FrameArena) -> Victim {
        let mut dirty_fallback = None;
        for &id in self.a1.iter().chain(self.am.iter()) {
            let frame = arena.get(id);
            if !frame.evictable() {
                continue;
            }
            if frame.slot.lock().dirty {
                if dirty_fallback.is_none() {
                    dirty_fallback = Some(id);
                }
                continue;
            }
            return Victim::Clean(id);
        }
        match dirty_fallback {
            Some(id) => Victim::Dirty(id),
            None => Victim::None,
        }
    }
}

impl Lru2q {
    pub(crate) fn new(frames: usize) -> Self {
        Self {
            state: Mutex::new(Lru2qState {
                map: HashMap::with_capacity(frames),
                a1: VecDeque::new(),
                am: VecDeque::new(),
                tag: vec![Tag::None; frames],
                free: (0..frames as u32).rev().map(FrameId).collect(),
                a1_target: (frames / 4).max(1),
            }),
        }
    }

    pub(crate) fn access(&self, arena: &FrameArena, loc: PageLocation) -> Access {
        let mut st = self.state.lock();
        let mapped = st.map.get(&loc).copied();
        if let Some(id) = mapped {
            st.touch(id);
            let frame = arena.get(id);
            let mut slot = frame.slot.lock();
            // A write-back in flight still serves hits; only a pending read
            // makes the data unavailable.
            if slot.valid {
                drop(slot);
                frame.pin.fetch_add(1, Ordering::AcqRel);
                return Access::Hit {
                    frame: id,
                    pending: false,
                };
            }
            if slot.io_pending {
                drop(slot);
                frame.pin.fetch_add(1, Ordering::AcqRel);
                return Access::Hit {
                    frame: id,
                    pending: true,
                };
            }
            // Invalid and idle (a prior read failed): re-issue on the same
            // frame.
            slot.io_pending = true;
            drop(slot);
            frame.pin.fetch_add(1, Ordering::AcqRel);
            return Access::Assigned {
                frame: id,
                evicted: false,
            };
        }

        let victim = match st.free.pop() {
            Some(id) => Victim::Free(id),
            None => st.select_victim(arena),
        };
        match victim {
            Victim::Free(id) | Victim::Clean(id) => {
                let frame = arena.get(id);
                let mut slot = frame.slot.lock();
                let evicted = match slot.loc.take() {
                    Some(old) => {
                        st.map.remove(&old);
                        true
                    }
                    None => false,
                };
                st.detach(id);
                slot.loc = Some(loc);
                slot.valid = false;
                slot.dirty = false;
                slot.io_pending = true;
                drop(slot);
                frame.pin.fetch_add(1, Ordering::AcqRel);
                st.map.insert(loc, id);
                st.a1.push_back(id);
                st.tag[id.index()] = Tag::A1;
                Access::Assigned { frame: id, evicted }
            }
            Victim::Dirty(id) => {
                let frame = arena.get(id);
                let mut slot = frame.slot.lock();
                slot.io_pending = true;
                let payload = slot.payload.clone().expect("dirty frame holds payload");
                Access::Writeback {
                    frame: id,
                    loc: slot.loc.expect("dirty frame has identity"),
                    payload,
                    seq: slot.dirty_seq,
                }
            }
            Victim::None => Access::Busy,
        }
    }

    pub(crate) fn contains(&self, loc: PageLocation) -> bool {
        self.state.lock().map.contains_key(&loc)
    }

    pub(crate) fn resident_count(&self) -> usize {
        self.state.lock().map.len()
    }

    /// `(a1_len, am_len, a1_target)` under one lock acquisition.
    pub(crate) fn queue_lens(&self) -> (usize, usize, usize) {
        let st = self.state.lock();
        (st.a1.len(), st.am.len(), st.a1_target)
    }
}
