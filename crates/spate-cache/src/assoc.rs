//! Set-associative replacement: the identity's hash selects a set of
//! [`SET_WAYS`] frames; within a set, eviction takes the least recently
//! used frame that is neither pinned nor io-pending. Set locks serialize
//! concurrent searches within the same set.

use crate::frame::FrameArena;
use crate::policy::Access;
use parking_lot::Mutex;
use spate_types::{FrameId, PageLocation};
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;

pub(crate) const SET_WAYS: usize = 8;

#[derive(Debug)]
struct SetEntry {
    frame: FrameId,
    loc: Option<PageLocation>,
    last_use: u64,
}

#[derive(Debug)]
struct SetInner {
    tick: u64,
    entries: Vec<SetEntry>,
}

#[derive(Debug)]
pub(crate) struct Assoc {
    sets: Vec<Mutex<SetInner>>,
}

impl Assoc {
    pub(crate) fn new(frames: usize) -> Self {
        let set_count = frames.div_ceil(SET_WAYS).max(1);
        let mut sets = Vec::with_capacity(set_count);
        for set_idx in 0..set_count {
            let lo = set_idx * SET_WAYS;
            let hi = ((set_idx + 1) * SET_WAYS).min(frames);
            sets.push(Mutex::new(SetInner {
                tick: 0,
                entries: (lo..hi)
                    .map(|i| SetEntry {
                        frame: FrameId(i as u32),
                        loc: None,
                        last_use: 0,
                    })
                    .collect(),
            }));
        }
        Self { sets }
    }

    fn set_for(&self, loc: PageLocation) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        loc.hash(&mut hasher);
        (hasher.finish() % self.sets.len() as u64) as usize
    }

    pub(crate) fn access(&self, arena: &FrameArena, loc: PageLocation) -> Access {
        let mut set = self.sets[self.set_for(loc)].lock();
        set.tick += 1;
        let tick = set.tick;

        if let Some(entry) = set.entries.iter_mut().find(|e| e.loc == Some(loc)) {
            entry.last_use = tick;
            let id = entry.frame;
            let frame = arena.get(id);
            let mut slot = frame.slot.lock();
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
            slot.io_pending = true;
            drop(slot);
            frame.pin.fetch_add(1, Ordering::AcqRel);
            return Access::Assigned {
                frame: id,
                evicted: false,
            };
        }

        // Miss: lowest-recency eligible entry, clean preferred over dirty.
        let mut clean: Option<(u64, usize)> = None;
        let mut dirty: Option<(u64, usize)> = None;
        for (idx, entry) in set.entries.iter().enumerate() {
            let frame = arena.get(entry.frame);
            if !frame.evictable() {
                continue;
            }
            let rank = (entry.last_use, idx);
            let slot_dirty = frame.slot.lock().dirty;
            let bucket = if slot_dirty { &mut dirty } else { &mut clean };
            if bucket.map_or(true, |best| rank < best) {
                *bucket = Some(rank);
            }
        }

        if let Some((_, idx)) = clean {
            let entry = &mut set.entries[idx];
            let id = entry.frame;
            let frame = arena.get(id);
            let mut slot = frame.slot.lock();
            let evicted = slot.loc.take().is_some();
            slot.loc = Some(loc);
            slot.valid = false;
            slot.dirty = false;
            slot.io_pending = true;
            drop(slot);
            frame.pin.fetch_add(1, Ordering::AcqRel);
            entry.loc = Some(loc);
            entry.last_use = tick;
            return Access::Assigned { frame: id, evicted };
        }
        if let Some((_, idx)) = dirty {
            let id = set.entries[idx].frame;
            let frame = arena.get(id);
            let mut slot = frame.slot.lock();
            slot.io_pending = true;
            let payload = slot.payload.clone().expect("dirty frame holds payload");
            return Access::Writeback {
                frame: id,
                loc: slot.loc.expect("dirty frame has identity"),
                payload,
                seq: slot.dirty_seq,
            };
        }
        Access::Busy
    }

    pub(crate) fn contains(&self, loc: PageLocation) -> bool {
        self.sets[self.set_for(loc)]
            .lock()
            .entries
            .iter()
            .any(|e| e.loc == Some(loc))
    }

    pub(crate) fn resident_count(&self) -> usize {
        self.sets
            .iter()
            .map(|set| set.lock().entries.iter().filter(|e| e.loc.is_some()).count())
            .sum()
    }
}
