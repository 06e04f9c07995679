//! Input cache: which sequence slot serves the next request
//!
//! Every slot remembers the text its KV cache currently holds. A request is
//! placed on the free slot that lets the engine skip the most prompt
//! evaluation. In multi-user mode the least recently used slot is taken
//! instead, so one user's conversation is not evicted by another's, and a
//! longer shared prefix is copied over from a sibling slot when one exists.

use crate::engine::{SlotAssignment, SlotCopy};
use crate::error::RunnerError;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Slot {
    content: String,
    in_use: bool,
    last_used: u64,
}

#[derive(Debug)]
struct Slots {
    entries: Vec<Slot>,
    clock: u64,
}

/// Per-slot record of cached text
#[derive(Debug)]
pub struct InputCache {
    slots: Mutex<Slots>,
    multi_user: bool,
}

/// Exclusive hold on one slot; frees it on drop
#[derive(Debug)]
pub struct SlotLease {
    cache: Arc<InputCache>,
    assignment: SlotAssignment,
}

/// Byte length of the common prefix, cut at a char boundary
pub fn common_prefix(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()))
}

impl InputCache {
    pub fn new(slots: usize, multi_user: bool) -> Arc<Self> {
        let entries = (0..slots).map(|_| Slot::default()).collect();
        Arc::new(Self {
            slots: Mutex::new(Slots { entries, clock: 0 }),
            multi_user,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_use(&self) -> usize {
        self.slots.lock().entries.iter().filter(|s| s.in_use).count()
    }

    /// Claim a free slot for `prompt`
    ///
    /// Callers hold an admission permit, so a free slot always exists; an
    /// exhausted cache is reported as a fatal error.
    pub fn acquire(self: &Arc<Self>, prompt: &str) -> Result<SlotLease, RunnerError> {
        let mut slots = self.slots.lock();
        let free: Vec<usize> = slots
            .entries
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.in_use)
            .map(|(i, _)| i)
            .collect();

        let assignment = if self.multi_user {
            Self::pick_least_recent(&slots.entries, &free, prompt)
        } else {
            Self::pick_longest_prefix(&slots.entries, &free, prompt)
        }
        .ok_or_else(|| RunnerError::Fatal("no free sequence slot".into()))?;

        let slot = &mut slots.entries[assignment.slot];
        slot.in_use = true;
        slot.content.clear();
        slot.content.push_str(prompt);

        tracing::debug!(
            slot = assignment.slot,
            reuse = assignment.reuse_prefix,
            copy_from = ?assignment.copy_from.map(|c| c.slot),
            "Assigned sequence slot"
        );

        Ok(SlotLease {
            cache: Arc::clone(self),
            assignment,
        })
    }

    fn pick_longest_prefix(entries: &[Slot], free: &[usize], prompt: &str) -> Option<SlotAssignment> {
        free.iter()
            .map(|&i| (i, common_prefix(&entries[i].content, prompt)))
            // Longest prefix first, then least recently used.
            .max_by(|(a, pa), (b, pb)| {
                pa.cmp(pb)
                    .then_with(|| entries[*b].last_used.cmp(&entries[*a].last_used))
            })
            .map(|(slot, reuse_prefix)| SlotAssignment {
                slot,
                reuse_prefix,
                copy_from: None,
            })
    }

    fn pick_least_recent(entries: &[Slot], free: &[usize], prompt: &str) -> Option<SlotAssignment> {
        let slot = *free.iter().min_by_key(|&&i| entries[i].last_used)?;
        let own = common_prefix(&entries[slot].content, prompt);

        let donor = free
            .iter()
            .filter(|&&i| i != slot)
            .map(|&i| (i, common_prefix(&entries[i].content, prompt)))
            .filter(|(_, prefix)| *prefix > own)
            .max_by_key(|(_, prefix)| *prefix);

        Some(match donor {
            Some((donor, prefix)) => SlotAssignment {
                slot,
                reuse_prefix: prefix,
                copy_from: Some(SlotCopy { slot: donor, prefix }),
            },
            None => SlotAssignment {
                slot,
                reuse_prefix: own,
                copy_from: None,
            },
        })
    }
}

impl SlotLease {
    pub fn assignment(&self) -> &SlotAssignment {
        &self.assignment
    }

    /// Record generated text so a follow-up turn can reuse it
    pub fn append(&self, generated: &str) {
        let mut slots = self.cache.slots.lock();
        slots.entries[self.assignment.slot].content.push_str(generated);
    }

    /// Forget the slot's content, e.g. after a failed evaluation
    pub fn invalidate(&self) {
        let mut slots = self.cache.slots.lock();
        slots.entries[self.assignment.slot].content.clear();
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let mut slots = self.cache.slots.lock();
        slots.clock += 1;
        let tick = slots.clock;
        let slot = &mut slots.entries[self.assignment.slot];
        slot.in_use = false;
        slot.last_used = tick;
    }
}
