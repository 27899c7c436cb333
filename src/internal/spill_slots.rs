//! Stack slot allocation with optional cross-trace caching.
//!
//! Every spilled value needs a stack slot. When `cache_stack_slots` is
//! enabled, the first trace to spill a value claims a slot for it and every
//! later trace reuses the same slot, which makes the value's stack location
//! stable across trace boundaries and saves stack-to-stack traffic. The
//! cache is written exactly once per value (first writer wins); the whole
//! pipeline is sequential so no synchronization is involved.

use crate::entity::{PackedOption, SecondaryMap};
use crate::function::Value;
use crate::output::SpillSlot;
use crate::Stats;

pub struct SpillSlots {
    next_slot: u32,

    /// Slot claimed for each value, when caching is enabled.
    cache: SecondaryMap<Value, PackedOption<SpillSlot>>,
}

impl SpillSlots {
    pub fn new() -> Self {
        Self {
            next_slot: 0,
            cache: SecondaryMap::new(),
        }
    }

    pub fn clear(&mut self, num_values: usize) {
        self.next_slot = 0;
        self.cache.clear_and_resize(num_values);
    }

    /// Returns the stack slot for a spilled value.
    pub fn slot_for_value(&mut self, value: Value, cached: bool, stats: &mut Stats) -> SpillSlot {
        if cached {
            if let Some(slot) = self.cache[value].expand() {
                return slot;
            }
            let slot = self.alloc();
            self.cache[value] = Some(slot).into();
            stat!(stats, cached_spill_slots);
            slot
        } else {
            stat!(stats, trace_spill_slots);
            self.alloc()
        }
    }

    /// Allocates a fresh slot for scratch use in move resolution.
    pub fn alloc_emergency(&mut self, stats: &mut Stats) -> SpillSlot {
        stat!(stats, emergency_spill_slots);
        self.alloc()
    }

    fn alloc(&mut self) -> SpillSlot {
        let slot = SpillSlot::new(self.next_slot as usize);
        self.next_slot += 1;
        slot
    }

    /// Number of slots handed out so far.
    pub fn num_slots(&self) -> usize {
        self.next_slot as usize
    }
}
