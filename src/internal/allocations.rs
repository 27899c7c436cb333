//! Table of [`Allocation`]s for instruction operands.

use alloc::vec;
use alloc::vec::Vec;

use crate::entity::packed_option::ReservedValue;
use crate::function::{Function, Inst};
use crate::output::Allocation;
use crate::{RegAllocError, Stats};

/// Mapping of [`Allocation`]s back to original instruction operands.
///
/// Allocations for all instructions live in one flat vector; a per-instruction
/// offset table maps an instruction to the slice for its operands.
pub struct Allocations {
    /// Allocations for the operands of all instructions in the function.
    allocations: Vec<Allocation>,

    /// Offset of the allocations for a particular instruction in the
    /// `allocations` vector, with a trailing sentinel entry.
    offsets: Vec<u32>,
}

impl Allocations {
    pub fn new() -> Self {
        Self {
            allocations: vec![],
            offsets: vec![],
        }
    }

    /// Computes the offsets for each instruction's operands in the allocation
    /// vector.
    pub fn compute_offsets(
        &mut self,
        func: &impl Function,
        stats: &mut Stats,
    ) -> Result<(), RegAllocError> {
        self.allocations.clear();
        self.offsets.clear();
        self.offsets.resize(func.num_insts() + 1, 0);

        let mut offset = 0u32;
        for inst in func.insts() {
            self.offsets[inst.index()] = offset;
            offset = offset
                .checked_add(func.inst_operands(inst).len() as u32)
                .ok_or(RegAllocError::FunctionTooBig)?;
        }

        // Sentinel to compute the slice length of the last instruction.
        self.offsets[func.num_insts()] = offset;

        self.allocations
            .resize(offset as usize, Allocation::reserved_value());
        stat!(stats, operands, offset as usize);

        Ok(())
    }

    /// Assigns the given [`Allocation`] to an instruction operand.
    pub fn set_allocation(&mut self, inst: Inst, slot: usize, alloc: Allocation) {
        let idx = self.offsets[inst.index()] as usize + slot;
        debug_assert!(idx < self.offsets[inst.index() + 1] as usize);
        self.allocations[idx] = alloc;
    }

    /// Returns the allocations for an instruction's operands.
    pub fn allocs(&self, inst: Inst) -> &[Allocation] {
        let start = self.offsets[inst.index()] as usize;
        let end = self.offsets[inst.index() + 1] as usize;
        &self.allocations[start..end]
    }

    /// Asserts that all allocations have been assigned.
    pub fn assert_all_assigned(&self) {
        self.allocations
            .iter()
            .for_each(|alloc| debug_assert!(!alloc.is_reserved_value()));
    }
}
