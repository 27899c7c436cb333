//! Types describing the result of register allocation.
//!
//! Once register allocation succeeds, the client receives an [`Output`]
//! which describes:
//! - the [`Allocation`] assigned to each instruction operand, queried with
//!   [`Output::allocs`], and
//! - the sequence of move/spill/reload instructions that must be inserted
//!   between the original instructions, queried with [`Output::edits`].
//!
//! Each [`Edit`] is keyed to a [`MovePosition`] which identifies the
//! instruction boundary it must be inserted at. All edits for a position
//! form a single atomic group: the allocator has already serialized them so
//! that executing them in order never clobbers a value that is still needed.

use core::fmt;

use crate::entity::packed_option::ReservedValue;
use crate::entity::PackedOption;
use crate::function::{Function, Inst, Value};
use crate::reginfo::{PhysReg, RegInfo, MAX_PHYSREGS};
use crate::{Stats, TraceAllocator};

entity_def! {
    /// A stack slot allocated for a spilled value.
    ///
    /// Slots are numbered densely from 0; the client assigns each slot a
    /// frame location after allocation completes.
    pub entity SpillSlot(u32, "slot");
}

/// A concrete location holding a value: either a physical register or a
/// spill slot.
///
/// This is bit-packed in 32 bits for memory efficiency.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Allocation {
    /// Bit-pack in 32 bits.
    ///
    /// kind:1 index:31
    bits: u32,
}

/// Expanded version of [`Allocation`] for `match`ing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationKind {
    /// A physical register.
    PhysReg(PhysReg),

    /// A stack slot.
    SpillSlot(SpillSlot),
}

impl Allocation {
    const KIND_BIT: u32 = 1 << 31;

    /// An allocation in the given physical register.
    #[inline]
    #[must_use]
    pub fn reg(reg: PhysReg) -> Self {
        debug_assert!(reg.index() < MAX_PHYSREGS);
        Self {
            bits: reg.index() as u32,
        }
    }

    /// An allocation in the given spill slot.
    #[inline]
    #[must_use]
    pub fn spillslot(slot: SpillSlot) -> Self {
        Self {
            bits: slot.index() as u32 | Self::KIND_BIT,
        }
    }

    /// Expands the allocation for matching.
    #[inline]
    #[must_use]
    pub fn kind(self) -> AllocationKind {
        if self.bits & Self::KIND_BIT == 0 {
            AllocationKind::PhysReg(PhysReg::new(self.bits as usize))
        } else {
            AllocationKind::SpillSlot(SpillSlot::new((self.bits & !Self::KIND_BIT) as usize))
        }
    }

    /// Whether this allocation is a physical register.
    #[inline]
    #[must_use]
    pub fn is_reg(self) -> bool {
        self.bits & Self::KIND_BIT == 0 && !self.is_reserved_value()
    }

    /// Whether this allocation is a memory location.
    #[inline]
    #[must_use]
    pub fn is_memory(self) -> bool {
        self.bits & Self::KIND_BIT != 0 && !self.is_reserved_value()
    }

    /// Returns the physical register, if this is one.
    #[inline]
    #[must_use]
    pub fn as_reg(self) -> Option<PhysReg> {
        match self.kind() {
            AllocationKind::PhysReg(reg) => Some(reg),
            AllocationKind::SpillSlot(_) => None,
        }
    }

    /// Returns the spill slot, if this is one.
    #[inline]
    #[must_use]
    pub fn as_spillslot(self) -> Option<SpillSlot> {
        match self.kind() {
            AllocationKind::PhysReg(_) => None,
            AllocationKind::SpillSlot(slot) => Some(slot),
        }
    }
}

impl ReservedValue for Allocation {
    #[inline]
    fn reserved_value() -> Self {
        Self { bits: u32::MAX }
    }

    #[inline]
    fn is_reserved_value(&self) -> bool {
        self.bits == u32::MAX
    }
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            AllocationKind::PhysReg(reg) => write!(f, "{reg}"),
            AllocationKind::SpillSlot(slot) => write!(f, "{slot}"),
        }
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Position at which an [`Edit`] must be inserted.
///
/// All edits occur at the boundary before an instruction. Edits which
/// reconcile locations across a jump to a merge block are "late": they are
/// placed before the jump instruction but after any other edits at that
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MovePosition {
    /// Bit-pack in 32 bits.
    ///
    /// inst:31 pos:1
    bits: u32,
}

impl MovePosition {
    /// An early edit, placed at the boundary before `inst`.
    #[inline]
    #[must_use]
    pub fn early(inst: Inst) -> Self {
        Self {
            bits: (inst.index() as u32) << 1,
        }
    }

    /// A late edit, placed before `inst` but after all early edits at the
    /// same boundary.
    ///
    /// Used for moves on a jump whose successor has multiple predecessors.
    #[inline]
    #[must_use]
    pub fn late(inst: Inst) -> Self {
        Self {
            bits: ((inst.index() as u32) << 1) | 1,
        }
    }

    /// Instruction before which the edit must be placed.
    #[inline]
    #[must_use]
    pub fn inst(self) -> Inst {
        Inst::new((self.bits >> 1) as usize)
    }

    /// Whether this is a late edit.
    #[inline]
    #[must_use]
    pub fn is_late(self) -> bool {
        self.bits & 1 != 0
    }
}

impl fmt::Display for MovePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_late() {
            write!(f, "{}-late", self.inst())
        } else {
            write!(f, "{}-early", self.inst())
        }
    }
}

/// A move between two locations or a rematerialization of a constant value
/// into a location.
///
/// Valid combinations are:
/// - Move: value:Some from:Some
/// - Rematerialization: value:Some from:None
/// - Scratch spill/reload around a resolved move cycle: value:None from:Some
#[derive(Debug, Clone, Copy)]
pub struct Edit {
    /// The value being moved, if known.
    pub value: PackedOption<Value>,

    /// Source location, or `None` for a rematerialization.
    pub from: PackedOption<Allocation>,

    /// Destination location.
    pub to: Allocation,
}

impl fmt::Display for Edit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.value.expand(), self.from.expand()) {
            (_, Some(from)) => write!(f, "move {:?} from {from} to {}", self.value, self.to),
            (Some(value), None) => write!(f, "remat {value} in {}", self.to),
            (None, None) => f.write_str("nop"),
        }
    }
}

/// The output of register allocation, borrowing the allocator's internal
/// state.
///
/// Dropping the `Output` releases the borrow; the allocator's temporary
/// memory is retained for the next function.
pub struct Output<'a, F, R> {
    pub(crate) regalloc: &'a TraceAllocator,
    pub(crate) func: &'a F,
    pub(crate) reginfo: &'a R,
}

impl<'a, F: Function, R: RegInfo> Output<'a, F, R> {
    /// The input function.
    #[inline]
    #[must_use]
    pub fn function(&self) -> &'a F {
        self.func
    }

    /// The target register description.
    #[inline]
    #[must_use]
    pub fn reginfo(&self) -> &'a R {
        self.reginfo
    }

    /// The allocations for the operands of `inst`, parallel to
    /// [`Function::inst_operands`].
    #[inline]
    #[must_use]
    pub fn allocs(&self, inst: Inst) -> &'a [Allocation] {
        self.regalloc.allocations.allocs(inst)
    }

    /// All edits, sorted by position.
    ///
    /// Edits at the same position must be emitted in slice order.
    #[inline]
    #[must_use]
    pub fn edits(&self) -> &'a [(MovePosition, Edit)] {
        self.regalloc.move_resolver.edits()
    }

    /// Number of spill slots used by the allocation.
    #[inline]
    #[must_use]
    pub fn num_spillslots(&self) -> usize {
        self.regalloc.spill_slots.num_slots()
    }

    /// Statistics collected during this allocation.
    #[inline]
    #[must_use]
    pub fn stats(&self) -> &'a Stats {
        &self.regalloc.stats
    }
}

impl<F: Function, R: RegInfo> fmt::Display for Output<'_, F, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut edits = self.regalloc.move_resolver.edits().iter().peekable();
        for block in self.func.blocks() {
            writeln!(
                f,
                "{block}: // preds: {:?} succs: {:?}",
                self.func.block_preds(block),
                self.func.block_succs(block)
            )?;
            for inst in self.func.block_insts(block).iter() {
                while let Some(&&(pos, edit)) = edits.peek() {
                    if pos.inst() != inst {
                        break;
                    }
                    writeln!(f, "    {edit} // {pos}")?;
                    edits.next();
                }
                write!(f, "  {inst}:")?;
                for (operand, alloc) in self
                    .func
                    .inst_operands(inst)
                    .iter()
                    .zip(self.allocs(inst))
                {
                    write!(f, " {operand}={alloc}")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
