//! The [`Function`] trait which describes the input function.
//!
//! # Control flow graph and instructions
//!
//! The allocator operates on an input program in a standard CFG
//! representation: the function body is a sequence of basic blocks, and each
//! block has a sequence of instructions and zero or more successors. The
//! client must also provide predecessors for each block, consistent with the
//! successors. The entry block may not have any predecessors.
//!
//! The CFG must have *no critical edges*. A critical edge is an edge from
//! block A to block B such that A has more than one successor *and* B has
//! more than one predecessor. The move resolver asserts this instead of
//! handling it; critical edges must be split by inserting an empty block
//! before register allocation.
//!
//! Instructions are opaque to the allocator: their behavior is entirely
//! described by a vector of [`Operand`]s plus a clobber list. Every block
//! must end with a terminator instruction and terminators may not appear
//! elsewhere in a block.
//!
//! Both instructions and blocks are named by indices in contiguous index
//! spaces. A block's instructions must be a contiguous range of instruction
//! indices, and block i's first instruction must come immediately after block
//! i-1's last instruction. The block index order doubles as the linear
//! visitation order used by the trace builder: it must be a topological-ish
//! order in which loop bodies appear contiguously after their loop header.
//!
//! # SSA and block parameters
//!
//! The input must be in SSA form: each [`Value`] is defined exactly once.
//! Control-flow merges are expressed with *block parameters* (equivalent to
//! phi nodes): a block with multiple predecessors may declare parameters with
//! [`Function::block_params`], and every predecessor, which must end in a
//! jump with a single successor, provides matching outgoing values with
//! [`Function::jump_blockparams`]. A terminator that carries outgoing block
//! arguments cannot have any operands of its own.
//!
//! After allocation the phi bookkeeping is fully materialized into move
//! instructions; the output program is no longer in SSA form.

use crate::entity::{EntityRange, Keys};
use crate::entity::packed_option::ReservedValue as _;
use crate::reginfo::{PhysReg, RegClass};

/// Maximum number of basic blocks.
pub const MAX_BLOCKS: usize = 1 << 28;

/// Maximum number of instructions.
pub const MAX_INSTS: usize = 1 << 28;

/// Maximum number of SSA values.
pub const MAX_VALUES: usize = 1 << 28;

entity_def! {
    /// An opaque reference to a basic block in the input function.
    pub entity Block(u32, "block");

    /// An instruction index in the input function.
    ///
    /// An instruction is opaque: it only interacts with the register
    /// allocator through the constraints defined on its operands.
    pub entity Inst(u32, "inst");

    /// An opaque reference to an SSA value in the input function.
    pub entity Value(u32, "%");
}

impl Block {
    /// The entry block is always block 0.
    pub const ENTRY_BLOCK: Block = Block(0);

    /// Returns an index pointing to the next block.
    #[inline]
    #[must_use]
    pub fn next(self) -> Self {
        debug_assert!(!self.is_reserved_value());
        Self(self.0 + 1)
    }

    /// Returns an index pointing to the previous block.
    #[inline]
    #[must_use]
    pub fn prev(self) -> Self {
        debug_assert!(!self.is_reserved_value());
        Self(self.0 - 1)
    }
}

impl Inst {
    /// Returns an index pointing to the next instruction.
    #[inline]
    #[must_use]
    pub fn next(self) -> Self {
        debug_assert!(!self.is_reserved_value());
        Self(self.0 + 1)
    }

    /// Returns an index pointing to the previous instruction.
    #[inline]
    #[must_use]
    pub fn prev(self) -> Self {
        debug_assert!(!self.is_reserved_value());
        Self(self.0 - 1)
    }
}

/// A range of instructions in the input function.
pub type InstRange = EntityRange<Inst>;

/// The "kind" of an operand, which describes how an instruction makes use of
/// a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OperandKind {
    /// A write of a `Value`.
    ///
    /// The SSA property requires that each `Value` only be defined in a
    /// single place in the entire function.
    Def(Value),

    /// A read of a `Value`.
    Use(Value),
}

/// Constraints on the location that will be assigned to an operand.
///
/// The allocator's result always satisfies the given constraints; if a
/// combination of constraints is impossible to satisfy, allocation fails
/// with [`RegAllocError::TooManyLiveRegs`].
///
/// [`RegAllocError::TooManyLiveRegs`]: crate::RegAllocError::TooManyLiveRegs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OperandConstraint {
    /// Operand must be in a register of the given class.
    Reg(RegClass),

    /// Operand must be in the given fixed register.
    Fixed(PhysReg),

    /// Operand may be in a register of the given class or in a stack slot.
    ///
    /// The allocator prefers a register but will leave the value on the
    /// stack under pressure.
    Any(RegClass),
}

/// Information about an operand in an instruction.
///
/// An `Operand` encodes everything about a mention of a value in an
/// instruction: the SSA value, how it is used (read, write), and any
/// constraints on the location that will be selected for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Operand {
    kind: OperandKind,
    constraint: OperandConstraint,
}

impl Operand {
    /// Constructs a new operand.
    #[inline]
    #[must_use]
    pub fn new(kind: OperandKind, constraint: OperandConstraint) -> Self {
        Self { kind, constraint }
    }

    /// A use of `value` which must be in a register of `class`.
    #[inline]
    #[must_use]
    pub fn regclass_use(value: Value, class: RegClass) -> Self {
        Self::new(OperandKind::Use(value), OperandConstraint::Reg(class))
    }

    /// A definition of `value` which must be in a register of `class`.
    #[inline]
    #[must_use]
    pub fn regclass_def(value: Value, class: RegClass) -> Self {
        Self::new(OperandKind::Def(value), OperandConstraint::Reg(class))
    }

    /// A use of `value` which must be in the given fixed register.
    #[inline]
    #[must_use]
    pub fn fixed_use(value: Value, reg: PhysReg) -> Self {
        Self::new(OperandKind::Use(value), OperandConstraint::Fixed(reg))
    }

    /// A definition of `value` which must be in the given fixed register.
    #[inline]
    #[must_use]
    pub fn fixed_def(value: Value, reg: PhysReg) -> Self {
        Self::new(OperandKind::Def(value), OperandConstraint::Fixed(reg))
    }

    /// A use of `value` which may be in a register of `class` or on the
    /// stack.
    #[inline]
    #[must_use]
    pub fn any_use(value: Value, class: RegClass) -> Self {
        Self::new(OperandKind::Use(value), OperandConstraint::Any(class))
    }

    /// A definition of `value` which may be in a register of `class` or on
    /// the stack.
    #[inline]
    #[must_use]
    pub fn any_def(value: Value, class: RegClass) -> Self {
        Self::new(OperandKind::Def(value), OperandConstraint::Any(class))
    }

    /// Returns the "kind" of this operand.
    #[inline]
    #[must_use]
    pub fn kind(self) -> OperandKind {
        self.kind
    }

    /// Returns the constraint on this operand.
    #[inline]
    #[must_use]
    pub fn constraint(self) -> OperandConstraint {
        self.constraint
    }

    /// Returns the value read or written by this operand.
    #[inline]
    #[must_use]
    pub fn value(self) -> Value {
        match self.kind {
            OperandKind::Def(value) | OperandKind::Use(value) => value,
        }
    }

    /// Whether this operand writes its value.
    #[inline]
    #[must_use]
    pub fn is_def(self) -> bool {
        matches!(self.kind, OperandKind::Def(_))
    }
}

impl core::fmt::Display for Operand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match self.kind {
            OperandKind::Def(_) => "Def",
            OperandKind::Use(_) => "Use",
        };
        let value = self.value();
        match self.constraint {
            OperandConstraint::Reg(class) => write!(f, "{kind}({value}):{class}"),
            OperandConstraint::Fixed(reg) => write!(f, "{kind}({value}):{reg}"),
            OperandConstraint::Any(class) => write!(f, "{kind}({value}):any({class})"),
        }
    }
}

/// A trait defined by the register allocator client to provide access to its
/// machine-instruction / CFG representation.
///
/// See the [module-level documentation] for more details.
///
/// [module-level documentation]: self
pub trait Function {
    /// How many instructions are there?
    fn num_insts(&self) -> usize;

    /// Iterator over all the [`Inst`]s in this function.
    #[inline]
    fn insts(&self) -> Keys<Inst> {
        Keys::with_len(self.num_insts())
    }

    /// How many blocks are there?
    ///
    /// All blocks must be reachable from the entry block.
    fn num_blocks(&self) -> usize;

    /// Iterator over all the [`Block`]s in this function.
    #[inline]
    fn blocks(&self) -> Keys<Block> {
        Keys::with_len(self.num_blocks())
    }

    /// Provide the range of instruction indices contained in each block.
    fn block_insts(&self, block: Block) -> InstRange;

    /// Returns the block containing the given instruction.
    fn inst_block(&self, inst: Inst) -> Block;

    /// Get CFG successors for a given block.
    fn block_succs(&self, block: Block) -> &[Block];

    /// Get CFG predecessors for a given block.
    fn block_preds(&self, block: Block) -> &[Block];

    /// Get the block parameters for a given block.
    ///
    /// Block parameters are only allowed on blocks with more than one
    /// predecessor.
    fn block_params(&self, block: Block) -> &[Value];

    /// If `block` ends with a jump terminator, returns the outgoing block
    /// arguments.
    ///
    /// * Jump arguments are only allowed on blocks with a single successor.
    /// * The number of arguments must match the number of incoming block
    ///   parameters in the successor.
    /// * If a block has outgoing branch arguments then the terminator
    ///   instruction cannot have any operands.
    fn jump_blockparams(&self, block: Block) -> &[Value];

    /// Determine whether an instruction is an end-of-block branch or return.
    ///
    /// All blocks must end with a terminator instruction, and terminator
    /// instructions are not allowed in the body of a block.
    fn inst_is_terminator(&self, inst: Inst) -> bool;

    /// Get the `Operand`s for an instruction.
    fn inst_operands(&self, inst: Inst) -> &[Operand];

    /// Registers whose contents are destroyed by this instruction without
    /// being an output, e.g. the caller-saved set of a call instruction.
    ///
    /// The allocator will not keep any value live in a clobbered register
    /// across the instruction.
    fn inst_clobbers(&self, inst: Inst) -> &[PhysReg];

    /// Returns the estimated execution frequency of this block.
    ///
    /// The bi-directional trace builder grows traces from high-frequency
    /// blocks first and prefers high-frequency edges, so good frequency
    /// estimates directly improve trace quality. The number must be positive.
    fn block_frequency(&self, block: Block) -> f32;

    /// Whether the block is a loop header.
    fn block_is_loop_header(&self, block: Block) -> bool;

    /// Whether the block ends with a loop back-edge.
    fn block_is_loop_end(&self, block: Block) -> bool;

    /// Get the number of SSA values in use in this function.
    fn num_values(&self) -> usize;

    /// Iterator over all the [`Value`]s in this function.
    #[inline]
    fn values(&self) -> Keys<Value> {
        Keys::with_len(self.num_values())
    }

    /// The register class associated with the given value.
    ///
    /// All operand constraints mentioning this value must use this class (or
    /// a fixed register belonging to it), and values linked through block
    /// parameters must share a class.
    fn value_class(&self, value: Value) -> RegClass;

    /// Whether the value is a compile-time constant which can be
    /// rematerialized into any location instead of being copied from a
    /// previous location.
    ///
    /// Constant values have no definition and no storage. They may only
    /// appear as outgoing block arguments; the receiving edge emits a
    /// rematerialization instead of a move. Constant instruction inputs are
    /// the client's own business and are not represented as operands.
    fn value_is_constant(&self, value: Value) -> bool;
}
