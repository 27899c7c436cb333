//! A self-contained [`Function`] implementation for tests and experiments.
//!
//! `GenericFunction` is built programmatically: create blocks in their
//! linear order, fill each block with instructions before starting the next
//! one (instruction indices must be contiguous per block), and connect
//! blocks with the terminator helpers which maintain the
//! predecessor/successor lists.

use alloc::vec::Vec;

use crate::entity::PrimaryMap;
use crate::function::{Block, Function, Inst, InstRange, Operand, Value};
use crate::reginfo::{PhysReg, RegClass};

struct BlockData {
    insts: InstRange,
    preds: Vec<Block>,
    succs: Vec<Block>,
    params: Vec<Value>,
    jump_params: Vec<Value>,
    frequency: f32,
    loop_header: bool,
    loop_end: bool,
}

struct InstData {
    block: Block,
    operands: Vec<Operand>,
    clobbers: Vec<PhysReg>,
    terminator: bool,
}

struct ValueData {
    class: RegClass,
    constant: bool,
}

/// A concrete function built up through a simple builder API.
pub struct GenericFunction {
    blocks: PrimaryMap<Block, BlockData>,
    insts: PrimaryMap<Inst, InstData>,
    values: PrimaryMap<Value, ValueData>,
}

impl GenericFunction {
    /// Creates an empty function.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: PrimaryMap::new(),
            insts: PrimaryMap::new(),
            values: PrimaryMap::new(),
        }
    }

    /// Creates a new SSA value of the given class.
    pub fn new_value(&mut self, class: RegClass) -> Value {
        self.values.push(ValueData {
            class,
            constant: false,
        })
    }

    /// Creates a constant value of the given class.
    ///
    /// Constants are rematerialized instead of moved.
    pub fn new_constant(&mut self, class: RegClass) -> Value {
        self.values.push(ValueData {
            class,
            constant: true,
        })
    }

    /// Creates the next block in linear order.
    pub fn create_block(&mut self, frequency: f32) -> Block {
        let next_inst = self.insts.next_key();
        self.blocks.push(BlockData {
            insts: InstRange::new(next_inst, next_inst),
            preds: Vec::new(),
            succs: Vec::new(),
            params: Vec::new(),
            jump_params: Vec::new(),
            frequency,
            loop_header: false,
            loop_end: false,
        })
    }

    /// Declares block parameters (phi targets) for a merge block.
    pub fn set_block_params(&mut self, block: Block, params: &[Value]) {
        self.blocks[block].params = params.into();
    }

    /// Marks the block's loop membership flags.
    pub fn set_loop_flags(&mut self, block: Block, header: bool, end: bool) {
        self.blocks[block].loop_header = header;
        self.blocks[block].loop_end = end;
    }

    fn push_inst(
        &mut self,
        block: Block,
        operands: &[Operand],
        clobbers: &[PhysReg],
        terminator: bool,
    ) -> Inst {
        let next = self.insts.next_key();
        let range = self.blocks[block].insts;
        if range.is_empty() {
            // First instruction of the block: all earlier blocks must be
            // complete so that instruction indices stay contiguous.
            if block.index() > 0 {
                let prev = self.blocks[block.prev()].insts;
                assert_eq!(prev.to, next, "blocks must be filled in linear order");
                assert!(
                    !prev.is_empty() && self.insts[prev.last()].terminator,
                    "previous block not terminated"
                );
            } else {
                assert_eq!(next.index(), 0);
            }
            self.blocks[block].insts = InstRange::new(next, next);
        } else {
            assert_eq!(range.to, next, "instructions of a block must be contiguous");
            assert!(
                !self.insts[range.last()].terminator,
                "block already terminated"
            );
        }
        let inst = self.insts.push(InstData {
            block,
            operands: operands.into(),
            clobbers: clobbers.into(),
            terminator,
        });
        self.blocks[block].insts.to = self.insts.next_key();
        inst
    }

    /// Appends a normal instruction to the block.
    pub fn add_inst(&mut self, block: Block, operands: &[Operand]) -> Inst {
        self.push_inst(block, operands, &[], false)
    }

    /// Appends an instruction with a clobber list, e.g. a call.
    pub fn add_inst_with_clobbers(
        &mut self,
        block: Block,
        operands: &[Operand],
        clobbers: &[PhysReg],
    ) -> Inst {
        self.push_inst(block, operands, clobbers, false)
    }

    /// Terminates the block with an unconditional jump, optionally passing
    /// outgoing block arguments.
    pub fn add_jump(&mut self, block: Block, target: Block, args: &[Value]) -> Inst {
        let inst = self.push_inst(block, &[], &[], true);
        self.blocks[block].jump_params = args.into();
        self.add_edge(block, target);
        inst
    }

    /// Terminates the block with a branch to several targets.
    pub fn add_branch(&mut self, block: Block, operands: &[Operand], targets: &[Block]) -> Inst {
        let inst = self.push_inst(block, operands, &[], true);
        for &target in targets {
            self.add_edge(block, target);
        }
        inst
    }

    /// Terminates the block with a return.
    pub fn add_ret(&mut self, block: Block, operands: &[Operand]) -> Inst {
        self.push_inst(block, operands, &[], true)
    }

    fn add_edge(&mut self, from: Block, to: Block) {
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }
}

impl Default for GenericFunction {
    fn default() -> Self {
        Self::new()
    }
}

impl Function for GenericFunction {
    fn num_insts(&self) -> usize {
        self.insts.len()
    }

    fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn block_insts(&self, block: Block) -> InstRange {
        self.blocks[block].insts
    }

    fn inst_block(&self, inst: Inst) -> Block {
        self.insts[inst].block
    }

    fn block_succs(&self, block: Block) -> &[Block] {
        &self.blocks[block].succs
    }

    fn block_preds(&self, block: Block) -> &[Block] {
        &self.blocks[block].preds
    }

    fn block_params(&self, block: Block) -> &[Value] {
        &self.blocks[block].params
    }

    fn jump_blockparams(&self, block: Block) -> &[Value] {
        &self.blocks[block].jump_params
    }

    fn inst_is_terminator(&self, inst: Inst) -> bool {
        self.insts[inst].terminator
    }

    fn inst_operands(&self, inst: Inst) -> &[Operand] {
        &self.insts[inst].operands
    }

    fn inst_clobbers(&self, inst: Inst) -> &[PhysReg] {
        &self.insts[inst].clobbers
    }

    fn block_frequency(&self, block: Block) -> f32 {
        self.blocks[block].frequency
    }

    fn block_is_loop_header(&self, block: Block) -> bool {
        self.blocks[block].loop_header
    }

    fn block_is_loop_end(&self, block: Block) -> bool {
        self.blocks[block].loop_end
    }

    fn num_values(&self) -> usize {
        self.values.len()
    }

    fn value_class(&self, value: Value) -> RegClass {
        self.values[value].class
    }

    fn value_is_constant(&self, value: Value) -> bool {
        self.values[value].constant
    }
}
