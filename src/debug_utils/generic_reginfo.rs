//! A self-contained [`RegInfo`] implementation for tests and experiments.

use alloc::vec::Vec;

use crate::entity::PrimaryMap;
use crate::reginfo::{PhysReg, RegClass, RegInfo};

struct RegData {
    class: RegClass,
    caller_saved: bool,
}

struct ClassData {
    allocation_order: Vec<PhysReg>,
}

/// A concrete register description built up programmatically.
pub struct GenericRegInfo {
    regs: PrimaryMap<PhysReg, RegData>,
    classes: PrimaryMap<RegClass, ClassData>,
}

impl GenericRegInfo {
    /// Creates an empty register description.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regs: PrimaryMap::new(),
            classes: PrimaryMap::new(),
        }
    }

    /// Adds a register class with no registers.
    pub fn add_class(&mut self) -> RegClass {
        self.classes.push(ClassData {
            allocation_order: Vec::new(),
        })
    }

    /// Adds a register to a class, appended to its allocation order.
    pub fn add_reg(&mut self, class: RegClass, caller_saved: bool) -> PhysReg {
        let reg = self.regs.push(RegData {
            class,
            caller_saved,
        });
        self.classes[class].allocation_order.push(reg);
        reg
    }

    /// Convenience constructor: a single class with `num_regs` caller-saved
    /// registers.
    #[must_use]
    pub fn with_reg_count(num_regs: usize) -> (Self, RegClass) {
        let mut reginfo = Self::new();
        let class = reginfo.add_class();
        for _ in 0..num_regs {
            reginfo.add_reg(class, true);
        }
        (reginfo, class)
    }
}

impl Default for GenericRegInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl RegInfo for GenericRegInfo {
    fn num_regs(&self) -> usize {
        self.regs.len()
    }

    fn num_classes(&self) -> usize {
        self.classes.len()
    }

    fn reg_class(&self, reg: PhysReg) -> RegClass {
        self.regs[reg].class
    }

    fn allocation_order(&self, class: RegClass) -> &[PhysReg] {
        &self.classes[class].allocation_order
    }

    fn is_caller_saved(&self, reg: PhysReg) -> bool {
        self.regs[reg].caller_saved
    }
}
