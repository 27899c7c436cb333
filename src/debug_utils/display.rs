//! Pretty-printing of input functions.

use core::fmt;

use crate::function::Function;

/// Wrapper around a [`Function`] which implements `Display` to dump the
/// function in a human-readable form.
pub struct DisplayFunction<'a, F>(pub &'a F);

impl<F: Function> fmt::Display for DisplayFunction<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let func = self.0;
        for block in func.blocks() {
            write!(f, "{block}")?;
            if !func.block_params(block).is_empty() {
                write!(f, "(")?;
                for (i, param) in func.block_params(block).iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{param}")?;
                }
                write!(f, ")")?;
            }
            writeln!(
                f,
                ": // preds: {:?} succs: {:?} freq: {}",
                func.block_preds(block),
                func.block_succs(block),
                func.block_frequency(block)
            )?;
            for inst in func.block_insts(block).iter() {
                write!(f, "  {inst}:")?;
                for operand in func.inst_operands(inst) {
                    write!(f, " {operand}")?;
                }
                if !func.inst_clobbers(inst).is_empty() {
                    write!(f, " clobbers: {:?}", func.inst_clobbers(inst))?;
                }
                if func.inst_is_terminator(inst) {
                    let params = func.jump_blockparams(block);
                    if !params.is_empty() {
                        write!(f, " jump_args: {params:?}")?;
                    }
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
