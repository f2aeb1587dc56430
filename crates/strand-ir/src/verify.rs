//! Structural checks run before a function is handed to the emitter.

use std::collections::BTreeSet;

use crate::{BlockId, Function, InstKind, IrError, Operand, Program};

fn malformed(function: &Function, reason: impl Into<String>) -> IrError {
    IrError::Malformed {
        function: function.name.clone(),
        reason: reason.into(),
    }
}

pub fn verify_function(function: &Function) -> Result<(), IrError> {
    let block_count = function.blocks.len() as u32;
    let in_range = |id: BlockId| id.0 < block_count;

    for (i, block) in function.blocks.iter().enumerate() {
        if block.index.index() != i {
            return Err(malformed(
                function,
                format!("block at position {i} is numbered {}", block.index.0),
            ));
        }
        for succ in block.succs() {
            if !in_range(succ) {
                return Err(malformed(
                    function,
                    format!("block {i} jumps to missing block {}", succ.0),
                ));
            }
            let target = &function.blocks[succ.index()];
            if !target.preds.contains(&block.index) {
                return Err(malformed(
                    function,
                    format!("block {} does not list {i} as a predecessor", succ.0),
                ));
            }
        }
        for pred in &block.preds {
            let listed = function
                .block(*pred)
                .is_some_and(|p| p.succs().contains(&block.index));
            if !listed {
                return Err(malformed(
                    function,
                    format!("block {i} lists {} as a predecessor without an edge", pred.0),
                ));
            }
        }
        let mut seen_other = false;
        for inst in &block.instrs {
            match &inst.kind {
                InstKind::Phi { edges } => {
                    if seen_other {
                        return Err(malformed(
                            function,
                            format!("phi after a non-phi instruction in block {i}"),
                        ));
                    }
                    if edges.len() != block.preds.len() {
                        return Err(malformed(
                            function,
                            format!(
                                "phi in block {i} has {} edges for {} predecessors",
                                edges.len(),
                                block.preds.len()
                            ),
                        ));
                    }
                }
                _ => seen_other = true,
            }
        }
    }

    let mut defined = BTreeSet::new();
    for (block, _, inst) in function.instructions() {
        if let Some(dest) = inst.dest
            && !defined.insert(dest)
        {
            return Err(malformed(
                function,
                format!("value %{} defined twice (again in block {})", dest.0, block.0),
            ));
        }
    }
    let check_operand = |op: &Operand| -> Result<(), IrError> {
        match op {
            Operand::Value(id) if !defined.contains(id) => {
                Err(malformed(function, format!("use of undefined value %{}", id.0)))
            }
            Operand::Param(i) if *i as usize >= function.params.len() => {
                Err(malformed(function, format!("parameter {i} out of range")))
            }
            Operand::FreeVar(i) if *i as usize >= function.free_vars.len() => {
                Err(malformed(function, format!("free variable {i} out of range")))
            }
            _ => Ok(()),
        }
    };
    for block in &function.blocks {
        for inst in &block.instrs {
            inst.kind.operands().into_iter().try_for_each(check_operand)?;
        }
        block
            .terminator
            .operands()
            .into_iter()
            .try_for_each(check_operand)?;
    }

    if let Some(recover) = function.recover
        && !in_range(recover)
    {
        return Err(malformed(
            function,
            format!("recover block {} out of range", recover.0),
        ));
    }
    Ok(())
}

/// Verify every function with a body. Returns one error per bad function.
pub fn verify_program(program: &Program) -> Vec<IrError> {
    program
        .functions
        .iter()
        .filter(|f| f.has_body())
        .filter_map(|f| verify_function(f).err())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FunctionBuilder, Terminator, Type, ValueId};

    #[test]
    fn builder_output_verifies() {
        let mut b = FunctionBuilder::new("main.loop").param("n", Type::Int);
        let body = b.block("body");
        b.jump(body);
        b.switch_to(body);
        b.branch(Operand::Param(0), body, BlockId(0));
        let f = b.finish();
        verify_function(&f).unwrap();
    }

    #[test]
    fn phi_edge_count_must_match_predecessors() {
        let mut b = FunctionBuilder::new("main.bad");
        let next = b.block("next");
        b.jump(next);
        b.switch_to(next);
        b.phi(Type::Int, vec![Operand::int(1), Operand::int(2)]);
        let f = b.finish();
        let err = verify_function(&f).unwrap_err();
        assert!(err.to_string().contains("2 edges for 1 predecessors"));
    }

    #[test]
    fn undefined_values_are_rejected() {
        let mut b = FunctionBuilder::new("main.undef");
        b.ret(vec![Operand::Value(ValueId(9))]);
        let err = verify_function(&b.finish()).unwrap_err();
        assert!(err.to_string().contains("undefined value %9"));
    }

    #[test]
    fn edges_must_be_mirrored_in_predecessor_lists() {
        let mut b = FunctionBuilder::new("main.edges");
        let next = b.block("next");
        b.jump(next);
        let mut f = b.finish();
        f.blocks[1].preds.clear();
        assert!(verify_function(&f).is_err());
        f.blocks[1].preds.push(BlockId(0));
        f.blocks[0].terminator = Terminator::Return { results: vec![] };
        assert!(verify_function(&f).is_err());
    }
}
