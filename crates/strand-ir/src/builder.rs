//! Programmatic construction of SSA functions.
//!
//! Mostly used by tests and tools that synthesise small programs. Values are
//! numbered in creation order; predecessors are derived from terminators in
//! block order when the function is finished, so phi edges must be listed in
//! ascending predecessor-block order.

use std::collections::BTreeMap;

use crate::{
    BasicBlock, BinaryOp, BlockId, CallCommon, CallMode, Callee, Function, InstKind, Instruction,
    Operand, Param, Terminator, Type, ValueId,
};

#[derive(Debug)]
struct PendingBlock {
    comment: String,
    instrs: Vec<Instruction>,
    terminator: Option<Terminator>,
}

#[derive(Debug)]
pub struct FunctionBuilder {
    function: Function,
    blocks: Vec<PendingBlock>,
    current: usize,
    next_value: u32,
}

impl FunctionBuilder {
    /// Start a function with an entry block already selected.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            function: Function {
                name: name.into(),
                ..Function::default()
            },
            blocks: vec![PendingBlock {
                comment: "entry".to_string(),
                instrs: Vec::new(),
                terminator: None,
            }],
            current: 0,
            next_value: 0,
        }
    }

    pub fn param(mut self, name: &str, ty: Type) -> Self {
        self.function.params.push(Param::new(name, ty));
        self
    }

    pub fn free_var(mut self, name: &str, ty: Type) -> Self {
        self.function.free_vars.push(Param::new(name, ty));
        self
    }

    pub fn result(mut self, ty: Type) -> Self {
        self.function.results.push(ty);
        self
    }

    pub fn may_suspend(mut self, flag: bool) -> Self {
        self.function.may_suspend = Some(flag);
        self
    }

    pub fn set_recover(&mut self, block: BlockId) {
        self.function.recover = Some(block);
    }

    pub fn block(&mut self, comment: &str) -> BlockId {
        self.blocks.push(PendingBlock {
            comment: comment.to_string(),
            instrs: Vec::new(),
            terminator: None,
        });
        BlockId((self.blocks.len() - 1) as u32)
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block.index();
    }

    pub fn current(&self) -> BlockId {
        BlockId(self.current as u32)
    }

    /// Append an instruction producing a value of type `ty`.
    pub fn push(&mut self, ty: Type, kind: InstKind) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        self.blocks[self.current].instrs.push(Instruction {
            dest: Some(id),
            ty,
            kind,
            pos: None,
        });
        id
    }

    /// Append an instruction that produces no value.
    pub fn effect(&mut self, kind: InstKind) {
        self.blocks[self.current].instrs.push(Instruction {
            dest: None,
            ty: Type::void(),
            kind,
            pos: None,
        });
    }

    pub fn binop(&mut self, ty: Type, op: BinaryOp, x: Operand, y: Operand) -> ValueId {
        self.push(ty, InstKind::BinOp { op, x, y })
    }

    pub fn phi(&mut self, ty: Type, edges: Vec<Operand>) -> ValueId {
        self.push(ty, InstKind::Phi { edges })
    }

    pub fn recv(&mut self, ty: Type, chan: Operand, comma_ok: bool) -> ValueId {
        self.push(ty, InstKind::Recv { chan, comma_ok })
    }

    pub fn send(&mut self, chan: Operand, value: Operand) {
        self.effect(InstKind::Send { chan, value });
    }

    pub fn call(&mut self, ty: Type, callee: Callee, args: Vec<Operand>, mode: CallMode) -> ValueId {
        self.push(
            ty,
            InstKind::Call {
                call: CallCommon { callee, args },
                mode,
            },
        )
    }

    pub fn call_static(&mut self, ty: Type, name: &str, args: Vec<Operand>) -> ValueId {
        self.call(
            ty,
            Callee::Value(Operand::Function(name.to_string())),
            args,
            CallMode::Normal,
        )
    }

    pub fn builtin(&mut self, ty: Type, name: &str, args: Vec<Operand>) -> ValueId {
        self.call(ty, Callee::Builtin(name.to_string()), args, CallMode::Normal)
    }

    pub fn terminate(&mut self, terminator: Terminator) {
        self.blocks[self.current].terminator = Some(terminator);
    }

    pub fn jump(&mut self, target: BlockId) {
        self.terminate(Terminator::Jump { target });
    }

    pub fn branch(&mut self, cond: Operand, then_block: BlockId, else_block: BlockId) {
        self.terminate(Terminator::If {
            cond,
            then_block,
            else_block,
        });
    }

    pub fn ret(&mut self, results: Vec<Operand>) {
        self.terminate(Terminator::Return { results });
    }

    pub fn panic(&mut self, value: Operand) {
        self.terminate(Terminator::Panic { value });
    }

    /// Seal the function. Blocks left without a terminator return nothing.
    pub fn finish(self) -> Function {
        let mut function = self.function;
        let mut preds: BTreeMap<u32, Vec<BlockId>> = BTreeMap::new();
        let terminators: Vec<Terminator> = self
            .blocks
            .iter()
            .map(|b| {
                b.terminator
                    .clone()
                    .unwrap_or(Terminator::Return { results: Vec::new() })
            })
            .collect();
        for (i, term) in terminators.iter().enumerate() {
            for succ in term.succs() {
                let list = preds.entry(succ.0).or_default();
                if !list.contains(&BlockId(i as u32)) {
                    list.push(BlockId(i as u32));
                }
            }
        }
        function.blocks = self
            .blocks
            .into_iter()
            .zip(terminators)
            .enumerate()
            .map(|(i, (pending, terminator))| BasicBlock {
                index: BlockId(i as u32),
                comment: pending.comment,
                preds: preds.remove(&(i as u32)).unwrap_or_default(),
                instrs: pending.instrs,
                terminator,
            })
            .collect();
        function
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_derives_predecessors_in_block_order() {
        let mut b = FunctionBuilder::new("main.diamond").param("c", Type::Bool);
        let left = b.block("left");
        let right = b.block("right");
        let join = b.block("join");
        b.branch(Operand::Param(0), left, right);
        b.switch_to(right);
        b.jump(join);
        b.switch_to(left);
        b.jump(join);
        b.switch_to(join);
        let phi = b.phi(Type::Int, vec![Operand::int(1), Operand::int(2)]);
        b.ret(vec![phi.into()]);
        let f = b.finish();

        assert_eq!(f.blocks[3].preds, vec![BlockId(1), BlockId(2)]);
        assert!(f.blocks[3].has_phi());
        assert_eq!(f.blocks[0].succs(), vec![left, right]);
    }

    #[test]
    fn unterminated_blocks_return() {
        let f = FunctionBuilder::new("main.empty").finish();
        assert_eq!(
            f.blocks[0].terminator,
            Terminator::Return { results: vec![] }
        );
    }
}
