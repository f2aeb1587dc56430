//! Block and dispatch emission for one function.
//!
//! The emitter walks blocks in declaration order. Straight-line code goes
//! into the currently open unit; everything that transfers control (jumps,
//! branches, suspension, resume arms) is written between units. Instruction
//! kinds with their own protocols live in `calls`, `channels` and `defer`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use strand_diag::{Category, Diagnostic};
use strand_ir::{BasicBlock, Function, InstKind, Instruction, Operand, Terminator, Type, ValueId};
use tracing::debug;

use crate::continuation::{ArmKind, PseudoArm, PseudoBlocks};
use crate::layout::{LayoutEngine, LayoutError};
use crate::storage::{Init, StorageMode, StoragePlan, plan_function, zero_of};
use crate::target::{
    FrameDecl, ParamDecl, RegKey, Register, RegisterDecl, StorageClass, Target, ValueOp,
};
use crate::{CodegenError, FunctionStats, GenContext};

/// What the emitter records about a function besides its text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EmissionTrace {
    /// Forward block arms in emission order.
    pub blocks: Vec<u32>,
    /// Pseudo-block arms in emission order.
    pub arms: Vec<PseudoArm>,
    pub classes: BTreeMap<ValueId, StorageClass>,
    pub array_mode: bool,
    pub split: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionOutput {
    pub text: String,
    pub warnings: Vec<Diagnostic>,
    pub stats: FunctionStats,
    pub trace: EmissionTrace,
}

struct OpenUnit {
    id: u32,
    body: String,
}

pub(crate) struct FunctionEmitter<'a, T: Target + ?Sized> {
    pub(crate) ctx: &'a GenContext<'a>,
    pub(crate) target: &'a T,
    pub(crate) function: &'a Function,
    pub(crate) plan: &'a StoragePlan,
    pub(crate) layout: &'a mut LayoutEngine,
    pub(crate) pseudo: PseudoBlocks,
    pub(crate) warnings: Vec<Diagnostic>,
    pub(crate) stats: FunctionStats,
    out: String,
    unit: Option<OpenUnit>,
    next_guard: u32,
    subs: Vec<(u32, String)>,
    blocks: Vec<u32>,
}

/// Generate one function with a body.
pub fn emit_function<T: Target + ?Sized>(
    ctx: &GenContext<'_>,
    target: &T,
    layout: &mut LayoutEngine,
    function: &Function,
) -> Result<FunctionOutput, CodegenError> {
    if function.may_suspend == Some(false) && ctx.suspends(&function.name) {
        return Err(CodegenError::MalformedFunction {
            function: function.name.clone(),
            reason: "marked as never suspending but contains a suspension point".to_string(),
        });
    }
    let plan = plan_function(ctx, function, layout, target.limits())?;
    let mut emitter = FunctionEmitter {
        ctx,
        target,
        function,
        plan: &plan,
        layout,
        pseudo: PseudoBlocks::new(),
        warnings: Vec::new(),
        stats: FunctionStats::new(&function.name),
        out: String::new(),
        unit: None,
        next_guard: 1,
        subs: Vec::new(),
        blocks: Vec::new(),
    };
    for block in &function.blocks {
        emitter.emit_block(block)?;
    }
    for stub in emitter.pseudo.flush() {
        let text = target.stub_arm(stub);
        emitter.raw(text);
    }
    emitter.finish()
}

impl<'a, T: Target + ?Sized> FunctionEmitter<'a, T> {
    // -- output -------------------------------------------------------------

    /// Append to the open unit, or between units when none is open.
    pub(crate) fn line(&mut self, text: String) {
        let sink = match self.unit.as_mut() {
            Some(unit) => &mut unit.body,
            None => &mut self.out,
        };
        push_line(sink, &text);
    }

    /// Append between units.
    pub(crate) fn raw(&mut self, text: String) {
        push_line(&mut self.out, &text);
    }

    pub(crate) fn open_unit(&mut self) {
        let id = self.next_guard;
        self.next_guard += 1;
        self.unit = Some(OpenUnit {
            id,
            body: String::new(),
        });
    }

    pub(crate) fn close_unit(&mut self) {
        let Some(unit) = self.unit.take() else {
            return;
        };
        if unit.body.is_empty() {
            return;
        }
        self.stats.units += 1;
        if self.plan.split {
            let call = self.target.sub_call(unit.id);
            self.subs.push((unit.id, unit.body));
            self.raw(call);
        } else {
            let start = self.target.guard_start(unit.id);
            let end = self.target.guard_end(unit.id);
            push_line(&mut self.out, &start);
            self.out.push_str(&unit.body);
            push_line(&mut self.out, &end);
        }
    }

    /// Close the unit, park the frame at `addr` and open its resume arm.
    /// `prelude` runs after the unit and before the frame yields.
    pub(crate) fn suspend_at(&mut self, addr: i64, prelude: Option<String>) {
        self.close_unit();
        if let Some(prelude) = prelude {
            self.raw(prelude);
        }
        let next = self.target.set_next(addr);
        let suspend = self.target.suspend();
        self.raw(next);
        self.raw(suspend);
        for stub in self.pseudo.resume(addr) {
            let text = self.target.stub_arm(stub);
            self.raw(text);
        }
        let arm = self.target.resume_arm(addr);
        self.raw(arm);
        if self.ctx.config.trace {
            let trace = self.target.trace(&self.function.name, addr);
            self.raw(trace);
        }
    }

    // -- operands -----------------------------------------------------------

    pub(crate) fn layout_err(&self, source: LayoutError) -> CodegenError {
        CodegenError::Layout {
            function: self.function.name.clone(),
            source,
        }
    }

    pub(crate) fn operand(&self, operand: &Operand) -> Result<String, CodegenError> {
        Ok(match operand {
            Operand::Value(id) => {
                let class =
                    self.plan
                        .class_of(*id)
                        .ok_or_else(|| CodegenError::MalformedFunction {
                            function: self.function.name.clone(),
                            reason: format!("value v{} is read but never stored", id.0),
                        })?;
                self.target.register(&Register {
                    key: RegKey::Value(*id),
                    class,
                })
            }
            Operand::Param(i) => self.target.param(*i as usize),
            Operand::FreeVar(i) => self.target.free_var(*i as usize),
            Operand::Global(name) => self.target.global(name),
            Operand::Function(name) => self.target.function_ref(name),
            Operand::Const(constant) => self.target.constant(constant),
        })
    }

    pub(crate) fn operands<'o>(
        &self,
        operands: impl IntoIterator<Item = &'o Operand>,
    ) -> Result<Vec<String>, CodegenError> {
        operands.into_iter().map(|op| self.operand(op)).collect()
    }

    pub(crate) fn operand_type(&self, operand: &Operand) -> Type {
        self.function.operand_type(operand, self.ctx.program)
    }

    pub(crate) fn zero_token(&mut self, ty: &Type) -> Result<String, CodegenError> {
        let zero = zero_of(ty, self.layout).map_err(|e| self.layout_err(e))?;
        Ok(self.target.zero_value(&zero))
    }

    /// Width to copy when a value of `ty` is an aggregate.
    pub(crate) fn width_of(&mut self, ty: &Type) -> Result<Option<u64>, CodegenError> {
        match ty.underlying() {
            Type::Struct(_) | Type::Array { .. } => self
                .layout
                .size_of(ty)
                .map(Some)
                .map_err(|e| self.layout_err(e)),
            _ => Ok(None),
        }
    }

    fn init_token(&self, init: &Init) -> Option<String> {
        match init {
            Init::Deferred => None,
            Init::Zero(zero) => Some(self.target.zero_value(zero)),
        }
    }

    /// Storage name for the value an instruction defines; declares temps
    /// in place. `None` when the value is dead or there is none.
    pub(crate) fn define(&mut self, inst: &Instruction) -> Option<String> {
        let id = inst.dest?;
        let info = self.plan.registers.get(&id)?;
        let name = self.target.register(&Register {
            key: RegKey::Value(id),
            class: info.class,
        });
        if info.class == StorageClass::Temp {
            let init = self.init_token(&info.init);
            let decl = self.target.declare_temp(&name, init.as_deref());
            self.line(decl);
        }
        Some(name)
    }

    pub(crate) fn warn(&mut self, category: Category, message: String) {
        tracing::warn!(function = %self.function.name, %message, "generation warning");
        self.warnings
            .push(Diagnostic::warning(category, message).in_unit(self.function.name.clone()));
    }

    // -- blocks -------------------------------------------------------------

    fn emit_block(&mut self, block: &BasicBlock) -> Result<(), CodegenError> {
        let index = block.index.0;
        self.blocks.push(index);
        let start = self.target.block_start(index);
        self.raw(start);
        if self.ctx.config.debug {
            let text = if block.comment.is_empty() {
                format!("block {index}")
            } else {
                format!("block {index}: {}", block.comment)
            };
            let comment = self.target.comment(&text);
            self.raw(comment);
        }
        if self.ctx.config.trace {
            let trace = self.target.trace(&self.function.name, i64::from(index));
            self.raw(trace);
        }
        self.open_unit();
        self.emit_phis(block)?;

        for (position, inst) in block.instrs.iter().enumerate() {
            if matches!(inst.kind, InstKind::Phi { .. }) {
                continue;
            }
            if self.ctx.config.debug
                && let Some(pos) = &inst.pos
            {
                let marker = self.target.position(pos);
                self.line(marker);
            }
            self.emit_instruction(block, position, inst)?;
        }
        self.emit_terminator(block)
    }

    fn emit_phis(&mut self, block: &BasicBlock) -> Result<(), CodegenError> {
        let staged = self.plan.staged.contains(&block.index);
        let mut copies = Vec::new();
        for inst in &block.instrs {
            let InstKind::Phi { edges } = &inst.kind else {
                continue;
            };
            let Some(id) = inst.dest.filter(|d| self.plan.registers.contains_key(d)) else {
                self.stats.skipped += 1;
                continue;
            };
            let mut rendered = Vec::with_capacity(edges.len());
            for (pred, edge) in block.preds.iter().zip(edges) {
                rendered.push((pred.0, self.operand(edge)?));
            }
            let zero = self.zero_token(&inst.ty)?;
            if staged {
                let stage = self.target.register(&Register {
                    key: RegKey::Stage(id),
                    class: StorageClass::Temp,
                });
                let decl = self.target.declare_temp(&stage, None);
                self.line(decl);
                let phi = self.target.phi(&stage, &zero, &rendered);
                self.line(phi);
                copies.push((inst, stage));
            } else if let Some(dest) = self.define(inst) {
                let phi = self.target.phi(&dest, &zero, &rendered);
                self.line(phi);
            }
        }
        for (inst, stage) in copies {
            if let Some(dest) = self.define(inst) {
                let copy = self.target.value(Some(&dest), &ValueOp::Copy(stage));
                self.line(copy);
            }
        }
        Ok(())
    }

    fn emit_instruction(
        &mut self,
        block: &BasicBlock,
        position: usize,
        inst: &Instruction,
    ) -> Result<(), CodegenError> {
        match &inst.kind {
            InstKind::Phi { .. } => Ok(()),
            InstKind::Unknown => Err(CodegenError::UnknownInstruction {
                function: self.function.name.clone(),
                block: block.index.0,
                op: inst.kind.name().to_string(),
            }),
            InstKind::Call { call, mode } => self.emit_call(block.index, position, inst, call, *mode),
            InstKind::Send { chan, value } => self.emit_send(chan, value),
            InstKind::Recv { chan, comma_ok } => self.emit_recv(inst, chan, *comma_ok),
            InstKind::Select { states, blocking } => self.emit_select(inst, states, *blocking),
            InstKind::RunDefers => {
                self.emit_run_defers();
                Ok(())
            }
            InstKind::Store { addr, value } => {
                let value_ty = self.operand_type(value);
                let width = self.width_of(&value_ty)?;
                let text = self
                    .target
                    .store(&self.operand(addr)?, &self.operand(value)?, width);
                self.line(text);
                Ok(())
            }
            InstKind::MapUpdate { map, key, value } => {
                let text = self.target.map_update(
                    &self.operand(map)?,
                    &self.operand(key)?,
                    &self.operand(value)?,
                );
                self.line(text);
                Ok(())
            }
            kind => {
                let live = inst.dest.is_some_and(|d| self.plan.registers.contains_key(&d));
                if !live && kind.is_pure() {
                    self.stats.skipped += 1;
                    return Ok(());
                }
                let op = self.lower_value(inst)?;
                let dest = self.define(inst);
                let text = self.target.value(dest.as_deref(), &op);
                self.line(text);
                Ok(())
            }
        }
    }

    fn succ_has_phi(&self, block: &BasicBlock) -> bool {
        block
            .succs()
            .iter()
            .any(|s| self.function.block(*s).is_some_and(BasicBlock::has_phi))
    }

    fn emit_terminator(&mut self, block: &BasicBlock) -> Result<(), CodegenError> {
        match &block.terminator {
            Terminator::Panic { value } => self.emit_panic(value),
            Terminator::Jump { target } => {
                self.close_unit();
                if self.succ_has_phi(block) {
                    let tag = self.target.phi_tag(block.index.0);
                    self.raw(tag);
                }
                let jump = self.target.jump(target.0);
                self.raw(jump);
                Ok(())
            }
            Terminator::If {
                cond,
                then_block,
                else_block,
            } => {
                self.close_unit();
                let cond = self.operand(cond)?;
                if self.succ_has_phi(block) {
                    let tag = self.target.phi_tag(block.index.0);
                    self.raw(tag);
                }
                let branch = self.target.branch(&cond, then_block.0, else_block.0);
                self.raw(branch);
                Ok(())
            }
            Terminator::Return { results } => {
                self.close_unit();
                let results = self.operands(results)?;
                let ret = self.target.ret(&results);
                self.raw(ret);
                Ok(())
            }
        }
    }

    // -- assembly -----------------------------------------------------------

    fn declarations(&self) -> (FrameDecl, Vec<RegisterDecl>) {
        let mut fields = Vec::new();
        let mut locals = Vec::new();
        for (id, info) in &self.plan.registers {
            let name = self.target.register(&Register {
                key: RegKey::Value(*id),
                class: info.class,
            });
            let decl = RegisterDecl {
                name,
                init: self.init_token(&info.init),
                ty: info.ty.to_string(),
            };
            match info.class {
                StorageClass::Field => fields.push(decl),
                StorageClass::Local => locals.push(decl),
                StorageClass::Temp | StorageClass::Array(_) => {}
            }
        }
        let f = self.function;
        let decl = FrameDecl {
            name: f.name.clone(),
            params: f
                .params
                .iter()
                .enumerate()
                .map(|(index, p)| ParamDecl {
                    index,
                    name: if p.is_blank() { "_".to_string() } else { p.name.clone() },
                    ty: p.ty.to_string(),
                })
                .collect(),
            free_vars: f.free_vars.len(),
            results: f.results.len(),
            suspends: self.plan.suspends,
            recover: f.recover.map(|b| b.0),
            public: f.public,
            fields,
            array_slots: self.plan.array_slots,
            slots: self.plan.slots.clone(),
            selects: self.plan.selects.clone(),
            stack_allocs: self.plan.stack_allocs.clone(),
            uses_phi: self.plan.uses_phi,
            split: self.plan.split,
        };
        (decl, locals)
    }

    fn finish(mut self) -> Result<FunctionOutput, CodegenError> {
        self.close_unit();
        let (decl, locals) = self.declarations();
        let mut text = String::new();
        push_line(&mut text, &self.target.func_start(&decl));
        push_line(&mut text, &self.target.run_start(&locals));
        text.push_str(&self.out);
        for (id, body) in &self.subs {
            push_line(&mut text, &self.target.sub_def(*id, body));
        }
        push_line(&mut text, &self.target.func_end(&decl));

        let plan = self.plan;
        let arms = self.pseudo.into_arms();
        let mut stats = self.stats;
        stats.blocks = self.blocks.len();
        stats.fields = plan.count(|c| c == StorageClass::Field);
        stats.temps = plan.count(|c| c == StorageClass::Temp);
        stats.locals = plan.count(|c| c == StorageClass::Local);
        stats.array_slots = plan.array_slots;
        stats.dead = plan.dead.len();
        stats.pseudo_blocks = arms.len();
        stats.stubs = arms
            .iter()
            .filter(|a| a.kind == ArmKind::Stub)
            .count();
        stats.suspends = plan.suspends;
        stats.split = plan.split;
        stats.array_mode = plan.mode == StorageMode::Array;

        debug!(
            function = %stats.function,
            blocks = stats.blocks,
            fields = stats.fields,
            temps = stats.temps,
            locals = stats.locals,
            pseudo_blocks = stats.pseudo_blocks,
            array_mode = stats.array_mode,
            split = stats.split,
            "generated function"
        );

        Ok(FunctionOutput {
            text,
            warnings: self.warnings,
            trace: EmissionTrace {
                blocks: self.blocks,
                arms,
                classes: plan
                    .registers
                    .iter()
                    .map(|(id, info)| (*id, info.class))
                    .collect(),
                array_mode: stats.array_mode,
                split: stats.split,
            },
            stats,
        })
    }
}

fn push_line(sink: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    let _ = writeln!(sink, "{}", text.trim_end_matches('\n'));
}
