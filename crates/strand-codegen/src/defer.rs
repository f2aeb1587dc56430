//! `go`, `defer`, deferred-call teardown and `panic`.

use strand_ir::{CallCommon, Instruction, Operand};

use crate::CodegenError;
use crate::calls::CallPlan;
use crate::emit::FunctionEmitter;
use crate::target::Target;

impl<T: Target + ?Sized> FunctionEmitter<'_, T> {
    /// Start the callee on a new task, then give the scheduler a turn.
    pub(crate) fn emit_go(
        &mut self,
        inst: &Instruction,
        call: &CallCommon,
        plan: CallPlan,
    ) -> Result<(), CodegenError> {
        let callee = match plan {
            CallPlan::Frame { callee, .. } => callee,
            CallPlan::Missing { name } => {
                self.emit_missing(inst, &name);
                return Ok(());
            }
            CallPlan::Builtin(_) => return Ok(()),
        };
        let args = self.operands(&call.args)?;
        let frame = self.frame_callee(&callee)?;
        let spawn = self.target.go(&frame, &args);
        self.line(spawn);
        let addr = self.pseudo.allocate();
        self.suspend_at(addr, None);
        self.open_unit();
        Ok(())
    }

    /// Arguments are evaluated now; the frame is built but parked on the
    /// caller's defer list.
    pub(crate) fn emit_defer(
        &mut self,
        inst: &Instruction,
        call: &CallCommon,
        plan: CallPlan,
    ) -> Result<(), CodegenError> {
        let callee = match plan {
            CallPlan::Frame { callee, .. } => callee,
            CallPlan::Missing { name } => {
                self.emit_missing(inst, &name);
                return Ok(());
            }
            CallPlan::Builtin(_) => return Ok(()),
        };
        let args = self.operands(&call.args)?;
        let frame = self.frame_callee(&callee)?;
        let text = self.target.defer(&frame, &args);
        self.line(text);
        Ok(())
    }

    /// Push every deferred frame (most recent on top) and wait for them.
    pub(crate) fn emit_run_defers(&mut self) {
        let addr = self.pseudo.allocate();
        let run = self.target.run_defers();
        self.suspend_at(addr, Some(run));
        self.open_unit();
    }

    /// Hand the value to the scheduler and yield; the arm after it returns
    /// zero results should control ever come back.
    pub(crate) fn emit_panic(&mut self, value: &Operand) -> Result<(), CodegenError> {
        let text = self.target.panic(&self.operand(value)?);
        self.line(text);
        let addr = self.pseudo.allocate();
        self.suspend_at(addr, None);
        let function = self.function;
        let mut zeros = Vec::with_capacity(function.results.len());
        for ty in &function.results {
            zeros.push(self.zero_token(ty)?);
        }
        let ret = self.target.ret(&zeros);
        self.raw(ret);
        Ok(())
    }
}
