//! Channel operations and `select`.
//!
//! Every channel operation yields once at its own pseudo-block, then polls
//! between units until the channel is ready; the operation itself runs in
//! the unit opened after the poll.

use strand_ir::{Instruction, Operand, SelectState, Type};

use crate::CodegenError;
use crate::emit::FunctionEmitter;
use crate::target::{SelectArm, Target};

impl<T: Target + ?Sized> FunctionEmitter<'_, T> {
    fn chan_elem(&self, chan: &Operand) -> Type {
        self.operand_type(chan).elem().cloned().unwrap_or_default()
    }

    pub(crate) fn emit_send(&mut self, chan: &Operand, value: &Operand) -> Result<(), CodegenError> {
        let addr = self.pseudo.allocate();
        self.suspend_at(addr, None);
        let chan = self.operand(chan)?;
        let wait = self.target.await_send(&chan);
        self.raw(wait);
        self.open_unit();
        let send = self.target.send(&chan, &self.operand(value)?);
        self.line(send);
        Ok(())
    }

    pub(crate) fn emit_recv(
        &mut self,
        inst: &Instruction,
        chan: &Operand,
        comma_ok: bool,
    ) -> Result<(), CodegenError> {
        let elem = self.chan_elem(chan);
        let zero = self.zero_token(&elem)?;
        let addr = self.pseudo.allocate();
        self.suspend_at(addr, None);
        let chan = self.operand(chan)?;
        let wait = self.target.await_recv(&chan);
        self.raw(wait);
        self.open_unit();
        let dest = self.define(inst);
        let recv = self.target.recv(dest.as_deref(), &chan, comma_ok, &zero);
        self.line(recv);
        Ok(())
    }

    /// Readiness flags, rotation pick and commit. A blocking select that
    /// finds nothing ready yields without moving its pseudo-block, so the
    /// whole scan repeats on resume.
    pub(crate) fn emit_select(
        &mut self,
        inst: &Instruction,
        states: &[SelectState],
        blocking: bool,
    ) -> Result<(), CodegenError> {
        let mut arms = Vec::with_capacity(states.len());
        for state in states {
            let zero = match state.send {
                Some(_) => None,
                None => {
                    let elem = self.chan_elem(&state.chan);
                    Some(self.zero_token(&elem)?)
                }
            };
            arms.push(SelectArm {
                dir: state.dir,
                chan: self.operand(&state.chan)?,
                send: state.send.as_ref().map(|v| self.operand(v)).transpose()?,
                zero,
            });
        }

        let site = self.pseudo.allocate();
        self.suspend_at(site, None);
        for (index, arm) in arms.iter().enumerate() {
            let ready = self.target.select_ready(site, index, arm.dir, &arm.chan);
            self.raw(ready);
        }
        let pick = self.target.select_pick(site, blocking);
        self.raw(pick);
        if blocking {
            let wait = self.target.select_wait(site);
            self.raw(wait);
        }
        self.open_unit();
        let dest = self.define(inst);
        let commit = self.target.select_commit(dest.as_deref(), site, &arms);
        self.line(commit);
        Ok(())
    }
}
