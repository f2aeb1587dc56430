//! Call classification and lowering.
//!
//! Callees are resolved in a fixed order: builtin, static function, closure
//! over a statically known function, dynamic closure, interface method. A
//! call is synchronous when its caller never suspends or when its callee is
//! statically known not to; synchronous calls build, run and read the callee
//! frame inside one unit.

use strand_diag::Category;
use strand_ir::{BlockId, CallCommon, CallMode, Callee, Function, InstKind, Instruction, Operand, Type};

use crate::emit::FunctionEmitter;
use crate::target::{BuiltinArg, BuiltinCall, FrameCallee, Target};
use crate::{CodegenError, GenContext};

#[derive(Debug, Clone, PartialEq)]
pub enum CalleeKind {
    Static(String),
    ClosureStatic { func: String, closure: Operand },
    Dynamic(Operand),
    Invoke { recv: Operand, method: String },
}

impl CalleeKind {
    fn static_name(&self) -> Option<&str> {
        match self {
            CalleeKind::Static(name) | CalleeKind::ClosureStatic { func: name, .. } => Some(name),
            CalleeKind::Dynamic(_) | CalleeKind::Invoke { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallPlan {
    Builtin(String),
    Frame { callee: CalleeKind, sync: bool },
    /// Statically known callee without a body.
    Missing { name: String },
}

fn mode_name(mode: CallMode) -> &'static str {
    match mode {
        CallMode::Normal => "call",
        CallMode::Go => "go",
        CallMode::Defer => "defer",
    }
}

/// Function a value was bound to by `MakeClosure` in the same function.
fn closure_target<'f>(function: &'f Function, operand: &Operand) -> Option<&'f str> {
    let id = operand.value_id()?;
    function.instructions().find_map(|(_, _, inst)| match &inst.kind {
        InstKind::MakeClosure { func, .. } if inst.dest == Some(id) => Some(func.as_str()),
        _ => None,
    })
}

pub fn classify_call(
    ctx: &GenContext<'_>,
    caller: &Function,
    call: &CallCommon,
    mode: CallMode,
) -> Result<CallPlan, CodegenError> {
    let unsupported = |what: String| CodegenError::UnsupportedDispatch {
        function: caller.name.clone(),
        what,
        mode: mode_name(mode),
    };
    let callee = match &call.callee {
        Callee::Builtin(name) => {
            return match mode {
                CallMode::Normal => Ok(CallPlan::Builtin(name.clone())),
                CallMode::Go | CallMode::Defer => Err(unsupported(format!("builtin `{name}`"))),
            };
        }
        Callee::Value(Operand::Function(name)) => CalleeKind::Static(name.clone()),
        Callee::Value(operand) => match closure_target(caller, operand) {
            Some(func) => CalleeKind::ClosureStatic {
                func: func.to_string(),
                closure: operand.clone(),
            },
            None => CalleeKind::Dynamic(operand.clone()),
        },
        Callee::Invoke { recv, method } => {
            if mode == CallMode::Go {
                return Err(unsupported(format!("interface method `{method}`")));
            }
            CalleeKind::Invoke {
                recv: recv.clone(),
                method: method.clone(),
            }
        }
    };
    if let Some(name) = callee.static_name()
        && ctx.body(name).is_none()
    {
        return Ok(CallPlan::Missing {
            name: name.to_string(),
        });
    }
    let sync = !ctx.suspends(&caller.name)
        || callee
            .static_name()
            .is_some_and(|name| !ctx.suspends(name));
    Ok(CallPlan::Frame { callee, sync })
}

impl<T: Target + ?Sized> FunctionEmitter<'_, T> {
    pub(crate) fn frame_callee(&self, callee: &CalleeKind) -> Result<FrameCallee, CodegenError> {
        Ok(match callee {
            CalleeKind::Static(name) => FrameCallee::Static(name.clone()),
            CalleeKind::ClosureStatic { func, closure } => FrameCallee::Closure {
                func: func.clone(),
                closure: self.operand(closure)?,
            },
            CalleeKind::Dynamic(operand) => FrameCallee::Dynamic(self.operand(operand)?),
            CalleeKind::Invoke { recv, method } => FrameCallee::Invoke {
                recv: self.operand(recv)?,
                method: method.clone(),
            },
        })
    }

    pub(crate) fn emit_call(
        &mut self,
        block: BlockId,
        position: usize,
        inst: &Instruction,
        call: &CallCommon,
        mode: CallMode,
    ) -> Result<(), CodegenError> {
        let plan = classify_call(self.ctx, self.function, call, mode)?;
        match mode {
            CallMode::Go => return self.emit_go(inst, call, plan),
            CallMode::Defer => return self.emit_defer(inst, call, plan),
            CallMode::Normal => {}
        }
        match plan {
            CallPlan::Builtin(name) => self.emit_builtin(inst, &name, &call.args),
            CallPlan::Missing { name } => {
                self.emit_missing(inst, &name);
                Ok(())
            }
            CallPlan::Frame { callee, sync } => {
                let args = self.operands(&call.args)?;
                let frame = self.frame_callee(&callee)?;
                let addr = self.pseudo.allocate();
                debug_assert!(
                    self.plan.slots.iter().any(|s| s.addr == addr),
                    "call in block {} at {position} took an unplanned address",
                    block.0
                );
                let construct = self.target.new_frame(addr, &frame, &args);
                self.line(construct);
                if sync {
                    self.stats.sync_calls += 1;
                    let run = self.target.run_frame(addr);
                    self.line(run);
                } else {
                    self.stats.async_calls += 1;
                    self.suspend_at(addr, None);
                    self.open_unit();
                }
                let dest = self.define(inst);
                let result = self.target.frame_result(dest.as_deref(), addr);
                self.line(result);
                Ok(())
            }
        }
    }

    /// Placeholder for a callee whose body is not part of the program.
    pub(crate) fn emit_missing(&mut self, inst: &Instruction, name: &str) {
        self.warn(
            Category::MissingBody,
            format!("function `{name}` has no body; calls to it fail at run time"),
        );
        let dest = self.define(inst);
        let text = self.target.placeholder(dest.as_deref(), &format!("call {name}"));
        self.line(text);
    }

    fn emit_builtin(
        &mut self,
        inst: &Instruction,
        name: &str,
        args: &[Operand],
    ) -> Result<(), CodegenError> {
        if name == "recover" {
            let dest = self.define(inst);
            let text = self.target.recover(dest.as_deref());
            self.line(text);
            return Ok(());
        }
        let mut rendered = Vec::with_capacity(args.len());
        for arg in args {
            rendered.push(BuiltinArg {
                text: self.operand(arg)?,
                ty: self.operand_type(arg).to_string(),
            });
        }
        let stride = match args.first().map(|a| self.operand_type(a)) {
            Some(ty) => match ty.underlying() {
                Type::Slice(elem) => Some(self.layout.stride(elem).map_err(|e| self.layout_err(e))?),
                _ => None,
            },
            None => None,
        };
        let call = BuiltinCall {
            name: name.to_string(),
            args: rendered,
            stride,
        };
        let dest = self.define(inst);
        match self.target.builtin(dest.as_deref(), &call) {
            Some(text) => self.line(text),
            None => {
                self.warn(
                    Category::MissingBuiltin,
                    format!("target `{}` has no mapping for builtin `{name}`", self.target.name()),
                );
                let text = self.target.placeholder(dest.as_deref(), &format!("builtin {name}"));
                self.line(text);
            }
        }
        Ok(())
    }
}
