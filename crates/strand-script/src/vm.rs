//! Executes parsed frames on the reference scheduler.
//!
//! One [`VmFrame`] per activation lives in the scheduler's arena. Running a
//! frame takes it out of the arena, dispatches on its `next` pseudo-block
//! and interprets statements until the frame yields, blocks on a channel or
//! returns. Synchronous callees run nested inside their caller's run.

use std::collections::HashMap;
use std::rc::Rc;

use strand_codegen::AssertTarget;
use strand_rt::{Frame, FrameId, RuntimeError, Scheduler, Step, TaskId, choose, nil_check};
use tracing::{debug, trace};

use crate::ScriptError;
use crate::builtins::{call_builtin, make_chan};
use crate::ops;
use crate::syntax::{Arg, CalleeRef, FuncCode, Label, Module, Op, Reg, SelArm, Stmt, parse_module};
use crate::value::{ClosureVal, Obj, SliceVal, Value, new_obj};

/// How one run of a frame ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Parked at a pseudo-block, or handed a panic to the scheduler.
    Yield,
    /// Polled a channel or select that was not ready.
    Blocked,
    Return,
}

#[derive(Debug, Default)]
struct SelectSite {
    ready: Vec<bool>,
    chosen: Option<usize>,
}

#[derive(Debug)]
pub struct VmFrame {
    code: Rc<FuncCode>,
    params: Vec<Value>,
    free: Vec<Value>,
    next: i64,
    done: bool,
    results: Vec<Value>,
    fields: HashMap<Reg, Value>,
    /// Callee frames by slot number.
    slots: HashMap<u32, FrameId>,
    deferred: Vec<FrameId>,
    selects: HashMap<i64, SelectSite>,
    stack_objs: HashMap<u32, Obj>,
    phi_pred: Option<u32>,
    /// Goroutine and deferred frames: nobody reads their results.
    detached: bool,
}

impl VmFrame {
    pub fn new(code: Rc<FuncCode>, params: Vec<Value>, free: Vec<Value>) -> Self {
        let fields = code
            .fields
            .iter()
            .filter_map(|(reg, init)| init.clone().map(|v| (*reg, v)))
            .collect();
        Self {
            code,
            params,
            free,
            next: 0,
            done: false,
            results: Vec::new(),
            fields,
            slots: HashMap::new(),
            deferred: Vec::new(),
            selects: HashMap::new(),
            stack_objs: HashMap::new(),
            phi_pred: None,
            detached: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.code.name
    }

    /// Block (`>= 0`) or pseudo-block (`< 0`) the next run starts at.
    pub fn next(&self) -> i64 {
        self.next
    }

    pub fn results(&self) -> &[Value] {
        &self.results
    }

    pub fn field(&self, reg: Reg) -> Option<&Value> {
        self.fields.get(&reg)
    }

    pub fn pending_defers(&self) -> usize {
        self.deferred.len()
    }
}

impl Frame for VmFrame {
    type Value = Value;

    fn is_complete(&self) -> bool {
        self.done
    }

    fn finish(&mut self) {
        self.done = true;
    }

    fn take_deferred(&mut self) -> Option<FrameId> {
        self.deferred.pop()
    }

    fn recover_target(&self) -> Option<i64> {
        self.code.recover.map(i64::from)
    }

    fn resume_at(&mut self, next: i64) {
        self.next = next;
    }
}

// ---------------------------------------------------------------------------
// Host state shared by all frames
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Host {
    module: Module,
    globals: HashMap<String, Obj>,
    out: String,
}

impl Host {
    fn code(&self, name: &str) -> Result<Rc<FuncCode>, ScriptError> {
        if let Some(code) = self.module.functions.get(name) {
            return Ok(Rc::clone(code));
        }
        if self.module.placeholders.contains_key(name) {
            return Err(ScriptError::Placeholder(format!("call {name}")));
        }
        Err(ScriptError::UnknownFunction(name.to_string()))
    }

    fn global(&mut self, name: &str) -> Obj {
        Rc::clone(self.globals.entry(name.to_string()).or_insert_with(new_obj))
    }

    fn new_frame(&self, name: &str, params: Vec<Value>, free: Vec<Value>) -> Result<VmFrame, ScriptError> {
        let code = self.code(name)?;
        if params.len() != code.params {
            return Err(ScriptError::Operand(format!(
                "`{name}` takes {} arguments, got {}",
                code.params,
                params.len()
            )));
        }
        Ok(VmFrame::new(code, params, free))
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

enum Ctl {
    Next,
    Goto(u32),
    Exit(Flow),
    EndSub,
}

struct Exec<'m> {
    sched: &'m mut Scheduler<VmFrame>,
    host: &'m mut Host,
    task: TaskId,
    id: FrameId,
    /// Locals and temps of this run.
    scratch: HashMap<Reg, Value>,
    region: Option<u32>,
}

fn label(code: &FuncCode, label: Label) -> Result<usize, ScriptError> {
    code.labels
        .get(&label)
        .copied()
        .ok_or_else(|| ScriptError::NoLabel {
            function: code.name.clone(),
            label: format!("{label:?}"),
        })
}

fn type_error(expected: &'static str, found: &Value) -> ScriptError {
    ScriptError::Type {
        expected,
        found: found.kind().to_string(),
    }
}

/// Run frame `id` of `task` once.
fn run_frame(
    sched: &mut Scheduler<VmFrame>,
    host: &mut Host,
    task: TaskId,
    id: FrameId,
) -> Result<Flow, ScriptError> {
    let mut frame = sched.take(id)?;
    let result = {
        let mut exec = Exec {
            sched: &mut *sched,
            host: &mut *host,
            task,
            id,
            scratch: HashMap::new(),
            region: None,
        };
        exec.run(&mut frame)
    };
    let release = frame.done && frame.detached;
    sched.restore(id, frame);
    if release {
        sched.release(id);
    }
    result
}

impl Exec<'_> {
    fn run(&mut self, frame: &mut VmFrame) -> Result<Flow, ScriptError> {
        let code = Rc::clone(&frame.code);
        for (reg, init) in &code.locals {
            if let Some(value) = init {
                self.scratch.insert(*reg, value.clone());
            }
        }
        let start = match frame.next {
            block if block >= 0 => label(&code, Label::Block(block as u32))?,
            addr => match code.labels.get(&Label::Resume(addr)) {
                Some(pc) => *pc,
                None if code.labels.contains_key(&Label::Stub(addr)) => {
                    return Err(ScriptError::Stub {
                        function: code.name.clone(),
                        addr,
                    });
                }
                None => label(&code, Label::Resume(addr))?,
            },
        };
        match self.span(&code, frame, start)? {
            Some(flow) => Ok(flow),
            None => Err(ScriptError::FellThrough {
                function: code.name.clone(),
            }),
        }
    }

    /// Interpret from `pc` until the frame leaves the run (`Some`) or a
    /// sub-unit ends (`None`).
    fn span(&mut self, code: &Rc<FuncCode>, frame: &mut VmFrame, mut pc: usize) -> Result<Option<Flow>, ScriptError> {
        loop {
            let Some(line) = code.body.get(pc) else {
                return Err(ScriptError::FellThrough {
                    function: code.name.clone(),
                });
            };
            pc += 1;
            match self.stmt(code, frame, &line.stmt) {
                Ok(Ctl::Next) => {}
                Ok(Ctl::Goto(block)) => pc = label(code, Label::Block(block))?,
                Ok(Ctl::Exit(flow)) => return Ok(Some(flow)),
                Ok(Ctl::EndSub) => return Ok(None),
                Err(ScriptError::Fault(error)) => {
                    self.raise(error)?;
                    return Ok(Some(Flow::Yield));
                }
                Err(error @ ScriptError::Frame { .. }) => return Err(error),
                Err(error) => {
                    return Err(ScriptError::Frame {
                        function: code.name.clone(),
                        line: line.line,
                        source: Box::new(error),
                    });
                }
            }
        }
    }

    /// Turn a fault into a panic of this task.
    fn raise(&mut self, error: RuntimeError) -> Result<(), ScriptError> {
        let value = Value::str(format!("runtime error: {error}"));
        debug!(task = self.task.0, frame = self.id.0, region = ?self.region, %error, "fault");
        match self.region {
            Some(region) => self.sched.handle(self.task, value, region)?,
            None => self.sched.panic(self.task, value)?,
        }
        Ok(())
    }

    // -- operands -----------------------------------------------------------

    fn reg(&self, frame: &VmFrame, reg: Reg) -> Result<Value, ScriptError> {
        let store = if frame.code.is_field(reg) {
            &frame.fields
        } else {
            &self.scratch
        };
        store
            .get(&reg)
            .cloned()
            .ok_or_else(|| ScriptError::UnsetRegister(reg.to_string()))
    }

    fn write(&mut self, frame: &mut VmFrame, reg: Reg, value: Value) {
        if frame.code.is_field(reg) {
            frame.fields.insert(reg, value);
        } else {
            self.scratch.insert(reg, value);
        }
    }

    fn assign(&mut self, frame: &mut VmFrame, dest: &Option<Reg>, value: Value) {
        if let Some(reg) = dest {
            self.write(frame, *reg, value);
        }
    }

    fn read(&mut self, frame: &VmFrame, arg: &Arg) -> Result<Value, ScriptError> {
        Ok(match arg {
            Arg::Reg(reg) => self.reg(frame, *reg)?,
            Arg::Param(i) => frame
                .params
                .get(*i)
                .cloned()
                .ok_or_else(|| ScriptError::Operand(format!("${i}")))?,
            Arg::Free(i) => frame
                .free
                .get(*i)
                .cloned()
                .ok_or_else(|| ScriptError::Operand(format!("^{i}")))?,
            Arg::Global(name) => Value::Ptr {
                obj: self.host.global(name),
                off: 0,
            },
            Arg::Func(name) => Value::Closure(Rc::new(ClosureVal {
                func: name.clone(),
                bindings: Vec::new(),
            })),
            Arg::Const(value) => value.clone(),
        })
    }

    fn read_all(&mut self, frame: &VmFrame, args: &[Arg]) -> Result<Vec<Value>, ScriptError> {
        args.iter().map(|a| self.read(frame, a)).collect()
    }

    fn read_opt(&mut self, frame: &VmFrame, arg: &Option<Arg>) -> Result<Option<Value>, ScriptError> {
        arg.as_ref().map(|a| self.read(frame, a)).transpose()
    }

    // -- statements ---------------------------------------------------------

    fn stmt(&mut self, code: &Rc<FuncCode>, frame: &mut VmFrame, stmt: &Stmt) -> Result<Ctl, ScriptError> {
        match stmt {
            Stmt::Case(_) | Stmt::Resume(_) | Stmt::Pos(_) => {}
            Stmt::Stub(addr) => {
                return Err(ScriptError::Stub {
                    function: code.name.clone(),
                    addr: *addr,
                });
            }
            Stmt::Sub(_) => {
                return Err(ScriptError::FellThrough {
                    function: code.name.clone(),
                });
            }
            Stmt::Next(addr) => frame.next = *addr,
            Stmt::Yield => return Ok(Ctl::Exit(Flow::Yield)),
            Stmt::Jump(block) => return Ok(Ctl::Goto(*block)),
            Stmt::Branch {
                cond,
                then_block,
                else_block,
            } => {
                let taken = self.read(frame, cond)?.as_bool()?;
                return Ok(Ctl::Goto(if taken { *then_block } else { *else_block }));
            }
            Stmt::PhiTag(pred) => frame.phi_pred = Some(*pred),
            Stmt::Phi { dest, zero, edges } => {
                let edge = edges.iter().find(|(pred, _)| Some(*pred) == frame.phi_pred);
                let value = match edge {
                    Some((_, value)) => self.read(frame, value)?,
                    None => self.read(frame, zero)?,
                };
                self.write(frame, *dest, value);
            }
            Stmt::Ret(args) => {
                frame.results = self.read_all(frame, args)?;
                frame.done = true;
                if self.sched.top(self.task)? == Some(self.id) {
                    self.sched.pop(self.task)?;
                }
                return Ok(Ctl::Exit(Flow::Return));
            }
            Stmt::Trace { function, point } => {
                trace!(target: "strand_script", function = %function, point, "trace point");
            }
            Stmt::Guard(id) => self.region = Some(*id),
            Stmt::EndGuard(_) => self.region = None,
            Stmt::EndSub(_) => return Ok(Ctl::EndSub),
            Stmt::CallSub(id) => {
                let start = *code
                    .subs
                    .get(id)
                    .ok_or_else(|| ScriptError::NoLabel {
                        function: code.name.clone(),
                        label: format!("sub {id}"),
                    })?;
                let outer = self.region.replace(*id);
                let exit = self.span(code, frame, start)?;
                self.region = outer;
                if let Some(flow) = exit {
                    return Ok(Ctl::Exit(flow));
                }
            }
            Stmt::Temp { reg, init } => match init {
                Some(init) => {
                    let value = self.read(frame, init)?;
                    self.write(frame, *reg, value);
                }
                None => {
                    self.scratch.remove(reg);
                }
            },
            Stmt::Set { dest, op } => {
                let value = self.value(frame, op)?;
                self.assign(frame, dest, value);
            }
            Stmt::Store { addr, value, width } => {
                let addr = self.read(frame, addr)?;
                let value = self.read(frame, value)?;
                ops::store(&addr, &value, *width)?;
            }
            Stmt::MapUpdate { map, key, value } => {
                let map = self.read(frame, map)?;
                let key = self.read(frame, key)?;
                let value = self.read(frame, value)?;
                ops::map_update(&map, &key, &value)?;
            }
            Stmt::Call { slot, callee, args } => {
                let callee = self.build(frame, callee, args)?;
                let id = self.sched.alloc(callee);
                self.sched.push(self.task, id)?;
                frame.slots.insert(*slot, id);
            }
            Stmt::RunFrame(slot) => return self.run_sync(code, frame, *slot),
            Stmt::Result { dest, slot } => {
                let id = frame
                    .slots
                    .remove(slot)
                    .ok_or_else(|| ScriptError::Operand(format!("sf{slot} holds no frame")))?;
                let callee = self.sched.frame(id)?;
                if !callee.done {
                    return Err(ScriptError::Operand(format!(
                        "frame in sf{slot} (`{}`) has not returned",
                        callee.name()
                    )));
                }
                let value = match callee.results.as_slice() {
                    [] => Value::Nil,
                    [one] => one.clone(),
                    many => Value::tuple(many.to_vec()),
                };
                self.sched.release(id);
                self.assign(frame, dest, value);
            }
            Stmt::Go { callee, args } => {
                let mut spawned = self.build(frame, callee, args)?;
                spawned.detached = true;
                let name = spawned.code.name.clone();
                let id = self.sched.alloc(spawned);
                let task = self.sched.new_task();
                self.sched.push(task, id)?;
                debug!(task = task.0, function = %name, "spawned");
            }
            Stmt::Defer { callee, args } => {
                let mut deferred = self.build(frame, callee, args)?;
                deferred.detached = true;
                let id = self.sched.alloc(deferred);
                frame.deferred.push(id);
            }
            Stmt::RunDefers => {
                // Oldest first, so the most recent defer ends up on top.
                for id in std::mem::take(&mut frame.deferred) {
                    self.sched.push(self.task, id)?;
                }
            }
            Stmt::Builtin {
                dest,
                name,
                stride,
                args,
            } => {
                let args = self.read_all(frame, args)?;
                let value = call_builtin(&mut self.host.out, name, *stride, &args)?;
                self.assign(frame, dest, value);
            }
            Stmt::Recover(dest) => {
                let value = self.sched.recover(self.task)?.unwrap_or(Value::Nil);
                self.assign(frame, dest, value);
            }
            Stmt::Panic(value) => {
                let value = self.read(frame, value)?;
                self.sched.panic(self.task, value)?;
            }
            Stmt::Missing { what, .. } => return Err(ScriptError::Placeholder(what.clone())),
            Stmt::WaitSend(chan) => {
                if !self.chan_ready(frame, chan, true)? {
                    return Ok(Ctl::Exit(Flow::Blocked));
                }
            }
            Stmt::WaitRecv(chan) => {
                if !self.chan_ready(frame, chan, false)? {
                    return Ok(Ctl::Exit(Flow::Blocked));
                }
            }
            Stmt::Send { chan, value } => {
                let chan = self.read(frame, chan)?;
                let value = self.read(frame, value)?;
                send(&chan, value)?;
            }
            Stmt::Recv {
                dest,
                chan,
                comma_ok,
                zero,
            } => {
                let chan = self.read(frame, chan)?;
                let zero = self.read(frame, zero)?;
                let (value, ok) = receive(&chan, zero)?;
                let result = if *comma_ok {
                    Value::tuple(vec![value, Value::Bool(ok)])
                } else {
                    value
                };
                self.assign(frame, dest, result);
            }
            Stmt::SelReady {
                site,
                state,
                send,
                chan,
            } => {
                let ready = self.chan_ready(frame, chan, *send)?;
                let entry = frame.selects.entry(*site).or_default();
                if *state == 0 {
                    entry.ready.clear();
                    entry.chosen = None;
                }
                entry.ready.push(ready);
            }
            Stmt::SelPick { site, .. } => {
                let entry = frame.selects.entry(*site).or_default();
                entry.chosen = choose(&entry.ready, self.sched.rng());
            }
            Stmt::SelWait(site) => {
                if frame.selects.get(site).and_then(|s| s.chosen).is_none() {
                    return Ok(Ctl::Exit(Flow::Blocked));
                }
            }
            Stmt::SelDo { dest, site, arms } => {
                let value = self.select_commit(frame, *site, arms)?;
                self.assign(frame, dest, value);
            }
        }
        Ok(Ctl::Next)
    }

    fn run_sync(&mut self, code: &Rc<FuncCode>, frame: &VmFrame, slot: u32) -> Result<Ctl, ScriptError> {
        let id = *frame
            .slots
            .get(&slot)
            .ok_or_else(|| ScriptError::Operand(format!("sf{slot} holds no frame")))?;
        run_frame(self.sched, self.host, self.task, id)?;
        if self.sched.frame(id)?.done {
            return Ok(Ctl::Next);
        }
        if self.sched.is_panicking(self.task)? {
            return Ok(Ctl::Exit(Flow::Yield));
        }
        Err(ScriptError::SyncSuspend {
            function: code.name.clone(),
        })
    }

    /// Frame for a call, `go` or `defer`, with arguments evaluated now.
    fn build(&mut self, frame: &VmFrame, callee: &CalleeRef, args: &[Arg]) -> Result<VmFrame, ScriptError> {
        let mut params = Vec::with_capacity(args.len() + 1);
        let (name, free) = match callee {
            CalleeRef::Static(name) => (name.clone(), Vec::new()),
            CalleeRef::Closure { func, closure } => {
                match nil_check(self.read(frame, closure)?).map_err(ScriptError::fault)? {
                    Value::Closure(c) => (func.clone(), c.bindings.clone()),
                    other => return Err(type_error("func", &other)),
                }
            }
            CalleeRef::Dynamic(value) => {
                match nil_check(self.read(frame, value)?).map_err(ScriptError::fault)? {
                    Value::Closure(c) => (c.func.clone(), c.bindings.clone()),
                    other => return Err(type_error("func", &other)),
                }
            }
            CalleeRef::Invoke { recv, method } => {
                match nil_check(self.read(frame, recv)?).map_err(ScriptError::fault)? {
                    Value::Iface(boxed) => {
                        params.push(boxed.1.clone());
                        (format!("{}.{method}", boxed.0), Vec::new())
                    }
                    other => return Err(type_error("interface", &other)),
                }
            }
        };
        for arg in args {
            params.push(self.read(frame, arg)?);
        }
        self.host.new_frame(&name, params, free)
    }

    fn chan_ready(&mut self, frame: &VmFrame, chan: &Arg, send: bool) -> Result<bool, ScriptError> {
        Ok(match self.read(frame, chan)? {
            Value::Chan(chan) => {
                let chan = chan.borrow();
                if send { chan.has_space() } else { chan.has_contents() }
            }
            // Nil channels are never ready.
            Value::Nil => false,
            other => return Err(type_error("chan", &other)),
        })
    }

    /// `(index, recvOk, one value per receive arm)`; index `-1` when a
    /// non-blocking select found nothing ready.
    fn select_commit(&mut self, frame: &VmFrame, site: i64, arms: &[SelArm]) -> Result<Value, ScriptError> {
        let chosen = frame.selects.get(&site).and_then(|s| s.chosen);
        let mut recv_ok = false;
        let mut received = Vec::new();
        for (index, arm) in arms.iter().enumerate() {
            match arm {
                SelArm::Send { chan, value } => {
                    if chosen == Some(index) {
                        let chan = self.read(frame, chan)?;
                        let value = self.read(frame, value)?;
                        send(&chan, value)?;
                    }
                }
                SelArm::Recv { chan, zero } => {
                    let zero = self.read(frame, zero)?;
                    if chosen == Some(index) {
                        let chan = self.read(frame, chan)?;
                        let (value, ok) = receive(&chan, zero)?;
                        recv_ok = ok;
                        received.push(value);
                    } else {
                        received.push(zero);
                    }
                }
            }
        }
        let mut items = vec![Value::Int(chosen.map_or(-1, |i| i as i64)), Value::Bool(recv_ok)];
        items.extend(received);
        Ok(Value::tuple(items))
    }

    // -- values -------------------------------------------------------------

    fn value(&mut self, frame: &mut VmFrame, op: &Op) -> Result<Value, ScriptError> {
        Ok(match op {
            Op::Copy(x) => self.read(frame, x)?,
            Op::Unary { op, class, x } => ops::unary(*op, *class, &self.read(frame, x)?)?,
            Op::Binary { op, class, x, y } => {
                let x = self.read(frame, x)?;
                let y = self.read(frame, y)?;
                ops::binary(*op, *class, &x, &y)?
            }
            Op::Convert { conv, x } => ops::convert(*conv, &self.read(frame, x)?)?,
            Op::FieldAddr { base, offset } => ops::field_addr(&self.read(frame, base)?, *offset)?,
            Op::Field {
                base,
                offset,
                width,
                zero,
            } => {
                let base = self.read(frame, base)?;
                let zero = self.read(frame, zero)?;
                ops::field(&base, *offset, *width, &zero)?
            }
            Op::IndexAddr {
                base,
                index,
                stride,
                bound,
            } => {
                let base = self.read(frame, base)?;
                let index = self.read(frame, index)?;
                ops::index_addr(&base, &index, *stride, *bound)?
            }
            Op::Index {
                base,
                index,
                stride,
                bound,
                width,
                zero,
            } => {
                let base = self.read(frame, base)?;
                let index = self.read(frame, index)?;
                let zero = self.read(frame, zero)?;
                ops::index(&base, &index, *stride, *bound, *width, &zero)?
            }
            Op::Load { addr, width, zero } => {
                let addr = self.read(frame, addr)?;
                let zero = self.read(frame, zero)?;
                ops::load(&addr, *width, &zero)?
            }
            Op::Alloc { stack: None, .. } => Value::Ptr {
                obj: new_obj(),
                off: 0,
            },
            Op::Alloc {
                stack: Some(id), ..
            } => {
                let obj = frame.stack_objs.entry(*id).or_insert_with(new_obj);
                obj.borrow_mut().clear();
                Value::Ptr {
                    obj: Rc::clone(obj),
                    off: 0,
                }
            }
            Op::MakeSlice { stride, len, cap } => {
                let len = self.read(frame, len)?.as_int()?;
                let cap = self.read(frame, cap)?.as_int()?;
                if len < 0 || cap < len {
                    return Err(ScriptError::fault(RuntimeError::IndexOutOfRange { index: len, len: cap }));
                }
                Value::Slice(SliceVal {
                    obj: new_obj(),
                    off: 0,
                    len: len as u64,
                    cap: cap as u64,
                    stride: *stride,
                })
            }
            Op::MakeMap => Value::Map(Rc::new(std::cell::RefCell::new(Vec::new()))),
            Op::MakeChan(size) => make_chan(&self.read(frame, size)?)?,
            Op::Closure { func, bindings } => Value::Closure(Rc::new(ClosureVal {
                func: func.clone(),
                bindings: self.read_all(frame, bindings)?,
            })),
            Op::Iface { ty, x } => Value::Iface(Rc::new((ty.clone(), self.read(frame, x)?))),
            Op::Assert {
                x,
                comma_ok,
                zero,
                target,
            } => {
                let x = self.read(frame, x)?;
                let zero = self.read(frame, zero)?;
                self.assert(x, *comma_ok, zero, target)?
            }
            Op::Slice {
                x,
                low,
                high,
                stride,
                bound,
            } => {
                let x = self.read(frame, x)?;
                let low = self.read_opt(frame, low)?;
                let high = self.read_opt(frame, high)?;
                ops::slice(&x, low.as_ref(), high.as_ref(), *stride, *bound)?
            }
            Op::Lookup {
                x,
                key,
                comma_ok,
                zero,
            } => {
                let x = self.read(frame, x)?;
                let key = self.read(frame, key)?;
                let zero = self.read(frame, zero)?;
                ops::lookup(&x, &key, *comma_ok, &zero)?
            }
            Op::Extract { tuple, index } => ops::extract(&self.read(frame, tuple)?, *index)?,
            Op::Range(x) => ops::range(&self.read(frame, x)?)?,
            Op::Next { iter, is_string } => ops::next(&self.read(frame, iter)?, *is_string)?,
        })
    }

    fn assert(&self, x: Value, comma_ok: bool, zero: Value, target: &AssertTarget) -> Result<Value, ScriptError> {
        let matched = match (&x, target) {
            (Value::Iface(boxed), AssertTarget::Concrete(name)) => {
                (boxed.0 == *name).then(|| boxed.1.clone())
            }
            (Value::Iface(boxed), AssertTarget::Interface(methods)) => methods
                .iter()
                .all(|m| {
                    self.host
                        .module
                        .functions
                        .contains_key(&format!("{}.{m}", boxed.0))
                })
                .then(|| x.clone()),
            _ => None,
        };
        match (matched, comma_ok) {
            (Some(value), true) => Ok(Value::tuple(vec![value, Value::Bool(true)])),
            (None, true) => Ok(Value::tuple(vec![zero, Value::Bool(false)])),
            (Some(value), false) => Ok(value),
            (None, false) => {
                let found = match &x {
                    Value::Iface(boxed) => boxed.0.clone(),
                    _ => "nil".to_string(),
                };
                let message = match target {
                    AssertTarget::Concrete(name) => format!("interface is {found}, not {name}"),
                    AssertTarget::Interface(_) => {
                        format!("{found} does not implement the asserted interface")
                    }
                };
                Err(ScriptError::fault(RuntimeError::TypeAssertion(message)))
            }
        }
    }
}

fn send(chan: &Value, value: Value) -> Result<(), ScriptError> {
    match nil_check(chan.clone()).map_err(ScriptError::fault)? {
        Value::Chan(chan) => chan.borrow_mut().send(value).map_err(ScriptError::fault),
        other => Err(type_error("chan", &other)),
    }
}

/// Received value and whether it came from a send (`false` once closed
/// and drained).
fn receive(chan: &Value, zero: Value) -> Result<(Value, bool), ScriptError> {
    match nil_check(chan.clone()).map_err(ScriptError::fault)? {
        Value::Chan(chan) => Ok(match chan.borrow_mut().receive() {
            Some(value) => (value, true),
            None => (zero, false),
        }),
        other => Err(type_error("chan", &other)),
    }
}

// ---------------------------------------------------------------------------
// Public driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Seed for select choices; `None` draws from entropy.
    pub seed: Option<u64>,
    /// Scheduling rounds [`Vm::run`] allows before giving up.
    pub max_rounds: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            seed: None,
            max_rounds: 1_000_000,
        }
    }
}

#[derive(Debug)]
pub struct Vm {
    sched: Scheduler<VmFrame>,
    host: Host,
    config: VmConfig,
}

impl Vm {
    pub fn load(text: &str) -> Result<Self, ScriptError> {
        Self::with_config(text, VmConfig::default())
    }

    pub fn with_config(text: &str, config: VmConfig) -> Result<Self, ScriptError> {
        let module = parse_module(text)?;
        debug!(
            functions = module.functions.len(),
            placeholders = module.placeholders.len(),
            globals = module.globals.len(),
            "loaded script"
        );
        let globals = module
            .globals
            .iter()
            .map(|(name, _)| (name.clone(), new_obj()))
            .collect();
        let sched = match config.seed {
            Some(seed) => Scheduler::seeded(seed),
            None => Scheduler::new(),
        };
        Ok(Self {
            sched,
            host: Host {
                module,
                globals,
                out: String::new(),
            },
            config,
        })
    }

    pub fn package(&self) -> Option<&str> {
        self.host.module.package.as_deref()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.host.module.functions.contains_key(name)
    }

    /// Push a frame for `entry` on the main task without running it.
    pub fn start(&mut self, entry: &str, args: Vec<Value>) -> Result<FrameId, ScriptError> {
        let frame = self.host.new_frame(entry, args, Vec::new())?;
        let id = self.sched.alloc(frame);
        self.sched.push(TaskId::MAIN, id)?;
        Ok(id)
    }

    /// Start `entry` on a fresh task, the way a `go` statement does.
    pub fn spawn(&mut self, entry: &str, args: Vec<Value>) -> Result<TaskId, ScriptError> {
        let mut frame = self.host.new_frame(entry, args, Vec::new())?;
        frame.detached = true;
        let id = self.sched.alloc(frame);
        let task = self.sched.new_task();
        self.sched.push(task, id)?;
        Ok(task)
    }

    /// Run the top frame of `task` once, or take one unwinding action.
    pub fn step(&mut self, task: TaskId) -> Result<Step, ScriptError> {
        let Vm { sched, host, .. } = self;
        sched.run_one(task, |sched, task, id| run_frame(sched, host, task, id).map(|_| ()))
    }

    /// One pass over every task. A pass in which every task that ran was
    /// blocked is a deadlock.
    pub fn round(&mut self) -> Result<Vec<Step>, ScriptError> {
        let Vm { sched, host, .. } = self;
        let mut progressed = false;
        let steps = sched.run_all(|sched, task, id| {
            if run_frame(sched, host, task, id)? != Flow::Blocked {
                progressed = true;
            }
            Ok::<(), ScriptError>(())
        })?;
        if steps.iter().any(|s| matches!(s, Step::Unwound(_))) {
            progressed = true;
        }
        if !steps.is_empty() && !progressed {
            return Err(RuntimeError::Deadlock.into());
        }
        Ok(steps)
    }

    /// Schedule rounds until the main task has no frames left. Other tasks
    /// are abandoned at that point.
    pub fn run(&mut self) -> Result<(), ScriptError> {
        let mut rounds = 0;
        while self.sched.depth(TaskId::MAIN)? > 0 {
            if rounds == self.config.max_rounds {
                return Err(ScriptError::RoundLimit(rounds));
            }
            self.round()?;
            rounds += 1;
        }
        debug!(rounds, tasks = self.sched.task_count(), "main task finished");
        Ok(())
    }

    /// Call `entry` on the main task, run to completion and return its
    /// results.
    pub fn call(&mut self, entry: &str, args: Vec<Value>) -> Result<Vec<Value>, ScriptError> {
        let id = self.start(entry, args)?;
        self.run()?;
        let results = self.sched.frame(id)?.results.clone();
        self.sched.release(id);
        Ok(results)
    }

    pub fn frame(&self, id: FrameId) -> Result<&VmFrame, ScriptError> {
        Ok(self.sched.frame(id)?)
    }

    pub fn scheduler(&self) -> &Scheduler<VmFrame> {
        &self.sched
    }

    pub fn output(&self) -> &str {
        &self.host.out
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.host.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: &str = r#"
func "main.count" params=1 free=0 results=1 suspends=true recover=-
field %v1 i:0
run
case 0
next -1
yield
resume -1
guard 1
set %v1 bin add i64 %v1 i:1
endguard 1
branch b:true 1 1
case 1
ret %v1
end
"#;

    #[test]
    fn resumes_at_the_parked_pseudo_block() {
        let mut vm = Vm::with_config(COUNTER, VmConfig { seed: Some(1), max_rounds: 10 }).unwrap();
        let id = vm.start("main.count", vec![Value::Int(0)]).unwrap();
        assert_eq!(vm.step(TaskId::MAIN).unwrap(), Step::Ran(id));
        let frame = vm.frame(id).unwrap();
        assert_eq!(frame.next(), -1);
        assert!(!frame.is_complete());
        assert_eq!(vm.step(TaskId::MAIN).unwrap(), Step::Ran(id));
        let frame = vm.frame(id).unwrap();
        assert!(frame.is_complete());
        assert_eq!(format!("{:?}", frame.results()), "[1]");
        assert_eq!(vm.step(TaskId::MAIN).unwrap(), Step::Idle);
    }

    #[test]
    fn stub_addresses_cannot_be_resumed() {
        let text = r#"
func "main.s" params=0 free=0 results=0 suspends=true recover=-
run
case 0
next -2
yield
stub -2
resume -1
ret
end
"#;
        let mut vm = Vm::load(text).unwrap();
        vm.start("main.s", Vec::new()).unwrap();
        vm.step(TaskId::MAIN).unwrap();
        let err = vm.step(TaskId::MAIN).unwrap_err();
        assert!(matches!(err, ScriptError::Stub { addr: -2, .. }), "{err}");
    }

    #[test]
    fn faults_in_guarded_units_become_panics() {
        let text = r#"
func "main.f" params=0 free=0 results=1 suspends=true recover=-
run
case 0
guard 1
temp %v0 -
set %v0 bin div i64 i:1 i:0
endguard 1
ret %v0
end
"#;
        let mut vm = Vm::load(text).unwrap();
        let err = vm.call("main.f", Vec::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "panic: \"runtime error: integer divide by zero\""
        );
    }

    #[test]
    fn unknown_entry_points_are_reported() {
        let mut vm = Vm::load("placeholder \"main.ext\" \"no body\"\n").unwrap();
        assert!(matches!(
            vm.start("main.ext", Vec::new()),
            Err(ScriptError::Placeholder(_))
        ));
        assert!(matches!(
            vm.start("main.nope", Vec::new()),
            Err(ScriptError::UnknownFunction(_))
        ));
    }
}
