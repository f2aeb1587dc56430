//! Parser for the textual target.
//!
//! A file is a sequence of `func ... run ... end` units, `placeholder`
//! lines and one `package` unit with its `global`s. Operand tokens are
//! decoded once at load time.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use strand_codegen::{AssertTarget, Conversion};
use strand_ir::{BinaryOp, NumClass, UnaryOp};

use crate::ScriptError;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Value(u32),
    Stage(u32),
    Array(usize),
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Value(id) => write!(f, "%v{id}"),
            Reg::Stage(id) => write!(f, "%s{id}"),
            Reg::Array(slot) => write!(f, "%[{slot}]"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Arg {
    Reg(Reg),
    Param(usize),
    Free(usize),
    Global(String),
    Func(String),
    Const(Value),
}

#[derive(Debug, Clone)]
pub enum CalleeRef {
    Static(String),
    Closure { func: String, closure: Arg },
    Dynamic(Arg),
    Invoke { recv: Arg, method: String },
}

#[derive(Debug, Clone)]
pub enum SelArm {
    Send { chan: Arg, value: Arg },
    Recv { chan: Arg, zero: Arg },
}

#[derive(Debug, Clone)]
pub enum Op {
    Copy(Arg),
    Unary { op: UnaryOp, class: NumClass, x: Arg },
    Binary { op: BinaryOp, class: NumClass, x: Arg, y: Arg },
    Convert { conv: Conversion, x: Arg },
    FieldAddr { base: Arg, offset: u64 },
    Field { base: Arg, offset: u64, width: Option<u64>, zero: Arg },
    IndexAddr { base: Arg, index: Arg, stride: u64, bound: Option<u64> },
    Index { base: Arg, index: Arg, stride: u64, bound: Option<u64>, width: Option<u64>, zero: Arg },
    Load { addr: Arg, width: Option<u64>, zero: Arg },
    Alloc { size: u64, stack: Option<u32> },
    MakeSlice { stride: u64, len: Arg, cap: Arg },
    MakeMap,
    MakeChan(Arg),
    Closure { func: String, bindings: Vec<Arg> },
    Iface { ty: String, x: Arg },
    Assert { x: Arg, comma_ok: bool, zero: Arg, target: AssertTarget },
    Slice { x: Arg, low: Option<Arg>, high: Option<Arg>, stride: u64, bound: Option<u64> },
    Lookup { x: Arg, key: Arg, comma_ok: bool, zero: Arg },
    Extract { tuple: Arg, index: usize },
    Range(Arg),
    Next { iter: Arg, is_string: bool },
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Case(u32),
    Resume(i64),
    Stub(i64),
    Next(i64),
    Yield,
    Jump(u32),
    Branch { cond: Arg, then_block: u32, else_block: u32 },
    PhiTag(u32),
    Phi { dest: Reg, zero: Arg, edges: Vec<(u32, Arg)> },
    Ret(Vec<Arg>),
    Pos(String),
    Trace { function: String, point: i64 },
    Guard(u32),
    EndGuard(u32),
    Sub(u32),
    EndSub(u32),
    CallSub(u32),
    Temp { reg: Reg, init: Option<Arg> },
    Set { dest: Option<Reg>, op: Op },
    Store { addr: Arg, value: Arg, width: Option<u64> },
    MapUpdate { map: Arg, key: Arg, value: Arg },
    Call { slot: u32, callee: CalleeRef, args: Vec<Arg> },
    RunFrame(u32),
    Result { dest: Option<Reg>, slot: u32 },
    Go { callee: CalleeRef, args: Vec<Arg> },
    Defer { callee: CalleeRef, args: Vec<Arg> },
    RunDefers,
    Builtin { dest: Option<Reg>, name: String, stride: Option<u64>, args: Vec<Arg> },
    Recover(Option<Reg>),
    Panic(Arg),
    Missing { dest: Option<Reg>, what: String },
    WaitSend(Arg),
    Send { chan: Arg, value: Arg },
    WaitRecv(Arg),
    Recv { dest: Option<Reg>, chan: Arg, comma_ok: bool, zero: Arg },
    SelReady { site: i64, state: usize, send: bool, chan: Arg },
    SelPick { site: i64, blocking: bool },
    SelWait(i64),
    SelDo { dest: Option<Reg>, site: i64, arms: Vec<SelArm> },
}

#[derive(Debug, Clone)]
pub struct Line {
    pub stmt: Stmt,
    /// 1-based line in the source text.
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Block(u32),
    Resume(i64),
    Stub(i64),
}

#[derive(Debug, Default)]
pub struct FuncCode {
    pub name: String,
    pub params: usize,
    pub free: usize,
    pub results: usize,
    pub suspends: bool,
    pub recover: Option<u32>,
    pub fields: Vec<(Reg, Option<Value>)>,
    pub array_slots: usize,
    pub stack_allocs: Vec<(u32, u64)>,
    pub locals: Vec<(Reg, Option<Value>)>,
    pub body: Vec<Line>,
    pub labels: HashMap<Label, usize>,
    /// Index of the first statement of each sub-unit.
    pub subs: HashMap<u32, usize>,
}

impl FuncCode {
    pub fn is_field(&self, reg: Reg) -> bool {
        matches!(reg, Reg::Array(_)) || self.fields.iter().any(|(r, _)| *r == reg)
    }
}

#[derive(Debug, Default)]
pub struct Module {
    pub package: Option<String>,
    pub functions: HashMap<String, Rc<FuncCode>>,
    /// Functions that could not be generated, with the reason.
    pub placeholders: HashMap<String, String>,
    pub globals: Vec<(String, u64)>,
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Split on whitespace; JSON strings inside a token keep their spaces.
pub fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;
    for c in line.chars() {
        if quoted {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                quoted = false;
            }
        } else if c.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else {
            if c == '"' {
                quoted = true;
            }
            current.push(c);
        }
    }
    if quoted {
        return Err("unterminated string".to_string());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

pub fn unquote(token: &str) -> Result<String, String> {
    serde_json::from_str::<String>(token).map_err(|e| format!("bad string {token}: {e}"))
}

fn num<T: std::str::FromStr>(token: &str) -> Result<T, String> {
    token
        .parse()
        .map_err(|_| format!("expected a number, found `{token}`"))
}

fn opt_num(token: &str) -> Result<Option<u64>, String> {
    if token == "-" { Ok(None) } else { num(token).map(Some) }
}

fn slot(token: &str) -> Result<u32, String> {
    token
        .strip_prefix("sf")
        .ok_or_else(|| format!("expected a frame slot, found `{token}`"))
        .and_then(num)
}

pub fn parse_reg(token: &str) -> Result<Reg, String> {
    if let Some(rest) = token.strip_prefix("%v") {
        return num(rest).map(Reg::Value);
    }
    if let Some(rest) = token.strip_prefix("%s") {
        return num(rest).map(Reg::Stage);
    }
    if let Some(rest) = token.strip_prefix("%[").and_then(|r| r.strip_suffix(']')) {
        return num(rest).map(Reg::Array);
    }
    Err(format!("expected a register, found `{token}`"))
}

fn opt_reg(token: &str) -> Result<Option<Reg>, String> {
    if token == "-" { Ok(None) } else { parse_reg(token).map(Some) }
}

pub fn parse_const(token: &str) -> Result<Value, String> {
    if token == "nil" {
        return Ok(Value::Nil);
    }
    let Some((tag, rest)) = token.split_once(':') else {
        return Err(format!("expected a constant, found `{token}`"));
    };
    match tag {
        "i" => num(rest).map(Value::Int),
        "f" => num(rest).map(Value::Float),
        "b" => num(rest).map(Value::Bool),
        "s" => unquote(rest).map(Value::Str),
        "x" => {
            let (re, im) = rest
                .split_once(':')
                .ok_or_else(|| format!("bad complex constant `{token}`"))?;
            Ok(Value::Complex(num(re)?, num(im)?))
        }
        "obj" => num::<u64>(rest).map(|_| Value::empty_agg()),
        _ => Err(format!("unknown constant tag in `{token}`")),
    }
}

pub fn parse_arg(token: &str) -> Result<Arg, String> {
    match token.chars().next() {
        Some('%') => parse_reg(token).map(Arg::Reg),
        Some('$') => num(&token[1..]).map(Arg::Param),
        Some('^') => num(&token[1..]).map(Arg::Free),
        Some('@') => unquote(&token[1..]).map(Arg::Global),
        Some('&') => unquote(&token[1..]).map(Arg::Func),
        _ => parse_const(token).map(Arg::Const),
    }
}

fn opt_arg(token: &str) -> Result<Option<Arg>, String> {
    if token == "-" { Ok(None) } else { parse_arg(token).map(Some) }
}

fn opt_const(token: &str) -> Result<Option<Value>, String> {
    if token == "-" { Ok(None) } else { parse_const(token).map(Some) }
}

fn args(tokens: &[String]) -> Result<Vec<Arg>, String> {
    tokens.iter().map(|t| parse_arg(t)).collect()
}

pub fn parse_class(token: &str) -> Result<NumClass, String> {
    let bits = |rest: &str| num::<u32>(rest);
    match token {
        "bool" => Ok(NumClass::Bool),
        "str" => Ok(NumClass::String),
        "any" => Ok(NumClass::Other),
        t if t.starts_with('i') => Ok(NumClass::Int {
            bits: bits(&t[1..])?,
            signed: true,
        }),
        t if t.starts_with('u') => Ok(NumClass::Int {
            bits: bits(&t[1..])?,
            signed: false,
        }),
        t if t.starts_with('f') => Ok(NumClass::Float { bits: bits(&t[1..])? }),
        t if t.starts_with('c') => Ok(NumClass::Complex { bits: bits(&t[1..])? }),
        other => Err(format!("unknown numeric class `{other}`")),
    }
}

fn parse_unary(token: &str) -> Result<UnaryOp, String> {
    Ok(match token {
        "neg" => UnaryOp::Neg,
        "not" => UnaryOp::Not,
        "com" => UnaryOp::Complement,
        other => return Err(format!("unknown unary operator `{other}`")),
    })
}

fn parse_binary(token: &str) -> Result<BinaryOp, String> {
    Ok(match token {
        "add" => BinaryOp::Add,
        "sub" => BinaryOp::Sub,
        "mul" => BinaryOp::Mul,
        "div" => BinaryOp::Div,
        "rem" => BinaryOp::Rem,
        "and" => BinaryOp::And,
        "or" => BinaryOp::Or,
        "xor" => BinaryOp::Xor,
        "andnot" => BinaryOp::AndNot,
        "shl" => BinaryOp::Shl,
        "shr" => BinaryOp::Shr,
        "eq" => BinaryOp::Eq,
        "ne" => BinaryOp::Ne,
        "lt" => BinaryOp::Lt,
        "le" => BinaryOp::Le,
        "gt" => BinaryOp::Gt,
        "ge" => BinaryOp::Ge,
        other => return Err(format!("unknown binary operator `{other}`")),
    })
}

fn parse_stride(token: &str) -> Result<u64, String> {
    if let Some(shift) = token.strip_prefix("<<") {
        let shift: u32 = num(shift)?;
        return 1u64
            .checked_shl(shift)
            .ok_or_else(|| format!("shift {shift} too large"));
    }
    token
        .strip_prefix('*')
        .ok_or_else(|| format!("expected a stride, found `{token}`"))
        .and_then(num)
}

fn parse_conversion(token: &str) -> Result<Conversion, String> {
    Ok(match token {
        "rune-str" => Conversion::RuneToString,
        "bytes-str" => Conversion::BytesToString,
        "str-bytes" => Conversion::StringToBytes,
        "id" => Conversion::Identity,
        other => {
            let mut parts = other.split(':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("num"), Some(from), Some(to)) => Conversion::Numeric {
                    from: parse_class(from)?,
                    to: parse_class(to)?,
                },
                _ => return Err(format!("unknown conversion `{other}`")),
            }
        }
    })
}

fn flag(token: &str, yes: &str, no: &str) -> Result<bool, String> {
    match token {
        t if t == yes => Ok(true),
        t if t == no => Ok(false),
        other => Err(format!("expected `{yes}` or `{no}`, found `{other}`")),
    }
}

/// Fixed-arity access with a readable error.
struct Toks<'t> {
    tokens: &'t [String],
}

impl<'t> Toks<'t> {
    fn at(&self, index: usize) -> Result<&'t str, String> {
        self.tokens
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| format!("`{}` needs at least {} operands", self.tokens[0], index))
    }

    fn rest(&self, from: usize) -> &'t [String] {
        self.tokens.get(from..).unwrap_or(&[])
    }
}

fn parse_callee(t: &Toks<'_>, at: usize) -> Result<(CalleeRef, usize), String> {
    Ok(match t.at(at)? {
        "static" => (CalleeRef::Static(unquote(t.at(at + 1)?)?), at + 2),
        "closure" => (
            CalleeRef::Closure {
                func: unquote(t.at(at + 1)?)?,
                closure: parse_arg(t.at(at + 2)?)?,
            },
            at + 3,
        ),
        "dynamic" => (CalleeRef::Dynamic(parse_arg(t.at(at + 1)?)?), at + 2),
        "invoke" => (
            CalleeRef::Invoke {
                recv: parse_arg(t.at(at + 1)?)?,
                method: unquote(t.at(at + 2)?)?,
            },
            at + 3,
        ),
        other => return Err(format!("unknown callee kind `{other}`")),
    })
}

fn parse_op(t: &Toks<'_>) -> Result<Op, String> {
    let a = |i: usize| t.at(i).and_then(parse_arg);
    Ok(match t.at(2)? {
        "copy" => Op::Copy(a(3)?),
        "un" => Op::Unary {
            op: parse_unary(t.at(3)?)?,
            class: parse_class(t.at(4)?)?,
            x: a(5)?,
        },
        "bin" => Op::Binary {
            op: parse_binary(t.at(3)?)?,
            class: parse_class(t.at(4)?)?,
            x: a(5)?,
            y: a(6)?,
        },
        "conv" => Op::Convert {
            conv: parse_conversion(t.at(3)?)?,
            x: a(4)?,
        },
        "fieldaddr" => Op::FieldAddr {
            base: a(3)?,
            offset: num(t.at(4)?)?,
        },
        "field" => Op::Field {
            base: a(3)?,
            offset: num(t.at(4)?)?,
            width: opt_num(t.at(5)?)?,
            zero: a(6)?,
        },
        "indexaddr" => Op::IndexAddr {
            base: a(3)?,
            index: a(4)?,
            stride: parse_stride(t.at(5)?)?,
            bound: opt_num(t.at(6)?)?,
        },
        "index" => Op::Index {
            base: a(3)?,
            index: a(4)?,
            stride: parse_stride(t.at(5)?)?,
            bound: opt_num(t.at(6)?)?,
            width: opt_num(t.at(7)?)?,
            zero: a(8)?,
        },
        "load" => Op::Load {
            addr: a(3)?,
            width: opt_num(t.at(4)?)?,
            zero: a(5)?,
        },
        "alloc" => Op::Alloc {
            size: num(t.at(3)?)?,
            stack: match t.at(4)? {
                "heap" => None,
                other => Some(
                    other
                        .strip_prefix("stack:")
                        .ok_or_else(|| format!("bad allocation kind `{other}`"))
                        .and_then(num)?,
                ),
            },
        },
        "makeslice" => Op::MakeSlice {
            stride: num(t.at(3)?)?,
            len: a(4)?,
            cap: a(5)?,
        },
        "makemap" => Op::MakeMap,
        "makechan" => Op::MakeChan(a(3)?),
        "closure" => Op::Closure {
            func: unquote(t.at(3)?)?,
            bindings: args(t.rest(4))?,
        },
        "iface" => Op::Iface {
            ty: unquote(t.at(3)?)?,
            x: a(4)?,
        },
        "assert" => Op::Assert {
            x: a(3)?,
            comma_ok: flag(t.at(4)?, "ok", "must")?,
            zero: a(5)?,
            target: match t.at(6)? {
                "type" => AssertTarget::Concrete(unquote(t.at(7)?)?),
                "methods" => AssertTarget::Interface(
                    t.rest(7)
                        .iter()
                        .map(|m| unquote(m))
                        .collect::<Result<_, _>>()?,
                ),
                other => return Err(format!("bad assertion target `{other}`")),
            },
        },
        "slice" => Op::Slice {
            x: a(3)?,
            low: opt_arg(t.at(4)?)?,
            high: opt_arg(t.at(5)?)?,
            stride: num(t.at(6)?)?,
            bound: opt_num(t.at(7)?)?,
        },
        "lookup" => Op::Lookup {
            x: a(3)?,
            key: a(4)?,
            comma_ok: flag(t.at(5)?, "ok", "must")?,
            zero: a(6)?,
        },
        "extract" => Op::Extract {
            tuple: a(3)?,
            index: num(t.at(4)?)?,
        },
        "range" => Op::Range(a(3)?),
        "next" => Op::Next {
            iter: a(3)?,
            is_string: flag(t.at(4)?, "str", "map")?,
        },
        other => return Err(format!("unknown value operation `{other}`")),
    })
}

fn parse_sel_arms(t: &Toks<'_>, count: usize) -> Result<Vec<SelArm>, String> {
    let mut arms = Vec::with_capacity(count);
    let mut at = 4;
    for _ in 0..count {
        let arm = match t.at(at)? {
            "send" => SelArm::Send {
                chan: parse_arg(t.at(at + 1)?)?,
                value: parse_arg(t.at(at + 2)?)?,
            },
            "recv" => SelArm::Recv {
                chan: parse_arg(t.at(at + 1)?)?,
                zero: opt_arg(t.at(at + 2)?)?.unwrap_or(Arg::Const(Value::Nil)),
            },
            other => return Err(format!("bad select arm `{other}`")),
        };
        arms.push(arm);
        at += 3;
    }
    Ok(arms)
}

pub fn parse_stmt(tokens: &[String]) -> Result<Stmt, String> {
    let t = Toks { tokens };
    let a = |i: usize| t.at(i).and_then(parse_arg);
    Ok(match t.at(0)? {
        "case" => Stmt::Case(num(t.at(1)?)?),
        "resume" => Stmt::Resume(num(t.at(1)?)?),
        "stub" => Stmt::Stub(num(t.at(1)?)?),
        "next" => Stmt::Next(num(t.at(1)?)?),
        "yield" => Stmt::Yield,
        "jump" => Stmt::Jump(num(t.at(1)?)?),
        "branch" => Stmt::Branch {
            cond: a(1)?,
            then_block: num(t.at(2)?)?,
            else_block: num(t.at(3)?)?,
        },
        "phi-tag" => Stmt::PhiTag(num(t.at(1)?)?),
        "phi" => Stmt::Phi {
            dest: parse_reg(t.at(1)?)?,
            zero: a(2)?,
            edges: t
                .rest(3)
                .iter()
                .map(|edge| {
                    let (pred, value) = edge
                        .split_once('=')
                        .ok_or_else(|| format!("bad phi edge `{edge}`"))?;
                    Ok((num(pred)?, parse_arg(value)?))
                })
                .collect::<Result<_, String>>()?,
        },
        "ret" => Stmt::Ret(args(t.rest(1))?),
        "pos" => Stmt::Pos(t.at(1)?.to_string()),
        "trace" => Stmt::Trace {
            function: unquote(t.at(1)?)?,
            point: num(t.at(2)?)?,
        },
        "guard" => Stmt::Guard(num(t.at(1)?)?),
        "endguard" => Stmt::EndGuard(num(t.at(1)?)?),
        "sub" => Stmt::Sub(num(t.at(1)?)?),
        "endsub" => Stmt::EndSub(num(t.at(1)?)?),
        "call-sub" => Stmt::CallSub(num(t.at(1)?)?),
        "temp" => Stmt::Temp {
            reg: parse_reg(t.at(1)?)?,
            init: opt_arg(t.at(2)?)?,
        },
        "set" => Stmt::Set {
            dest: opt_reg(t.at(1)?)?,
            op: parse_op(&t)?,
        },
        "store" => Stmt::Store {
            addr: a(1)?,
            value: a(2)?,
            width: opt_num(t.at(3)?)?,
        },
        "map-update" => Stmt::MapUpdate {
            map: a(1)?,
            key: a(2)?,
            value: a(3)?,
        },
        "call" => {
            let (callee, next) = parse_callee(&t, 2)?;
            Stmt::Call {
                slot: slot(t.at(1)?)?,
                callee,
                args: args(t.rest(next))?,
            }
        }
        "run-frame" => Stmt::RunFrame(slot(t.at(1)?)?),
        "result" => Stmt::Result {
            dest: opt_reg(t.at(1)?)?,
            slot: slot(t.at(2)?)?,
        },
        "go" => {
            let (callee, next) = parse_callee(&t, 1)?;
            Stmt::Go {
                callee,
                args: args(t.rest(next))?,
            }
        }
        "defer" => {
            let (callee, next) = parse_callee(&t, 1)?;
            Stmt::Defer {
                callee,
                args: args(t.rest(next))?,
            }
        }
        "run-defers" => Stmt::RunDefers,
        "builtin" => Stmt::Builtin {
            dest: opt_reg(t.at(1)?)?,
            name: unquote(t.at(2)?)?,
            stride: opt_num(t.at(3)?)?,
            args: args(t.rest(4))?,
        },
        "recover" => Stmt::Recover(opt_reg(t.at(1)?)?),
        "panic" => Stmt::Panic(a(1)?),
        "missing" => Stmt::Missing {
            dest: opt_reg(t.at(1)?)?,
            what: unquote(t.at(2)?)?,
        },
        "wait-send" => Stmt::WaitSend(a(1)?),
        "send" => Stmt::Send {
            chan: a(1)?,
            value: a(2)?,
        },
        "wait-recv" => Stmt::WaitRecv(a(1)?),
        "recv" => Stmt::Recv {
            dest: opt_reg(t.at(1)?)?,
            chan: a(2)?,
            comma_ok: flag(t.at(3)?, "ok", "plain")?,
            zero: a(4)?,
        },
        "sel-ready" => Stmt::SelReady {
            site: num(t.at(1)?)?,
            state: num(t.at(2)?)?,
            send: flag(t.at(3)?, "send", "recv")?,
            chan: a(4)?,
        },
        "sel-pick" => Stmt::SelPick {
            site: num(t.at(1)?)?,
            blocking: flag(t.at(2)?, "block", "poll")?,
        },
        "sel-wait" => Stmt::SelWait(num(t.at(1)?)?),
        "sel-do" => Stmt::SelDo {
            dest: opt_reg(t.at(1)?)?,
            site: num(t.at(2)?)?,
            arms: parse_sel_arms(&t, num(t.at(3)?)?)?,
        },
        other => return Err(format!("unknown statement `{other}`")),
    })
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

enum State {
    Top,
    Header(FuncCode),
    Locals(FuncCode),
    Body(FuncCode),
}

fn key_value<'t>(token: &'t str, key: &str) -> Result<&'t str, String> {
    token
        .strip_prefix(key)
        .and_then(|rest| rest.strip_prefix('='))
        .ok_or_else(|| format!("expected `{key}=`, found `{token}`"))
}

fn parse_header(tokens: &[String]) -> Result<FuncCode, String> {
    let t = Toks { tokens };
    Ok(FuncCode {
        name: unquote(t.at(1)?)?,
        params: num(key_value(t.at(2)?, "params")?)?,
        free: num(key_value(t.at(3)?, "free")?)?,
        results: num(key_value(t.at(4)?, "results")?)?,
        suspends: num(key_value(t.at(5)?, "suspends")?)?,
        recover: opt_num(key_value(t.at(6)?, "recover")?)?
            .map(u32::try_from)
            .transpose()
            .map_err(|e| e.to_string())?,
        ..FuncCode::default()
    })
}

fn header_line(code: &mut FuncCode, tokens: &[String]) -> Result<(), String> {
    let t = Toks { tokens };
    match t.at(0)? {
        "param" | "phi-field" | "slot" | "select" => {}
        "field" => code
            .fields
            .push((parse_reg(t.at(1)?)?, opt_const(t.at(2)?)?)),
        "regarray" => code.array_slots = num(t.at(1)?)?,
        "stackalloc" => code
            .stack_allocs
            .push((num(t.at(1)?)?, num(t.at(2)?)?)),
        other => return Err(format!("unexpected `{other}` in a frame header")),
    }
    Ok(())
}

fn push_body(code: &mut FuncCode, stmt: Stmt, line: usize) -> Result<(), String> {
    let index = code.body.len();
    let label = match &stmt {
        Stmt::Case(block) => Some(Label::Block(*block)),
        Stmt::Resume(addr) => Some(Label::Resume(*addr)),
        Stmt::Stub(addr) => Some(Label::Stub(*addr)),
        Stmt::Sub(id) => {
            code.subs.insert(*id, index + 1);
            None
        }
        _ => None,
    };
    if let Some(label) = label
        && code.labels.insert(label, index).is_some()
    {
        return Err(format!("duplicate label {label:?}"));
    }
    code.body.push(Line { stmt, line });
    Ok(())
}

/// Parse a whole file.
pub fn parse_module(text: &str) -> Result<Module, ScriptError> {
    let mut module = Module::default();
    let mut state = State::Top;
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let fail = |message: String| ScriptError::Parse { line, message };
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let tokens = tokenize(trimmed).map_err(fail)?;
        let head = tokens[0].as_str();
        state = match (state, head) {
            (State::Top, "func") => State::Header(parse_header(&tokens).map_err(fail)?),
            (State::Top, "package") => {
                let name = tokens.get(1).ok_or_else(|| fail("package needs a name".into()))?;
                module.package = Some(unquote(name).map_err(fail)?);
                State::Top
            }
            (State::Top, "global") => {
                let t = Toks { tokens: &tokens };
                let name = t.at(1).and_then(parse_arg).map_err(fail)?;
                let Arg::Global(name) = name else {
                    return Err(fail("global needs an `@` name".into()));
                };
                let size = t.at(2).and_then(num).map_err(fail)?;
                module.globals.push((name, size));
                State::Top
            }
            (State::Top, "placeholder") => {
                let t = Toks { tokens: &tokens };
                let name = t.at(1).and_then(unquote).map_err(fail)?;
                let reason = t.at(2).and_then(unquote).map_err(fail)?;
                module.placeholders.insert(name, reason);
                State::Top
            }
            (State::Top, other) => return Err(fail(format!("unexpected `{other}` outside a frame"))),
            (State::Header(code), "run") => State::Locals(code),
            (State::Header(mut code), _) => {
                header_line(&mut code, &tokens).map_err(fail)?;
                State::Header(code)
            }
            (State::Locals(mut code), "local") => {
                let t = Toks { tokens: &tokens };
                let reg = t.at(1).and_then(parse_reg).map_err(fail)?;
                let init = t.at(2).and_then(opt_const).map_err(fail)?;
                code.locals.push((reg, init));
                State::Locals(code)
            }
            (State::Locals(code) | State::Body(code), "end") => {
                module.functions.insert(code.name.clone(), Rc::new(code));
                State::Top
            }
            (State::Locals(mut code) | State::Body(mut code), _) => {
                let stmt = parse_stmt(&tokens).map_err(fail)?;
                push_body(&mut code, stmt, line).map_err(fail)?;
                State::Body(code)
            }
        };
    }
    match state {
        State::Top => Ok(module),
        State::Header(code) | State::Locals(code) | State::Body(code) => Err(ScriptError::Parse {
            line: text.lines().count(),
            message: format!("frame `{}` is not closed with `end`", code.name),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_keep_quoted_whitespace() {
        let tokens = tokenize(r#"set %v1 copy s:"a \" b"  "#).unwrap();
        assert_eq!(tokens, vec!["set", "%v1", "copy", r#"s:"a \" b""#]);
        assert!(tokenize(r#"panic s:"open"#).is_err());
    }

    #[test]
    fn operands_decode_by_prefix() {
        assert!(matches!(parse_arg("%[3]"), Ok(Arg::Reg(Reg::Array(3)))));
        assert!(matches!(parse_arg("$1"), Ok(Arg::Param(1))));
        assert!(matches!(parse_arg("^0"), Ok(Arg::Free(0))));
        assert!(matches!(parse_arg(r#"&"main.f""#), Ok(Arg::Func(name)) if name == "main.f"));
        assert!(matches!(parse_arg("x:1.0:-2.0"), Ok(Arg::Const(Value::Complex(re, im))) if re == 1.0 && im == -2.0));
        assert!(parse_arg("?").is_err());
    }

    #[test]
    fn frames_collect_labels_and_subs() {
        let text = "\
func \"main.f\" params=0 free=0 results=0 suspends=true recover=-
field %v0 i:0
run
case 0
call-sub 1
next -1
yield
resume -1
ret
sub 1
set %v0 copy i:4
endsub 1
end
";
        let module = parse_module(text).unwrap();
        let code = &module.functions["main.f"];
        assert_eq!(code.labels[&Label::Block(0)], 0);
        assert_eq!(code.labels[&Label::Resume(-1)], 4);
        assert_eq!(code.subs[&1], 7);
        assert!(code.is_field(Reg::Value(0)));
        assert!(!code.is_field(Reg::Value(1)));
    }

    #[test]
    fn unclosed_frames_are_rejected() {
        let err = parse_module("func \"f\" params=0 free=0 results=0 suspends=false recover=-\nrun\n")
            .unwrap_err();
        assert!(err.to_string().contains("not closed"));
    }
}
