//! Line-oriented textual target.
//!
//! One statement per line, `#` comments. Operands are single tokens:
//! registers (`%v3`, `%[2]`, `%s3`), parameters (`$0`), free variables
//! (`^0`), globals (`@"pkg.x"`), function references (`&"pkg.f"`) and
//! constants (`i:3`, `f:1.5`, `b:true`, `s:"text"`, `x:1:0`, `nil`,
//! `obj:16`). Names and strings are JSON-quoted so a token never contains
//! unquoted whitespace. `-` stands for an absent destination or option.

use std::fmt::Write as _;

use strand_codegen::{
    AssertTarget, BuiltinCall, Conversion, FrameCallee, FrameDecl, GlobalDecl, RegKey, Register,
    RegisterDecl, SelectArm, Sizes, StorageClass, Target, TargetLimits, ValueOp, ZeroValue,
};
use strand_codegen::layout::Addressing;
use strand_diag::SourceLocation;
use strand_ir::{BinaryOp, ChanDir, ConstValue, Constant, NumClass, UnaryOp};

/// Builtins the VM implements.
pub const BUILTINS: &[&str] = &[
    "len",
    "cap",
    "append",
    "copy",
    "close",
    "delete",
    "print",
    "println",
    "real",
    "imag",
    "complex",
    "ssa:wrapnilchk",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptTarget {
    pub sizes: Sizes,
    pub limits: TargetLimits,
}

impl Default for ScriptTarget {
    fn default() -> Self {
        Self {
            sizes: Sizes::WORD64,
            limits: TargetLimits::default(),
        }
    }
}

pub fn quote(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

fn opt(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

fn opt_num(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |n| n.to_string())
}

pub fn class_token(class: NumClass) -> String {
    match class {
        NumClass::Int { bits, signed: true } => format!("i{bits}"),
        NumClass::Int { bits, signed: false } => format!("u{bits}"),
        NumClass::Float { bits } => format!("f{bits}"),
        NumClass::Complex { bits } => format!("c{bits}"),
        NumClass::Bool => "bool".to_string(),
        NumClass::String => "str".to_string(),
        NumClass::Other => "any".to_string(),
    }
}

pub fn unary_token(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "neg",
        UnaryOp::Not => "not",
        UnaryOp::Complement => "com",
    }
}

pub fn binary_token(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => "div",
        BinaryOp::Rem => "rem",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
        BinaryOp::Xor => "xor",
        BinaryOp::AndNot => "andnot",
        BinaryOp::Shl => "shl",
        BinaryOp::Shr => "shr",
        BinaryOp::Eq => "eq",
        BinaryOp::Ne => "ne",
        BinaryOp::Lt => "lt",
        BinaryOp::Le => "le",
        BinaryOp::Gt => "gt",
        BinaryOp::Ge => "ge",
    }
}

fn addressing_token(addressing: Addressing) -> String {
    match addressing.shift {
        Some(shift) => format!("<<{shift}"),
        None => format!("*{}", addressing.stride),
    }
}

fn callee_tokens(callee: &FrameCallee) -> String {
    match callee {
        FrameCallee::Static(name) => format!("static {}", quote(name)),
        FrameCallee::Closure { func, closure } => format!("closure {} {closure}", quote(func)),
        FrameCallee::Dynamic(value) => format!("dynamic {value}"),
        FrameCallee::Invoke { recv, method } => format!("invoke {recv} {}", quote(method)),
    }
}

fn with_args(mut text: String, args: &[String]) -> String {
    for arg in args {
        text.push(' ');
        text.push_str(arg);
    }
    text
}

impl Target for ScriptTarget {
    fn name(&self) -> &'static str {
        "script"
    }

    fn file_suffix(&self) -> &'static str {
        "sfs"
    }

    fn sizes(&self) -> Sizes {
        self.sizes
    }

    fn limits(&self) -> TargetLimits {
        self.limits
    }

    // -- scaffolding --------------------------------------------------------

    fn comment(&self, text: &str) -> String {
        text.lines()
            .map(|line| format!("# {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn file_start(&self, package: &str, header: &str) -> String {
        let mut text = format!("# strand script, package {package}\n");
        if !header.is_empty() {
            text.push_str(&self.comment(header));
            text.push('\n');
        }
        text
    }

    fn file_end(&self, warnings: &[String], packages: &[String]) -> String {
        let mut text = String::new();
        for warning in warnings {
            let _ = writeln!(text, "{}", self.comment(&format!("warning: {warning}")));
        }
        let _ = writeln!(text, "# packages: {}", packages.join(" "));
        text
    }

    fn package_unit(&self, package: &str, globals: &[GlobalDecl]) -> String {
        let mut text = format!("package {}\n", quote(package));
        for global in globals {
            let _ = writeln!(text, "global {} {}", self.global(&global.name), global.size);
        }
        text
    }

    fn func_start(&self, decl: &FrameDecl) -> String {
        let mut text = format!(
            "func {} params={} free={} results={} suspends={} recover={}",
            quote(&decl.name),
            decl.params.len(),
            decl.free_vars,
            decl.results,
            decl.suspends,
            opt_num(decl.recover.map(u64::from)),
        );
        for param in &decl.params {
            let _ = write!(text, "\nparam {} {}", param.index, quote(&param.name));
        }
        for field in &decl.fields {
            let _ = write!(text, "\nfield {} {}", field.name, opt(field.init.as_deref()));
        }
        if decl.array_slots > 0 {
            let _ = write!(text, "\nregarray {}", decl.array_slots);
        }
        for slot in &decl.slots {
            let kind = if slot.persisted { "persisted" } else { "local" };
            let _ = write!(text, "\nslot sf{} {kind}", -slot.addr);
        }
        for site in &decl.selects {
            let _ = write!(text, "\nselect {site}");
        }
        for alloc in &decl.stack_allocs {
            let _ = write!(text, "\nstackalloc {} {}", alloc.value.0, alloc.size);
        }
        if decl.uses_phi {
            text.push_str("\nphi-field");
        }
        text
    }

    fn run_start(&self, locals: &[RegisterDecl]) -> String {
        let mut text = "run".to_string();
        for local in locals {
            let _ = write!(text, "\nlocal {} {}", local.name, opt(local.init.as_deref()));
        }
        text
    }

    fn func_end(&self, _decl: &FrameDecl) -> String {
        "end".to_string()
    }

    fn placeholder_function(&self, name: &str, reason: &str) -> String {
        format!("placeholder {} {}", quote(name), quote(reason))
    }

    // -- dispatch -----------------------------------------------------------

    fn block_start(&self, block: u32) -> String {
        format!("case {block}")
    }

    fn resume_arm(&self, addr: i64) -> String {
        format!("resume {addr}")
    }

    fn stub_arm(&self, addr: i64) -> String {
        format!("stub {addr}")
    }

    fn set_next(&self, addr: i64) -> String {
        format!("next {addr}")
    }

    fn suspend(&self) -> String {
        "yield".to_string()
    }

    fn jump(&self, block: u32) -> String {
        format!("jump {block}")
    }

    fn branch(&self, cond: &str, then_block: u32, else_block: u32) -> String {
        format!("branch {cond} {then_block} {else_block}")
    }

    fn phi_tag(&self, pred: u32) -> String {
        format!("phi-tag {pred}")
    }

    fn phi(&self, dest: &str, zero: &str, edges: &[(u32, String)]) -> String {
        let mut text = format!("phi {dest} {zero}");
        for (pred, value) in edges {
            let _ = write!(text, " {pred}={value}");
        }
        text
    }

    fn ret(&self, results: &[String]) -> String {
        with_args("ret".to_string(), results)
    }

    fn position(&self, location: &SourceLocation) -> String {
        format!("pos {location}")
    }

    fn trace(&self, function: &str, point: i64) -> String {
        format!("trace {} {point}", quote(function))
    }

    // -- storage and operands -----------------------------------------------

    fn register(&self, reg: &Register) -> String {
        match (reg.key, reg.class) {
            (_, StorageClass::Array(slot)) => format!("%[{slot}]"),
            (RegKey::Value(id), _) => format!("%v{}", id.0),
            (RegKey::Stage(id), _) => format!("%s{}", id.0),
        }
    }

    fn param(&self, index: usize) -> String {
        format!("${index}")
    }

    fn free_var(&self, index: usize) -> String {
        format!("^{index}")
    }

    fn global(&self, name: &str) -> String {
        format!("@{}", quote(name))
    }

    fn function_ref(&self, name: &str) -> String {
        format!("&{}", quote(name))
    }

    fn constant(&self, constant: &Constant) -> String {
        match &constant.value {
            ConstValue::Bool(b) => format!("b:{b}"),
            ConstValue::Int(i) => format!("i:{i}"),
            ConstValue::Float(f) => format!("f:{f:?}"),
            ConstValue::Complex(re, im) => format!("x:{re:?}:{im:?}"),
            ConstValue::String(s) => format!("s:{}", quote(s)),
            ConstValue::Nil => "nil".to_string(),
        }
    }

    fn zero_value(&self, zero: &ZeroValue) -> String {
        match zero {
            ZeroValue::Bool => "b:false".to_string(),
            ZeroValue::Int => "i:0".to_string(),
            ZeroValue::Float => "f:0.0".to_string(),
            ZeroValue::Complex => "x:0.0:0.0".to_string(),
            ZeroValue::String => "s:\"\"".to_string(),
            ZeroValue::Nil => "nil".to_string(),
            ZeroValue::Aggregate { size } => format!("obj:{size}"),
        }
    }

    fn declare_temp(&self, reg: &str, init: Option<&str>) -> String {
        format!("temp {reg} {}", opt(init))
    }

    // -- values and memory --------------------------------------------------

    fn value(&self, dest: Option<&str>, op: &ValueOp) -> String {
        let body = match op {
            ValueOp::Copy(x) => format!("copy {x}"),
            ValueOp::Unary { op, class, x } => {
                format!("un {} {} {x}", unary_token(*op), class_token(*class))
            }
            ValueOp::Binary { op, class, x, y } => {
                format!("bin {} {} {x} {y}", binary_token(*op), class_token(*class))
            }
            ValueOp::Convert { conv, x } => {
                let kind = match conv {
                    Conversion::Numeric { from, to } => {
                        format!("num:{}:{}", class_token(*from), class_token(*to))
                    }
                    Conversion::RuneToString => "rune-str".to_string(),
                    Conversion::BytesToString => "bytes-str".to_string(),
                    Conversion::StringToBytes => "str-bytes".to_string(),
                    Conversion::Identity => "id".to_string(),
                };
                format!("conv {kind} {x}")
            }
            ValueOp::FieldAddr { base, offset } => format!("fieldaddr {base} {offset}"),
            ValueOp::Field {
                base,
                offset,
                width,
                zero,
            } => format!("field {base} {offset} {} {zero}", opt_num(*width)),
            ValueOp::IndexAddr {
                base,
                index,
                addressing,
                bound,
            } => format!(
                "indexaddr {base} {index} {} {}",
                addressing_token(*addressing),
                opt_num(*bound)
            ),
            ValueOp::Index {
                base,
                index,
                addressing,
                bound,
                width,
                zero,
            } => format!(
                "index {base} {index} {} {} {} {zero}",
                addressing_token(*addressing),
                opt_num(*bound),
                opt_num(*width)
            ),
            ValueOp::Load { addr, width, zero } => {
                format!("load {addr} {} {zero}", opt_num(*width))
            }
            ValueOp::Alloc { size, stack } => match stack {
                Some(id) => format!("alloc {size} stack:{}", id.0),
                None => format!("alloc {size} heap"),
            },
            ValueOp::MakeSlice { stride, len, cap } => format!("makeslice {stride} {len} {cap}"),
            ValueOp::MakeMap => "makemap".to_string(),
            ValueOp::MakeChan { size } => format!("makechan {size}"),
            ValueOp::MakeClosure { func, bindings } => {
                with_args(format!("closure {}", quote(func)), bindings)
            }
            ValueOp::MakeInterface { type_name, x } => format!("iface {} {x}", quote(type_name)),
            ValueOp::TypeAssert {
                x,
                target,
                comma_ok,
                zero,
            } => {
                let mode = if *comma_ok { "ok" } else { "must" };
                match target {
                    AssertTarget::Concrete(name) => {
                        format!("assert {x} {mode} {zero} type {}", quote(name))
                    }
                    AssertTarget::Interface(methods) => {
                        let names: Vec<String> = methods.iter().map(|m| quote(m)).collect();
                        with_args(format!("assert {x} {mode} {zero} methods"), &names)
                    }
                }
            }
            ValueOp::Slice {
                x,
                low,
                high,
                stride,
                bound,
            } => format!(
                "slice {x} {} {} {stride} {}",
                opt(low.as_deref()),
                opt(high.as_deref()),
                opt_num(*bound)
            ),
            ValueOp::Lookup {
                x,
                key,
                comma_ok,
                zero,
            } => {
                let mode = if *comma_ok { "ok" } else { "must" };
                format!("lookup {x} {key} {mode} {zero}")
            }
            ValueOp::Extract { tuple, index } => format!("extract {tuple} {index}"),
            ValueOp::Range { x } => format!("range {x}"),
            ValueOp::Next { iter, is_string } => {
                format!("next {iter} {}", if *is_string { "str" } else { "map" })
            }
        };
        format!("set {} {body}", opt(dest))
    }

    fn store(&self, addr: &str, value: &str, width: Option<u64>) -> String {
        format!("store {addr} {value} {}", opt_num(width))
    }

    fn map_update(&self, map: &str, key: &str, value: &str) -> String {
        format!("map-update {map} {key} {value}")
    }

    // -- guarded units ------------------------------------------------------

    fn guard_start(&self, id: u32) -> String {
        format!("guard {id}")
    }

    fn guard_end(&self, id: u32) -> String {
        format!("endguard {id}")
    }

    fn sub_def(&self, id: u32, body: &str) -> String {
        format!("sub {id}\n{}endsub {id}", body)
    }

    fn sub_call(&self, id: u32) -> String {
        format!("call-sub {id}")
    }

    // -- calls --------------------------------------------------------------

    fn new_frame(&self, slot: i64, callee: &FrameCallee, args: &[String]) -> String {
        with_args(format!("call sf{} {}", -slot, callee_tokens(callee)), args)
    }

    fn run_frame(&self, slot: i64) -> String {
        format!("run-frame sf{}", -slot)
    }

    fn frame_result(&self, dest: Option<&str>, slot: i64) -> String {
        format!("result {} sf{}", opt(dest), -slot)
    }

    fn go(&self, callee: &FrameCallee, args: &[String]) -> String {
        with_args(format!("go {}", callee_tokens(callee)), args)
    }

    fn defer(&self, callee: &FrameCallee, args: &[String]) -> String {
        with_args(format!("defer {}", callee_tokens(callee)), args)
    }

    fn run_defers(&self) -> String {
        "run-defers".to_string()
    }

    fn builtin(&self, dest: Option<&str>, call: &BuiltinCall) -> Option<String> {
        if !BUILTINS.contains(&call.name.as_str()) {
            return None;
        }
        let args: Vec<String> = call.args.iter().map(|a| a.text.clone()).collect();
        Some(with_args(
            format!("builtin {} {} {}", opt(dest), quote(&call.name), opt_num(call.stride)),
            &args,
        ))
    }

    fn recover(&self, dest: Option<&str>) -> String {
        format!("recover {}", opt(dest))
    }

    fn panic(&self, value: &str) -> String {
        format!("panic {value}")
    }

    fn placeholder(&self, dest: Option<&str>, what: &str) -> String {
        format!("missing {} {}", opt(dest), quote(what))
    }

    // -- channels -----------------------------------------------------------

    fn await_send(&self, chan: &str) -> String {
        format!("wait-send {chan}")
    }

    fn send(&self, chan: &str, value: &str) -> String {
        format!("send {chan} {value}")
    }

    fn await_recv(&self, chan: &str) -> String {
        format!("wait-recv {chan}")
    }

    fn recv(&self, dest: Option<&str>, chan: &str, comma_ok: bool, zero: &str) -> String {
        let mode = if comma_ok { "ok" } else { "plain" };
        format!("recv {} {chan} {mode} {zero}", opt(dest))
    }

    fn select_ready(&self, site: i64, state: usize, dir: ChanDir, chan: &str) -> String {
        let dir = match dir {
            ChanDir::Send => "send",
            ChanDir::Recv | ChanDir::Both => "recv",
        };
        format!("sel-ready {site} {state} {dir} {chan}")
    }

    fn select_pick(&self, site: i64, blocking: bool) -> String {
        format!("sel-pick {site} {}", if blocking { "block" } else { "poll" })
    }

    fn select_wait(&self, site: i64) -> String {
        format!("sel-wait {site}")
    }

    fn select_commit(&self, dest: Option<&str>, site: i64, arms: &[SelectArm]) -> String {
        let mut text = format!("sel-do {} {site} {}", opt(dest), arms.len());
        for arm in arms {
            match (&arm.send, &arm.zero) {
                (Some(value), _) => {
                    let _ = write!(text, " send {} {value}", arm.chan);
                }
                (None, zero) => {
                    let _ = write!(text, " recv {} {}", arm.chan, opt(zero.as_deref()));
                }
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_ir::{Type, ValueId};

    #[test]
    fn operands_are_single_tokens() {
        let t = ScriptTarget::default();
        let text = t.constant(&Constant {
            ty: Type::String,
            value: ConstValue::String("two words".to_string()),
        });
        assert_eq!(text, "s:\"two words\"");
        assert_eq!(t.global("main.x"), "@\"main.x\"");
        assert_eq!(
            t.register(&Register {
                key: RegKey::Value(ValueId(4)),
                class: StorageClass::Array(2),
            }),
            "%[2]"
        );
        assert_eq!(
            t.register(&Register {
                key: RegKey::Stage(ValueId(4)),
                class: StorageClass::Temp,
            }),
            "%s4"
        );
    }

    #[test]
    fn unmapped_builtins_are_reported() {
        let t = ScriptTarget::default();
        let call = BuiltinCall {
            name: "recover2".to_string(),
            args: Vec::new(),
            stride: None,
        };
        assert_eq!(t.builtin(None, &call), None);
        let call = BuiltinCall {
            name: "len".to_string(),
            args: Vec::new(),
            stride: None,
        };
        assert_eq!(t.builtin(Some("%v1"), &call).as_deref(), Some("builtin %v1 \"len\" -"));
    }

    #[test]
    fn slots_are_named_by_their_address() {
        let t = ScriptTarget::default();
        let text = t.new_frame(-3, &FrameCallee::Static("main.f".to_string()), &["i:1".to_string()]);
        assert_eq!(text, "call sf3 static \"main.f\" i:1");
        assert_eq!(t.frame_result(None, -3), "result - sf3");
    }
}
