//! The capability interface every concrete output syntax implements.
//!
//! The engine decides everything about control flow, storage and
//! suspension; a [`Target`] only turns each decision into text. Operand
//! strings handed to a target were rendered by the same target through
//! [`Target::register`], [`Target::param`], [`Target::constant`] and friends,
//! so the engine never needs to know the syntax of an operand.

use strand_diag::SourceLocation;
use strand_ir::{BinaryOp, ChanDir, Constant, NumClass, UnaryOp, ValueId};

use crate::layout::{Addressing, Sizes};

/// Structural limits of an output language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetLimits {
    /// Named registers a frame may declare before the whole function
    /// switches to array storage.
    pub instruction_limit: usize,
    /// Instructions a function may hold before its guarded units are
    /// emitted as separate sub-units.
    pub sub_fn_instruction_limit: usize,
}

impl Default for TargetLimits {
    fn default() -> Self {
        Self {
            instruction_limit: 512,
            sub_fn_instruction_limit: 2048,
        }
    }
}

impl TargetLimits {
    pub fn validate(&self) -> Result<(), String> {
        if self.instruction_limit == 0 {
            return Err("instruction limit must be at least 1".to_string());
        }
        if self.sub_fn_instruction_limit == 0 {
            return Err("sub-function instruction limit must be at least 1".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Where a live register is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StorageClass {
    /// Frame field: survives suspension.
    Field,
    /// Local of the frame's run body (functions that never suspend).
    Local,
    /// Scoped to one guarded unit.
    Temp,
    /// Slot of the frame's register array.
    Array(usize),
}

impl StorageClass {
    pub fn is_persisted(self) -> bool {
        matches!(self, StorageClass::Field | StorageClass::Array(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegKey {
    Value(ValueId),
    /// Staging copy used when phis of one block read each other.
    Stage(ValueId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub key: RegKey,
    pub class: StorageClass,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ZeroValue {
    Bool,
    Int,
    Float,
    Complex,
    String,
    Nil,
    Aggregate { size: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDecl {
    pub name: String,
    /// Rendered zero value, or `None` when the first write precedes any read.
    pub init: Option<String>,
    pub ty: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub index: usize,
    pub name: String,
    pub ty: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDecl {
    pub addr: i64,
    /// Async slots outlive the unit that fills them.
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackAllocDecl {
    pub value: ValueId,
    pub size: u64,
}

/// Everything a frame type needs to declare.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameDecl {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub free_vars: usize,
    pub results: usize,
    pub suspends: bool,
    pub recover: Option<u32>,
    pub public: bool,
    pub fields: Vec<RegisterDecl>,
    pub array_slots: usize,
    pub slots: Vec<SlotDecl>,
    pub selects: Vec<i64>,
    pub stack_allocs: Vec<StackAllocDecl>,
    pub uses_phi: bool,
    pub split: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalDecl {
    pub name: String,
    pub size: u64,
    pub ty: String,
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    Numeric { from: NumClass, to: NumClass },
    RuneToString,
    BytesToString,
    StringToBytes,
    Identity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertTarget {
    Concrete(String),
    Interface(Vec<String>),
}

/// A value computation. `width` is set when the result is an aggregate of
/// that many bytes and must be copied rather than shared.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueOp {
    Copy(String),
    Unary {
        op: UnaryOp,
        class: NumClass,
        x: String,
    },
    Binary {
        op: BinaryOp,
        class: NumClass,
        x: String,
        y: String,
    },
    Convert {
        conv: Conversion,
        x: String,
    },
    FieldAddr {
        base: String,
        offset: u64,
    },
    Field {
        base: String,
        offset: u64,
        width: Option<u64>,
        zero: String,
    },
    IndexAddr {
        base: String,
        index: String,
        addressing: Addressing,
        /// Length of the addressed array; `None` for slices.
        bound: Option<u64>,
    },
    Index {
        base: String,
        index: String,
        addressing: Addressing,
        bound: Option<u64>,
        width: Option<u64>,
        zero: String,
    },
    Load {
        addr: String,
        width: Option<u64>,
        zero: String,
    },
    Alloc {
        size: u64,
        /// Preallocated frame object reused by a stack allocation.
        stack: Option<ValueId>,
    },
    MakeSlice {
        stride: u64,
        len: String,
        cap: String,
    },
    MakeMap,
    MakeChan {
        size: String,
    },
    MakeClosure {
        func: String,
        bindings: Vec<String>,
    },
    MakeInterface {
        type_name: String,
        x: String,
    },
    TypeAssert {
        x: String,
        target: AssertTarget,
        comma_ok: bool,
        zero: String,
    },
    Slice {
        x: String,
        low: Option<String>,
        high: Option<String>,
        stride: u64,
        bound: Option<u64>,
    },
    Lookup {
        x: String,
        key: String,
        comma_ok: bool,
        zero: String,
    },
    Extract {
        tuple: String,
        index: usize,
    },
    Range {
        x: String,
    },
    Next {
        iter: String,
        is_string: bool,
    },
}

// ---------------------------------------------------------------------------
// Calls and channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCallee {
    Static(String),
    Closure { func: String, closure: String },
    Dynamic(String),
    Invoke { recv: String, method: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinArg {
    pub text: String,
    pub ty: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinCall {
    pub name: String,
    pub args: Vec<BuiltinArg>,
    /// Element stride when the first argument is a slice.
    pub stride: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectArm {
    pub dir: ChanDir,
    pub chan: String,
    pub send: Option<String>,
    /// Zero of the element type, for receive states.
    pub zero: Option<String>,
}

// ---------------------------------------------------------------------------
// The interface
// ---------------------------------------------------------------------------

pub trait Target {
    fn name(&self) -> &'static str;
    fn file_suffix(&self) -> &'static str;
    fn sizes(&self) -> Sizes;
    fn limits(&self) -> TargetLimits;

    // -- scaffolding --------------------------------------------------------

    fn comment(&self, text: &str) -> String;
    fn file_start(&self, package: &str, header: &str) -> String;
    fn file_end(&self, warnings: &[String], packages: &[String]) -> String;
    fn package_unit(&self, package: &str, globals: &[GlobalDecl]) -> String;
    fn func_start(&self, decl: &FrameDecl) -> String;
    /// Opens the run body; `locals` are declared for every run.
    fn run_start(&self, locals: &[RegisterDecl]) -> String;
    fn func_end(&self, decl: &FrameDecl) -> String;
    /// Unit for a function that cannot be generated; fails when called.
    fn placeholder_function(&self, name: &str, reason: &str) -> String;

    // -- dispatch -----------------------------------------------------------

    fn block_start(&self, block: u32) -> String;
    fn resume_arm(&self, addr: i64) -> String;
    fn stub_arm(&self, addr: i64) -> String;
    fn set_next(&self, addr: i64) -> String;
    fn suspend(&self) -> String;
    fn jump(&self, block: u32) -> String;
    fn branch(&self, cond: &str, then_block: u32, else_block: u32) -> String;
    fn phi_tag(&self, pred: u32) -> String;
    fn phi(&self, dest: &str, zero: &str, edges: &[(u32, String)]) -> String;
    fn ret(&self, results: &[String]) -> String;
    fn position(&self, location: &SourceLocation) -> String;
    fn trace(&self, function: &str, point: i64) -> String;

    // -- storage and operands -----------------------------------------------

    fn register(&self, reg: &Register) -> String;
    fn param(&self, index: usize) -> String;
    fn free_var(&self, index: usize) -> String;
    fn global(&self, name: &str) -> String;
    fn function_ref(&self, name: &str) -> String;
    fn constant(&self, constant: &Constant) -> String;
    fn zero_value(&self, zero: &ZeroValue) -> String;
    fn declare_temp(&self, reg: &str, init: Option<&str>) -> String;

    // -- values and memory --------------------------------------------------

    fn value(&self, dest: Option<&str>, op: &ValueOp) -> String;
    fn store(&self, addr: &str, value: &str, width: Option<u64>) -> String;
    fn map_update(&self, map: &str, key: &str, value: &str) -> String;

    // -- guarded units ------------------------------------------------------

    fn guard_start(&self, id: u32) -> String;
    fn guard_end(&self, id: u32) -> String;
    fn sub_def(&self, id: u32, body: &str) -> String;
    fn sub_call(&self, id: u32) -> String;

    // -- calls --------------------------------------------------------------

    fn new_frame(&self, slot: i64, callee: &FrameCallee, args: &[String]) -> String;
    fn run_frame(&self, slot: i64) -> String;
    fn frame_result(&self, dest: Option<&str>, slot: i64) -> String;
    fn go(&self, callee: &FrameCallee, args: &[String]) -> String;
    fn defer(&self, callee: &FrameCallee, args: &[String]) -> String;
    fn run_defers(&self) -> String;
    /// `None` when the target has no mapping for the builtin.
    fn builtin(&self, dest: Option<&str>, call: &BuiltinCall) -> Option<String>;
    fn recover(&self, dest: Option<&str>) -> String;
    fn panic(&self, value: &str) -> String;
    /// Stands in for something that could not be generated; fails at run time.
    fn placeholder(&self, dest: Option<&str>, what: &str) -> String;

    // -- channels -----------------------------------------------------------

    fn await_send(&self, chan: &str) -> String;
    fn send(&self, chan: &str, value: &str) -> String;
    fn await_recv(&self, chan: &str) -> String;
    fn recv(&self, dest: Option<&str>, chan: &str, comma_ok: bool, zero: &str) -> String;
    fn select_ready(&self, site: i64, state: usize, dir: ChanDir, chan: &str) -> String;
    fn select_pick(&self, site: i64, blocking: bool) -> String;
    fn select_wait(&self, site: i64) -> String;
    fn select_commit(&self, dest: Option<&str>, site: i64, arms: &[SelectArm]) -> String;
}
