//! Typed SSA input model for the strand backend.
//!
//! The front end hands over one [`Program`] per package: functions made of
//! forward-numbered basic blocks, each a run of [`Instruction`]s closed by a
//! [`Terminator`]. Values are assigned exactly once and referenced by
//! [`ValueId`]. Nothing here is generator state; the engine derives layouts
//! and storage plans from this model and discards them per function.

pub mod analysis;
pub mod builder;
pub mod types;
pub mod verify;

use serde::{Deserialize, Serialize};
use strand_diag::SourceLocation;

pub use analysis::{SuspensionMap, consumer_counts, definitions, infer_suspension};
pub use builder::FunctionBuilder;
pub use types::{ChanDir, Field, Method, NumClass, Signature, Type};
pub use verify::{verify_function, verify_program};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IrError {
    #[error("failed to decode SSA program: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("malformed function `{function}`: {reason}")]
    Malformed { function: String, reason: String },
}

// ---------------------------------------------------------------------------
// Program structure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub package: String,
    #[serde(default)]
    pub functions: Vec<Function>,
    #[serde(default)]
    pub globals: Vec<Global>,
    #[serde(default)]
    pub consts: Vec<NamedConst>,
}

impl Program {
    pub fn from_json(text: &str) -> Result<Self, IrError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn constant(&self, name: &str) -> Option<&NamedConst> {
        self.consts.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedConst {
    pub name: String,
    pub value: Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    #[serde(default)]
    pub name: String,
    pub ty: Type,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.name.is_empty() || self.name == "_"
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    /// Captured variables, read through the bindings record of a closure.
    #[serde(default)]
    pub free_vars: Vec<Param>,
    #[serde(default)]
    pub results: Vec<Type>,
    /// Empty for functions implemented outside the program.
    #[serde(default)]
    pub blocks: Vec<BasicBlock>,
    /// Block that resumes execution after a recovered panic.
    #[serde(default)]
    pub recover: Option<BlockId>,
    /// Set by the front end when known; inferred otherwise.
    #[serde(default)]
    pub may_suspend: Option<bool>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub pos: Option<SourceLocation>,
}

impl Function {
    pub fn has_body(&self) -> bool {
        !self.blocks.is_empty()
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.index())
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len() + 1).sum()
    }

    /// All instructions in declaration order with their block and position.
    pub fn instructions(&self) -> impl Iterator<Item = (BlockId, usize, &Instruction)> {
        self.blocks.iter().flat_map(|block| {
            block
                .instrs
                .iter()
                .enumerate()
                .map(move |(i, inst)| (block.index, i, inst))
        })
    }

    /// Result type as seen by a caller: void, a single type, or a tuple.
    pub fn result_type(&self) -> Type {
        match self.results.as_slice() {
            [single] => single.clone(),
            many => Type::Tuple(many.to_vec()),
        }
    }

    pub fn signature(&self) -> Signature {
        Signature {
            params: self.params.iter().map(|p| p.ty.clone()).collect(),
            results: self.results.clone(),
            variadic: false,
        }
    }

    pub fn value_type(&self, id: ValueId) -> Option<&Type> {
        self.instructions()
            .find(|(_, _, inst)| inst.dest == Some(id))
            .map(|(_, _, inst)| &inst.ty)
    }

    /// Static type of an operand in the context of this function.
    pub fn operand_type(&self, operand: &Operand, program: &Program) -> Type {
        match operand {
            Operand::Value(id) => self.value_type(*id).cloned().unwrap_or_default(),
            Operand::Param(i) => self
                .params
                .get(*i as usize)
                .map(|p| p.ty.clone())
                .unwrap_or_default(),
            Operand::FreeVar(i) => self
                .free_vars
                .get(*i as usize)
                .map(|p| p.ty.clone())
                .unwrap_or_default(),
            Operand::Global(name) => program
                .global(name)
                .map(|g| Type::pointer(g.ty.clone()))
                .unwrap_or_default(),
            Operand::Function(name) => program
                .function(name)
                .map(|f| Type::Func(f.signature()))
                .unwrap_or_else(|| Type::Func(Signature::default())),
            Operand::Const(constant) => constant.ty.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub index: BlockId,
    #[serde(default)]
    pub comment: String,
    /// Predecessors in the order phi edges refer to them.
    #[serde(default)]
    pub preds: Vec<BlockId>,
    #[serde(default)]
    pub instrs: Vec<Instruction>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn succs(&self) -> Vec<BlockId> {
        self.terminator.succs()
    }

    pub fn has_phi(&self) -> bool {
        self.instrs
            .iter()
            .any(|inst| matches!(inst.kind, InstKind::Phi { .. }))
    }
}

// ---------------------------------------------------------------------------
// Operands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Value(ValueId),
    Param(u32),
    FreeVar(u32),
    Global(String),
    Function(String),
    Const(Constant),
}

impl Operand {
    pub fn value_id(&self) -> Option<ValueId> {
        match self {
            Operand::Value(id) => Some(*id),
            _ => None,
        }
    }

    pub fn int(value: i64) -> Self {
        Operand::Const(Constant {
            ty: Type::Int,
            value: ConstValue::Int(value),
        })
    }

    pub fn bool(value: bool) -> Self {
        Operand::Const(Constant {
            ty: Type::Bool,
            value: ConstValue::Bool(value),
        })
    }

    pub fn string(value: impl Into<String>) -> Self {
        Operand::Const(Constant {
            ty: Type::String,
            value: ConstValue::String(value.into()),
        })
    }

    pub fn nil(ty: Type) -> Self {
        Operand::Const(Constant {
            ty,
            value: ConstValue::Nil,
        })
    }
}

impl From<ValueId> for Operand {
    fn from(id: ValueId) -> Self {
        Operand::Value(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub ty: Type,
    pub value: ConstValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(f64, f64),
    String(String),
    Nil,
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// `None` for instructions that produce no value.
    #[serde(default)]
    pub dest: Option<ValueId>,
    #[serde(default)]
    pub ty: Type,
    pub kind: InstKind,
    #[serde(default)]
    pub pos: Option<SourceLocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
    Complement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    AndNot,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    #[default]
    Normal,
    Go,
    Defer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    Builtin(String),
    Value(Operand),
    Invoke { recv: Operand, method: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallCommon {
    pub callee: Callee,
    #[serde(default)]
    pub args: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectState {
    pub dir: ChanDir,
    pub chan: Operand,
    #[serde(default)]
    pub send: Option<Operand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InstKind {
    UnOp {
        #[serde(rename = "operator")]
        op: UnaryOp,
        x: Operand,
    },
    BinOp {
        #[serde(rename = "operator")]
        op: BinaryOp,
        x: Operand,
        y: Operand,
    },
    Convert {
        x: Operand,
    },
    ChangeType {
        x: Operand,
    },
    FieldAddr {
        x: Operand,
        field: usize,
    },
    Field {
        x: Operand,
        field: usize,
    },
    IndexAddr {
        x: Operand,
        index: Operand,
    },
    Index {
        x: Operand,
        index: Operand,
    },
    Load {
        addr: Operand,
    },
    Store {
        addr: Operand,
        value: Operand,
    },
    Alloc {
        #[serde(default)]
        heap: bool,
    },
    Call {
        call: CallCommon,
        #[serde(default)]
        mode: CallMode,
    },
    Send {
        chan: Operand,
        value: Operand,
    },
    Recv {
        chan: Operand,
        #[serde(default)]
        comma_ok: bool,
    },
    Select {
        states: Vec<SelectState>,
        #[serde(default)]
        blocking: bool,
    },
    MakeSlice {
        len: Operand,
        cap: Operand,
    },
    MakeMap {
        #[serde(default)]
        reserve: Option<Operand>,
    },
    MakeChan {
        size: Operand,
    },
    MakeClosure {
        func: String,
        #[serde(default)]
        bindings: Vec<Operand>,
    },
    MakeInterface {
        x: Operand,
    },
    TypeAssert {
        x: Operand,
        asserted: Type,
        #[serde(default)]
        comma_ok: bool,
    },
    Slice {
        x: Operand,
        #[serde(default)]
        low: Option<Operand>,
        #[serde(default)]
        high: Option<Operand>,
    },
    Lookup {
        x: Operand,
        index: Operand,
        #[serde(default)]
        comma_ok: bool,
    },
    MapUpdate {
        map: Operand,
        key: Operand,
        value: Operand,
    },
    Extract {
        tuple: Operand,
        index: usize,
    },
    Range {
        x: Operand,
    },
    Next {
        iter: Operand,
        #[serde(default)]
        is_string: bool,
    },
    Phi {
        edges: Vec<Operand>,
    },
    RunDefers,
    #[serde(other)]
    Unknown,
}

impl InstKind {
    /// Every operand read by the instruction, in evaluation order.
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            InstKind::UnOp { x, .. }
            | InstKind::Convert { x }
            | InstKind::ChangeType { x }
            | InstKind::FieldAddr { x, .. }
            | InstKind::Field { x, .. }
            | InstKind::MakeInterface { x }
            | InstKind::TypeAssert { x, .. }
            | InstKind::Range { x } => vec![x],
            InstKind::BinOp { x, y, .. } => vec![x, y],
            InstKind::IndexAddr { x, index }
            | InstKind::Index { x, index }
            | InstKind::Lookup { x, index, .. } => vec![x, index],
            InstKind::Load { addr } => vec![addr],
            InstKind::Store { addr, value } => vec![addr, value],
            InstKind::Alloc { .. } | InstKind::RunDefers | InstKind::Unknown => Vec::new(),
            InstKind::Call { call, .. } => {
                let mut ops = Vec::with_capacity(call.args.len() + 1);
                match &call.callee {
                    Callee::Builtin(_) => {}
                    Callee::Value(op) => ops.push(op),
                    Callee::Invoke { recv, .. } => ops.push(recv),
                }
                ops.extend(call.args.iter());
                ops
            }
            InstKind::Send { chan, value } => vec![chan, value],
            InstKind::Recv { chan, .. } => vec![chan],
            InstKind::Select { states, .. } => states
                .iter()
                .flat_map(|s| std::iter::once(&s.chan).chain(s.send.iter()))
                .collect(),
            InstKind::MakeSlice { len, cap } => vec![len, cap],
            InstKind::MakeMap { reserve } => reserve.iter().collect(),
            InstKind::MakeChan { size } => vec![size],
            InstKind::MakeClosure { bindings, .. } => bindings.iter().collect(),
            InstKind::Slice { x, low, high } => std::iter::once(x)
                .chain(low.iter())
                .chain(high.iter())
                .collect(),
            InstKind::MapUpdate { map, key, value } => vec![map, key, value],
            InstKind::Extract { tuple, .. } => vec![tuple],
            InstKind::Next { iter, .. } => vec![iter],
            InstKind::Phi { edges } => edges.iter().collect(),
        }
    }

    /// Instructions that may be dropped entirely when nothing reads them.
    pub fn is_pure(&self) -> bool {
        match self {
            InstKind::UnOp { .. }
            | InstKind::BinOp { .. }
            | InstKind::Convert { .. }
            | InstKind::ChangeType { .. }
            | InstKind::FieldAddr { .. }
            | InstKind::Field { .. }
            | InstKind::IndexAddr { .. }
            | InstKind::Index { .. }
            | InstKind::Load { .. }
            | InstKind::Alloc { .. }
            | InstKind::MakeSlice { .. }
            | InstKind::MakeMap { .. }
            | InstKind::MakeChan { .. }
            | InstKind::MakeClosure { .. }
            | InstKind::MakeInterface { .. }
            | InstKind::Slice { .. }
            | InstKind::Lookup { .. }
            | InstKind::Extract { .. }
            | InstKind::Range { .. }
            | InstKind::Phi { .. } => true,
            InstKind::TypeAssert { comma_ok, .. } => *comma_ok,
            InstKind::Store { .. }
            | InstKind::Call { .. }
            | InstKind::Send { .. }
            | InstKind::Recv { .. }
            | InstKind::Select { .. }
            | InstKind::MapUpdate { .. }
            | InstKind::Next { .. }
            | InstKind::RunDefers
            | InstKind::Unknown => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InstKind::UnOp { .. } => "un_op",
            InstKind::BinOp { .. } => "bin_op",
            InstKind::Convert { .. } => "convert",
            InstKind::ChangeType { .. } => "change_type",
            InstKind::FieldAddr { .. } => "field_addr",
            InstKind::Field { .. } => "field",
            InstKind::IndexAddr { .. } => "index_addr",
            InstKind::Index { .. } => "index",
            InstKind::Load { .. } => "load",
            InstKind::Store { .. } => "store",
            InstKind::Alloc { .. } => "alloc",
            InstKind::Call { .. } => "call",
            InstKind::Send { .. } => "send",
            InstKind::Recv { .. } => "recv",
            InstKind::Select { .. } => "select",
            InstKind::MakeSlice { .. } => "make_slice",
            InstKind::MakeMap { .. } => "make_map",
            InstKind::MakeChan { .. } => "make_chan",
            InstKind::MakeClosure { .. } => "make_closure",
            InstKind::MakeInterface { .. } => "make_interface",
            InstKind::TypeAssert { .. } => "type_assert",
            InstKind::Slice { .. } => "slice",
            InstKind::Lookup { .. } => "lookup",
            InstKind::MapUpdate { .. } => "map_update",
            InstKind::Extract { .. } => "extract",
            InstKind::Range { .. } => "range",
            InstKind::Next { .. } => "next",
            InstKind::Phi { .. } => "phi",
            InstKind::RunDefers => "run_defers",
            InstKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Terminator {
    Jump {
        target: BlockId,
    },
    If {
        cond: Operand,
        then_block: BlockId,
        else_block: BlockId,
    },
    Return {
        #[serde(default)]
        results: Vec<Operand>,
    },
    Panic {
        value: Operand,
    },
}

impl Terminator {
    pub fn succs(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump { target } => vec![*target],
            Terminator::If {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Terminator::Return { .. } | Terminator::Panic { .. } => Vec::new(),
        }
    }

    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Terminator::Jump { .. } => Vec::new(),
            Terminator::If { cond, .. } => vec![cond],
            Terminator::Return { results } => results.iter().collect(),
            Terminator::Panic { value } => vec![value],
        }
    }
}
