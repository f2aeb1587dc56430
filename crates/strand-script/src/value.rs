//! Run-time values of the script VM.
//!
//! Memory is a set of objects, each a sparse map from byte offset to the
//! scalar stored there. Pointers and slices address into an object;
//! aggregates read by value are detached snapshots of a byte range. Cells
//! that were never written read as the zero value the generated code
//! supplies with every load.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use strand_rt::{Channel, Nullable};

use crate::ScriptError;

pub type Cells = BTreeMap<u64, Value>;
pub type Obj = Rc<RefCell<Cells>>;

pub fn new_obj() -> Obj {
    Rc::new(RefCell::new(Cells::new()))
}

#[derive(Clone)]
pub struct SliceVal {
    pub obj: Obj,
    pub off: u64,
    pub len: u64,
    pub cap: u64,
    pub stride: u64,
}

impl SliceVal {
    pub fn elem_offset(&self, index: u64) -> u64 {
        self.off + index * self.stride
    }
}

#[derive(Clone, Debug)]
pub struct ClosureVal {
    pub func: String,
    pub bindings: Vec<Value>,
}

#[derive(Clone, Debug)]
pub enum IterState {
    Str { text: String, pos: usize },
    Map { entries: Vec<(Value, Value)>, pos: usize },
}

pub type MapRef = Rc<RefCell<Vec<(Value, Value)>>>;
pub type ChanRef = Rc<RefCell<Channel<Value>>>;

#[derive(Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(f64, f64),
    Str(String),
    Nil,
    Ptr { obj: Obj, off: u64 },
    /// Detached copy of an aggregate, offsets relative to its start.
    Agg(Rc<Cells>),
    Slice(SliceVal),
    Map(MapRef),
    Chan(ChanRef),
    Closure(Rc<ClosureVal>),
    /// Dynamic type name and the boxed value.
    Iface(Rc<(String, Value)>),
    Tuple(Rc<Vec<Value>>),
    Iter(Rc<RefCell<IterState>>),
}

fn type_error(expected: &'static str, found: &Value) -> ScriptError {
    ScriptError::Type {
        expected,
        found: found.kind().to_string(),
    }
}

impl Value {
    pub fn str(text: impl Into<String>) -> Self {
        Value::Str(text.into())
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    pub fn empty_agg() -> Self {
        Value::Agg(Rc::new(Cells::new()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Complex(..) => "complex",
            Value::Str(_) => "string",
            Value::Nil => "nil",
            Value::Ptr { .. } => "pointer",
            Value::Agg(_) => "aggregate",
            Value::Slice(_) => "slice",
            Value::Map(_) => "map",
            Value::Chan(_) => "chan",
            Value::Closure(_) => "func",
            Value::Iface(_) => "interface",
            Value::Tuple(_) => "tuple",
            Value::Iter(_) => "iterator",
        }
    }

    pub fn as_bool(&self) -> Result<bool, ScriptError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(type_error("bool", other)),
        }
    }

    pub fn as_int(&self) -> Result<i64, ScriptError> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(type_error("int", other)),
        }
    }

    pub fn as_float(&self) -> Result<f64, ScriptError> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            other => Err(type_error("float", other)),
        }
    }

    pub fn as_complex(&self) -> Result<(f64, f64), ScriptError> {
        match self {
            Value::Complex(re, im) => Ok((*re, *im)),
            Value::Float(f) => Ok((*f, 0.0)),
            other => Err(type_error("complex", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str, ScriptError> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(type_error("string", other)),
        }
    }

    pub fn as_tuple(&self) -> Result<&[Value], ScriptError> {
        match self {
            Value::Tuple(items) => Ok(items),
            other => Err(type_error("tuple", other)),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// `==` as the source language defines it for comparable values.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Complex(ar, ai), Value::Complex(br, bi)) => ar == br && ai == bi,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::Ptr { obj: a, off: x }, Value::Ptr { obj: b, off: y }) => {
                Rc::ptr_eq(a, b) && x == y
            }
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Chan(a), Value::Chan(b)) => Rc::ptr_eq(a, b),
            (Value::Iface(a), Value::Iface(b)) => a.0 == b.0 && a.1.same(&b.1),
            (Value::Agg(a), Value::Agg(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same(vb))
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same(y))
            }
            _ => false,
        }
    }
}

impl Nullable for Value {
    fn is_nil(&self) -> bool {
        Value::is_nil(self)
    }
}

/// Float formatting used by `print`: sign, six fraction digits, three
/// exponent digits.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "+Inf" } else { "-Inf" }.to_string();
    }
    let text = format!("{:.6e}", value.abs());
    let (mantissa, exp) = text.split_once('e').unwrap_or((text.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let sign = if value.is_sign_negative() { '-' } else { '+' };
    let exp_sign = if exp < 0 { '-' } else { '+' };
    format!("{sign}{mantissa}e{exp_sign}{:03}", exp.abs())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::Complex(re, im) => write!(f, "({}{}i)", format_float(*re), format_float(*im)),
            Value::Str(s) => f.write_str(s),
            Value::Nil => f.write_str("nil"),
            Value::Ptr { off, .. } => write!(f, "&obj+{off}"),
            Value::Agg(cells) => {
                f.write_str("{")?;
                for (i, value) in cells.values().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("}")
            }
            Value::Slice(s) => write!(f, "[{}/{}]", s.len, s.cap),
            Value::Map(m) => write!(f, "map[{}]", m.borrow().len()),
            Value::Chan(_) => f.write_str("chan"),
            Value::Closure(c) => write!(f, "func {}", c.func),
            Value::Iface(boxed) => write!(f, "{}", boxed.1),
            Value::Tuple(items) => {
                f.write_str("(")?;
                for (i, value) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str(")")
            }
            Value::Iter(_) => f.write_str("iter"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Iface(boxed) => write!(f, "{}({:?})", boxed.0, boxed.1),
            other => write!(f, "{other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Memory helpers
// ---------------------------------------------------------------------------

/// Cells of `obj` in `[off, off + width)`, rebased to zero.
pub fn snapshot(obj: &Obj, off: u64, width: u64) -> Value {
    let cells = obj.borrow();
    let copy: Cells = cells
        .range(off..off + width)
        .map(|(k, v)| (k - off, v.clone()))
        .collect();
    Value::Agg(Rc::new(copy))
}

/// Replace `[off, off + width)` of `obj` with the cells of `value`.
pub fn write_range(obj: &Obj, off: u64, width: u64, value: &Value) {
    let mut cells = obj.borrow_mut();
    let stale: Vec<u64> = cells.range(off..off + width).map(|(k, _)| *k).collect();
    for key in stale {
        cells.remove(&key);
    }
    if let Value::Agg(src) = value {
        for (k, v) in src.iter().filter(|(k, _)| **k < width) {
            cells.insert(off + k, v.clone());
        }
    }
}

/// Copy `width` bytes of cells between objects (which may be the same).
pub fn copy_cells(src: &Obj, src_off: u64, dst: &Obj, dst_off: u64, width: u64) {
    let chunk = snapshot(src, src_off, width);
    write_range(dst, dst_off, width, &chunk);
}

/// A detached sub-range of an aggregate snapshot.
pub fn sub_agg(cells: &Cells, off: u64, width: u64) -> Value {
    let copy: Cells = cells
        .range(off..off + width)
        .map(|(k, v)| (k - off, v.clone()))
        .collect();
    Value::Agg(Rc::new(copy))
}
