//! Arithmetic, conversions and memory addressing on [`Value`]s.
//!
//! Integers are kept as `i64` bit patterns and re-wrapped to the width of
//! their class after every operation; unsigned 64-bit values reuse the
//! same pattern and are reinterpreted where the sign matters.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use strand_codegen::Conversion;
use strand_ir::{BinaryOp, NumClass, UnaryOp};
use strand_rt::{RuntimeError, nil_check, range_check};

use crate::ScriptError;
use crate::value::{Cells, IterState, SliceVal, Value, new_obj, snapshot, sub_agg, write_range};

/// Truncate `value` to `bits`, sign- or zero-extending back to 64 bits.
pub fn wrap(value: i64, bits: u32, signed: bool) -> i64 {
    if bits >= 64 {
        return value;
    }
    let shift = 64 - bits;
    if signed {
        (value << shift) >> shift
    } else {
        (((value as u64) << shift) >> shift) as i64
    }
}

fn round_float(value: f64, bits: u32) -> f64 {
    if bits == 32 { value as f32 as f64 } else { value }
}

fn round_complex(re: f64, im: f64, bits: u32) -> Value {
    let half = if bits == 64 { 32 } else { 64 };
    Value::Complex(round_float(re, half), round_float(im, half))
}

fn unsupported(what: impl Into<String>) -> ScriptError {
    ScriptError::Unsupported(what.into())
}

fn compare(op: BinaryOp, ordering: Option<Ordering>) -> Result<Value, ScriptError> {
    let result = match (op, ordering) {
        (BinaryOp::Eq, Some(o)) => o == Ordering::Equal,
        (BinaryOp::Ne, Some(o)) => o != Ordering::Equal,
        (BinaryOp::Lt, Some(o)) => o == Ordering::Less,
        (BinaryOp::Le, Some(o)) => o != Ordering::Greater,
        (BinaryOp::Gt, Some(o)) => o == Ordering::Greater,
        (BinaryOp::Ge, Some(o)) => o != Ordering::Less,
        // NaN compares unequal to everything.
        (BinaryOp::Ne, None) => true,
        (op, None) if op.is_comparison() => false,
        (op, _) => return Err(unsupported(format!("{op:?} as a comparison"))),
    };
    Ok(Value::Bool(result))
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

pub fn unary(op: UnaryOp, class: NumClass, x: &Value) -> Result<Value, ScriptError> {
    Ok(match (op, class) {
        (UnaryOp::Not, _) => Value::Bool(!x.as_bool()?),
        (UnaryOp::Neg, NumClass::Int { bits, signed }) => {
            Value::Int(wrap(x.as_int()?.wrapping_neg(), bits, signed))
        }
        (UnaryOp::Neg, NumClass::Float { bits }) => Value::Float(round_float(-x.as_float()?, bits)),
        (UnaryOp::Neg, NumClass::Complex { .. }) => {
            let (re, im) = x.as_complex()?;
            Value::Complex(-re, -im)
        }
        (UnaryOp::Complement, NumClass::Int { bits, signed }) => {
            Value::Int(wrap(!x.as_int()?, bits, signed))
        }
        (op, class) => return Err(unsupported(format!("{op:?} on {class:?}"))),
    })
}

fn int_binary(op: BinaryOp, bits: u32, signed: bool, a: i64, b: i64) -> Result<Value, ScriptError> {
    let int = |v: i64| Ok(Value::Int(wrap(v, bits, signed)));
    let shift = match op {
        BinaryOp::Shl | BinaryOp::Shr => {
            u64::try_from(b).map_err(|_| ScriptError::fault(RuntimeError::NegativeShift))?
        }
        _ => 0,
    };
    match op {
        BinaryOp::Add => int(a.wrapping_add(b)),
        BinaryOp::Sub => int(a.wrapping_sub(b)),
        BinaryOp::Mul => int(a.wrapping_mul(b)),
        BinaryOp::Div | BinaryOp::Rem if b == 0 => {
            Err(ScriptError::fault(RuntimeError::DivideByZero))
        }
        BinaryOp::Div if signed => int(a.wrapping_div(b)),
        BinaryOp::Div => int(((a as u64) / (b as u64)) as i64),
        BinaryOp::Rem if signed => int(a.wrapping_rem(b)),
        BinaryOp::Rem => int(((a as u64) % (b as u64)) as i64),
        BinaryOp::And => int(a & b),
        BinaryOp::Or => int(a | b),
        BinaryOp::Xor => int(a ^ b),
        BinaryOp::AndNot => int(a & !b),
        BinaryOp::Shl if shift >= 64 => int(0),
        BinaryOp::Shl => int(a << shift),
        BinaryOp::Shr if signed => int(if shift >= 64 { a >> 63 } else { a >> shift }),
        BinaryOp::Shr if shift >= 64 => int(0),
        BinaryOp::Shr => int(((a as u64) >> shift) as i64),
        op if signed => compare(op, Some(a.cmp(&b))),
        op => compare(op, Some((a as u64).cmp(&(b as u64)))),
    }
}

fn complex_binary(op: BinaryOp, bits: u32, x: (f64, f64), y: (f64, f64)) -> Result<Value, ScriptError> {
    let ((a, b), (c, d)) = (x, y);
    Ok(match op {
        BinaryOp::Add => round_complex(a + c, b + d, bits),
        BinaryOp::Sub => round_complex(a - c, b - d, bits),
        BinaryOp::Mul => round_complex(a * c - b * d, a * d + b * c, bits),
        BinaryOp::Div => {
            let denom = c * c + d * d;
            round_complex((a * c + b * d) / denom, (b * c - a * d) / denom, bits)
        }
        BinaryOp::Eq => Value::Bool(a == c && b == d),
        BinaryOp::Ne => Value::Bool(a != c || b != d),
        op => return Err(unsupported(format!("{op:?} on complex numbers"))),
    })
}

pub fn binary(op: BinaryOp, class: NumClass, x: &Value, y: &Value) -> Result<Value, ScriptError> {
    match class {
        NumClass::Int { bits, signed } => int_binary(op, bits, signed, x.as_int()?, y.as_int()?),
        NumClass::Float { bits } => {
            let (a, b) = (x.as_float()?, y.as_float()?);
            let float = |v: f64| Ok(Value::Float(round_float(v, bits)));
            match op {
                BinaryOp::Add => float(a + b),
                BinaryOp::Sub => float(a - b),
                BinaryOp::Mul => float(a * b),
                BinaryOp::Div => float(a / b),
                op => compare(op, a.partial_cmp(&b)),
            }
        }
        NumClass::Complex { bits } => complex_binary(op, bits, x.as_complex()?, y.as_complex()?),
        NumClass::String => match op {
            BinaryOp::Add => Ok(Value::str(format!("{}{}", x.as_str()?, y.as_str()?))),
            op => compare(op, Some(x.as_str()?.cmp(y.as_str()?))),
        },
        NumClass::Bool | NumClass::Other => match op {
            BinaryOp::Eq => Ok(Value::Bool(x.same(y))),
            BinaryOp::Ne => Ok(Value::Bool(!x.same(y))),
            op => Err(unsupported(format!("{op:?} on {} values", x.kind()))),
        },
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn numeric(from: NumClass, to: NumClass, x: &Value) -> Result<Value, ScriptError> {
    Ok(match (from, to) {
        (NumClass::Int { .. }, NumClass::Int { bits, signed }) => {
            Value::Int(wrap(x.as_int()?, bits, signed))
        }
        (NumClass::Int { signed, .. }, NumClass::Float { bits }) => {
            let v = x.as_int()?;
            let f = if signed { v as f64 } else { v as u64 as f64 };
            Value::Float(round_float(f, bits))
        }
        (NumClass::Float { .. }, NumClass::Int { bits, signed }) => {
            let f = x.as_float()?;
            let v = if signed { f as i64 } else { f as u64 as i64 };
            Value::Int(wrap(v, bits, signed))
        }
        (NumClass::Float { .. }, NumClass::Float { bits }) => {
            Value::Float(round_float(x.as_float()?, bits))
        }
        (NumClass::Int { .. } | NumClass::Float { .. }, NumClass::Complex { bits }) => {
            round_complex(x.as_float()?, 0.0, bits)
        }
        (NumClass::Complex { .. }, NumClass::Complex { bits }) => {
            let (re, im) = x.as_complex()?;
            round_complex(re, im, bits)
        }
        (from, to) => return Err(unsupported(format!("conversion {from:?} -> {to:?}"))),
    })
}

/// Bytes of a `[]byte` value.
pub fn slice_bytes(x: &Value) -> Result<Vec<u8>, ScriptError> {
    let slice = match x {
        Value::Nil => return Ok(Vec::new()),
        Value::Slice(s) => s,
        other => {
            return Err(ScriptError::Type {
                expected: "byte slice",
                found: other.kind().to_string(),
            });
        }
    };
    let cells = slice.obj.borrow();
    (0..slice.len)
        .map(|i| match cells.get(&slice.elem_offset(i)) {
            Some(v) => v.as_int().map(|b| b as u8),
            None => Ok(0),
        })
        .collect()
}

/// A fresh `[]byte` holding `bytes`.
pub fn bytes_slice(bytes: &[u8]) -> Value {
    let obj = new_obj();
    {
        let mut cells = obj.borrow_mut();
        for (i, b) in bytes.iter().enumerate() {
            cells.insert(i as u64, Value::Int(i64::from(*b)));
        }
    }
    let len = bytes.len() as u64;
    Value::Slice(SliceVal {
        obj,
        off: 0,
        len,
        cap: len,
        stride: 1,
    })
}

pub fn convert(conv: Conversion, x: &Value) -> Result<Value, ScriptError> {
    Ok(match conv {
        Conversion::Numeric { from, to } => numeric(from, to, x)?,
        Conversion::RuneToString => {
            let code = u32::try_from(x.as_int()?).ok();
            let c = code.and_then(char::from_u32).unwrap_or('\u{FFFD}');
            Value::str(c.to_string())
        }
        Conversion::BytesToString => {
            Value::str(String::from_utf8_lossy(&slice_bytes(x)?).into_owned())
        }
        Conversion::StringToBytes => bytes_slice(x.as_str()?.as_bytes()),
        Conversion::Identity => x.clone(),
    })
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

fn to_index(value: &Value) -> Result<i64, ScriptError> {
    value.as_int()
}

fn fault(error: RuntimeError) -> ScriptError {
    ScriptError::fault(error)
}

fn cell_or_zero(cells: &Cells, off: u64, width: Option<u64>, zero: &Value) -> Value {
    match width {
        Some(width) => sub_agg(cells, off, width),
        None => cells.get(&off).cloned().unwrap_or_else(|| zero.clone()),
    }
}

pub fn field_addr(base: &Value, offset: u64) -> Result<Value, ScriptError> {
    match nil_check(base.clone()).map_err(fault)? {
        Value::Ptr { obj, off } => Ok(Value::Ptr {
            obj,
            off: off + offset,
        }),
        other => Err(ScriptError::Type {
            expected: "pointer",
            found: other.kind().to_string(),
        }),
    }
}

pub fn field(base: &Value, offset: u64, width: Option<u64>, zero: &Value) -> Result<Value, ScriptError> {
    match base {
        Value::Agg(cells) => Ok(cell_or_zero(cells, offset, width, zero)),
        other => Err(ScriptError::Type {
            expected: "aggregate",
            found: other.kind().to_string(),
        }),
    }
}

pub fn index_addr(base: &Value, index: &Value, stride: u64, bound: Option<u64>) -> Result<Value, ScriptError> {
    let i = to_index(index)?;
    match (base, bound) {
        (Value::Nil, _) => {
            let len = bound.map_or(0, |b| b as i64);
            range_check(i, len).map_err(fault)?;
            Err(fault(RuntimeError::NilDereference))
        }
        (Value::Slice(s), _) => {
            range_check(i, s.len as i64).map_err(fault)?;
            Ok(Value::Ptr {
                obj: Rc::clone(&s.obj),
                off: s.elem_offset(i as u64),
            })
        }
        (Value::Ptr { obj, off }, Some(len)) => {
            range_check(i, len as i64).map_err(fault)?;
            Ok(Value::Ptr {
                obj: Rc::clone(obj),
                off: off + i as u64 * stride,
            })
        }
        (other, _) => Err(ScriptError::Type {
            expected: "slice or array pointer",
            found: other.kind().to_string(),
        }),
    }
}

pub fn index(
    base: &Value,
    index: &Value,
    stride: u64,
    bound: Option<u64>,
    width: Option<u64>,
    zero: &Value,
) -> Result<Value, ScriptError> {
    let i = to_index(index)?;
    match base {
        Value::Str(text) => {
            range_check(i, text.len() as i64).map_err(fault)?;
            Ok(Value::Int(i64::from(text.as_bytes()[i as usize])))
        }
        Value::Agg(cells) => {
            range_check(i, bound.map_or(0, |b| b as i64)).map_err(fault)?;
            Ok(cell_or_zero(cells, i as u64 * stride, width, zero))
        }
        Value::Slice(s) => {
            range_check(i, s.len as i64).map_err(fault)?;
            let cells = s.obj.borrow();
            Ok(cell_or_zero(&cells, s.elem_offset(i as u64), width, zero))
        }
        Value::Nil => {
            range_check(i, 0).map_err(fault)?;
            Ok(zero.clone())
        }
        other => Err(ScriptError::Type {
            expected: "indexable value",
            found: other.kind().to_string(),
        }),
    }
}

pub fn load(addr: &Value, width: Option<u64>, zero: &Value) -> Result<Value, ScriptError> {
    match nil_check(addr.clone()).map_err(fault)? {
        Value::Ptr { obj, off } => Ok(match width {
            Some(width) => snapshot(&obj, off, width),
            None => obj.borrow().get(&off).cloned().unwrap_or_else(|| zero.clone()),
        }),
        other => Err(ScriptError::Type {
            expected: "pointer",
            found: other.kind().to_string(),
        }),
    }
}

pub fn store(addr: &Value, value: &Value, width: Option<u64>) -> Result<(), ScriptError> {
    match nil_check(addr.clone()).map_err(fault)? {
        Value::Ptr { obj, off } => {
            match width {
                Some(width) => write_range(&obj, off, width, value),
                None => {
                    obj.borrow_mut().insert(off, value.clone());
                }
            }
            Ok(())
        }
        other => Err(ScriptError::Type {
            expected: "pointer",
            found: other.kind().to_string(),
        }),
    }
}

fn bounds(low: i64, high: i64, cap: i64) -> Result<(), ScriptError> {
    if low < 0 || high < low || high > cap {
        return Err(fault(RuntimeError::IndexOutOfRange {
            index: if high > cap { high } else { low },
            len: cap,
        }));
    }
    Ok(())
}

pub fn slice(
    x: &Value,
    low: Option<&Value>,
    high: Option<&Value>,
    stride: u64,
    bound: Option<u64>,
) -> Result<Value, ScriptError> {
    let low = low.map(to_index).transpose()?.unwrap_or(0);
    let high = high.map(to_index).transpose()?;
    match x {
        Value::Str(text) => {
            let high = high.unwrap_or(text.len() as i64);
            bounds(low, high, text.len() as i64)?;
            let bytes = &text.as_bytes()[low as usize..high as usize];
            Ok(Value::str(String::from_utf8_lossy(bytes).into_owned()))
        }
        Value::Slice(s) => {
            let high = high.unwrap_or(s.len as i64);
            bounds(low, high, s.cap as i64)?;
            Ok(Value::Slice(SliceVal {
                obj: Rc::clone(&s.obj),
                off: s.elem_offset(low as u64),
                len: (high - low) as u64,
                cap: s.cap - low as u64,
                stride: s.stride,
            }))
        }
        Value::Ptr { obj, off } => {
            let cap = bound.ok_or_else(|| unsupported("slicing a pointer to a non-array"))? as i64;
            let high = high.unwrap_or(cap);
            bounds(low, high, cap)?;
            Ok(Value::Slice(SliceVal {
                obj: Rc::clone(obj),
                off: off + low as u64 * stride,
                len: (high - low) as u64,
                cap: (cap - low) as u64,
                stride,
            }))
        }
        Value::Nil if bound.is_some() => Err(fault(RuntimeError::NilDereference)),
        Value::Nil => {
            bounds(low, high.unwrap_or(0), 0)?;
            Ok(Value::Nil)
        }
        other => Err(ScriptError::Type {
            expected: "sliceable value",
            found: other.kind().to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Maps, strings and iteration
// ---------------------------------------------------------------------------

pub fn lookup(x: &Value, key: &Value, comma_ok: bool, zero: &Value) -> Result<Value, ScriptError> {
    let found = match x {
        Value::Map(map) => map
            .borrow()
            .iter()
            .find(|(k, _)| k.same(key))
            .map(|(_, v)| v.clone()),
        Value::Nil => None,
        Value::Str(text) => {
            let i = to_index(key)?;
            range_check(i, text.len() as i64).map_err(fault)?;
            Some(Value::Int(i64::from(text.as_bytes()[i as usize])))
        }
        other => {
            return Err(ScriptError::Type {
                expected: "map",
                found: other.kind().to_string(),
            });
        }
    };
    Ok(match (comma_ok, found) {
        (true, Some(v)) => Value::tuple(vec![v, Value::Bool(true)]),
        (true, None) => Value::tuple(vec![zero.clone(), Value::Bool(false)]),
        (false, found) => found.unwrap_or_else(|| zero.clone()),
    })
}

pub fn map_update(map: &Value, key: &Value, value: &Value) -> Result<(), ScriptError> {
    let Value::Map(map) = nil_check(map.clone()).map_err(fault)? else {
        return Err(ScriptError::Type {
            expected: "map",
            found: map.kind().to_string(),
        });
    };
    let mut entries = map.borrow_mut();
    match entries.iter_mut().find(|(k, _)| k.same(key)) {
        Some(entry) => entry.1 = value.clone(),
        None => entries.push((key.clone(), value.clone())),
    }
    Ok(())
}

pub fn range(x: &Value) -> Result<Value, ScriptError> {
    let state = match x {
        Value::Str(text) => IterState::Str {
            text: text.clone(),
            pos: 0,
        },
        Value::Map(map) => IterState::Map {
            entries: map.borrow().clone(),
            pos: 0,
        },
        Value::Nil => IterState::Map {
            entries: Vec::new(),
            pos: 0,
        },
        other => {
            return Err(ScriptError::Type {
                expected: "string or map",
                found: other.kind().to_string(),
            });
        }
    };
    Ok(Value::Iter(Rc::new(RefCell::new(state))))
}

/// `(ok, key, value)`; strings yield byte offset and rune.
pub fn next(iter: &Value, is_string: bool) -> Result<Value, ScriptError> {
    let Value::Iter(state) = iter else {
        return Err(ScriptError::Type {
            expected: "iterator",
            found: iter.kind().to_string(),
        });
    };
    let mut state = state.borrow_mut();
    let done = |key: Value, value: Value| Value::tuple(vec![Value::Bool(false), key, value]);
    Ok(match &mut *state {
        IterState::Str { text, pos } => match text[*pos..].chars().next() {
            Some(c) => {
                let at = *pos as i64;
                *pos += c.len_utf8();
                Value::tuple(vec![Value::Bool(true), Value::Int(at), Value::Int(i64::from(u32::from(c)))])
            }
            None => done(Value::Int(0), Value::Int(0)),
        },
        IterState::Map { entries, pos } => match entries.get(*pos) {
            Some((k, v)) if !is_string => {
                *pos += 1;
                Value::tuple(vec![Value::Bool(true), k.clone(), v.clone()])
            }
            _ => done(Value::Nil, Value::Nil),
        },
    })
}

pub fn extract(tuple: &Value, index: usize) -> Result<Value, ScriptError> {
    tuple
        .as_tuple()?
        .get(index)
        .cloned()
        .ok_or_else(|| ScriptError::Operand(format!("tuple has no element {index}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const U8: NumClass = NumClass::Int {
        bits: 8,
        signed: false,
    };
    const I32: NumClass = NumClass::Int {
        bits: 32,
        signed: true,
    };
    const U64: NumClass = NumClass::Int {
        bits: 64,
        signed: false,
    };

    fn int(v: &Value) -> i64 {
        v.as_int().unwrap()
    }

    #[test]
    fn integer_results_wrap_to_their_width() {
        let v = binary(BinaryOp::Add, U8, &Value::Int(250), &Value::Int(10)).unwrap();
        assert_eq!(int(&v), 4);
        let v = binary(BinaryOp::Mul, I32, &Value::Int(i64::from(i32::MAX)), &Value::Int(2)).unwrap();
        assert_eq!(int(&v), -2);
        let v = unary(UnaryOp::Complement, U8, &Value::Int(0)).unwrap();
        assert_eq!(int(&v), 255);
    }

    #[test]
    fn unsigned_compare_and_divide_use_the_bit_pattern() {
        let max = Value::Int(-1);
        let v = binary(BinaryOp::Gt, U64, &max, &Value::Int(1)).unwrap();
        assert!(v.as_bool().unwrap());
        let v = binary(BinaryOp::Div, U64, &max, &Value::Int(2)).unwrap();
        assert_eq!(int(&v) as u64, u64::MAX / 2);
        let v = binary(BinaryOp::Shr, I32, &Value::Int(-8), &Value::Int(100)).unwrap();
        assert_eq!(int(&v), -1);
    }

    #[test]
    fn division_by_zero_is_a_fault() {
        let err = binary(BinaryOp::Rem, I32, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert!(matches!(err, ScriptError::Fault(RuntimeError::DivideByZero)));
    }

    #[test]
    fn negative_shift_counts_are_a_fault() {
        for op in [BinaryOp::Shl, BinaryOp::Shr] {
            let err = binary(op, I32, &Value::Int(1), &Value::Int(-1)).unwrap_err();
            assert!(matches!(err, ScriptError::Fault(RuntimeError::NegativeShift)));
        }
        let v = binary(BinaryOp::Shl, I32, &Value::Int(1), &Value::Int(64)).unwrap();
        assert_eq!(int(&v), 0);
    }

    #[test]
    fn string_conversions() {
        let v = convert(Conversion::RuneToString, &Value::Int(0x263A)).unwrap();
        assert_eq!(v.as_str().unwrap(), "\u{263A}");
        let bytes = convert(Conversion::StringToBytes, &Value::str("hi")).unwrap();
        let back = convert(Conversion::BytesToString, &bytes).unwrap();
        assert_eq!(back.as_str().unwrap(), "hi");
        let v = convert(
            Conversion::Numeric {
                from: NumClass::Float { bits: 64 },
                to: U8,
            },
            &Value::Float(300.7),
        )
        .unwrap();
        assert_eq!(int(&v), 44);
    }

    #[test]
    fn slices_share_their_backing_object() {
        let base = bytes_slice(b"abcdef");
        let sub = slice(&base, Some(&Value::Int(2)), Some(&Value::Int(4)), 1, None).unwrap();
        let Value::Slice(s) = &sub else {
            panic!("expected slice");
        };
        assert_eq!((s.len, s.cap), (2, 4));
        let addr = index_addr(&sub, &Value::Int(1), 1, None).unwrap();
        store(&addr, &Value::Int(i64::from(b'X')), None).unwrap();
        let text = convert(Conversion::BytesToString, &base).unwrap();
        assert_eq!(text.as_str().unwrap(), "abcXef");
        let err = index(&sub, &Value::Int(2), 1, None, None, &Value::Int(0)).unwrap_err();
        assert!(matches!(
            err,
            ScriptError::Fault(RuntimeError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn nil_pointer_loads_fault() {
        let err = load(&Value::Nil, None, &Value::Int(0)).unwrap_err();
        assert!(matches!(err, ScriptError::Fault(RuntimeError::NilDereference)));
    }

    #[test]
    fn string_iteration_yields_byte_offsets_and_runes() {
        let iter = range(&Value::str("aé")).unwrap();
        let first = next(&iter, true).unwrap();
        assert_eq!(format!("{first:?}"), "(true, 0, 97)");
        let second = next(&iter, true).unwrap();
        assert_eq!(format!("{second:?}"), "(true, 1, 233)");
        let end = next(&iter, true).unwrap();
        assert!(!end.as_tuple().unwrap()[0].as_bool().unwrap());
    }

    #[test]
    fn map_updates_replace_existing_keys() {
        let map = Value::Map(Rc::new(RefCell::new(Vec::new())));
        map_update(&map, &Value::str("k"), &Value::Int(1)).unwrap();
        map_update(&map, &Value::str("k"), &Value::Int(2)).unwrap();
        let found = lookup(&map, &Value::str("k"), true, &Value::Int(0)).unwrap();
        assert_eq!(format!("{found:?}"), "(2, true)");
        let missing = lookup(&map, &Value::str("z"), false, &Value::Int(0)).unwrap();
        assert_eq!(int(&missing), 0);
    }
}
