//! Builtin functions the script target maps (see [`crate::target::BUILTINS`]).

use std::fmt::Write as _;
use std::rc::Rc;

use strand_rt::{RuntimeError, nil_check};

use crate::ScriptError;
use crate::value::{SliceVal, Value, copy_cells, new_obj};

fn arg(args: &[Value], index: usize, name: &str) -> Result<Value, ScriptError> {
    args.get(index)
        .cloned()
        .ok_or_else(|| ScriptError::Operand(format!("`{name}` needs argument {index}")))
}

fn len(value: &Value) -> Result<i64, ScriptError> {
    Ok(match value {
        Value::Str(s) => s.len() as i64,
        Value::Slice(s) => s.len as i64,
        Value::Map(m) => m.borrow().len() as i64,
        Value::Chan(c) => c.borrow().len() as i64,
        Value::Nil => 0,
        other => {
            return Err(ScriptError::Type {
                expected: "value with a length",
                found: other.kind().to_string(),
            });
        }
    })
}

fn cap(value: &Value) -> Result<i64, ScriptError> {
    Ok(match value {
        Value::Slice(s) => s.cap as i64,
        Value::Chan(c) => c.borrow().cap() as i64,
        Value::Nil => 0,
        other => {
            return Err(ScriptError::Type {
                expected: "slice or channel",
                found: other.kind().to_string(),
            });
        }
    })
}

/// `append(dst, src...)`; `src` is a slice, or a string when appending bytes.
fn append(dst: &Value, src: &Value, stride: u64) -> Result<Value, ScriptError> {
    let source = match src {
        Value::Str(text) => crate::ops::bytes_slice(text.as_bytes()),
        other => other.clone(),
    };
    let extra = match &source {
        Value::Slice(s) => s.len,
        Value::Nil => 0,
        other => {
            return Err(ScriptError::Type {
                expected: "slice",
                found: other.kind().to_string(),
            });
        }
    };
    if extra == 0 {
        return Ok(dst.clone());
    }
    let base = match dst {
        Value::Slice(s) => s.clone(),
        Value::Nil => SliceVal {
            obj: new_obj(),
            off: 0,
            len: 0,
            cap: 0,
            stride,
        },
        other => {
            return Err(ScriptError::Type {
                expected: "slice",
                found: other.kind().to_string(),
            });
        }
    };
    let new_len = base.len + extra;
    let target = if new_len <= base.cap {
        SliceVal {
            len: new_len,
            ..base.clone()
        }
    } else {
        let grown = SliceVal {
            obj: new_obj(),
            off: 0,
            len: new_len,
            cap: new_len.max(base.cap * 2),
            stride: base.stride,
        };
        copy_cells(&base.obj, base.off, &grown.obj, 0, base.len * base.stride);
        grown
    };
    if let Value::Slice(src) = &source {
        copy_cells(
            &src.obj,
            src.off,
            &target.obj,
            target.elem_offset(base.len),
            extra * src.stride,
        );
    }
    Ok(Value::Slice(target))
}

/// `copy(dst, src)`: number of elements copied.
fn copy(dst: &Value, src: &Value) -> Result<Value, ScriptError> {
    let source = match src {
        Value::Str(text) => crate::ops::bytes_slice(text.as_bytes()),
        other => other.clone(),
    };
    let (Value::Slice(d), Value::Slice(s)) = (dst, &source) else {
        return Ok(Value::Int(0));
    };
    let n = d.len.min(s.len);
    copy_cells(&s.obj, s.off, &d.obj, d.off, n * d.stride);
    Ok(Value::Int(n as i64))
}

fn print(out: &mut String, args: &[Value], newline: bool) {
    for (i, value) in args.iter().enumerate() {
        if newline && i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{value}");
    }
    if newline {
        out.push('\n');
    }
}

/// Run builtin `name`; `out` collects `print` output.
pub fn call_builtin(
    out: &mut String,
    name: &str,
    stride: Option<u64>,
    args: &[Value],
) -> Result<Value, ScriptError> {
    Ok(match name {
        "len" => Value::Int(len(&arg(args, 0, name)?)?),
        "cap" => Value::Int(cap(&arg(args, 0, name)?)?),
        "append" => append(&arg(args, 0, name)?, &arg(args, 1, name)?, stride.unwrap_or(1))?,
        "copy" => copy(&arg(args, 0, name)?, &arg(args, 1, name)?)?,
        "close" => match nil_check(arg(args, 0, name)?).map_err(ScriptError::fault)? {
            Value::Chan(chan) => {
                chan.borrow_mut().close().map_err(ScriptError::fault)?;
                Value::Nil
            }
            other => {
                return Err(ScriptError::Type {
                    expected: "chan",
                    found: other.kind().to_string(),
                });
            }
        },
        "delete" => {
            if let Value::Map(map) = arg(args, 0, name)? {
                let key = arg(args, 1, name)?;
                map.borrow_mut().retain(|(k, _)| !k.same(&key));
            }
            Value::Nil
        }
        "print" => {
            print(out, args, false);
            Value::Nil
        }
        "println" => {
            print(out, args, true);
            Value::Nil
        }
        "real" => Value::Float(arg(args, 0, name)?.as_complex()?.0),
        "imag" => Value::Float(arg(args, 0, name)?.as_complex()?.1),
        "complex" => Value::Complex(arg(args, 0, name)?.as_float()?, arg(args, 1, name)?.as_float()?),
        "ssa:wrapnilchk" => nil_check(arg(args, 0, name)?).map_err(ScriptError::fault)?,
        other => return Err(ScriptError::Placeholder(format!("builtin {other}"))),
    })
}

/// Channel value for a `make(chan T, size)`.
pub fn make_chan(size: &Value) -> Result<Value, ScriptError> {
    let size = size.as_int()?;
    if size < 0 {
        return Err(ScriptError::fault(RuntimeError::IndexOutOfRange { index: size, len: 0 }));
    }
    Ok(Value::Chan(Rc::new(std::cell::RefCell::new(
        strand_rt::Channel::new(size as usize),
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{bytes_slice, slice_bytes};

    #[test]
    fn append_grows_and_keeps_the_prefix() {
        let mut out = String::new();
        let base = bytes_slice(b"ab");
        let grown = call_builtin(&mut out, "append", Some(1), &[base.clone(), Value::str("cd")]).unwrap();
        assert_eq!(slice_bytes(&grown).unwrap(), b"abcd");
        assert_eq!(cap(&grown).unwrap(), 4);
        // The original backing array is untouched once append reallocates.
        assert_eq!(slice_bytes(&base).unwrap(), b"ab");
    }

    #[test]
    fn append_to_nil_allocates() {
        let mut out = String::new();
        let v = call_builtin(&mut out, "append", Some(1), &[Value::Nil, bytes_slice(b"z")]).unwrap();
        assert_eq!(len(&v).unwrap(), 1);
        let same = call_builtin(&mut out, "append", Some(1), &[Value::Nil, Value::Nil]).unwrap();
        assert!(same.is_nil());
    }

    #[test]
    fn println_separates_with_spaces() {
        let mut out = String::new();
        call_builtin(&mut out, "println", None, &[Value::str("x"), Value::Int(3), Value::Bool(true)])
            .unwrap();
        call_builtin(&mut out, "print", None, &[Value::str("a"), Value::str("b")]).unwrap();
        assert_eq!(out, "x 3 true\nab");
    }

    #[test]
    fn closing_twice_is_a_fault() {
        let mut out = String::new();
        let chan = make_chan(&Value::Int(0)).unwrap();
        call_builtin(&mut out, "close", None, &[chan.clone()]).unwrap();
        let err = call_builtin(&mut out, "close", None, &[chan]).unwrap_err();
        assert!(matches!(err, ScriptError::Fault(RuntimeError::CloseOfClosed)));
    }
}
