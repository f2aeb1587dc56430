//! Lowering of value-producing instructions to [`ValueOp`]s.

use strand_ir::{InstKind, Instruction, NumClass, Type};

use crate::emit::FunctionEmitter;
use crate::layout::Addressing;
use crate::target::{AssertTarget, Conversion, Target, ValueOp};
use crate::CodegenError;

fn conversion(from: &Type, to: &Type) -> Conversion {
    let (src, dst) = (from.num_class(), to.num_class());
    match (src, dst) {
        (NumClass::Int { .. }, NumClass::String) => Conversion::RuneToString,
        (NumClass::Other, NumClass::String) if matches!(from.underlying(), Type::Slice(_)) => {
            Conversion::BytesToString
        }
        (NumClass::String, NumClass::Other) if matches!(to.underlying(), Type::Slice(_)) => {
            Conversion::StringToBytes
        }
        (
            NumClass::Int { .. } | NumClass::Float { .. } | NumClass::Complex { .. },
            NumClass::Int { .. } | NumClass::Float { .. } | NumClass::Complex { .. },
        ) => Conversion::Numeric { from: src, to: dst },
        _ => Conversion::Identity,
    }
}

impl<T: Target + ?Sized> FunctionEmitter<'_, T> {
    fn addressing_of(&mut self, elem: &Type) -> Result<Addressing, CodegenError> {
        self.layout.addressing(elem).map_err(|e| self.layout_err(e))
    }

    fn malformed(&self, inst: &Instruction, reason: &str) -> CodegenError {
        CodegenError::MalformedFunction {
            function: self.function.name.clone(),
            reason: format!("{}: {reason}", inst.kind.name()),
        }
    }

    pub(crate) fn lower_value(&mut self, inst: &Instruction) -> Result<ValueOp, CodegenError> {
        Ok(match &inst.kind {
            InstKind::UnOp { op, x } => ValueOp::Unary {
                op: *op,
                class: self.operand_type(x).num_class(),
                x: self.operand(x)?,
            },
            InstKind::BinOp { op, x, y } => ValueOp::Binary {
                op: *op,
                class: self.operand_type(x).num_class(),
                x: self.operand(x)?,
                y: self.operand(y)?,
            },
            InstKind::Convert { x } => ValueOp::Convert {
                conv: conversion(&self.operand_type(x), &inst.ty),
                x: self.operand(x)?,
            },
            InstKind::ChangeType { x } => ValueOp::Copy(self.operand(x)?),
            InstKind::FieldAddr { x, field } => {
                let ptr = self.operand_type(x);
                let Some(record) = ptr.pointee() else {
                    return Err(self.malformed(inst, "base is not a pointer"));
                };
                let offset = self
                    .layout
                    .offset_of(record, *field)
                    .map_err(|e| self.layout_err(e))?;
                ValueOp::FieldAddr {
                    base: self.operand(x)?,
                    offset,
                }
            }
            InstKind::Field { x, field } => {
                let record = self.operand_type(x);
                let offset = self
                    .layout
                    .offset_of(&record, *field)
                    .map_err(|e| self.layout_err(e))?;
                ValueOp::Field {
                    base: self.operand(x)?,
                    offset,
                    width: self.width_of(&inst.ty)?,
                    zero: self.zero_token(&inst.ty)?,
                }
            }
            InstKind::IndexAddr { x, index } => {
                let base = self.operand_type(x);
                let (elem, bound) = match base.underlying() {
                    Type::Slice(elem) => ((**elem).clone(), None),
                    Type::Pointer(inner) => match inner.underlying() {
                        Type::Array { elem, len } => ((**elem).clone(), Some(*len)),
                        _ => return Err(self.malformed(inst, "base is not indexable")),
                    },
                    _ => return Err(self.malformed(inst, "base is not indexable")),
                };
                ValueOp::IndexAddr {
                    base: self.operand(x)?,
                    index: self.operand(index)?,
                    addressing: self.addressing_of(&elem)?,
                    bound,
                }
            }
            InstKind::Index { x, index } => {
                let base = self.operand_type(x);
                let (addressing, bound) = match base.underlying() {
                    Type::Array { elem, len } => (self.addressing_of(elem)?, Some(*len)),
                    Type::Slice(elem) => (self.addressing_of(elem)?, None),
                    Type::String => (Addressing::for_stride(1), None),
                    _ => return Err(self.malformed(inst, "base is not indexable")),
                };
                ValueOp::Index {
                    base: self.operand(x)?,
                    index: self.operand(index)?,
                    addressing,
                    bound,
                    width: self.width_of(&inst.ty)?,
                    zero: self.zero_token(&inst.ty)?,
                }
            }
            InstKind::Load { addr } => ValueOp::Load {
                addr: self.operand(addr)?,
                width: self.width_of(&inst.ty)?,
                zero: self.zero_token(&inst.ty)?,
            },
            InstKind::Alloc { heap } => {
                let pointee = inst.ty.pointee().cloned().unwrap_or_default();
                ValueOp::Alloc {
                    size: self
                        .layout
                        .size_of(&pointee)
                        .map_err(|e| self.layout_err(e))?,
                    stack: if *heap { None } else { inst.dest },
                }
            }
            InstKind::MakeSlice { len, cap } => {
                let Some(elem) = inst.ty.elem().cloned() else {
                    return Err(self.malformed(inst, "result is not a slice"));
                };
                ValueOp::MakeSlice {
                    stride: self
                        .layout
                        .stride(&elem)
                        .map_err(|e| self.layout_err(e))?,
                    len: self.operand(len)?,
                    cap: self.operand(cap)?,
                }
            }
            InstKind::MakeMap { .. } => ValueOp::MakeMap,
            InstKind::MakeChan { size } => ValueOp::MakeChan {
                size: self.operand(size)?,
            },
            InstKind::MakeClosure { func, bindings } => ValueOp::MakeClosure {
                func: func.clone(),
                bindings: self.operands(bindings)?,
            },
            InstKind::MakeInterface { x } => ValueOp::MakeInterface {
                type_name: self.operand_type(x).type_name(),
                x: self.operand(x)?,
            },
            InstKind::TypeAssert {
                x,
                asserted,
                comma_ok,
            } => {
                let target = match asserted.underlying() {
                    Type::Interface { methods } => {
                        AssertTarget::Interface(methods.iter().map(|m| m.name.clone()).collect())
                    }
                    _ => AssertTarget::Concrete(asserted.type_name()),
                };
                ValueOp::TypeAssert {
                    x: self.operand(x)?,
                    target,
                    comma_ok: *comma_ok,
                    zero: self.zero_token(asserted)?,
                }
            }
            InstKind::Slice { x, low, high } => {
                let base = self.operand_type(x);
                let (stride, bound) = match base.underlying() {
                    Type::Slice(elem) => (self.addressing_of(elem)?.stride, None),
                    Type::String => (1, None),
                    Type::Pointer(inner) => match inner.underlying() {
                        Type::Array { elem, len } => (self.addressing_of(elem)?.stride, Some(*len)),
                        _ => return Err(self.malformed(inst, "base is not sliceable")),
                    },
                    _ => return Err(self.malformed(inst, "base is not sliceable")),
                };
                ValueOp::Slice {
                    x: self.operand(x)?,
                    low: low.as_ref().map(|o| self.operand(o)).transpose()?,
                    high: high.as_ref().map(|o| self.operand(o)).transpose()?,
                    stride,
                    bound,
                }
            }
            InstKind::Lookup { x, index, comma_ok } => {
                let base = self.operand_type(x);
                let elem = match base.underlying() {
                    Type::Map { value, .. } => (**value).clone(),
                    _ => Type::Uint8,
                };
                ValueOp::Lookup {
                    x: self.operand(x)?,
                    key: self.operand(index)?,
                    comma_ok: *comma_ok,
                    zero: self.zero_token(&elem)?,
                }
            }
            InstKind::Extract { tuple, index } => ValueOp::Extract {
                tuple: self.operand(tuple)?,
                index: *index,
            },
            InstKind::Range { x } => ValueOp::Range {
                x: self.operand(x)?,
            },
            InstKind::Next { iter, is_string } => ValueOp::Next {
                iter: self.operand(iter)?,
                is_string: *is_string,
            },
            other => {
                return Err(self.malformed(
                    inst,
                    &format!("`{}` does not produce a plain value", other.name()),
                ));
            }
        })
    }
}
