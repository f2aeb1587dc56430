//! Byte layout of aggregates for a given word size and maximum alignment.
//!
//! Sizes follow the usual "standard sizes" model: scalars are their natural
//! width, alignment is the natural alignment capped at `max_align`, strings
//! and interfaces are two words, slices three. Unlike that model, a struct's
//! size is always rounded up to its alignment so arrays of structs need no
//! extra padding per element.

use std::collections::HashMap;

use strand_ir::{Field, Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sizes {
    pub word_size: u64,
    pub max_align: u64,
}

impl Sizes {
    pub const WORD32: Sizes = Sizes {
        word_size: 4,
        max_align: 4,
    };

    pub const WORD64: Sizes = Sizes {
        word_size: 8,
        max_align: 8,
    };

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.word_size < 4 {
            return Err(LayoutError::WordSize(self.word_size));
        }
        if self.max_align == 0 {
            return Err(LayoutError::MaxAlign);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("word size {0} is below the 4-byte minimum")]
    WordSize(u64),
    #[error("maximum alignment must be at least 1")]
    MaxAlign,
    #[error("named type `{0}` has no underlying type")]
    Opaque(String),
    #[error("`{ty}` has no field {index}")]
    FieldIndex { ty: String, index: usize },
    #[error("`{0}` is not a struct")]
    NotStruct(String),
    #[error("size of `{0}` overflows")]
    Overflow(String),
}

/// Field offsets, size and alignment of a struct or tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub size: u64,
    pub align: u64,
    pub offsets: Vec<u64>,
}

/// How to turn an element index into a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addressing {
    pub stride: u64,
    /// `Some(k)` when `stride == 1 << k`: the index may be shifted instead of
    /// multiplied.
    pub shift: Option<u32>,
}

impl Addressing {
    pub fn for_stride(stride: u64) -> Self {
        let shift = (stride > 0 && stride.is_power_of_two()).then(|| stride.trailing_zeros());
        Self { stride, shift }
    }
}

/// `value` rounded up to a multiple of `align`; `None` on overflow.
pub fn align_up(value: u64, align: u64) -> Option<u64> {
    if align == 0 {
        return Some(value);
    }
    let rem = value % align;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(align - rem)
    }
}

/// Layout computations with a per-aggregate cache.
#[derive(Debug)]
pub struct LayoutEngine {
    sizes: Sizes,
    aggregates: HashMap<Type, StructLayout>,
}

impl LayoutEngine {
    pub fn new(sizes: Sizes) -> Result<Self, LayoutError> {
        sizes.validate()?;
        Ok(Self {
            sizes,
            aggregates: HashMap::new(),
        })
    }

    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    pub fn cached_aggregates(&self) -> usize {
        self.aggregates.len()
    }

    fn cap(&self, align: u64) -> u64 {
        align.clamp(1, self.sizes.max_align)
    }

    pub fn size_of(&mut self, ty: &Type) -> Result<u64, LayoutError> {
        let word = self.sizes.word_size;
        Ok(match ty {
            Type::Named { name, underlying } => match underlying {
                Some(inner) => self.size_of(inner)?,
                None => return Err(LayoutError::Opaque(name.clone())),
            },
            Type::Bool | Type::Int8 | Type::Uint8 => 1,
            Type::Int16 | Type::Uint16 => 2,
            Type::Int32 | Type::Uint32 | Type::Float32 => 4,
            Type::Int64 | Type::Uint64 | Type::Float64 | Type::Complex64 => 8,
            Type::Complex128 => 16,
            Type::Int | Type::Uint | Type::Uintptr => word,
            Type::UnsafePointer
            | Type::Pointer(_)
            | Type::Map { .. }
            | Type::Chan { .. }
            | Type::Func(_) => word,
            Type::String | Type::Interface { .. } => 2 * word,
            Type::Slice(_) => 3 * word,
            Type::Array { elem, len } => {
                let stride = self.stride(elem)?;
                stride
                    .checked_mul(*len)
                    .ok_or_else(|| LayoutError::Overflow(ty.to_string()))?
            }
            Type::Struct(_) | Type::Tuple(_) => self.aggregate(ty)?.size,
        })
    }

    pub fn align_of(&mut self, ty: &Type) -> Result<u64, LayoutError> {
        let word = self.sizes.word_size;
        let natural = match ty {
            Type::Named { name, underlying } => match underlying {
                Some(inner) => return self.align_of(inner),
                None => return Err(LayoutError::Opaque(name.clone())),
            },
            Type::Complex64 | Type::Complex128 => self.size_of(ty)? / 2,
            Type::String | Type::Interface { .. } | Type::Slice(_) => word,
            Type::Array { elem, .. } => return self.align_of(elem),
            Type::Struct(_) | Type::Tuple(_) => return Ok(self.aggregate(ty)?.align),
            _ => self.size_of(ty)?,
        };
        Ok(self.cap(natural))
    }

    /// Distance between consecutive array elements.
    pub fn stride(&mut self, elem: &Type) -> Result<u64, LayoutError> {
        let size = self.size_of(elem)?;
        let align = self.align_of(elem)?;
        align_up(size, align).ok_or_else(|| LayoutError::Overflow(elem.to_string()))
    }

    pub fn addressing(&mut self, elem: &Type) -> Result<Addressing, LayoutError> {
        Ok(Addressing::for_stride(self.stride(elem)?))
    }

    /// Layout of a struct or tuple type (named wrappers are looked through).
    pub fn aggregate(&mut self, ty: &Type) -> Result<StructLayout, LayoutError> {
        let resolved = resolve(ty)?;
        if let Some(layout) = self.aggregates.get(resolved) {
            return Ok(layout.clone());
        }
        let members: Vec<Type> = match resolved {
            Type::Struct(fields) => fields.iter().map(|Field { ty, .. }| ty.clone()).collect(),
            Type::Tuple(items) => items.clone(),
            other => return Err(LayoutError::NotStruct(other.to_string())),
        };
        let overflow = || LayoutError::Overflow(resolved.to_string());
        let mut offsets = Vec::with_capacity(members.len());
        let mut offset = 0u64;
        let mut align = 1u64;
        for member in &members {
            let member_align = self.align_of(member)?;
            let member_size = self.size_of(member)?;
            offset = align_up(offset, member_align).ok_or_else(overflow)?;
            offsets.push(offset);
            offset = offset.checked_add(member_size).ok_or_else(overflow)?;
            align = align.max(member_align);
        }
        let layout = StructLayout {
            size: align_up(offset, align).ok_or_else(overflow)?,
            align,
            offsets,
        };
        self.aggregates.insert(resolved.clone(), layout.clone());
        Ok(layout)
    }

    pub fn offset_of(&mut self, ty: &Type, field: usize) -> Result<u64, LayoutError> {
        let layout = self.aggregate(ty)?;
        layout
            .offsets
            .get(field)
            .copied()
            .ok_or_else(|| LayoutError::FieldIndex {
                ty: ty.to_string(),
                index: field,
            })
    }

    /// Type of field `field` of a struct (or tuple).
    pub fn field_type(ty: &Type, field: usize) -> Result<Type, LayoutError> {
        match resolve(ty)? {
            Type::Struct(fields) => fields.get(field).map(|f| f.ty.clone()),
            Type::Tuple(items) => items.get(field).cloned(),
            other => return Err(LayoutError::NotStruct(other.to_string())),
        }
        .ok_or_else(|| LayoutError::FieldIndex {
            ty: ty.to_string(),
            index: field,
        })
    }
}

fn resolve(ty: &Type) -> Result<&Type, LayoutError> {
    match ty {
        Type::Named {
            underlying: Some(inner),
            ..
        } => resolve(inner),
        Type::Named { name, .. } => Err(LayoutError::Opaque(name.clone())),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, ty: Type) -> Field {
        Field {
            name: name.to_string(),
            ty,
        }
    }

    #[test]
    fn byte_int_byte_is_padded_to_four() {
        let mut engine = LayoutEngine::new(Sizes::WORD32).unwrap();
        let ty = Type::Struct(vec![
            field("a", Type::Uint8),
            field("b", Type::Uint32),
            field("c", Type::Uint8),
        ]);
        let layout = engine.aggregate(&ty).unwrap();
        assert_eq!(layout.offsets, vec![0, 4, 8]);
        assert_eq!(layout.size, 12);
        assert_eq!(layout.align, 4);
    }

    #[test]
    fn alignment_is_capped_at_max_align() {
        let mut engine = LayoutEngine::new(Sizes {
            word_size: 8,
            max_align: 4,
        })
        .unwrap();
        assert_eq!(engine.align_of(&Type::Float64).unwrap(), 4);
        assert_eq!(engine.align_of(&Type::Complex128).unwrap(), 4);
        let ty = Type::Struct(vec![field("a", Type::Uint8), field("b", Type::Int64)]);
        assert_eq!(engine.aggregate(&ty).unwrap().offsets, vec![0, 4]);
    }

    #[test]
    fn reference_types_are_word_multiples() {
        let mut engine = LayoutEngine::new(Sizes::WORD64).unwrap();
        assert_eq!(engine.size_of(&Type::String).unwrap(), 16);
        assert_eq!(engine.size_of(&Type::slice(Type::Int)).unwrap(), 24);
        assert_eq!(engine.size_of(&Type::empty_interface()).unwrap(), 16);
        assert_eq!(engine.size_of(&Type::chan(Type::Int)).unwrap(), 8);
        assert_eq!(engine.align_of(&Type::Complex64).unwrap(), 4);
    }

    #[test]
    fn array_stride_rounds_to_element_alignment() {
        let mut engine = LayoutEngine::new(Sizes::WORD32).unwrap();
        let elem = Type::Struct(vec![field("x", Type::Uint16), field("y", Type::Uint8)]);
        assert_eq!(engine.stride(&elem).unwrap(), 4);
        assert_eq!(engine.size_of(&Type::array(elem.clone(), 5)).unwrap(), 20);
        assert_eq!(engine.addressing(&elem).unwrap().shift, Some(2));
        let odd = Type::Struct(vec![field("a", Type::Uint32), field("b", Type::Uint32), field("c", Type::Uint32)]);
        assert_eq!(engine.addressing(&odd).unwrap(), Addressing { stride: 12, shift: None });
    }

    #[test]
    fn aggregates_are_cached_and_named_types_resolve() {
        let mut engine = LayoutEngine::new(Sizes::WORD64).unwrap();
        let inner = Type::Struct(vec![field("a", Type::Int32), field("b", Type::Bool)]);
        let named = Type::named("main.Pair", inner.clone());
        assert_eq!(engine.size_of(&named).unwrap(), 8);
        assert_eq!(engine.offset_of(&named, 1).unwrap(), 4);
        assert_eq!(engine.cached_aggregates(), 1);
        assert!(matches!(
            engine.offset_of(&named, 2),
            Err(LayoutError::FieldIndex { index: 2, .. })
        ));
        let opaque = Type::Named {
            name: "C.struct".to_string(),
            underlying: None,
        };
        assert_eq!(
            engine.size_of(&opaque),
            Err(LayoutError::Opaque("C.struct".to_string()))
        );
    }

    #[test]
    fn sizes_near_the_top_of_the_range_overflow() {
        let mut engine = LayoutEngine::new(Sizes::WORD64).unwrap();
        let huge = Type::array(Type::Uint8, u64::MAX - 5);
        assert_eq!(engine.size_of(&huge).unwrap(), u64::MAX - 5);

        let padded = Type::Struct(vec![field("n", Type::Uint32), field("bytes", huge.clone())]);
        assert!(matches!(engine.aggregate(&padded), Err(LayoutError::Overflow(_))));
        let trailing = Type::Struct(vec![field("bytes", huge), field("n", Type::Uint32)]);
        assert!(matches!(engine.size_of(&trailing), Err(LayoutError::Overflow(_))));
        assert!(matches!(
            engine.size_of(&Type::array(Type::Int64, u64::MAX / 4)),
            Err(LayoutError::Overflow(_))
        ));
        assert_eq!(align_up(u64::MAX - 2, 4), None);
        assert_eq!(align_up(13, 4), Some(16));
    }

    #[test]
    fn tiny_word_sizes_are_rejected() {
        assert_eq!(
            LayoutEngine::new(Sizes {
                word_size: 2,
                max_align: 2
            })
            .unwrap_err(),
            LayoutError::WordSize(2)
        );
    }
}
