//! Static types attached to every SSA value.
//!
//! The shape follows the front end's type model closely enough that layout,
//! zero values and call classification can be derived without any further
//! type checking.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Uintptr,
    Float32,
    Float64,
    Complex64,
    Complex128,
    String,
    UnsafePointer,
    Pointer(Box<Type>),
    Array {
        elem: Box<Type>,
        len: u64,
    },
    Slice(Box<Type>),
    Struct(Vec<Field>),
    Tuple(Vec<Type>),
    Map {
        key: Box<Type>,
        value: Box<Type>,
    },
    Chan {
        elem: Box<Type>,
        #[serde(default)]
        dir: ChanDir,
    },
    Func(Signature),
    Interface {
        #[serde(default)]
        methods: Vec<Method>,
    },
    Named {
        name: String,
        #[serde(default)]
        underlying: Option<Box<Type>>,
    },
}

impl Default for Type {
    fn default() -> Self {
        Type::void()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub params: Vec<Type>,
    #[serde(default)]
    pub results: Vec<Type>,
    #[serde(default)]
    pub variadic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    #[serde(default)]
    pub sig: Signature,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChanDir {
    #[default]
    Both,
    Send,
    Recv,
}

/// Numeric classification used by arithmetic and conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumClass {
    Int { bits: u32, signed: bool },
    Float { bits: u32 },
    Complex { bits: u32 },
    Bool,
    String,
    Other,
}

impl Type {
    pub fn void() -> Self {
        Type::Tuple(Vec::new())
    }

    pub fn pointer(elem: Type) -> Self {
        Type::Pointer(Box::new(elem))
    }

    pub fn slice(elem: Type) -> Self {
        Type::Slice(Box::new(elem))
    }

    pub fn array(elem: Type, len: u64) -> Self {
        Type::Array {
            elem: Box::new(elem),
            len,
        }
    }

    pub fn chan(elem: Type) -> Self {
        Type::Chan {
            elem: Box::new(elem),
            dir: ChanDir::Both,
        }
    }

    pub fn map(key: Type, value: Type) -> Self {
        Type::Map {
            key: Box::new(key),
            value: Box::new(value),
        }
    }

    pub fn named(name: impl Into<String>, underlying: Type) -> Self {
        Type::Named {
            name: name.into(),
            underlying: Some(Box::new(underlying)),
        }
    }

    pub fn func(params: Vec<Type>, results: Vec<Type>) -> Self {
        Type::Func(Signature {
            params,
            results,
            variadic: false,
        })
    }

    pub fn empty_interface() -> Self {
        Type::Interface {
            methods: Vec::new(),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Tuple(items) if items.is_empty())
    }

    /// Strip any number of named wrappers. A named type without an
    /// underlying type resolves to itself.
    pub fn underlying(&self) -> &Type {
        let mut current = self;
        while let Type::Named {
            underlying: Some(inner),
            ..
        } = current
        {
            current = inner;
        }
        current
    }

    /// Types whose values are shared references at run time and therefore
    /// must be passed by reference, never copied.
    pub fn is_reference_like(&self) -> bool {
        matches!(
            self.underlying(),
            Type::Pointer(_)
                | Type::UnsafePointer
                | Type::Slice(_)
                | Type::Chan { .. }
                | Type::Map { .. }
        )
    }

    pub fn is_interface(&self) -> bool {
        matches!(self.underlying(), Type::Interface { .. })
    }

    pub fn is_string(&self) -> bool {
        matches!(self.underlying(), Type::String)
    }

    /// Zero values that are themselves runtime allocations. Registers of these
    /// types are left uninitialised: SSA guarantees a write before any read.
    pub fn zero_is_allocation(&self) -> bool {
        matches!(
            self.underlying(),
            Type::Pointer(_)
                | Type::Slice(_)
                | Type::Map { .. }
                | Type::Chan { .. }
                | Type::Tuple(_)
                | Type::Int64
                | Type::Uint64
                | Type::Complex64
                | Type::Complex128
                | Type::Struct(_)
                | Type::Array { .. }
        )
    }

    /// Element type of a pointer, slice, array, channel or pointer-to-array.
    pub fn elem(&self) -> Option<&Type> {
        match self.underlying() {
            Type::Pointer(inner) => match inner.underlying() {
                Type::Array { elem, .. } => Some(elem),
                _ => Some(inner),
            },
            Type::Slice(elem) | Type::Array { elem, .. } | Type::Chan { elem, .. } => Some(elem),
            _ => None,
        }
    }

    pub fn pointee(&self) -> Option<&Type> {
        match self.underlying() {
            Type::Pointer(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        match self.underlying() {
            Type::Func(sig) => Some(sig),
            _ => None,
        }
    }

    pub fn tuple_items(&self) -> &[Type] {
        match self.underlying() {
            Type::Tuple(items) => items,
            _ => std::slice::from_ref(self),
        }
    }

    pub fn num_class(&self) -> NumClass {
        match self.underlying() {
            Type::Int | Type::Int64 => NumClass::Int {
                bits: 64,
                signed: true,
            },
            Type::Int8 => NumClass::Int {
                bits: 8,
                signed: true,
            },
            Type::Int16 => NumClass::Int {
                bits: 16,
                signed: true,
            },
            Type::Int32 => NumClass::Int {
                bits: 32,
                signed: true,
            },
            Type::Uint | Type::Uint64 | Type::Uintptr => NumClass::Int {
                bits: 64,
                signed: false,
            },
            Type::Uint8 => NumClass::Int {
                bits: 8,
                signed: false,
            },
            Type::Uint16 => NumClass::Int {
                bits: 16,
                signed: false,
            },
            Type::Uint32 => NumClass::Int {
                bits: 32,
                signed: false,
            },
            Type::Float32 => NumClass::Float { bits: 32 },
            Type::Float64 => NumClass::Float { bits: 64 },
            Type::Complex64 => NumClass::Complex { bits: 64 },
            Type::Complex128 => NumClass::Complex { bits: 128 },
            Type::Bool => NumClass::Bool,
            Type::String => NumClass::String,
            _ => NumClass::Other,
        }
    }

    /// Name used for run-time type identity of interface values.
    pub fn type_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => f.write_str("bool"),
            Type::Int => f.write_str("int"),
            Type::Int8 => f.write_str("int8"),
            Type::Int16 => f.write_str("int16"),
            Type::Int32 => f.write_str("int32"),
            Type::Int64 => f.write_str("int64"),
            Type::Uint => f.write_str("uint"),
            Type::Uint8 => f.write_str("uint8"),
            Type::Uint16 => f.write_str("uint16"),
            Type::Uint32 => f.write_str("uint32"),
            Type::Uint64 => f.write_str("uint64"),
            Type::Uintptr => f.write_str("uintptr"),
            Type::Float32 => f.write_str("float32"),
            Type::Float64 => f.write_str("float64"),
            Type::Complex64 => f.write_str("complex64"),
            Type::Complex128 => f.write_str("complex128"),
            Type::String => f.write_str("string"),
            Type::UnsafePointer => f.write_str("unsafe.Pointer"),
            Type::Pointer(inner) => write!(f, "*{inner}"),
            Type::Array { elem, len } => write!(f, "[{len}]{elem}"),
            Type::Slice(elem) => write!(f, "[]{elem}"),
            Type::Struct(fields) => {
                f.write_str("struct{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{} {}", field.name, field.ty)?;
                }
                f.write_str("}")
            }
            Type::Tuple(items) => {
                f.write_str("(")?;
                write_list(f, items)?;
                f.write_str(")")
            }
            Type::Map { key, value } => write!(f, "map[{key}]{value}"),
            Type::Chan { elem, dir } => match dir {
                ChanDir::Both => write!(f, "chan {elem}"),
                ChanDir::Send => write!(f, "chan<- {elem}"),
                ChanDir::Recv => write!(f, "<-chan {elem}"),
            },
            Type::Func(sig) => write!(f, "func{sig}"),
            Type::Interface { methods } => {
                f.write_str("interface{")?;
                for (i, method) in methods.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{}{}", method.name, method.sig)?;
                }
                f.write_str("}")
            }
            Type::Named { name, .. } => f.write_str(name),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        write_list(f, &self.params)?;
        if self.variadic {
            f.write_str("...")?;
        }
        f.write_str(")")?;
        match self.results.as_slice() {
            [] => Ok(()),
            [single] => write!(f, " {single}"),
            many => {
                f.write_str(" (")?;
                write_list(f, many)?;
                f.write_str(")")
            }
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Type]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_source_syntax() {
        let ty = Type::map(
            Type::String,
            Type::slice(Type::pointer(Type::named("main.T", Type::Int))),
        );
        insta::assert_snapshot!(ty.to_string(), @"map[string][]*main.T");
        let sig = Type::func(vec![Type::Int, Type::chan(Type::Bool)], vec![Type::Int, Type::Bool]);
        insta::assert_snapshot!(sig.to_string(), @"func(int, chan bool) (int, bool)");
    }

    #[test]
    fn underlying_strips_nested_names() {
        let ty = Type::named("a.B", Type::named("a.C", Type::Uint8));
        assert_eq!(ty.underlying(), &Type::Uint8);
        let opaque = Type::Named {
            name: "a.D".to_string(),
            underlying: None,
        };
        assert_eq!(opaque.underlying(), &opaque);
    }

    #[test]
    fn wide_integers_and_aggregates_defer_initialisation() {
        assert!(Type::Int64.zero_is_allocation());
        assert!(Type::chan(Type::Int).zero_is_allocation());
        assert!(Type::void().zero_is_allocation());
        assert!(!Type::Int.zero_is_allocation());
        assert!(!Type::String.zero_is_allocation());
    }

    #[test]
    fn types_decode_from_snake_case_json() {
        let ty: Type = serde_json::from_str(
            r#"{"struct":[{"name":"a","ty":"uint8"},{"name":"b","ty":{"array":{"elem":"int32","len":3}}}]}"#,
        )
        .unwrap();
        assert_eq!(ty.to_string(), "struct{a uint8; b [3]int32}");
        let ch: Type = serde_json::from_str(r#"{"chan":{"elem":"int"}}"#).unwrap();
        assert_eq!(ch, Type::chan(Type::Int));
    }

    #[test]
    fn elem_sees_through_pointer_to_array() {
        let ptr = Type::pointer(Type::array(Type::Float64, 4));
        assert_eq!(ptr.elem(), Some(&Type::Float64));
        assert_eq!(Type::pointer(Type::Int).elem(), Some(&Type::Int));
    }
}
