//! Declared-type signatures.
//!
//! A `TypeSig` is the static type recorded for locals, arguments, slots and
//! method parameters. It is deliberately closed over the set of shapes the
//! capture format can carry; everything else is a named type that must be
//! explicitly registered with the allow-list before it may travel.

use serde::{Deserialize, Serialize};

/// Declared type of a local, argument, slot or parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeSig {
    /// Unknown or dynamically typed; matches any runtime value.
    Any,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Char,
    Str,
    Decimal,
    /// Calendar date.
    Date,
    /// Elapsed-time span.
    TimeSpan,
    /// Globally unique id.
    Guid,
    /// Date with explicit offset.
    DateOffset,
    /// An enumeration type, identified by full name.
    Enum(String),
    /// Array with the given element type.
    Array(Box<TypeSig>),
    /// Nullable wrapper around a value type.
    Nullable(Box<TypeSig>),
    /// Any other type, identified by full name.
    Named(String),
}

impl TypeSig {
    /// Whether values of this type are value-typed (boxed when captured).
    pub fn is_value_type(&self) -> bool {
        !matches!(
            self,
            TypeSig::Str | TypeSig::Array(_) | TypeSig::Named(_) | TypeSig::Any
        )
    }

    /// Canonical rendering used for method-token derivation and diagnostics.
    ///
    /// Primitive types render as their short alias so tokens stay stable
    /// across processes regardless of how the signature was spelled.
    pub fn render_name(&self) -> String {
        match self {
            TypeSig::Any => "any".to_string(),
            TypeSig::Bool => "bool".to_string(),
            TypeSig::I8 => "sbyte".to_string(),
            TypeSig::U8 => "byte".to_string(),
            TypeSig::I16 => "short".to_string(),
            TypeSig::U16 => "ushort".to_string(),
            TypeSig::I32 => "int".to_string(),
            TypeSig::U32 => "uint".to_string(),
            TypeSig::I64 => "long".to_string(),
            TypeSig::U64 => "ulong".to_string(),
            TypeSig::F32 => "float".to_string(),
            TypeSig::F64 => "double".to_string(),
            TypeSig::Char => "char".to_string(),
            TypeSig::Str => "string".to_string(),
            TypeSig::Decimal => "decimal".to_string(),
            TypeSig::Date => "date".to_string(),
            TypeSig::TimeSpan => "timespan".to_string(),
            TypeSig::Guid => "guid".to_string(),
            TypeSig::DateOffset => "dateoffset".to_string(),
            TypeSig::Enum(name) => name.clone(),
            TypeSig::Array(elem) => format!("{}[]", elem.render_name()),
            TypeSig::Nullable(inner) => format!("{}?", inner.render_name()),
            TypeSig::Named(name) => name.clone(),
        }
    }
}

impl std::fmt::Display for TypeSig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_names_are_canonical() {
        assert_eq!(TypeSig::I32.render_name(), "int");
        assert_eq!(
            TypeSig::Array(Box::new(TypeSig::I64)).render_name(),
            "long[]"
        );
        assert_eq!(
            TypeSig::Nullable(Box::new(TypeSig::Bool)).render_name(),
            "bool?"
        );
        assert_eq!(TypeSig::Named("Demo.Widget".into()).render_name(), "Demo.Widget");
    }

    #[test]
    fn reference_shapes_are_not_value_types() {
        assert!(TypeSig::I32.is_value_type());
        assert!(TypeSig::Nullable(Box::new(TypeSig::I32)).is_value_type());
        assert!(!TypeSig::Str.is_value_type());
        assert!(!TypeSig::Array(Box::new(TypeSig::I32)).is_value_type());
        assert!(!TypeSig::Any.is_value_type());
    }
}
