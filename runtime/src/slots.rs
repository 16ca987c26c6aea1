//! Frame-slot packing and unpacking.

use molt_types::{TypeSig, Value};

use crate::error::RuntimeError;

/// Packs values into a slots array; value-typed inputs are boxed. The
/// returned array is freshly allocated and owned by the frame record.
pub fn pack(values: &[Value]) -> Vec<Value> {
    values.to_vec()
}

/// Unpacks slot `index` as a value of the declared type.
///
/// A null entry yields the declared type's default for value types, null for
/// reference types and nullables. An incompatible non-null entry is a type
/// error naming both kinds.
pub fn unpack(slots: &[Value], index: i32, expected: &TypeSig) -> Result<Value, RuntimeError> {
    if index < 0 {
        return Err(RuntimeError::Argument(format!(
            "slot index {index} is negative"
        )));
    }
    let slot = slots.get(index as usize).ok_or_else(|| {
        RuntimeError::Argument(format!(
            "slot index {index} out of range for {} slot(s)",
            slots.len()
        ))
    })?;
    coerce(slot.clone(), expected)
}

/// Unpacks from a slots array value; a null array is an argument error.
pub fn unpack_value(slots: &Value, index: i32, expected: &TypeSig) -> Result<Value, RuntimeError> {
    match slots {
        Value::Null => Err(RuntimeError::Argument("slots array is null".to_string())),
        Value::Array(arr) => unpack(&arr.borrow().items, index, expected),
        other => Err(RuntimeError::TypeMismatch {
            expected: "array".to_string(),
            observed: other.kind_name().to_string(),
        }),
    }
}

/// Checked conversion of a value to a declared type. Shared by unpacking and
/// the machine's unbox instruction.
pub fn coerce(value: Value, expected: &TypeSig) -> Result<Value, RuntimeError> {
    if value.is_null() {
        return Ok(Value::default_of(expected));
    }
    if matches_declared(&value, expected) {
        Ok(value)
    } else {
        Err(RuntimeError::TypeMismatch {
            expected: expected.render_name(),
            observed: value.kind_name().to_string(),
        })
    }
}

/// Whether a non-null runtime value is acceptable for a declared type.
pub fn matches_declared(value: &Value, expected: &TypeSig) -> bool {
    match expected {
        TypeSig::Any => true,
        TypeSig::Bool => matches!(value, Value::Bool(_)),
        TypeSig::I8 | TypeSig::U8 | TypeSig::I16 | TypeSig::U16 | TypeSig::I32 | TypeSig::U32 => {
            matches!(value, Value::I32(_))
        }
        TypeSig::I64 | TypeSig::U64 => matches!(value, Value::I64(_)),
        TypeSig::F32 | TypeSig::F64 | TypeSig::Decimal => matches!(value, Value::F64(_)),
        TypeSig::Char => matches!(value, Value::Char(_)),
        TypeSig::Str => matches!(value, Value::Str(_)),
        TypeSig::Date | TypeSig::TimeSpan | TypeSig::Guid | TypeSig::DateOffset => false,
        TypeSig::Enum(_) => matches!(value, Value::I32(_) | Value::I64(_)),
        TypeSig::Array(elem) => match value {
            Value::Array(arr) => {
                let held = &arr.borrow().elem;
                **elem == TypeSig::Any || held == elem.as_ref()
            }
            _ => false,
        },
        TypeSig::Nullable(inner) => matches_declared(value, inner),
        TypeSig::Named(name) => value.type_sig() == TypeSig::Named(name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_clones_into_a_fresh_array() {
        let values = [Value::I32(1), Value::str("a")];
        let slots = pack(&values);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0], Value::I32(1));
    }

    #[test]
    fn negative_and_out_of_range_indices_fail() {
        let slots = [Value::I32(1)];
        assert!(matches!(
            unpack(&slots, -1, &TypeSig::I32),
            Err(RuntimeError::Argument(_))
        ));
        assert!(matches!(
            unpack(&slots, 1, &TypeSig::I32),
            Err(RuntimeError::Argument(_))
        ));
    }

    #[test]
    fn null_slots_default_by_kind() {
        let slots = [Value::Null];
        assert_eq!(unpack(&slots, 0, &TypeSig::I32).unwrap(), Value::I32(0));
        assert_eq!(unpack(&slots, 0, &TypeSig::Str).unwrap(), Value::Null);
        assert_eq!(
            unpack(&slots, 0, &TypeSig::Nullable(Box::new(TypeSig::I32))).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn mismatches_name_both_kinds() {
        let slots = [Value::str("nope")];
        let err = unpack(&slots, 0, &TypeSig::I32).unwrap_err();
        match err {
            RuntimeError::TypeMismatch { expected, observed } => {
                assert_eq!(expected, "int");
                assert_eq!(observed, "string");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn null_array_is_an_argument_error() {
        assert!(matches!(
            unpack_value(&Value::Null, 0, &TypeSig::I32),
            Err(RuntimeError::Argument(_))
        ));
    }
}
