//! Identity-preserving object-graph bookkeeping.
//!
//! Serialization collaborators use one tracker per pass: the encoder
//! registers live references and reuses assigned ids for repeated
//! occurrences; the decoder replays known id-to-object bindings. Non-null
//! values are keyed by reference identity, never value equality; inline
//! scalars behave like freshly boxed values and register anew every time.

use std::collections::HashMap;

use molt_types::Value;

use crate::error::StateError;

/// Reserved id for null; registering null twice keeps yielding it.
pub const NULL_SENTINEL_ID: i32 = -1;

/// Default ceiling on decoder-supplied ids. Guards the backing storage
/// against an allocation attack from a hostile byte stream.
pub const DEFAULT_ID_CEILING: usize = 1 << 20;

pub struct ObjectGraphTracker {
    ids: HashMap<usize, i32>,
    /// Keeps registered references alive so pointer identity stays unique
    /// for the tracker's lifetime.
    pinned: Vec<Value>,
    next_id: i32,
    null_registered: bool,
    bound: Vec<Option<Value>>,
    ceiling: usize,
}

impl Default for ObjectGraphTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectGraphTracker {
    pub fn new() -> Self {
        Self::with_ceiling(DEFAULT_ID_CEILING)
    }

    pub fn with_ceiling(ceiling: usize) -> Self {
        ObjectGraphTracker {
            ids: HashMap::new(),
            pinned: Vec::new(),
            next_id: 0,
            null_registered: false,
            bound: Vec::new(),
            ceiling,
        }
    }

    /// Registers a value, returning `(is_new, id)`.
    ///
    /// Null registers once as the `-1` sentinel and is idempotent after.
    /// Reference values get dense ids from 0; a repeated reference returns
    /// its existing id with `is_new = false`. Scalars have per-box identity
    /// and always register fresh.
    pub fn try_register(&mut self, value: &Value) -> (bool, i32) {
        if value.is_null() {
            let is_new = !self.null_registered;
            self.null_registered = true;
            return (is_new, NULL_SENTINEL_ID);
        }
        match value.ref_identity() {
            Some(identity) => {
                if let Some(id) = self.ids.get(&identity) {
                    return (false, *id);
                }
                let id = self.next_id;
                self.next_id += 1;
                self.ids.insert(identity, id);
                self.pinned.push(value.clone());
                (true, id)
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                self.pinned.push(value.clone());
                (true, id)
            }
        }
    }

    /// Whether the value was previously registered. Null is tracked but not
    /// considered a user registration.
    pub fn is_registered(&self, value: &Value) -> bool {
        match value.ref_identity() {
            Some(identity) => self.ids.contains_key(&identity),
            None => false,
        }
    }

    /// The id assigned to a registered reference; absent otherwise. Never
    /// faults.
    pub fn id_of(&self, value: &Value) -> Option<i32> {
        value
            .ref_identity()
            .and_then(|identity| self.ids.get(&identity).copied())
    }

    /// Replays a known id-to-object binding from a decoder. Re-binding the
    /// same id to the same object is idempotent; a different object fails.
    /// Ids beyond the ceiling are rejected outright.
    pub fn register_deserialized(&mut self, id: i32, value: Value) -> Result<(), StateError> {
        if id < 0 {
            return Err(StateError::InvalidId(id));
        }
        let index = id as usize;
        if index > self.ceiling {
            return Err(StateError::IdAboveCeiling {
                id,
                ceiling: self.ceiling,
            });
        }
        if self.bound.len() <= index {
            self.bound.resize(index + 1, None);
        }
        match &self.bound[index] {
            None => {
                self.bound[index] = Some(value);
                Ok(())
            }
            Some(existing) if same_object(existing, &value) => Ok(()),
            Some(_) => Err(StateError::RebindMismatch(id)),
        }
    }

    /// The object bound to `id`. `None` means never bound; `Some(Value::
    /// Null)` means explicitly bound to null. Negative ids are never bound.
    pub fn get_by_id(&self, id: i32) -> Option<Value> {
        if id < 0 {
            return None;
        }
        self.bound.get(id as usize).cloned().flatten()
    }

    /// Whether `id` has a binding (possibly to null).
    pub fn is_bound(&self, id: i32) -> bool {
        id >= 0 && matches!(self.bound.get(id as usize), Some(Some(_)))
    }

    /// Resets all state; ids are assigned from 0 again.
    pub fn clear(&mut self) {
        self.ids.clear();
        self.pinned.clear();
        self.next_id = 0;
        self.null_registered = false;
        self.bound.clear();
    }
}

fn same_object(a: &Value, b: &Value) -> bool {
    match (a.ref_identity(), b.ref_identity()) {
        (Some(left), Some(right)) => left == right,
        (None, None) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_types::TypeSig;

    #[test]
    fn null_uses_the_reserved_sentinel() {
        let mut tracker = ObjectGraphTracker::new();
        assert_eq!(tracker.try_register(&Value::Null), (true, -1));
        assert_eq!(tracker.try_register(&Value::Null), (false, -1));
        assert!(!tracker.is_registered(&Value::Null));
        assert_eq!(tracker.id_of(&Value::Null), None);
    }

    #[test]
    fn references_get_dense_ids_from_zero() {
        let mut tracker = ObjectGraphTracker::new();
        let a = Value::str("a");
        let b = Value::array(TypeSig::I32, vec![]);
        assert_eq!(tracker.try_register(&a), (true, 0));
        assert_eq!(tracker.try_register(&b), (true, 1));
        assert_eq!(tracker.try_register(&a), (false, 0));
        assert!(tracker.is_registered(&a));
        assert_eq!(tracker.id_of(&b), Some(1));
    }

    #[test]
    fn scalars_register_fresh_every_time() {
        let mut tracker = ObjectGraphTracker::new();
        let (new_a, id_a) = tracker.try_register(&Value::I32(7));
        let (new_b, id_b) = tracker.try_register(&Value::I32(7));
        assert!(new_a && new_b);
        assert_ne!(id_a, id_b);
        assert!(!tracker.is_registered(&Value::I32(7)));
        assert_eq!(tracker.id_of(&Value::I32(7)), None);
    }

    #[test]
    fn rebinding_rules() {
        let mut tracker = ObjectGraphTracker::new();
        let a = Value::str("shared");
        tracker.register_deserialized(4, a.clone()).unwrap();
        tracker.register_deserialized(4, a.clone()).unwrap();
        let err = tracker
            .register_deserialized(4, Value::str("other"))
            .unwrap_err();
        assert_eq!(err, StateError::RebindMismatch(4));
        assert!(matches!(
            tracker.register_deserialized(-3, a),
            Err(StateError::InvalidId(-3))
        ));
    }

    #[test]
    fn ceiling_defends_against_hostile_ids() {
        let mut tracker = ObjectGraphTracker::with_ceiling(16);
        assert!(tracker.register_deserialized(16, Value::Null).is_ok());
        assert_eq!(
            tracker.register_deserialized(17, Value::Null),
            Err(StateError::IdAboveCeiling { id: 17, ceiling: 16 })
        );
    }

    #[test]
    fn bound_null_is_distinguishable_from_unbound() {
        let mut tracker = ObjectGraphTracker::new();
        tracker.register_deserialized(2, Value::Null).unwrap();
        assert!(tracker.is_bound(2));
        assert_eq!(tracker.get_by_id(2), Some(Value::Null));
        assert!(!tracker.is_bound(3));
        assert_eq!(tracker.get_by_id(3), None);
        assert_eq!(tracker.get_by_id(-1), None);
    }

    #[test]
    fn clear_resets_id_assignment() {
        let mut tracker = ObjectGraphTracker::new();
        let a = Value::str("a");
        assert_eq!(tracker.try_register(&a), (true, 0));
        tracker.clear();
        let b = Value::str("b");
        assert_eq!(tracker.try_register(&b), (true, 0));
    }
}
