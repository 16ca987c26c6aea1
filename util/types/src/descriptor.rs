//! Frame descriptors and the descriptor catalog.
//!
//! A descriptor is the compile-time shape of a transformed method: which
//! slots a captured frame carries and which of them are live at each yield
//! point. The catalog is populated once by the rewriter and is read-only
//! afterwards; the validator and the runner consult it when deciding whether
//! an untrusted continuation may be restored.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use bit_vec::BitVec;
use thiserror::Error;

use crate::typesig::TypeSig;

/// What a captured slot held in the source method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Local,
    Argument,
    /// A spilled evaluation-stack temporary.
    EvalStack,
}

/// Shape of one captured slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotSpec {
    /// Position in the packed slots array.
    pub index: u16,
    /// Debug name, when the source carried one.
    pub name: Option<String>,
    pub kind: SlotKind,
    /// Declared type; `TypeSig::Any` when untyped.
    pub ty: TypeSig,
    /// Whether restore fails if the serialized frame omits this slot.
    pub serialization_required: bool,
}

/// Errors raised while constructing descriptors or populating the catalog.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum DescriptorError {
    #[error("descriptor for token {token}: {yield_points} yield points but {live_maps} live maps")]
    LiveMapCountMismatch {
        token: i32,
        yield_points: usize,
        live_maps: usize,
    },
    #[error("descriptor for token {token}: live map {index} covers {len} slots, expected {slots}")]
    LiveMapWidthMismatch {
        token: i32,
        index: usize,
        len: usize,
        slots: usize,
    },
    #[error("descriptor for token {token}: yield point ids must be non-negative and strictly increasing")]
    MalformedYieldPointIds { token: i32 },
    #[error("catalog already holds a descriptor for token {0}")]
    DuplicateToken(i32),
}

/// Immutable compile-time shape of a transformed method.
#[derive(Debug, Clone)]
pub struct FrameDescriptor {
    method_token: i32,
    method_name: String,
    slots: Vec<SlotSpec>,
    yield_point_ids: Vec<i32>,
    live_slots: Vec<BitVec>,
}

impl FrameDescriptor {
    /// Builds a descriptor, taking defensive copies of every array so no
    /// caller-held storage aliases the published shape.
    pub fn new(
        method_token: i32,
        method_name: &str,
        slots: &[SlotSpec],
        yield_point_ids: &[i32],
        live_slots: &[BitVec],
    ) -> Result<Self, DescriptorError> {
        if yield_point_ids.len() != live_slots.len() {
            return Err(DescriptorError::LiveMapCountMismatch {
                token: method_token,
                yield_points: yield_point_ids.len(),
                live_maps: live_slots.len(),
            });
        }
        for (index, live) in live_slots.iter().enumerate() {
            if live.len() != slots.len() {
                return Err(DescriptorError::LiveMapWidthMismatch {
                    token: method_token,
                    index,
                    len: live.len(),
                    slots: slots.len(),
                });
            }
        }
        let monotonic = yield_point_ids.windows(2).all(|w| w[0] < w[1]);
        if !monotonic || yield_point_ids.first().is_some_and(|id| *id < 0) {
            return Err(DescriptorError::MalformedYieldPointIds {
                token: method_token,
            });
        }
        Ok(FrameDescriptor {
            method_token,
            method_name: method_name.to_string(),
            slots: slots.to_vec(),
            yield_point_ids: yield_point_ids.to_vec(),
            live_slots: live_slots.to_vec(),
        })
    }

    pub fn method_token(&self) -> i32 {
        self.method_token
    }

    /// Diagnostic method name; never used for identity.
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn slots(&self) -> &[SlotSpec] {
        &self.slots
    }

    pub fn yield_point_ids(&self) -> &[i32] {
        &self.yield_point_ids
    }

    pub fn yield_point_count(&self) -> usize {
        self.yield_point_ids.len()
    }

    /// Live map for the yield point at positional `index`.
    pub fn live_slots_at(&self, index: usize) -> Option<&BitVec> {
        self.live_slots.get(index)
    }

    /// Number of live slots at the yield point at positional `index`.
    pub fn live_count_at(&self, index: usize) -> Option<usize> {
        self.live_slots
            .get(index)
            .map(|live| live.iter().filter(|b| *b).count())
    }
}

/// Token-keyed catalog of frame descriptors; write-once at build time.
#[derive(Debug, Default)]
pub struct DescriptorCatalog {
    descriptors: HashMap<i32, Arc<FrameDescriptor>>,
}

impl DescriptorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a descriptor. Tokens are unique; a second publication for
    /// the same token is an error, not a replacement.
    pub fn insert(&mut self, descriptor: FrameDescriptor) -> Result<(), DescriptorError> {
        match self.descriptors.entry(descriptor.method_token()) {
            Entry::Occupied(entry) => Err(DescriptorError::DuplicateToken(*entry.key())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(descriptor));
                Ok(())
            }
        }
    }

    /// Looks up a descriptor; unknown tokens are simply absent.
    pub fn get(&self, method_token: i32) -> Option<Arc<FrameDescriptor>> {
        self.descriptors.get(&method_token).cloned()
    }

    pub fn contains(&self, method_token: i32) -> bool {
        self.descriptors.contains_key(&method_token)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn tokens(&self) -> impl Iterator<Item = i32> + '_ {
        self.descriptors.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(index: u16) -> SlotSpec {
        SlotSpec {
            index,
            name: None,
            kind: SlotKind::Local,
            ty: TypeSig::I32,
            serialization_required: true,
        }
    }

    #[test]
    fn live_map_counts_must_match_yield_points() {
        let err = FrameDescriptor::new(1, "m", &[slot(0)], &[0, 1], &[BitVec::from_elem(1, true)])
            .unwrap_err();
        assert!(matches!(err, DescriptorError::LiveMapCountMismatch { .. }));
    }

    #[test]
    fn live_map_width_must_match_slot_count() {
        let err = FrameDescriptor::new(1, "m", &[slot(0), slot(1)], &[0], &[BitVec::from_elem(1, true)])
            .unwrap_err();
        assert!(matches!(err, DescriptorError::LiveMapWidthMismatch { .. }));
    }

    #[test]
    fn ids_must_be_strictly_increasing_and_non_negative() {
        let live = || vec![BitVec::from_elem(1, true), BitVec::from_elem(1, true)];
        assert!(FrameDescriptor::new(1, "m", &[slot(0)], &[1, 1], &live()).is_err());
        assert!(FrameDescriptor::new(1, "m", &[slot(0)], &[-1, 0], &live()).is_err());
        assert!(FrameDescriptor::new(1, "m", &[slot(0)], &[0, 3], &live()).is_ok());
    }

    #[test]
    fn construction_copies_caller_storage() {
        let mut slots = vec![slot(0)];
        let ids = vec![0];
        let live = vec![BitVec::from_elem(1, true)];
        let descriptor = FrameDescriptor::new(9, "m", &slots, &ids, &live).unwrap();
        slots[0].index = 99;
        assert_eq!(descriptor.slots()[0].index, 0);
    }

    #[test]
    fn duplicate_tokens_are_rejected() {
        let mut catalog = DescriptorCatalog::new();
        let descriptor = || {
            FrameDescriptor::new(7, "m", &[slot(0)], &[0], &[BitVec::from_elem(1, true)]).unwrap()
        };
        catalog.insert(descriptor()).unwrap();
        assert_eq!(
            catalog.insert(descriptor()),
            Err(DescriptorError::DuplicateToken(7))
        );
        assert!(catalog.get(7).is_some());
        assert!(catalog.get(8).is_none());
    }

    #[test]
    fn live_counts() {
        let mut live = BitVec::from_elem(3, false);
        live.set(1, true);
        let slots = [slot(0), slot(1), slot(2)];
        let descriptor = FrameDescriptor::new(2, "m", &slots, &[0], &[live]).unwrap();
        assert_eq!(descriptor.live_count_at(0), Some(1));
        assert_eq!(descriptor.live_count_at(1), None);
    }
}
