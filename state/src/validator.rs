//! Continuation-state validation.
//!
//! A decoded continuation is untrusted input. The validator walks the frame
//! chain against the descriptor catalog and the type allow-list, collecting
//! every finding rather than stopping at the first, so one pass surfaces
//! every problem a hostile or stale snapshot carries.

use std::collections::HashSet;

use log::debug;
use molt_types::descriptor::DescriptorCatalog;
use molt_types::{ContinuationState, FrameRef, STATE_FORMAT_VERSION};
use thiserror::Error;

use crate::allowlist::TypeAllowList;

/// Default bound on chain length.
pub const DEFAULT_MAX_STACK_DEPTH: usize = 1_000;

/// Validation configuration. Immutable once constructed; the factory
/// presets return fresh instances, never shared references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOptions {
    require_registered_methods: bool,
    validate_yield_point_ids: bool,
    validate_slot_counts: bool,
    validate_slot_types: bool,
    max_stack_depth: usize,
    strict_version_check: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self::strict()
    }
}

impl ValidationOptions {
    /// The strict preset: everything on.
    pub fn strict() -> Self {
        ValidationOptions {
            require_registered_methods: true,
            validate_yield_point_ids: true,
            validate_slot_counts: true,
            validate_slot_types: true,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            strict_version_check: true,
        }
    }

    /// The lenient preset: registered-method and slot-type checks off.
    /// Negative yield-point ids and cycles are still rejected.
    pub fn lenient() -> Self {
        ValidationOptions {
            require_registered_methods: false,
            validate_slot_types: false,
            ..Self::strict()
        }
    }

    pub fn with_max_stack_depth(mut self, max_stack_depth: usize) -> Self {
        self.max_stack_depth = max_stack_depth;
        self
    }

    pub fn max_stack_depth(&self) -> usize {
        self.max_stack_depth
    }
}

/// One validation finding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationFinding {
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: i32, found: i32 },

    #[error("method token {token} is not in the descriptor catalog")]
    UnknownMethodToken { token: i32 },

    #[error("frame for token {token} has negative yield point id {id}")]
    NegativeYieldPointId { token: i32, id: i32 },

    #[error("frame for token {token} has yield point id {id}, method has {count}")]
    YieldPointOutOfRange { token: i32, id: i32, count: usize },

    #[error("slot count mismatch for token {token}: {found} slot(s), {expected} live required")]
    SlotCountMismatch {
        token: i32,
        expected: usize,
        found: usize,
    },

    #[error("slot {slot} of token {token} holds a disallowed type {ty}")]
    DisallowedSlotType { token: i32, slot: usize, ty: String },

    #[error("yielded value holds a disallowed type {ty}")]
    DisallowedYieldedType { ty: String },

    #[error("frame chain exceeds the permitted {max} frame(s)")]
    StackDepthExceeded { max: usize },

    #[error("frame chain contains a cycle")]
    CycleDetected,
}

/// The accumulated findings of one validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationReport {
    findings: Vec<ValidationFinding>,
}

impl ValidationReport {
    pub fn findings(&self) -> &[ValidationFinding] {
        &self.findings
    }

    pub fn contains(&self, predicate: impl Fn(&ValidationFinding) -> bool) -> bool {
        self.findings.iter().any(predicate)
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for finding in &self.findings {
            writeln!(f, "{finding}")?;
        }
        Ok(())
    }
}

/// Validates decoded continuation states against a catalog and allow-list.
pub struct StateValidator<'a> {
    catalog: &'a DescriptorCatalog,
    allowlist: &'a TypeAllowList,
    options: ValidationOptions,
}

impl<'a> StateValidator<'a> {
    pub fn new(
        catalog: &'a DescriptorCatalog,
        allowlist: &'a TypeAllowList,
        options: ValidationOptions,
    ) -> Self {
        StateValidator {
            catalog,
            allowlist,
            options,
        }
    }

    /// Walks the state; `Ok(())` when nothing was found.
    pub fn validate(&self, state: &ContinuationState) -> Result<(), ValidationReport> {
        let mut findings = Vec::new();

        if self.options.strict_version_check && state.version != STATE_FORMAT_VERSION {
            findings.push(ValidationFinding::VersionMismatch {
                expected: STATE_FORMAT_VERSION,
                found: state.version,
            });
        }

        if self.options.validate_slot_types && !state.yielded_value.is_null() {
            let ty = state.yielded_value.type_sig();
            if !self.allowlist.is_allowed(&ty) {
                findings.push(ValidationFinding::DisallowedYieldedType {
                    ty: ty.render_name(),
                });
            }
        }

        let mut visited: HashSet<*const std::cell::RefCell<molt_types::FrameRecord>> =
            HashSet::new();
        let mut depth = 0usize;
        let mut cursor: Option<FrameRef> = state.stack_head.clone();
        while let Some(frame) = cursor {
            if !visited.insert(std::rc::Rc::as_ptr(&frame)) {
                findings.push(ValidationFinding::CycleDetected);
                break;
            }
            // Exactly max_stack_depth frames are permitted; one more trips.
            if depth == self.options.max_stack_depth {
                findings.push(ValidationFinding::StackDepthExceeded {
                    max: self.options.max_stack_depth,
                });
                break;
            }
            depth += 1;
            self.validate_frame(&frame, &mut findings);
            cursor = frame.borrow().caller.clone();
        }

        if findings.is_empty() {
            Ok(())
        } else {
            debug!("validation found {} problem(s)", findings.len());
            Err(ValidationReport { findings })
        }
    }

    fn validate_frame(&self, frame: &FrameRef, findings: &mut Vec<ValidationFinding>) {
        let frame = frame.borrow();
        let token = frame.method_token;

        // Negative ids are rejected regardless of mode.
        if frame.yield_point_id < 0 {
            findings.push(ValidationFinding::NegativeYieldPointId {
                token,
                id: frame.yield_point_id,
            });
        }

        let descriptor = match self.catalog.get(token) {
            Some(descriptor) => descriptor,
            None => {
                if self.options.require_registered_methods {
                    findings.push(ValidationFinding::UnknownMethodToken { token });
                }
                // Without a shape there is nothing more to check; siblings
                // still get their walk.
                return;
            }
        };

        let id_in_range = frame.yield_point_id >= 0
            && (frame.yield_point_id as usize) < descriptor.yield_point_count();
        if self.options.validate_yield_point_ids && frame.yield_point_id >= 0 && !id_in_range {
            findings.push(ValidationFinding::YieldPointOutOfRange {
                token,
                id: frame.yield_point_id,
                count: descriptor.yield_point_count(),
            });
        }

        if self.options.validate_slot_counts && id_in_range {
            let live = descriptor
                .live_count_at(frame.yield_point_id as usize)
                .unwrap_or(0);
            // Extra trailing entries are permitted; too few is an error.
            if frame.slots.len() < live {
                findings.push(ValidationFinding::SlotCountMismatch {
                    token,
                    expected: live,
                    found: frame.slots.len(),
                });
            }
        }

        if self.options.validate_slot_types {
            for (slot, value) in frame.slots.iter().enumerate() {
                if value.is_null() {
                    continue;
                }
                let ty = value.type_sig();
                if !self.allowlist.is_allowed(&ty) {
                    findings.push(ValidationFinding::DisallowedSlotType {
                        token,
                        slot,
                        ty: ty.render_name(),
                    });
                }
            }
        }
    }
}
