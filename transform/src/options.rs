//! Rewriter configuration.

use std::collections::HashSet;

/// Name of the marker attribute recognized by default.
pub const DEFAULT_CONTINUABLE_ATTRIBUTE: &str = "Continuable";

/// Options steering yield-point selection and method rewriting.
///
/// Handed to the rewriter by value; nothing mutates a shared default. Derive
/// a modified configuration by constructing a new instance.
#[derive(Debug, Clone)]
pub struct TransformOptions {
    /// Inject a yield check at every loop-closing branch.
    pub include_backward_branches: bool,
    /// Make back-edge checks charge the instruction budget as well as
    /// polling the yield flag. Shares the back-edge sites; adds no ids.
    pub include_instruction_counting: bool,
    /// Inject a yield check before calls that leave the trust zone.
    pub include_external_calls: bool,
    /// Assemblies considered inside the trust zone. Compared on assembly
    /// identity, never on module name.
    pub internal_assemblies: HashSet<String>,
    /// Marker attribute name; matched on simple or fully-qualified form.
    pub continuable_attribute: String,
    /// Mnemonics the policy refuses to transform past.
    pub disallowed_opcodes: Vec<String>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        TransformOptions {
            include_backward_branches: true,
            include_instruction_counting: true,
            include_external_calls: false,
            internal_assemblies: HashSet::new(),
            continuable_attribute: DEFAULT_CONTINUABLE_ATTRIBUTE.to_string(),
            disallowed_opcodes: Vec::new(),
        }
    }
}

impl TransformOptions {
    /// Whether `attribute` marks a method or type as continuable.
    ///
    /// The configured name matches an annotation when either side's simple
    /// (last-segment) form equals the other, so `Continuable` recognizes
    /// `Molt.Continuable` and vice versa.
    pub fn attribute_matches(&self, attribute: &str) -> bool {
        fn simple(name: &str) -> &str {
            name.rsplit('.').next().unwrap_or(name)
        }
        attribute == self.continuable_attribute
            || attribute == simple(&self.continuable_attribute)
            || simple(attribute) == self.continuable_attribute
    }

    /// Whether the assembly named `id` is inside the trust zone.
    pub fn is_internal_assembly(&self, id: &str) -> bool {
        self.internal_assemblies.contains(id)
    }
}
