//! Assembly rewriting.
//!
//! Walks every type in every module (nested types included), transforms the
//! methods annotated as continuable, and leaves everything else bit-for-bit
//! unchanged. Failures are collected per method; the run as a whole succeeds
//! when at least one annotated method transformed (or none were annotated).

use std::collections::HashSet;

use log::{debug, warn};
use molt_types::bytecode::{Assembly, MethodDef, TypeDef};
use molt_types::descriptor::DescriptorCatalog;
use thiserror::Error;

use crate::error::TransformError;
use crate::options::TransformOptions;
use crate::transformer::{transform_method, TransformOutcome};

/// One method that failed to transform.
#[derive(Debug, Clone)]
pub struct MethodFailure {
    pub type_name: String,
    pub method_name: String,
    pub error: TransformError,
}

impl std::fmt::Display for MethodFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}: {}", self.type_name, self.method_name, self.error)
    }
}

/// Per-method outcomes of one rewriter run.
#[derive(Debug, Default)]
pub struct RewriteReport {
    /// Methods that now carry capture/restore machinery.
    pub transformed: Vec<TransformOutcome>,
    /// Annotated methods that had no yield point and were left alone.
    pub unchanged: usize,
    /// Annotated methods skipped for having no body.
    pub skipped_bodyless: usize,
    /// Per-method failures; the remaining methods still transformed.
    pub failures: Vec<MethodFailure>,
}

/// A run where every annotated method failed.
#[derive(Error, Debug)]
#[error("no method transformed; {} failure(s), first: {}", failures.len(), failures[0])]
pub struct RewriteError {
    pub failures: Vec<MethodFailure>,
}

/// Rewrites the annotated methods of an assembly in place, publishing frame
/// descriptors to `catalog`.
pub fn rewrite_assembly(
    assembly: &mut Assembly,
    options: &TransformOptions,
    catalog: &mut DescriptorCatalog,
) -> Result<RewriteReport, RewriteError> {
    // First pass: gather the tokens of every continuable method so call
    // sites into them become yield points during the second pass.
    let mut continuable_tokens = HashSet::new();
    for module in &assembly.modules {
        for ty in &module.types {
            collect_continuable(ty, false, options, &mut continuable_tokens);
        }
    }
    debug!(
        "assembly {}: {} continuable method(s)",
        assembly.name,
        continuable_tokens.len()
    );

    let mut report = RewriteReport::default();
    for module in &mut assembly.modules {
        for ty in &mut module.types {
            rewrite_type(ty, false, options, &continuable_tokens, catalog, &mut report);
        }
    }

    if report.transformed.is_empty() && !report.failures.is_empty() {
        return Err(RewriteError {
            failures: report.failures,
        });
    }
    Ok(report)
}

fn collect_continuable(
    ty: &TypeDef,
    inherited: bool,
    options: &TransformOptions,
    tokens: &mut HashSet<i32>,
) {
    let type_marked =
        inherited || ty.attributes.iter().any(|a| options.attribute_matches(a));
    for method in &ty.methods {
        if is_continuable(method, type_marked, options) {
            tokens.insert(method.token(&ty.name));
        }
    }
    for nested in &ty.nested {
        collect_continuable(nested, type_marked, options, tokens);
    }
}

fn is_continuable(method: &MethodDef, type_marked: bool, options: &TransformOptions) -> bool {
    type_marked || method.attributes.iter().any(|a| options.attribute_matches(a))
}

fn rewrite_type(
    ty: &mut TypeDef,
    inherited: bool,
    options: &TransformOptions,
    continuable_tokens: &HashSet<i32>,
    catalog: &mut DescriptorCatalog,
    report: &mut RewriteReport,
) {
    let type_marked =
        inherited || ty.attributes.iter().any(|a| options.attribute_matches(a));
    let type_name = ty.name.clone();
    for method in &mut ty.methods {
        if !is_continuable(method, type_marked, options) {
            continue;
        }
        if method.is_abstract || method.body.is_none() {
            report.skipped_bodyless += 1;
            continue;
        }
        match transform_method(&type_name, method, options, continuable_tokens, catalog) {
            Ok(outcome) if outcome.was_transformed() => report.transformed.push(outcome),
            Ok(_) => report.unchanged += 1,
            Err(error) => {
                warn!("{}::{} failed to transform: {error}", type_name, method.name);
                report.failures.push(MethodFailure {
                    type_name: type_name.clone(),
                    method_name: method.name.clone(),
                    error,
                });
            }
        }
    }
    for nested in &mut ty.nested {
        rewrite_type(nested, type_marked, options, continuable_tokens, catalog, report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_types::bytecode::{MethodBody, MethodSig, Module, Opcode};
    use molt_types::{LocalVar, TypeSig};

    fn looping_method(name: &str, attributes: Vec<String>) -> MethodDef {
        MethodDef {
            name: name.into(),
            signature: MethodSig::default(),
            attributes,
            is_abstract: false,
            body: Some(MethodBody {
                locals: vec![LocalVar::new(TypeSig::I32)],
                handlers: vec![],
                instructions: vec![
                    Opcode::LdcI4(0),
                    Opcode::StLoc(0),
                    Opcode::LdLoc(0),
                    Opcode::LdcI4(9),
                    Opcode::Clt,
                    Opcode::BrFalse(11),
                    Opcode::LdLoc(0),
                    Opcode::LdcI4(1),
                    Opcode::Add,
                    Opcode::StLoc(0),
                    Opcode::Br(2),
                    Opcode::Ret,
                ],
            }),
        }
    }

    fn assembly(types: Vec<TypeDef>) -> Assembly {
        Assembly {
            name: molt_types::AssemblyId::new("demo"),
            modules: vec![Module {
                name: "main".into(),
                types,
            }],
        }
    }

    #[test]
    fn only_annotated_methods_are_touched() {
        let marked = looping_method("marked", vec!["Continuable".into()]);
        let plain = looping_method("plain", vec![]);
        let plain_before = plain.clone();
        let mut asm = assembly(vec![TypeDef {
            name: "T".into(),
            attributes: vec![],
            methods: vec![marked, plain],
            nested: vec![],
        }]);
        let mut catalog = DescriptorCatalog::new();
        let report =
            rewrite_assembly(&mut asm, &TransformOptions::default(), &mut catalog).unwrap();
        assert_eq!(report.transformed.len(), 1);
        assert_eq!(asm.modules[0].types[0].methods[1], plain_before);
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn type_level_annotation_covers_nested_types() {
        let mut asm = assembly(vec![TypeDef {
            name: "Outer".into(),
            attributes: vec!["Continuable".into()],
            methods: vec![looping_method("a", vec![])],
            nested: vec![TypeDef {
                name: "Outer.Inner".into(),
                attributes: vec![],
                methods: vec![looping_method("b", vec![])],
                nested: vec![],
            }],
        }]);
        let mut catalog = DescriptorCatalog::new();
        let report =
            rewrite_assembly(&mut asm, &TransformOptions::default(), &mut catalog).unwrap();
        assert_eq!(report.transformed.len(), 2);
    }

    #[test]
    fn abstract_and_bodyless_methods_are_skipped() {
        let mut no_body = looping_method("ghost", vec!["Continuable".into()]);
        no_body.body = None;
        let mut abstract_method = looping_method("virt", vec!["Continuable".into()]);
        abstract_method.is_abstract = true;
        let mut asm = assembly(vec![TypeDef {
            name: "T".into(),
            attributes: vec![],
            methods: vec![no_body, abstract_method],
            nested: vec![],
        }]);
        let mut catalog = DescriptorCatalog::new();
        let report =
            rewrite_assembly(&mut asm, &TransformOptions::default(), &mut catalog).unwrap();
        assert_eq!(report.transformed.len(), 0);
        assert_eq!(report.skipped_bodyless, 2);
    }

    #[test]
    fn failures_are_reported_per_method_and_others_still_transform() {
        let mut broken = looping_method("broken", vec!["Continuable".into()]);
        // Force a depth-mismatched join inside a loop.
        broken.body.as_mut().unwrap().instructions = vec![
            Opcode::LdcBool(true),
            Opcode::BrTrue(3),
            Opcode::LdcI4(5),
            Opcode::Pop,
            Opcode::Br(0),
        ];
        let good = looping_method("good", vec!["Continuable".into()]);
        let mut asm = assembly(vec![TypeDef {
            name: "T".into(),
            attributes: vec![],
            methods: vec![broken, good],
            nested: vec![],
        }]);
        let mut catalog = DescriptorCatalog::new();
        let report =
            rewrite_assembly(&mut asm, &TransformOptions::default(), &mut catalog).unwrap();
        assert_eq!(report.transformed.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].method_name, "broken");
    }

    #[test]
    fn all_failures_is_an_error() {
        let mut broken = looping_method("broken", vec!["Continuable".into()]);
        broken.body.as_mut().unwrap().instructions = vec![
            Opcode::LdcBool(true),
            Opcode::BrTrue(3),
            Opcode::LdcI4(5),
            Opcode::Pop,
            Opcode::Br(0),
        ];
        let mut asm = assembly(vec![TypeDef {
            name: "T".into(),
            attributes: vec![],
            methods: vec![broken],
            nested: vec![],
        }]);
        let mut catalog = DescriptorCatalog::new();
        let err =
            rewrite_assembly(&mut asm, &TransformOptions::default(), &mut catalog).unwrap_err();
        assert_eq!(err.failures.len(), 1);
    }
}
