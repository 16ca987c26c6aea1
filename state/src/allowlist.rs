//! Type allow-list and name resolution.
//!
//! The allow-list is the transitively closed set of types that may appear in
//! captured slots or yielded values: the distinguished primitives, the
//! common value types, enumerations, arrays of admitted element types,
//! nullables of admitted value types, and anything explicitly registered.
//! Resolution of unregistered names fails closed: nothing is looked up from
//! the ambient environment.

use std::collections::{HashMap, HashSet};

use molt_types::TypeSig;
use once_cell::sync::Lazy;

/// Built-in alias table; bijective with the primitive signatures.
static ALIASES: Lazy<Vec<(&'static str, TypeSig)>> = Lazy::new(|| {
    vec![
        ("bool", TypeSig::Bool),
        ("sbyte", TypeSig::I8),
        ("byte", TypeSig::U8),
        ("short", TypeSig::I16),
        ("ushort", TypeSig::U16),
        ("int", TypeSig::I32),
        ("uint", TypeSig::U32),
        ("long", TypeSig::I64),
        ("ulong", TypeSig::U64),
        ("float", TypeSig::F32),
        ("double", TypeSig::F64),
        ("char", TypeSig::Char),
        ("string", TypeSig::Str),
        ("decimal", TypeSig::Decimal),
        ("date", TypeSig::Date),
        ("timespan", TypeSig::TimeSpan),
        ("guid", TypeSig::Guid),
        ("dateoffset", TypeSig::DateOffset),
    ]
});

/// The documented aliases, for enumeration and bijection checks.
pub fn documented_aliases() -> impl Iterator<Item = &'static str> {
    ALIASES.iter().map(|(alias, _)| *alias)
}

/// Transitively closed set of admitted types. Additive; no removals.
#[derive(Debug, Default)]
pub struct TypeAllowList {
    registered: HashSet<TypeSig>,
    registered_names: HashSet<String>,
}

impl TypeAllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits an additional type.
    pub fn register(&mut self, ty: TypeSig) {
        self.registered.insert(ty);
    }

    /// Admits an additional type by full name.
    pub fn register_name<S: Into<String>>(&mut self, name: S) {
        self.registered_names.insert(name.into());
    }

    /// Whether `ty` may appear in captured slots or yielded values.
    pub fn is_allowed(&self, ty: &TypeSig) -> bool {
        match ty {
            TypeSig::Bool
            | TypeSig::I8
            | TypeSig::U8
            | TypeSig::I16
            | TypeSig::U16
            | TypeSig::I32
            | TypeSig::U32
            | TypeSig::I64
            | TypeSig::U64
            | TypeSig::F32
            | TypeSig::F64
            | TypeSig::Char
            | TypeSig::Str
            | TypeSig::Decimal
            | TypeSig::Date
            | TypeSig::TimeSpan
            | TypeSig::Guid
            | TypeSig::DateOffset => true,
            TypeSig::Enum(_) => true,
            TypeSig::Array(elem) => self.is_allowed(elem),
            TypeSig::Nullable(inner) => inner.is_value_type() && self.is_allowed(inner),
            TypeSig::Named(name) => {
                self.registered_names.contains(name) || self.registered.contains(ty)
            }
            TypeSig::Any => false,
        }
    }
}

/// Custom resolution hook.
pub type ResolverFn = Box<dyn Fn(&str) -> Option<TypeSig>>;

/// Maps short aliases to types and back, with optional registrations and
/// chained custom resolvers. Built-in alias lookup takes precedence over
/// custom functions; unknown names resolve to nothing.
#[derive(Default)]
pub struct TypeResolver {
    registered: HashMap<String, TypeSig>,
    custom: Vec<ResolverFn>,
}

impl TypeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a name; subsequent `resolve` calls will produce `ty`.
    pub fn register<S: Into<String>>(&mut self, name: S, ty: TypeSig) {
        self.registered.insert(name.into(), ty);
    }

    /// Appends a custom resolver consulted after built-ins and
    /// registrations.
    pub fn add_resolver(&mut self, resolver: ResolverFn) {
        self.custom.push(resolver);
    }

    /// Resolves a name to a type; fails closed for unregistered names.
    pub fn resolve(&self, name: &str) -> Option<TypeSig> {
        if let Some((_, ty)) = ALIASES.iter().find(|(alias, _)| *alias == name) {
            return Some(ty.clone());
        }
        if let Some(ty) = self.registered.get(name) {
            return Some(ty.clone());
        }
        self.custom.iter().find_map(|resolver| resolver(name))
    }

    /// Renders a type back to its alias (or canonical name).
    pub fn name_of(&self, ty: &TypeSig) -> String {
        if let Some((alias, _)) = ALIASES.iter().find(|(_, sig)| sig == ty) {
            return (*alias).to_string();
        }
        ty.render_name()
    }
}
