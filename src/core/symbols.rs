//! Symbol resolution: dotted paths over documents and the live object graph.
//!
//! A symbol like `services.zookeepernodes.machines` is resolved by stepping
//! one segment at a time. Document nodes step by keyed lookup; model objects
//! (cluster, service group, service, machine) step through the [`Symbolic`]
//! capability trait. Empty segments from leading/trailing dots are skipped.

use super::error::SpecError;
use serde_yaml_ng::Value;

/// A value reachable during symbol resolution.
#[derive(Clone)]
pub enum Symbol<'a> {
    /// A live model object that resolves members by name.
    Object(&'a dyn Symbolic),
    /// An ordered sequence of resolvable elements.
    Sequence(Vec<Symbol<'a>>),
    /// A scalar produced by an object member.
    Text(String),
    /// A node of a document tree.
    Value(&'a Value),
}

// Not derivable over `&dyn Symbolic`; objects render opaquely.
impl std::fmt::Debug for Symbol<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Symbol::Object(_) => f.write_str("Object(..)"),
            Symbol::Sequence(elements) => f.debug_tuple("Sequence").field(elements).finish(),
            Symbol::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Symbol::Value(v) => f.debug_tuple("Value").field(v).finish(),
        }
    }
}

/// Member lookup for live model objects.
pub trait Symbolic {
    /// Resolve a named member, if present.
    fn member(&self, name: &str) -> Option<Symbol<'_>>;

    /// The object viewed as an ordered sequence, if it has one.
    fn elements(&self) -> Option<Vec<Symbol<'_>>> {
        None
    }
}

/// Resolve a dotted `symbol` starting from `start`.
pub fn resolve<'a>(start: Symbol<'a>, symbol: &str) -> Result<Symbol<'a>, SpecError> {
    let mut current = start;
    for segment in symbol.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = step(current, segment).ok_or_else(|| SpecError::SymbolResolution {
            symbol: symbol.to_string(),
            segment: segment.to_string(),
        })?;
    }
    Ok(current)
}

fn step<'a>(current: Symbol<'a>, segment: &str) -> Option<Symbol<'a>> {
    match current {
        Symbol::Object(obj) => obj.member(segment),
        Symbol::Value(value) => value.as_mapping()?.get(segment).map(Symbol::Value),
        // Scalars and sequences have no members to step into.
        Symbol::Text(_) | Symbol::Sequence(_) => None,
    }
}

impl<'a> Symbol<'a> {
    /// The symbol as an ordered sequence, for `index`/`forall` enumeration.
    pub fn into_elements(self) -> Option<Vec<Symbol<'a>>> {
        match self {
            Symbol::Sequence(elements) => Some(elements),
            Symbol::Object(obj) => obj.elements(),
            Symbol::Value(Value::Sequence(seq)) => Some(seq.iter().map(Symbol::Value).collect()),
            _ => None,
        }
    }

    /// The symbol as a scalar document value, usable as a mapping key.
    pub fn as_scalar(&self) -> Option<Value> {
        match self {
            Symbol::Text(s) => Some(Value::String(s.clone())),
            Symbol::Value(v) if !v.is_mapping() && !v.is_sequence() => Some((*v).clone()),
            _ => None,
        }
    }
}
