//! Load-time error taxonomy.
//!
//! None of these are recovered locally: any error raised during phases 1–2
//! aborts the whole load. There is no partial cluster state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpecError {
    /// A `<<...>>` token that matches none of the four directive grammars.
    #[error("malformed directive token `{token}`: {reason}")]
    Grammar { token: String, reason: String },

    /// A dotted path that cannot be resolved against its root.
    #[error("cannot resolve segment `{segment}` of symbol `{symbol}`")]
    SymbolResolution { symbol: String, segment: String },

    /// A well-formed bracketed key whose directive has no key handler.
    #[error("unknown directive in key `{0}`")]
    UnknownDirective(String),

    /// A service names a parent that does not exist, names itself, or the
    /// parent graph contains a cycle.
    #[error("service graph error: {0}")]
    ServiceGraph(String),

    /// More machines requested for a service than the template provides.
    #[error("cannot assign {requested} machines from a collection of {available}")]
    AssignmentCardinality { requested: usize, available: usize },

    /// An `env` directive references a variable that is not set.
    #[error("environment variable `{0}` is not set")]
    EnvironmentLookup(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// The document tree has the wrong shape somewhere (non-mapping root,
    /// non-mapping directive value, negative count, ...).
    #[error("malformed specification: {0}")]
    Structure(String),
}

impl SpecError {
    pub fn structure(msg: impl Into<String>) -> Self {
        SpecError::Structure(msg.into())
    }
}
