//! Directive expander: the tree-rewriting visitor.
//!
//! `expand` deep-copies the document, then walks it. Mapping nodes are
//! scanned for directive keys until every key present (including keys a
//! directive injected) has been processed once; the scan visits unseen keys
//! in sorted textual order so documents with several directives in one
//! mapping rewrite deterministically. After the key pass, values are expanded
//! recursively. String scalars go through embedded `env` substitution.
//!
//! `inherit` resolves against a snapshot of the document root taken when the
//! expansion starts; `index` and `forall` resolve against the live context
//! (the provisional cluster).

use super::error::SpecError;
use super::grammar::{self, Directive};
use super::symbols::{self, Symbol, Symbolic};
use rustc_hash::FxHashSet;
use serde_yaml_ng::{Mapping, Value};
use tracing::debug;

/// Injected environment lookup, so expansion stays deterministic under test.
pub trait EnvLookup {
    fn get(&self, name: &str) -> Option<String>;
}

/// The real process environment.
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvLookup for std::collections::HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        std::collections::HashMap::get(self, name).cloned()
    }
}

/// Policy for `env` directives naming an unset variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UndefinedEnv {
    /// Abort the load. The default.
    #[default]
    Error,
    /// Substitute an empty string.
    EmptyString,
}

/// Rewrites a specification document by applying its directives.
pub struct Expander<'a> {
    pub context: &'a dyn Symbolic,
    pub env: &'a dyn EnvLookup,
    pub undefined_env: UndefinedEnv,
}

impl<'a> Expander<'a> {
    pub fn new(context: &'a dyn Symbolic, env: &'a dyn EnvLookup) -> Self {
        Expander {
            context,
            env,
            undefined_env: UndefinedEnv::default(),
        }
    }

    /// Expand every directive in `doc`, leaving the input untouched.
    pub fn expand(&self, doc: &Value) -> Result<Value, SpecError> {
        let snapshot = doc.clone();
        self.visit(doc.clone(), &snapshot)
    }

    fn visit(&self, node: Value, root: &Value) -> Result<Value, SpecError> {
        match node {
            Value::Mapping(m) => self.visit_mapping(m, root).map(Value::Mapping),
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|item| self.visit(item, root))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Sequence),
            Value::String(s) => self.visit_string(&s).map(Value::String),
            other => Ok(other),
        }
    }

    fn visit_mapping(&self, mut node: Mapping, root: &Value) -> Result<Mapping, SpecError> {
        let mut seen: FxHashSet<String> = FxHashSet::default();
        loop {
            let mut unseen: Vec<&str> = node
                .keys()
                .filter_map(Value::as_str)
                .filter(|k| !seen.contains(*k))
                .collect();
            unseen.sort_unstable();
            let Some(key) = unseen.first().map(|k| k.to_string()) else {
                break;
            };
            if grammar::is_directive_key(&key) {
                node = self.apply_key_directive(node, &key, root)?;
            }
            seen.insert(key);
        }

        let mut out = Mapping::new();
        for (key, value) in node {
            out.insert(key, self.visit(value, root)?);
        }
        Ok(out)
    }

    fn apply_key_directive(
        &self,
        node: Mapping,
        key: &str,
        root: &Value,
    ) -> Result<Mapping, SpecError> {
        let directive = grammar::parse_token(key)?;
        debug!(key, "applying directive");
        match directive {
            Directive::Inherit { symbol } => self.inherit(node, key, &symbol, root),
            Directive::Index {
                symbol,
                attribute,
                start,
            } => self.index(node, key, &symbol, &attribute, start),
            Directive::Forall { symbol, attribute } => {
                self.forall(node, key, &symbol, attribute.as_deref())
            }
            // env substitutes inside strings; it is not a key handler.
            Directive::Env { .. } => Err(SpecError::UnknownDirective(key.to_string())),
        }
    }

    /// The node becomes a copy of the referenced document node, overridden by
    /// any keys the node already defined.
    fn inherit(
        &self,
        node: Mapping,
        key: &str,
        symbol: &str,
        root: &Value,
    ) -> Result<Mapping, SpecError> {
        let source = symbols::resolve(Symbol::Value(root), symbol)?;
        let source = match source {
            Symbol::Value(Value::Mapping(m)) => m.clone(),
            _ => {
                return Err(SpecError::structure(format!(
                    "`inherit` target `{}` is not a mapping",
                    symbol
                )))
            }
        };

        let mut merged = source;
        for (k, v) in node {
            if k.as_str() == Some(key) {
                continue;
            }
            merged.insert(k, v);
        }
        Ok(merged)
    }

    /// For every element of a context sequence, generate a per-element entry
    /// keyed by the element's attribute, carrying the element's positional
    /// index (enumerated from `start`) under each declared variable name.
    fn index(
        &self,
        node: Mapping,
        key: &str,
        symbol: &str,
        attribute: &str,
        start: usize,
    ) -> Result<Mapping, SpecError> {
        let elements = self.context_sequence(symbol)?;
        let variables: Vec<Value> = directive_variables(&node, key)?.keys().cloned().collect();

        let mut out = without_key(node, key);
        for variable in &variables {
            for (offset, element) in elements.iter().enumerate() {
                let entry_key = element_key(element.clone(), Some(attribute))?;
                let slot = ensure_mapping(&mut out, entry_key)?;
                slot.insert(variable.clone(), Value::from((start + offset) as u64));
            }
        }
        Ok(out)
    }

    /// Broadcast each declared literal to a generated entry per element of a
    /// context sequence.
    fn forall(
        &self,
        node: Mapping,
        key: &str,
        symbol: &str,
        attribute: Option<&str>,
    ) -> Result<Mapping, SpecError> {
        let elements = self.context_sequence(symbol)?;
        let variables: Vec<(Value, Value)> = directive_variables(&node, key)?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut out = without_key(node, key);
        for (variable, literal) in &variables {
            for element in &elements {
                let entry_key = element_key(element.clone(), attribute)?;
                let slot = ensure_mapping(&mut out, entry_key)?;
                slot.insert(variable.clone(), literal.clone());
            }
        }
        Ok(out)
    }

    fn context_sequence(&self, symbol: &str) -> Result<Vec<Symbol<'a>>, SpecError> {
        let resolved = symbols::resolve(Symbol::Object(self.context), symbol)?;
        resolved.into_elements().ok_or_else(|| {
            SpecError::structure(format!("symbol `{}` does not name a sequence", symbol))
        })
    }

    fn visit_string(&self, s: &str) -> Result<String, SpecError> {
        let tokens = grammar::embedded_tokens(s);
        if tokens.is_empty() {
            return Ok(s.to_string());
        }

        let mut out = String::with_capacity(s.len());
        let mut last = 0;
        for (range, token) in tokens {
            let name = match grammar::parse_token(token)? {
                Directive::Env { name } => name,
                _ => {
                    return Err(SpecError::Grammar {
                        token: token.to_string(),
                        reason: "only env directives may appear inside string values".to_string(),
                    })
                }
            };
            let value = match self.env.get(&name) {
                Some(v) => v,
                None => match self.undefined_env {
                    UndefinedEnv::Error => return Err(SpecError::EnvironmentLookup(name)),
                    UndefinedEnv::EmptyString => String::new(),
                },
            };
            out.push_str(&s[last..range.start]);
            out.push_str(&value);
            last = range.end;
        }
        out.push_str(&s[last..]);
        Ok(out)
    }
}

/// The directive's value, which must be a mapping of variable declarations.
fn directive_variables<'n>(node: &'n Mapping, key: &str) -> Result<&'n Mapping, SpecError> {
    node.get(key)
        .and_then(Value::as_mapping)
        .ok_or_else(|| {
            SpecError::structure(format!("the value under `{}` must be a mapping", key))
        })
}

fn without_key(node: Mapping, key: &str) -> Mapping {
    node.into_iter()
        .filter(|(k, _)| k.as_str() != Some(key))
        .collect()
}

/// The generated entry key for one sequence element: its attribute value, or
/// the element itself when no attribute was given.
fn element_key(element: Symbol<'_>, attribute: Option<&str>) -> Result<Value, SpecError> {
    let resolved = match attribute {
        Some(attribute) => symbols::resolve(element, attribute)?,
        None => element,
    };
    resolved.as_scalar().ok_or_else(|| {
        SpecError::structure(
            "a generated entry key must be a scalar; specify an attribute".to_string(),
        )
    })
}

/// Get (or create) the sub-mapping at `key`, erroring if a non-mapping value
/// already sits there.
fn ensure_mapping<'m>(node: &'m mut Mapping, key: Value) -> Result<&'m mut Mapping, SpecError> {
    if !node.contains_key(&key) {
        node.insert(key.clone(), Value::Mapping(Mapping::new()));
    }
    match node.get_mut(&key) {
        Some(Value::Mapping(m)) => Ok(m),
        _ => Err(SpecError::structure(format!(
            "generated key {:?} collides with a non-mapping value",
            key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Cluster, Machine};
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn cluster_with_machines(names: &[&str]) -> Cluster {
        let mut cluster = Cluster::default();
        cluster.services.insert("nodes");
        for name in names {
            let mut m = Machine::new(*name);
            cluster.services.add_machine(&mut m, "nodes").unwrap();
            cluster.machines.push(m);
        }
        cluster
    }

    fn expand_with(cluster: &Cluster, env: &HashMap<String, String>, yaml: &str) -> Value {
        let doc: Value = serde_yaml_ng::from_str(yaml).unwrap();
        Expander::new(cluster, env).expand(&doc).unwrap()
    }

    #[test]
    fn test_identity_without_directives() {
        let cluster = Cluster::default();
        let vars = env(&[]);
        let yaml = "a:\n  b: [1, 2, three]\nc: true\n";
        let doc: Value = serde_yaml_ng::from_str(yaml).unwrap();
        let out = Expander::new(&cluster, &vars).expand(&doc).unwrap();
        assert_eq!(out, doc);
    }

    #[test]
    fn test_env_substitution() {
        let cluster = Cluster::default();
        let vars = env(&[("OS_PROJECT_NAME", "demo")]);
        let out = expand_with(&cluster, &vars, "network: <<env:OS_PROJECT_NAME>>-net\n");
        assert_eq!(
            out.get("network").unwrap(),
            &Value::String("demo-net".to_string())
        );
    }

    #[test]
    fn test_env_multiple_occurrences() {
        let cluster = Cluster::default();
        let vars = env(&[("A", "x"), ("B", "y")]);
        let out = expand_with(&cluster, &vars, "v: <<env:A>>-<<env:B>>-<<env:A>>\n");
        assert_eq!(out.get("v").unwrap(), &Value::String("x-y-x".to_string()));
    }

    #[test]
    fn test_env_undefined_is_error_by_default() {
        let cluster = Cluster::default();
        let vars = env(&[]);
        let doc: Value = serde_yaml_ng::from_str("v: <<env:MISSING>>\n").unwrap();
        let err = Expander::new(&cluster, &vars).expand(&doc).unwrap_err();
        assert!(matches!(err, SpecError::EnvironmentLookup(name) if name == "MISSING"));
    }

    #[test]
    fn test_env_undefined_empty_string_policy() {
        let cluster = Cluster::default();
        let vars = env(&[]);
        let doc: Value = serde_yaml_ng::from_str("v: a<<env:MISSING>>b\n").unwrap();
        let mut expander = Expander::new(&cluster, &vars);
        expander.undefined_env = UndefinedEnv::EmptyString;
        let out = expander.expand(&doc).unwrap();
        assert_eq!(out.get("v").unwrap(), &Value::String("ab".to_string()));
    }

    #[test]
    fn test_non_env_directive_in_string_is_error() {
        let cluster = Cluster::default();
        let vars = env(&[]);
        let doc: Value = serde_yaml_ng::from_str("v: \"<<inherit:defaults>>\"\n").unwrap();
        let err = Expander::new(&cluster, &vars).expand(&doc).unwrap_err();
        assert!(matches!(err, SpecError::Grammar { .. }));
    }

    #[test]
    fn test_input_document_untouched() {
        let cluster = Cluster::default();
        let vars = env(&[("A", "x")]);
        let doc: Value = serde_yaml_ng::from_str("v: <<env:A>>\n").unwrap();
        let before = doc.clone();
        Expander::new(&cluster, &vars).expand(&doc).unwrap();
        assert_eq!(doc, before);
    }

    #[test]
    fn test_inherit_merges_and_overrides() {
        let cluster = Cluster::default();
        let vars = env(&[]);
        let out = expand_with(
            &cluster,
            &vars,
            "base:\n  flavor: m1.large\n  image: ubuntu\nnode:\n  <<inherit:base>>: ~\n  image: debian\n",
        );
        let node = out.get("node").unwrap();
        assert_eq!(
            node.get("flavor").unwrap(),
            &Value::String("m1.large".to_string())
        );
        // the node's own key wins on collision
        assert_eq!(
            node.get("image").unwrap(),
            &Value::String("debian".to_string())
        );
        assert!(node.get("<<inherit:base>>").is_none());
    }

    #[test]
    fn test_inherit_dotted_source() {
        let cluster = Cluster::default();
        let vars = env(&[]);
        let out = expand_with(
            &cluster,
            &vars,
            "defaults:\n  provider:\n    east:\n      flavor: m1.small\nnode:\n  <<inherit:defaults.provider.east>>: ~\n",
        );
        assert_eq!(
            out.get("node").unwrap().get("flavor").unwrap(),
            &Value::String("m1.small".to_string())
        );
    }

    #[test]
    fn test_inherited_directives_are_rescanned() {
        // base injects an env reference that must still expand
        let cluster = Cluster::default();
        let vars = env(&[("ZONE", "east")]);
        let out = expand_with(
            &cluster,
            &vars,
            "base:\n  region: <<env:ZONE>>-1\nnode:\n  <<inherit:base>>: ~\n",
        );
        assert_eq!(
            out.get("node").unwrap().get("region").unwrap(),
            &Value::String("east-1".to_string())
        );
    }

    #[test]
    fn test_index_generates_contiguous_range() {
        let cluster = cluster_with_machines(&["zk00", "zk01", "zk02"]);
        let vars = env(&[]);
        let out = expand_with(
            &cluster,
            &vars,
            "host_vars:\n  \"<<index:machines:name:1>>\":\n    myid: {}\n",
        );
        let hosts = out.get("host_vars").unwrap();
        for (i, name) in ["zk00", "zk01", "zk02"].iter().enumerate() {
            assert_eq!(
                hosts.get(name).unwrap().get("myid").unwrap(),
                &Value::from((i + 1) as u64),
                "wrong index for {}",
                name
            );
        }
        assert!(hosts.get("<<index:machines:name:1>>").is_none());
    }

    #[test]
    fn test_index_multiple_variables() {
        let cluster = cluster_with_machines(&["a00", "a01"]);
        let vars = env(&[]);
        let out = expand_with(
            &cluster,
            &vars,
            "vars:\n  \"<<index:machines:name:0>>\":\n    myid: {}\n    broker_id: {}\n",
        );
        let a01 = out.get("vars").unwrap().get("a01").unwrap();
        assert_eq!(a01.get("myid").unwrap(), &Value::from(1u64));
        assert_eq!(a01.get("broker_id").unwrap(), &Value::from(1u64));
    }

    #[test]
    fn test_forall_broadcasts_literal() {
        let cluster = cluster_with_machines(&["db00", "db01"]);
        let vars = env(&[]);
        let out = expand_with(
            &cluster,
            &vars,
            "vars:\n  \"<<forall:machines:name>>\":\n    role: storage\n",
        );
        let hosts = out.get("vars").unwrap();
        for name in ["db00", "db01"] {
            assert_eq!(
                hosts.get(name).unwrap().get("role").unwrap(),
                &Value::String("storage".to_string())
            );
        }
    }

    #[test]
    fn test_forall_without_attribute_uses_element() {
        // machine service sets resolve to plain name sequences
        let cluster = cluster_with_machines(&["db00"]);
        let vars = env(&[]);
        let out = expand_with(
            &cluster,
            &vars,
            "vars:\n  \"<<forall:services.nodes.machines>>\":\n    managed: true\n",
        );
        assert_eq!(
            out.get("vars").unwrap().get("db00").unwrap().get("managed").unwrap(),
            &Value::Bool(true)
        );
    }

    #[test]
    fn test_forall_over_service_group() {
        let mut cluster = Cluster::default();
        cluster.services.insert("zk");
        cluster.services.insert("web");
        let vars = env(&[]);
        let out = expand_with(
            &cluster,
            &vars,
            "group_vars:\n  \"<<forall:services:name>>\":\n    managed: true\n",
        );
        let groups = out.get("group_vars").unwrap();
        assert!(groups.get("zk").is_some());
        assert!(groups.get("web").is_some());
    }

    #[test]
    fn test_existing_sibling_entries_survive() {
        let cluster = cluster_with_machines(&["zk00"]);
        let vars = env(&[]);
        let out = expand_with(
            &cluster,
            &vars,
            "vars:\n  zk00:\n    ip: 10.0.0.5\n  \"<<forall:machines:name>>\":\n    role: zk\n",
        );
        let zk00 = out.get("vars").unwrap().get("zk00").unwrap();
        assert_eq!(zk00.get("ip").unwrap(), &Value::String("10.0.0.5".to_string()));
        assert_eq!(zk00.get("role").unwrap(), &Value::String("zk".to_string()));
    }

    #[test]
    fn test_unknown_key_directive_is_fatal() {
        let cluster = Cluster::default();
        let vars = env(&[]);
        let doc: Value = serde_yaml_ng::from_str("a:\n  \"<<bogus:x>>\": {}\n").unwrap();
        let err = Expander::new(&cluster, &vars).expand(&doc).unwrap_err();
        assert!(matches!(err, SpecError::UnknownDirective(_)));
    }

    #[test]
    fn test_env_key_directive_is_rejected() {
        let cluster = Cluster::default();
        let vars = env(&[("X", "v")]);
        let doc: Value = serde_yaml_ng::from_str("a:\n  \"<<env:X>>\": {}\n").unwrap();
        let err = Expander::new(&cluster, &vars).expand(&doc).unwrap_err();
        assert!(matches!(err, SpecError::UnknownDirective(_)));
    }

    #[test]
    fn test_directive_value_must_be_mapping() {
        let cluster = cluster_with_machines(&["a00"]);
        let vars = env(&[]);
        let doc: Value =
            serde_yaml_ng::from_str("a:\n  \"<<forall:machines:name>>\": just-a-string\n").unwrap();
        let err = Expander::new(&cluster, &vars).expand(&doc).unwrap_err();
        assert!(matches!(err, SpecError::Structure(_)));
    }

    #[test]
    fn test_unresolvable_context_symbol() {
        let cluster = Cluster::default();
        let vars = env(&[]);
        let doc: Value =
            serde_yaml_ng::from_str("a:\n  \"<<forall:nonsense:name>>\": {}\n").unwrap();
        let err = Expander::new(&cluster, &vars).expand(&doc).unwrap_err();
        assert!(matches!(err, SpecError::SymbolResolution { .. }));
    }

    #[test]
    fn test_strings_inside_sequences_expand() {
        let cluster = Cluster::default();
        let vars = env(&[("P", "demo")]);
        let out = expand_with(&cluster, &vars, "nets:\n  - <<env:P>>-a\n  - <<env:P>>-b\n");
        let nets = out.get("nets").unwrap().as_sequence().unwrap();
        assert_eq!(nets[0], Value::String("demo-a".to_string()));
        assert_eq!(nets[1], Value::String("demo-b".to_string()));
    }
}
