//! Multi-phase cluster loader.
//!
//! Phase 1 parses the document directly and builds a cluster without touching
//! directives. Phase 2 re-walks the original text with the expander, using
//! the provisional cluster as resolution context, serializes the rewritten
//! tree back to YAML and runs phase 1 on it. Phase 3 applies the
//! defaults-level cloud assignment. A load either completes or fails whole;
//! the provisional cluster exists only to serve symbol resolution.

use super::error::SpecError;
use super::expander::{EnvLookup, Expander, ProcessEnv, UndefinedEnv};
use super::grammar;
use super::model::{Auth, CloudAssignment, Cluster, HostVars, Machine, ServiceGroup};
use rand::seq::index::sample;
use serde_yaml_ng::{Mapping, Value};
use tracing::{debug, warn};

/// Load a cluster from specification text with an injected environment.
pub fn load(
    text: &str,
    env: &dyn EnvLookup,
    undefined_env: UndefinedEnv,
) -> Result<Cluster, SpecError> {
    let provisional = phase1(text)?;
    let rewritten = rewrite(text, &provisional, env, undefined_env)?;
    let mut cluster = phase1(&rewritten)?;

    let doc: Value = serde_yaml_ng::from_str(&rewritten)?;
    let defaults = defaults_of(&doc);
    phase3(&mut cluster, &defaults);
    Ok(cluster)
}

impl Cluster {
    /// Load against the real process environment.
    pub fn load(text: &str) -> Result<Cluster, SpecError> {
        load(text, &ProcessEnv, UndefinedEnv::default())
    }
}

/// Phase 1: direct parse, no directive evaluation. Directive-shaped keys are
/// opaque to the loader functions and skipped.
pub fn phase1(text: &str) -> Result<Cluster, SpecError> {
    let doc: Value = serde_yaml_ng::from_str(text)?;
    let root = doc
        .as_mapping()
        .ok_or_else(|| SpecError::structure("specification root must be a mapping"))?;
    let defaults = defaults_of(&doc);

    let mut services = load_services(root.get("services"))?;
    let machines = load_machines(root.get("machines"), &mut services, &defaults)?;
    let vars = load_host_vars(root.get("host_vars"));

    Ok(Cluster {
        machines,
        services,
        cloud: defaults.get("cloud").and_then(Value::as_str).map(String::from),
        vars,
    })
}

/// The expander half of phase 2: rewrite the original text against the
/// provisional cluster, producing new specification text.
pub fn rewrite(
    text: &str,
    provisional: &Cluster,
    env: &dyn EnvLookup,
    undefined_env: UndefinedEnv,
) -> Result<String, SpecError> {
    let doc: Value = serde_yaml_ng::from_str(text)?;
    let mut expander = Expander::new(provisional, env);
    expander.undefined_env = undefined_env;
    let transformed = expander.expand(&doc)?;
    let rewritten = serde_yaml_ng::to_string(&transformed)?;
    debug!(rewritten = %rewritten, "expanded specification");
    Ok(rewritten)
}

/// Phase 3: when `defaults.cloud` names a cloud, every machine's parameter
/// block is assigned from `defaults.provider.<cloud>`. Last writer wins; a
/// differing earlier assignment is only worth a warning.
pub fn phase3(cluster: &mut Cluster, defaults: &Value) {
    let Some(cloud_name) = defaults.get("cloud").and_then(Value::as_str) else {
        return;
    };
    let params = cloud_params(defaults, cloud_name);
    for machine in &mut cluster.machines {
        if let Some(existing) = &machine.cloud {
            if existing.name != cloud_name {
                warn!(
                    machine = %machine.name,
                    from = %existing.name,
                    to = cloud_name,
                    "overwriting cloud assignment"
                );
            }
        }
        machine.cloud = Some(CloudAssignment {
            name: cloud_name.to_string(),
            params: params.clone(),
        });
    }
    cluster.cloud = Some(cloud_name.to_string());
}

fn defaults_of(doc: &Value) -> Value {
    doc.get("defaults")
        .cloned()
        .unwrap_or_else(|| Value::Mapping(Mapping::new()))
}

fn cloud_params(defaults: &Value, cloud: &str) -> Value {
    defaults
        .get("provider")
        .and_then(|p| p.get(cloud))
        .cloned()
        .unwrap_or(Value::Null)
}

fn load_services(node: Option<&Value>) -> Result<ServiceGroup, SpecError> {
    let mut group = ServiceGroup::default();
    let Some(map) = node.and_then(Value::as_mapping) else {
        return Ok(group);
    };

    for key in map.keys() {
        let name = service_key(key)?;
        let Some(name) = name else { continue };
        group.insert(name);
    }

    for (key, parents) in map {
        let Some(name) = service_key(key)? else { continue };
        if parents.is_null() {
            continue;
        }
        let parents = parents.as_sequence().ok_or_else(|| {
            SpecError::structure(format!("service `{}` parents must be a list", name))
        })?;
        for parent in parents {
            let parent = parent.as_str().ok_or_else(|| {
                SpecError::structure(format!("service `{}` has a non-string parent", name))
            })?;
            group.link_parent(name, parent)?;
        }
    }

    group.check_acyclic()?;
    Ok(group)
}

/// A service mapping key as a name; `None` for directive keys, which are
/// opaque in phase 1.
fn service_key(key: &Value) -> Result<Option<&str>, SpecError> {
    let name = key
        .as_str()
        .ok_or_else(|| SpecError::structure("service names must be strings"))?;
    if grammar::is_directive_key(name) {
        return Ok(None);
    }
    Ok(Some(name))
}

fn load_machines(
    node: Option<&Value>,
    services: &mut ServiceGroup,
    defaults: &Value,
) -> Result<Vec<Machine>, SpecError> {
    let mut machines = Vec::new();
    let Some(map) = node.and_then(Value::as_mapping) else {
        return Ok(machines);
    };

    for (key, template) in map {
        let name = key
            .as_str()
            .ok_or_else(|| SpecError::structure("machine-template names must be strings"))?;
        if grammar::is_directive_key(name) {
            continue;
        }
        let empty = Mapping::new();
        let template = match template {
            Value::Null => &empty,
            Value::Mapping(m) => m,
            _ => {
                return Err(SpecError::structure(format!(
                    "machine-template `{}` must be a mapping",
                    name
                )))
            }
        };

        let mut collection = MachineCollection::from_template(name, template, defaults)?;
        debug!(template = name, count = collection.len(), "expanded machine-template");

        if let Some(assignments) = template.get("services") {
            let assignments = assignments.as_mapping().ok_or_else(|| {
                SpecError::structure(format!(
                    "services of machine-template `{}` must be a mapping",
                    name
                ))
            })?;
            for (service, node) in assignments {
                let service = service.as_str().ok_or_else(|| {
                    SpecError::structure("service assignment keys must be strings")
                })?;
                let how_many = assignment_count(service, node, collection.len())?;
                collection.assign(how_many, service, services)?;
            }
        }

        machines.append(&mut collection.machines);
    }
    Ok(machines)
}

/// The requested machine count for one service assignment. An absent
/// `assign` key defaults to the whole collection; a present key must be a
/// non-negative integer.
fn assignment_count(service: &str, node: &Value, default: usize) -> Result<usize, SpecError> {
    let map = match node {
        Value::Null => return Ok(default),
        Value::Mapping(m) => m,
        _ => {
            return Err(SpecError::structure(format!(
                "assignment to service `{}` must be a mapping",
                service
            )))
        }
    };
    match map.get("assign") {
        None => Ok(default),
        Some(v) => v.as_u64().map(|n| n as usize).ok_or_else(|| {
            SpecError::structure(format!(
                "assign for service `{}` must be a non-negative integer",
                service
            ))
        }),
    }
}

fn load_host_vars(node: Option<&Value>) -> Vec<HostVars> {
    match node {
        Some(vars) if !vars.is_null() => vec![HostVars {
            kind: "host_vars".to_string(),
            vars: vars.clone(),
        }],
        _ => Vec::new(),
    }
}

/// The ordered machines generated from one machine-template. Loader-internal.
struct MachineCollection {
    machines: Vec<Machine>,
}

impl MachineCollection {
    fn from_template(
        name: &str,
        template: &Mapping,
        defaults: &Value,
    ) -> Result<Self, SpecError> {
        let count = match template.get("count") {
            None => 1,
            Some(v) => v.as_u64().ok_or_else(|| {
                SpecError::structure(format!(
                    "count of machine-template `{}` must be a non-negative integer",
                    name
                ))
            })?,
        };

        let default_auth = defaults.get("auth");
        let auth = Auth {
            public_key: string_field(template.get("public_key"))
                .or_else(|| string_field(default_auth.and_then(|a| a.get("public_key")))),
            private_key: string_field(template.get("private_key"))
                .or_else(|| string_field(default_auth.and_then(|a| a.get("private_key")))),
        };

        let cloud_name = string_field(template.get("cloud"))
            .or_else(|| string_field(defaults.get("cloud")));
        let cloud = cloud_name.map(|cloud| CloudAssignment {
            params: cloud_params(defaults, &cloud),
            name: cloud,
        });

        let machines = (0..count)
            .map(|i| {
                let mut machine = Machine::new(format!("{}{:02}", name, i));
                machine.auth = auth.clone();
                machine.cloud = cloud.clone();
                machine.defaults = defaults.clone();
                machine
            })
            .collect();
        Ok(MachineCollection { machines })
    }

    fn len(&self) -> usize {
        self.machines.len()
    }

    /// Add `number` distinct machines to `service` (and its ancestors).
    /// The whole collection when `number` equals its size, otherwise an
    /// unbiased sample without replacement.
    fn assign(
        &mut self,
        number: usize,
        service: &str,
        services: &mut ServiceGroup,
    ) -> Result<(), SpecError> {
        let size = self.machines.len();
        if number > size {
            return Err(SpecError::AssignmentCardinality {
                requested: number,
                available: size,
            });
        }
        let chosen: Vec<usize> = if number == size {
            (0..size).collect()
        } else {
            sample(&mut rand::thread_rng(), size, number).into_vec()
        };
        for i in chosen {
            services.add_machine(&mut self.machines[i], service)?;
        }
        Ok(())
    }
}

fn string_field(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(String::from)
}
