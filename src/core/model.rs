//! The cluster object graph: services, machines, and the cluster that owns
//! them.
//!
//! Services form a directed parent graph. The graph is checked for cycles at
//! construction time, so the transitive membership closure in
//! [`ServiceGroup::add_machine`] always terminates. All types serialize to
//! YAML for the on-disk state store.

use super::error::SpecError;
use super::symbols::{Symbol, Symbolic};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml_ng::Value;
use std::collections::BTreeSet;
use std::collections::VecDeque;

/// Internal and optional external IPv4 address of a machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub internal: Option<String>,
    #[serde(default)]
    pub external: Option<String>,
}

impl Address {
    pub fn set_internal(&mut self, ip: &str) -> Result<(), SpecError> {
        validate_ipv4(ip)?;
        self.internal = Some(ip.to_string());
        Ok(())
    }

    pub fn set_external(&mut self, ip: &str) -> Result<(), SpecError> {
        validate_ipv4(ip)?;
        self.external = Some(ip.to_string());
        Ok(())
    }
}

fn validate_ipv4(ip: &str) -> Result<(), SpecError> {
    ip.parse::<std::net::Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| SpecError::structure(format!("`{}` is not an IPv4 address", ip)))
}

impl Symbolic for Address {
    fn member(&self, name: &str) -> Option<Symbol<'_>> {
        match name {
            "internal" => self.internal.clone().map(Symbol::Text),
            "external" => self.external.clone().map(Symbol::Text),
            _ => None,
        }
    }
}

/// Key-pair paths used to reach a machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
}

/// A cloud name together with its resolved parameter block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudAssignment {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

/// A named group of machines. Membership propagates to every ancestor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub parents: BTreeSet<String>,
    #[serde(default)]
    pub machines: BTreeSet<String>,
}

impl Symbolic for Service {
    fn member(&self, name: &str) -> Option<Symbol<'_>> {
        match name {
            "name" => Some(Symbol::Text(self.name.clone())),
            "machines" => Some(Symbol::Sequence(
                self.machines.iter().cloned().map(Symbol::Text).collect(),
            )),
            "parents" => Some(Symbol::Sequence(
                self.parents.iter().cloned().map(Symbol::Text).collect(),
            )),
            _ => None,
        }
    }
}

/// A concrete machine expanded from a machine-template.
///
/// The name is fixed at creation (`<template><2-digit index>`); addresses,
/// cloud identifiers and the instance id are filled in by provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    #[serde(default)]
    pub services: BTreeSet<String>,
    #[serde(default)]
    pub address: Address,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub cloud: Option<CloudAssignment>,
    /// Free-form defaults block carried for collaborators.
    #[serde(default)]
    pub defaults: Value,
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Machine {
    pub fn new(name: impl Into<String>) -> Self {
        Machine {
            name: name.into(),
            services: BTreeSet::new(),
            address: Address::default(),
            auth: Auth::default(),
            cloud: None,
            defaults: Value::Null,
            instance_id: None,
        }
    }
}

impl Symbolic for Machine {
    fn member(&self, name: &str) -> Option<Symbol<'_>> {
        match name {
            "name" => Some(Symbol::Text(self.name.clone())),
            "services" => Some(Symbol::Sequence(
                self.services.iter().cloned().map(Symbol::Text).collect(),
            )),
            "address" => Some(Symbol::Object(&self.address)),
            "public_key" => self.auth.public_key.clone().map(Symbol::Text),
            "private_key" => self.auth.private_key.clone().map(Symbol::Text),
            "cloud" => self.cloud.as_ref().map(|c| Symbol::Text(c.name.clone())),
            "defaults" => Some(Symbol::Value(&self.defaults)),
            _ => None,
        }
    }
}

/// The service mapping, insertion-ordered by declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceGroup {
    services: IndexMap<String, Service>,
}

impl ServiceGroup {
    pub fn insert(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.services.insert(
            name.clone(),
            Service {
                name,
                parents: BTreeSet::new(),
                machines: BTreeSet::new(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    /// Attach `parent` as a parent of `child`.
    pub fn link_parent(&mut self, child: &str, parent: &str) -> Result<(), SpecError> {
        if child == parent {
            return Err(SpecError::ServiceGraph(format!(
                "service `{}` lists itself as a parent",
                child
            )));
        }
        if !self.services.contains_key(parent) {
            return Err(SpecError::ServiceGraph(format!(
                "service `{}` lists unknown parent `{}`",
                child, parent
            )));
        }
        let service = self.services.get_mut(child).ok_or_else(|| {
            SpecError::ServiceGraph(format!("unknown service `{}`", child))
        })?;
        service.parents.insert(parent.to_string());
        Ok(())
    }

    /// Reject cyclic parent definitions with Kahn's algorithm.
    pub fn check_acyclic(&self) -> Result<(), SpecError> {
        let mut in_degree: IndexMap<&str, usize> =
            self.services.keys().map(|k| (k.as_str(), 0)).collect();
        for service in self.services.values() {
            for parent in &service.parents {
                *in_degree.get_mut(parent.as_str()).unwrap() += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&name, _)| name)
            .collect();
        let mut processed = 0usize;
        while let Some(name) = queue.pop_front() {
            processed += 1;
            for parent in &self.services[name].parents {
                let degree = in_degree.get_mut(parent.as_str()).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(parent.as_str());
                }
            }
        }

        if processed != self.services.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, &d)| d > 0)
                .map(|(&name, _)| name)
                .collect();
            return Err(SpecError::ServiceGraph(format!(
                "cyclic parent definitions involving: {}",
                stuck.join(", ")
            )));
        }
        Ok(())
    }

    /// All transitive ancestors of `name`, not including `name` itself.
    pub fn ancestors(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = self
            .services
            .get(name)
            .map(|s| s.parents.iter().cloned().collect())
            .unwrap_or_default();
        while let Some(parent) = queue.pop_front() {
            if !seen.insert(parent.clone()) {
                continue;
            }
            if let Some(service) = self.services.get(&parent) {
                queue.extend(service.parents.iter().cloned());
            }
        }
        seen
    }

    /// Add a machine to `service` and, transitively, to every ancestor.
    pub fn add_machine(&mut self, machine: &mut Machine, service: &str) -> Result<(), SpecError> {
        if !self.services.contains_key(service) {
            return Err(SpecError::ServiceGraph(format!(
                "unknown service `{}`",
                service
            )));
        }
        let mut targets = self.ancestors(service);
        targets.insert(service.to_string());
        for name in targets {
            machine.services.insert(name.clone());
            self.services
                .get_mut(&name)
                .expect("ancestors only returns known services")
                .machines
                .insert(machine.name.clone());
        }
        Ok(())
    }
}

impl std::ops::Index<&str> for ServiceGroup {
    type Output = Service;

    fn index(&self, name: &str) -> &Service {
        &self.services[name]
    }
}

impl Symbolic for ServiceGroup {
    fn member(&self, name: &str) -> Option<Symbol<'_>> {
        self.services.get(name).map(|s| Symbol::Object(s))
    }

    fn elements(&self) -> Option<Vec<Symbol<'_>>> {
        Some(self.services.values().map(|s| Symbol::Object(s)).collect())
    }
}

/// One block of opaque per-host variables from the specification document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostVars {
    pub kind: String,
    pub vars: Value,
}

/// The fully-resolved cluster: every machine, the service graph, the chosen
/// cloud, and the opaque variable blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cluster {
    pub machines: Vec<Machine>,
    pub services: ServiceGroup,
    #[serde(default)]
    pub cloud: Option<String>,
    #[serde(default)]
    pub vars: Vec<HostVars>,
}

impl Cluster {
    pub fn machine(&self, name: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.name == name)
    }
}

impl Symbolic for Cluster {
    fn member(&self, name: &str) -> Option<Symbol<'_>> {
        match name {
            "machines" => Some(Symbol::Sequence(
                self.machines.iter().map(|m| Symbol::Object(m)).collect(),
            )),
            "services" => Some(Symbol::Object(&self.services)),
            "cloud" => self.cloud.clone().map(Symbol::Text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_abc() -> ServiceGroup {
        // c -> b -> a
        let mut group = ServiceGroup::default();
        group.insert("a");
        group.insert("b");
        group.insert("c");
        group.link_parent("b", "a").unwrap();
        group.link_parent("c", "b").unwrap();
        group
    }

    #[test]
    fn test_transitive_membership() {
        let mut group = group_abc();
        let mut m = Machine::new("zk00");
        group.add_machine(&mut m, "c").unwrap();

        for name in ["a", "b", "c"] {
            assert!(m.services.contains(name), "machine missing {}", name);
            assert!(group[name].machines.contains("zk00"), "{} missing machine", name);
        }
    }

    #[test]
    fn test_ancestors() {
        let group = group_abc();
        let got = group.ancestors("c");
        assert_eq!(
            got,
            ["a", "b"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>()
        );
        assert!(group.ancestors("a").is_empty());
    }

    #[test]
    fn test_self_parent_rejected() {
        let mut group = ServiceGroup::default();
        group.insert("a");
        let err = group.link_parent("a", "a").unwrap_err();
        assert!(matches!(err, SpecError::ServiceGraph(_)));
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let mut group = ServiceGroup::default();
        group.insert("a");
        let err = group.link_parent("a", "ghost").unwrap_err();
        assert!(matches!(err, SpecError::ServiceGraph(_)));
    }

    #[test]
    fn test_cycle_detected() {
        let mut group = ServiceGroup::default();
        group.insert("a");
        group.insert("b");
        group.link_parent("a", "b").unwrap();
        group.link_parent("b", "a").unwrap();
        let err = group.check_acyclic().unwrap_err();
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn test_acyclic_diamond_ok() {
        let mut group = ServiceGroup::default();
        for name in ["top", "left", "right", "bottom"] {
            group.insert(name);
        }
        group.link_parent("left", "top").unwrap();
        group.link_parent("right", "top").unwrap();
        group.link_parent("bottom", "left").unwrap();
        group.link_parent("bottom", "right").unwrap();
        group.check_acyclic().unwrap();

        let mut m = Machine::new("m00");
        group.add_machine(&mut m, "bottom").unwrap();
        assert_eq!(m.services.len(), 4);
        assert_eq!(group["top"].machines.len(), 1);
    }

    #[test]
    fn test_address_validation() {
        let mut addr = Address::default();
        addr.set_internal("10.0.0.4").unwrap();
        assert!(addr.set_external("10.0.0.999").is_err());
        assert_eq!(addr.internal.as_deref(), Some("10.0.0.4"));
        assert!(addr.external.is_none());
    }
}
