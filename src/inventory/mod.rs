//! Inventory materialization: turn a resolved cluster into grouped
//! inventory text and per-host variable files.
//!
//! The INI format is one `[service]` section per service with member
//! hostnames, annotated with `ansible_host` once provisioning has filled in
//! an internal address. Host variable blocks are written one YAML file per
//! host under `host_vars/`.

use crate::core::model::Cluster;
use serde_yaml_ng::Value;
use std::fmt::Write as _;
use std::path::Path;

/// Render the cluster as an INI-style grouped inventory.
pub fn ini(cluster: &Cluster) -> String {
    let mut out = String::new();
    for service in cluster.services.iter() {
        let _ = writeln!(out, "[{}]", service.name);
        for hostname in &service.machines {
            match cluster.machine(hostname).and_then(|m| m.address.internal.as_deref()) {
                Some(ip) => {
                    let _ = writeln!(out, "{} ansible_host={}", hostname, ip);
                }
                None => {
                    let _ = writeln!(out, "{}", hostname);
                }
            }
        }
        out.push('\n');
    }
    out
}

/// Render the cluster as a JSON mapping of service name to member hostnames.
pub fn json(cluster: &Cluster) -> Result<String, String> {
    let mut groups = serde_json::Map::new();
    for service in cluster.services.iter() {
        let hosts: Vec<serde_json::Value> = service
            .machines
            .iter()
            .map(|h| serde_json::Value::String(h.clone()))
            .collect();
        groups.insert(service.name.clone(), serde_json::Value::Array(hosts));
    }
    serde_json::to_string_pretty(&serde_json::Value::Object(groups))
        .map_err(|e| format!("inventory serialize error: {}", e))
}

/// Write each host-variable block as `<dir>/host_vars/<host>.yaml`.
pub fn write_host_vars(cluster: &Cluster, dir: &Path) -> Result<Vec<std::path::PathBuf>, String> {
    let prefix = dir.join("host_vars");
    std::fs::create_dir_all(&prefix)
        .map_err(|e| format!("cannot create dir {}: {}", prefix.display(), e))?;

    let mut written = Vec::new();
    for block in &cluster.vars {
        let Value::Mapping(hosts) = &block.vars else {
            return Err(format!("{} block is not a mapping", block.kind));
        };
        for (host, vars) in hosts {
            let Some(host) = host.as_str() else {
                return Err(format!("non-string host name in {} block", block.kind));
            };
            let path = prefix.join(format!("{}.yaml", host));
            let yaml = serde_yaml_ng::to_string(vars)
                .map_err(|e| format!("cannot serialize vars for {}: {}", host, e))?;
            std::fs::write(&path, yaml)
                .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
            written.push(path);
        }
    }
    Ok(written)
}
