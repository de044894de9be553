//! Persistent cluster state: YAML files under a state directory.
//!
//! Used for recovery: a crashed provisioning run finds its already-booted
//! machines here and does not re-create them. Layout:
//! `<dir>/cluster.yaml` for the whole cluster, `<dir>/machines/<name>.yaml`
//! per machine. Saves are atomic (temp file + rename).

use crate::core::model::{Cluster, Machine};
use std::path::{Path, PathBuf};
use tracing::warn;

pub fn cluster_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join("cluster.yaml")
}

pub fn machine_file_path(state_dir: &Path, machine: &str) -> PathBuf {
    state_dir.join("machines").join(format!("{}.yaml", machine))
}

/// Load the stored cluster. Returns None if nothing is stored yet.
pub fn load_cluster(state_dir: &Path) -> Result<Option<Cluster>, String> {
    read_yaml(&cluster_file_path(state_dir))
}

/// Store the cluster, replacing any previous snapshot.
pub fn save_cluster(state_dir: &Path, cluster: &Cluster) -> Result<(), String> {
    write_yaml(&cluster_file_path(state_dir), cluster)
}

/// Whether a machine with this name has been stored.
pub fn has_machine(state_dir: &Path, machine: &str) -> bool {
    machine_file_path(state_dir, machine).exists()
}

pub fn load_machine(state_dir: &Path, machine: &str) -> Result<Option<Machine>, String> {
    read_yaml(&machine_file_path(state_dir, machine))
}

/// Store a machine. Overwrites (with a warning) any previous record.
pub fn save_machine(state_dir: &Path, machine: &Machine) -> Result<(), String> {
    let path = machine_file_path(state_dir, &machine.name);
    if path.exists() {
        warn!(machine = %machine.name, "machine already stored, overwriting");
    }
    write_yaml(&path, machine)
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let value = serde_yaml_ng::from_str(&content)
        .map_err(|e| format!("invalid state file {}: {}", path.display(), e))?;
    Ok(Some(value))
}

fn write_yaml<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }
    let yaml = serde_yaml_ng::to_string(value).map_err(|e| format!("serialize error: {}", e))?;

    // Atomic write: temp file + rename
    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, &yaml)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        format!(
            "cannot rename {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loader;

    fn cluster() -> Cluster {
        loader::phase1("services:\n  nodes: []\nmachines:\n  zk:\n    count: 2\n").unwrap()
    }

    #[test]
    fn test_cluster_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster();
        save_cluster(dir.path(), &cluster).unwrap();

        let loaded = load_cluster(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.machines.len(), 2);
        assert!(loaded.services.contains("nodes"));
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_cluster(dir.path()).unwrap().is_none());
        assert!(load_machine(dir.path(), "ghost").unwrap().is_none());
    }

    #[test]
    fn test_machine_roundtrip_and_presence() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = cluster().machines.remove(0);
        machine.address.set_internal("10.0.0.7").unwrap();

        assert!(!has_machine(dir.path(), &machine.name));
        save_machine(dir.path(), &machine).unwrap();
        assert!(has_machine(dir.path(), &machine.name));

        let loaded = load_machine(dir.path(), &machine.name).unwrap().unwrap();
        assert_eq!(loaded.address.internal.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_atomic_write_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        save_cluster(dir.path(), &cluster()).unwrap();
        assert!(cluster_file_path(dir.path()).exists());
        assert!(!dir.path().join("cluster.yaml.tmp").exists());
    }
}
