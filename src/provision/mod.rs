//! Provisioning seam: the boundary between the cluster model and cloud
//! boot drivers.
//!
//! The core only produces machine descriptors; actual cloud drivers live
//! outside this crate and implement [`BootDriver`]. The bundled
//! [`DryRunDriver`] allocates placeholder addresses so boot recovery and
//! inventory generation can be exercised without a cloud.

use crate::core::model::{Cluster, Machine};
use crate::state;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// The cloud parameter block a boot driver consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudParams {
    pub image: String,
    pub flavor: String,
    #[serde(default, alias = "key-name")]
    pub key_name: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub create_floating_ip: bool,
    #[serde(default)]
    pub floating_ip_pool: Option<String>,
}

/// Everything a driver needs to create one virtual machine.
#[derive(Debug, Clone)]
pub struct MachineDescriptor {
    pub hostname: String,
    pub params: CloudParams,
}

impl MachineDescriptor {
    pub fn from_machine(machine: &Machine) -> Result<Self, String> {
        let cloud = machine
            .cloud
            .as_ref()
            .ok_or_else(|| format!("machine {} has no cloud assignment", machine.name))?;
        let params: CloudParams = serde_yaml_ng::from_value(cloud.params.clone())
            .map_err(|e| format!("invalid cloud parameters for {}: {}", machine.name, e))?;
        Ok(MachineDescriptor {
            hostname: machine.name.clone(),
            params,
        })
    }
}

/// What a driver reports back for one booted machine.
#[derive(Debug, Clone)]
pub struct BootResult {
    pub instance_id: String,
    pub internal_ip: String,
    pub external_ip: Option<String>,
}

/// A cloud boot driver. Implementations create the machine, wait for it to
/// come up, and report its addresses.
pub trait BootDriver {
    fn boot(&mut self, descriptor: &MachineDescriptor) -> Result<BootResult, String>;
}

/// Allocates deterministic placeholder addresses without touching a cloud.
#[derive(Debug, Default)]
pub struct DryRunDriver {
    next: u32,
}

impl BootDriver for DryRunDriver {
    fn boot(&mut self, descriptor: &MachineDescriptor) -> Result<BootResult, String> {
        let n = 10 + self.next;
        let (high, low) = (n / 256, n % 256);
        if high > 255 {
            return Err("placeholder address pool exhausted".to_string());
        }
        self.next += 1;
        Ok(BootResult {
            instance_id: format!("dry-run-{}", descriptor.hostname),
            internal_ip: format!("10.0.{}.{}", high, low),
            external_ip: descriptor
                .params
                .create_floating_ip
                .then(|| format!("192.168.{}.{}", high, low)),
        })
    }
}

/// Boot every machine of the cluster that is not already in the state store,
/// writing addresses back onto the model and persisting each booted machine.
/// Returns the number of machines actually booted.
pub fn boot_cluster(
    cluster: &mut Cluster,
    driver: &mut dyn BootDriver,
    state_dir: &Path,
) -> Result<usize, String> {
    let mut booted = 0;
    for machine in &mut cluster.machines {
        if state::has_machine(state_dir, &machine.name) {
            info!(machine = %machine.name, "already booted, recovering stored state");
            if let Some(stored) = state::load_machine(state_dir, &machine.name)? {
                machine.address = stored.address;
                machine.instance_id = stored.instance_id;
            }
            continue;
        }

        let descriptor = MachineDescriptor::from_machine(machine)?;
        info!(machine = %machine.name, image = %descriptor.params.image, "booting");
        let result = driver.boot(&descriptor)?;

        machine
            .address
            .set_internal(&result.internal_ip)
            .map_err(|e| e.to_string())?;
        if let Some(ip) = &result.external_ip {
            machine.address.set_external(ip).map_err(|e| e.to_string())?;
        }
        machine.instance_id = Some(result.instance_id);
        state::save_machine(state_dir, machine)?;
        booted += 1;
    }
    state::save_cluster(state_dir, cluster)?;
    Ok(booted)
}
