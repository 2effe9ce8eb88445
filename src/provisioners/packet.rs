//! Packet (bare metal) provisioner
//!
//! Control plane addresses come from a pre-provisioned IP block; nothing is
//! reserved or released per cluster. A control plane node's address is
//! configured on its loopback device through the boot payload and assigned
//! to the device once it is active.
//!
//! Ordinals map onto the block's addresses in ascending order. Addresses
//! already assigned to the cluster's control plane devices stay with their
//! ordinal, so assignments never shift the remaining slots.

use super::{cluster_config, identify, ignore_not_found, machine_config, ProvisionerSettings};
use crate::cloud::metal::{DeviceCreateRequest, MetalApi, MetalDevice, CUSTOM_IPXE, STATE_ACTIVE};
use crate::crd::{Cluster, Machine};
use crate::domain::{MachineRole, ProvisionContext, Provisioner};
use crate::error::{Error, Result};
use crate::store;
use crate::wait::poll_until;
use async_trait::async_trait;
use kube::ResourceExt;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

const BACKEND: &str = "packet";
const BILLING_HOURLY: &str = "hourly";
const HOST_PREFIX: u8 = 32;

/// Marker the node OS expects at the top of its user data
pub const USERDATA_MARKER: &str = "#!talos\n";

// =============================================================================
// Configuration
// =============================================================================

/// Cluster-level Packet configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PacketClusterConfig {
    #[serde(rename = "projectid")]
    pub project_id: String,
    /// Reserved block, as `network/cidr`
    #[serde(rename = "ipblock")]
    pub ip_block: String,
}

/// Machine-level Packet configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PacketMachineConfig {
    #[serde(rename = "projectid")]
    pub project_id: String,
    pub instances: PacketInstanceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacketInstanceConfig {
    pub plan: String,
    pub facility: String,
    #[serde(rename = "pxeurl")]
    pub pxe_url: String,
    /// Replaces the payload's install section when set
    #[serde(default)]
    pub install: Option<Mapping>,
}

/// Tag identifying a device's cluster
pub fn cluster_tag(cluster: &str) -> String {
    format!("cluster:{}", cluster)
}

// =============================================================================
// Boot Payload Preparation
// =============================================================================

/// Adapt a staged payload for a bare-metal device.
///
/// The machine's install section replaces the payload's. A control plane
/// node additionally gets its address on `lo` and DHCP on `eth0`.
pub fn prepare_userdata(userdata: &str, install: Option<&Mapping>, address: Option<IpAddr>) -> Result<String> {
    let mut document: Value = serde_yaml::from_str(userdata)?;
    let root = document
        .as_mapping_mut()
        .ok_or_else(|| Error::Internal("boot payload is not a mapping".to_string()))?;

    if let Some(install) = install {
        root.insert(Value::from("install"), Value::Mapping(install.clone()));
    }

    if let Some(address) = address {
        let networking = child_mapping(root, "networking")?;
        let os = child_mapping(networking, "os")?;
        let slot = os.entry(Value::from("devices")).or_insert(Value::Null);
        if !slot.is_sequence() {
            *slot = Value::Sequence(Vec::new());
        }
        let devices = slot
            .as_sequence_mut()
            .ok_or_else(|| Error::Internal("devices is not a sequence".to_string()))?;

        set_device(devices, device("lo", "cidr", Value::from(format!("{}/{}", address, HOST_PREFIX))));
        set_device(devices, device("eth0", "dhcp", Value::Bool(true)));
    }

    Ok(format!("{}{}", USERDATA_MARKER, serde_yaml::to_string(&document)?))
}

fn child_mapping<'a>(parent: &'a mut Mapping, key: &str) -> Result<&'a mut Mapping> {
    let slot = parent.entry(Value::from(key)).or_insert(Value::Null);
    if !slot.is_mapping() {
        *slot = Value::Mapping(Mapping::new());
    }
    slot.as_mapping_mut()
        .ok_or_else(|| Error::Internal(format!("{} is not a mapping", key)))
}

fn device(interface: &str, key: &str, value: Value) -> Value {
    let mut entry = Mapping::new();
    entry.insert(Value::from("interface"), Value::from(interface));
    entry.insert(Value::from(key), value);
    Value::Mapping(entry)
}

/// Replace the entry for the same interface, or append
fn set_device(devices: &mut Vec<Value>, entry: Value) {
    let interface = entry.get("interface").cloned();
    match devices.iter_mut().find(|d| d.get("interface") == interface.as_ref()) {
        Some(existing) => *existing = entry,
        None => devices.push(entry),
    }
}

// =============================================================================
// Provisioner
// =============================================================================

/// Provisions bare-metal devices
pub struct PacketProvisioner {
    metal: Arc<dyn MetalApi>,
    settings: ProvisionerSettings,
}

impl PacketProvisioner {
    pub fn new(metal: Arc<dyn MetalApi>, settings: ProvisionerSettings) -> Self {
        Self { metal, settings }
    }

    /// Available host addresses of `block`, in API order
    async fn block_addresses(&self, project_id: &str, block: &str) -> Result<Vec<IpAddr>> {
        let reservations = self.metal.list_ip_reservations(project_id).await?;
        let reservation = reservations
            .into_iter()
            .find(|r| r.block() == block)
            .ok_or_else(|| Error::not_found("IpReservation", block))?;

        let available = self
            .metal
            .available_addresses(&reservation.id, HOST_PREFIX)
            .await?;
        available
            .iter()
            .map(|a| {
                let host = a.split_once('/').map_or(a.as_str(), |(host, _)| host);
                host.parse::<IpAddr>().map_err(Error::from)
            })
            .collect()
    }

    /// Block addresses for ordinals `0..count`; shorter when the block runs out
    async fn control_plane_addresses(
        &self,
        config: &PacketClusterConfig,
        cluster: &str,
        count: usize,
    ) -> Result<Vec<IpAddr>> {
        let available = self.block_addresses(&config.project_id, &config.ip_block).await?;

        let tag = cluster_tag(cluster);
        let mut pinned = BTreeMap::new();
        for device in self.metal.list_devices(&config.project_id).await? {
            if !device.tags.contains(&tag) {
                continue;
            }
            let Some(ordinal) = MachineRole::parse(cluster, &device.hostname)
                .ok()
                .and_then(|role| role.ordinal())
            else {
                continue;
            };
            let held = device
                .ip_addresses
                .iter()
                .filter(|a| a.cidr == HOST_PREFIX)
                .filter_map(|a| a.address.parse::<IpAddr>().ok())
                .find(|a| block_contains(&config.ip_block, *a));
            if let Some(address) = held {
                pinned.insert(ordinal, address);
            }
        }

        let mut slots: BTreeSet<IpAddr> = available.into_iter().collect();
        slots.extend(pinned.values().copied());
        let slots: Vec<IpAddr> = slots.into_iter().collect();

        let mut claimed: BTreeSet<IpAddr> = pinned.values().copied().collect();
        let mut addresses = Vec::with_capacity(count);
        for ordinal in 0..count {
            let address = match pinned.get(&ordinal) {
                Some(address) => Some(*address),
                None => slots
                    .get(ordinal)
                    .filter(|a| !claimed.contains(*a))
                    .or_else(|| slots.iter().find(|a| !claimed.contains(*a)))
                    .copied(),
            };
            let Some(address) = address else { break };
            claimed.insert(address);
            addresses.push(address);
        }
        Ok(addresses)
    }

    async fn control_plane_address(
        &self,
        config: &PacketClusterConfig,
        cluster: &str,
        ordinal: usize,
    ) -> Result<IpAddr> {
        let addresses = self.control_plane_addresses(config, cluster, ordinal + 1).await?;
        addresses.get(ordinal).copied().ok_or_else(|| Error::AddressNotReady {
            name: format!("{}[{}]", config.ip_block, ordinal),
        })
    }

    /// Assign `address` to the device once it is active
    async fn assign_address(
        &self,
        ctx: &ProvisionContext,
        machine: &str,
        device_id: &str,
        address: IpAddr,
    ) -> Result<()> {
        let active = self.wait_active(ctx, device_id).await?;
        let cidr = format!("{}/{}", address, HOST_PREFIX);
        self.metal.assign_ip(&active.id, &cidr).await?;
        info!(machine = %machine, address = %cidr, "Assigned block address");
        Ok(())
    }

    async fn find_device(&self, project_id: &str, cluster: &str, machine: &str) -> Result<Option<MetalDevice>> {
        let tag = cluster_tag(cluster);
        let mut devices: Vec<_> = self
            .metal
            .list_devices(project_id)
            .await?
            .into_iter()
            .filter(|d| d.hostname == machine && d.tags.contains(&tag))
            .collect();
        if devices.len() > 1 {
            return Err(Error::InstanceConflict {
                machine: machine.to_string(),
                reason: format!("{} devices carry this hostname", devices.len()),
            });
        }
        Ok(devices.pop())
    }

    async fn wait_active(&self, ctx: &ProvisionContext, device_id: &str) -> Result<MetalDevice> {
        let metal = &self.metal;
        let operation = format!("device {} to become active", device_id);
        poll_until(self.settings.packet_active(), &ctx.cancel, &operation, || async move {
            let device = metal.get_device(device_id).await?;
            Ok(device.filter(|d| d.state == STATE_ACTIVE))
        })
        .await
    }
}

/// Whether `address` falls within `block` (`network/prefix`)
fn block_contains(block: &str, address: IpAddr) -> bool {
    let Some((network, prefix)) = block.split_once('/') else {
        return false;
    };
    let (Ok(network), Ok(prefix)) = (network.parse::<IpAddr>(), prefix.parse::<u32>()) else {
        return false;
    };
    match (network, address) {
        (IpAddr::V4(network), IpAddr::V4(address)) if prefix <= 32 => {
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            u32::from(network) & mask == u32::from(address) & mask
        }
        (IpAddr::V6(network), IpAddr::V6(address)) if prefix <= 128 => {
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            u128::from(network) & mask == u128::from(address) & mask
        }
        _ => false,
    }
}

#[async_trait]
impl Provisioner for PacketProvisioner {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn create(&self, ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine) -> Result<()> {
        let (cluster_name, machine_name, role) = identify(cluster, machine)?;
        let (_, cluster_cfg): (_, PacketClusterConfig) = cluster_config(cluster)?;
        let config: PacketMachineConfig = machine_config(machine)?;
        let project = config.project_id.as_str();

        let existing = self.find_device(project, &cluster_name, &machine_name).await?;

        let address = match role.ordinal() {
            Some(ordinal) => Some(
                self.control_plane_address(&cluster_cfg, &cluster_name, ordinal)
                    .await?,
            ),
            None => None,
        };

        if let Some(existing) = existing {
            info!(machine = %machine_name, device = %existing.id, "Device already exists");
            // A previous attempt may have created the device but not assigned its address
            match address {
                Some(address) if !existing.has_address(&address.to_string(), HOST_PREFIX) => {
                    self.assign_address(ctx, &machine_name, &existing.id, address)
                        .await?;
                }
                _ => {}
            }
            return Ok(());
        }

        let payload = store::fetch_boot_payload(ctx.store.as_ref(), &cluster_name, role).await?;
        let userdata = prepare_userdata(&payload.userdata, config.instances.install.as_ref(), address)?;

        let request = DeviceCreateRequest {
            hostname: machine_name.clone(),
            plan: config.instances.plan.clone(),
            facility: vec![config.instances.facility.clone()],
            operating_system: CUSTOM_IPXE.to_string(),
            billing_cycle: BILLING_HOURLY.to_string(),
            project_id: config.project_id.clone(),
            userdata,
            ipxe_script_url: config.instances.pxe_url.clone(),
            tags: vec![cluster_tag(&cluster_name)],
        };
        let device = self.metal.create_device(request).await?;
        info!(machine = %machine_name, device = %device.id, role = %role, "Created device");

        if let Some(address) = address {
            self.assign_address(ctx, &machine_name, &device.id, address)
                .await?;
        }

        Ok(())
    }

    async fn update(&self, _ctx: &ProvisionContext, _cluster: &Cluster, machine: &Machine) -> Result<()> {
        debug!(machine = %machine.name_any(), "In-place update not supported, leaving device as is");
        Ok(())
    }

    async fn delete(&self, _ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine) -> Result<()> {
        let machine_name = machine.name_any();
        let config: PacketMachineConfig = machine_config(machine)?;

        let Some(device) = self
            .find_device(&config.project_id, &cluster.name_any(), &machine_name)
            .await?
        else {
            debug!(machine = %machine_name, "No device to delete");
            return Ok(());
        };

        ignore_not_found(self.metal.delete_device(&device.id).await)?;
        info!(machine = %machine_name, device = %device.id, "Deleted device");
        Ok(())
    }

    async fn exists(&self, _ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine) -> Result<bool> {
        let config: PacketMachineConfig = machine_config(machine)?;
        let device = self
            .find_device(&config.project_id, &cluster.name_any(), &machine.name_any())
            .await?;
        Ok(device.is_some())
    }

    async fn allocate_external_ips(
        &self,
        _ctx: &ProvisionContext,
        cluster: &Cluster,
        count: usize,
    ) -> Result<Vec<IpAddr>> {
        let (_, config): (_, PacketClusterConfig) = cluster_config(cluster)?;
        let addresses = self
            .control_plane_addresses(&config, &cluster.name_any(), count)
            .await?;

        if addresses.len() < count {
            return Err(Error::cloud(
                BACKEND,
                "ProjectIPs.AvailableAddresses",
                format!(
                    "block {} has {} available addresses, {} required",
                    config.ip_block,
                    addresses.len(),
                    count
                ),
            ));
        }

        debug!(block = %config.ip_block, count, "Using block addresses");
        Ok(addresses)
    }

    async fn deallocate_external_ips(&self, _ctx: &ProvisionContext, cluster: &Cluster) -> Result<()> {
        debug!(cluster = %cluster.name_any(), "Block addresses are not released");
        Ok(())
    }
}
