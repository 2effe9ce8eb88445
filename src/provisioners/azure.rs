//! Azure provisioner
//!
//! Every node gets a network interface `<machine>-nic` in the configured
//! subnet. Control plane nodes additionally attach the static public IP
//! `<machine>-ip` reserved for their ordinal.

use super::{cluster_config, identify, ignore_not_found, machine_config};
use crate::bootstrap::tokens::random_string;
use crate::cloud::aws::{CLUSTER_TAG, NAME_TAG};
use crate::cloud::azure::{
    AzureApi, AzureVm, DeleteOutcome, NicRequest, PublicIp, VmRequest, ADMIN_USERNAME,
};
use crate::crd::{Cluster, Machine};
use crate::domain::{
    external_ip_name, ip_config_name, nic_name, os_disk_name, ProvisionContext, Provisioner,
};
use crate::error::{Error, Result};
use crate::store;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::ResourceExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const BACKEND: &str = "azure";
const ADMIN_PASSWORD_LENGTH: usize = 15;

// =============================================================================
// Configuration
// =============================================================================

/// Cluster-level Azure configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AzureClusterConfig {
    pub location: String,
    #[serde(rename = "resourcegroup")]
    pub resource_group: String,
}

/// Machine-level Azure configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AzureMachineConfig {
    pub location: String,
    #[serde(rename = "resourcegroup")]
    pub resource_group: String,
    pub instances: AzureInstanceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureInstanceConfig {
    #[serde(rename = "type")]
    pub vm_size: String,
    pub image: String,
    pub network: String,
    pub subnet: String,
    #[serde(default)]
    pub disks: Option<AzureDiskConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureDiskConfig {
    pub size: u32,
}

// =============================================================================
// Provisioner
// =============================================================================

/// Provisions Azure virtual machines
pub struct AzureProvisioner {
    api: Arc<dyn AzureApi>,
}

impl AzureProvisioner {
    pub fn new(api: Arc<dyn AzureApi>) -> Self {
        Self { api }
    }

    async fn public_ip(&self, resource_group: &str, name: &str) -> Result<Option<PublicIp>> {
        let ips = self.api.list_public_ips(resource_group).await?;
        Ok(ips.into_iter().find(|ip| ip.name == name))
    }

    /// The VM named `machine`, split by whether it carries `cluster`'s tag
    async fn find_vm(&self, resource_group: &str, cluster: &str, machine: &str) -> Result<VmLookup> {
        Ok(match self.api.get_vm(resource_group, machine).await? {
            None => VmLookup::Absent,
            Some(vm) if vm.tags.get(CLUSTER_TAG).map(String::as_str) == Some(cluster) => VmLookup::Owned(vm),
            Some(vm) => VmLookup::Foreign(vm),
        })
    }
}

enum VmLookup {
    Absent,
    Owned(AzureVm),
    /// Same name, other cluster's tag
    Foreign(AzureVm),
}

#[async_trait]
impl Provisioner for AzureProvisioner {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn create(&self, ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine) -> Result<()> {
        let (cluster_name, machine_name, role) = identify(cluster, machine)?;
        let config: AzureMachineConfig = machine_config(machine)?;
        let rg = config.resource_group.as_str();

        match self.find_vm(rg, &cluster_name, &machine_name).await? {
            VmLookup::Absent => {}
            VmLookup::Owned(vm) => {
                info!(machine = %machine_name, vm = %vm.id, "Virtual machine already exists");
                return Ok(());
            }
            VmLookup::Foreign(vm) => {
                return Err(Error::InstanceConflict {
                    machine: machine_name,
                    reason: format!(
                        "{} is tagged for cluster {}",
                        vm.id,
                        vm.tags.get(CLUSTER_TAG).map_or("<none>", String::as_str)
                    ),
                });
            }
        }

        let subnet_id = self
            .api
            .get_subnet(rg, &config.instances.network, &config.instances.subnet)
            .await?;

        let public_ip_id = match role.ordinal() {
            Some(ordinal) => {
                let name = external_ip_name(&cluster_name, ordinal);
                let ip = self
                    .public_ip(rg, &name)
                    .await?
                    .ok_or(Error::AddressNotReady { name })?;
                Some(ip.id)
            }
            None => None,
        };

        let payload = store::fetch_boot_payload(ctx.store.as_ref(), &cluster_name, role).await?;

        let nic_id = self
            .api
            .create_nic(
                rg,
                NicRequest {
                    name: nic_name(&machine_name),
                    location: config.location.clone(),
                    ip_config_name: ip_config_name(&machine_name),
                    subnet_id,
                    public_ip_id,
                },
            )
            .await?;
        debug!(machine = %machine_name, nic = %nic_id, "Created network interface");

        let request = VmRequest {
            name: machine_name.clone(),
            location: config.location.clone(),
            vm_size: config.instances.vm_size.clone(),
            image_id: config.instances.image.clone(),
            os_disk_name: os_disk_name(&machine_name),
            os_disk_size_gb: config.instances.disks.as_ref().map(|d| d.size),
            admin_username: ADMIN_USERNAME.to_string(),
            admin_password: random_string(ADMIN_PASSWORD_LENGTH),
            custom_data: STANDARD.encode(payload.userdata),
            nic_id,
            tags: BTreeMap::from([
                (NAME_TAG.to_string(), machine_name.clone()),
                (CLUSTER_TAG.to_string(), cluster_name.clone()),
            ]),
        };
        self.api.create_vm(rg, request).await?;

        info!(machine = %machine_name, role = %role, "Created virtual machine");
        Ok(())
    }

    async fn update(&self, _ctx: &ProvisionContext, _cluster: &Cluster, machine: &Machine) -> Result<()> {
        debug!(machine = %machine.name_any(), "In-place update not supported, leaving VM as is");
        Ok(())
    }

    async fn delete(&self, _ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine) -> Result<()> {
        let machine_name = machine.name_any();
        let config: AzureMachineConfig = machine_config(machine)?;
        let rg = config.resource_group.as_str();

        if let VmLookup::Foreign(vm) = self.find_vm(rg, &cluster.name_any(), &machine_name).await? {
            warn!(machine = %machine_name, vm = %vm.id, "Virtual machine belongs to another cluster, leaving it");
            return Ok(());
        }

        match self.api.delete_vm(rg, &machine_name).await? {
            DeleteOutcome::Completed => {}
            DeleteOutcome::InProgress => {
                return Err(Error::DeletionInProgress {
                    backend: BACKEND.to_string(),
                    resource: machine_name,
                });
            }
        }

        ignore_not_found(self.api.delete_disk(rg, &os_disk_name(&machine_name)).await)?;
        ignore_not_found(self.api.delete_nic(rg, &nic_name(&machine_name)).await)?;

        info!(machine = %machine_name, "Deleted virtual machine");
        Ok(())
    }

    async fn exists(&self, _ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine) -> Result<bool> {
        let config: AzureMachineConfig = machine_config(machine)?;
        let vm = self
            .find_vm(&config.resource_group, &cluster.name_any(), &machine.name_any())
            .await?;
        Ok(matches!(vm, VmLookup::Owned(_)))
    }

    async fn allocate_external_ips(
        &self,
        _ctx: &ProvisionContext,
        cluster: &Cluster,
        count: usize,
    ) -> Result<Vec<IpAddr>> {
        let (_, config): (_, AzureClusterConfig) = cluster_config(cluster)?;
        let cluster_name = cluster.name_any();
        let mut ips = Vec::with_capacity(count);

        for ordinal in 0..count {
            let name = external_ip_name(&cluster_name, ordinal);
            let ip = match self.public_ip(&config.resource_group, &name).await? {
                Some(existing) => existing,
                None => {
                    let created = self
                        .api
                        .create_public_ip(&config.resource_group, &name, &config.location)
                        .await?;
                    info!(name = %name, "Created public IP");
                    created
                }
            };
            let address = ip.ip_address.ok_or(Error::AddressNotReady { name })?;
            ips.push(address);
        }

        Ok(ips)
    }

    async fn deallocate_external_ips(&self, _ctx: &ProvisionContext, cluster: &Cluster) -> Result<()> {
        let (spec, config): (_, AzureClusterConfig) = cluster_config(cluster)?;
        let cluster_name = cluster.name_any();

        for ordinal in 0..spec.control_plane.count {
            let name = external_ip_name(&cluster_name, ordinal);
            ignore_not_found(self.api.delete_public_ip(&config.resource_group, &name).await)?;
            debug!(name = %name, "Public IP released");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::InMemoryCloud;
    use crate::crd::cluster::tests::cluster;
    use crate::crd::machine::tests::machine;
    use crate::domain::{ConfigRecord, ConfigStore, USERDATA_KEY};
    use crate::provisioners::tests::context;
    use assert_matches::assert_matches;

    const CLUSTER_CONFIG: &str = "location: westeurope\nresourcegroup: talos\n";
    const MACHINE_CONFIG: &str = "\
location: westeurope
resourcegroup: talos
instances:
  type: Standard_D2s_v3
  image: /images/talos
  network: talos-vnet
  subnet: nodes
  disks:
    size: 32
";

    async fn stage(store: &dyn ConfigStore, name: &str) {
        let record = ConfigRecord::from([(USERDATA_KEY.to_string(), "---\n".to_string())]);
        store.create(name, record).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_master_attaches_public_ip() {
        let cloud = Arc::new(InMemoryCloud::new());
        let azure = AzureProvisioner::new(cloud.clone());
        let (ctx, store) = context();
        let c = cluster("demo", 2, "azure", CLUSTER_CONFIG);
        let ips = azure.allocate_external_ips(&ctx, &c, 2).await.unwrap();
        assert_eq!(ips.len(), 2);
        stage(store.as_ref(), "demo-master-1").await;

        let m = machine("demo-master-1", "demo", "azure", MACHINE_CONFIG);
        azure.create(&ctx, &c, &m).await.unwrap();

        let nic = cloud.azure_nic("talos", "demo-master-1-nic").unwrap();
        assert_eq!(nic.ip_config_name, "demo-master-1-ip-config");
        assert!(nic.public_ip_id.unwrap().ends_with("/demo-master-1-ip"));

        let vm = cloud.azure_vm_request("talos", "demo-master-1").unwrap();
        assert_eq!(vm.admin_username, "talosuser");
        assert_eq!(vm.admin_password.len(), 15);
        assert_eq!(vm.custom_data, STANDARD.encode("---\n"));
        assert_eq!(vm.os_disk_name, "demo-master-1-os-disk");
        assert_eq!(vm.os_disk_size_gb, Some(32));
        assert!(azure.exists(&ctx, &c, &m).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_master_requires_public_ip() {
        let cloud = Arc::new(InMemoryCloud::new());
        let azure = AzureProvisioner::new(cloud.clone());
        let (ctx, store) = context();
        let c = cluster("demo", 1, "azure", CLUSTER_CONFIG);
        stage(store.as_ref(), "demo-master-0").await;

        let m = machine("demo-master-0", "demo", "azure", MACHINE_CONFIG);
        assert_matches!(azure.create(&ctx, &c, &m).await, Err(Error::AddressNotReady { .. }));
        assert_eq!(cloud.call_count("Interfaces.CreateOrUpdate"), 0);
    }

    #[tokio::test]
    async fn test_worker_has_no_public_ip() {
        let cloud = Arc::new(InMemoryCloud::new());
        let azure = AzureProvisioner::new(cloud.clone());
        let (ctx, store) = context();
        let c = cluster("demo", 1, "azure", CLUSTER_CONFIG);
        stage(store.as_ref(), "demo-workers").await;

        let m = machine("demo-workers-7", "demo", "azure", MACHINE_CONFIG);
        azure.create(&ctx, &c, &m).await.unwrap();

        let nic = cloud.azure_nic("talos", "demo-workers-7-nic").unwrap();
        assert_eq!(nic.public_ip_id, None);
    }

    #[tokio::test]
    async fn test_delete_reports_progress_then_cleans_up() {
        let cloud = Arc::new(InMemoryCloud::new());
        let azure = AzureProvisioner::new(cloud.clone());
        let (ctx, store) = context();
        let c = cluster("demo", 1, "azure", CLUSTER_CONFIG);
        stage(store.as_ref(), "demo-workers").await;
        let m = machine("demo-workers-7", "demo", "azure", MACHINE_CONFIG);
        azure.create(&ctx, &c, &m).await.unwrap();

        assert_matches!(
            azure.delete(&ctx, &c, &m).await,
            Err(Error::DeletionInProgress { resource, .. }) if resource == "demo-workers-7"
        );
        assert!(cloud.azure_disk_exists("talos", "demo-workers-7-os-disk"));

        azure.delete(&ctx, &c, &m).await.unwrap();
        assert!(!cloud.azure_disk_exists("talos", "demo-workers-7-os-disk"));
        assert!(cloud.azure_nic("talos", "demo-workers-7-nic").is_none());
        assert!(!azure.exists(&ctx, &c, &m).await.unwrap());

        // Nothing left to remove
        azure.delete(&ctx, &c, &m).await.unwrap();
    }

    #[tokio::test]
    async fn test_vm_of_other_cluster_is_not_ours() {
        let cloud = Arc::new(InMemoryCloud::new());
        let azure = AzureProvisioner::new(cloud.clone());
        let (ctx, store) = context();
        stage(store.as_ref(), "prod-workers").await;
        cloud
            .create_vm(
                "talos",
                VmRequest {
                    name: "prod-workers-7".into(),
                    location: "westeurope".into(),
                    vm_size: "Standard_D2s_v3".into(),
                    image_id: "/images/talos".into(),
                    os_disk_name: "prod-workers-7-os-disk".into(),
                    os_disk_size_gb: None,
                    admin_username: ADMIN_USERNAME.into(),
                    admin_password: "x".into(),
                    custom_data: String::new(),
                    nic_id: "nic".into(),
                    tags: BTreeMap::from([(CLUSTER_TAG.to_string(), "staging".to_string())]),
                },
            )
            .await
            .unwrap();

        let c = cluster("prod", 1, "azure", CLUSTER_CONFIG);
        let m = machine("prod-workers-7", "prod", "azure", MACHINE_CONFIG);
        assert!(!azure.exists(&ctx, &c, &m).await.unwrap());
        assert_matches!(azure.create(&ctx, &c, &m).await, Err(Error::InstanceConflict { .. }));

        azure.delete(&ctx, &c, &m).await.unwrap();
        assert_eq!(cloud.call_count("VirtualMachines.Delete"), 0);
        assert!(cloud.azure_disk_exists("talos", "prod-workers-7-os-disk"));
    }

    #[tokio::test]
    async fn test_create_retry_after_vm_failure() {
        let cloud = Arc::new(InMemoryCloud::new());
        let azure = AzureProvisioner::new(cloud.clone());
        let (ctx, store) = context();
        let c = cluster("demo", 1, "azure", CLUSTER_CONFIG);
        azure.allocate_external_ips(&ctx, &c, 1).await.unwrap();
        stage(store.as_ref(), "demo-master-0").await;
        let m = machine("demo-master-0", "demo", "azure", MACHINE_CONFIG);

        cloud.fail_next("VirtualMachines.CreateOrUpdate", "OperationNotAllowed");
        assert_matches!(azure.create(&ctx, &c, &m).await, Err(Error::Cloud { .. }));
        assert!(!azure.exists(&ctx, &c, &m).await.unwrap());

        azure.create(&ctx, &c, &m).await.unwrap();
        assert!(azure.exists(&ctx, &c, &m).await.unwrap());
        let nic = cloud.azure_nic("talos", "demo-master-0-nic").unwrap();
        assert!(nic.public_ip_id.unwrap().ends_with("/demo-master-0-ip"));
    }

    #[tokio::test]
    async fn test_allocate_reuses_and_deallocate_tolerates_missing() {
        let cloud = Arc::new(InMemoryCloud::new());
        let azure = AzureProvisioner::new(cloud.clone());
        let (ctx, _) = context();
        let c = cluster("demo", 3, "azure", CLUSTER_CONFIG);

        let first = azure.allocate_external_ips(&ctx, &c, 3).await.unwrap();
        let second = azure.allocate_external_ips(&ctx, &c, 3).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cloud.call_count("PublicIPAddresses.CreateOrUpdate"), 3);

        azure.deallocate_external_ips(&ctx, &c).await.unwrap();
        azure.deallocate_external_ips(&ctx, &c).await.unwrap();
        assert!(cloud.azure_public_ips().is_empty());
    }
}
