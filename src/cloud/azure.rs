//! Azure Resource Manager capability port

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Admin user required by the VM API; the node OS never uses it
pub const ADMIN_USERNAME: &str = "talosuser";

/// A public IP address resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIp {
    pub id: String,
    pub name: String,
    pub ip_address: Option<IpAddr>,
}

/// Network interface to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicRequest {
    pub name: String,
    pub location: String,
    pub ip_config_name: String,
    pub subnet_id: String,
    /// Attached for control plane nodes only
    pub public_ip_id: Option<String>,
}

/// Virtual machine to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRequest {
    pub name: String,
    pub location: String,
    pub vm_size: String,
    pub image_id: String,
    pub os_disk_name: String,
    pub os_disk_size_gb: Option<u32>,
    pub admin_username: String,
    pub admin_password: String,
    /// Base64-encoded custom data
    pub custom_data: String,
    pub nic_id: String,
    pub tags: BTreeMap<String, String>,
}

/// A virtual machine as reported by the API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureVm {
    pub id: String,
    pub name: String,
    pub provisioning_state: String,
    pub tags: BTreeMap<String, String>,
}

/// Outcome of a delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Resource is gone (204 No Content)
    Completed,
    /// Accepted but still running
    InProgress,
}

/// Subset of the Azure network and compute APIs used by the Azure provisioner
#[async_trait]
pub trait AzureApi: Send + Sync {
    /// Resource id of a subnet
    async fn get_subnet(&self, resource_group: &str, network: &str, subnet: &str) -> Result<String>;

    async fn list_public_ips(&self, resource_group: &str) -> Result<Vec<PublicIp>>;

    /// Create a static IPv4 basic-SKU public IP, awaiting completion
    async fn create_public_ip(
        &self,
        resource_group: &str,
        name: &str,
        location: &str,
    ) -> Result<PublicIp>;

    async fn delete_public_ip(&self, resource_group: &str, name: &str) -> Result<()>;

    /// Create a network interface, awaiting completion; returns its id
    async fn create_nic(&self, resource_group: &str, request: NicRequest) -> Result<String>;

    async fn delete_nic(&self, resource_group: &str, name: &str) -> Result<()>;

    async fn create_vm(&self, resource_group: &str, request: VmRequest) -> Result<()>;

    /// Look up a VM; `None` when it does not exist
    async fn get_vm(&self, resource_group: &str, name: &str) -> Result<Option<AzureVm>>;

    async fn delete_vm(&self, resource_group: &str, name: &str) -> Result<DeleteOutcome>;

    async fn delete_disk(&self, resource_group: &str, name: &str) -> Result<()>;
}
