//! Google Compute Engine capability port

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Metadata key the node OS reads its payload from
pub const USER_DATA_METADATA_KEY: &str = "user-data";

/// Label carrying the owning cluster's name
pub const CLUSTER_LABEL: &str = "talos-cluster-name";

/// Status of a finished operation
pub const OPERATION_DONE: &str = "DONE";

/// A regional static address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GceAddress {
    pub name: String,
    pub address: Option<IpAddr>,
}

/// A long-running regional operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GceOperation {
    pub name: String,
    pub status: String,
}

impl GceOperation {
    pub fn is_done(&self) -> bool {
        self.status == OPERATION_DONE
    }
}

/// Instance to insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    /// `zones/<zone>/machineTypes/<type>`
    pub machine_type: String,
    pub source_image: String,
    pub disk_size_gb: Option<u32>,
    /// External NAT address; ephemeral when `None`
    pub nat_ip: Option<IpAddr>,
    pub metadata: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// An instance as reported by the API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GceInstance {
    pub name: String,
    pub status: String,
    pub labels: BTreeMap<String, String>,
}

/// Subset of the Compute API used by the GCE provisioner
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn list_addresses(&self, project: &str, region: &str) -> Result<Vec<GceAddress>>;

    async fn insert_address(&self, project: &str, region: &str, name: &str)
        -> Result<GceOperation>;

    async fn get_region_operation(
        &self,
        project: &str,
        region: &str,
        operation: &str,
    ) -> Result<GceOperation>;

    /// Delete an address; missing addresses are `ResourceNotFound`
    async fn delete_address(&self, project: &str, region: &str, name: &str) -> Result<()>;

    async fn insert_instance(&self, project: &str, zone: &str, request: InstanceRequest)
        -> Result<()>;

    /// Look up an instance; `None` when it does not exist
    async fn get_instance(&self, project: &str, zone: &str, name: &str)
        -> Result<Option<GceInstance>>;

    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> Result<()>;
}
