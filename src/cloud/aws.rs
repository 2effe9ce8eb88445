//! EC2 capability port

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Tag key carrying a resource's name
pub const NAME_TAG: &str = "Name";

/// Tag key carrying the owning cluster's name
pub const CLUSTER_TAG: &str = "TalosClusterName";

/// Instance states considered live for lookups
pub const LIVE_STATES: [&str; 3] = ["running", "pending", "stopped"];

/// An elastic IP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElasticIp {
    pub allocation_id: String,
    pub public_ip: IpAddr,
    /// Interface the address is associated with, if any
    pub network_interface_id: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// An EC2 instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ec2Instance {
    pub instance_id: String,
    pub state: String,
    pub network_interface_ids: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

/// Parameters for launching exactly one instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunInstanceRequest {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub security_group_ids: Vec<String>,
    pub root_volume_size_gb: Option<u32>,
    /// Base64-encoded user data
    pub user_data: String,
    /// Tags applied at launch
    pub tags: BTreeMap<String, String>,
}

/// Tag and state filter for instance lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFilter {
    pub tags: BTreeMap<String, String>,
    pub states: Vec<String>,
}

impl InstanceFilter {
    /// Live instances named `machine` in `cluster`
    pub fn for_machine(cluster: &str, machine: &str) -> Self {
        Self {
            tags: BTreeMap::from([
                (NAME_TAG.to_string(), machine.to_string()),
                (CLUSTER_TAG.to_string(), cluster.to_string()),
            ]),
            states: LIVE_STATES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn matches(&self, instance: &Ec2Instance) -> bool {
        self.states.iter().any(|s| *s == instance.state)
            && self
                .tags
                .iter()
                .all(|(k, v)| instance.tags.get(k) == Some(v))
    }
}

/// Subset of the EC2 API used by the AWS provisioner
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// Elastic IPs whose `Name` tag equals `name`
    async fn describe_addresses_by_name(&self, region: &str, name: &str) -> Result<Vec<ElasticIp>>;

    /// Allocate a VPC elastic IP
    async fn allocate_address(&self, region: &str) -> Result<ElasticIp>;

    async fn release_address(&self, region: &str, allocation_id: &str) -> Result<()>;

    async fn create_tags(
        &self,
        region: &str,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;

    async fn run_instance(&self, region: &str, request: RunInstanceRequest) -> Result<Ec2Instance>;

    async fn describe_instances(
        &self,
        region: &str,
        filter: &InstanceFilter,
    ) -> Result<Vec<Ec2Instance>>;

    /// Look up one instance by id
    async fn describe_instance(&self, region: &str, instance_id: &str)
        -> Result<Option<Ec2Instance>>;

    async fn associate_address(
        &self,
        region: &str,
        allocation_id: &str,
        network_interface_id: &str,
    ) -> Result<()>;

    async fn terminate_instance(&self, region: &str, instance_id: &str) -> Result<()>;
}
