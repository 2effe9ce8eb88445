//! Provisioner backends
//!
//! Provides one [`Provisioner`] per supported cloud:
//! - aws: EC2 instances with elastic IPs
//! - azure: VMs with static public IPs
//! - gce: Compute Engine instances with regional static addresses
//! - packet: bare-metal devices addressed from a pre-provisioned block

pub mod aws;
pub mod azure;
pub mod gce;
pub mod packet;

pub use aws::AwsProvisioner;
pub use azure::AzureProvisioner;
pub use gce::GceProvisioner;
pub use packet::PacketProvisioner;

use crate::cloud::{AzureApi, ComputeApi, Ec2Api, InMemoryCloud, MetalApi};
use crate::crd::{Cluster, Machine, TalosClusterProviderSpec};
use crate::domain::{MachineRole, Provisioner};
use crate::error::{Error, Result};
use crate::wait::PollPolicy;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Backend Kind
// =============================================================================

/// Closed set of supported backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Aws,
    Azure,
    Gce,
    Packet,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Aws,
        BackendKind::Azure,
        BackendKind::Gce,
        BackendKind::Packet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Aws => "aws",
            BackendKind::Azure => "azure",
            BackendKind::Gce => "gce",
            BackendKind::Packet => "packet",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "aws" => Ok(BackendKind::Aws),
            "azure" => Ok(BackendKind::Azure),
            "gce" => Ok(BackendKind::Gce),
            "packet" => Ok(BackendKind::Packet),
            _ => Err(Error::UnknownBackend {
                backend: s.to_string(),
            }),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Polling behaviour of the provisioners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionerSettings {
    /// Interval between instance status checks
    pub instance_poll_interval: Duration,
    /// Bound on waiting for an EC2 instance to run
    pub aws_running_timeout: Duration,
    /// Bound on waiting for a bare-metal device to become active
    pub packet_active_timeout: Duration,
    /// Interval between GCE region operation checks
    pub gce_operation_interval: Duration,
    /// Bound on waiting for a GCE region operation
    pub gce_operation_timeout: Duration,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            instance_poll_interval: Duration::from_secs(3),
            aws_running_timeout: Duration::from_secs(120),
            packet_active_timeout: Duration::from_secs(600),
            gce_operation_interval: Duration::from_secs(5),
            gce_operation_timeout: Duration::from_secs(300),
        }
    }
}

impl ProvisionerSettings {
    pub fn aws_running(&self) -> PollPolicy {
        PollPolicy::new(self.instance_poll_interval, self.aws_running_timeout)
    }

    pub fn packet_active(&self) -> PollPolicy {
        PollPolicy::new(self.instance_poll_interval, self.packet_active_timeout)
    }

    pub fn gce_operation(&self) -> PollPolicy {
        PollPolicy::new(self.gce_operation_interval, self.gce_operation_timeout)
    }
}

// =============================================================================
// Cloud Clients
// =============================================================================

/// Explicitly passed bundle of backend clients
#[derive(Clone, Default)]
pub struct CloudClients {
    pub ec2: Option<Arc<dyn Ec2Api>>,
    pub azure: Option<Arc<dyn AzureApi>>,
    pub compute: Option<Arc<dyn ComputeApi>>,
    pub metal: Option<Arc<dyn MetalApi>>,
}

impl CloudClients {
    /// Every backend served by one simulated cloud
    pub fn simulated(cloud: Arc<InMemoryCloud>) -> Self {
        Self {
            ec2: Some(cloud.clone()),
            azure: Some(cloud.clone()),
            compute: Some(cloud.clone()),
            metal: Some(cloud),
        }
    }

    pub fn with_metal(mut self, metal: Arc<dyn MetalApi>) -> Self {
        self.metal = Some(metal);
        self
    }

    /// Backends that have a client configured
    pub fn configured(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                BackendKind::Aws => self.ec2.is_some(),
                BackendKind::Azure => self.azure.is_some(),
                BackendKind::Gce => self.compute.is_some(),
                BackendKind::Packet => self.metal.is_some(),
            })
            .collect()
    }
}

impl fmt::Debug for CloudClients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudClients")
            .field("configured", &self.configured())
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Resolves backend identifiers to provisioners
#[derive(Debug, Clone, Default)]
pub struct ProvisionerRegistry {
    clients: CloudClients,
    settings: ProvisionerSettings,
}

impl ProvisionerRegistry {
    pub fn new(clients: CloudClients, settings: ProvisionerSettings) -> Self {
        Self { clients, settings }
    }

    /// Resolve a backend identifier such as `aws` or `packet`
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Provisioner>> {
        self.for_kind(id.parse()?)
    }

    pub fn for_kind(&self, kind: BackendKind) -> Result<Arc<dyn Provisioner>> {
        let unavailable = || Error::BackendUnavailable {
            backend: kind.to_string(),
        };
        let settings = self.settings.clone();

        let provisioner: Arc<dyn Provisioner> = match kind {
            BackendKind::Aws => {
                let ec2 = self.clients.ec2.clone().ok_or_else(unavailable)?;
                Arc::new(AwsProvisioner::new(ec2, settings))
            }
            BackendKind::Azure => {
                let azure = self.clients.azure.clone().ok_or_else(unavailable)?;
                Arc::new(AzureProvisioner::new(azure))
            }
            BackendKind::Gce => {
                let compute = self.clients.compute.clone().ok_or_else(unavailable)?;
                Arc::new(GceProvisioner::new(compute, settings))
            }
            BackendKind::Packet => {
                let metal = self.clients.metal.clone().ok_or_else(unavailable)?;
                Arc::new(PacketProvisioner::new(metal, settings))
            }
        };

        Ok(provisioner)
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Validated cluster provider spec plus the backend's cluster configuration
pub(crate) fn cluster_config<T: DeserializeOwned>(
    cluster: &Cluster,
) -> Result<(TalosClusterProviderSpec, T)> {
    let spec = cluster.provider_spec()?;
    let config = spec.platform.parse_config("Cluster", &cluster.name_any())?;
    Ok((spec, config))
}

/// The backend's machine configuration
pub(crate) fn machine_config<T: DeserializeOwned>(machine: &Machine) -> Result<T> {
    let spec = machine.provider_spec()?;
    spec.platform.parse_config("Machine", &machine.name_any())
}

/// Cluster name, machine name and the role encoded in the latter
pub(crate) fn identify(cluster: &Cluster, machine: &Machine) -> Result<(String, String, MachineRole)> {
    let cluster_name = cluster.name_any();
    let machine_name = machine.name_any();
    let role = MachineRole::parse(&cluster_name, &machine_name)?;
    Ok((cluster_name, machine_name, role))
}

/// Treat not-found as success
pub(crate) fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
