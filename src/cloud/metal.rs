//! Bare-metal (Equinix Metal / Packet) capability port

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Device state once provisioning finished
pub const STATE_ACTIVE: &str = "active";

/// Operating system slug for iPXE booted devices
pub const CUSTOM_IPXE: &str = "custom_ipxe";

/// An IP block reserved for a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpReservation {
    pub id: String,
    pub network: String,
    pub cidr: u8,
}

impl IpReservation {
    /// `network/cidr`, as written in cluster configuration
    pub fn block(&self) -> String {
        format!("{}/{}", self.network, self.cidr)
    }
}

/// Device create request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCreateRequest {
    pub hostname: String,
    pub plan: String,
    pub facility: Vec<String>,
    pub operating_system: String,
    pub billing_cycle: String,
    pub project_id: String,
    pub userdata: String,
    pub ipxe_script_url: String,
    pub tags: Vec<String>,
}

/// An address assigned to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub address: String,
    pub cidr: u8,
}

/// A device as reported by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetalDevice {
    pub id: String,
    pub hostname: String,
    pub state: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ip_addresses: Vec<DeviceAddress>,
}

impl MetalDevice {
    /// Whether `address` is assigned to the device at the given prefix length
    pub fn has_address(&self, address: &str, cidr: u8) -> bool {
        self.ip_addresses
            .iter()
            .any(|a| a.address == address && a.cidr == cidr)
    }
}

/// Subset of the bare-metal API used by the Packet provisioner
#[async_trait]
pub trait MetalApi: Send + Sync {
    async fn list_ip_reservations(&self, project_id: &str) -> Result<Vec<IpReservation>>;

    /// Available addresses of a reservation at the given prefix length, as `a.b.c.d/len`
    async fn available_addresses(&self, reservation_id: &str, cidr: u8) -> Result<Vec<String>>;

    async fn create_device(&self, request: DeviceCreateRequest) -> Result<MetalDevice>;

    async fn list_devices(&self, project_id: &str) -> Result<Vec<MetalDevice>>;

    /// Look up a device; `None` when it does not exist
    async fn get_device(&self, device_id: &str) -> Result<Option<MetalDevice>>;

    /// Assign an address (`a.b.c.d/32`) from a reservation to a device
    async fn assign_ip(&self, device_id: &str, address: &str) -> Result<()>;

    async fn delete_device(&self, device_id: &str) -> Result<()>;
}
