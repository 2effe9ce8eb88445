//! In-memory cloud
//!
//! Implements every backend port against shared in-process state. Used by the
//! provisioner and actuator tests and by the binary's simulated mode.
//!
//! Simulated lifecycles:
//! - EC2 instances launch `pending` and report `running` once described by id
//! - bare-metal devices launch `queued` and report `active` once fetched by id
//! - GCE address inserts complete when their region operation is polled
//! - Azure VM deletes report in-progress once before completing

use super::aws::{Ec2Api, Ec2Instance, ElasticIp, InstanceFilter, RunInstanceRequest, NAME_TAG};
use super::azure::{AzureApi, AzureVm, DeleteOutcome, NicRequest, PublicIp, VmRequest};
use super::gce::{ComputeApi, GceAddress, GceInstance, GceOperation, InstanceRequest, OPERATION_DONE};
use super::metal::{DeviceAddress, DeviceCreateRequest, IpReservation, MetalApi, MetalDevice, STATE_ACTIVE};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};

type Key2 = (String, String);
type Key3 = (String, String, String);

fn key2(a: &str, b: &str) -> Key2 {
    (a.to_string(), b.to_string())
}

fn key3(a: &str, b: &str, c: &str) -> Key3 {
    (a.to_string(), b.to_string(), c.to_string())
}

#[derive(Debug)]
struct SimVm {
    vm: AzureVm,
    deleting: bool,
}

#[derive(Debug)]
struct SimReservation {
    project_id: String,
    reservation: IpReservation,
    available: Vec<String>,
}

#[derive(Debug, Clone)]
struct SimDevice {
    project_id: String,
    device: MetalDevice,
    request: DeviceCreateRequest,
}

#[derive(Debug, Default)]
struct CloudState {
    next_id: u64,
    calls: Vec<String>,
    failures: HashMap<String, String>,

    elastic_ips: Vec<ElasticIp>,
    ec2_instances: Vec<Ec2Instance>,
    ec2_requests: BTreeMap<String, RunInstanceRequest>,
    associations: BTreeMap<String, String>,

    azure_public_ips: BTreeMap<Key2, PublicIp>,
    azure_nics: BTreeMap<Key2, NicRequest>,
    azure_vms: BTreeMap<Key2, SimVm>,
    azure_vm_requests: BTreeMap<Key2, VmRequest>,
    azure_disks: BTreeMap<Key2, ()>,

    gce_addresses: BTreeMap<Key3, GceAddress>,
    gce_operations: BTreeMap<String, Key3>,
    gce_instances: BTreeMap<Key3, (GceInstance, InstanceRequest)>,

    metal_reservations: Vec<SimReservation>,
    metal_devices: Vec<SimDevice>,
}

impl CloudState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn next_ip(&mut self, first_octets: [u8; 3]) -> IpAddr {
        let n = self.next_id();
        IpAddr::V4(Ipv4Addr::new(
            first_octets[0],
            first_octets[1],
            first_octets[2],
            (n % 250) as u8 + 1,
        ))
    }

    fn record(&mut self, backend: &str, operation: &str) -> Result<()> {
        self.calls.push(operation.to_string());
        match self.failures.remove(operation) {
            Some(reason) => Err(Error::cloud(backend, operation, reason)),
            None => Ok(()),
        }
    }
}

/// Simulated cloud implementing all four backend ports
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    state: Mutex<CloudState>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== Test Controls =====

    /// Make the next call to `operation` fail with `reason`
    pub fn fail_next(&self, operation: &str, reason: &str) {
        self.state
            .lock()
            .failures
            .insert(operation.to_string(), reason.to_string());
    }

    /// Every operation called so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.as_str() == operation)
            .count()
    }

    /// Register a pre-provisioned bare-metal block and its available /32 addresses
    pub fn add_metal_block(&self, project_id: &str, network: &str, cidr: u8, available: &[&str]) {
        let mut state = self.state.lock();
        let id = format!("ipres-{}", state.next_id());
        state.metal_reservations.push(SimReservation {
            project_id: project_id.to_string(),
            reservation: IpReservation {
                id,
                network: network.to_string(),
                cidr,
            },
            available: available.iter().map(|a| format!("{}/32", a)).collect(),
        });
    }

    // ===== Inspection =====

    pub fn elastic_ips(&self) -> Vec<ElasticIp> {
        self.state.lock().elastic_ips.clone()
    }

    pub fn ec2_instances(&self) -> Vec<Ec2Instance> {
        self.state.lock().ec2_instances.clone()
    }

    pub fn ec2_request(&self, instance_id: &str) -> Option<RunInstanceRequest> {
        self.state.lock().ec2_requests.get(instance_id).cloned()
    }

    /// Elastic IP allocation id -> network interface id
    pub fn associations(&self) -> BTreeMap<String, String> {
        self.state.lock().associations.clone()
    }

    pub fn azure_public_ips(&self) -> Vec<PublicIp> {
        self.state.lock().azure_public_ips.values().cloned().collect()
    }

    pub fn azure_nic(&self, resource_group: &str, name: &str) -> Option<NicRequest> {
        self.state
            .lock()
            .azure_nics
            .get(&key2(resource_group, name))
            .cloned()
    }

    pub fn azure_vm_request(&self, resource_group: &str, name: &str) -> Option<VmRequest> {
        self.state
            .lock()
            .azure_vm_requests
            .get(&key2(resource_group, name))
            .cloned()
    }

    pub fn azure_disk_exists(&self, resource_group: &str, name: &str) -> bool {
        self.state
            .lock()
            .azure_disks
            .contains_key(&key2(resource_group, name))
    }

    pub fn gce_addresses(&self) -> Vec<GceAddress> {
        self.state.lock().gce_addresses.values().cloned().collect()
    }

    pub fn gce_instance_request(&self, project: &str, zone: &str, name: &str) -> Option<InstanceRequest> {
        self.state
            .lock()
            .gce_instances
            .get(&key3(project, zone, name))
            .map(|(_, request)| request.clone())
    }

    pub fn metal_devices(&self) -> Vec<MetalDevice> {
        self.state
            .lock()
            .metal_devices
            .iter()
            .map(|d| d.device.clone())
            .collect()
    }

    pub fn metal_request(&self, hostname: &str) -> Option<DeviceCreateRequest> {
        self.state
            .lock()
            .metal_devices
            .iter()
            .find(|d| d.device.hostname == hostname)
            .map(|d| d.request.clone())
    }

    pub fn metal_assigned(&self, device_id: &str) -> Vec<String> {
        self.state
            .lock()
            .metal_devices
            .iter()
            .find(|d| d.device.id == device_id)
            .map(|d| {
                d.device
                    .ip_addresses
                    .iter()
                    .map(|a| format!("{}/{}", a.address, a.cidr))
                    .collect()
            })
            .unwrap_or_default()
    }
}

// =============================================================================
// EC2
// =============================================================================

#[async_trait]
impl Ec2Api for InMemoryCloud {
    async fn describe_addresses_by_name(&self, _region: &str, name: &str) -> Result<Vec<ElasticIp>> {
        let mut state = self.state.lock();
        state.record("aws", "DescribeAddresses")?;
        Ok(state
            .elastic_ips
            .iter()
            .filter(|a| a.tags.get(NAME_TAG).map(String::as_str) == Some(name))
            .cloned()
            .collect())
    }

    async fn allocate_address(&self, _region: &str) -> Result<ElasticIp> {
        let mut state = self.state.lock();
        state.record("aws", "AllocateAddress")?;
        let public_ip = state.next_ip([203, 0, 113]);
        let address = ElasticIp {
            allocation_id: format!("eipalloc-{}", state.next_id()),
            public_ip,
            network_interface_id: None,
            tags: BTreeMap::new(),
        };
        state.elastic_ips.push(address.clone());
        Ok(address)
    }

    async fn release_address(&self, _region: &str, allocation_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record("aws", "ReleaseAddress")?;
        let before = state.elastic_ips.len();
        state.elastic_ips.retain(|a| a.allocation_id != allocation_id);
        if state.elastic_ips.len() == before {
            return Err(Error::not_found("ElasticIp", allocation_id));
        }
        state.associations.remove(allocation_id);
        Ok(())
    }

    async fn create_tags(
        &self,
        _region: &str,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.record("aws", "CreateTags")?;
        if let Some(address) = state
            .elastic_ips
            .iter_mut()
            .find(|a| a.allocation_id == resource_id)
        {
            address.tags.extend(tags.clone());
            return Ok(());
        }
        if let Some(instance) = state
            .ec2_instances
            .iter_mut()
            .find(|i| i.instance_id == resource_id)
        {
            instance.tags.extend(tags.clone());
            return Ok(());
        }
        Err(Error::not_found("Ec2Resource", resource_id))
    }

    async fn run_instance(&self, _region: &str, request: RunInstanceRequest) -> Result<Ec2Instance> {
        let mut state = self.state.lock();
        state.record("aws", "RunInstances")?;
        let id = state.next_id();
        let instance = Ec2Instance {
            instance_id: format!("i-{:08x}", id),
            state: "pending".to_string(),
            network_interface_ids: vec![format!("eni-{:08x}", id)],
            tags: request.tags.clone(),
        };
        state
            .ec2_requests
            .insert(instance.instance_id.clone(), request);
        state.ec2_instances.push(instance.clone());
        Ok(instance)
    }

    async fn describe_instances(
        &self,
        _region: &str,
        filter: &InstanceFilter,
    ) -> Result<Vec<Ec2Instance>> {
        let mut state = self.state.lock();
        state.record("aws", "DescribeInstances")?;
        Ok(state
            .ec2_instances
            .iter()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect())
    }

    async fn describe_instance(&self, _region: &str, instance_id: &str) -> Result<Option<Ec2Instance>> {
        let mut state = self.state.lock();
        state.record("aws", "DescribeInstances")?;
        let instance = state
            .ec2_instances
            .iter_mut()
            .find(|i| i.instance_id == instance_id);
        Ok(instance.map(|i| {
            if i.state == "pending" {
                i.state = "running".to_string();
            }
            i.clone()
        }))
    }

    async fn associate_address(
        &self,
        _region: &str,
        allocation_id: &str,
        network_interface_id: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.record("aws", "AssociateAddress")?;
        let address = state
            .elastic_ips
            .iter_mut()
            .find(|a| a.allocation_id == allocation_id)
            .ok_or_else(|| Error::not_found("ElasticIp", allocation_id))?;
        address.network_interface_id = Some(network_interface_id.to_string());
        state
            .associations
            .insert(allocation_id.to_string(), network_interface_id.to_string());
        Ok(())
    }

    async fn terminate_instance(&self, _region: &str, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record("aws", "TerminateInstances")?;
        match state
            .ec2_instances
            .iter_mut()
            .find(|i| i.instance_id == instance_id)
        {
            Some(instance) => {
                instance.state = "terminated".to_string();
                Ok(())
            }
            None => Err(Error::not_found("Instance", instance_id)),
        }
    }
}

// =============================================================================
// Azure
// =============================================================================

#[async_trait]
impl AzureApi for InMemoryCloud {
    async fn get_subnet(&self, resource_group: &str, network: &str, subnet: &str) -> Result<String> {
        let mut state = self.state.lock();
        state.record("azure", "Subnets.Get")?;
        Ok(format!(
            "/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}/subnets/{}",
            resource_group, network, subnet
        ))
    }

    async fn list_public_ips(&self, resource_group: &str) -> Result<Vec<PublicIp>> {
        let mut state = self.state.lock();
        state.record("azure", "PublicIPAddresses.List")?;
        Ok(state
            .azure_public_ips
            .iter()
            .filter(|((rg, _), _)| rg == resource_group)
            .map(|(_, ip)| ip.clone())
            .collect())
    }

    async fn create_public_ip(&self, resource_group: &str, name: &str, _location: &str) -> Result<PublicIp> {
        let mut state = self.state.lock();
        state.record("azure", "PublicIPAddresses.CreateOrUpdate")?;
        let ip_address = state.next_ip([198, 51, 100]);
        let ip = PublicIp {
            id: format!(
                "/resourceGroups/{}/providers/Microsoft.Network/publicIPAddresses/{}",
                resource_group, name
            ),
            name: name.to_string(),
            ip_address: Some(ip_address),
        };
        state
            .azure_public_ips
            .insert(key2(resource_group, name), ip.clone());
        Ok(ip)
    }

    async fn delete_public_ip(&self, resource_group: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record("azure", "PublicIPAddresses.Delete")?;
        state
            .azure_public_ips
            .remove(&key2(resource_group, name))
            .map(|_| ())
            .ok_or_else(|| Error::not_found("PublicIPAddress", name))
    }

    async fn create_nic(&self, resource_group: &str, request: NicRequest) -> Result<String> {
        let mut state = self.state.lock();
        state.record("azure", "Interfaces.CreateOrUpdate")?;
        let id = format!(
            "/resourceGroups/{}/providers/Microsoft.Network/networkInterfaces/{}",
            resource_group, request.name
        );
        state
            .azure_nics
            .insert(key2(resource_group, &request.name), request);
        Ok(id)
    }

    async fn delete_nic(&self, resource_group: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record("azure", "Interfaces.Delete")?;
        state
            .azure_nics
            .remove(&key2(resource_group, name))
            .map(|_| ())
            .ok_or_else(|| Error::not_found("NetworkInterface", name))
    }

    async fn create_vm(&self, resource_group: &str, request: VmRequest) -> Result<()> {
        let mut state = self.state.lock();
        state.record("azure", "VirtualMachines.CreateOrUpdate")?;
        let vm = AzureVm {
            id: format!(
                "/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{}",
                resource_group, request.name
            ),
            name: request.name.clone(),
            provisioning_state: "Succeeded".to_string(),
            tags: request.tags.clone(),
        };
        state
            .azure_disks
            .insert(key2(resource_group, &request.os_disk_name), ());
        state.azure_vms.insert(
            key2(resource_group, &request.name),
            SimVm {
                vm,
                deleting: false,
            },
        );
        state
            .azure_vm_requests
            .insert(key2(resource_group, &request.name), request);
        Ok(())
    }

    async fn get_vm(&self, resource_group: &str, name: &str) -> Result<Option<AzureVm>> {
        let mut state = self.state.lock();
        state.record("azure", "VirtualMachines.Get")?;
        Ok(state
            .azure_vms
            .get(&key2(resource_group, name))
            .map(|sim| sim.vm.clone()))
    }

    async fn delete_vm(&self, resource_group: &str, name: &str) -> Result<DeleteOutcome> {
        let mut state = self.state.lock();
        state.record("azure", "VirtualMachines.Delete")?;
        let key = key2(resource_group, name);
        let settled = match state.azure_vms.get_mut(&key) {
            None => return Ok(DeleteOutcome::Completed),
            Some(sim) if sim.deleting => true,
            Some(sim) => {
                sim.deleting = true;
                sim.vm.provisioning_state = "Deleting".to_string();
                false
            }
        };

        if settled {
            state.azure_vms.remove(&key);
            Ok(DeleteOutcome::Completed)
        } else {
            Ok(DeleteOutcome::InProgress)
        }
    }

    async fn delete_disk(&self, resource_group: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record("azure", "Disks.Delete")?;
        state
            .azure_disks
            .remove(&key2(resource_group, name))
            .ok_or_else(|| Error::not_found("Disk", name))
    }
}

// =============================================================================
// GCE
// =============================================================================

#[async_trait]
impl ComputeApi for InMemoryCloud {
    async fn list_addresses(&self, project: &str, region: &str) -> Result<Vec<GceAddress>> {
        let mut state = self.state.lock();
        state.record("gce", "Addresses.List")?;
        Ok(state
            .gce_addresses
            .iter()
            .filter(|((p, r, _), _)| p == project && r == region)
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn insert_address(&self, project: &str, region: &str, name: &str) -> Result<GceOperation> {
        let mut state = self.state.lock();
        state.record("gce", "Addresses.Insert")?;
        let op = GceOperation {
            name: format!("operation-{}", state.next_id()),
            status: "RUNNING".to_string(),
        };
        state
            .gce_operations
            .insert(op.name.clone(), key3(project, region, name));
        Ok(op)
    }

    async fn get_region_operation(&self, _project: &str, _region: &str, operation: &str) -> Result<GceOperation> {
        let mut state = self.state.lock();
        state.record("gce", "RegionOperations.Get")?;
        let target = state
            .gce_operations
            .remove(operation)
            .ok_or_else(|| Error::not_found("Operation", operation))?;

        let address = state.next_ip([192, 0, 2]);
        let name = target.2.clone();
        state.gce_addresses.insert(
            target,
            GceAddress {
                name,
                address: Some(address),
            },
        );
        Ok(GceOperation {
            name: operation.to_string(),
            status: OPERATION_DONE.to_string(),
        })
    }

    async fn delete_address(&self, project: &str, region: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record("gce", "Addresses.Delete")?;
        state
            .gce_addresses
            .remove(&key3(project, region, name))
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Address", name))
    }

    async fn insert_instance(&self, project: &str, zone: &str, request: InstanceRequest) -> Result<()> {
        let mut state = self.state.lock();
        state.record("gce", "Instances.Insert")?;
        let key = key3(project, zone, &request.name);
        if state.gce_instances.contains_key(&key) {
            return Err(Error::exists("Instance", &request.name));
        }
        let instance = GceInstance {
            name: request.name.clone(),
            status: "PROVISIONING".to_string(),
            labels: request.labels.clone(),
        };
        state.gce_instances.insert(key, (instance, request));
        Ok(())
    }

    async fn get_instance(&self, project: &str, zone: &str, name: &str) -> Result<Option<GceInstance>> {
        let mut state = self.state.lock();
        state.record("gce", "Instances.Get")?;
        Ok(state
            .gce_instances
            .get(&key3(project, zone, name))
            .map(|(instance, _)| instance.clone()))
    }

    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record("gce", "Instances.Delete")?;
        state
            .gce_instances
            .remove(&key3(project, zone, name))
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Instance", name))
    }
}

// =============================================================================
// Bare Metal
// =============================================================================

#[async_trait]
impl MetalApi for InMemoryCloud {
    async fn list_ip_reservations(&self, project_id: &str) -> Result<Vec<IpReservation>> {
        let mut state = self.state.lock();
        state.record("packet", "ProjectIPs.List")?;
        Ok(state
            .metal_reservations
            .iter()
            .filter(|r| r.project_id == project_id)
            .map(|r| r.reservation.clone())
            .collect())
    }

    async fn available_addresses(&self, reservation_id: &str, cidr: u8) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.record("packet", "ProjectIPs.AvailableAddresses")?;
        let reservation = state
            .metal_reservations
            .iter()
            .find(|r| r.reservation.id == reservation_id)
            .ok_or_else(|| Error::not_found("IpReservation", reservation_id))?;
        let suffix = format!("/{}", cidr);
        let taken: Vec<String> = state
            .metal_devices
            .iter()
            .flat_map(|d| d.device.ip_addresses.iter())
            .map(|a| format!("{}/{}", a.address, a.cidr))
            .collect();
        Ok(reservation
            .available
            .iter()
            .filter(|a| a.ends_with(&suffix) && !taken.contains(a))
            .cloned()
            .collect())
    }

    async fn create_device(&self, request: DeviceCreateRequest) -> Result<MetalDevice> {
        let mut state = self.state.lock();
        state.record("packet", "Devices.Create")?;
        let device = MetalDevice {
            id: format!("device-{}", state.next_id()),
            hostname: request.hostname.clone(),
            state: "queued".to_string(),
            tags: request.tags.clone(),
            ip_addresses: Vec::new(),
        };
        state.metal_devices.push(SimDevice {
            project_id: request.project_id.clone(),
            device: device.clone(),
            request,
        });
        Ok(device)
    }

    async fn list_devices(&self, project_id: &str) -> Result<Vec<MetalDevice>> {
        let mut state = self.state.lock();
        state.record("packet", "Devices.List")?;
        Ok(state
            .metal_devices
            .iter()
            .filter(|d| d.project_id == project_id)
            .map(|d| d.device.clone())
            .collect())
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<MetalDevice>> {
        let mut state = self.state.lock();
        state.record("packet", "Devices.Get")?;
        Ok(state
            .metal_devices
            .iter_mut()
            .find(|d| d.device.id == device_id)
            .map(|d| {
                d.device.state = STATE_ACTIVE.to_string();
                d.device.clone()
            }))
    }

    async fn assign_ip(&self, device_id: &str, address: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record("packet", "DeviceIPs.Assign")?;
        let device = state
            .metal_devices
            .iter_mut()
            .find(|d| d.device.id == device_id)
            .ok_or_else(|| Error::not_found("Device", device_id))?;
        let (host, cidr) = address
            .split_once('/')
            .ok_or_else(|| Error::cloud("packet", "DeviceIPs.Assign", format!("{} has no prefix", address)))?;
        let cidr = cidr
            .parse()
            .map_err(|_| Error::cloud("packet", "DeviceIPs.Assign", format!("bad prefix in {}", address)))?;
        device.device.ip_addresses.push(DeviceAddress {
            address: host.to_string(),
            cidr,
        });
        Ok(())
    }

    async fn delete_device(&self, device_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record("packet", "Devices.Delete")?;
        let before = state.metal_devices.len();
        state.metal_devices.retain(|d| d.device.id != device_id);
        if state.metal_devices.len() == before {
            return Err(Error::not_found("Device", device_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let cloud = InMemoryCloud::new();
        cloud.fail_next("AllocateAddress", "AddressLimitExceeded");

        assert_matches!(
            cloud.allocate_address("us-east-1").await,
            Err(Error::Cloud { .. })
        );
        assert!(cloud.allocate_address("us-east-1").await.is_ok());
        assert_eq!(cloud.call_count("AllocateAddress"), 2);
    }

    #[tokio::test]
    async fn test_ec2_instance_boots_when_described() {
        let cloud = InMemoryCloud::new();
        let instance = cloud
            .run_instance("us-east-1", RunInstanceRequest::default())
            .await
            .unwrap();
        assert_eq!(instance.state, "pending");

        let described = cloud
            .describe_instance("us-east-1", &instance.instance_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(described.state, "running");
    }

    #[tokio::test]
    async fn test_azure_delete_reports_progress_once() {
        let cloud = InMemoryCloud::new();
        assert_eq!(cloud.delete_vm("rg", "vm").await.unwrap(), DeleteOutcome::Completed);

        cloud
            .create_vm(
                "rg",
                VmRequest {
                    name: "vm".into(),
                    location: "westus".into(),
                    vm_size: "Standard_B2s".into(),
                    image_id: "img".into(),
                    os_disk_name: "vm-os-disk".into(),
                    os_disk_size_gb: None,
                    admin_username: "talosuser".into(),
                    admin_password: "x".into(),
                    custom_data: String::new(),
                    nic_id: "nic".into(),
                    tags: BTreeMap::new(),
                },
            )
            .await
            .unwrap();

        assert_eq!(cloud.delete_vm("rg", "vm").await.unwrap(), DeleteOutcome::InProgress);
        assert!(cloud.get_vm("rg", "vm").await.unwrap().is_some());
        assert_eq!(cloud.delete_vm("rg", "vm").await.unwrap(), DeleteOutcome::Completed);
        assert!(cloud.get_vm("rg", "vm").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_gce_address_appears_after_operation() {
        let cloud = InMemoryCloud::new();
        let op = cloud.insert_address("p", "us-central1", "demo-master-0-ip").await.unwrap();
        assert!(!op.is_done());
        assert!(cloud.list_addresses("p", "us-central1").await.unwrap().is_empty());

        let op = cloud.get_region_operation("p", "us-central1", &op.name).await.unwrap();
        assert!(op.is_done());
        assert_eq!(cloud.list_addresses("p", "us-central1").await.unwrap().len(), 1);
    }
}
