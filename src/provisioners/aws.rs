//! AWS provisioner
//!
//! Control plane nodes reach the cluster through elastic IPs named
//! `<cluster>-master-<i>-ip`. Each one is associated with its instance's
//! primary network interface once the instance is running.

use super::{cluster_config, identify, ignore_not_found, machine_config, ProvisionerSettings};
use crate::cloud::aws::{
    Ec2Api, Ec2Instance, ElasticIp, InstanceFilter, RunInstanceRequest, CLUSTER_TAG, NAME_TAG,
};
use crate::crd::{Cluster, Machine};
use crate::domain::{external_ip_name, ProvisionContext, Provisioner};
use crate::error::{Error, Result};
use crate::store;
use crate::wait::poll_until;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::ResourceExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const BACKEND: &str = "aws";
const STATE_RUNNING: &str = "running";

// =============================================================================
// Configuration
// =============================================================================

/// Cluster-level AWS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AwsClusterConfig {
    pub region: String,
}

/// Machine-level AWS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AwsMachineConfig {
    pub region: String,
    pub instances: AwsInstanceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwsInstanceConfig {
    #[serde(rename = "type")]
    pub instance_type: String,
    pub ami: String,
    #[serde(default)]
    pub keypair: Option<String>,
    #[serde(default, rename = "securitygroups")]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub disks: Option<DiskConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskConfig {
    pub size: u32,
}

// =============================================================================
// Provisioner
// =============================================================================

/// Provisions EC2 instances
pub struct AwsProvisioner {
    ec2: Arc<dyn Ec2Api>,
    settings: ProvisionerSettings,
}

impl AwsProvisioner {
    pub fn new(ec2: Arc<dyn Ec2Api>, settings: ProvisionerSettings) -> Self {
        Self { ec2, settings }
    }

    /// The single live instance of `machine`, if any
    async fn find_instance(
        &self,
        region: &str,
        cluster: &str,
        machine: &str,
    ) -> Result<Option<Ec2Instance>> {
        let filter = InstanceFilter::for_machine(cluster, machine);
        let mut instances = self.ec2.describe_instances(region, &filter).await?;
        if instances.len() > 1 {
            return Err(Error::InstanceConflict {
                machine: machine.to_string(),
                reason: format!("{} live instances match", instances.len()),
            });
        }
        Ok(instances.pop())
    }

    async fn address_by_name(&self, region: &str, name: &str) -> Result<Option<ElasticIp>> {
        let addresses = self.ec2.describe_addresses_by_name(region, name).await?;
        Ok(addresses.into_iter().next())
    }

    async fn wait_running(&self, ctx: &ProvisionContext, region: &str, instance_id: &str) -> Result<Ec2Instance> {
        let operation = format!("instance {} to run", instance_id);
        let ec2 = &self.ec2;
        poll_until(self.settings.aws_running(), &ctx.cancel, &operation, || async move {
            let instance = ec2.describe_instance(region, instance_id).await?;
            Ok(instance.filter(|i| i.state == STATE_RUNNING))
        })
        .await
    }

    /// Associate `address` with the primary interface of `instance` once it runs
    async fn attach_address(
        &self,
        ctx: &ProvisionContext,
        region: &str,
        machine: &str,
        address: &ElasticIp,
        instance: &Ec2Instance,
    ) -> Result<()> {
        let running = self.wait_running(ctx, region, &instance.instance_id).await?;
        let interface = running
            .network_interface_ids
            .first()
            .or_else(|| instance.network_interface_ids.first())
            .ok_or_else(|| {
                Error::cloud(
                    BACKEND,
                    "AssociateAddress",
                    format!("instance {} has no network interface", instance.instance_id),
                )
            })?;

        if address.network_interface_id.as_ref() == Some(interface) {
            debug!(machine = %machine, address = %address.public_ip, "Elastic IP already associated");
            return Ok(());
        }

        self.ec2
            .associate_address(region, &address.allocation_id, interface)
            .await?;
        info!(machine = %machine, address = %address.public_ip, "Associated elastic IP");
        Ok(())
    }
}

fn is_associated(address: &ElasticIp, instance: &Ec2Instance) -> bool {
    address
        .network_interface_id
        .as_ref()
        .is_some_and(|eni| instance.network_interface_ids.contains(eni))
}

#[async_trait]
impl Provisioner for AwsProvisioner {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn create(&self, ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine) -> Result<()> {
        let (cluster_name, machine_name, role) = identify(cluster, machine)?;
        let config: AwsMachineConfig = machine_config(machine)?;
        let region = config.region.as_str();

        let existing = self.find_instance(region, &cluster_name, &machine_name).await?;

        let address = match role.ordinal() {
            Some(ordinal) => {
                let name = external_ip_name(&cluster_name, ordinal);
                let address = self
                    .address_by_name(region, &name)
                    .await?
                    .ok_or(Error::AddressNotReady { name })?;
                Some(address)
            }
            None => None,
        };

        if let Some(existing) = existing {
            info!(machine = %machine_name, instance = %existing.instance_id, "Instance already exists");
            // A previous attempt may have launched the instance but not associated its address
            match address {
                Some(address) if !is_associated(&address, &existing) => {
                    self.attach_address(ctx, region, &machine_name, &address, &existing)
                        .await?;
                }
                _ => {}
            }
            return Ok(());
        }

        let payload = store::fetch_boot_payload(ctx.store.as_ref(), &cluster_name, role).await?;

        let request = RunInstanceRequest {
            image_id: config.instances.ami.clone(),
            instance_type: config.instances.instance_type.clone(),
            key_name: config.instances.keypair.clone(),
            security_group_ids: config.instances.security_groups.clone(),
            root_volume_size_gb: config.instances.disks.as_ref().map(|d| d.size),
            user_data: STANDARD.encode(payload.userdata),
            tags: BTreeMap::from([
                (NAME_TAG.to_string(), machine_name.clone()),
                (CLUSTER_TAG.to_string(), cluster_name.clone()),
            ]),
        };

        let instance = self.ec2.run_instance(region, request).await?;
        info!(
            machine = %machine_name,
            instance = %instance.instance_id,
            role = %role,
            "Launched instance"
        );

        if let Some(address) = address {
            self.attach_address(ctx, region, &machine_name, &address, &instance)
                .await?;
        }

        Ok(())
    }

    async fn update(&self, _ctx: &ProvisionContext, _cluster: &Cluster, machine: &Machine) -> Result<()> {
        debug!(machine = %machine.name_any(), "In-place update not supported, leaving instance as is");
        Ok(())
    }

    async fn delete(&self, _ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine) -> Result<()> {
        let cluster_name = cluster.name_any();
        let machine_name = machine.name_any();
        let config: AwsMachineConfig = machine_config(machine)?;

        let Some(instance) = self
            .find_instance(&config.region, &cluster_name, &machine_name)
            .await?
        else {
            debug!(machine = %machine_name, "No live instance to terminate");
            return Ok(());
        };

        ignore_not_found(
            self.ec2
                .terminate_instance(&config.region, &instance.instance_id)
                .await,
        )?;
        info!(machine = %machine_name, instance = %instance.instance_id, "Terminated instance");
        Ok(())
    }

    async fn exists(&self, _ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine) -> Result<bool> {
        let config: AwsMachineConfig = machine_config(machine)?;
        let instance = self
            .find_instance(&config.region, &cluster.name_any(), &machine.name_any())
            .await?;
        Ok(instance.is_some())
    }

    async fn allocate_external_ips(
        &self,
        _ctx: &ProvisionContext,
        cluster: &Cluster,
        count: usize,
    ) -> Result<Vec<IpAddr>> {
        let (_, config): (_, AwsClusterConfig) = cluster_config(cluster)?;
        let cluster_name = cluster.name_any();
        let mut ips = Vec::with_capacity(count);

        for ordinal in 0..count {
            let name = external_ip_name(&cluster_name, ordinal);
            let address = match self.address_by_name(&config.region, &name).await? {
                Some(existing) => {
                    debug!(name = %name, ip = %existing.public_ip, "Reusing elastic IP");
                    existing
                }
                None => {
                    let allocated = self.ec2.allocate_address(&config.region).await?;
                    let tags = BTreeMap::from([(NAME_TAG.to_string(), name.clone())]);
                    self.ec2
                        .create_tags(&config.region, &allocated.allocation_id, &tags)
                        .await?;
                    info!(name = %name, ip = %allocated.public_ip, "Allocated elastic IP");
                    allocated
                }
            };
            ips.push(address.public_ip);
        }

        Ok(ips)
    }

    async fn deallocate_external_ips(&self, _ctx: &ProvisionContext, cluster: &Cluster) -> Result<()> {
        let (spec, config): (_, AwsClusterConfig) = cluster_config(cluster)?;
        let cluster_name = cluster.name_any();

        for ordinal in 0..spec.control_plane.count {
            let name = external_ip_name(&cluster_name, ordinal);
            let Some(address) = self.address_by_name(&config.region, &name).await? else {
                debug!(name = %name, "Elastic IP already released");
                continue;
            };
            match self.ec2.release_address(&config.region, &address.allocation_id).await {
                Ok(()) => info!(name = %name, ip = %address.public_ip, "Released elastic IP"),
                Err(e) if e.is_not_found() => warn!(name = %name, "Elastic IP vanished during release"),
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}
