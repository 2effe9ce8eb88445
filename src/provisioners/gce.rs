//! Google Compute Engine provisioner
//!
//! Static addresses are regional while instances are zonal; a machine's
//! region is its zone with the trailing `-<letter>` removed.

use super::{cluster_config, identify, ignore_not_found, machine_config, ProvisionerSettings};
use crate::cloud::gce::{ComputeApi, GceAddress, InstanceRequest, CLUSTER_LABEL, USER_DATA_METADATA_KEY};
use crate::crd::{Cluster, Machine};
use crate::domain::{external_ip_name, ProvisionContext, Provisioner};
use crate::error::{Error, Result};
use crate::store;
use crate::wait::poll_until;
use async_trait::async_trait;
use kube::ResourceExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

const BACKEND: &str = "gce";

// =============================================================================
// Configuration
// =============================================================================

/// Cluster-level GCE configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GceClusterConfig {
    pub region: String,
    pub project: String,
}

/// Machine-level GCE configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GceMachineConfig {
    pub zone: String,
    pub project: String,
    pub instances: GceInstanceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GceInstanceConfig {
    #[serde(rename = "type")]
    pub machine_type: String,
    pub image: String,
    #[serde(default)]
    pub disks: Option<GceDiskConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GceDiskConfig {
    pub size: u32,
}

/// Region containing `zone`, e.g. `us-central1` for `us-central1-a`
pub fn region_from_zone(zone: &str) -> Result<&str> {
    match zone.rsplit_once('-') {
        Some((region, suffix)) if !region.is_empty() && !suffix.is_empty() => Ok(region),
        _ => Err(Error::Configuration(format!("zone {} has no region prefix", zone))),
    }
}

// =============================================================================
// Provisioner
// =============================================================================

/// Provisions Compute Engine instances
pub struct GceProvisioner {
    compute: Arc<dyn ComputeApi>,
    settings: ProvisionerSettings,
}

impl GceProvisioner {
    pub fn new(compute: Arc<dyn ComputeApi>, settings: ProvisionerSettings) -> Self {
        Self { compute, settings }
    }

    async fn address(&self, project: &str, region: &str, name: &str) -> Result<Option<GceAddress>> {
        let addresses = self.compute.list_addresses(project, region).await?;
        Ok(addresses.into_iter().find(|a| a.name == name))
    }

    /// Reserve `name`, waiting for the insert operation to finish
    async fn reserve(&self, ctx: &ProvisionContext, project: &str, region: &str, name: &str) -> Result<GceAddress> {
        let operation = self.compute.insert_address(project, region, name).await?;
        debug!(name, operation = %operation.name, "Address insert submitted");

        if !operation.is_done() {
            let compute = &self.compute;
            let op_name = operation.name.as_str();
            let what = format!("address {} insert", name);
            poll_until(self.settings.gce_operation(), &ctx.cancel, &what, || async move {
                let op = compute.get_region_operation(project, region, op_name).await?;
                Ok(op.is_done().then_some(()))
            })
            .await?;
        }

        self.address(project, region, name)
            .await?
            .ok_or_else(|| Error::AddressNotReady {
                name: name.to_string(),
            })
    }
}

#[async_trait]
impl Provisioner for GceProvisioner {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn create(&self, ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine) -> Result<()> {
        let (cluster_name, machine_name, role) = identify(cluster, machine)?;
        let config: GceMachineConfig = machine_config(machine)?;
        let (project, zone) = (config.project.as_str(), config.zone.as_str());

        if self.compute.get_instance(project, zone, &machine_name).await?.is_some() {
            info!(machine = %machine_name, "Instance already exists");
            return Ok(());
        }

        let nat_ip = match role.ordinal() {
            Some(ordinal) => {
                let name = external_ip_name(&cluster_name, ordinal);
                let region = region_from_zone(zone)?;
                let address = self
                    .address(project, region, &name)
                    .await?
                    .and_then(|a| a.address)
                    .ok_or(Error::AddressNotReady { name })?;
                Some(address)
            }
            None => None,
        };

        let payload = store::fetch_boot_payload(ctx.store.as_ref(), &cluster_name, role).await?;

        let request = InstanceRequest {
            name: machine_name.clone(),
            machine_type: format!("zones/{}/machineTypes/{}", zone, config.instances.machine_type),
            source_image: config.instances.image.clone(),
            disk_size_gb: config.instances.disks.as_ref().map(|d| d.size),
            nat_ip,
            metadata: BTreeMap::from([(USER_DATA_METADATA_KEY.to_string(), payload.userdata)]),
            labels: BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster_name.clone())]),
        };

        match self.compute.insert_instance(project, zone, request).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                debug!(machine = %machine_name, "Instance created concurrently");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        info!(machine = %machine_name, zone, role = %role, "Inserted instance");
        Ok(())
    }

    async fn update(&self, _ctx: &ProvisionContext, _cluster: &Cluster, machine: &Machine) -> Result<()> {
        debug!(machine = %machine.name_any(), "In-place update not supported, leaving instance as is");
        Ok(())
    }

    async fn delete(&self, _ctx: &ProvisionContext, _cluster: &Cluster, machine: &Machine) -> Result<()> {
        let machine_name = machine.name_any();
        let config: GceMachineConfig = machine_config(machine)?;

        if self
            .compute
            .get_instance(&config.project, &config.zone, &machine_name)
            .await?
            .is_none()
        {
            debug!(machine = %machine_name, "No instance to delete");
            return Ok(());
        }

        ignore_not_found(
            self.compute
                .delete_instance(&config.project, &config.zone, &machine_name)
                .await,
        )?;
        info!(machine = %machine_name, "Deleted instance");
        Ok(())
    }

    async fn exists(&self, _ctx: &ProvisionContext, _cluster: &Cluster, machine: &Machine) -> Result<bool> {
        let config: GceMachineConfig = machine_config(machine)?;
        let instance = self
            .compute
            .get_instance(&config.project, &config.zone, &machine.name_any())
            .await?;
        Ok(instance.is_some())
    }

    async fn allocate_external_ips(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
        count: usize,
    ) -> Result<Vec<IpAddr>> {
        let (_, config): (_, GceClusterConfig) = cluster_config(cluster)?;
        let cluster_name = cluster.name_any();
        let (project, region) = (config.project.as_str(), config.region.as_str());
        let mut ips = Vec::with_capacity(count);

        for ordinal in 0..count {
            let name = external_ip_name(&cluster_name, ordinal);
            let address = match self.address(project, region, &name).await? {
                Some(existing) => existing,
                None => {
                    let reserved = self.reserve(ctx, project, region, &name).await?;
                    info!(name = %name, region, "Reserved static address");
                    reserved
                }
            };
            ips.push(address.address.ok_or(Error::AddressNotReady { name })?);
        }

        Ok(ips)
    }

    async fn deallocate_external_ips(&self, _ctx: &ProvisionContext, cluster: &Cluster) -> Result<()> {
        let (spec, config): (_, GceClusterConfig) = cluster_config(cluster)?;
        let cluster_name = cluster.name_any();

        for ordinal in 0..spec.control_plane.count {
            let name = external_ip_name(&cluster_name, ordinal);
            ignore_not_found(
                self.compute
                    .delete_address(&config.project, &config.region, &name)
                    .await,
            )?;
            debug!(name = %name, "Static address released");
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

    const CLUSTER_CONFIG: &str = "region: us-central1\nproject: talos-dev\n";
    const MACHINE_CONFIG: &str = "\
zone: us-central1-a
project: talos-dev
instances:
  type: n1-standard-2
  image: projects/talos-dev/global/images/talos
  disks:
    size: 50
";

    fn provisioner(cloud: &Arc<InMemoryCloud>) -> GceProvisioner {
        GceProvisioner::new(cloud.clone(), ProvisionerSettings::default())
    }

    async fn stage(store: &dyn ConfigStore, name: &str, userdata: &str) {
        let record = ConfigRecord::from([(USERDATA_KEY.to_string(), userdata.to_string())]);
        store.create(name, record).await.unwrap();
    }

    #[test]
    fn test_region_from_zone() {
        assert_eq!(region_from_zone("us-central1-a").unwrap(), "us-central1");
        assert_eq!(region_from_zone("europe-west4-b").unwrap(), "europe-west4");
        assert_matches!(region_from_zone("nowhere"), Err(Error::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_allocate_waits_for_operation() {
        let cloud = Arc::new(InMemoryCloud::new());
        let gce = provisioner(&cloud);
        let (ctx, _) = context();
        let c = cluster("demo", 2, "gce", CLUSTER_CONFIG);

        let first = gce.allocate_external_ips(&ctx, &c, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(cloud.call_count("RegionOperations.Get"), 2);

        let second = gce.allocate_external_ips(&ctx, &c, 2).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cloud.call_count("Addresses.Insert"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_master_uses_reserved_address() {
        let cloud = Arc::new(InMemoryCloud::new());
        let gce = provisioner(&cloud);
        let (ctx, store) = context();
        let c = cluster("demo", 1, "gce", CLUSTER_CONFIG);
        let ips = gce.allocate_external_ips(&ctx, &c, 1).await.unwrap();
        stage(store.as_ref(), "demo-master-0", "---\nmaster\n").await;

        let m = machine("demo-master-0", "demo", "gce", MACHINE_CONFIG);
        gce.create(&ctx, &c, &m).await.unwrap();

        let request = cloud
            .gce_instance_request("talos-dev", "us-central1-a", "demo-master-0")
            .unwrap();
        assert_eq!(request.machine_type, "zones/us-central1-a/machineTypes/n1-standard-2");
        assert_eq!(request.nat_ip, Some(ips[0]));
        assert_eq!(request.disk_size_gb, Some(50));
        assert_eq!(
            request.metadata.get(USER_DATA_METADATA_KEY).map(String::as_str),
            Some("---\nmaster\n")
        );
        assert_eq!(request.labels.get(CLUSTER_LABEL).map(String::as_str), Some("demo"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_retry_after_insert_failure() {
        let cloud = Arc::new(InMemoryCloud::new());
        let gce = provisioner(&cloud);
        let (ctx, store) = context();
        let c = cluster("demo", 1, "gce", CLUSTER_CONFIG);
        let ips = gce.allocate_external_ips(&ctx, &c, 1).await.unwrap();
        stage(store.as_ref(), "demo-master-0", "---\nmaster\n").await;
        let m = machine("demo-master-0", "demo", "gce", MACHINE_CONFIG);

        cloud.fail_next("Instances.Insert", "QUOTA_EXCEEDED");
        assert_matches!(gce.create(&ctx, &c, &m).await, Err(Error::Cloud { .. }));
        assert!(!gce.exists(&ctx, &c, &m).await.unwrap());

        gce.create(&ctx, &c, &m).await.unwrap();
        assert!(gce.exists(&ctx, &c, &m).await.unwrap());
        let request = cloud
            .gce_instance_request("talos-dev", "us-central1-a", "demo-master-0")
            .unwrap();
        assert_eq!(request.nat_ip, Some(ips[0]));

        gce.create(&ctx, &c, &m).await.unwrap();
        assert_eq!(cloud.call_count("Instances.Insert"), 2);
    }

    #[tokio::test]
    async fn test_worker_gets_ephemeral_address() {
        let cloud = Arc::new(InMemoryCloud::new());
        let gce = provisioner(&cloud);
        let (ctx, store) = context();
        let c = cluster("demo", 1, "gce", CLUSTER_CONFIG);
        stage(store.as_ref(), "demo-workers", "---\n").await;

        let m = machine("demo-workers-a", "demo", "gce", MACHINE_CONFIG);
        gce.create(&ctx, &c, &m).await.unwrap();
        gce.create(&ctx, &c, &m).await.unwrap();

        let request = cloud
            .gce_instance_request("talos-dev", "us-central1-a", "demo-workers-a")
            .unwrap();
        assert_eq!(request.nat_ip, None);
        assert_eq!(cloud.call_count("Instances.Insert"), 1);
    }

    #[tokio::test]
    async fn test_missing_payload_fails_before_insert() {
        let cloud = Arc::new(InMemoryCloud::new());
        let gce = provisioner(&cloud);
        let (ctx, _) = context();
        let c = cluster("demo", 1, "gce", CLUSTER_CONFIG);

        let m = machine("demo-workers-a", "demo", "gce", MACHINE_CONFIG);
        assert_matches!(gce.create(&ctx, &c, &m).await, Err(Error::ResourceNotFound { .. }));
        assert_eq!(cloud.call_count("Instances.Insert"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_and_deallocate_are_idempotent() {
        let cloud = Arc::new(InMemoryCloud::new());
        let gce = provisioner(&cloud);
        let (ctx, store) = context();
        let c = cluster("demo", 2, "gce", CLUSTER_CONFIG);
        gce.allocate_external_ips(&ctx, &c, 2).await.unwrap();
        stage(store.as_ref(), "demo-workers", "---\n").await;
        let m = machine("demo-workers-a", "demo", "gce", MACHINE_CONFIG);
        gce.create(&ctx, &c, &m).await.unwrap();

        gce.delete(&ctx, &c, &m).await.unwrap();
        gce.delete(&ctx, &c, &m).await.unwrap();
        assert!(!gce.exists(&ctx, &c, &m).await.unwrap());

        gce.deallocate_external_ips(&ctx, &c).await.unwrap();
        gce.deallocate_external_ips(&ctx, &c).await.unwrap();
        assert!(cloud.gce_addresses().is_empty());
    }
}
