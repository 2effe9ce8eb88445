//! Machine actuator

use crate::crd::{Cluster, Machine};
use crate::domain::{ConfigStore, MachineRole, ProvisionContext, Provisioner};
use crate::error::{Error, Result};
use crate::provisioners::ProvisionerRegistry;
use kube::ResourceExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Dispatches machine lifecycle calls to the machine's backend
pub struct MachineActuator {
    registry: Arc<ProvisionerRegistry>,
    store: Arc<dyn ConfigStore>,
}

impl MachineActuator {
    pub fn new(registry: Arc<ProvisionerRegistry>, store: Arc<dyn ConfigStore>) -> Self {
        Self { registry, store }
    }

    fn dispatch(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        cancel: CancellationToken,
    ) -> Result<(MachineRole, Arc<dyn Provisioner>, ProvisionContext)> {
        let role = MachineRole::parse(&cluster.name_any(), &machine.name_any())?;
        let spec = machine.provider_spec()?;
        let provisioner = self.registry.resolve(&spec.platform.kind)?;
        Ok((role, provisioner, ProvisionContext::new(self.store.clone(), cancel)))
    }

    pub async fn create(&self, cluster: &Cluster, machine: &Machine, cancel: CancellationToken) -> Result<()> {
        let (role, provisioner, ctx) = self.dispatch(cluster, machine, cancel)?;
        info!(
            machine = %machine.name_any(),
            cluster = %cluster.name_any(),
            backend = provisioner.name(),
            role = %role,
            "Creating machine"
        );
        provisioner.create(&ctx, cluster, machine).await
    }

    pub async fn update(&self, cluster: &Cluster, machine: &Machine, cancel: CancellationToken) -> Result<()> {
        let (_, provisioner, ctx) = self.dispatch(cluster, machine, cancel)?;
        provisioner.update(&ctx, cluster, machine).await
    }

    pub async fn delete(&self, cluster: &Cluster, machine: &Machine, cancel: CancellationToken) -> Result<()> {
        let (role, provisioner, ctx) = match self.dispatch(cluster, machine, cancel) {
            Ok(dispatch) => dispatch,
            // Creation fails before any cloud call for these, nothing can exist
            Err(e @ Error::MalformedMachineName { .. }) => {
                warn!(machine = %machine.name_any(), error = %e, "Skipping delete of unparseable machine");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        info!(
            machine = %machine.name_any(),
            backend = provisioner.name(),
            role = %role,
            "Deleting machine"
        );
        provisioner.delete(&ctx, cluster, machine).await
    }

    /// Whether the machine's instance exists; lookup failures are errors, never `false`
    pub async fn exists(&self, cluster: &Cluster, machine: &Machine, cancel: CancellationToken) -> Result<bool> {
        let (_, provisioner, ctx) = self.dispatch(cluster, machine, cancel)?;
        provisioner.exists(&ctx, cluster, machine).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::tests::StaticLister;
    use crate::actuators::ClusterActuator;
    use crate::cloud::InMemoryCloud;
    use crate::crd::cluster::tests::cluster;
    use crate::crd::machine::tests::machine;
    use crate::provisioners::{CloudClients, ProvisionerSettings};
    use crate::store::MemoryConfigStore;
    use assert_matches::assert_matches;

    const PACKET_CLUSTER: &str = "projectid: p1\nipblock: 147.75.0.0/29\n";
    const PACKET_MACHINE: &str = "\
projectid: p1
instances:
  plan: c3.small.x86
  facility: ewr1
  pxeurl: http://boot.example/ipxe
";

    struct Harness {
        cloud: Arc<InMemoryCloud>,
        clusters: ClusterActuator,
        machines: MachineActuator,
    }

    fn harness() -> Harness {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.add_metal_block("p1", "147.75.0.0", 29, &["147.75.0.2", "147.75.0.3", "147.75.0.4"]);
        let registry = Arc::new(ProvisionerRegistry::new(
            CloudClients::simulated(cloud.clone()),
            ProvisionerSettings::default(),
        ));
        let store = Arc::new(MemoryConfigStore::new());
        Harness {
            cloud,
            clusters: ClusterActuator::new(registry.clone(), store.clone(), Arc::new(StaticLister::default())),
            machines: MachineActuator::new(registry, store),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_cluster_bootstraps_second_master() {
        let h = harness();
        let c = cluster("demo", 3, "packet", PACKET_CLUSTER);
        h.clusters.reconcile(&c, CancellationToken::new()).await.unwrap();

        let m = machine("demo-master-1", "demo", "packet", PACKET_MACHINE);
        h.machines.create(&c, &m, CancellationToken::new()).await.unwrap();

        assert_eq!(h.cloud.call_count("Devices.Create"), 1);
        let request = h.cloud.metal_request("demo-master-1").unwrap();
        assert_eq!(request.tags, vec!["cluster:demo"]);
        assert!(request.userdata.contains("kind: JoinConfiguration"));
        assert!(request.userdata.contains("advertiseAddress: 147.75.0.3"));
        assert!(h.machines.exists(&c, &m, CancellationToken::new()).await.unwrap());

        h.machines.create(&c, &m, CancellationToken::new()).await.unwrap();
        assert_eq!(h.cloud.call_count("Devices.Create"), 1);
    }

    fn os_ca(userdata: &str) -> String {
        let doc: serde_yaml::Value = serde_yaml::from_str(userdata.trim_start_matches("#!talos\n")).unwrap();
        doc["security"]["os"]["ca"]["crt"].as_str().unwrap().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_masters_created_across_passes_share_authority() {
        let h = harness();
        let c = cluster("demo", 2, "packet", PACKET_CLUSTER);

        h.clusters.reconcile(&c, CancellationToken::new()).await.unwrap();
        let m0 = machine("demo-master-0", "demo", "packet", PACKET_MACHINE);
        h.machines.create(&c, &m0, CancellationToken::new()).await.unwrap();

        let addresses = h.clusters.reconcile(&c, CancellationToken::new()).await.unwrap();
        assert_eq!(addresses[1].to_string(), "147.75.0.3");
        let m1 = machine("demo-master-1", "demo", "packet", PACKET_MACHINE);
        h.machines.create(&c, &m1, CancellationToken::new()).await.unwrap();

        let init = h.cloud.metal_request("demo-master-0").unwrap();
        let join = h.cloud.metal_request("demo-master-1").unwrap();
        assert_eq!(os_ca(&init.userdata), os_ca(&join.userdata));
        assert!(join.userdata.contains("147.75.0.3/32"));
    }

    #[tokio::test]
    async fn test_malformed_name_never_reaches_cloud() {
        let h = harness();
        let c = cluster("demo", 1, "packet", PACKET_CLUSTER);
        let m = machine("demo-controller-1", "demo", "packet", PACKET_MACHINE);

        assert_matches!(
            h.machines.create(&c, &m, CancellationToken::new()).await,
            Err(Error::MalformedMachineName { .. })
        );
        assert_matches!(
            h.machines.exists(&c, &m, CancellationToken::new()).await,
            Err(Error::MalformedMachineName { .. })
        );
        h.machines.delete(&c, &m, CancellationToken::new()).await.unwrap();
        assert!(h.cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_exists_propagates_backend_errors() {
        let h = harness();
        let c = cluster("demo", 1, "packet", PACKET_CLUSTER);
        let m = machine("demo-workers", "demo", "packet", PACKET_MACHINE);

        h.cloud.fail_next("Devices.List", "503 Service Unavailable");
        assert_matches!(
            h.machines.exists(&c, &m, CancellationToken::new()).await,
            Err(Error::Cloud { .. })
        );
        assert!(!h.machines.exists(&c, &m, CancellationToken::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_is_noop_and_delete_is_idempotent() {
        let h = harness();
        let c = cluster("demo", 1, "packet", PACKET_CLUSTER);
        h.clusters.reconcile(&c, CancellationToken::new()).await.unwrap();
        let m = machine("demo-workers-1", "demo", "packet", PACKET_MACHINE);
        h.machines.create(&c, &m, CancellationToken::new()).await.unwrap();

        let before = h.cloud.calls().len();
        h.machines.update(&c, &m, CancellationToken::new()).await.unwrap();
        assert_eq!(h.cloud.calls().len(), before);

        h.machines.delete(&c, &m, CancellationToken::new()).await.unwrap();
        h.machines.delete(&c, &m, CancellationToken::new()).await.unwrap();
        assert!(h.cloud.metal_devices().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_backend() {
        let registry = Arc::new(ProvisionerRegistry::default());
        let actuator = MachineActuator::new(registry, Arc::new(MemoryConfigStore::new()));
        let c = cluster("demo", 1, "azure", "location: x\nresourcegroup: y\n");
        let m = machine("demo-workers", "demo", "azure", "{}\n");

        assert_matches!(
            actuator.create(&c, &m, CancellationToken::new()).await,
            Err(Error::BackendUnavailable { .. })
        );
    }
}
