//! Cluster actuator
//!
//! A reconcile pass allocates (or re-discovers) the control plane addresses
//! and stages one boot payload per control plane ordinal plus one shared
//! worker payload. Bootstrap material is generated only when payloads are
//! missing; once staged, the payloads are the cluster's record of its
//! certificates and tokens and later passes leave them alone.

use crate::bootstrap::BootstrapMaterial;
use crate::crd::Cluster;
use crate::domain::{
    control_plane_name, workers_record_name, ConfigRecord, ConfigStore, MachineLister,
    ProvisionContext, TALOSCONFIG_KEY, USERDATA_KEY,
};
use crate::error::{Error, Result};
use crate::provisioners::ProvisionerRegistry;
use crate::store;
use kube::ResourceExt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Converges cluster-wide resources
pub struct ClusterActuator {
    registry: Arc<ProvisionerRegistry>,
    store: Arc<dyn ConfigStore>,
    lister: Arc<dyn MachineLister>,
}

impl ClusterActuator {
    pub fn new(
        registry: Arc<ProvisionerRegistry>,
        store: Arc<dyn ConfigStore>,
        lister: Arc<dyn MachineLister>,
    ) -> Self {
        Self {
            registry,
            store,
            lister,
        }
    }

    /// Converge the cluster; returns its control plane addresses in ordinal order
    pub async fn reconcile(&self, cluster: &Cluster, cancel: CancellationToken) -> Result<Vec<IpAddr>> {
        let name = cluster.name_any();
        let spec = cluster.provider_spec()?;
        let count = spec.control_plane.count;
        let provisioner = self.registry.resolve(&spec.platform.kind)?;
        let ctx = ProvisionContext::new(self.store.clone(), cancel);

        info!(cluster = %name, backend = provisioner.name(), count, "Reconciling cluster");

        let addresses = provisioner.allocate_external_ips(&ctx, cluster, count).await?;
        if addresses.len() != count {
            return Err(Error::Internal(format!(
                "{} returned {} addresses for {} control plane nodes",
                provisioner.name(),
                addresses.len(),
                count
            )));
        }

        let records: Vec<String> = (0..count)
            .map(|ordinal| control_plane_name(&name, ordinal))
            .chain(std::iter::once(workers_record_name(&name)))
            .collect();
        let mut missing = Vec::new();
        for record in &records {
            if self.store.get(record).await?.is_none() {
                missing.push(record.as_str());
            }
        }

        if missing.is_empty() {
            debug!(cluster = %name, "Boot payloads already staged");
            info!(cluster = %name, addresses = ?addresses, "Cluster reconciled");
            return Ok(addresses);
        }

        // Fresh material would not match payloads nodes already booted from
        if missing.len() < records.len() {
            let machines = self.lister.machines_for_cluster(&name).await?;
            if !machines.is_empty() {
                return Err(Error::Configuration(format!(
                    "cluster {} has {} machines but staged payloads {} are missing",
                    name,
                    machines.len(),
                    missing.join(", ")
                )));
            }
            warn!(cluster = %name, missing = ?missing, "Restaging incomplete boot payloads");
        }

        let material = BootstrapMaterial::generate()?;
        let payloads = material.render(cluster, &addresses)?;

        for (ordinal, userdata) in payloads.control_plane.into_iter().enumerate() {
            let record = ConfigRecord::from([
                (USERDATA_KEY.to_string(), userdata),
                (TALOSCONFIG_KEY.to_string(), payloads.talosconfig.clone()),
            ]);
            let record_name = control_plane_name(&name, ordinal);
            store::upsert(self.store.as_ref(), &record_name, record).await?;
            debug!(cluster = %name, record = %record_name, "Staged control plane payload");
        }

        let record = ConfigRecord::from([(USERDATA_KEY.to_string(), payloads.worker)]);
        store::upsert(self.store.as_ref(), &workers_record_name(&name), record).await?;

        info!(cluster = %name, addresses = ?addresses, "Cluster reconciled");
        Ok(addresses)
    }

    /// Tear down cluster-wide resources once no machine references the cluster
    pub async fn delete(&self, cluster: &Cluster, cancel: CancellationToken) -> Result<()> {
        let name = cluster.name_any();
        let spec = cluster.provider_spec()?;

        let machines = self.lister.machines_for_cluster(&name).await?;
        if !machines.is_empty() {
            return Err(Error::DependentsExist {
                cluster: name,
                count: machines.len(),
            });
        }

        let provisioner = self.registry.resolve(&spec.platform.kind)?;
        let ctx = ProvisionContext::new(self.store.clone(), cancel);
        provisioner.deallocate_external_ips(&ctx, cluster).await?;

        for ordinal in 0..spec.control_plane.count {
            store::delete_if_present(self.store.as_ref(), &control_plane_name(&name, ordinal)).await?;
        }
        store::delete_if_present(self.store.as_ref(), &workers_record_name(&name)).await?;

        info!(cluster = %name, backend = provisioner.name(), "Cluster resources removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::tests::StaticLister;
    use crate::cloud::InMemoryCloud;
    use crate::crd::cluster::tests::cluster;
    use crate::provisioners::{CloudClients, ProvisionerSettings};
    use crate::store::MemoryConfigStore;
    use assert_matches::assert_matches;

    struct Harness {
        cloud: Arc<InMemoryCloud>,
        store: Arc<MemoryConfigStore>,
        lister: Arc<StaticLister>,
        actuator: ClusterActuator,
    }

    fn harness() -> Harness {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.add_metal_block("p1", "147.75.0.0", 29, &["147.75.0.2", "147.75.0.3", "147.75.0.4", "147.75.0.5"]);
        let registry = Arc::new(ProvisionerRegistry::new(
            CloudClients::simulated(cloud.clone()),
            ProvisionerSettings::default(),
        ));
        let store = Arc::new(MemoryConfigStore::new());
        let lister = Arc::new(StaticLister::default());
        let actuator = ClusterActuator::new(registry, store.clone(), lister.clone());
        Harness {
            cloud,
            store,
            lister,
            actuator,
        }
    }

    const PACKET_CLUSTER: &str = "projectid: p1\nipblock: 147.75.0.0/29\n";

    #[tokio::test]
    async fn test_reconcile_stages_every_payload() {
        let h = harness();
        let c = cluster("demo", 3, "packet", PACKET_CLUSTER);

        let addresses = h.actuator.reconcile(&c, CancellationToken::new()).await.unwrap();
        let expected: Vec<IpAddr> = ["147.75.0.2", "147.75.0.3", "147.75.0.4"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();
        assert_eq!(addresses, expected);

        assert_eq!(
            h.store.names(),
            vec!["demo-master-0", "demo-master-1", "demo-master-2", "demo-workers"]
        );

        let init = h.store.get("demo-master-0").await.unwrap().unwrap();
        assert!(init[USERDATA_KEY].contains("kind: InitConfiguration"));
        assert!(init.contains_key(TALOSCONFIG_KEY));

        let join = h.store.get("demo-master-2").await.unwrap().unwrap();
        assert!(join[USERDATA_KEY].contains("kind: JoinConfiguration"));
        assert!(join[USERDATA_KEY].contains("advertiseAddress: 147.75.0.4"));

        let workers = h.store.get("demo-workers").await.unwrap().unwrap();
        assert!(!workers.contains_key(TALOSCONFIG_KEY));
        assert!(workers[USERDATA_KEY].contains("security: null"));
    }

    #[tokio::test]
    async fn test_reconcile_twice_keeps_addresses_and_secrets() {
        let h = harness();
        let c = cluster("demo", 2, "aws", "region: us-east-1\n");

        let first = h.actuator.reconcile(&c, CancellationToken::new()).await.unwrap();
        let workers = h.store.get("demo-workers").await.unwrap().unwrap();
        let init = h.store.get("demo-master-0").await.unwrap().unwrap();
        let second = h.actuator.reconcile(&c, CancellationToken::new()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.cloud.call_count("AllocateAddress"), 2);
        assert_eq!(h.store.len(), 3);
        assert_eq!(h.store.get("demo-workers").await.unwrap().unwrap(), workers);
        assert_eq!(h.store.get("demo-master-0").await.unwrap().unwrap(), init);
    }

    #[tokio::test]
    async fn test_reconcile_restages_incomplete_payloads_before_machines() {
        let h = harness();
        let c = cluster("demo", 2, "aws", "region: us-east-1\n");
        h.actuator.reconcile(&c, CancellationToken::new()).await.unwrap();
        let workers = h.store.get("demo-workers").await.unwrap().unwrap();
        h.store.delete("demo-master-1").await.unwrap();

        h.actuator.reconcile(&c, CancellationToken::new()).await.unwrap();
        assert_eq!(h.store.len(), 3);
        assert_ne!(h.store.get("demo-workers").await.unwrap().unwrap(), workers);
    }

    #[tokio::test]
    async fn test_reconcile_refuses_to_extend_payloads_of_live_cluster() {
        let h = harness();
        let c = cluster("demo", 1, "aws", "region: us-east-1\n");
        h.actuator.reconcile(&c, CancellationToken::new()).await.unwrap();
        let init = h.store.get("demo-master-0").await.unwrap().unwrap();
        h.lister.set(&["demo-master-0"]);

        let grown = cluster("demo", 2, "aws", "region: us-east-1\n");
        assert_matches!(
            h.actuator.reconcile(&grown, CancellationToken::new()).await,
            Err(Error::Configuration(_))
        );
        assert_eq!(h.store.get("demo-master-0").await.unwrap().unwrap(), init);
        assert!(h.store.get("demo-master-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconcile_unknown_backend() {
        let h = harness();
        let c = cluster("demo", 1, "openstack", "{}\n");

        assert_matches!(
            h.actuator.reconcile(&c, CancellationToken::new()).await,
            Err(Error::UnknownBackend { .. })
        );
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_allocation_failure_stages_nothing() {
        let h = harness();
        let c = cluster("demo", 1, "aws", "region: us-east-1\n");
        h.cloud.fail_next("AllocateAddress", "AddressLimitExceeded");

        assert_matches!(
            h.actuator.reconcile(&c, CancellationToken::new()).await,
            Err(Error::Cloud { .. })
        );
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_refuses_with_dependents() {
        let h = harness();
        let c = cluster("demo", 1, "aws", "region: us-east-1\n");
        h.actuator.reconcile(&c, CancellationToken::new()).await.unwrap();
        h.lister.set(&["demo-master-0", "demo-workers-a"]);

        assert_matches!(
            h.actuator.delete(&c, CancellationToken::new()).await,
            Err(Error::DependentsExist { count: 2, .. })
        );
        assert_eq!(h.cloud.elastic_ips().len(), 1);
        assert_eq!(h.store.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_releases_everything() {
        let h = harness();
        let c = cluster("demo", 3, "aws", "region: us-east-1\n");
        h.actuator.reconcile(&c, CancellationToken::new()).await.unwrap();

        h.actuator.delete(&c, CancellationToken::new()).await.unwrap();
        assert!(h.cloud.elastic_ips().is_empty());
        assert!(h.store.is_empty());

        // Second pass finds nothing and still succeeds
        h.actuator.delete(&c, CancellationToken::new()).await.unwrap();
    }
}
