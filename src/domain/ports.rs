//! Domain Ports - Core trait definitions for the cluster provider
//!
//! These traits define the boundaries between the actuators and external systems.
//! Adapters implement these traits to provide concrete functionality.

use crate::crd::{Cluster, Machine};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Config Record Store
// =============================================================================

/// Data of a single config record (key -> text)
pub type ConfigRecord = BTreeMap<String, String>;

/// Record key holding the rendered boot payload
pub const USERDATA_KEY: &str = "userdata";

/// Record key holding the admin client configuration (control plane only)
pub const TALOSCONFIG_KEY: &str = "talosconfig";

/// Namespaced key-value store staging boot payloads
///
/// The store itself is strict: `create` fails with `ResourceExists` on an
/// existing key, `update` and `delete` fail with `ResourceNotFound` on a
/// missing one. Idempotent behaviour lives in [`crate::store`].
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch a record, `None` if absent
    async fn get(&self, name: &str) -> Result<Option<ConfigRecord>>;

    /// Create a new record
    async fn create(&self, name: &str, data: ConfigRecord) -> Result<()>;

    /// Replace the data of an existing record
    async fn update(&self, name: &str, data: ConfigRecord) -> Result<()>;

    /// Remove a record
    async fn delete(&self, name: &str) -> Result<()>;
}

// =============================================================================
// Machine Lister
// =============================================================================

/// Lists the machines referencing a cluster
#[async_trait]
pub trait MachineLister: Send + Sync {
    /// Names of machines labelled with the given cluster name
    async fn machines_for_cluster(&self, cluster: &str) -> Result<Vec<String>>;
}

// =============================================================================
// Provisioner
// =============================================================================

/// Per-call context handed to provisioners
#[derive(Clone)]
pub struct ProvisionContext {
    /// Store holding the staged boot payloads
    pub store: Arc<dyn ConfigStore>,
    /// Aborts polling and waiting when cancelled
    pub cancel: CancellationToken,
}

impl ProvisionContext {
    pub fn new(store: Arc<dyn ConfigStore>, cancel: CancellationToken) -> Self {
        Self { store, cancel }
    }
}

impl std::fmt::Debug for ProvisionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Uniform capability set implemented once per cloud backend
///
/// Every operation must converge when re-invoked from scratch: lookups are
/// by name or tag, never by identifiers cached from an earlier call.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Backend identifier
    fn name(&self) -> &'static str;

    /// Realize the machine's instance, injecting its staged boot payload
    async fn create(&self, ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine)
        -> Result<()>;

    /// Update the machine's instance in place
    async fn update(&self, ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine)
        -> Result<()>;

    /// Remove the machine's instance; absence is success
    async fn delete(&self, ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine)
        -> Result<()>;

    /// Whether the machine's instance exists; lookup errors are propagated
    async fn exists(&self, ctx: &ProvisionContext, cluster: &Cluster, machine: &Machine)
        -> Result<bool>;

    /// Reserve `count` control plane addresses, returned in ordinal order
    async fn allocate_external_ips(
        &self,
        ctx: &ProvisionContext,
        cluster: &Cluster,
        count: usize,
    ) -> Result<Vec<IpAddr>>;

    /// Release every control plane address of the cluster; absence is success
    async fn deallocate_external_ips(&self, ctx: &ProvisionContext, cluster: &Cluster)
        -> Result<()>;
}
