//! Config record store adapter
//!
//! Boot payloads are staged under names derived from the cluster name and
//! machine role. The helpers here layer idempotent semantics on top of a
//! strict [`ConfigStore`]:
//! - `upsert` creates a record and falls back to update when it exists
//! - `delete_if_present` treats a missing record as deleted
//! - `fetch_boot_payload` resolves the record a machine boots from

pub mod configmap;
pub mod memory;

pub use configmap::ConfigMapStore;
pub use memory::MemoryConfigStore;

use crate::domain::{ConfigRecord, ConfigStore, MachineRole, TALOSCONFIG_KEY, USERDATA_KEY};
use crate::error::{Error, Result};
use tracing::debug;

/// Default namespace holding staged boot payloads
pub const DEFAULT_NAMESPACE: &str = "cluster-api-provider-talos-system";

/// Kind reported in store errors
pub(crate) const RECORD_KIND: &str = "ConfigMap";

/// A staged boot payload as read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootPayload {
    /// Rendered configuration text
    pub userdata: String,
    /// Admin client configuration (control plane records only)
    pub talosconfig: Option<String>,
}

/// Create `name`, replacing its data when it already exists
pub async fn upsert(store: &dyn ConfigStore, name: &str, data: ConfigRecord) -> Result<()> {
    match store.create(name, data.clone()).await {
        Ok(()) => {
            debug!(record = %name, "Created config record");
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            store.update(name, data).await?;
            debug!(record = %name, "Updated config record");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Delete `name`, succeeding when it is already gone
pub async fn delete_if_present(store: &dyn ConfigStore, name: &str) -> Result<()> {
    match store.delete(name).await {
        Ok(()) => {
            debug!(record = %name, "Deleted config record");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Read the boot payload staged for `role` in `cluster`
pub async fn fetch_boot_payload(
    store: &dyn ConfigStore,
    cluster: &str,
    role: MachineRole,
) -> Result<BootPayload> {
    let name = role.record_name(cluster);
    let mut record = store
        .get(&name)
        .await?
        .ok_or_else(|| Error::not_found(RECORD_KIND, &name))?;

    let userdata = record
        .remove(USERDATA_KEY)
        .ok_or_else(|| Error::Internal(format!("record {} has no {} key", name, USERDATA_KEY)))?;

    Ok(BootPayload {
        userdata,
        talosconfig: record.remove(TALOSCONFIG_KEY),
    })
}
