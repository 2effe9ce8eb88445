//! Machine CRD
//!
//! A single node of a Cluster. The role and ordinal of a machine are encoded
//! in its name, see [`crate::domain::naming`].

use super::{PlatformSpec, ProviderSpec, CLUSTER_NAME_LABEL};
use crate::error::{Error, Result};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Machine CRD
// =============================================================================

/// Machine is the cluster-api Machine resource as seen by this provider.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines",
    status = "MachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Talos provider configuration
    #[serde(default)]
    pub provider_spec: ProviderSpec,
}

/// Talos-specific machine provider spec, carried in `providerSpec.value`
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TalosMachineProviderSpec {
    #[serde(default)]
    pub platform: PlatformSpec,
}

/// Observed state of the Machine
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Last reconcile error, if any
    #[serde(default)]
    pub error_message: Option<String>,
}

// =============================================================================
// Implementations
// =============================================================================

impl Machine {
    /// Parse the Talos machine provider spec
    pub fn provider_spec(&self) -> Result<TalosMachineProviderSpec> {
        let name = self.name_any();
        let spec: TalosMachineProviderSpec = self.spec.provider_spec.decode("Machine", &name)?;

        if spec.platform.kind.is_empty() {
            return Err(Error::InvalidProviderSpec {
                kind: "Machine".into(),
                name,
                reason: "platform.type is required".into(),
            });
        }

        Ok(spec)
    }

    /// Name of the owning cluster, from the cluster label
    pub fn cluster_name(&self) -> Option<&str> {
        self.labels().get(CLUSTER_NAME_LABEL).map(String::as_str)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn machine(name: &str, cluster: &str, platform: &str, config: &str) -> Machine {
        let mut machine = Machine::new(
            name,
            MachineSpec {
                provider_spec: ProviderSpec {
                    value: Some(json!({
                        "platform": { "type": platform, "config": config },
                    })),
                },
            },
        );
        machine.metadata.namespace = Some("default".into());
        machine
            .labels_mut()
            .insert(CLUSTER_NAME_LABEL.to_string(), cluster.to_string());
        machine
    }

    #[test]
    fn test_machine_provider_spec() {
        let m = machine("demo-master-1", "demo", "aws", "region: us-west-2\n");
        let spec = m.provider_spec().unwrap();
        assert_eq!(spec.platform.kind, "aws");
        assert_eq!(m.cluster_name(), Some("demo"));
    }

    #[test]
    fn test_machine_without_platform() {
        let mut m = machine("demo-workers-abc", "demo", "", "");
        m.spec.provider_spec.value = Some(json!({}));
        assert!(matches!(
            m.provider_spec(),
            Err(Error::InvalidProviderSpec { .. })
        ));
    }
}
