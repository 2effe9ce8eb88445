//! Cluster CRD
//!
//! Declarative description of a Talos cluster: how many control plane
//! nodes it runs, on which backend, and which network ranges it uses.

use super::{PlatformSpec, ProviderSpec};
use crate::error::{Error, Result};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Cluster CRD
// =============================================================================

/// Cluster is the cluster-api Cluster resource as seen by this provider.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Service and pod network configuration
    #[serde(default)]
    pub cluster_network: ClusterNetwork,

    /// Talos provider configuration
    #[serde(default)]
    pub provider_spec: ProviderSpec,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Cluster network ranges
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    /// Service CIDR blocks
    #[serde(default = "default_services")]
    pub services: NetworkRanges,

    /// Pod CIDR blocks
    #[serde(default = "default_pods")]
    pub pods: NetworkRanges,

    /// DNS domain for services
    #[serde(default = "default_service_domain")]
    pub service_domain: String,
}

impl Default for ClusterNetwork {
    fn default() -> Self {
        Self {
            services: default_services(),
            pods: default_pods(),
            service_domain: default_service_domain(),
        }
    }
}

/// A list of CIDR blocks
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRanges {
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
}

/// Talos-specific cluster provider spec, carried in `providerSpec.value`
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TalosClusterProviderSpec {
    #[serde(rename = "controlplane", default)]
    pub control_plane: ControlPlaneSpec,

    #[serde(default)]
    pub platform: PlatformSpec,
}

/// Control plane sizing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ControlPlaneSpec {
    #[serde(default)]
    pub count: usize,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of the Cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Control plane endpoints in ordinal order
    #[serde(default)]
    pub api_endpoints: Vec<ApiEndpoint>,

    /// Last reconcile error, if any
    #[serde(default)]
    pub error_message: Option<String>,
}

/// A reachable control plane address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_services() -> NetworkRanges {
    NetworkRanges {
        cidr_blocks: vec!["10.96.0.0/12".to_string()],
    }
}

fn default_pods() -> NetworkRanges {
    NetworkRanges {
        cidr_blocks: vec!["10.244.0.0/16".to_string()],
    }
}

fn default_service_domain() -> String {
    "cluster.local".to_string()
}

// =============================================================================
// Implementations
// =============================================================================

impl Cluster {
    /// Parse and validate the Talos provider spec
    pub fn provider_spec(&self) -> Result<TalosClusterProviderSpec> {
        let name = self.name_any();
        let spec: TalosClusterProviderSpec = self.spec.provider_spec.decode("Cluster", &name)?;

        if spec.control_plane.count == 0 {
            return Err(Error::InvalidProviderSpec {
                kind: "Cluster".into(),
                name,
                reason: "controlplane.count must be at least 1".into(),
            });
        }
        if spec.platform.kind.is_empty() {
            return Err(Error::InvalidProviderSpec {
                kind: "Cluster".into(),
                name,
                reason: "platform.type is required".into(),
            });
        }

        Ok(spec)
    }

    /// Get the service CIDR blocks
    pub fn service_subnets(&self) -> &[String] {
        &self.spec.cluster_network.services.cidr_blocks
    }

    /// Get the pod CIDR blocks
    pub fn pod_subnets(&self) -> &[String] {
        &self.spec.cluster_network.pods.cidr_blocks
    }

    /// Get the service DNS domain
    pub fn service_domain(&self) -> &str {
        &self.spec.cluster_network.service_domain
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn cluster(name: &str, count: usize, platform: &str, config: &str) -> Cluster {
        let mut cluster = Cluster::new(
            name,
            ClusterSpec {
                cluster_network: ClusterNetwork::default(),
                provider_spec: ProviderSpec {
                    value: Some(json!({
                        "controlplane": { "count": count },
                        "platform": { "type": platform, "config": config },
                    })),
                },
            },
        );
        cluster.metadata.namespace = Some("default".into());
        cluster
    }

    #[test]
    fn test_provider_spec_parses() {
        let c = cluster("demo", 3, "packet", "projectid: p1\nipblock: 147.75.0.0/29\n");
        let spec = c.provider_spec().unwrap();
        assert_eq!(spec.control_plane.count, 3);
        assert_eq!(spec.platform.kind, "packet");
        assert!(spec.platform.config.contains("ipblock"));
    }

    #[test]
    fn test_zero_control_plane_rejected() {
        let c = cluster("demo", 0, "aws", "region: us-east-1\n");
        assert!(matches!(
            c.provider_spec(),
            Err(Error::InvalidProviderSpec { .. })
        ));
    }

    #[test]
    fn test_missing_value_rejected() {
        let c = Cluster::new("empty", ClusterSpec {
            cluster_network: ClusterNetwork::default(),
            provider_spec: ProviderSpec::default(),
        });
        let err = c.provider_spec().unwrap_err();
        assert!(err.to_string().contains("providerSpec.value is empty"));
    }

    #[test]
    fn test_network_defaults() {
        let c = cluster("demo", 1, "gce", "");
        assert_eq!(c.service_subnets(), ["10.96.0.0/12".to_string()]);
        assert_eq!(c.pod_subnets(), ["10.244.0.0/16".to_string()]);
        assert_eq!(c.service_domain(), "cluster.local");
    }
}
