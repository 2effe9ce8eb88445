//! Custom Resource Definitions consumed by the actuators
//!
//! This module contains the resource types the reconciliation host hands us:
//! - Cluster: desired control plane size, backend and network ranges
//! - Machine: a single node, its role derived from its name

pub mod cluster;
pub mod machine;

pub use cluster::*;
pub use machine::*;

use crate::error::{Error, Result};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Label carried by every Machine naming the Cluster it belongs to
pub const CLUSTER_NAME_LABEL: &str = "cluster.k8s.io/cluster-name";

// =============================================================================
// Provider Spec
// =============================================================================

/// Opaque provider-specific value embedded in Cluster and Machine specs
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Raw provider document, interpreted by this provider only
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl ProviderSpec {
    /// Decode the raw value into a provider-specific type
    pub(crate) fn decode<T: DeserializeOwned>(&self, kind: &str, name: &str) -> Result<T> {
        let value = self.value.clone().ok_or_else(|| Error::InvalidProviderSpec {
            kind: kind.to_string(),
            name: name.to_string(),
            reason: "providerSpec.value is empty".to_string(),
        })?;

        serde_json::from_value(value).map_err(|e| Error::InvalidProviderSpec {
            kind: kind.to_string(),
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Backend selection shared by cluster and machine provider specs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PlatformSpec {
    /// Backend identifier (aws, azure, gce, packet)
    #[serde(rename = "type", default)]
    pub kind: String,

    /// Backend-specific configuration as a YAML document
    #[serde(default)]
    pub config: String,
}

impl PlatformSpec {
    /// Parse the backend configuration blob into the backend's own type
    pub fn parse_config<T: DeserializeOwned>(&self, kind: &str, name: &str) -> Result<T> {
        serde_yaml::from_str(&self.config).map_err(|e| Error::InvalidProviderSpec {
            kind: kind.to_string(),
            name: name.to_string(),
            reason: format!("platform config for {}: {}", self.kind, e),
        })
    }
}
