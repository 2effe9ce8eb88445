//! Machine naming grammar
//!
//! A machine's role and ordinal are carried by its name:
//!
//! ```text
//! machine-name  = cluster "-master-" ordinal      ; control plane node
//!               | cluster "-workers" [ "-" suffix ] ; worker
//! ordinal       = 1*DIGIT
//! ```
//!
//! Every name the provider derives for cloud resources and config records
//! comes from the same grammar, so lookups by name stay idempotent.

use crate::error::{Error, Result};
use std::fmt;

const MASTER_INFIX: &str = "-master-";
const WORKERS_INFIX: &str = "-workers";

/// Role of a machine within its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineRole {
    /// Control plane node; ordinal 0 initializes the cluster
    ControlPlane { ordinal: usize },
    /// Worker node sharing the cluster-wide worker payload
    Worker,
}

impl MachineRole {
    /// Parse a machine name belonging to `cluster`
    pub fn parse(cluster: &str, machine: &str) -> Result<Self> {
        let malformed = |reason: &str| Error::MalformedMachineName {
            name: machine.to_string(),
            reason: reason.to_string(),
        };

        let rest = machine
            .strip_prefix(cluster)
            .ok_or_else(|| malformed(&format!("expected prefix {}", cluster)))?;

        if let Some(ordinal) = rest.strip_prefix(MASTER_INFIX) {
            if ordinal.is_empty() || !ordinal.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed("control plane ordinal must be decimal digits"));
            }
            let ordinal = ordinal
                .parse::<usize>()
                .map_err(|e| malformed(&e.to_string()))?;
            return Ok(MachineRole::ControlPlane { ordinal });
        }

        if let Some(suffix) = rest.strip_prefix(WORKERS_INFIX) {
            if suffix.is_empty() || (suffix.len() > 1 && suffix.starts_with('-')) {
                return Ok(MachineRole::Worker);
            }
        }

        Err(malformed(
            "expected <cluster>-master-<ordinal> or <cluster>-workers[-<suffix>]",
        ))
    }

    /// Whether this machine is part of the control plane
    pub fn is_control_plane(&self) -> bool {
        matches!(self, MachineRole::ControlPlane { .. })
    }

    /// Control plane ordinal, if any
    pub fn ordinal(&self) -> Option<usize> {
        match self {
            MachineRole::ControlPlane { ordinal } => Some(*ordinal),
            MachineRole::Worker => None,
        }
    }

    /// Name of the config record holding this role's boot payload
    pub fn record_name(&self, cluster: &str) -> String {
        match self {
            MachineRole::ControlPlane { ordinal } => control_plane_name(cluster, *ordinal),
            MachineRole::Worker => workers_record_name(cluster),
        }
    }
}

impl fmt::Display for MachineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineRole::ControlPlane { ordinal } => write!(f, "controlplane[{}]", ordinal),
            MachineRole::Worker => write!(f, "worker"),
        }
    }
}

// =============================================================================
// Derived Names
// =============================================================================

/// `<cluster>-master-<ordinal>`: machine and config record name of a control plane node
pub fn control_plane_name(cluster: &str, ordinal: usize) -> String {
    format!("{}{}{}", cluster, MASTER_INFIX, ordinal)
}

/// `<cluster>-workers`: config record shared by all workers
pub fn workers_record_name(cluster: &str) -> String {
    format!("{}{}", cluster, WORKERS_INFIX)
}

/// `<cluster>-master-<ordinal>-ip`: external address of a control plane node
pub fn external_ip_name(cluster: &str, ordinal: usize) -> String {
    format!("{}-ip", control_plane_name(cluster, ordinal))
}

/// `<machine>-nic`
pub fn nic_name(machine: &str) -> String {
    format!("{}-nic", machine)
}

/// `<machine>-ip-config`
pub fn ip_config_name(machine: &str) -> String {
    format!("{}-ip-config", machine)
}

/// `<machine>-os-disk`
pub fn os_disk_name(machine: &str) -> String {
    format!("{}-os-disk", machine)
}
