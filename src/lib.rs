//! Talos Cluster Provider
//!
//! Cluster and Machine actuators that provision Talos nodes on AWS, Azure,
//! GCE and bare metal (Packet).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                   Controllers (kube-runtime)                         │
//! │   Cluster ──► ClusterActuator          Machine ──► MachineActuator   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌────────────────────┐  │
//! │  │    Bootstrap     │  │   Config Store   │  │ Provisioner        │  │
//! │  │ PKI/tokens/yaml  │  │  (ConfigMaps)    │  │ Registry           │  │
//! │  └──────────────────┘  └──────────────────┘  └─────────┬──────────┘  │
//! ├────────────────────────────────────────────────────────┼─────────────┤
//! │        aws          azure           gce          packet│             │
//! │        └─────────────┴───────────────┴──────────────┴──┘             │
//! │                     Cloud capability ports                           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`actuators`]: Cluster and Machine lifecycle entry points
//! - [`bootstrap`]: Certificates, tokens and rendered boot payloads
//! - [`cloud`]: Narrow per-backend API ports and their clients
//! - [`controller`]: Finalizer-driven controllers hosting the actuators
//! - [`crd`]: Cluster and Machine resources
//! - [`domain`]: Machine naming and core traits
//! - [`provisioners`]: Per-backend provisioners and their registry
//! - [`store`]: Config record store for staged payloads
//! - [`error`]: Error types and handling

pub mod actuators;
pub mod bootstrap;
pub mod cloud;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod provisioners;
pub mod store;
pub mod wait;

pub use actuators::{ClusterActuator, MachineActuator};

pub use crd::{Cluster, ClusterSpec, ClusterStatus, Machine, MachineSpec, MachineStatus};

pub use domain::ports::{ConfigRecord, ConfigStore, MachineLister, ProvisionContext, Provisioner};

pub use error::{Error, ErrorAction, Result};

pub use provisioners::{BackendKind, CloudClients, ProvisionerRegistry, ProvisionerSettings};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
