//! Actuators invoked by the reconciliation host
//!
//! - [`ClusterActuator`]: external addresses, bootstrap material and staged
//!   boot payloads for a whole cluster
//! - [`MachineActuator`]: a single node's instance, dispatched to the
//!   provisioner of the machine's backend

pub mod cluster;
pub mod machine;

pub use cluster::ClusterActuator;
pub use machine::MachineActuator;

#[cfg(test)]
pub(crate) mod tests {
    use crate::domain::MachineLister;
    use crate::error::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Lister returning a fixed set of machine names for every cluster
    #[derive(Default)]
    pub(crate) struct StaticLister {
        machines: Mutex<Vec<String>>,
    }

    impl StaticLister {
        pub(crate) fn set(&self, machines: &[&str]) {
            *self.machines.lock() = machines.iter().map(|m| m.to_string()).collect();
        }
    }

    #[async_trait]
    impl MachineLister for StaticLister {
        async fn machines_for_cluster(&self, _cluster: &str) -> Result<Vec<String>> {
            Ok(self.machines.lock().clone())
        }
    }
}
