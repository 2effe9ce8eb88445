//! Domain layer - Core business rules and port definitions
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles, plus the machine naming
//! grammar every component derives resource names from.

pub mod naming;
pub mod ports;

pub use naming::*;
pub use ports::*;
