//! Cloud backend capability ports
//!
//! Each backend's SDK surface is narrowed to the calls its provisioner makes.
//! Clients are injected through [`crate::provisioners::CloudClients`], so the
//! provisioners never construct process-wide SDK handles themselves.

pub mod aws;
pub mod azure;
pub mod gce;
pub mod memory;
pub mod metal;
pub mod metal_http;

pub use aws::Ec2Api;
pub use azure::AzureApi;
pub use gce::ComputeApi;
pub use memory::InMemoryCloud;
pub use metal::MetalApi;
pub use metal_http::MetalHttpClient;
