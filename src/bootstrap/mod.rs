//! Bootstrap material generation
//!
//! One [`BootstrapMaterial`] is generated when a cluster's payloads are first
//! staged and used to render all of them. It is never persisted on its own:
//! only the rendered payloads and the admin client configuration reach the
//! store.

pub mod pki;
pub mod tokens;
pub mod userdata;

pub use pki::{verify_signed_by, AdminCredential, CertificateAuthority};
pub use tokens::{KubeadmTokens, TrustdCredentials};
pub use userdata::{PayloadKind, UserdataInput};

use crate::crd::Cluster;
use crate::domain::MachineRole;
use crate::error::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use kube::ResourceExt;
use std::net::IpAddr;
use tracing::debug;
use userdata::{EncodedCerts, KubeadmSecrets, TrustdSecrets};

/// Network ranges rendered into control plane configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub service_domain: String,
    pub pod_subnets: Vec<String>,
    pub service_subnets: Vec<String>,
}

impl From<&Cluster> for NetworkSettings {
    fn from(cluster: &Cluster) -> Self {
        Self {
            service_domain: cluster.service_domain().to_string(),
            pod_subnets: cluster.pod_subnets().to_vec(),
            service_subnets: cluster.service_subnets().to_vec(),
        }
    }
}

/// Certificates and shared secrets of one cluster
#[derive(Debug, Clone)]
pub struct BootstrapMaterial {
    pub kubernetes_ca: CertificateAuthority,
    pub os_ca: CertificateAuthority,
    pub admin: AdminCredential,
    pub kubeadm: KubeadmTokens,
    pub trustd: TrustdCredentials,
}

/// Rendered payloads for a whole cluster
#[derive(Debug, Clone)]
pub struct RenderedPayloads {
    /// One payload per control plane ordinal
    pub control_plane: Vec<String>,
    /// Payload shared by all workers
    pub worker: String,
    /// Admin client configuration, staged with every control plane payload
    pub talosconfig: String,
}

impl BootstrapMaterial {
    /// Generate both authorities, the admin credential and fresh join secrets
    pub fn generate() -> Result<Self> {
        let kubernetes_ca = CertificateAuthority::kubernetes()?;
        let os_ca = CertificateAuthority::talos()?;
        let admin = AdminCredential::issue(&os_ca)?;

        Ok(Self {
            kubernetes_ca,
            os_ca,
            admin,
            kubeadm: KubeadmTokens::generate(),
            trustd: TrustdCredentials::generate(),
        })
    }

    fn encoded_certs(&self) -> EncodedCerts {
        EncodedCerts {
            admin_cert: STANDARD.encode(self.admin.cert_pem()),
            admin_key: STANDARD.encode(self.admin.key_pem()),
            os_cert: STANDARD.encode(self.os_ca.cert_pem()),
            os_key: STANDARD.encode(self.os_ca.key_pem()),
            k8s_cert: STANDARD.encode(self.kubernetes_ca.cert_pem()),
            k8s_key: STANDARD.encode(self.kubernetes_ca.key_pem()),
        }
    }

    /// Template input for the node at `index`; other control plane nodes become its endpoints
    pub fn userdata_input(
        &self,
        cluster_name: &str,
        network: &NetworkSettings,
        master_ips: &[IpAddr],
        kind: PayloadKind,
        index: usize,
    ) -> UserdataInput {
        let master_ips: Vec<String> = master_ips.iter().map(IpAddr::to_string).collect();
        let endpoints = match kind {
            PayloadKind::Worker => master_ips.clone(),
            PayloadKind::Init | PayloadKind::ControlPlane => master_ips
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, ip)| ip.clone())
                .collect(),
        };

        UserdataInput {
            cluster_name: cluster_name.to_string(),
            master_ips,
            index,
            endpoints,
            service_domain: network.service_domain.clone(),
            pod_subnets: network.pod_subnets.clone(),
            service_subnets: network.service_subnets.clone(),
            certs: self.encoded_certs(),
            kubeadm: KubeadmSecrets::from(&self.kubeadm),
            trustd: TrustdSecrets::from(&self.trustd),
        }
    }

    /// Render every payload of the cluster for the given control plane addresses
    pub fn render(&self, cluster: &Cluster, master_ips: &[IpAddr]) -> Result<RenderedPayloads> {
        let name = cluster.name_any();
        let network = NetworkSettings::from(cluster);

        let mut control_plane = Vec::with_capacity(master_ips.len());
        for index in 0..master_ips.len() {
            let kind = PayloadKind::for_role(MachineRole::ControlPlane { ordinal: index });
            let input = self.userdata_input(&name, &network, master_ips, kind, index);
            control_plane.push(userdata::render(kind, &input)?);
            debug!(cluster = %name, index, %kind, "Rendered control plane payload");
        }

        let input = self.userdata_input(&name, &network, master_ips, PayloadKind::Worker, 0);
        let worker = userdata::render(PayloadKind::Worker, &input)?;
        let talosconfig = userdata::render_talosconfig(&input)?;

        Ok(RenderedPayloads {
            control_plane,
            worker,
            talosconfig,
        })
    }
}
