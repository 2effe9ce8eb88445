//! Boot payload templates
//!
//! Rendering is a pure function of its [`UserdataInput`]. Templates are
//! registered without file extensions so minijinja applies no auto-escaping.

use super::tokens::{KubeadmTokens, TrustdCredentials};
use crate::domain::MachineRole;
use crate::error::Result;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

/// Which payload variant a node boots with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// Control plane ordinal 0, initializes the cluster
    Init,
    /// Control plane ordinal > 0, joins the control plane
    ControlPlane,
    /// Any worker
    Worker,
}

impl PayloadKind {
    pub fn for_role(role: MachineRole) -> Self {
        match role {
            MachineRole::ControlPlane { ordinal: 0 } => PayloadKind::Init,
            MachineRole::ControlPlane { .. } => PayloadKind::ControlPlane,
            MachineRole::Worker => PayloadKind::Worker,
        }
    }

    fn template_name(&self) -> &'static str {
        match self {
            PayloadKind::Init => "init",
            PayloadKind::ControlPlane => "controlplane",
            PayloadKind::Worker => "worker",
        }
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.template_name())
    }
}

/// Base64-encoded PEM material embedded in payloads
#[derive(Debug, Clone, Default, Serialize)]
pub struct EncodedCerts {
    pub admin_cert: String,
    pub admin_key: String,
    pub os_cert: String,
    pub os_key: String,
    pub k8s_cert: String,
    pub k8s_key: String,
}

/// Everything a template can reference
#[derive(Debug, Clone, Serialize)]
pub struct UserdataInput {
    pub cluster_name: String,
    /// Control plane addresses in ordinal order
    pub master_ips: Vec<String>,
    /// Ordinal of the node being rendered (0 for workers)
    pub index: usize,
    /// Trust daemon peers of the node being rendered
    pub endpoints: Vec<String>,
    pub service_domain: String,
    pub pod_subnets: Vec<String>,
    pub service_subnets: Vec<String>,
    pub certs: EncodedCerts,
    pub kubeadm: KubeadmSecrets,
    pub trustd: TrustdSecrets,
}

#[derive(Debug, Clone, Serialize)]
pub struct KubeadmSecrets {
    pub bootstrap_token: String,
    pub certificate_key: String,
}

impl From<&KubeadmTokens> for KubeadmSecrets {
    fn from(tokens: &KubeadmTokens) -> Self {
        Self {
            bootstrap_token: tokens.bootstrap_token.clone(),
            certificate_key: tokens.certificate_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrustdSecrets {
    pub username: String,
    pub password: String,
}

impl From<&TrustdCredentials> for TrustdSecrets {
    fn from(creds: &TrustdCredentials) -> Self {
        Self {
            username: creds.username.clone(),
            password: creds.password.clone(),
        }
    }
}

fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.add_template("init", INIT_TEMPLATE)?;
    env.add_template("controlplane", CONTROLPLANE_TEMPLATE)?;
    env.add_template("worker", WORKER_TEMPLATE)?;
    env.add_template("talosconfig", TALOSCONFIG_TEMPLATE)?;
    Ok(env)
}

/// Render the boot payload for `kind`
pub fn render(kind: PayloadKind, input: &UserdataInput) -> Result<String> {
    let env = environment()?;
    let rendered = env.get_template(kind.template_name())?.render(input)?;
    Ok(rendered)
}

/// Render the admin client configuration targeting control plane ordinal 0
pub fn render_talosconfig(input: &UserdataInput) -> Result<String> {
    let env = environment()?;
    let rendered = env.get_template("talosconfig")?.render(input)?;
    Ok(rendered)
}

// =============================================================================
// Templates
// =============================================================================

const INIT_TEMPLATE: &str = r#"---
version: ""
security:
  os:
    ca:
      crt: {{ certs.os_cert }}
      key: {{ certs.os_key }}
  kubernetes:
    ca:
      crt: {{ certs.k8s_cert }}
      key: {{ certs.k8s_key }}
networking:
  os:
    devices:
    - interface: eth0
      dhcp: true
services:
  init:
    cni: flannel
  kubeadm:
    certificateKey: '{{ kubeadm.certificate_key }}'
    configuration: |
      apiVersion: kubeadm.k8s.io/v1beta1
      kind: InitConfiguration
      bootstrapTokens:
      - token: '{{ kubeadm.bootstrap_token }}'
        ttl: 0s
      localAPIEndpoint:
        advertiseAddress: {{ master_ips[index] }}
        bindPort: 6443
      nodeRegistration:
        taints: []
        kubeletExtraArgs:
          node-labels: ""
          feature-gates: ExperimentalCriticalPodAnnotation=true
      ---
      apiVersion: kubeadm.k8s.io/v1beta1
      kind: ClusterConfiguration
      clusterName: {{ cluster_name }}
      controlPlaneEndpoint: {{ master_ips[0] }}:443
      apiServer:
        certSANs: [ {% for ip in master_ips %}"{{ ip }}"{% if not loop.last %}, {% endif %}{% endfor %} ]
        extraArgs:
          feature-gates: ExperimentalCriticalPodAnnotation=true
      controllerManager:
        extraArgs:
          terminated-pod-gc-threshold: '100'
          feature-gates: ExperimentalCriticalPodAnnotation=true
      scheduler:
        extraArgs:
          feature-gates: ExperimentalCriticalPodAnnotation=true
      networking:
        dnsDomain: {{ service_domain }}
        podSubnet: {{ pod_subnets | join(",") }}
        serviceSubnet: {{ service_subnets | join(",") }}
      ---
      apiVersion: kubeproxy.config.k8s.io/v1alpha1
      kind: KubeProxyConfiguration
      mode: ipvs
      ipvs:
        scheduler: lc
  trustd:
    username: '{{ trustd.username }}'
    password: '{{ trustd.password }}'
    endpoints: [ {% for ip in endpoints %}"{{ ip }}"{% if not loop.last %}, {% endif %}{% endfor %} ]
    certSANs: [ "{{ master_ips[index] }}" ]
"#;

const CONTROLPLANE_TEMPLATE: &str = r#"---
version: ""
security:
  os:
    ca:
      crt: {{ certs.os_cert }}
      key: {{ certs.os_key }}
  kubernetes:
    ca:
      crt: {{ certs.k8s_cert }}
      key: {{ certs.k8s_key }}
networking:
  os:
    devices:
    - interface: eth0
      dhcp: true
services:
  init:
    cni: flannel
  kubeadm:
    certificateKey: '{{ kubeadm.certificate_key }}'
    configuration: |
      apiVersion: kubeadm.k8s.io/v1beta1
      kind: JoinConfiguration
      controlPlane:
        apiEndpoint:
          advertiseAddress: {{ master_ips[index] }}
          bindPort: 6443
      discovery:
        bootstrapToken:
          token: '{{ kubeadm.bootstrap_token }}'
          unsafeSkipCAVerification: true
          apiServerEndpoint: {{ master_ips[0] }}:443
      nodeRegistration:
        taints: []
        kubeletExtraArgs:
          node-labels: ""
          feature-gates: ExperimentalCriticalPodAnnotation=true
  trustd:
    username: '{{ trustd.username }}'
    password: '{{ trustd.password }}'
    endpoints: [ {% for ip in endpoints %}"{{ ip }}"{% if not loop.last %}, {% endif %}{% endfor %} ]
    bootstrapNode: "{{ master_ips[0] }}"
    certSANs: [ "{{ master_ips[index] }}" ]
"#;

const WORKER_TEMPLATE: &str = r#"---
version: ""
security: null
networking:
  os:
    devices:
    - interface: eth0
      dhcp: true
services:
  init:
    cni: flannel
  kubeadm:
    configuration: |
      apiVersion: kubeadm.k8s.io/v1beta1
      kind: JoinConfiguration
      discovery:
        bootstrapToken:
          token: '{{ kubeadm.bootstrap_token }}'
          unsafeSkipCAVerification: true
          apiServerEndpoint: {{ master_ips[0] }}:443
      nodeRegistration:
        taints: []
        kubeletExtraArgs:
          node-labels: ""
          feature-gates: ExperimentalCriticalPodAnnotation=true
  trustd:
    username: '{{ trustd.username }}'
    password: '{{ trustd.password }}'
    endpoints: [ {% for ip in endpoints %}"{{ ip }}"{% if not loop.last %}, {% endif %}{% endfor %} ]
"#;

const TALOSCONFIG_TEMPLATE: &str = r#"---
context: {{ cluster_name }}
contexts:
  {{ cluster_name }}:
    target: {{ master_ips[0] }}
    ca: {{ certs.os_cert }}
    crt: {{ certs.admin_cert }}
    key: {{ certs.admin_key }}
"#;
