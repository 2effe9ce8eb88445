//! Certificate material for a cluster bootstrap pass
//!
//! Two independent trust domains are created per pass:
//! - the Kubernetes CA (RSA) consumed by the control plane
//! - the OS CA (ECDSA P-256) consumed by the node OS API
//!
//! The admin credential is issued through a CSR: a local key pair signs a
//! request for `127.0.0.1`, and the OS CA signs that request.

use crate::error::{Error, Result};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
    SignatureAlgorithm,
};
use std::net::{IpAddr, Ipv4Addr};
use x509_parser::prelude::*;

/// Validity of both authorities (10 years)
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Validity of the admin credential (1 year)
pub const ADMIN_VALIDITY_DAYS: i64 = 365;

const ADMIN_COMMON_NAME: &str = "talos-admin";

fn compute_validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

fn distinguished_name(common_name: &str, organization: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(organization.to_string()),
    );
    dn
}

fn generate_key(alg: &'static SignatureAlgorithm, what: &str) -> Result<KeyPair> {
    KeyPair::generate_for(alg)
        .map_err(|e| Error::Certificate(format!("failed to generate {} key: {}", what, e)))
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| Error::Certificate(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

// =============================================================================
// Certificate Authority
// =============================================================================

/// A self-signed certificate authority, kept as PEM
#[derive(Clone)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    /// Kubernetes control plane CA (RSA 2048, SHA-256)
    pub fn kubernetes() -> Result<Self> {
        Self::self_signed("kubernetes", "kubernetes", &rcgen::PKCS_RSA_SHA256)
    }

    /// Node OS CA (ECDSA P-256)
    pub fn talos() -> Result<Self> {
        Self::self_signed("talos", "talos", &rcgen::PKCS_ECDSA_P256_SHA256)
    }

    fn self_signed(
        common_name: &str,
        organization: &str,
        alg: &'static SignatureAlgorithm,
    ) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, organization);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = generate_key(alg, organization)?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            Error::Certificate(format!("failed to self-sign {} CA: {}", organization, e))
        })?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// CA certificate in PEM format
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// CA private key in PEM format
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Sign a client CSR, keeping its public key and loopback address
    pub fn sign_client_csr(&self, csr_pem: &str, common_name: &str) -> Result<String> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| Error::Certificate(format!("failed to parse CSR: {}", e)))?;

        csr.params.distinguished_name = distinguished_name(common_name, "talos");
        csr.params.is_ca = IsCa::NoCa;
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        csr.params.subject_alt_names = vec![SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST))];

        let (not_before, not_after) = compute_validity(ADMIN_VALIDITY_DAYS);
        csr.params.not_before = not_before;
        csr.params.not_after = not_after;

        let ca_key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| Error::Certificate(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| Error::Certificate(format!("failed to create issuer: {}", e)))?;

        let signed = csr
            .signed_by(&issuer)
            .map_err(|e| Error::Certificate(format!("failed to sign CSR: {}", e)))?;

        Ok(signed.pem())
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

// =============================================================================
// Admin Credential
// =============================================================================

/// Local-only admin client credential for the node OS API
#[derive(Clone)]
pub struct AdminCredential {
    cert_pem: String,
    key_pem: String,
}

impl AdminCredential {
    /// Generate a key pair, request a certificate for 127.0.0.1 and have the OS CA sign it
    pub fn issue(os_ca: &CertificateAuthority) -> Result<Self> {
        let key_pair = generate_key(&rcgen::PKCS_ECDSA_P256_SHA256, "admin")?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(ADMIN_COMMON_NAME, "talos");
        params.subject_alt_names = vec![SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST))];

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| Error::Certificate(format!("failed to create CSR: {}", e)))?;
        let csr_pem = csr
            .pem()
            .map_err(|e| Error::Certificate(format!("failed to serialize CSR: {}", e)))?;

        let cert_pem = os_ca.sign_client_csr(&csr_pem, ADMIN_COMMON_NAME)?;

        Ok(Self {
            cert_pem,
            key_pem: key_pair.serialize_pem(),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }
}

impl std::fmt::Debug for AdminCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredential").finish_non_exhaustive()
    }
}

// =============================================================================
// Verification
// =============================================================================

/// Check that `cert_pem` carries a valid signature by `ca_pem`'s key
pub fn verify_signed_by(cert_pem: &str, ca_pem: &str) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| Error::Certificate(format!("failed to parse certificate: {}", e)))?;

    let ca_der = parse_pem(ca_pem)?;
    let (_, ca) = X509Certificate::from_der(&ca_der)
        .map_err(|e| Error::Certificate(format!("failed to parse CA certificate: {}", e)))?;

    Ok(cert.verify_signature(Some(ca.public_key())).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject_org(pem: &str) -> String {
        let der = parse_pem(pem).unwrap();
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let org = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .unwrap_or_default()
            .to_string();
        org
    }

    // =========================================================================
    // Trust Domain Stories
    // =========================================================================

    #[test]
    fn story_admin_credential_verifies_against_os_ca() {
        let os_ca = CertificateAuthority::talos().unwrap();
        let admin = AdminCredential::issue(&os_ca).unwrap();

        assert!(verify_signed_by(admin.cert_pem(), os_ca.cert_pem()).unwrap());
        assert!(admin.key_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn story_admin_credential_rejected_by_kubernetes_ca() {
        let os_ca = CertificateAuthority::talos().unwrap();
        let k8s_ca = CertificateAuthority::kubernetes().unwrap();
        let admin = AdminCredential::issue(&os_ca).unwrap();

        assert!(!verify_signed_by(admin.cert_pem(), k8s_ca.cert_pem()).unwrap());
    }

    #[test]
    fn story_authorities_are_self_signed_and_distinct() {
        let os_ca = CertificateAuthority::talos().unwrap();
        let k8s_ca = CertificateAuthority::kubernetes().unwrap();

        assert!(verify_signed_by(os_ca.cert_pem(), os_ca.cert_pem()).unwrap());
        assert!(verify_signed_by(k8s_ca.cert_pem(), k8s_ca.cert_pem()).unwrap());
        assert_eq!(subject_org(os_ca.cert_pem()), "talos");
        assert_eq!(subject_org(k8s_ca.cert_pem()), "kubernetes");
    }

    #[test]
    fn test_admin_certificate_is_for_loopback() {
        let os_ca = CertificateAuthority::talos().unwrap();
        let admin = AdminCredential::issue(&os_ca).unwrap();

        let der = parse_pem(admin.cert_pem()).unwrap();
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let san = cert.subject_alternative_name().unwrap().unwrap();
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::IPAddress(ip) if *ip == [127, 0, 0, 1])));
    }

    #[test]
    fn test_parse_pem_rejects_garbage() {
        assert!(parse_pem("not a pem").is_err());
    }
}
