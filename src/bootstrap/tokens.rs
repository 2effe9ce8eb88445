//! Shared join secrets
//!
//! Both pairs are generated along with the rest of a cluster's bootstrap material.

use rand::Rng;

/// Alphabet used for kubeadm bootstrap tokens and trustd credentials
const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random string of `len` characters drawn from `[a-z0-9]`
pub fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

/// Kubeadm join secrets: bootstrap token plus certificate encryption key
#[derive(Clone, PartialEq, Eq)]
pub struct KubeadmTokens {
    /// `[a-z0-9]{6}.[a-z0-9]{16}`
    pub bootstrap_token: String,
    /// 32 random bytes, hex encoded
    pub certificate_key: String,
}

impl KubeadmTokens {
    pub fn generate() -> Self {
        let bootstrap_token = format!("{}.{}", random_string(6), random_string(16));

        let mut key = [0u8; 32];
        rand::thread_rng().fill(&mut key);
        let certificate_key = hex::encode(key);

        Self {
            bootstrap_token,
            certificate_key,
        }
    }
}

impl std::fmt::Debug for KubeadmTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // token id only, the secret half stays out of logs
        let id = self.bootstrap_token.split('.').next().unwrap_or_default();
        f.debug_struct("KubeadmTokens")
            .field("token_id", &id)
            .finish_non_exhaustive()
    }
}

/// Credentials for the node trust daemon
#[derive(Clone, PartialEq, Eq)]
pub struct TrustdCredentials {
    pub username: String,
    pub password: String,
}

impl TrustdCredentials {
    pub fn generate() -> Self {
        Self {
            username: random_string(14),
            password: random_string(24),
        }
    }
}

impl std::fmt::Debug for TrustdCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustdCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_token_char(c: char) -> bool {
        c.is_ascii_lowercase() || c.is_ascii_digit()
    }

    #[test]
    fn test_bootstrap_token_format() {
        let tokens = KubeadmTokens::generate();
        let (id, secret) = tokens.bootstrap_token.split_once('.').unwrap();
        assert_eq!(id.len(), 6);
        assert_eq!(secret.len(), 16);
        assert!(id.chars().chain(secret.chars()).all(is_token_char));
    }

    #[test]
    fn test_certificate_key_is_32_bytes_hex() {
        let tokens = KubeadmTokens::generate();
        assert_eq!(tokens.certificate_key.len(), 64);
        assert!(tokens.certificate_key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_secrets_rotate_per_generation() {
        assert_ne!(KubeadmTokens::generate(), KubeadmTokens::generate());
        assert_ne!(TrustdCredentials::generate(), TrustdCredentials::generate());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let tokens = KubeadmTokens::generate();
        let secret = tokens.bootstrap_token.split_once('.').unwrap().1.to_string();
        assert!(!format!("{:?}", tokens).contains(&secret));

        let creds = TrustdCredentials::generate();
        assert!(!format!("{:?}", creds).contains(&creds.password));
    }

    #[test]
    fn test_random_string_charset() {
        let s = random_string(64);
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(is_token_char));
    }
}
