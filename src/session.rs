use crate::auth::AuthAttempt;
use crate::utils::Logger;

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;

/// Services fournis au protocole par la session du honeypot :
/// transcription de l'échange et validation des identifiants.
pub trait Session: Send + Sync {
    fn transcript_incoming(&self, line: &str) -> impl Future<Output = ()> + Send;

    fn transcript_outgoing(&self, line: &str) -> impl Future<Output = ()> + Send;

    fn try_auth(&self, attempt: &AuthAttempt) -> impl Future<Output = bool> + Send;
}

/// Identifiants acceptés par le honeypot.
#[derive(Debug, Default)]
pub struct CredentialStore {
    passwords: HashMap<String, String>,
    accept_all: bool,
}

impl CredentialStore {
    /// `entries` au format `user:password`.
    pub fn parse(entries: &[String], accept_all: bool) -> Result<Self> {
        let mut passwords = HashMap::new();
        for entry in entries {
            let (username, password) = entry
                .split_once(':')
                .ok_or_else(|| anyhow!("Invalid credential {:?}, expected user:password", entry))?;
            passwords.insert(username.to_string(), password.to_string());
        }
        Ok(Self { passwords, accept_all })
    }

    pub fn len(&self) -> usize {
        self.passwords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }

    pub fn accept_all(&self) -> bool {
        self.accept_all
    }

    pub fn verify(&self, attempt: &AuthAttempt) -> bool {
        if self.accept_all {
            return true;
        }

        let password = match self.passwords.get(attempt.username()) {
            Some(password) => password,
            None => return false,
        };

        match attempt {
            AuthAttempt::Plaintext { password: given, .. } => given == password,
            AuthAttempt::CramMd5 { digest, challenge, .. } => {
                match cram_md5_digest(password, challenge) {
                    Ok(expected) => expected.eq_ignore_ascii_case(digest),
                    Err(_) => false,
                }
            }
        }
    }
}

/// hex(HMAC-MD5(password, challenge)), RFC 2195.
pub fn cram_md5_digest(password: &str, challenge: &str) -> Result<String> {
    let key = PKey::hmac(password.as_bytes())?;
    let mut signer = Signer::new(MessageDigest::md5(), &key)?;
    signer.update(challenge.as_bytes())?;
    let mac = signer.sign_to_vec()?;
    Ok(mac.iter().map(|b| format!("{:02x}", b)).collect())
}

pub struct HoneypotSession {
    pub client_addr: SocketAddr,
    logger: Arc<Logger>,
    credentials: Arc<CredentialStore>,
}

impl HoneypotSession {
    pub fn new(client_addr: SocketAddr, logger: Arc<Logger>, credentials: Arc<CredentialStore>) -> Self {
        Self {
            client_addr,
            logger,
            credentials,
        }
    }
}

impl Session for HoneypotSession {
    async fn transcript_incoming(&self, line: &str) {
        self.logger.log(&self.client_addr, &format!(">> {}", line)).await;
    }

    async fn transcript_outgoing(&self, line: &str) {
        self.logger.log(&self.client_addr, &format!("<< {}", line)).await;
    }

    async fn try_auth(&self, attempt: &AuthAttempt) -> bool {
        let details = match attempt {
            AuthAttempt::Plaintext { username, password } => {
                format!("username: {}\npassword: {}", username, password)
            }
            AuthAttempt::CramMd5 { username, digest, challenge } => {
                format!("username: {}\ndigest: {}\nchallenge: {}", username, digest, challenge)
            }
        };
        self.logger
            .log_verbose(&self.client_addr, &format!("AUTH attempt ({})", attempt.mechanism()), &details)
            .await;

        let accepted = self.credentials.verify(attempt);
        let outcome = if accepted { "accepted" } else { "rejected" };
        self.logger
            .log(&self.client_addr, &format!("AUTH {} for {:?} {}", attempt.mechanism(), attempt.username(), outcome))
            .await;
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        CredentialStore::parse(
            &["tim:tanstaaftanstaaf".to_string(), "bob:se:cret".to_string()],
            false,
        )
        .unwrap()
    }

    #[test]
    fn cram_md5_digest_rfc2195() {
        let digest = cram_md5_digest(
            "tanstaaftanstaaf",
            "<1896.697170952@postoffice.reston.mci.net>",
        )
        .unwrap();
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn parse_splits_on_first_colon() {
        let store = store();
        assert_eq!(store.len(), 2);
        assert!(store.verify(&AuthAttempt::Plaintext {
            username: "bob".to_string(),
            password: "se:cret".to_string(),
        }));
    }

    #[test]
    fn parse_rejects_missing_colon() {
        assert!(CredentialStore::parse(&["bob".to_string()], false).is_err());
    }

    #[test]
    fn verify_plaintext() {
        let store = store();
        assert!(!store.verify(&AuthAttempt::Plaintext {
            username: "bob".to_string(),
            password: "wrong".to_string(),
        }));
        assert!(!store.verify(&AuthAttempt::Plaintext {
            username: "nobody".to_string(),
            password: "se:cret".to_string(),
        }));
    }

    #[test]
    fn verify_cram_md5() {
        let store = store();
        let attempt = |digest: &str| AuthAttempt::CramMd5 {
            username: "tim".to_string(),
            digest: digest.to_string(),
            challenge: "<1896.697170952@postoffice.reston.mci.net>".to_string(),
        };
        assert!(store.verify(&attempt("b913a602c7eda7a495b4e6e7334d3890")));
        assert!(store.verify(&attempt("B913A602C7EDA7A495B4E6E7334D3890")));
        assert!(!store.verify(&attempt("00000000000000000000000000000000")));
    }

    #[test]
    fn accept_all_accepts_anything() {
        let store = CredentialStore::parse(&[], true).unwrap();
        assert!(store.verify(&AuthAttempt::Plaintext {
            username: "root".to_string(),
            password: "toor".to_string(),
        }));
    }

    #[tokio::test]
    async fn honeypot_session_logs_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("honeypot.log");
        let logger = Arc::new(Logger::new(Some(path.clone()), false, false).unwrap());
        let session = HoneypotSession::new(
            "203.0.113.9:51000".parse().unwrap(),
            logger,
            Arc::new(store()),
        );

        session.transcript_incoming("AUTH LOGIN").await;
        session.transcript_outgoing("334 VXNlcm5hbWU6").await;
        let accepted = session
            .try_auth(&AuthAttempt::Plaintext {
                username: "bob".to_string(),
                password: "se:cret".to_string(),
            })
            .await;
        assert!(accepted);

        let content = std::fs::read_to_string(&path).unwrap();
        let incoming = content.find(">> AUTH LOGIN").unwrap();
        let outgoing = content.find("<< 334 VXNlcm5hbWU6").unwrap();
        assert!(incoming < outgoing);
        assert!(content.contains("password: se:cret"));
        assert!(content.contains("AUTH plaintext for \"bob\" accepted"));
    }
}
