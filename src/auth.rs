use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use rand::Rng;

/// base64("Username:")
pub const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
/// base64("Password:")
pub const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

/// Sous-état d'un échange AUTH en cours. Un seul état actif à la fois.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    None,
    AwaitingCramResponse,
    AwaitingLoginUsername,
    AwaitingLoginPassword { username: String },
    AwaitingPlainResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
    CramMd5,
}

impl Mechanism {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "PLAIN" => Some(Mechanism::Plain),
            "LOGIN" => Some(Mechanism::Login),
            "CRAM-MD5" => Some(Mechanism::CramMd5),
            _ => None,
        }
    }
}

/// Identifiants soumis par le client, en attente de validation par la session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAttempt {
    Plaintext {
        username: String,
        password: String,
    },
    CramMd5 {
        username: String,
        digest: String,
        challenge: String,
    },
}

impl AuthAttempt {
    pub fn mechanism(&self) -> &'static str {
        match self {
            AuthAttempt::Plaintext { .. } => "plaintext",
            AuthAttempt::CramMd5 { .. } => "cram_md5",
        }
    }

    pub fn username(&self) -> &str {
        match self {
            AuthAttempt::Plaintext { username, .. } | AuthAttempt::CramMd5 { username, .. } => {
                username
            }
        }
    }
}

pub fn encode(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Décode une ligne base64 reçue du client en texte UTF-8.
pub fn decode_text(line: &str) -> Result<String> {
    let raw = STANDARD
        .decode(line.trim())
        .context("invalid base64 payload")?;
    String::from_utf8(raw).context("payload is not valid UTF-8")
}

/// Décode une réponse PLAIN (RFC 4616) : `authzid\0authcid\0password`.
/// L'authzid est ignoré.
pub fn decode_plain(line: &str) -> Result<(String, String)> {
    let decoded = decode_text(line)?;
    let mut parts = decoded.split('\0');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_authzid), Some(username), Some(password), None) => {
            Ok((username.to_string(), password.to_string()))
        }
        _ => Err(anyhow!("malformed PLAIN response")),
    }
}

/// Décode une réponse CRAM-MD5 : `username digest`.
pub fn decode_cram_response(line: &str) -> Result<(String, String)> {
    let decoded = decode_text(line)?;
    let mut parts = decoded.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(username), Some(digest), None) => Ok((username.to_string(), digest.to_string())),
        _ => Err(anyhow!("malformed CRAM-MD5 response")),
    }
}

/// Challenge au format RFC 2195 : `<random.timestamp@fqdn>`
pub fn cram_challenge(fqdn: &str) -> String {
    let nonce: u32 = rand::thread_rng().gen();
    format!("<{}.{}@{}>", nonce, Utc::now().timestamp(), fqdn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_match_their_plain_text() {
        assert_eq!(encode("Username:"), USERNAME_PROMPT);
        assert_eq!(encode("Password:"), PASSWORD_PROMPT);
    }

    #[test]
    fn mechanism_names_are_case_insensitive() {
        assert_eq!(Mechanism::parse("plain"), Some(Mechanism::Plain));
        assert_eq!(Mechanism::parse("Login"), Some(Mechanism::Login));
        assert_eq!(Mechanism::parse("cram-md5"), Some(Mechanism::CramMd5));
        assert_eq!(Mechanism::parse("DIGEST-MD5"), None);
    }

    #[test]
    fn decode_plain_test1() {
        let line = encode("\0bob\0secret");
        let (username, password) = decode_plain(&line).unwrap();
        assert_eq!(username, "bob");
        assert_eq!(password, "secret");
    }

    #[test]
    fn decode_plain_ignores_authzid() {
        let line = encode("admin\0bob\0secret");
        assert_eq!(
            decode_plain(&line).unwrap(),
            ("bob".to_string(), "secret".to_string())
        );
    }

    #[test]
    fn decode_plain_rejects_bad_layout() {
        assert!(decode_plain(&encode("bob:secret")).is_err());
        assert!(decode_plain(&encode("\0bob\0secret\0extra")).is_err());
        assert!(decode_plain("!!not base64!!").is_err());
        assert!(decode_plain("").is_err());
    }

    #[test]
    fn decode_text_rejects_invalid_utf8() {
        let line = STANDARD.encode([0xff, 0xfe, 0xfd]);
        assert!(decode_text(&line).is_err());
    }

    #[test]
    fn decode_cram_response_test1() {
        let line = "dGltIGI5MTNhNjAyYzdlZGE3YTQ5NWI0ZTZlNzMzNGQzODkw";
        let (username, digest) = decode_cram_response(line).unwrap();
        assert_eq!(username, "tim");
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn decode_cram_response_rejects_single_token() {
        assert!(decode_cram_response(&encode("tim")).is_err());
        assert!(decode_cram_response("%%%").is_err());
    }

    #[test]
    fn challenge_has_rfc2195_shape() {
        let challenge = cram_challenge("mx.example.org");
        assert!(challenge.starts_with('<'));
        assert!(challenge.ends_with("@mx.example.org>"));
        let inner = &challenge[1..challenge.find('@').unwrap()];
        let (nonce, timestamp) = inner.split_once('.').unwrap();
        assert!(nonce.parse::<u32>().is_ok());
        assert!(timestamp.parse::<i64>().unwrap() > 0);
    }

    #[test]
    fn attempt_reports_mechanism() {
        let attempt = AuthAttempt::CramMd5 {
            username: "tim".to_string(),
            digest: "00".to_string(),
            challenge: "<1.2@x>".to_string(),
        };
        assert_eq!(attempt.mechanism(), "cram_md5");
        assert_eq!(attempt.username(), "tim");
    }
}
