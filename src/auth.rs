//! Digest challenge/response for the gateway login.
//!
//! DESIGN
//! ======
//! The gateway answers an unauthenticated probe with `401` and a digest
//! challenge. The socket upgrade then carries an RFC 2617 `Authorization`
//! header computed from the challenge and the credentials. The `nc` counter
//! belongs to the authenticator instance and increases on every computation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use md5::{Digest, Md5};
use reqwest::StatusCode;
use reqwest::header::WWW_AUTHENTICATE;

use crate::config::ClientConfig;
use crate::error::AuthError;

/// The probe is always a GET, so HA2 is computed over that method.
const CHALLENGE_METHOD: &str = "GET";
const CNONCE_LEN: usize = 4;

/// Server-issued digest parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: String,
    pub opaque: Option<String>,
    /// Path the challenge was issued for; echoed back in the response.
    pub uri: String,
}

impl AuthChallenge {
    /// Parse a `www-authenticate` value such as
    /// `Digest realm="x", qop="auth", nonce="y"`.
    pub fn parse(header: &str, uri: &str) -> Result<Self, AuthError> {
        let fields = parse_fields(header);
        let required = |name: &'static str| fields.get(name).cloned().ok_or(AuthError::MissingField(name));
        Ok(Self {
            realm: required("realm")?,
            nonce: required("nonce")?,
            qop: required("qop")?,
            opaque: fields.get("opaque").cloned(),
            uri: uri.to_owned(),
        })
    }
}

fn parse_fields(header: &str) -> HashMap<String, String> {
    let trimmed = header.trim();
    let params = match trimmed.get(..6) {
        Some(scheme) if scheme.eq_ignore_ascii_case("digest") => &trimmed[6..],
        _ => trimmed,
    };

    let mut fields = HashMap::new();
    for pair in split_params(params) {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        fields.insert(key.trim().to_ascii_lowercase(), value.to_owned());
    }
    fields
}

/// Split on commas that are not inside a quoted value.
fn split_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in params.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&params[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

/// One computed `Authorization` value with the parts that vary per call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestAuthorization {
    pub header: String,
    pub response: String,
    pub nc: String,
    pub cnonce: String,
}

/// Credentials plus the request counter used for `nc`.
#[derive(Debug)]
pub struct DigestAuthenticator {
    username: String,
    password: String,
    counter: AtomicU32,
}

impl DigestAuthenticator {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into(), counter: AtomicU32::new(0) }
    }

    /// Compute an authorization for `challenge` with a fresh client nonce.
    pub fn authorize(&self, challenge: &AuthChallenge) -> DigestAuthorization {
        let bytes: [u8; CNONCE_LEN] = rand::random();
        self.authorize_with(challenge, &to_hex(&bytes))
    }

    pub(crate) fn authorize_with(&self, challenge: &AuthChallenge, cnonce: &str) -> DigestAuthorization {
        let count = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let nc = format!("{count:08}");
        let ha1 = self.ha1(&challenge.realm);
        let ha2 = ha2(&challenge.uri);
        let response = md5_hex(&format!("{ha1}:{}:{nc}:{cnonce}:{}:{ha2}", challenge.nonce, challenge.qop));
        let header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{response}\", qop={}, nc={nc}, cnonce=\"{cnonce}\"",
            self.username, challenge.realm, challenge.nonce, challenge.uri, challenge.qop,
        );
        DigestAuthorization { header, response, nc, cnonce: cnonce.to_owned() }
    }

    pub(crate) fn ha1(&self, realm: &str) -> String {
        md5_hex(&format!("{}:{realm}:{}", self.username, self.password))
    }
}

pub(crate) fn ha2(uri: &str) -> String {
    md5_hex(&format!("{CHALLENGE_METHOD}:{uri}"))
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    to_hex(&hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()
}

/// Probe the login path and parse the digest challenge from the `401` reply.
pub async fn fetch_challenge(http: &reqwest::Client, config: &ClientConfig) -> Result<AuthChallenge, AuthError> {
    let response = http.get(config.probe_url()).send().await?;
    let status = response.status();
    if status != StatusCode::UNAUTHORIZED {
        return Err(AuthError::UnexpectedStatus(status.as_u16()));
    }
    let header = response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingChallenge)?;
    tracing::debug!(hostname = %config.hostname, "received digest challenge");
    AuthChallenge::parse(header, &config.login_path())
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
