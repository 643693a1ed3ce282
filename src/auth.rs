//! RFC 7616 / RFC 2617 digest authentication helper (§4.8).
//!
//! This module only computes HA1/HA2/response and tracks `nc`; it does not
//! parse or serialize the `WWW-Authenticate`/`Authorization` headers
//! themselves — that grammar lives in `rvoip_sip_core::types::auth`, which
//! this module builds on.

use md5::{Digest as _, Md5};
use rvoip_sip_core::{Algorithm, DigestParam, Qop};
use sha2::Sha256;

use crate::error::{AuthError, Result as CrateResult};

fn hex_md5(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    hex::encode(digest)
}

fn hex_sha256(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)
}

fn hash(algorithm: Algorithm, input: &str) -> String {
    match algorithm {
        Algorithm::Md5 => hex_md5(input),
        Algorithm::Sha256 => hex_sha256(input),
        _ => hex_md5(input),
    }
}

/// Small hex encoder so we don't pull in the `hex` crate for eight lines of code.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(bytes.as_ref().len() * 2);
        for b in bytes.as_ref() {
            let _ = write!(out, "{:02x}", b);
        }
        out
    }
}

/// Inputs needed to compute a digest response, gathered from the cached
/// challenge ([`crate::provider::auth_context::AuthContext`]) and the
/// credentials the application supplied via its `auth_requested` callback.
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub password: String,
    /// Pre-computed HA1 (e.g. from a stored password hash), used instead of
    /// `password` when present.
    pub ha1: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: Option<Qop>,
    pub algorithm: Algorithm,
}

impl DigestChallenge {
    /// Extracts the fields this module needs from a parsed `Challenge::Digest`.
    pub fn from_params(params: &[DigestParam]) -> Option<Self> {
        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = Algorithm::Md5;
        let mut qop = None;

        for p in params {
            match p {
                DigestParam::Realm(v) => realm = Some(v.clone()),
                DigestParam::Nonce(v) => nonce = Some(v.clone()),
                DigestParam::Opaque(v) => opaque = Some(v.clone()),
                DigestParam::Algorithm(a) => algorithm = a.clone(),
                DigestParam::Qop(options) => {
                    qop = options
                        .iter()
                        .find(|q| matches!(q, Qop::Auth))
                        .or_else(|| options.first())
                        .cloned();
                }
                _ => {}
            }
        }

        Some(DigestChallenge {
            realm: realm?,
            nonce: nonce?,
            opaque,
            qop,
            algorithm,
        })
    }
}

/// One computed Authorization response, ready to be placed in an
/// `Authorization`/`Proxy-Authorization` header by the provider.
#[derive(Debug, Clone)]
pub struct DigestResponse {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Algorithm,
    pub opaque: Option<String>,
    pub qop: Option<Qop>,
    pub cnonce: Option<String>,
    pub nonce_count: Option<u32>,
}

/// Computes HA1, per RFC 7616 §3.4.2: `H(username:realm:password)`.
pub fn compute_ha1(credentials: &DigestCredentials, algorithm: Algorithm) -> String {
    if let Some(ha1) = &credentials.ha1 {
        return ha1.clone();
    }
    hash(
        algorithm,
        &format!(
            "{}:{}:{}",
            credentials.username, credentials.realm, credentials.password
        ),
    )
}

/// Computes HA2, per RFC 7616 §3.4.3: `H(method:uri)` for `qop=auth`.
pub fn compute_ha2(algorithm: Algorithm, method: &str, uri: &str) -> String {
    hash(algorithm, &format!("{method}:{uri}"))
}

/// Computes a full digest response for one request, given the cached
/// challenge, supplied credentials, the request's method/URI, and the
/// (Call-ID, realm)-scoped nonce count.
pub fn compute_response(
    challenge: &DigestChallenge,
    credentials: &DigestCredentials,
    method: &str,
    request_uri: &str,
    nonce_count: u32,
    policy_allow_md5: bool,
    policy_allow_no_qop: bool,
) -> CrateResult<DigestResponse> {
    if challenge.algorithm == Algorithm::Md5 && !policy_allow_md5 {
        return Err(AuthError::Md5Disallowed.into());
    }
    if challenge.qop.is_none() && !policy_allow_no_qop {
        return Err(AuthError::QopRequired.into());
    }

    let ha1 = compute_ha1(credentials, challenge.algorithm.clone());
    let ha2 = compute_ha2(challenge.algorithm.clone(), method, request_uri);

    let cnonce = match challenge.qop {
        Some(_) => Some(format!("{:08x}{:08x}", rand::random::<u32>(), rand::random::<u32>())),
        None => None,
    };

    let response = match &challenge.qop {
        Some(qop) => {
            let qop_str = qop_token(qop);
            let nc = format!("{nonce_count:08x}");
            let cnonce = cnonce.as_deref().unwrap_or_default();
            hash(
                challenge.algorithm.clone(),
                &format!(
                    "{}:{}:{}:{}:{}:{}",
                    ha1, challenge.nonce, nc, cnonce, qop_str, ha2
                ),
            )
        }
        None => hash(
            challenge.algorithm.clone(),
            &format!("{}:{}:{}", ha1, challenge.nonce, ha2),
        ),
    };

    Ok(DigestResponse {
        username: credentials.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: request_uri.to_string(),
        response,
        algorithm: challenge.algorithm.clone(),
        opaque: challenge.opaque.clone(),
        qop: challenge.qop.clone(),
        cnonce,
        nonce_count: challenge.qop.as_ref().map(|_| nonce_count),
    })
}

fn qop_token(qop: &Qop) -> &'static str {
    match qop {
        Qop::Auth => "auth",
        Qop::AuthInt => "auth-int",
        _ => "auth",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_challenge() -> DigestChallenge {
        DigestChallenge {
            realm: "ex".to_string(),
            nonce: "abc".to_string(),
            opaque: None,
            qop: Some(Qop::Auth),
            algorithm: Algorithm::Md5,
        }
    }

    #[test]
    fn md5_ha1_matches_manual_computation() {
        let creds = DigestCredentials {
            username: "alice".to_string(),
            realm: "ex".to_string(),
            password: "secret".to_string(),
            ha1: None,
        };
        let ha1 = compute_ha1(&creds, Algorithm::Md5);
        assert_eq!(ha1, hex_md5("alice:ex:secret"));
    }

    #[test]
    fn response_uses_qop_auth_formula() {
        let challenge = sample_challenge();
        let creds = DigestCredentials {
            username: "alice".to_string(),
            realm: "ex".to_string(),
            password: "secret".to_string(),
            ha1: None,
        };
        let resp = compute_response(&challenge, &creds, "REGISTER", "sip:ex", 1, true, true).unwrap();
        let ha1 = compute_ha1(&creds, Algorithm::Md5);
        let ha2 = compute_ha2(Algorithm::Md5, "REGISTER", "sip:ex");
        let expected = hex_md5(&format!(
            "{}:{}:{:08x}:{}:auth:{}",
            ha1,
            "abc",
            1,
            resp.cnonce.clone().unwrap(),
            ha2
        ));
        assert_eq!(resp.response, expected);
        assert_eq!(resp.nonce_count, Some(1));
    }

    #[test]
    fn md5_disallowed_by_policy_is_rejected() {
        let challenge = sample_challenge();
        let creds = DigestCredentials {
            username: "alice".to_string(),
            realm: "ex".to_string(),
            password: "secret".to_string(),
            ha1: None,
        };
        let err = compute_response(&challenge, &creds, "REGISTER", "sip:ex", 1, false, true);
        assert!(err.is_err());
    }
}
