//! Cached digest challenges, keyed by (Call-ID, realm) (§4.6 "Challenge
//! caching", §4.8).
//!
//! The provider itself owns the cache (see [`super::Provider`]); this module
//! only holds the per-challenge state and the callback contract the
//! application fulfils to supply credentials.

use std::sync::Arc;

use rvoip_sip_core::Algorithm;

use crate::auth::DigestChallenge;

/// One outstanding challenge the provider remembers so it can auto-fill
/// `Authorization`/`Proxy-Authorization` on subsequent requests in the same
/// Call-ID without waiting for another 401/407.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub realm: String,
    pub challenge: DigestChallenge,
    /// True when the challenge arrived via Proxy-Authenticate rather than
    /// WWW-Authenticate (selects which header the filled credentials go in).
    pub is_proxy: bool,
    pub nonce_count: u32,
    pub consecutive_failures: u32,
}

impl AuthContext {
    pub fn new(realm: String, challenge: DigestChallenge, is_proxy: bool) -> Self {
        AuthContext {
            realm,
            challenge,
            is_proxy,
            nonce_count: 0,
            consecutive_failures: 0,
        }
    }

    pub fn next_nonce_count(&mut self) -> u32 {
        self.nonce_count += 1;
        self.nonce_count
    }

    /// §4.7 "after 3 consecutive auth failures stop retrying" — the provider
    /// reuses the same cap for any caller driving retries off this context.
    pub fn failures_exhausted(&self) -> bool {
        self.consecutive_failures >= 3
    }
}

/// Credentials for one (realm, username) pair, supplied by the application
/// on demand rather than held in the stack (§4.6 "digest credentials
/// supplied by an `auth_requested` callback").
#[derive(Debug, Clone)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
    pub ha1: Option<String>,
}

/// The application-supplied callback invoked whenever the provider needs
/// credentials for a realm it doesn't already have cached. Returning `None`
/// means the challenge cannot be answered; the original 401/407 is
/// surfaced unfilled.
pub type AuthRequestedCallback = Arc<dyn Fn(&str) -> Option<AuthCredentials> + Send + Sync>;

/// Checks a challenge's algorithm/qop against the configured digest policy
/// (§4.6 "Digest compatibility policy").
pub fn policy_allows(challenge: &DigestChallenge, allow_md5: bool, allow_no_qop: bool) -> bool {
    if challenge.algorithm == Algorithm::Md5 && !allow_md5 {
        return false;
    }
    if challenge.qop.is_none() && !allow_no_qop {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvoip_sip_core::Qop;

    fn challenge(algorithm: Algorithm, qop: Option<Qop>) -> DigestChallenge {
        DigestChallenge {
            realm: "example.com".to_string(),
            nonce: "n".to_string(),
            opaque: None,
            qop,
            algorithm,
        }
    }

    #[test]
    fn md5_rejected_when_policy_disallows_it() {
        let c = challenge(Algorithm::Md5, Some(Qop::Auth));
        assert!(!policy_allows(&c, false, true));
        assert!(policy_allows(&c, true, true));
    }

    #[test]
    fn missing_qop_rejected_when_policy_requires_it() {
        let c = challenge(Algorithm::Md5, None);
        assert!(!policy_allows(&c, true, false));
        assert!(policy_allows(&c, true, true));
    }

    #[test]
    fn three_consecutive_failures_exhausts_context() {
        let mut ctx = AuthContext::new("example.com".into(), challenge(Algorithm::Md5, Some(Qop::Auth)), false);
        assert!(!ctx.failures_exhausted());
        ctx.consecutive_failures = 3;
        assert!(ctx.failures_exhausted());
    }
}
