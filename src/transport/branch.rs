//! Via branch computation (§ "Via branch", §4.1 Via header fixup).
//!
//! Branches are derived from message invariants rather than drawn from an
//! RNG, so retransmissions of the same logical request (same From-tag,
//! To-tag, Call-ID, CSeq, request-URI and previous Via) always compute the
//! same branch — required for the round-trip property in §6 "Branch id
//! recomputed from the request invariants equals the branch in the sent
//! Via."

use md5::{Digest as _, Md5};

const MAGIC_COOKIE: &str = "z9hG4bK";

/// Invariant fields used to derive a branch or an RFC 2543 fallback key.
/// `previous_via` is the prior hop's Via header value for requests, or the
/// top Via of the response being matched for responses.
#[derive(Debug, Clone)]
pub struct BranchInputs<'a> {
    pub request_uri: &'a str,
    pub from_tag: &'a str,
    pub to_tag: &'a str,
    pub call_id: &'a str,
    pub cseq_number: u32,
    pub previous_via: &'a str,
}

fn hex_digest(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Computes a deterministic `z9hG4bK.<10 hex chars>` branch from message
/// invariants.
pub fn compute_branch(inputs: &BranchInputs<'_>) -> String {
    let joined = format!(
        "{}:{}:{}:{}:{}:{}",
        inputs.request_uri,
        inputs.from_tag,
        inputs.to_tag,
        inputs.call_id,
        inputs.cseq_number,
        inputs.previous_via
    );
    let digest = hex_digest(&joined);
    format!("{MAGIC_COOKIE}.{}", &digest[..10])
}

/// True when `branch` carries the RFC 3261 magic cookie.
pub fn is_rfc3261_branch(branch: &str) -> bool {
    branch.starts_with(MAGIC_COOKIE)
}

/// Fields used for the RFC 2543 backward-compatibility matching key, for
/// requests whose top Via lacks the magic cookie (§4.4 dispatch rule 2,
/// § "RFC 2543 compat").
#[derive(Debug, Clone)]
pub struct Rfc2543Inputs<'a> {
    pub from_full: &'a str,
    pub to_uri: &'a str,
    pub call_id: &'a str,
    pub cseq_number: u32,
    pub via_branch: &'a str,
}

/// Computes the heuristic RFC 2543 fallback matching key (not a real branch,
/// never placed on the wire — used only to key the transaction registry).
pub fn compute_rfc2543_key(inputs: &Rfc2543Inputs<'_>) -> String {
    let joined = format!(
        "{}:{}:{}:{}:{}",
        inputs.from_full, inputs.to_uri, inputs.call_id, inputs.cseq_number, inputs.via_branch
    );
    hex_digest(&joined)
}

/// Generates a deterministic 6 hex-digit To-tag from message invariants
/// (§ "To-tag").
pub fn compute_to_tag(inputs: &BranchInputs<'_>) -> String {
    let joined = format!(
        "{}:{}:{}:{}:{}:{}",
        inputs.request_uri,
        inputs.from_tag,
        inputs.to_tag,
        inputs.call_id,
        inputs.cseq_number,
        inputs.previous_via
    );
    let digest = hex_digest(&joined);
    digest[..6].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BranchInputs<'static> {
        BranchInputs {
            request_uri: "sip:bob@example.org",
            from_tag: "a1",
            to_tag: "",
            call_id: "call-1@host",
            cseq_number: 1,
            previous_via: "",
        }
    }

    #[test]
    fn branch_round_trips_on_identical_invariants() {
        let inputs = sample();
        let branch1 = compute_branch(&inputs);
        let branch2 = compute_branch(&inputs);
        assert_eq!(branch1, branch2);
        assert!(is_rfc3261_branch(&branch1));
    }

    #[test]
    fn branch_has_magic_cookie_and_ten_hex_chars() {
        let branch = compute_branch(&sample());
        let suffix = branch.strip_prefix("z9hG4bK.").unwrap();
        assert_eq!(suffix.len(), 10);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_cseq_changes_branch() {
        let mut inputs = sample();
        let branch1 = compute_branch(&inputs);
        inputs.cseq_number = 2;
        let branch2 = compute_branch(&inputs);
        assert_ne!(branch1, branch2);
    }

    #[test]
    fn to_tag_is_six_hex_chars() {
        let tag = compute_to_tag(&sample());
        assert_eq!(tag.len(), 6);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rfc2543_key_is_deterministic() {
        let inputs = Rfc2543Inputs {
            from_full: "Alice <sip:alice@example.org>",
            to_uri: "sip:bob@example.org",
            call_id: "call-1@host",
            cseq_number: 1,
            via_branch: "legacy-branch",
        };
        assert_eq!(compute_rfc2543_key(&inputs), compute_rfc2543_key(&inputs));
    }
}
