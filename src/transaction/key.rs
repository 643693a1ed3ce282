//! [`TransactionKey`]: the (branch, method, server-flag) triple transactions
//! are registered and matched under (§4.6 dispatch rule 1).

use std::fmt;

use rvoip_sip_core::Method;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    branch: String,
    method: Method,
    is_server: bool,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: Method, is_server: bool) -> Self {
        TransactionKey {
            branch: branch.into(),
            method,
            is_server,
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// An INVITE server transaction also matches an ACK carrying the same
    /// branch (§4.6 "ACK matches an INVITE server txn").
    pub fn matches_ack_for_invite(&self, branch: &str) -> bool {
        self.is_server && matches!(self.method, Method::Invite) && self.branch == branch
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.branch,
            self.method,
            if self.is_server { "srv" } else { "cli" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_matches_invite_server_transaction_by_branch() {
        let key = TransactionKey::new("z9hG4bK.abc", Method::Invite, true);
        assert!(key.matches_ack_for_invite("z9hG4bK.abc"));
        assert!(!key.matches_ack_for_invite("z9hG4bK.other"));
    }

    #[test]
    fn non_invite_server_key_never_matches_ack() {
        let key = TransactionKey::new("z9hG4bK.abc", Method::Register, true);
        assert!(!key.matches_ack_for_invite("z9hG4bK.abc"));
    }
}
