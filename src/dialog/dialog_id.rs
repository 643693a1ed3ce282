//! [`DialogId`]: an internal handle for a dialog, distinct from the
//! protocol-level `(Call-ID, local-tag, remote-tag)` matching triple.

use std::fmt;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DialogId(Uuid);

impl DialogId {
    pub fn new() -> Self {
        DialogId(Uuid::new_v4())
    }
}

impl Default for DialogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
