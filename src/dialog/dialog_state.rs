//! Dialog state set (§4.5, spec state names NULL/EARLY/CONFIRMED/TERMINATED).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DialogState {
    Null,
    Early,
    Confirmed,
    Terminated,
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DialogState::Null => "NULL",
            DialogState::Early => "EARLY",
            DialogState::Confirmed => "CONFIRMED",
            DialogState::Terminated => "TERMINATED",
        };
        write!(f, "{s}")
    }
}
