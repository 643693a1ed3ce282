//! Dialog state, route sets, CSeq bookkeeping, 2xx retransmission (§4.5,
//! §3 "Dialog").
//!
//! Grounded in the teacher's `dialog-core`: dialogs are plain, `Clone`/
//! `Serialize` data (see [`dialog_impl::Dialog`]) held behind an
//! `Arc<Mutex<_>>` in a registry, matched first by the full
//! `(Call-ID, local-tag, remote-tag)` triple and, for dialogs still in
//! NULL/EARLY state, by a looser Call-ID-only lookup (needed to match a
//! NOTIFY against an in-flight SUBSCRIBE before the dialog has a remote
//! tag at all).

pub mod dialog_id;
pub mod dialog_impl;
pub mod dialog_state;
pub mod refresh_200ok;

use std::sync::Arc;

use dashmap::DashMap;
use rvoip_sip_core::Request;
use tokio::sync::Mutex;

pub use dialog_id::DialogId;
pub use dialog_impl::{Dialog, DialogType};
pub use dialog_state::DialogState;

/// Notifications the dialog layer surfaces to the application (§4.6 dispatch
/// rule 4: "an in-dialog request with no current server txn is surfaced as
/// a request-event").
#[derive(Debug, Clone)]
pub enum DialogEvent {
    Created { id: DialogId },
    StateChanged { id: DialogId, state: DialogState },
    /// An in-dialog request arrived with no matching server transaction.
    Request { id: DialogId, request: Request },
    Terminated { id: DialogId },
}

type MatchTriple = (String, String, String);

/// The dialog registry: matched dialogs keyed by their full triple, plus a
/// Call-ID index covering dialogs that have no remote tag yet.
#[derive(Default)]
pub struct DialogRegistry {
    by_triple: DashMap<MatchTriple, Arc<Mutex<Dialog>>>,
    by_call_id: DashMap<String, Vec<Arc<Mutex<Dialog>>>>,
}

impl DialogRegistry {
    pub fn new() -> Self {
        DialogRegistry {
            by_triple: DashMap::new(),
            by_call_id: DashMap::new(),
        }
    }

    /// Inserts a newly created dialog, indexing it by Call-ID immediately
    /// and by the full triple once it has both tags.
    pub async fn insert(&self, dialog: Dialog) -> Arc<Mutex<Dialog>> {
        let call_id = dialog.call_id.clone();
        let triple = dialog.match_triple();
        let handle = Arc::new(Mutex::new(dialog));

        self.by_call_id.entry(call_id).or_default().push(handle.clone());
        if let Some(triple) = triple {
            self.by_triple.insert(triple, handle.clone());
        }

        handle
    }

    /// Re-indexes a dialog by its full triple once it transitions into a
    /// state that has both tags (EARLY with a remote tag, or CONFIRMED).
    pub async fn reindex(&self, handle: &Arc<Mutex<Dialog>>) {
        let triple = handle.lock().await.match_triple();
        if let Some(triple) = triple {
            self.by_triple.insert(triple, handle.clone());
        }
    }

    /// §4.5 `_match(call_id, local_tag, remote_tag)`: exact triple match.
    pub fn find_by_triple(&self, call_id: &str, local_tag: &str, remote_tag: &str) -> Option<Arc<Mutex<Dialog>>> {
        self.by_triple
            .get(&(call_id.to_string(), local_tag.to_string(), remote_tag.to_string()))
            .map(|entry| entry.clone())
    }

    /// Looser lookup used to match a NOTIFY to an in-flight SUBSCRIBE: any
    /// dialog on this Call-ID, regardless of tag state.
    pub fn find_by_call_id(&self, call_id: &str) -> Vec<Arc<Mutex<Dialog>>> {
        self.by_call_id
            .get(call_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub async fn remove(&self, handle: &Arc<Mutex<Dialog>>) {
        let guard = handle.lock().await;
        let call_id = guard.call_id.clone();
        let triple = guard.match_triple();
        drop(guard);

        if let Some(triple) = triple {
            self.by_triple.remove(&triple);
        }
        if let Some(mut entries) = self.by_call_id.get_mut(&call_id) {
            entries.retain(|h| !Arc::ptr_eq(h, handle));
        }
    }

    pub fn len(&self) -> usize {
        self.by_triple.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvoip_sip_core::Uri;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn insert_and_find_by_triple() {
        let registry = DialogRegistry::new();
        let dialog = Dialog::new(
            DialogType::Invite,
            "call-1".into(),
            uri("sip:alice@example.com"),
            uri("sip:bob@example.com"),
            Some("tag-a".into()),
            Some("tag-b".into()),
            false,
        );
        registry.insert(dialog).await;
        assert!(registry.find_by_triple("call-1", "tag-a", "tag-b").is_some());
        assert_eq!(registry.find_by_call_id("call-1").len(), 1);
    }

    #[tokio::test]
    async fn null_state_dialog_found_only_by_call_id() {
        let registry = DialogRegistry::new();
        let dialog = Dialog::new(
            DialogType::SubscribeNotify,
            "call-2".into(),
            uri("sip:alice@example.com"),
            uri("sip:bob@example.com"),
            Some("tag-a".into()),
            None,
            false,
        );
        registry.insert(dialog).await;
        assert!(registry.find_by_triple("call-2", "tag-a", "tag-b").is_none());
        assert_eq!(registry.find_by_call_id("call-2").len(), 1);
    }

    #[tokio::test]
    async fn remove_clears_both_indices() {
        let registry = DialogRegistry::new();
        let dialog = Dialog::new(
            DialogType::Invite,
            "call-3".into(),
            uri("sip:alice@example.com"),
            uri("sip:bob@example.com"),
            Some("tag-a".into()),
            Some("tag-b".into()),
            false,
        );
        let handle = registry.insert(dialog).await;
        registry.remove(&handle).await;
        assert!(registry.find_by_triple("call-3", "tag-a", "tag-b").is_none());
        assert_eq!(registry.find_by_call_id("call-3").len(), 0);
    }
}
