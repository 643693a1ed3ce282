//! Deferred cleanup for objects that outlive their last strong owner for one
//! more event-loop tick (§9 translation notes).
//!
//! belle-sip's object pool destroys objects through a weak-ref +
//! destroy-notify callback so that a channel or transaction can unref itself
//! from inside its own event handler without the free happening mid-call.
//! Rust's ownership rules make the use-after-free half of that problem moot,
//! but the *scheduling* half survives: a [`Channel`](crate::transport::Channel)
//! or [`Transaction`](crate::transaction::Transaction) that drops its last
//! `Arc` from within its own task must not run its teardown synchronously on
//! that same stack frame, or a caller iterating a `DashMap` of such objects
//! can observe a half-torn-down entry. [`defer_drop`] pushes the final drop
//! onto a fresh task instead.

use std::sync::Arc;

use tokio::task::JoinHandle;

/// Drops `value` on a freshly spawned task rather than on the caller's stack.
///
/// Use this when releasing the last strong reference to something that runs
/// its own `Drop` logic (aborts a background task, closes a socket) from
/// inside a context where that logic must not run synchronously — e.g. while
/// holding a `DashMap` shard lock.
pub fn defer_drop<T: Send + 'static>(value: T) -> JoinHandle<()> {
    tokio::spawn(async move {
        drop(value);
    })
}

/// A strong handle paired with the [`std::sync::Weak`] given out to
/// observers that must not keep the object alive (belle-sip's
/// `belle_sip_object_weak_ref`). Mirrors the `Arc`/`Weak` pair the teacher
/// crate threads through its transaction `data` structs, bundled here so
/// callers that need both don't have to re-derive the weak side by hand.
#[derive(Debug)]
pub struct Owned<T> {
    strong: Arc<T>,
}

impl<T> Owned<T> {
    pub fn new(value: T) -> Self {
        Owned {
            strong: Arc::new(value),
        }
    }

    pub fn handle(&self) -> Arc<T> {
        self.strong.clone()
    }

    pub fn weak(&self) -> std::sync::Weak<T> {
        Arc::downgrade(&self.strong)
    }
}

impl<T> std::ops::Deref for Owned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.strong
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MarksOnDrop(Arc<AtomicBool>);

    impl Drop for MarksOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn defer_drop_runs_drop_on_separate_task() {
        let flag = Arc::new(AtomicBool::new(false));
        let handle = defer_drop(MarksOnDrop(flag.clone()));
        assert!(!flag.load(Ordering::SeqCst));
        handle.await.unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn weak_handle_does_not_keep_alive() {
        let owned = Owned::new(42u32);
        let weak = owned.weak();
        assert!(weak.upgrade().is_some());
        drop(owned);
        assert!(weak.upgrade().is_none());
    }
}
