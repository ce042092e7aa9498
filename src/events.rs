//! Ordered subscriber lists with removable handles.

use std::sync::Arc;

/// Handle returned when registering a callback, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Callbacks in registration order.
///
/// Owners keep this behind a lock and call [`Subscribers::snapshot`] before
/// invoking anything, so a callback may register or remove subscriptions
/// on the same list without deadlocking.
pub(crate) struct Subscribers<F: ?Sized> {
    next_id: u64,
    entries: Vec<(SubscriptionId, Arc<F>)>,
}

impl<F: ?Sized> Default for Subscribers<F> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<F: ?Sized> Subscribers<F> {
    pub(crate) fn subscribe(&mut self, callback: Arc<F>) -> SubscriptionId {
        let id = self.next_handle();
        self.entries.push((id, callback));
        id
    }

    /// Allocate a handle that refers to no stored callback.
    pub(crate) fn next_handle(&mut self) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }

    /// Remove every callback, returning them in registration order.
    pub(crate) fn drain(&mut self) -> Vec<Arc<F>> {
        self.entries.drain(..).map(|(_, cb)| cb).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
