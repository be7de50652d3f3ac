//! Listener lists for single-threaded notifications

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Handle of a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Rc<dyn Fn(&E)>;

/// Callbacks interested in events of type `E`
///
/// Listeners may add or remove listeners, or emit further events, while being
/// called. A listener removed during an emission is not called afterwards.
pub struct Listeners<E> {
    entries: RefCell<Vec<(ListenerId, Callback<E>)>>,
    next_id: Cell<u64>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }
}

impl<E> fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.borrow().len())
            .finish()
    }
}

impl<E> Listeners<E> {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback
    pub fn add(&self, callback: impl Fn(&E) + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.entries.borrow_mut().push((id, Rc::new(callback)));
        id
    }

    /// Unregister a callback, returns whether it was registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let len = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != len
    }

    /// Whether nobody listens
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Call every registered listener with `event`
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<_> = self.entries.borrow().clone();
        for (id, callback) in snapshot {
            if self.contains(id) {
                callback(event);
            }
        }
    }

    fn contains(&self, id: ListenerId) -> bool {
        self.entries.borrow().iter().any(|(entry_id, _)| *entry_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_remove() {
        let listeners = Rc::new(Listeners::<u32>::new());
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = seen.clone();
        let first = listeners.add(move |v| s.borrow_mut().push(*v));
        listeners.emit(&1);
        assert!(listeners.remove(first));
        assert!(!listeners.remove(first));
        listeners.emit(&2);
        assert_eq!(*seen.borrow(), vec![1]);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_remove_during_emit() {
        let listeners = Rc::new(Listeners::<()>::new());
        let hits = Rc::new(Cell::new(0));
        let second = Rc::new(Cell::new(None));

        let l = listeners.clone();
        let s = second.clone();
        listeners.add(move |_| {
            if let Some(id) = s.get() {
                l.remove(id);
            }
        });
        let h = hits.clone();
        second.set(Some(listeners.add(move |_| h.set(h.get() + 1))));

        listeners.emit(&());
        assert_eq!(hits.get(), 0);
    }
}
