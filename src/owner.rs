//! Owner identity for transaction scopes.
//!
//! A transaction tree belongs to exactly one owner context. By default the
//! owner is the calling thread: each thread is lazily assigned an id from a
//! process-wide counter the first time it asks for one. Code that runs a
//! logical context which is not a thread can pin an explicit identity with
//! [`OwnerId::enter`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_OWNER: Cell<Option<OwnerId>> = const { Cell::new(None) };
    /// Live scopes on this thread as `(scope id, owner)`, innermost last.
    static SCOPED_OWNERS: RefCell<Vec<(u64, OwnerId)>> = const { RefCell::new(Vec::new()) };
    static NEXT_SCOPE_ID: Cell<u64> = const { Cell::new(0) };
}

/// Opaque identity of the context driving a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Identity of the calling context.
    ///
    /// Returns the identity pinned by the innermost live [`OwnerScope`] on
    /// this thread, or the thread's own identity otherwise.
    pub fn current() -> Self {
        let scoped = SCOPED_OWNERS.with(|scopes| scopes.borrow().last().map(|(_, owner)| *owner));
        if let Some(owner) = scoped {
            return owner;
        }
        THREAD_OWNER.with(|slot| match slot.get() {
            Some(owner) => owner,
            None => {
                let owner = Self::new_unique();
                slot.set(Some(owner));
                owner
            }
        })
    }

    /// Allocate a fresh identity that no thread or other token shares.
    pub fn new_unique() -> Self {
        Self(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Build an identity from a raw value.
    ///
    /// Raw values share a namespace with thread identities; prefer
    /// [`OwnerId::new_unique`] unless the value comes from another
    /// `OwnerId`.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw value of this identity.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Make `self` the current identity on this thread until the returned
    /// guard is dropped.
    ///
    /// Scopes nest: the most recently entered live scope wins. Dropping a
    /// guard removes only its own scope, in whatever order guards are
    /// dropped.
    pub fn enter(self) -> OwnerScope {
        let id = NEXT_SCOPE_ID.with(|next| {
            let id = next.get();
            next.set(id + 1);
            id
        });
        SCOPED_OWNERS.with(|scopes| scopes.borrow_mut().push((id, self)));
        OwnerScope {
            id,
            owner: self,
            _not_send: PhantomData,
        }
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// Guard returned by [`OwnerId::enter`].
///
/// Bound to the thread that created it.
#[must_use = "the owner identity is only pinned while the scope is alive"]
pub struct OwnerScope {
    id: u64,
    owner: OwnerId,
    _not_send: PhantomData<*const ()>,
}

impl Drop for OwnerScope {
    fn drop(&mut self) {
        SCOPED_OWNERS.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            if let Some(pos) = scopes.iter().rposition(|(id, _)| *id == self.id) {
                scopes.remove(pos);
            }
        });
    }
}

impl fmt::Debug for OwnerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerScope")
            .field("owner", &self.owner)
            .field("current", &OwnerId::current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_is_stable_per_thread() {
        assert_eq!(OwnerId::current(), OwnerId::current());
    }

    #[test]
    fn test_threads_get_distinct_identities() {
        let here = OwnerId::current();
        let there = std::thread::spawn(OwnerId::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_scopes_nest_and_restore() {
        let thread_owner = OwnerId::current();
        let outer = OwnerId::new_unique();
        let inner = OwnerId::new_unique();

        {
            let _outer = outer.enter();
            assert_eq!(OwnerId::current(), outer);
            {
                let _inner = inner.enter();
                assert_eq!(OwnerId::current(), inner);
            }
            assert_eq!(OwnerId::current(), outer);
        }

        assert_eq!(OwnerId::current(), thread_owner);
    }

    #[test]
    fn test_scopes_dropped_out_of_order() {
        let thread_owner = OwnerId::current();
        let first = OwnerId::new_unique();
        let second = OwnerId::new_unique();

        let first_scope = first.enter();
        let second_scope = second.enter();
        drop(first_scope);
        assert_eq!(OwnerId::current(), second);

        drop(second_scope);
        assert_eq!(OwnerId::current(), thread_owner);
    }

    #[test]
    fn test_same_owner_entered_twice() {
        let thread_owner = OwnerId::current();
        let task = OwnerId::new_unique();

        let outer = task.enter();
        let inner = task.enter();
        drop(outer);
        assert_eq!(OwnerId::current(), task);
        drop(inner);
        assert_eq!(OwnerId::current(), thread_owner);
    }

    #[test]
    fn test_display() {
        assert_eq!(OwnerId::from_raw(42).to_string(), "owner-42");
    }
}
