//! Owner to moderator registry.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use parking_lot::RwLock;

use crate::owner::OwnerId;
use crate::transaction::moderator::SharedModerator;

struct RegistryEntry {
    tx_id: String,
    moderator: SharedModerator,
}

/// Live moderators, at most one per owner.
///
/// Never lock a moderator while holding the registry lock: moderators call
/// back into [`Registry::remove`] with their own lock held.
#[derive(Default)]
pub(crate) struct Registry {
    entries: RwLock<HashMap<OwnerId, RegistryEntry>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The live moderator of `owner`.
    pub(crate) fn get(&self, owner: OwnerId) -> Option<SharedModerator> {
        self.entries
            .read()
            .get(&owner)
            .map(|entry| entry.moderator.clone())
    }

    /// Register `moderator` for `owner`.
    ///
    /// If another moderator got registered for the same owner in the
    /// meantime, that one wins and is returned instead.
    pub(crate) fn insert(
        &self,
        owner: OwnerId,
        tx_id: String,
        moderator: SharedModerator,
    ) -> SharedModerator {
        match self.entries.write().entry(owner) {
            Entry::Occupied(existing) => existing.get().moderator.clone(),
            Entry::Vacant(slot) => {
                slot.insert(RegistryEntry {
                    tx_id,
                    moderator: moderator.clone(),
                });
                moderator
            }
        }
    }

    /// Remove the entry of `owner` if it still belongs to transaction `tx_id`.
    pub(crate) fn remove(&self, owner: OwnerId, tx_id: &str) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&owner) {
            Some(entry) if entry.tx_id == tx_id => {
                entries.remove(&owner);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn contains(&self, owner: OwnerId) -> bool {
        self.entries.read().contains_key(&owner)
    }

    /// Snapshot of all live moderators.
    pub(crate) fn moderators(&self) -> Vec<SharedModerator> {
        self.entries
            .read()
            .values()
            .map(|entry| entry.moderator.clone())
            .collect()
    }
}
