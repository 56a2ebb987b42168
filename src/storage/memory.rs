//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of the contact
//! store. It is intended for embedded usage, tests, and as a reference
//! implementation.

use std::collections::BTreeSet;
use std::sync::{RwLock, RwLockWriteGuard};

use chrono::Utc;

use crate::contact::{Contact, ContactId, LinkPrecedence, NewContact};
use crate::storage::index::{ContactIndex, UndoEntry};
use crate::storage::traits::{ContactStore, ContactTransaction, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Thread-safe in-memory contact store.
#[derive(Debug, Default)]
pub struct InMemoryContactStore {
    state: RwLock<ContactIndex>,
}

impl InMemoryContactStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored contact, ascending by id.
    pub fn all(&self) -> Result<Vec<Contact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.all"))?;
        Ok(state.contacts().cloned().collect())
    }
}

impl ContactStore for InMemoryContactStore {
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError> {
        let guard = self.state.write().map_err(|_| lock_err("contact.begin"))?;
        Ok(Box::new(MemoryTransaction {
            state: guard,
            undo: Vec::new(),
        }))
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.get"))?;
        Ok(state.get(id).cloned())
    }

    fn len(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("contact.len"))?;
        Ok(state.len())
    }
}

/// Exclusive transaction over the in-memory index.
///
/// Mutations are applied in place; the undo log reverts them on drop unless
/// the transaction was committed.
struct MemoryTransaction<'a> {
    state: RwLockWriteGuard<'a, ContactIndex>,
    undo: Vec<UndoEntry>,
}

impl ContactTransaction for MemoryTransaction<'_> {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError> {
        Ok(self.state.find_by_email_or_phone(email, phone_number))
    }

    fn find_by_ids_or_linked_ids(&self, ids: &BTreeSet<ContactId>) -> Result<Vec<Contact>, StorageError> {
        Ok(self.state.find_by_ids_or_linked_ids(ids))
    }

    fn create(&mut self, contact: NewContact) -> Result<Contact, StorageError> {
        let (created, undo) = self.state.create(contact, Utc::now())?;
        self.undo.push(undo);
        Ok(created)
    }

    fn update_linkage(
        &mut self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<(), StorageError> {
        if let Some(undo) = self.state.update_linkage(id, precedence, linked_id, Utc::now())? {
            self.undo.push(undo);
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.undo.clear();
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        while let Some(entry) = self.undo.pop() {
            if let Err(e) = self.state.undo(entry) {
                tracing::error!(error = %e, "failed to roll back in-memory contact mutation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autocommit_create_and_lookup() {
        let store = InMemoryContactStore::new();
        assert!(store.is_empty().unwrap());

        let p = store
            .create(NewContact::primary(Some("a@x.com".into()), Some("111".into())))
            .unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get(p.id).unwrap().unwrap(), p);

        let by_phone = store.find_by_email_or_phone(None, Some("111")).unwrap();
        assert_eq!(by_phone.len(), 1);
        assert_eq!(by_phone[0].id, p.id);
    }

    #[test]
    fn results_are_ordered_by_creation() {
        let store = InMemoryContactStore::new();
        let p = store.create(NewContact::primary(Some("a@x.com".into()), None)).unwrap();
        let s1 = store
            .create(NewContact::secondary(Some("b@x.com".into()), Some("1".into()), p.id))
            .unwrap();
        let s2 = store
            .create(NewContact::secondary(Some("a@x.com".into()), Some("2".into()), p.id))
            .unwrap();

        let group = store.find_by_ids_or_linked_ids(&BTreeSet::from([p.id])).unwrap();
        assert_eq!(group.iter().map(|c| c.id).collect::<Vec<_>>(), vec![p.id, s1.id, s2.id]);

        let by_email = store.find_by_email_or_phone(Some("a@x.com"), None).unwrap();
        assert_eq!(by_email.iter().map(|c| c.id).collect::<Vec<_>>(), vec![p.id, s2.id]);
    }

    #[test]
    fn uncommitted_transaction_rolls_back() {
        let store = InMemoryContactStore::new();
        let p1 = store.create(NewContact::primary(Some("a@x.com".into()), None)).unwrap();
        let p2 = store.create(NewContact::primary(None, Some("222".into()))).unwrap();

        {
            let mut txn = store.begin().unwrap();
            txn.update_linkage(p2.id, LinkPrecedence::Secondary, Some(p1.id)).unwrap();
            txn.create(NewContact::secondary(Some("c@x.com".into()), None, p1.id))
                .unwrap();
            assert_eq!(
                txn.find_by_ids_or_linked_ids(&BTreeSet::from([p1.id])).unwrap().len(),
                3
            );
        }

        assert_eq!(store.len().unwrap(), 2);
        assert!(store.get(p2.id).unwrap().unwrap().is_primary());

        // The id counter is rolled back as well.
        let next = store.create(NewContact::primary(Some("d@x.com".into()), None)).unwrap();
        assert_eq!(next.id, ContactId::new(3));
    }

    #[test]
    fn committed_transaction_persists() {
        let store = InMemoryContactStore::new();
        let p1 = store.create(NewContact::primary(Some("a@x.com".into()), None)).unwrap();
        let p2 = store.create(NewContact::primary(None, Some("222".into()))).unwrap();

        let mut txn = store.begin().unwrap();
        txn.update_linkage(p2.id, LinkPrecedence::Secondary, Some(p1.id)).unwrap();
        txn.commit().unwrap();

        let demoted = store.get(p2.id).unwrap().unwrap();
        assert!(demoted.is_secondary());
        assert_eq!(demoted.linked_id, Some(p1.id));
        assert!(demoted.updated_at >= demoted.created_at);
    }

    #[test]
    fn failed_mutation_inside_transaction_keeps_earlier_ones_until_drop() {
        let store = InMemoryContactStore::new();
        let p = store.create(NewContact::primary(Some("a@x.com".into()), None)).unwrap();

        {
            let mut txn = store.begin().unwrap();
            txn.create(NewContact::secondary(None, Some("1".into()), p.id)).unwrap();
            let err = txn
                .update_linkage(ContactId::new(42), LinkPrecedence::Secondary, Some(p.id))
                .unwrap_err();
            assert!(matches!(err, StorageError::ContactNotFound(_)));
        }

        assert_eq!(store.all().unwrap().len(), 1);
    }
}
