//! Abstract storage traits for contact records.
//!
//! These traits define the contract that storage backends must implement.
//! Every multi-step read/write sequence runs inside a `ContactTransaction`,
//! which gives the resolver serializable isolation against other resolutions.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::contact::{Contact, ContactId, LinkPrecedence, NewContact};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Contact not found.
    #[error("Contact not found: {0}")]
    ContactNotFound(ContactId),

    /// A mutation would break the primary/secondary linkage invariants.
    #[error("Invalid linkage: {0}")]
    InvalidLinkage(String),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// A serializable unit of work against a contact store.
///
/// Mutations are visible to later reads in the same transaction. Dropping a
/// transaction without calling [`ContactTransaction::commit`] rolls back
/// every mutation it made.
pub trait ContactTransaction {
    /// Contacts whose email equals `email` OR whose phone number equals
    /// `phone_number`, ascending by creation order. A `None` side is skipped.
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError>;

    /// Contacts whose id OR linked id is in `ids`, ascending by creation order.
    fn find_by_ids_or_linked_ids(&self, ids: &BTreeSet<ContactId>) -> Result<Vec<Contact>, StorageError>;

    /// Create a contact. The store assigns `id`, `created_seq` and timestamps.
    ///
    /// # Errors
    /// - `InvalidLinkage`: a secondary without a primary target, or a primary with one
    /// - `ContactNotFound`: the linked primary does not exist
    fn create(&mut self, contact: NewContact) -> Result<Contact, StorageError>;

    /// Set a contact's precedence and linked id.
    ///
    /// # Errors
    /// - `ContactNotFound`: `id` or `linked_id` does not exist
    /// - `InvalidLinkage`: the change would promote a secondary, link to a
    ///   non-primary, or leave secondaries pointing at a demoted contact
    fn update_linkage(
        &mut self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<(), StorageError>;

    /// Make all mutations durable and visible to other transactions.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Storage trait for contact records.
///
/// # Safety Considerations
/// - Transactions must be serializable with respect to each other
/// - Implementations should handle concurrent access safely
pub trait ContactStore: Send + Sync {
    /// Begin a transaction. Blocks until no other transaction is active.
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError>;

    /// Get a contact by id.
    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError>;

    /// Number of stored contacts.
    fn len(&self) -> Result<usize, StorageError>;

    /// Returns true if the store holds no contacts.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Single-call form of [`ContactTransaction::find_by_email_or_phone`].
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError> {
        self.begin()?.find_by_email_or_phone(email, phone_number)
    }

    /// Single-call form of [`ContactTransaction::find_by_ids_or_linked_ids`].
    fn find_by_ids_or_linked_ids(&self, ids: &BTreeSet<ContactId>) -> Result<Vec<Contact>, StorageError> {
        self.begin()?.find_by_ids_or_linked_ids(ids)
    }

    /// Create a contact in its own transaction.
    fn create(&self, contact: NewContact) -> Result<Contact, StorageError> {
        let mut txn = self.begin()?;
        let created = txn.create(contact)?;
        txn.commit()?;
        Ok(created)
    }

    /// Update a contact's linkage in its own transaction.
    fn update_linkage(
        &self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<(), StorageError> {
        let mut txn = self.begin()?;
        txn.update_linkage(id, precedence, linked_id)?;
        txn.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_contact_store_object_safe(_: &dyn ContactStore) {}
    fn _assert_contact_transaction_object_safe(_: &dyn ContactTransaction) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::ContactNotFound(ContactId::new(11));
        assert!(err.to_string().contains("Contact not found: 11"));

        let err = StorageError::InvalidLinkage("chain".to_string());
        assert!(err.to_string().contains("chain"));

        let err = StorageError::BackendError("disk full".to_string());
        assert!(err.to_string().contains("disk full"));
    }
}
