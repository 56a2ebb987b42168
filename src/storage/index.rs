//! In-memory contact index shared by the storage backends.
//!
//! The index owns the linkage invariants: every mutation is checked so that
//! secondaries always point directly at a primary and primaries are never
//! re-created from secondaries.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::contact::{Contact, ContactId, LinkPrecedence, NewContact};
use crate::storage::traits::StorageError;

/// Reverses one applied mutation.
#[derive(Debug, Clone)]
pub(crate) enum UndoEntry {
    Created {
        id: ContactId,
        prev_clock: u64,
    },
    Linkage {
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
        updated_at: DateTime<Utc>,
    },
}

#[derive(Debug, Default, Clone)]
pub(crate) struct ContactIndex {
    by_id: BTreeMap<ContactId, Contact>,
    by_email: HashMap<String, BTreeSet<ContactId>>,
    by_phone: HashMap<String, BTreeSet<ContactId>>,
    by_linked: HashMap<ContactId, BTreeSet<ContactId>>,
    /// Last issued logical clock value. Ids and creation sequence share it.
    clock: u64,
}

fn sorted_by_age(mut contacts: Vec<Contact>) -> Vec<Contact> {
    contacts.sort_by_key(Contact::ordering_key);
    contacts
}

fn index_insert(map: &mut HashMap<String, BTreeSet<ContactId>>, key: Option<&str>, id: ContactId) {
    if let Some(key) = key {
        map.entry(key.to_string()).or_default().insert(id);
    }
}

fn index_remove(map: &mut HashMap<String, BTreeSet<ContactId>>, key: Option<&str>, id: ContactId) {
    let Some(key) = key else {
        return;
    };
    if let Some(set) = map.get_mut(key) {
        set.remove(&id);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

impl ContactIndex {
    /// Rebuild an index from stored contacts (snapshot load).
    pub(crate) fn from_contacts(contacts: impl IntoIterator<Item = Contact>) -> Self {
        let mut index = Self::default();
        for contact in contacts {
            index.apply_contact(contact);
        }
        index
    }

    pub(crate) fn clock(&self) -> u64 {
        self.clock
    }

    /// Never let the clock run behind a persisted value.
    pub(crate) fn observe_clock(&mut self, clock: u64) {
        self.clock = self.clock.max(clock);
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn get(&self, id: ContactId) -> Option<&Contact> {
        self.by_id.get(&id)
    }

    /// All contacts in ascending id order.
    pub(crate) fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.by_id.values()
    }

    pub(crate) fn find_by_email_or_phone(&self, email: Option<&str>, phone_number: Option<&str>) -> Vec<Contact> {
        let mut ids = BTreeSet::new();
        if let Some(set) = email.and_then(|e| self.by_email.get(e)) {
            ids.extend(set.iter().copied());
        }
        if let Some(set) = phone_number.and_then(|p| self.by_phone.get(p)) {
            ids.extend(set.iter().copied());
        }
        sorted_by_age(ids.iter().filter_map(|id| self.by_id.get(id).cloned()).collect())
    }

    pub(crate) fn find_by_ids_or_linked_ids(&self, ids: &BTreeSet<ContactId>) -> Vec<Contact> {
        let mut found = BTreeSet::new();
        for id in ids {
            if self.by_id.contains_key(id) {
                found.insert(*id);
            }
            if let Some(children) = self.by_linked.get(id) {
                found.extend(children.iter().copied());
            }
        }
        sorted_by_age(found.iter().filter_map(|id| self.by_id.get(id).cloned()).collect())
    }

    fn require_primary(&self, target: ContactId, context: &str) -> Result<(), StorageError> {
        let contact = self
            .by_id
            .get(&target)
            .ok_or(StorageError::ContactNotFound(target))?;
        if contact.is_primary() {
            Ok(())
        } else {
            Err(StorageError::InvalidLinkage(format!(
                "{context}: contact {target} is secondary and cannot be linked to"
            )))
        }
    }

    /// Validate and insert a new contact.
    pub(crate) fn create(&mut self, new: NewContact, now: DateTime<Utc>) -> Result<(Contact, UndoEntry), StorageError> {
        match (new.link_precedence, new.linked_id) {
            (LinkPrecedence::Primary, None) => {}
            (LinkPrecedence::Primary, Some(target)) => {
                return Err(StorageError::InvalidLinkage(format!(
                    "create: primary contact cannot link to {target}"
                )));
            }
            (LinkPrecedence::Secondary, None) => {
                return Err(StorageError::InvalidLinkage(
                    "create: secondary contact requires a linked primary".to_string(),
                ));
            }
            (LinkPrecedence::Secondary, Some(target)) => self.require_primary(target, "create")?,
        }

        let prev_clock = self.clock;
        let seq = prev_clock
            .checked_add(1)
            .ok_or_else(|| StorageError::BackendError("contact clock overflow".to_string()))?;
        let id = ContactId::new(seq);
        if self.by_id.contains_key(&id) {
            return Err(StorageError::DuplicateKey(id.to_string()));
        }

        let contact = Contact {
            id,
            email: new.email.filter(|s| !s.is_empty()),
            phone_number: new.phone_number.filter(|s| !s.is_empty()),
            linked_id: new.linked_id,
            link_precedence: new.link_precedence,
            created_seq: seq,
            created_at: now,
            updated_at: now,
        };
        self.apply_contact(contact.clone());
        Ok((contact, UndoEntry::Created { id, prev_clock }))
    }

    /// Validate and apply a linkage change. Returns `None` when nothing changed.
    pub(crate) fn update_linkage(
        &mut self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
        now: DateTime<Utc>,
    ) -> Result<Option<UndoEntry>, StorageError> {
        let current = self.by_id.get(&id).ok_or(StorageError::ContactNotFound(id))?;
        if current.link_precedence == precedence && current.linked_id == linked_id {
            return Ok(None);
        }

        match (precedence, linked_id) {
            (LinkPrecedence::Primary, _) if current.is_secondary() => {
                return Err(StorageError::InvalidLinkage(format!(
                    "update_linkage: secondary contact {id} cannot be promoted"
                )));
            }
            (LinkPrecedence::Primary, _) => {
                return Err(StorageError::InvalidLinkage(format!(
                    "update_linkage: primary contact {id} cannot carry a linked id"
                )));
            }
            (LinkPrecedence::Secondary, None) => {
                return Err(StorageError::InvalidLinkage(format!(
                    "update_linkage: secondary contact {id} requires a linked primary"
                )));
            }
            (LinkPrecedence::Secondary, Some(target)) if target == id => {
                return Err(StorageError::InvalidLinkage(format!(
                    "update_linkage: contact {id} cannot link to itself"
                )));
            }
            (LinkPrecedence::Secondary, Some(target)) => self.require_primary(target, "update_linkage")?,
        }

        if self.by_linked.get(&id).is_some_and(|children| !children.is_empty()) {
            return Err(StorageError::InvalidLinkage(format!(
                "update_linkage: contact {id} still has secondaries linked to it"
            )));
        }

        let undo = UndoEntry::Linkage {
            id,
            precedence: current.link_precedence,
            linked_id: current.linked_id,
            updated_at: current.updated_at,
        };
        self.set_linkage(id, precedence, linked_id, now)?;
        Ok(Some(undo))
    }

    /// Insert or replace a contact without validation (creation and WAL replay).
    pub(crate) fn apply_contact(&mut self, contact: Contact) {
        if let Some(prev) = self.by_id.remove(&contact.id) {
            self.unindex(&prev);
        }
        self.clock = self.clock.max(contact.created_seq).max(contact.id.get());
        index_insert(&mut self.by_email, contact.email(), contact.id);
        index_insert(&mut self.by_phone, contact.phone_number(), contact.id);
        if let Some(target) = contact.linked_id {
            self.by_linked.entry(target).or_default().insert(contact.id);
        }
        self.by_id.insert(contact.id, contact);
    }

    /// Overwrite a contact's linkage without validation (WAL replay and undo).
    pub(crate) fn set_linkage(
        &mut self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let contact = self.by_id.get_mut(&id).ok_or(StorageError::ContactNotFound(id))?;
        let prev_link = contact.linked_id;
        contact.link_precedence = precedence;
        contact.linked_id = linked_id;
        contact.updated_at = updated_at;

        if let Some(prev) = prev_link {
            if let Some(children) = self.by_linked.get_mut(&prev) {
                children.remove(&id);
                if children.is_empty() {
                    self.by_linked.remove(&prev);
                }
            }
        }
        if let Some(target) = linked_id {
            self.by_linked.entry(target).or_default().insert(id);
        }
        Ok(())
    }

    pub(crate) fn undo(&mut self, entry: UndoEntry) -> Result<(), StorageError> {
        match entry {
            UndoEntry::Created { id, prev_clock } => {
                let prev = self.by_id.remove(&id).ok_or(StorageError::ContactNotFound(id))?;
                self.unindex(&prev);
                self.clock = prev_clock;
                Ok(())
            }
            UndoEntry::Linkage {
                id,
                precedence,
                linked_id,
                updated_at,
            } => self.set_linkage(id, precedence, linked_id, updated_at),
        }
    }

    fn unindex(&mut self, contact: &Contact) {
        index_remove(&mut self.by_email, contact.email(), contact.id);
        index_remove(&mut self.by_phone, contact.phone_number(), contact.id);
        if let Some(target) = contact.linked_id {
            if let Some(children) = self.by_linked.get_mut(&target) {
                children.remove(&contact.id);
                if children.is_empty() {
                    self.by_linked.remove(&target);
                }
            }
        }
    }
}
