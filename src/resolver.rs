//! The identity resolver.
//!
//! Resolution runs in a single store transaction:
//!
//! 1. Look up contacts sharing the submitted email or phone number.
//! 2. Expand the matches to every contact in their groups.
//! 3. Pick the oldest primary as canonical.
//! 4. Demote every other primary (re-linking its secondaries first).
//! 5. Fetch the consolidated group.
//! 6. Append a secondary if the request carries a field the group lacks.
//! 7. Re-read the group and build the consolidated view.
//!
//! Any error drops the transaction, which rolls back all of its mutations.

use std::collections::BTreeSet;
use std::iter;
use std::sync::Arc;

use crate::contact::{Contact, ContactId, LinkPrecedence, NewContact};
use crate::error::IdentityResult;
use crate::identity::ConsolidatedIdentity;
use crate::request::{ContactQuery, IdentifyRequest, InputPolicy};
use crate::storage::{ContactStore, ContactTransaction};

/// Outcome of a resolution, with what it changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The consolidated identity after the resolution.
    pub identity: ConsolidatedIdentity,
    /// Contact created by this resolution, if any.
    pub created: Option<ContactId>,
    /// Primaries demoted into the canonical group, oldest first.
    pub demoted: Vec<ContactId>,
}

/// Resolves identify requests against a contact store.
///
/// Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn ContactStore>,
    policy: InputPolicy,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl IdentityResolver {
    /// Create a resolver with the default input policy.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self::with_policy(store, InputPolicy::default())
    }

    /// Create a resolver with a custom input policy.
    #[must_use]
    pub fn with_policy(store: Arc<dyn ContactStore>, policy: InputPolicy) -> Self {
        Self { store, policy }
    }

    /// The input policy requests are normalized under.
    #[must_use]
    pub fn policy(&self) -> &InputPolicy {
        &self.policy
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    /// Resolve a request to its consolidated identity.
    ///
    /// # Errors
    /// - `Validation` if the request carries neither an email nor a phone number
    /// - `Storage` if the store fails; nothing is changed in that case
    pub fn resolve(&self, request: &IdentifyRequest) -> IdentityResult<ConsolidatedIdentity> {
        self.resolve_detailed(request).map(|r| r.identity)
    }

    /// Like [`IdentityResolver::resolve`], also reporting what changed.
    ///
    /// # Errors
    /// Same as [`IdentityResolver::resolve`].
    pub fn resolve_detailed(&self, request: &IdentifyRequest) -> IdentityResult<Resolution> {
        let query = self.policy.normalize(request)?;
        self.resolve_query(&query)
    }

    /// Resolve an already-normalized query.
    ///
    /// # Errors
    /// - `Storage` if the store fails; nothing is changed in that case
    pub fn resolve_query(&self, query: &ContactQuery) -> IdentityResult<Resolution> {
        let fingerprint = query.fingerprint();
        let _span = tracing::debug_span!("resolve", query = %fingerprint).entered();

        let mut txn = self.store.begin()?;
        let resolution = run(txn.as_mut(), query)?;
        txn.commit()?;

        tracing::debug!(
            primary = %resolution.identity.primary_contact_id,
            created = ?resolution.created.map(ContactId::get),
            demoted = resolution.demoted.len(),
            group_size = resolution.identity.contact_count(),
            "resolved identity"
        );
        Ok(resolution)
    }
}

fn run(txn: &mut dyn ContactTransaction, query: &ContactQuery) -> IdentityResult<Resolution> {
    let email = query.email();
    let phone_number = query.phone_number();

    let matches = txn.find_by_email_or_phone(email, phone_number)?;
    if matches.is_empty() {
        let created = txn.create(NewContact::primary(
            email.map(str::to_string),
            phone_number.map(str::to_string),
        ))?;
        return Ok(Resolution {
            identity: ConsolidatedIdentity::assemble(created.id, std::slice::from_ref(&created)),
            created: Some(created.id),
            demoted: Vec::new(),
        });
    }

    // Seeding with the matches' primaries pulls in whole groups even when
    // only a secondary matched.
    let seeds: BTreeSet<ContactId> = matches
        .iter()
        .flat_map(|c| iter::once(c.id).chain(c.linked_id))
        .collect();
    let related = txn.find_by_ids_or_linked_ids(&seeds)?;
    let canonical = canonical_primary(&related);

    let demoted = merge_down(txn, &related, canonical)?;
    if !demoted.is_empty() {
        tracing::info!(
            primary = %canonical,
            demoted = ?demoted.iter().map(|id| id.get()).collect::<Vec<_>>(),
            "merged identity groups"
        );
    }

    let group_ids = BTreeSet::from([canonical]);
    let group = txn.find_by_ids_or_linked_ids(&group_ids)?;

    let email_is_new = email.is_some_and(|e| !group.iter().any(|c| c.email() == Some(e)));
    let phone_is_new = phone_number.is_some_and(|p| !group.iter().any(|c| c.phone_number() == Some(p)));

    let created = if email_is_new || phone_is_new {
        let contact = txn.create(NewContact::secondary(
            email.map(str::to_string),
            phone_number.map(str::to_string),
            canonical,
        ))?;
        Some(contact.id)
    } else {
        None
    };

    let group = if created.is_some() {
        txn.find_by_ids_or_linked_ids(&group_ids)?
    } else {
        group
    };

    Ok(Resolution {
        identity: ConsolidatedIdentity::assemble(canonical, &group),
        created,
        demoted,
    })
}

/// The oldest primary in `contacts`, or the oldest contact if none is primary.
fn canonical_primary(contacts: &[Contact]) -> ContactId {
    if let Some(primary) = contacts
        .iter()
        .filter(|c| c.is_primary())
        .min_by_key(|c| c.ordering_key())
    {
        return primary.id;
    }

    // Unreachable while the store enforces linkage; kept so a damaged store
    // still yields a deterministic answer.
    let oldest = contacts.iter().min_by_key(|c| c.ordering_key());
    tracing::warn!(
        contact = ?oldest.map(|c| c.id.get()),
        "no primary among related contacts; falling back to the oldest contact"
    );
    oldest.map_or(ContactId::new(0), |c| c.id)
}

/// Demote every primary except `canonical`, moving its secondaries first.
fn merge_down(
    txn: &mut dyn ContactTransaction,
    related: &[Contact],
    canonical: ContactId,
) -> IdentityResult<Vec<ContactId>> {
    let mut demoted = Vec::new();
    for primary in related.iter().filter(|c| c.is_primary() && c.id != canonical) {
        for child in related.iter().filter(|c| c.linked_id == Some(primary.id)) {
            txn.update_linkage(child.id, LinkPrecedence::Secondary, Some(canonical))?;
        }
        txn.update_linkage(primary.id, LinkPrecedence::Secondary, Some(canonical))?;
        demoted.push(primary.id);
    }
    Ok(demoted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{IdentityError, ValidationError};
    use crate::storage::{InMemoryContactStore, StorageError};

    fn setup() -> (Arc<InMemoryContactStore>, IdentityResolver) {
        let store = Arc::new(InMemoryContactStore::new());
        let resolver = IdentityResolver::new(store.clone());
        (store, resolver)
    }

    fn req(email: Option<&str>, phone: Option<&str>) -> IdentifyRequest {
        IdentifyRequest::new(email.map(Into::into), phone.map(Into::into))
    }

    fn ids(raw: &[u64]) -> Vec<ContactId> {
        raw.iter().copied().map(ContactId::new).collect()
    }

    fn assert_one_hop(store: &InMemoryContactStore) {
        let all = store.all().unwrap();
        for c in &all {
            match c.linked_id {
                Some(target) => {
                    assert!(c.is_secondary(), "{} links but is primary", c.id);
                    let parent = all.iter().find(|p| p.id == target).unwrap();
                    assert!(parent.is_primary(), "{} links to non-primary {}", c.id, target);
                }
                None => assert!(c.is_primary(), "{} is secondary without a link", c.id),
            }
        }
    }

    #[test]
    fn no_match_creates_primary() {
        let (store, resolver) = setup();
        let res = resolver
            .resolve_detailed(&req(Some("lorraine@hillvalley.edu"), Some("123456")))
            .unwrap();

        assert_eq!(res.created, Some(ContactId::new(1)));
        assert_eq!(res.identity.primary_contact_id, ContactId::new(1));
        assert_eq!(res.identity.emails, vec!["lorraine@hillvalley.edu"]);
        assert_eq!(res.identity.phone_numbers, vec!["123456"]);
        assert!(res.identity.secondary_contact_ids.is_empty());
        assert!(store.get(ContactId::new(1)).unwrap().unwrap().is_primary());
    }

    #[test]
    fn repeat_and_subset_requests_are_idempotent() {
        let (store, resolver) = setup();
        let first = resolver.resolve(&req(Some("a@x.com"), Some("1"))).unwrap();

        for request in [req(Some("a@x.com"), Some("1")), req(Some("a@x.com"), None), req(None, Some("1"))] {
            let res = resolver.resolve_detailed(&request).unwrap();
            assert_eq!(res.identity, first);
            assert!(res.created.is_none());
        }
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn novel_field_appends_secondary() {
        let (store, resolver) = setup();
        resolver
            .resolve(&req(Some("lorraine@hillvalley.edu"), Some("123456")))
            .unwrap();
        let res = resolver
            .resolve_detailed(&req(Some("mcfly@hillvalley.edu"), Some("123456")))
            .unwrap();

        assert_eq!(res.created, Some(ContactId::new(2)));
        assert_eq!(res.identity.primary_contact_id, ContactId::new(1));
        assert_eq!(
            res.identity.emails,
            vec!["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"]
        );
        assert_eq!(res.identity.phone_numbers, vec!["123456"]);
        assert_eq!(res.identity.secondary_contact_ids, ids(&[2]));

        let secondary = store.get(ContactId::new(2)).unwrap().unwrap();
        assert_eq!(secondary.linked_id, Some(ContactId::new(1)));
        assert_eq!(secondary.link_precedence, LinkPrecedence::Secondary);
    }

    #[test]
    fn two_primaries_merge_into_the_oldest() {
        let (store, resolver) = setup();
        resolver
            .resolve(&req(Some("george@hillvalley.edu"), Some("919191")))
            .unwrap();
        resolver
            .resolve(&req(Some("biffsucks@hillvalley.edu"), Some("717171")))
            .unwrap();

        let res = resolver
            .resolve_detailed(&req(Some("george@hillvalley.edu"), Some("717171")))
            .unwrap();
        assert_eq!(res.demoted, ids(&[2]));
        assert!(res.created.is_none());
        assert_eq!(res.identity.primary_contact_id, ContactId::new(1));
        assert_eq!(
            res.identity.emails,
            vec!["george@hillvalley.edu", "biffsucks@hillvalley.edu"]
        );
        assert_eq!(res.identity.phone_numbers, vec!["919191", "717171"]);
        assert_eq!(res.identity.secondary_contact_ids, ids(&[2]));
        assert_one_hop(&store);

        // A second pass changes nothing.
        let again = resolver
            .resolve_detailed(&req(Some("george@hillvalley.edu"), Some("717171")))
            .unwrap();
        assert_eq!(again.identity, res.identity);
        assert!(again.demoted.is_empty());
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn match_on_secondary_reaches_whole_group() {
        let (store, resolver) = setup();
        resolver.resolve(&req(Some("a@x.com"), Some("1"))).unwrap();
        resolver.resolve(&req(Some("b@x.com"), Some("1"))).unwrap();
        resolver.resolve(&req(Some("c@x.com"), Some("1"))).unwrap();

        // Only contact 2 carries b@x.com.
        let res = resolver.resolve_detailed(&req(Some("b@x.com"), None)).unwrap();
        assert!(res.created.is_none());
        assert_eq!(res.identity.primary_contact_id, ContactId::new(1));
        assert_eq!(res.identity.secondary_contact_ids, ids(&[2, 3]));

        // A novel phone via a secondary-only match links to the primary.
        let res = resolver.resolve_detailed(&req(Some("b@x.com"), Some("9"))).unwrap();
        let created = res.created.unwrap();
        assert_eq!(
            store.get(created).unwrap().unwrap().linked_id,
            Some(ContactId::new(1))
        );
        assert_eq!(res.identity.phone_numbers, vec!["1", "9"]);
        assert_one_hop(&store);
    }

    #[test]
    fn demoted_primary_secondaries_are_relinked() {
        let (store, resolver) = setup();
        resolver.resolve(&req(Some("a@x.com"), Some("1"))).unwrap(); // 1
        resolver.resolve(&req(Some("b@x.com"), Some("2"))).unwrap(); // 2
        resolver.resolve(&req(Some("c@x.com"), Some("2"))).unwrap(); // 3 -> 2

        let res = resolver.resolve_detailed(&req(Some("a@x.com"), Some("2"))).unwrap();
        assert_eq!(res.demoted, ids(&[2]));
        assert_eq!(res.identity.secondary_contact_ids, ids(&[2, 3]));
        assert_eq!(res.identity.emails, vec!["a@x.com", "b@x.com", "c@x.com"]);
        assert_eq!(
            store.get(ContactId::new(3)).unwrap().unwrap().linked_id,
            Some(ContactId::new(1))
        );
        assert_one_hop(&store);
    }

    #[test]
    fn three_groups_merge_transitively() {
        let (store, resolver) = setup();
        resolver.resolve(&req(Some("a@x.com"), Some("1"))).unwrap(); // 1
        resolver.resolve(&req(Some("b@x.com"), Some("2"))).unwrap(); // 2
        resolver.resolve(&req(Some("c@x.com"), Some("3"))).unwrap(); // 3

        resolver.resolve(&req(Some("b@x.com"), Some("3"))).unwrap(); // 3 under 2
        let res = resolver.resolve_detailed(&req(Some("a@x.com"), Some("3"))).unwrap();

        assert_eq!(res.identity.primary_contact_id, ContactId::new(1));
        assert_eq!(res.identity.secondary_contact_ids, ids(&[2, 3]));
        assert_eq!(res.identity.phone_numbers, vec!["1", "2", "3"]);
        assert_eq!(store.len().unwrap(), 3);
        assert_one_hop(&store);
    }

    #[test]
    fn empty_request_is_rejected_without_mutation() {
        let (store, resolver) = setup();
        for request in [req(None, None), req(Some(""), Some("  "))] {
            let err = resolver.resolve(&request).unwrap_err();
            assert!(matches!(err, IdentityError::Validation(ValidationError::MissingContactField)));
            assert!(!err.is_retryable());
        }
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn custom_policy_is_applied_before_matching() {
        let store = Arc::new(InMemoryContactStore::new());
        let resolver = IdentityResolver::with_policy(
            store.clone(),
            InputPolicy {
                lowercase_email: true,
                ..InputPolicy::default()
            },
        );
        resolver.resolve(&req(Some("Doc@HillValley.edu"), None)).unwrap();
        let res = resolver.resolve_detailed(&req(Some(" doc@hillvalley.edu "), None)).unwrap();
        assert!(res.created.is_none());
        assert_eq!(res.identity.emails, vec!["doc@hillvalley.edu"]);

        // Clones share the policy.
        assert!(resolver.clone().policy().lowercase_email);
    }

    /// Store whose transactions fail after a number of linkage updates.
    struct FlakyStore {
        inner: InMemoryContactStore,
        links_allowed: usize,
    }

    struct FlakyTransaction<'a> {
        inner: Box<dyn ContactTransaction + 'a>,
        links_left: usize,
    }

    impl ContactStore for FlakyStore {
        fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError> {
            Ok(Box::new(FlakyTransaction {
                inner: self.inner.begin()?,
                links_left: self.links_allowed,
            }))
        }

        fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
            self.inner.get(id)
        }

        fn len(&self) -> Result<usize, StorageError> {
            self.inner.len()
        }
    }

    impl ContactTransaction for FlakyTransaction<'_> {
        fn find_by_email_or_phone(
            &self,
            email: Option<&str>,
            phone_number: Option<&str>,
        ) -> Result<Vec<Contact>, StorageError> {
            self.inner.find_by_email_or_phone(email, phone_number)
        }

        fn find_by_ids_or_linked_ids(&self, ids: &BTreeSet<ContactId>) -> Result<Vec<Contact>, StorageError> {
            self.inner.find_by_ids_or_linked_ids(ids)
        }

        fn create(&mut self, contact: NewContact) -> Result<Contact, StorageError> {
            self.inner.create(contact)
        }

        fn update_linkage(
            &mut self,
            id: ContactId,
            precedence: LinkPrecedence,
            linked_id: Option<ContactId>,
        ) -> Result<(), StorageError> {
            if self.links_left == 0 {
                return Err(StorageError::ConnectionError("link dropped".to_string()));
            }
            self.links_left -= 1;
            self.inner.update_linkage(id, precedence, linked_id)
        }

        fn commit(self: Box<Self>) -> Result<(), StorageError> {
            self.inner.commit()
        }
    }

    #[test]
    fn failed_merge_rolls_back_every_step() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryContactStore::new(),
            links_allowed: 1,
        });
        let p1 = store
            .inner
            .create(NewContact::primary(Some("a@x.com".into()), Some("1".into())))
            .unwrap();
        let p2 = store
            .inner
            .create(NewContact::primary(Some("b@x.com".into()), Some("2".into())))
            .unwrap();
        let s3 = store
            .inner
            .create(NewContact::secondary(Some("c@x.com".into()), Some("2".into()), p2.id))
            .unwrap();

        let resolver = IdentityResolver::new(store.clone());
        // Re-linking contact 3 succeeds, demoting contact 2 fails.
        let err = resolver.resolve(&req(Some("a@x.com"), Some("2"))).unwrap_err();
        assert!(err.is_storage());
        assert!(err.is_retryable());

        assert_eq!(store.inner.get(s3.id).unwrap().unwrap().linked_id, Some(p2.id));
        assert!(store.inner.get(p2.id).unwrap().unwrap().is_primary());
        assert!(store.inner.get(p1.id).unwrap().unwrap().is_primary());
        assert_one_hop(&store.inner);
    }

    #[test]
    fn canonical_falls_back_to_oldest_contact() {
        let now = chrono::Utc::now();
        let orphan = |id: u64| Contact {
            id: ContactId::new(id),
            email: None,
            phone_number: Some("1".into()),
            linked_id: Some(ContactId::new(99)),
            link_precedence: LinkPrecedence::Secondary,
            created_seq: id,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(canonical_primary(&[orphan(7), orphan(4)]), ContactId::new(4));
    }
}
