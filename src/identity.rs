//! Consolidated identity view and the identify wire payloads.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::contact::{Contact, ContactId};

/// One identity group as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedIdentity {
    /// The group's canonical primary.
    pub primary_contact_id: ContactId,
    /// Distinct emails; the primary's first, then by contact age.
    pub emails: Vec<String>,
    /// Distinct phone numbers; the primary's first, then by contact age.
    pub phone_numbers: Vec<String>,
    /// Secondary contacts, oldest first.
    pub secondary_contact_ids: Vec<ContactId>,
}

impl ConsolidatedIdentity {
    /// Build the view of a group from its contacts.
    ///
    /// `contacts` may be in any order; only contacts belonging to the group
    /// rooted at `primary_id` contribute.
    #[must_use]
    pub fn assemble(primary_id: ContactId, contacts: &[Contact]) -> Self {
        let mut group: Vec<&Contact> = contacts
            .iter()
            .filter(|c| c.id == primary_id || c.linked_id == Some(primary_id))
            .collect();
        group.sort_by_key(|c| c.ordering_key());
        // Primary first; the stable sort keeps age order for the rest.
        group.sort_by_key(|c| c.id != primary_id);

        let emails = distinct(group.iter().filter_map(|c| c.email()));
        let phone_numbers = distinct(group.iter().filter_map(|c| c.phone_number()));
        let secondary_contact_ids = group
            .iter()
            .filter(|c| c.is_secondary())
            .map(|c| c.id)
            .collect();

        Self {
            primary_contact_id: primary_id,
            emails,
            phone_numbers,
            secondary_contact_ids,
        }
    }

    /// Number of contacts in the group.
    #[must_use]
    pub fn contact_count(&self) -> usize {
        1 + self.secondary_contact_ids.len()
    }
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .filter(|v| seen.insert(*v))
        .map(str::to_string)
        .collect()
}

/// Successful identify response: `{"contact": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    /// The resolved identity.
    pub contact: ConsolidatedIdentity,
}

impl From<ConsolidatedIdentity> for IdentifyResponse {
    fn from(contact: ConsolidatedIdentity) -> Self {
        Self { contact }
    }
}

/// Error response: `{"message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable reason.
    pub message: String,
}

impl ErrorResponse {
    /// Response for a failed resolution.
    ///
    /// Validation messages are returned as-is; anything else is reported
    /// generically and the details stay in the logs.
    #[must_use]
    pub fn from_error(err: &crate::error::IdentityError) -> Self {
        let message = match err {
            crate::error::IdentityError::Validation(v) => v.to_string(),
            _ => "Internal server error".to_string(),
        };
        Self { message }
    }
}
