//! Contact records and link precedence.
//!
//! A `Contact` is the only stored entity. Contacts form two-level trees: one
//! PRIMARY contact and any number of SECONDARY contacts pointing directly at it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned contact identifier.
///
/// Identifiers are issued in strictly increasing order and are never reused.
///
/// # Examples
///
/// ```
/// use identity_reconciler::ContactId;
///
/// let id = ContactId::new(7);
/// assert_eq!(id.get(), 7);
/// assert_eq!(id.to_string(), "7");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(u64);

impl ContactId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ContactId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<ContactId> for u64 {
    fn from(id: ContactId) -> Self {
        id.0
    }
}

/// Position of a contact within its identity group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    /// Canonical representative of the group.
    Primary,
    /// Subsumed contact pointing at the group's primary.
    Secondary,
}

impl LinkPrecedence {
    /// Returns the lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored contact record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Unique identifier, immutable.
    pub id: ContactId,

    /// Email address, if known.
    pub email: Option<String>,

    /// Phone number, if known.
    pub phone_number: Option<String>,

    /// The primary this contact belongs to. `Some` iff `link_precedence` is `Secondary`.
    pub linked_id: Option<ContactId>,

    /// Primary or secondary.
    pub link_precedence: LinkPrecedence,

    /// Logical creation clock issued by the store. Orders contacts by age.
    pub created_seq: u64,

    /// Wall-clock creation time (informational only).
    pub created_at: DateTime<Utc>,

    /// Wall-clock time of the last linkage change (informational only).
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// Returns true if this contact is the primary of its group.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Returns true if this contact is subsumed into another contact's group.
    #[must_use]
    pub fn is_secondary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Secondary
    }

    /// Age ordering key: oldest first, identifier as tie-break.
    #[must_use]
    pub fn ordering_key(&self) -> (u64, ContactId) {
        (self.created_seq, self.id)
    }

    /// Id of the primary this contact resolves to (itself when primary).
    #[must_use]
    pub fn root_id(&self) -> ContactId {
        self.linked_id.unwrap_or(self.id)
    }

    /// Returns the email if present and non-empty.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref().filter(|s| !s.is_empty())
    }

    /// Returns the phone number if present and non-empty.
    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref().filter(|s| !s.is_empty())
    }
}

/// Fields supplied when creating a contact. The store assigns everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    /// Email address.
    pub email: Option<String>,
    /// Phone number.
    pub phone_number: Option<String>,
    /// Primary to attach to (secondaries only).
    pub linked_id: Option<ContactId>,
    /// Requested precedence.
    pub link_precedence: LinkPrecedence,
}

impl NewContact {
    /// A fresh primary contact.
    #[must_use]
    pub fn primary(email: Option<String>, phone_number: Option<String>) -> Self {
        Self {
            email,
            phone_number,
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
        }
    }

    /// A secondary contact attached to `primary`.
    #[must_use]
    pub fn secondary(email: Option<String>, phone_number: Option<String>, primary: ContactId) -> Self {
        Self {
            email,
            phone_number,
            linked_id: Some(primary),
            link_precedence: LinkPrecedence::Secondary,
        }
    }
}
