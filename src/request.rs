//! Identify requests and input normalization.
//!
//! An `IdentifyRequest` is what a caller submits. Before any store access it
//! is normalized under an `InputPolicy` into a `ContactQuery`, which is the
//! only form the resolver accepts.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{IdentityError, IdentityResult, ValidationError};

const EMAIL_PATTERN: &str = r"^[^\s@]+@[^\s@]+\.[^\s@]+$";
const PHONE_PATTERN: &str = r"^[0-9+\-(). ]*[0-9][0-9+\-(). ]*$";

static EMAIL_RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
static PHONE_RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn compiled(cell: &'static OnceLock<Result<Regex, regex::Error>>, pattern: &str) -> IdentityResult<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| IdentityError::internal(format!("invalid built-in pattern '{pattern}': {e}")))
}

/// A submitted identify request.
///
/// On the wire the phone number may arrive as a JSON string or number.
///
/// # Examples
///
/// ```
/// use identity_reconciler::IdentifyRequest;
///
/// let req: IdentifyRequest =
///     serde_json::from_str(r#"{"email": "doc@hillvalley.edu", "phoneNumber": 123456}"#).unwrap();
/// assert_eq!(req.phone_number.as_deref(), Some("123456"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    /// Submitted email, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Submitted phone number, if any.
    #[serde(
        default,
        deserialize_with = "deserialize_phone_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    /// Creates a request from optional fields.
    #[must_use]
    pub fn new(email: Option<String>, phone_number: Option<String>) -> Self {
        Self { email, phone_number }
    }

    /// Sets the email.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the phone number.
    #[must_use]
    pub fn with_phone_number(mut self, phone_number: impl Into<String>) -> Self {
        self.phone_number = Some(phone_number.into());
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PhoneValue {
    Text(String),
    Number(serde_json::Number),
}

fn deserialize_phone_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<PhoneValue>::deserialize(deserializer)?.map(|v| match v {
        PhoneValue::Text(s) => s,
        PhoneValue::Number(n) => n.to_string(),
    }))
}

/// How submitted fields are cleaned and checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputPolicy {
    /// Strip surrounding whitespace. A field left empty counts as absent.
    pub trim_whitespace: bool,
    /// Lowercase emails before matching.
    pub lowercase_email: bool,
    /// Maximum length of either field, in characters.
    pub max_field_length: usize,
    /// Reject values that do not look like an email or phone number.
    pub strict_format: bool,
}

impl Default for InputPolicy {
    fn default() -> Self {
        Self {
            trim_whitespace: true,
            lowercase_email: false,
            max_field_length: 320,
            strict_format: false,
        }
    }
}

impl InputPolicy {
    /// Normalize a request into a query.
    ///
    /// # Errors
    /// - `MissingContactField` if neither field survives normalization
    /// - `FieldTooLong`, `InvalidEmail`, `InvalidPhoneNumber` per the policy
    pub fn normalize(&self, request: &IdentifyRequest) -> IdentityResult<ContactQuery> {
        let email = match self.clean(request.email.as_deref(), "email")? {
            Some(email) => {
                let email = if self.lowercase_email {
                    email.to_lowercase()
                } else {
                    email
                };
                if self.strict_format && !compiled(&EMAIL_RE, EMAIL_PATTERN)?.is_match(&email) {
                    return Err(ValidationError::InvalidEmail { value: email }.into());
                }
                Some(email)
            }
            None => None,
        };

        let phone_number = match self.clean(request.phone_number.as_deref(), "phoneNumber")? {
            Some(phone) => {
                if self.strict_format && !compiled(&PHONE_RE, PHONE_PATTERN)?.is_match(&phone) {
                    return Err(ValidationError::InvalidPhoneNumber { value: phone }.into());
                }
                Some(phone)
            }
            None => None,
        };

        if email.is_none() && phone_number.is_none() {
            return Err(ValidationError::MissingContactField.into());
        }
        Ok(ContactQuery { email, phone_number })
    }

    fn clean(&self, raw: Option<&str>, field: &'static str) -> Result<Option<String>, ValidationError> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        let value = if self.trim_whitespace { raw.trim() } else { raw };
        if value.is_empty() {
            return Ok(None);
        }
        if value.chars().count() > self.max_field_length {
            return Err(ValidationError::FieldTooLong {
                field,
                max_length: self.max_field_length,
            });
        }
        Ok(Some(value.to_string()))
    }
}

/// A validated query: at least one field is present and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContactQuery {
    email: Option<String>,
    phone_number: Option<String>,
}

impl ContactQuery {
    /// Build a query from already-normalized values under the default policy.
    ///
    /// # Errors
    /// Same as [`InputPolicy::normalize`].
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> IdentityResult<Self> {
        InputPolicy::default().normalize(&IdentifyRequest::new(
            email.map(str::to_string),
            phone_number.map(str::to_string),
        ))
    }

    /// Normalized email.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// Normalized phone number.
    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    /// Short stable digest of the query keys, safe to put in logs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"email:");
        hasher.update(self.email().unwrap_or_default().as_bytes());
        hasher.update(b"\0phone:");
        hasher.update(self.phone_number().unwrap_or_default().as_bytes());
        let hex = hasher.finalize().to_hex();
        hex.as_str()[..16].to_string()
    }
}
