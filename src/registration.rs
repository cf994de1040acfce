//! Caller registration
//!
//! A call can only start once the backend has issued a session for the
//! caller. Validation runs locally first so a bad form never reaches the
//! network.

use crate::error::{Result, ValidationError};
use async_trait::async_trait;

pub const MAX_NAME_CHARS: usize = 50;
pub const COUNTRY_PREFIX: &str = "+212";
pub const SUBSCRIBER_DIGITS: usize = 9;

/// Validated caller details. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    name: String,
    phone: String,
}

impl Caller {
    /// Validate raw form input.
    ///
    /// The name is trimmed and must be 1..=50 characters. The phone must be
    /// `+212`, an optional single whitespace, then exactly nine digits; all
    /// whitespace is stripped from the stored value.
    pub fn new(name: &str, phone: &str) -> std::result::Result<Self, ValidationError> {
        let name = name.trim();
        let phone = phone.trim();

        if name.is_empty() || phone.is_empty() {
            return Err(ValidationError::MissingField);
        }
        if name.chars().count() > MAX_NAME_CHARS {
            return Err(ValidationError::NameTooLong { max: MAX_NAME_CHARS });
        }
        if !is_valid_phone(phone) {
            return Err(ValidationError::BadPhone);
        }

        Ok(Self {
            name: name.to_string(),
            phone: phone.chars().filter(|c| !c.is_whitespace()).collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phone(&self) -> &str {
        &self.phone
    }
}

fn is_valid_phone(phone: &str) -> bool {
    let Some(rest) = phone.strip_prefix(COUNTRY_PREFIX) else {
        return false;
    };

    let mut chars = rest.chars().peekable();
    if chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
    }

    let digits: Vec<char> = chars.collect();
    digits.len() == SUBSCRIBER_DIGITS && digits.iter().all(|c| c.is_ascii_digit())
}

/// Identifiers issued by the backend for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub session_id: String,
    pub client_id: String,
}

/// Something that can open a call session for a caller.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn start_call(&self, caller: &Caller) -> Result<Registration>;
}
