//! Caller identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a principal in characters.
pub const MAX_PRINCIPAL_LEN: usize = 128;

/// An already-authenticated caller identity, treated as an opaque string.
///
/// Every operation takes the caller explicitly; nothing in the upload or
/// serving logic looks identity up from ambient state.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Principal(String);

impl Principal {
    /// Parse and validate a principal.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.is_empty() {
            return Err(crate::Error::InvalidArgument(
                "principal must not be empty".to_string(),
            ));
        }
        if s.chars().count() > MAX_PRINCIPAL_LEN {
            return Err(crate::Error::InvalidArgument(format!(
                "principal exceeds {MAX_PRINCIPAL_LEN} characters"
            )));
        }
        if !s.chars().all(|c| c.is_ascii_graphic()) {
            return Err(crate::Error::InvalidArgument(
                "principal must be printable ASCII without whitespace".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Principal({})", self.0)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Principal {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<Principal> for String {
    fn from(value: Principal) -> Self {
        value.0
    }
}
