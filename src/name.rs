//! Service names chosen by providers.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Longest accepted service name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// A validated, case-sensitive service name.
///
/// Names are opaque to the broker. The only policy enforced is that a name is
/// non-empty, at most [`MAX_NAME_LEN`] bytes, and free of ASCII control
/// characters. Colons are allowed, so `REGISTER:a:b` names the service `a:b`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName(Arc<str>);

/// Reasons a candidate name was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidName {
    /// Nothing after the colon.
    #[error("service name is empty")]
    Empty,
    /// Longer than [`MAX_NAME_LEN`].
    #[error("service name exceeds {MAX_NAME_LEN} bytes")]
    TooLong,
    /// Contains a control character such as NUL or DEL.
    #[error("service name contains control characters")]
    ControlCharacter,
}

impl ServiceName {
    /// Validate and wrap a name.
    pub fn new(name: &str) -> Result<Self, InvalidName> {
        if name.is_empty() {
            return Err(InvalidName::Empty);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(InvalidName::TooLong);
        }
        if name.chars().any(|c| c.is_ascii_control()) {
            return Err(InvalidName::ControlCharacter);
        }
        Ok(Self(Arc::from(name)))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ServiceName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for ServiceName {
    type Err = InvalidName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
