use serde::{Deserialize, Serialize};
use std::fmt;

const VISIBLE_PREFIX: usize = 6;

/// Reusable session secret for a remote account.
///
/// Formatting never reveals more than a short prefix, so a credential can be
/// passed to `tracing` fields or error messages without leaking it. Use
/// [`Credential::expose`] where the raw value is required.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({self})")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(VISIBLE_PREFIX).collect();
        if self.0.chars().count() > VISIBLE_PREFIX * 2 {
            write!(f, "{prefix}***")
        } else {
            f.write_str("***")
        }
    }
}
