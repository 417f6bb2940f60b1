use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one harvestable item, as issued by the discovery API.
///
/// Used verbatim inside store keys, so it must be a single path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkId(String);

impl WorkId {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("work id must not be empty".to_string());
        }
        if trimmed.starts_with('.') {
            return Err(format!("work id `{trimmed}` must not start with '.'"));
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|ch| matches!(ch, '/' | '\\') || ch.is_whitespace() || ch.is_control())
        {
            return Err(format!("work id `{trimmed}` contains invalid character {bad:?}"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WorkId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WorkId> for String {
    fn from(value: WorkId) -> Self {
        value.0
    }
}
