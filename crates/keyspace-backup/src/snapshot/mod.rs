use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod index;
pub mod key;

pub use index::ChainIndex;
pub use key::{DecodedKey, KeyCodec, Scope};

/// Format used for newly generated ids. Fixed width and zero padded, so
/// byte order matches chronological order. No `:` so ids stay usable in
/// scp targets and local paths.
pub const SNAPSHOT_ID_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Identifier of one snapshot layer.
///
/// Ordering is plain byte-wise comparison of the token. Chain order is
/// derived from this ordering alone, so every id ever written for a scope
/// must come from a format where byte order equals time order. Legacy
/// epoch-second ids (`"1700000000"`) sort before every date-formatted id
/// since `'1' < '2'`; that holds for epoch values below 2_000_000_000.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::msg("snapshot id is empty"));
        }
        if raw.contains('/') {
            return Err(Error::msg(format!(
                "snapshot id '{raw}' must not contain '/'"
            )));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::msg(format!(
                "snapshot id '{raw}' contains whitespace or control characters"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn generate(now: DateTime<Utc>) -> Self {
        Self(now.format(SNAPSHOT_ID_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Strictly later in chain order.
    pub fn is_after(&self, other: &SnapshotId) -> bool {
        self > other
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SnapshotId> for String {
    fn from(value: SnapshotId) -> Self {
        value.0
    }
}
