//! Core identifier and timestamp types.
//!
//! Entity and relationship ids are content-addressed: a 12-character hex
//! prefix of a SHA-256 digest over the fields that define the row. The same
//! source indexed twice therefore produces byte-identical ids, which makes
//! every write idempotent and lets re-indexing replace rows in place.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest.
const ID_LEN: usize = 12;

/// Stable entity identifier.
///
/// Derived as `sha256(file_path | type | name | start-end)` truncated to
/// 12 hex characters. A pure function of its inputs: re-indexing unchanged
/// source yields the same id.
///
/// # Example
/// ```
/// use codegraph::EntityId;
///
/// let a = EntityId::from_parts("/src/app.ts", "function", "main", 10, 90);
/// let b = EntityId::from_parts("/src/app.ts", "function", "main", 10, 90);
/// assert_eq!(a, b);
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Derives the id from the fields that uniquely identify an entity.
    pub fn from_parts(
        file_path: &str,
        entity_type: &str,
        name: &str,
        start_index: u64,
        end_index: u64,
    ) -> Self {
        let input = format!("{file_path}|{entity_type}|{name}|{start_index}-{end_index}");
        Self(truncated_sha256(input.as_bytes()))
    }

    /// Wraps an already-derived id string.
    ///
    /// Used when reading rows back from storage; no validation beyond
    /// being non-empty is performed.
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stable relationship identifier.
///
/// Derived as `sha256(from_id | to_id | type)` truncated to 12 hex
/// characters. Inserting the same edge twice is an idempotent overwrite.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationshipId(String);

impl RelationshipId {
    /// Derives the id from the edge's endpoints and type.
    pub fn from_parts(from_id: &EntityId, to_id: &EntityId, rel_type: &str) -> Self {
        let input = format!("{}|{}|{}", from_id.as_str(), to_id.as_str(), rel_type);
        Self(truncated_sha256(input.as_bytes()))
    }

    /// Wraps an already-derived id string.
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelationshipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelationshipId({})", self.0)
    }
}

impl AsRef<str> for RelationshipId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unix timestamp in milliseconds.
///
/// Millisecond precision matches the `created_at` / `updated_at` columns
/// and the knowledge-bus entry timestamps.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Returns the current time.
    pub fn now() -> Self {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(ms)
    }

    /// Returns the raw millisecond value.
    #[inline]
    pub const fn millis(&self) -> i64 {
        self.0
    }

    /// Constructs a timestamp from raw milliseconds.
    #[inline]
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hashes `input` with SHA-256 and keeps the first [`ID_LEN`] hex chars.
fn truncated_sha256(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    let mut id = hex::encode(digest);
    id.truncate(ID_LEN);
    id
}

/// Derives the stable id of an external placeholder entity.
///
/// Placeholders stand in for symbols outside the indexed corpus; the id is
/// a pure function of `(source, symbol)` so referential integrity holds
/// without indexing the external code.
pub fn external_placeholder_id(source: &str, symbol: &str) -> EntityId {
    EntityId::from_parts(&format!("external://{source}"), "import", symbol, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_is_deterministic() {
        let a = EntityId::from_parts("/a.ts", "function", "f", 1, 10);
        let b = EntityId::from_parts("/a.ts", "function", "f", 1, 10);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 12);
    }

    #[test]
    fn test_entity_id_varies_with_span() {
        let a = EntityId::from_parts("/a.ts", "function", "f", 1, 10);
        let b = EntityId::from_parts("/a.ts", "function", "f", 1, 11);
        assert_ne!(a, b);
    }

    #[test]
    fn test_entity_id_is_lower_hex() {
        let id = EntityId::from_parts("/a.ts", "class", "C", 5, 50);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id.as_str(), id.as_str().to_lowercase());
    }

    #[test]
    fn test_relationship_id_is_deterministic() {
        let from = EntityId::from_parts("/a.ts", "function", "f", 1, 10);
        let to = EntityId::from_parts("/a.ts", "class", "C", 20, 80);
        let r1 = RelationshipId::from_parts(&from, &to, "CALLS");
        let r2 = RelationshipId::from_parts(&from, &to, "CALLS");
        assert_eq!(r1, r2);
        assert_eq!(r1.as_str().len(), 12);
    }

    #[test]
    fn test_relationship_id_directional() {
        let from = EntityId::from_parts("/a.ts", "function", "f", 1, 10);
        let to = EntityId::from_parts("/a.ts", "class", "C", 20, 80);
        let fwd = RelationshipId::from_parts(&from, &to, "CALLS");
        let rev = RelationshipId::from_parts(&to, &from, "CALLS");
        assert_ne!(fwd, rev);
    }

    #[test]
    fn test_external_placeholder_id_stable() {
        let a = external_placeholder_id("lodash", "debounce");
        let b = external_placeholder_id("lodash", "debounce");
        assert_eq!(a, b);
    }

    #[test]
    fn test_timestamp_ordering() {
        let early = Timestamp::from_millis(1_000);
        let late = Timestamp::from_millis(2_000);
        assert!(early < late);
    }

    #[test]
    fn test_timestamp_now_is_positive() {
        assert!(Timestamp::now().millis() > 0);
    }

    #[test]
    fn test_id_serde_transparent() {
        let id = EntityId::from_parts("/a.ts", "function", "f", 1, 10);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_str()));
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
