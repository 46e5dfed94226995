//! The credential set, the unit of persistence.

use super::record::{CredentialEntry, CredentialRecord};
use crate::errors::Result;
use serde::de::Error as _;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Layout of the serialized payload.
///
/// Detected on load and reused on write, so records nobody touched keep
/// their shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadStyle {
    /// Indented, one key per line.
    #[default]
    Pretty,
    /// Single line with no whitespace.
    Compact,
}

impl PayloadStyle {
    /// Guesses the style of a JSON payload from its line breaks.
    #[must_use]
    pub fn detect(bytes: &[u8]) -> Self {
        let start = bytes.iter().position(|b| !b.is_ascii_whitespace());
        let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace());
        let body = match (start, end) {
            (Some(start), Some(end)) => &bytes[start..=end],
            _ => &[][..],
        };
        if body.contains(&b'\n') {
            Self::Pretty
        } else {
            Self::Compact
        }
    }
}

impl fmt::Display for PayloadStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
        }
    }
}

/// Ordered collection of credential records.
///
/// The whole set is read and written as one payload. Records that fail
/// validation stay in the set as they were loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredentialSet {
    records: Vec<CredentialRecord>,
    style: PayloadStyle,
}

impl CredentialSet {
    /// Creates a set from records in order.
    #[must_use]
    pub fn new(records: Vec<CredentialRecord>) -> Self {
        Self {
            records,
            style: PayloadStyle::default(),
        }
    }

    /// Sets the layout used by [`CredentialSet::to_bytes`].
    #[must_use]
    pub fn with_style(mut self, style: PayloadStyle) -> Self {
        self.style = style;
        self
    }

    /// Deserializes a JSON array of records.
    ///
    /// Any array element is accepted, whatever its shape; validation decides
    /// later whether it can be refreshed. Only a payload that is not a JSON
    /// array is an error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let elements = match serde_json::from_slice::<Value>(bytes)? {
            Value::Array(elements) => elements,
            other => {
                return Err(serde_json::Error::custom(format!(
                    "credential payload must be a JSON array, found {}",
                    json_kind(&other)
                ))
                .into())
            }
        };

        Ok(Self {
            records: elements.into_iter().map(CredentialRecord::from_value).collect(),
            style: PayloadStyle::detect(bytes),
        })
    }

    /// Serializes the set in its payload style.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = match self.style {
            PayloadStyle::Pretty => serde_json::to_vec_pretty(&self.records)?,
            PayloadStyle::Compact => serde_json::to_vec(&self.records)?,
        };
        Ok(bytes)
    }

    /// Layout detected on load.
    #[must_use]
    pub fn style(&self) -> PayloadStyle {
        self.style
    }

    /// Maps tenant ids to records. On collisions the later record wins.
    ///
    /// Records without a tenant id are not indexed.
    #[must_use]
    pub fn index_by_tenant(&self) -> HashMap<&str, &CredentialRecord> {
        self.records
            .iter()
            .filter_map(|record| record.tenant_id().map(|id| (id, record)))
            .collect()
    }

    /// Records in load order.
    #[must_use]
    pub fn records(&self) -> &[CredentialRecord] {
        &self.records
    }

    /// Validates every record, preserving order.
    #[must_use]
    pub fn into_entries(self) -> Vec<CredentialEntry> {
        self.records.into_iter().map(CredentialRecord::validate).collect()
    }

    /// Rebuilds a set from validated entries.
    #[must_use]
    pub fn from_entries(entries: Vec<CredentialEntry>) -> Self {
        Self::new(entries.into_iter().map(CredentialEntry::into_record).collect())
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the set holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAYLOAD: &str = r#"[
        {"tenant_id": "a", "client_id": "ca", "client_secret": "sa", "refresh_token": "ra",
         "access_token": "xa", "expires_at": "2026-01-01T00:00:00Z", "shop": "a.example"},
        {"tenant_id": "b", "client_id": "cb"},
        {"tenant_id": "a", "client_id": "ca2", "client_secret": "sa2", "refresh_token": "ra2"}
    ]"#;

    #[test]
    fn test_round_trip() {
        let set = CredentialSet::from_bytes(PAYLOAD.as_bytes()).unwrap();
        let bytes = set.to_bytes().unwrap();
        let again = CredentialSet::from_bytes(&bytes).unwrap();

        assert_eq!(again, set);
        assert_eq!(again.len(), 3);
    }

    #[test]
    fn test_incomplete_records_are_kept() {
        let set = CredentialSet::from_bytes(PAYLOAD.as_bytes()).unwrap();
        let entries = set.clone().into_entries();

        assert!(entries[0].is_valid());
        assert!(!entries[1].is_valid());
        assert_eq!(CredentialSet::from_entries(entries), set);
    }

    #[test]
    fn test_mistyped_elements_are_kept() {
        let payload = br#"[{"tenant_id":"a","client_id":12345},"stray",null,{"tenant_id":"b","expires_at":1767225600}]"#;
        let set = CredentialSet::from_bytes(payload).unwrap();

        assert_eq!(set.len(), 4);
        assert!(set.clone().into_entries().iter().all(|entry| !entry.is_valid()));
        assert_eq!(set.to_bytes().unwrap(), payload.to_vec());
    }

    #[test]
    fn test_index_last_record_wins() {
        let set = CredentialSet::from_bytes(PAYLOAD.as_bytes()).unwrap();
        let index = set.index_by_tenant();

        assert_eq!(index.len(), 2);
        assert_eq!(index["a"].client_id(), Some("ca2"));
    }

    #[test]
    fn test_rejects_non_array() {
        let err = CredentialSet::from_bytes(br#"{"tenant_id": "a"}"#).unwrap_err();
        assert!(err.to_string().contains("found an object"));
        assert!(CredentialSet::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_empty_set() {
        let set = CredentialSet::from_bytes(b"[]").unwrap();
        assert!(set.is_empty());
        assert!(set.index_by_tenant().is_empty());
    }

    #[test]
    fn test_style_follows_payload() {
        let compact = br#"[{"tenant_id":"a","refresh_token":null}]"#;
        let set = CredentialSet::from_bytes(compact).unwrap();
        assert_eq!(set.style(), PayloadStyle::Compact);
        assert_eq!(set.to_bytes().unwrap(), compact.to_vec());

        let pretty = CredentialSet::from_bytes(PAYLOAD.as_bytes()).unwrap();
        assert_eq!(pretty.style(), PayloadStyle::Pretty);
        assert!(pretty.to_bytes().unwrap().contains(&b'\n'));

        assert_eq!(PayloadStyle::detect(b"[]\n"), PayloadStyle::Compact);
    }
}
