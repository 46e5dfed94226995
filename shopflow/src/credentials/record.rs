//! Per-tenant credential records.
//!
//! Records arrive as loosely-typed JSON and are kept as the exact value that
//! was loaded, so keys, `null`s and unexpected types survive a write-back.
//! Each record is validated once at load time into a [`CredentialEntry`]:
//! either a [`ValidCredential`] that can be refreshed, or an
//! [`IncompleteCredential`] that is carried through the run untouched so an
//! operator can fix it.

use crate::refresh::TokenGrant;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Fields that must be non-blank strings for a record to be refreshable.
pub const REQUIRED_FIELDS: [&str; 4] = ["tenant_id", "client_id", "client_secret", "refresh_token"];

/// Naive timestamp layouts accepted for `expires_at` besides RFC 3339.
const NAIVE_LAYOUTS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Epoch values at or above this magnitude are read as milliseconds.
const EPOCH_MILLIS_THRESHOLD: u64 = 100_000_000_000;

/// One tenant's OAuth credentials as stored in the secret payload.
///
/// The record wraps the raw JSON element. Typed views are computed on
/// demand, and only [`ValidCredential::apply_grant`] ever changes the
/// underlying value.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRecord {
    raw: Value,
}

impl Default for CredentialRecord {
    fn default() -> Self {
        Self {
            raw: Value::Object(Map::new()),
        }
    }
}

impl From<Value> for CredentialRecord {
    fn from(raw: Value) -> Self {
        Self { raw }
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("tenant_id", &self.tenant_id())
            .field("client_id", &self.client_id())
            .field("client_secret", &redacted(self.field("client_secret")))
            .field("refresh_token", &redacted(self.field("refresh_token")))
            .field("access_token", &redacted(self.field("access_token")))
            .field("expires_at", &self.expires_at())
            .field("keys", &self.raw.as_object().map_or(0, Map::len))
            .finish()
    }
}

fn redacted(value: Option<&Value>) -> &'static str {
    match value {
        None => "<absent>",
        Some(Value::Null) => "<null>",
        Some(_) => "<redacted>",
    }
}

fn non_blank(value: &Value) -> Option<&str> {
    value.as_str().filter(|v| !v.trim().is_empty())
}

fn epoch_to_utc(value: &Number) -> Option<DateTime<Utc>> {
    let raw = value.as_i64()?;
    if raw.unsigned_abs() < EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp(raw, 0)
    } else {
        DateTime::from_timestamp_millis(raw)
    }
}

impl CredentialRecord {
    /// Wraps a raw JSON element.
    #[must_use]
    pub fn from_value(raw: Value) -> Self {
        Self { raw }
    }

    /// Sets a key on the record, for building records in code.
    ///
    /// Has no effect when the record is not a JSON object.
    #[must_use]
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set_field(key, value);
        self
    }

    /// The raw JSON element.
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.raw
    }

    /// Unwraps the raw JSON element.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.raw
    }

    /// Raw value of a key, `None` when absent or when the record is not an
    /// object. A present `null` is returned as `Some(Value::Null)`.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    /// A key's value when it is a non-blank string.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(non_blank)
    }

    /// Tenant key, unique within a set.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&str> {
        self.text("tenant_id")
    }

    /// OAuth client id.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.text("client_id")
    }

    /// OAuth client secret.
    #[must_use]
    pub fn client_secret(&self) -> Option<&str> {
        self.text("client_secret")
    }

    /// Long-lived refresh token. Rotates on refresh.
    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.text("refresh_token")
    }

    /// Short-lived access token.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.text("access_token")
    }

    /// Advisory expiry of the access token, as stored.
    #[must_use]
    pub fn expires_at(&self) -> Option<&Value> {
        self.field("expires_at").filter(|v| !v.is_null())
    }

    /// Tenant id for log lines, even when the record has none.
    #[must_use]
    pub fn tenant_label(&self) -> &str {
        self.tenant_id().unwrap_or("<unknown>")
    }

    /// Lists the required fields that are absent, `null`, blank or not a
    /// string. Every field is missing when the record is not an object.
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&'static str> {
        REQUIRED_FIELDS
            .iter()
            .filter(|name| self.text(name).is_none())
            .copied()
            .collect()
    }

    /// Validates the record once, producing a tagged entry.
    #[must_use]
    pub fn validate(self) -> CredentialEntry {
        let missing = self.missing_fields();
        if missing.is_empty() {
            CredentialEntry::Valid(ValidCredential { record: self })
        } else {
            CredentialEntry::Incomplete(IncompleteCredential { record: self, missing })
        }
    }

    /// Parses `expires_at`.
    ///
    /// RFC 3339 strings carry their own offset and naive strings are read in
    /// `naive_offset`. Integer values are Unix epoch seconds, or
    /// milliseconds when large enough. Returns `None` when absent or
    /// unparseable.
    #[must_use]
    pub fn expires_at_utc(&self, naive_offset: FixedOffset) -> Option<DateTime<Utc>> {
        let raw = match self.expires_at()? {
            Value::Number(epoch) => return epoch_to_utc(epoch),
            other => non_blank(other)?.trim(),
        };

        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }

        NAIVE_LAYOUTS.iter().find_map(|layout| {
            NaiveDateTime::parse_from_str(raw, layout)
                .ok()
                .and_then(|naive| naive.and_local_timezone(naive_offset).single())
                .map(|local| local.with_timezone(&Utc))
        })
    }

    fn set_field(&mut self, key: &str, value: impl Into<Value>) {
        if let Value::Object(map) = &mut self.raw {
            map.insert(key.to_string(), value.into());
        }
    }
}

/// A record validated at load time.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialEntry {
    /// All required fields are present.
    Valid(ValidCredential),
    /// At least one required field is missing; passed through unchanged.
    Incomplete(IncompleteCredential),
}

impl CredentialEntry {
    /// Returns the underlying record.
    #[must_use]
    pub fn record(&self) -> &CredentialRecord {
        match self {
            Self::Valid(valid) => &valid.record,
            Self::Incomplete(incomplete) => &incomplete.record,
        }
    }

    /// Unwraps the underlying record.
    #[must_use]
    pub fn into_record(self) -> CredentialRecord {
        match self {
            Self::Valid(valid) => valid.record,
            Self::Incomplete(incomplete) => incomplete.record,
        }
    }

    /// True for a refreshable record.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// A record with every required field present.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidCredential {
    record: CredentialRecord,
}

impl ValidCredential {
    /// Tenant key.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        self.record.tenant_id().unwrap_or_default()
    }

    /// OAuth client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.record.client_id().unwrap_or_default()
    }

    /// OAuth client secret.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        self.record.client_secret().unwrap_or_default()
    }

    /// Current refresh token.
    #[must_use]
    pub fn refresh_token(&self) -> &str {
        self.record.refresh_token().unwrap_or_default()
    }

    /// The full record.
    #[must_use]
    pub fn record(&self) -> &CredentialRecord {
        &self.record
    }

    /// Unwraps the record.
    #[must_use]
    pub fn into_record(self) -> CredentialRecord {
        self.record
    }

    /// Applies a successful token exchange.
    ///
    /// Access token and expiry are always replaced. The refresh token is
    /// replaced only when the provider returned a different one. Returns
    /// whether the refresh token rotated. Keys other than these three keep
    /// their position and value.
    pub fn apply_grant(&mut self, grant: TokenGrant) -> bool {
        self.record.set_field("access_token", grant.access_token);
        self.record.set_field("expires_at", grant.expires_at);

        match grant.refresh_token {
            Some(token) if !token.trim().is_empty() && token != self.refresh_token() => {
                self.record.set_field("refresh_token", token);
                true
            }
            _ => false,
        }
    }
}

/// A record missing at least one required field.
#[derive(Debug, Clone, PartialEq)]
pub struct IncompleteCredential {
    /// The untouched record.
    pub record: CredentialRecord,
    /// Names of the missing or mistyped fields.
    pub missing: Vec<&'static str>,
}

/// Short SHA-256 fingerprint of a secret, safe to log.
#[must_use]
pub fn fingerprint(secret: &str) -> String {
    let hash = Sha256::digest(secret.as_bytes());
    hex::encode(&hash[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn full_record() -> CredentialRecord {
        CredentialRecord::from_value(json!({
            "tenant_id": "acme",
            "client_id": "client",
            "client_secret": "secret",
            "refresh_token": "refresh-1",
            "access_token": "access-1",
            "expires_at": "2026-01-01T00:00:00Z",
        }))
    }

    fn jst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn missing_of(record: CredentialRecord) -> Vec<&'static str> {
        match record.validate() {
            CredentialEntry::Incomplete(incomplete) => incomplete.missing,
            CredentialEntry::Valid(_) => panic!("expected incomplete record"),
        }
    }

    #[test]
    fn test_validate_full_record() {
        let entry = full_record().validate();
        assert!(entry.is_valid());
    }

    #[test]
    fn test_validate_blank_fields_are_missing() {
        let mut raw = full_record().into_value();
        raw["client_secret"] = json!("   ");
        raw.as_object_mut().unwrap().remove("refresh_token");

        assert_eq!(
            missing_of(CredentialRecord::from_value(raw)),
            vec!["client_secret", "refresh_token"]
        );
    }

    #[test]
    fn test_validate_null_and_wrong_type_are_missing() {
        let record = full_record()
            .with_field("client_id", 12345)
            .with_field("refresh_token", Value::Null);

        assert_eq!(missing_of(record), vec!["client_id", "refresh_token"]);
    }

    #[test]
    fn test_validate_non_object_is_missing_everything() {
        let record = CredentialRecord::from_value(json!(["not", "a", "record"]));
        assert_eq!(missing_of(record.clone()), REQUIRED_FIELDS.to_vec());
        assert_eq!(record.tenant_label(), "<unknown>");
    }

    #[test]
    fn test_null_keys_survive_serialization() {
        let json = r#"{"tenant_id":"b","client_id":"c","refresh_token":null,"access_token":null}"#;
        let record: CredentialRecord = serde_json::from_str(json).unwrap();

        assert_eq!(record.field("refresh_token"), Some(&Value::Null));
        assert_eq!(record.refresh_token(), None);
        assert_eq!(serde_json::to_string(&record).unwrap(), json);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let debug = format!("{:?}", full_record());
        assert!(!debug.contains("refresh-1"));
        assert!(!debug.contains("access-1"));
        assert!(!debug.contains("\"secret\""));
        assert!(debug.contains("acme"));
    }

    #[test]
    fn test_unknown_keys_survive() {
        let json = r#"{"tenant_id":"acme","shop_url":"https://acme.example","scopes":["read"]}"#;
        let record: CredentialRecord = serde_json::from_str(json).unwrap();

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["shop_url"], "https://acme.example");
        assert_eq!(back["scopes"][0], "read");
        assert_eq!(serde_json::to_string(&record).unwrap(), json);
    }

    #[test]
    fn test_expires_at_rfc3339() {
        let record = full_record().with_field("expires_at", "2026-03-01T12:00:00+09:00");

        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap();
        assert_eq!(record.expires_at_utc(jst()), Some(expected));
    }

    #[test]
    fn test_expires_at_naive_uses_offset() {
        let record = full_record().with_field("expires_at", "2026-03-01T12:00:00.250");

        let parsed = record.expires_at_utc(jst()).unwrap();
        assert_eq!(parsed.format("%H:%M:%S").to_string(), "03:00:00");
    }

    #[test]
    fn test_expires_at_epoch_numbers() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let seconds = full_record().with_field("expires_at", expected.timestamp());
        let millis = full_record().with_field("expires_at", expected.timestamp_millis());

        assert_eq!(seconds.expires_at_utc(jst()), Some(expected));
        assert_eq!(millis.expires_at_utc(jst()), Some(expected));
    }

    #[test]
    fn test_expires_at_garbage() {
        let record = full_record().with_field("expires_at", "next tuesday");
        assert_eq!(record.expires_at_utc(jst()), None);

        let record = full_record().with_field("expires_at", json!({"at": 1}));
        assert_eq!(record.expires_at_utc(jst()), None);

        let record = full_record().with_field("expires_at", Value::Null);
        assert_eq!(record.expires_at(), None);
    }

    #[test]
    fn test_apply_grant_rotation() {
        let CredentialEntry::Valid(mut valid) = full_record().validate() else {
            panic!("expected valid record");
        };

        let rotated = valid.apply_grant(TokenGrant {
            access_token: "access-2".to_string(),
            expires_at: "2026-02-01T00:00:00Z".to_string(),
            refresh_token: Some("refresh-2".to_string()),
        });
        assert!(rotated);
        assert_eq!(valid.refresh_token(), "refresh-2");

        let rotated = valid.apply_grant(TokenGrant {
            access_token: "access-3".to_string(),
            expires_at: "2026-03-01T00:00:00Z".to_string(),
            refresh_token: None,
        });
        assert!(!rotated);
        assert_eq!(valid.refresh_token(), "refresh-2");
        assert_eq!(valid.record().access_token(), Some("access-3"));
    }

    #[test]
    fn test_apply_grant_keeps_key_order() {
        let record = CredentialRecord::from_value(json!({
            "shop": "acme.example",
            "tenant_id": "acme",
            "client_id": "client",
            "client_secret": "secret",
            "refresh_token": "refresh-1",
        }));
        let CredentialEntry::Valid(mut valid) = record.validate() else {
            panic!("expected valid record");
        };

        valid.apply_grant(TokenGrant {
            access_token: "access-2".to_string(),
            expires_at: "2026-02-01T00:00:00Z".to_string(),
            refresh_token: None,
        });

        let keys: Vec<&String> = valid.record().as_value().as_object().unwrap().keys().collect();
        assert_eq!(
            keys,
            vec!["shop", "tenant_id", "client_id", "client_secret", "refresh_token", "access_token", "expires_at"]
        );
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_eq!(fingerprint("abc").len(), 8);
    }
}
