//! Record codec: session fields to and from a flat field map.
//!
//! Field layout of a record hash:
//!
//! | Field | Value |
//! |---|---|
//! | `creationTime` | epoch millis, ASCII decimal |
//! | `lastAccessedTime` | epoch millis, ASCII decimal |
//! | `maxInactiveInterval` | seconds, ASCII decimal (may be negative) |
//! | `sessionAttr:<name>` | opaque attribute bytes |
//!
//! The codec is pure. A [`FieldValue::Tombstone`] marks an attribute removal
//! in a delta; decoding skips tombstones so it stays total over deltas.

use crate::error::{Result, SessionError};
use crate::record::{SessionRecord, whole_seconds};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Field holding the creation time.
pub const CREATION_TIME_KEY: &str = "creationTime";

/// Field holding the last accessed time.
pub const LAST_ACCESSED_TIME_KEY: &str = "lastAccessedTime";

/// Field holding the max inactive interval.
pub const MAX_INACTIVE_INTERVAL_KEY: &str = "maxInactiveInterval";

/// Prefix distinguishing attribute fields.
pub const ATTRIBUTE_PREFIX: &str = "sessionAttr:";

/// A field value in a delta or payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Raw stored bytes.
    Bytes(Vec<u8>),
    /// Explicit removal.
    Tombstone,
}

impl FieldValue {
    /// Borrow the bytes, `None` for a tombstone.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            Self::Tombstone => None,
        }
    }
}

/// Field name → value mapping (a whole record, or a delta).
pub type FieldMap = HashMap<String, FieldValue>;

/// Hash field name for an attribute.
#[must_use]
pub fn attribute_field(attribute_name: &str) -> String {
    format!("{ATTRIBUTE_PREFIX}{attribute_name}")
}

/// Encoded creation/last-accessed time.
#[must_use]
pub fn encode_instant(instant: DateTime<Utc>) -> FieldValue {
    FieldValue::Bytes(instant.timestamp_millis().to_string().into_bytes())
}

/// Encoded max inactive interval.
#[must_use]
pub fn encode_interval(interval: Duration) -> FieldValue {
    FieldValue::Bytes(
        whole_seconds(interval)
            .num_seconds()
            .to_string()
            .into_bytes(),
    )
}

/// Encode every field of a record.
#[must_use]
pub fn encode(record: &SessionRecord) -> FieldMap {
    let mut fields = FieldMap::with_capacity(record.attributes.len() + 3);
    fields.insert(CREATION_TIME_KEY.to_string(), encode_instant(record.creation_time));
    fields.insert(
        LAST_ACCESSED_TIME_KEY.to_string(),
        encode_instant(record.last_accessed_time),
    );
    fields.insert(
        MAX_INACTIVE_INTERVAL_KEY.to_string(),
        encode_interval(record.max_inactive_interval),
    );
    for (name, value) in &record.attributes {
        fields.insert(attribute_field(name), FieldValue::Bytes(value.clone()));
    }
    fields
}

/// Decode a record.
///
/// Callers treat an empty map as "not found" before decoding.
///
/// # Errors
///
/// Returns [`SessionError::MissingField`] if a mandatory field is absent and
/// [`SessionError::MalformedField`] if one does not parse.
pub fn decode(session_id: &str, fields: &FieldMap) -> Result<SessionRecord> {
    let creation_millis = mandatory_integer(session_id, fields, CREATION_TIME_KEY)?;
    let last_accessed_millis = mandatory_integer(session_id, fields, LAST_ACCESSED_TIME_KEY)?;
    let interval_seconds = mandatory_integer(session_id, fields, MAX_INACTIVE_INTERVAL_KEY)?;

    let attributes = fields
        .iter()
        .filter_map(|(name, value)| {
            let attribute_name = name.strip_prefix(ATTRIBUTE_PREFIX)?;
            let bytes = value.as_bytes()?;
            Some((attribute_name.to_string(), bytes.to_vec()))
        })
        .collect();

    Ok(SessionRecord {
        id: session_id.to_string(),
        creation_time: instant(session_id, CREATION_TIME_KEY, creation_millis)?,
        last_accessed_time: instant(session_id, LAST_ACCESSED_TIME_KEY, last_accessed_millis)?,
        max_inactive_interval: Duration::seconds(interval_seconds),
        attributes,
    })
}

/// Wrap raw store bytes as a field map.
#[must_use]
pub fn from_store(entries: HashMap<String, Vec<u8>>) -> FieldMap {
    entries
        .into_iter()
        .map(|(name, bytes)| (name, FieldValue::Bytes(bytes)))
        .collect()
}

/// Serialize a delta for the session-created channel.
///
/// # Errors
///
/// Returns [`SessionError::Serialization`] if bincode fails.
pub fn to_payload(fields: &FieldMap) -> Result<Vec<u8>> {
    bincode::serialize(fields).map_err(|e| SessionError::Serialization(e.to_string()))
}

/// Deserialize a session-created payload.
///
/// # Errors
///
/// Returns [`SessionError::Serialization`] if the bytes are not a field map.
pub fn from_payload(payload: &[u8]) -> Result<FieldMap> {
    bincode::deserialize(payload).map_err(|e| SessionError::Serialization(e.to_string()))
}

fn mandatory_integer(session_id: &str, fields: &FieldMap, field: &'static str) -> Result<i64> {
    let bytes = fields
        .get(field)
        .and_then(FieldValue::as_bytes)
        .ok_or_else(|| SessionError::MissingField {
            session_id: session_id.to_string(),
            field,
        })?;

    std::str::from_utf8(bytes)
        .map_err(|e| e.to_string())
        .and_then(|text| text.trim().parse::<i64>().map_err(|e| e.to_string()))
        .map_err(|reason| SessionError::MalformedField {
            session_id: session_id.to_string(),
            field,
            reason,
        })
}

fn instant(session_id: &str, field: &'static str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| SessionError::MalformedField {
        session_id: session_id.to_string(),
        field,
        reason: format!("{millis} is out of range"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn record() -> SessionRecord {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap_or_default();
        let mut record = SessionRecord::new("abc".into(), now, Duration::seconds(1800));
        record.attributes.insert("a".into(), b"b".to_vec());
        record
    }

    #[test]
    fn test_encode_layout() {
        let fields = encode(&record());
        assert_eq!(
            fields.get(CREATION_TIME_KEY),
            Some(&FieldValue::Bytes(b"1700000000123".to_vec()))
        );
        assert_eq!(
            fields.get(MAX_INACTIVE_INTERVAL_KEY),
            Some(&FieldValue::Bytes(b"1800".to_vec()))
        );
        assert_eq!(fields.get("sessionAttr:a"), Some(&FieldValue::Bytes(b"b".to_vec())));
    }

    #[test]
    fn test_missing_field_is_corrupt() {
        let mut fields = encode(&record());
        fields.remove(LAST_ACCESSED_TIME_KEY);
        let err = decode("abc", &fields).err();
        assert_eq!(
            err,
            Some(SessionError::MissingField {
                session_id: "abc".into(),
                field: LAST_ACCESSED_TIME_KEY,
            })
        );
    }

    #[test]
    fn test_malformed_field_is_corrupt() {
        let mut fields = encode(&record());
        fields.insert(
            MAX_INACTIVE_INTERVAL_KEY.into(),
            FieldValue::Bytes(b"thirty".to_vec()),
        );
        assert!(decode("abc", &fields).is_err_and(|e| e.is_corrupt()));
    }

    #[test]
    fn test_tombstoned_attribute_is_skipped() {
        let mut fields = encode(&record());
        fields.insert(attribute_field("gone"), FieldValue::Tombstone);
        let decoded = decode("abc", &fields);
        assert!(decoded.is_ok_and(|r| r.attributes.len() == 1 && !r.attributes.contains_key("gone")));
    }

    #[test]
    fn test_tombstoned_mandatory_field_is_missing() {
        let mut fields = encode(&record());
        fields.insert(CREATION_TIME_KEY.into(), FieldValue::Tombstone);
        assert!(matches!(
            decode("abc", &fields),
            Err(SessionError::MissingField { field: CREATION_TIME_KEY, .. })
        ));
    }

    #[test]
    fn test_payload_keeps_tombstones() {
        let mut delta = FieldMap::new();
        delta.insert(attribute_field("x"), FieldValue::Tombstone);
        let payload = to_payload(&delta).unwrap_or_default();
        assert_eq!(from_payload(&payload).ok(), Some(delta));
    }

    proptest! {
        #[test]
        fn prop_decode_reverses_encode(
            created in 0i64..4_000_000_000_000,
            idle in 0i64..1_000_000_000,
            interval in -1i64..1_000_000,
            attributes in proptest::collection::hash_map("[a-zA-Z0-9:._-]{1,16}", proptest::collection::vec(any::<u8>(), 0..32), 0..8),
        ) {
            let record = SessionRecord {
                id: "p".into(),
                creation_time: DateTime::from_timestamp_millis(created).unwrap_or_default(),
                last_accessed_time: DateTime::from_timestamp_millis(created + idle).unwrap_or_default(),
                max_inactive_interval: Duration::seconds(interval),
                attributes,
            };
            let decoded = decode("p", &encode(&record));
            prop_assert_eq!(decoded, Ok(record));
        }
    }
}
