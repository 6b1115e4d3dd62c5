//! Field-level encoding between task records and Redis hashes.
//!
//! Every record field is stored as its own hash field so concurrent
//! writers keep last-write-wins semantics per field, matching the
//! relational backend.

use std::collections::HashMap;
use std::str::FromStr;

use jiff::Timestamp;
use surveyor_core::store::{StoreError, StoreResult};
use surveyor_core::{TaskRecord, TaskStatus};

/// Hash fields that make up one record.
pub const FIELD_ID: &str = "id";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_PARAMS: &str = "params";
pub const FIELD_ORIGINAL_TOPIC: &str = "original_topic";
pub const FIELD_EXPECTED_RESULT_KEY: &str = "expected_result_key";
pub const FIELD_USER_ID: &str = "user_id";
pub const FIELD_ERROR: &str = "error";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_UPDATED_AT: &str = "updated_at";
pub const FIELD_START_TIME: &str = "start_time";
pub const FIELD_END_TIME: &str = "end_time";
pub const FIELD_EXECUTION_SECONDS: &str = "execution_seconds";
pub const FIELD_EXPIRE_AT: &str = "expire_at";

/// Encodes a record as hash field/value pairs. Absent optionals are
/// omitted rather than stored as empty strings.
pub fn encode_record(record: &TaskRecord) -> StoreResult<Vec<(&'static str, String)>> {
    let mut fields = vec![
        (FIELD_ID, record.id.clone()),
        (FIELD_STATUS, record.status.to_string()),
        (FIELD_PARAMS, serde_json::to_string(&record.params)?),
        (FIELD_CREATED_AT, record.created_at.to_string()),
        (FIELD_UPDATED_AT, record.updated_at.to_string()),
        (FIELD_EXPIRE_AT, record.expire_at.to_string()),
    ];
    if let Some(topic) = &record.original_topic {
        fields.push((FIELD_ORIGINAL_TOPIC, topic.clone()));
    }
    if let Some(key) = &record.expected_result_key {
        fields.push((FIELD_EXPECTED_RESULT_KEY, key.clone()));
    }
    if let Some(user_id) = &record.user_id {
        fields.push((FIELD_USER_ID, user_id.clone()));
    }
    if let Some(error) = &record.error {
        fields.push((FIELD_ERROR, error.clone()));
    }
    if let Some(start) = record.start_time {
        fields.push((FIELD_START_TIME, start.to_string()));
    }
    if let Some(end) = record.end_time {
        fields.push((FIELD_END_TIME, end.to_string()));
    }
    if let Some(seconds) = record.execution_seconds {
        fields.push((FIELD_EXECUTION_SECONDS, seconds.to_string()));
    }
    Ok(fields)
}

fn parse_timestamp(map: &HashMap<String, String>, field: &str) -> StoreResult<Timestamp> {
    let raw = map
        .get(field)
        .ok_or_else(|| StoreError::backend(format!("hash is missing field {field}")))?;
    Timestamp::from_str(raw)
        .map_err(|err| StoreError::backend(format!("bad timestamp in {field}: {err}")))
}

fn parse_optional_timestamp(
    map: &HashMap<String, String>,
    field: &str,
) -> StoreResult<Option<Timestamp>> {
    map.get(field)
        .map(|raw| {
            Timestamp::from_str(raw)
                .map_err(|err| StoreError::backend(format!("bad timestamp in {field}: {err}")))
        })
        .transpose()
}

/// Decodes a hash map back into a record.
pub fn decode_record(map: HashMap<String, String>) -> StoreResult<TaskRecord> {
    let id = map
        .get(FIELD_ID)
        .ok_or_else(|| StoreError::backend("hash is missing the id field"))?
        .clone();
    let status_label = map
        .get(FIELD_STATUS)
        .ok_or_else(|| StoreError::backend("hash is missing the status field"))?;
    let status = TaskStatus::from_str(status_label)
        .map_err(|_| StoreError::InvalidStatus(status_label.clone()))?;
    let params = match map.get(FIELD_PARAMS) {
        Some(raw) => serde_json::from_str(raw)?,
        None => serde_json::Value::Null,
    };

    Ok(TaskRecord {
        id,
        status,
        params,
        original_topic: map.get(FIELD_ORIGINAL_TOPIC).cloned(),
        expected_result_key: map.get(FIELD_EXPECTED_RESULT_KEY).cloned(),
        user_id: map.get(FIELD_USER_ID).cloned(),
        error: map.get(FIELD_ERROR).cloned(),
        created_at: parse_timestamp(&map, FIELD_CREATED_AT)?,
        updated_at: parse_timestamp(&map, FIELD_UPDATED_AT)?,
        start_time: parse_optional_timestamp(&map, FIELD_START_TIME)?,
        end_time: parse_optional_timestamp(&map, FIELD_END_TIME)?,
        execution_seconds: map
            .get(FIELD_EXECUTION_SECONDS)
            .map(|raw| {
                raw.parse::<f64>().map_err(|err| {
                    StoreError::backend(format!("bad execution_seconds: {err}"))
                })
            })
            .transpose()?,
        expire_at: parse_timestamp(&map, FIELD_EXPIRE_AT)?,
    })
}

/// Encodes one named field for a partial update.
pub fn encode_field(
    record: &TaskRecord,
    field: &str,
) -> StoreResult<(&'static str, String)> {
    match field {
        "params" => Ok((FIELD_PARAMS, serde_json::to_string(&record.params)?)),
        "original_topic" => Ok((
            FIELD_ORIGINAL_TOPIC,
            record.original_topic.clone().unwrap_or_default(),
        )),
        "expected_result_key" => Ok((
            FIELD_EXPECTED_RESULT_KEY,
            record.expected_result_key.clone().unwrap_or_default(),
        )),
        "user_id" => Ok((FIELD_USER_ID, record.user_id.clone().unwrap_or_default())),
        "error" => Ok((FIELD_ERROR, record.error.clone().unwrap_or_default())),
        other => Err(StoreError::UnknownField(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let mut record = TaskRecord::new("t", serde_json::json!({"topic": "x"}), 60);
        record.apply_status(TaskStatus::Processing, None);
        record.original_topic = Some("x".into());

        let fields = encode_record(&record).unwrap();
        let map: HashMap<String, String> = fields
            .into_iter()
            .map(|(field, value)| (field.to_string(), value))
            .collect();
        let back = decode_record(map).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn missing_fields_surface_as_backend_errors() {
        let map = HashMap::from([(FIELD_ID.to_string(), "t".to_string())]);
        assert!(decode_record(map).is_err());
    }

    #[test]
    fn unknown_partial_field_is_rejected() {
        let record = TaskRecord::new("t", serde_json::Value::Null, 60);
        assert!(matches!(
            encode_field(&record, "status"),
            Err(StoreError::UnknownField(_))
        ));
    }
}
