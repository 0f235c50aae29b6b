// Records
//
// A record is a flat JSON object plus its key (record key + partition
// path) and, once the index has located it, the file group it lives in.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schema::{RecordSchema, SchemaError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub record_key: String,
    pub partition_path: String,
}

impl RecordKey {
    pub fn new(record_key: impl Into<String>, partition_path: impl Into<String>) -> Self {
        Self {
            record_key: record_key.into(),
            partition_path: partition_path.into(),
        }
    }
}

/// File group currently holding a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordLocation {
    pub file_id: String,
    pub instant_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<RecordLocation>,
    pub data: Map<String, Value>,
}

impl Record {
    /// Build a record from a payload, deriving its key from the schema's
    /// key and partition fields.
    pub fn from_data(schema: &RecordSchema, data: Map<String, Value>) -> Result<Self, SchemaError> {
        schema.check_record(&data)?;

        let record_key = data
            .get(&schema.record_key_field)
            .and_then(key_string)
            .ok_or_else(|| SchemaError::MissingValue(schema.record_key_field.clone()))?;
        let partition_path = match &schema.partition_path_field {
            Some(field) => data.get(field).and_then(key_string).unwrap_or_default(),
            None => String::new(),
        };

        Ok(Self {
            key: RecordKey::new(record_key, partition_path),
            current_location: None,
            data,
        })
    }

    pub fn record_key(&self) -> &str {
        &self.key.record_key
    }

    pub fn partition_path(&self) -> &str {
        &self.key.partition_path
    }

    pub fn is_tagged(&self) -> bool {
        self.current_location.is_some()
    }

    pub fn with_location(mut self, location: Option<RecordLocation>) -> Self {
        self.current_location = location;
        self
    }
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType};
    use serde_json::json;

    #[test]
    fn key_and_partition_come_from_the_schema() {
        let schema = RecordSchema::new(
            vec![
                Field::new("id", FieldType::Int64, false),
                Field::new("day", FieldType::Utf8, false),
            ],
            "id",
            Some("day".into()),
        );
        let data = json!({"id": 7, "day": "2024/01/01"});

        let record = Record::from_data(&schema, data.as_object().unwrap().clone()).unwrap();
        assert_eq!(record.key, RecordKey::new("7", "2024/01/01"));
        assert!(!record.is_tagged());
    }

    #[test]
    fn unpartitioned_records_use_the_empty_partition() {
        let schema = RecordSchema::new(vec![Field::new("id", FieldType::Utf8, false)], "id", None);
        let data = json!({"id": "a"});

        let record = Record::from_data(&schema, data.as_object().unwrap().clone()).unwrap();
        assert_eq!(record.partition_path(), "");
    }
}
