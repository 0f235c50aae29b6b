// Record Schema
//
// Flat record schemas: typed, optionally nullable fields, one of which
// carries the record key and (optionally) one the partition path.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field as ArrowField, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema has no fields")]
    Empty,

    #[error("duplicate field `{0}`")]
    DuplicateField(String),

    #[error("field `{0}` is not part of the schema")]
    UnknownField(String),

    #[error("record key field `{0}` is missing or nullable")]
    InvalidKeyField(String),

    #[error("field `{field}` has type {found:?}, expected {expected:?}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        found: FieldType,
    },

    #[error("new field `{0}` must be nullable")]
    NonNullableAddition(String),

    #[error("table field `{0}` is missing from the write schema")]
    MissingField(String),

    #[error("record is missing required value for `{0}`")]
    MissingValue(String),

    #[error("value for `{field}` does not match type {expected:?}")]
    InvalidValue { field: String, expected: FieldType },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Utf8,
    Int64,
    Float64,
    Boolean,
}

impl FieldType {
    fn arrow_type(&self) -> DataType {
        match self {
            FieldType::Utf8 => DataType::Utf8,
            FieldType::Int64 => DataType::Int64,
            FieldType::Float64 => DataType::Float64,
            FieldType::Boolean => DataType::Boolean,
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::Utf8 => value.is_string(),
            FieldType::Int64 => value.is_i64(),
            FieldType::Float64 => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RecordSchema {
    pub fields: Vec<Field>,
    pub record_key_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_path_field: Option<String>,
}

impl RecordSchema {
    pub fn new(
        fields: Vec<Field>,
        record_key_field: impl Into<String>,
        partition_path_field: Option<String>,
    ) -> Self {
        Self {
            fields,
            record_key_field: record_key_field.into(),
            partition_path_field,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.fields.is_empty() {
            return Err(SchemaError::Empty);
        }
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
        }

        match self.field(&self.record_key_field) {
            Some(key) if !key.nullable => {}
            _ => return Err(SchemaError::InvalidKeyField(self.record_key_field.clone())),
        }
        if let Some(partition) = &self.partition_path_field {
            if self.field(partition).is_none() {
                return Err(SchemaError::UnknownField(partition.clone()));
            }
        }
        Ok(())
    }

    /// Check a writer schema against the table's current schema.
    ///
    /// Every table field must still be present with the same type; fields
    /// the table does not know yet must be nullable.
    pub fn check_compatible_with(&self, table: &RecordSchema) -> Result<(), SchemaError> {
        for existing in &table.fields {
            let field = self
                .field(&existing.name)
                .ok_or_else(|| SchemaError::MissingField(existing.name.clone()))?;
            if field.field_type != existing.field_type {
                return Err(SchemaError::TypeMismatch {
                    field: existing.name.clone(),
                    expected: existing.field_type,
                    found: field.field_type,
                });
            }
        }

        if let Some(added) = self
            .fields
            .iter()
            .find(|f| table.field(&f.name).is_none() && !f.nullable)
        {
            return Err(SchemaError::NonNullableAddition(added.name.clone()));
        }

        if self.record_key_field != table.record_key_field {
            return Err(SchemaError::InvalidKeyField(self.record_key_field.clone()));
        }
        Ok(())
    }

    /// Validate one record payload.
    pub fn check_record(&self, data: &Map<String, Value>) -> Result<(), SchemaError> {
        if let Some(unknown) = data.keys().find(|k| self.field(k).is_none()) {
            return Err(SchemaError::UnknownField(unknown.clone()));
        }

        for field in &self.fields {
            match data.get(&field.name) {
                None | Some(Value::Null) if field.nullable => {}
                None | Some(Value::Null) => {
                    return Err(SchemaError::MissingValue(field.name.clone()))
                }
                Some(value) if !field.field_type.accepts(value) => {
                    return Err(SchemaError::InvalidValue {
                        field: field.name.clone(),
                        expected: field.field_type,
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn to_arrow(&self) -> SchemaRef {
        let fields: Vec<ArrowField> = self
            .fields
            .iter()
            .map(|f| ArrowField::new(&f.name, f.field_type.arrow_type(), f.nullable))
            .collect();
        Arc::new(Schema::new(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table_schema() -> RecordSchema {
        RecordSchema::new(
            vec![
                Field::new("id", FieldType::Utf8, false),
                Field::new("region", FieldType::Utf8, false),
                Field::new("amount", FieldType::Int64, true),
            ],
            "id",
            Some("region".to_string()),
        )
    }

    #[test]
    fn valid_schema_passes() {
        assert_eq!(table_schema().validate(), Ok(()));
    }

    #[test]
    fn key_field_must_exist_and_be_required() {
        let mut schema = table_schema();
        schema.record_key_field = "amount".into();
        assert!(matches!(schema.validate(), Err(SchemaError::InvalidKeyField(_))));

        schema.record_key_field = "nope".into();
        assert!(matches!(schema.validate(), Err(SchemaError::InvalidKeyField(_))));
    }

    #[test]
    fn nullable_additions_are_compatible() {
        let mut writer = table_schema();
        writer.fields.push(Field::new("note", FieldType::Utf8, true));
        assert_eq!(writer.check_compatible_with(&table_schema()), Ok(()));

        writer.fields.push(Field::new("flag", FieldType::Boolean, false));
        assert_eq!(
            writer.check_compatible_with(&table_schema()),
            Err(SchemaError::NonNullableAddition("flag".into()))
        );
    }

    #[test]
    fn dropping_or_retyping_fields_is_incompatible() {
        let mut writer = table_schema();
        writer.fields.pop();
        assert_eq!(
            writer.check_compatible_with(&table_schema()),
            Err(SchemaError::MissingField("amount".into()))
        );

        let mut writer = table_schema();
        writer.fields[2].field_type = FieldType::Float64;
        assert!(matches!(
            writer.check_compatible_with(&table_schema()),
            Err(SchemaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn records_are_type_checked() {
        let schema = table_schema();
        let ok = json!({"id": "k1", "region": "eu", "amount": 4});
        assert_eq!(schema.check_record(ok.as_object().unwrap()), Ok(()));

        let missing = json!({"id": "k1"});
        assert_eq!(
            schema.check_record(missing.as_object().unwrap()),
            Err(SchemaError::MissingValue("region".into()))
        );

        let wrong = json!({"id": "k1", "region": "eu", "amount": "four"});
        assert!(matches!(
            schema.check_record(wrong.as_object().unwrap()),
            Err(SchemaError::InvalidValue { .. })
        ));
    }

    #[test]
    fn converts_to_arrow() {
        let arrow = table_schema().to_arrow();
        assert_eq!(arrow.fields().len(), 3);
        assert_eq!(arrow.field(2).data_type(), &DataType::Int64);
        assert!(arrow.field(2).is_nullable());
    }
}
