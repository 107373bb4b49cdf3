use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// A table row: column name to JSON value.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    Json,
}

impl ColumnType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Boolean => "boolean",
            Self::Json => "json",
        }
    }

    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Text => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Real => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Json => true,
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

/// Ordered column list for a stage's output table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn column(mut self, name: &str, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.to_string(),
            column_type,
            nullable: false,
        });
        self
    }

    #[must_use]
    pub fn nullable(mut self, name: &str, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.to_string(),
            column_type,
            nullable: true,
        });
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Checks a row against the schema: required columns present, types match,
    /// nothing undeclared.
    pub fn validate_row(&self, table: &str, row: &Row) -> Result<()> {
        let violation = |message: String| Error::SchemaViolation {
            table: table.to_string(),
            message,
        };

        for column in &self.columns {
            match row.get(&column.name) {
                None | Some(Value::Null) if column.nullable => {}
                None | Some(Value::Null) => {
                    return Err(violation(format!("missing value for column {}", column.name)));
                }
                Some(value) if !column.column_type.accepts(value) => {
                    return Err(violation(format!(
                        "column {} expects {}, got {}",
                        column.name, column.column_type, value
                    )));
                }
                Some(_) => {}
            }
        }

        if let Some(extra) = row.keys().find(|k| !self.has_column(k)) {
            return Err(violation(format!("undeclared column {extra}")));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    pub field_type: ColumnType,
    pub default: Option<Value>,
}

/// Typed keys a stage accepts from `metadata.config.<stage>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    pub fields: Vec<ConfigField>,
}

impl ConfigSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, name: &str, field_type: ColumnType, default: impl Into<Value>) -> Self {
        self.fields.push(ConfigField {
            name: name.to_string(),
            field_type,
            default: Some(default.into()),
        });
        self
    }

    #[must_use]
    pub fn required(mut self, name: &str, field_type: ColumnType) -> Self {
        self.fields.push(ConfigField {
            name: name.to_string(),
            field_type,
            default: None,
        });
        self
    }

    /// Validates supplied values and fills in defaults.
    pub fn resolve(&self, stage: &str, supplied: Option<&Value>) -> Result<StageConfig> {
        let invalid = |message: String| Error::InvalidConfig {
            stage: stage.to_string(),
            message,
        };

        let supplied = match supplied {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => return Err(invalid(format!("expected an object, got {other}"))),
        };

        if let Some(unknown) = supplied.keys().find(|k| !self.fields.iter().any(|f| &f.name == *k)) {
            return Err(invalid(format!("unknown key {unknown}")));
        }

        let mut values = Map::new();
        for field in &self.fields {
            match supplied.get(&field.name).or(field.default.as_ref()) {
                Some(value) if field.field_type.accepts(value) => {
                    values.insert(field.name.clone(), value.clone());
                }
                Some(value) => {
                    return Err(invalid(format!(
                        "{} expects {}, got {}",
                        field.name, field.field_type, value
                    )));
                }
                None => return Err(invalid(format!("missing required key {}", field.name))),
            }
        }

        Ok(StageConfig { values })
    }
}

/// Resolved per-stage configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageConfig {
    values: Map<String, Value>,
}

impl StageConfig {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(Value::as_u64)
    }

    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema::new()
            .column("document_id", ColumnType::Text)
            .column("count", ColumnType::Integer)
            .nullable("note", ColumnType::Text)
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_valid_rows() {
        let schema = schema();
        schema
            .validate_row("t", &row(json!({"document_id": "d", "count": 3})))
            .unwrap();
        schema
            .validate_row("t", &row(json!({"document_id": "d", "count": 3, "note": null})))
            .unwrap();
    }

    #[test]
    fn test_schema_violations() {
        let schema = schema();
        for bad in [
            json!({"count": 3}),
            json!({"document_id": "d", "count": "three"}),
            json!({"document_id": "d", "count": 3, "extra": 1}),
        ] {
            assert!(matches!(
                schema.validate_row("t", &row(bad)),
                Err(Error::SchemaViolation { .. })
            ));
        }
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let schema = ConfigSchema::new()
            .field("max_chars", ColumnType::Integer, 2000)
            .field("enabled", ColumnType::Boolean, true);

        let config = schema.resolve("sections", None).unwrap();
        assert_eq!(config.get_u64("max_chars"), Some(2000));

        let config = schema
            .resolve("sections", Some(&json!({"max_chars": 50})))
            .unwrap();
        assert_eq!(config.get_u64("max_chars"), Some(50));
        assert_eq!(config.get_bool("enabled"), Some(true));

        assert!(schema
            .resolve("sections", Some(&json!({"max_chars": "big"})))
            .is_err());
        assert!(schema
            .resolve("sections", Some(&json!({"unknown": 1})))
            .is_err());
    }
}
