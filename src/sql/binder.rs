use crate::core::{DataType, MappingError, Result, Value};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use uuid::Uuid;

type Conversion = Rc<dyn Fn(&Value) -> Result<Value>>;

/// Converts values between their mapped type and the type stored in a column.
#[derive(Clone)]
pub struct ValueBinder {
    name: String,
    storage_type: DataType,
    to_storage: Conversion,
    from_storage: Conversion,
}

impl ValueBinder {
    pub fn new(
        name: &str,
        storage_type: DataType,
        to_storage: impl Fn(&Value) -> Result<Value> + 'static,
        from_storage: impl Fn(&Value) -> Result<Value> + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            storage_type,
            to_storage: Rc::new(to_storage),
            from_storage: Rc::new(from_storage),
        }
    }

    /// Stores values unchanged after checking their type.
    pub fn passthrough(data_type: DataType) -> Self {
        let name = data_type.to_string();
        let check_type = data_type.clone();
        let check = move |value: &Value| {
            if check_type.is_compatible(value) {
                Ok(value.clone())
            } else {
                Err(MappingError::TypeMismatch(format!(
                    "{} cannot be bound as {}",
                    value.type_name(),
                    check_type
                )))
            }
        };
        Self::new(&name, data_type, check.clone(), check)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_type(&self) -> &DataType {
        &self.storage_type
    }

    /// `Null` is never handed to the conversion.
    pub fn to_storage(&self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        (self.to_storage)(value)
    }

    pub fn from_storage(&self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        (self.from_storage)(value)
    }
}

impl fmt::Debug for ValueBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueBinder")
            .field("name", &self.name)
            .field("storage_type", &self.storage_type)
            .finish()
    }
}

fn timestamp_binder() -> ValueBinder {
    ValueBinder::new(
        "TIMESTAMP",
        DataType::Text,
        |value| match value {
            Value::Timestamp(t) => Ok(Value::Text(t.to_rfc3339())),
            other => Err(MappingError::TypeMismatch(format!(
                "{} cannot be bound as TIMESTAMP",
                other.type_name()
            ))),
        },
        |value| match value {
            Value::Text(s) => DateTime::parse_from_rfc3339(s)
                .map(|t| Value::Timestamp(t.with_timezone(&Utc)))
                .map_err(|e| MappingError::TypeMismatch(format!("Invalid timestamp '{}': {}", s, e))),
            Value::Timestamp(t) => Ok(Value::Timestamp(*t)),
            other => Err(MappingError::TypeMismatch(format!(
                "{} cannot be read as TIMESTAMP",
                other.type_name()
            ))),
        },
    )
}

fn uuid_binder() -> ValueBinder {
    ValueBinder::new(
        "UUID",
        DataType::Text,
        |value| match value {
            Value::Uuid(u) => Ok(Value::Text(u.to_string())),
            other => Err(MappingError::TypeMismatch(format!(
                "{} cannot be bound as UUID",
                other.type_name()
            ))),
        },
        |value| match value {
            Value::Text(s) => Uuid::parse_str(s)
                .map(Value::Uuid)
                .map_err(|e| MappingError::TypeMismatch(format!("Invalid uuid '{}': {}", s, e))),
            Value::Uuid(u) => Ok(Value::Uuid(*u)),
            other => Err(MappingError::TypeMismatch(format!(
                "{} cannot be read as UUID",
                other.type_name()
            ))),
        },
    )
}

/// Binders by mapped type, overridable per column.
#[derive(Debug, Clone)]
pub struct BinderRegistry {
    by_type: HashMap<DataType, ValueBinder>,
    by_column: HashMap<(String, String), ValueBinder>,
}

impl BinderRegistry {
    /// A registry without any binder.
    pub fn empty() -> Self {
        Self {
            by_type: HashMap::new(),
            by_column: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for data_type in [DataType::Integer, DataType::Float, DataType::Text, DataType::Boolean] {
            registry.register(data_type.clone(), ValueBinder::passthrough(data_type));
        }
        registry.register(DataType::Timestamp, timestamp_binder());
        registry.register(DataType::Uuid, uuid_binder());
        registry
    }

    pub fn register(&mut self, data_type: DataType, binder: ValueBinder) {
        self.by_type.insert(data_type, binder);
    }

    pub fn register_column(&mut self, table: &str, column: &str, binder: ValueBinder) {
        self.by_column
            .insert((table.to_string(), column.to_string()), binder);
    }

    /// Column binders win over type binders.
    pub fn resolve(&self, table: &str, column: &str, data_type: &DataType) -> Result<ValueBinder> {
        if let Some(binder) = self.by_column.get(&(table.to_string(), column.to_string())) {
            return Ok(binder.clone());
        }
        self.by_type.get(data_type).cloned().ok_or_else(|| {
            MappingError::MissingBinder(format!(
                "column {}.{} of type {}",
                table, column, data_type
            ))
        })
    }
}

impl Default for BinderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_are_stored_as_text() {
        let registry = BinderRegistry::with_defaults();
        let binder = registry.resolve("event", "at", &DataType::Timestamp).unwrap();
        let now = Utc::now();
        let stored = binder.to_storage(&Value::Timestamp(now)).unwrap();
        assert!(matches!(stored, Value::Text(_)));
        assert_eq!(binder.from_storage(&stored).unwrap(), Value::Timestamp(now));
        assert_eq!(binder.storage_type(), &DataType::Text);
    }

    #[test]
    fn test_custom_type_requires_explicit_binder() {
        let mut registry = BinderRegistry::with_defaults();
        let money = DataType::Custom("Money".into());
        let err = registry.resolve("order", "total", &money).unwrap_err();
        assert!(matches!(err, MappingError::MissingBinder(_)));

        registry.register_column("order", "total", ValueBinder::passthrough(DataType::Integer));
        assert!(registry.resolve("order", "total", &money).is_ok());
    }

    #[test]
    fn test_passthrough_rejects_wrong_type() {
        let binder = ValueBinder::passthrough(DataType::Integer);
        assert!(binder.to_storage(&Value::from("x")).is_err());
        assert_eq!(binder.to_storage(&Value::Null).unwrap(), Value::Null);
    }
}
