//! Named-field records.

use super::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A row as seen by client code: field name to value.
///
/// Fields left out are treated as null when the record is encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, builder style.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Sets a field.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Returns a field, `None` when unset.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns a field, null when unset.
    #[must_use]
    pub fn value(&self, field: &str) -> Value {
        self.fields.get(field).cloned().unwrap_or(Value::Null)
    }

    /// Iterates over set fields.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_lookup() {
        let record = Record::new().with("id", 1).with("name", "ada").with("nick", None::<&str>);
        assert_eq!(record.get("id"), Some(&Value::Integer(1)));
        assert_eq!(record.value("name").as_text(), Some("ada"));
        assert!(record.value("nick").is_null());
        assert!(record.value("missing").is_null());
        assert_eq!(record.iter().count(), 3);
    }
}
