//! Table declarations and their resolved, validated form.

use super::record::Record;
use super::value::Value;
use crate::codec::{decode, encode};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Integer,
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Bytes,
    /// Milliseconds since the Unix epoch, never negative.
    Timestamp,
}

/// Declaration of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Declared type.
    pub kind: FieldKind,
    /// Whether null is allowed.
    pub nullable: bool,
    /// Whether the field is part of the primary key.
    pub primary_key: bool,
    /// Maximum length for text and bytes.
    pub max_len: Option<usize>,
}

impl FieldDef {
    /// Declares a non-null field.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            primary_key: false,
            max_len: None,
        }
    }

    /// Marks the field as part of the primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Allows null.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Limits text or bytes length.
    #[must_use]
    pub fn max_len(mut self, len: usize) -> Self {
        self.max_len = Some(len);
        self
    }
}

/// Foreign key: `fields` of this table reference the primary key of
/// `references`, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referencing fields.
    pub fields: Vec<String>,
    /// Referenced table.
    pub references: String,
}

impl ForeignKey {
    /// Declares a foreign key.
    pub fn new<I, S>(fields: I, references: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            references: references.into(),
        }
    }
}

/// Declaration of a table.
///
/// A table belongs to exactly one data package, the unit peers agree to
/// replicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Data package.
    pub package: String,
    /// Fields in storage order.
    pub fields: Vec<FieldDef>,
    /// Foreign keys.
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDef {
    /// Starts a declaration.
    pub fn new(name: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            package: package.into(),
            fields: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }
}

/// Validator chosen per field when a table is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCodec {
    /// Accepts booleans.
    Bool,
    /// Accepts integers within `min..=max`.
    Integer {
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },
    /// Accepts text up to `max_len` bytes.
    Text {
        /// Length limit.
        max_len: usize,
    },
    /// Accepts byte strings up to `max_len` bytes.
    Bytes {
        /// Length limit.
        max_len: usize,
    },
}

impl FieldCodec {
    /// Selects the codec of a field.
    #[must_use]
    pub fn for_field(field: &FieldDef) -> Self {
        let max_len = field.max_len.unwrap_or(usize::MAX);
        match field.kind {
            FieldKind::Bool => Self::Bool,
            FieldKind::Integer => Self::Integer {
                min: i64::MIN,
                max: i64::MAX,
            },
            FieldKind::Timestamp => Self::Integer { min: 0, max: i64::MAX },
            FieldKind::Text => Self::Text { max_len },
            FieldKind::Bytes => Self::Bytes { max_len },
        }
    }

    /// Checks a non-null value.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match (self, value) {
            (Self::Bool, Value::Bool(_)) => Ok(()),
            (Self::Integer { min, max }, Value::Integer(v)) => {
                if v < min || v > max {
                    Err(format!("{v} is outside {min}..={max}"))
                } else {
                    Ok(())
                }
            }
            (Self::Text { max_len }, Value::Text(v)) if v.len() > *max_len => {
                Err(format!("text of {} bytes exceeds {max_len}", v.len()))
            }
            (Self::Bytes { max_len }, Value::Bytes(v)) if v.len() > *max_len => {
                Err(format!("{} bytes exceed {max_len}", v.len()))
            }
            (Self::Text { .. }, Value::Text(_)) | (Self::Bytes { .. }, Value::Bytes(_)) => Ok(()),
            (codec, other) => Err(format!(
                "expected {}, got {}",
                codec.expected(),
                other.type_name()
            )),
        }
    }

    fn expected(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Integer { .. } => "integer",
            Self::Text { .. } => "text",
            Self::Bytes { .. } => "bytes",
        }
    }
}

/// A registered table: declaration plus resolved codecs.
#[derive(Debug, Clone)]
pub struct TableSchema {
    def: TableDef,
    codecs: Vec<FieldCodec>,
    primary_key: Vec<usize>,
    fingerprint: u64,
}

impl TableSchema {
    /// Resolves a declaration.
    ///
    /// Foreign keys are checked against other tables by the catalog.
    pub fn resolve(def: TableDef) -> CoreResult<Self> {
        if def.name.is_empty() || def.name.starts_with("__") {
            return Err(CoreError::invalid_operation(format!(
                "invalid table name '{}'",
                def.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for field in &def.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(CoreError::field(&def.name, &field.name, "declared twice"));
            }
            if field.primary_key && field.nullable {
                return Err(CoreError::field(
                    &def.name,
                    &field.name,
                    "primary key fields cannot be nullable",
                ));
            }
        }
        let primary_key: Vec<usize> = def
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.primary_key)
            .map(|(i, _)| i)
            .collect();
        if primary_key.is_empty() {
            return Err(CoreError::invalid_operation(format!(
                "table '{}' has no primary key",
                def.name
            )));
        }
        for fk in &def.foreign_keys {
            for name in &fk.fields {
                if !def.fields.iter().any(|f| &f.name == name) {
                    return Err(CoreError::field(&def.name, name, "unknown foreign key field"));
                }
            }
        }

        let codecs = def.fields.iter().map(FieldCodec::for_field).collect();
        let digest = Sha256::digest(encode(&def)?);
        let mut fp = [0u8; 8];
        fp.copy_from_slice(&digest[..8]);

        Ok(Self {
            def,
            codecs,
            primary_key,
            fingerprint: u64::from_be_bytes(fp),
        })
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Data package.
    #[must_use]
    pub fn package(&self) -> &str {
        &self.def.package
    }

    /// The declaration.
    #[must_use]
    pub fn def(&self) -> &TableDef {
        &self.def
    }

    /// Stable digest of the declaration.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Names of the primary key fields.
    pub fn primary_key_fields(&self) -> impl Iterator<Item = &str> {
        self.primary_key.iter().map(|&i| self.def.fields[i].name.as_str())
    }

    /// Checks a record against the declaration.
    pub fn validate(&self, record: &Record) -> CoreResult<()> {
        for (name, _) in record.iter() {
            if !self.def.fields.iter().any(|f| f.name == name) {
                return Err(CoreError::field(self.name(), name, "unknown field"));
            }
        }
        for (field, codec) in self.def.fields.iter().zip(&self.codecs) {
            match record.get(&field.name) {
                None | Some(Value::Null) => {
                    if !field.nullable {
                        return Err(CoreError::field(self.name(), &field.name, "value required"));
                    }
                }
                Some(value) => codec
                    .check(value)
                    .map_err(|m| CoreError::field(self.name(), &field.name, m))?,
            }
        }
        Ok(())
    }

    /// Validates and encodes a record as a positional row.
    pub fn encode_row(&self, record: &Record) -> CoreResult<Vec<u8>> {
        self.validate(record)?;
        let values: Vec<Value> = self.def.fields.iter().map(|f| record.value(&f.name)).collect();
        encode(&values)
    }

    /// Decodes a positional row.
    pub fn decode_row(&self, row: &[u8]) -> CoreResult<Record> {
        let values: Vec<Value> = decode(row)?;
        if values.len() != self.def.fields.len() {
            return Err(CoreError::Codec(format!(
                "row of '{}' has {} values, expected {}",
                self.name(),
                values.len(),
                self.def.fields.len()
            )));
        }
        let mut record = Record::new();
        for (field, value) in self.def.fields.iter().zip(values) {
            if !value.is_null() {
                record.set(field.name.clone(), value);
            }
        }
        Ok(record)
    }

    /// Serialized primary key of a record.
    pub fn primary_key(&self, record: &Record) -> CoreResult<Vec<u8>> {
        let values: Vec<Value> = self
            .primary_key
            .iter()
            .map(|&i| record.value(&self.def.fields[i].name))
            .collect();
        self.key_from_values(&values)
    }

    /// Serializes primary key values given in key order.
    pub fn key_from_values(&self, values: &[Value]) -> CoreResult<Vec<u8>> {
        if values.len() != self.primary_key.len() {
            return Err(CoreError::invalid_operation(format!(
                "table '{}' has a {}-field primary key, got {} values",
                self.name(),
                self.primary_key.len(),
                values.len()
            )));
        }
        for (&i, value) in self.primary_key.iter().zip(values) {
            let field = &self.def.fields[i];
            if value.is_null() {
                return Err(CoreError::field(self.name(), &field.name, "value required"));
            }
            self.codecs[i]
                .check(value)
                .map_err(|m| CoreError::field(self.name(), &field.name, m))?;
        }
        encode(values)
    }

    /// Primary key values of a serialized key.
    pub fn key_values(&self, key: &[u8]) -> CoreResult<Vec<Value>> {
        decode(key)
    }

    /// Serialized key of the row referenced through `fk`, or `None` when
    /// any referencing field is null.
    pub fn referenced_key(&self, record: &Record, fk: &ForeignKey) -> CoreResult<Option<Vec<u8>>> {
        let values: Vec<Value> = fk.fields.iter().map(|f| record.value(f)).collect();
        if values.iter().any(Value::is_null) {
            return Ok(None);
        }
        encode(&values).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> TableSchema {
        TableSchema::resolve(
            TableDef::new("person", "directory")
                .field(FieldDef::new("id", FieldKind::Integer).primary_key())
                .field(FieldDef::new("name", FieldKind::Text).max_len(8))
                .field(FieldDef::new("born", FieldKind::Timestamp).nullable()),
        )
        .unwrap()
    }

    #[test]
    fn row_round_trip_drops_nulls() {
        let schema = person();
        let record = Record::new().with("id", 1).with("name", "ada");
        let row = schema.encode_row(&record).unwrap();
        assert_eq!(schema.decode_row(&row).unwrap(), record);
    }

    #[test]
    fn field_errors_name_the_field() {
        let schema = person();
        let cases = [
            (Record::new().with("id", 1), "name"),
            (Record::new().with("id", 1).with("name", 5), "name"),
            (Record::new().with("id", 1).with("name", "too long a name"), "name"),
            (Record::new().with("id", 1).with("name", "a").with("born", -1), "born"),
            (Record::new().with("id", 1).with("name", "a").with("extra", 1), "extra"),
        ];
        for (record, expected) in cases {
            match schema.encode_row(&record) {
                Err(CoreError::Field { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected field error on {expected}, got {other:?}"),
            }
        }
    }

    #[test]
    fn primary_key_is_canonical() {
        let schema = person();
        let a = schema
            .primary_key(&Record::new().with("id", 7).with("name", "a"))
            .unwrap();
        let b = schema.key_from_values(&[Value::Integer(7)]).unwrap();
        assert_eq!(a, b);
        assert_eq!(schema.key_values(&a).unwrap(), vec![Value::Integer(7)]);
        assert!(schema.key_from_values(&[]).is_err());
        assert!(schema.key_from_values(&[Value::Text("7".into())]).is_err());
    }

    #[test]
    fn declarations_are_checked() {
        assert!(TableSchema::resolve(
            TableDef::new("nokey", "p").field(FieldDef::new("a", FieldKind::Bool))
        )
        .is_err());
        assert!(TableSchema::resolve(
            TableDef::new("__internal", "p")
                .field(FieldDef::new("a", FieldKind::Bool).primary_key())
        )
        .is_err());
        assert!(TableSchema::resolve(
            TableDef::new("dup", "p")
                .field(FieldDef::new("a", FieldKind::Bool).primary_key())
                .field(FieldDef::new("a", FieldKind::Text))
        )
        .is_err());
    }

    #[test]
    fn fingerprint_tracks_declaration() {
        let a = person();
        let b = TableSchema::resolve(a.def().clone().field(FieldDef::new("x", FieldKind::Bool)))
            .unwrap();
        assert_eq!(a.fingerprint(), person().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
