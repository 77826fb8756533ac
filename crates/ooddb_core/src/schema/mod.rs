//! Typed tables, records and their byte encodings.

mod catalog;
mod record;
mod table;
mod value;

pub use catalog::Catalog;
pub use record::Record;
pub use table::{FieldCodec, FieldDef, FieldKind, ForeignKey, TableDef, TableSchema};
pub use value::Value;
