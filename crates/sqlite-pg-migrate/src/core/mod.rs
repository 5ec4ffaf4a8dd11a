//! Core abstractions shared by every stage.
//!
//! - [`flag`]: boolean flag words and numeric flags
//! - [`schema`]: table, column, and constraint descriptors
//! - [`value`]: owned SQL values and row batches
//! - [`traits`]: source and target seams
//! - [`identifier`]: identifier validation and quoting
//! - [`temporal`]: date and time parsing for SQLite encodings

pub mod flag;
pub mod identifier;
pub mod schema;
pub mod temporal;
pub mod traits;
pub mod value;

pub use schema::{Column, ForeignKey, Index, Table, TableKind, TargetType};
pub use traits::{ReadOptions, SourceReader, TargetColumn, TargetWriter, WriteJob};
pub use value::{Batch, SqlValue};
