// Storage abstraction - the pluggable persistence contract

//! # Storage Layer
//!
//! The engine persists through a narrow, pluggable driver contract:
//! schema-described tables of flat string records, addressed by
//! `form_path`-style names. Two implementations ship with the crate:
//!
//! - [`memory::MemoryDriver`]: concurrent in-memory tables for
//!   development and tests
//! - [`delimited::DelimitedFileDriver`]: semicolon-delimited files, one
//!   per table, the operator-diffable artefact
//!
//! Backends only store scalars. The upper layers (notably
//! [`repository::ProcessRepository`]) flatten nested values to JSON-encoded
//! strings on the way down and inflate them on the way up, so any backend
//! that can hold strings can hold the whole engine.
//!
//! Every record carries a driver-assigned identifier in the reserved
//! [`RECORD_ID_FIELD`] column (the codec from [`crate::models::ident`])
//! unless the caller supplies its own. The id-based operations are the only
//! CRUD surface; there is no row-offset addressing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Result;

pub mod delimited;
pub mod memory;
pub mod repository;

/// A flat record as the driver stores it: column name to scalar string.
pub type Record = HashMap<String, String>;

/// Reserved column holding the record identifier.
pub const RECORD_ID_FIELD: &str = "_id";

/// Field types a schema may declare, mirroring the HTML form vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldType {
    Text,
    Textarea,
    Email,
    Tel,
    Url,
    Search,
    Password,
    Number,
    Checkbox,
    Date,
    Time,
    DatetimeLocal,
    Month,
    Week,
    Select,
    Radio,
    Color,
    Range,
    Hidden,
}

impl FieldType {
    /// Default scalar for a newly added column of this type.
    pub fn default_value(&self) -> &'static str {
        match self {
            FieldType::Number | FieldType::Range => "0",
            FieldType::Checkbox => "False",
            _ => "",
        }
    }
}

/// One column of a table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    #[serde(default)]
    pub required: bool,

    /// Decimal places for number columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimal: Option<u32>,
}

impl FieldSpec {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        FieldSpec {
            name: name.to_string(),
            field_type,
            required: false,
            decimal: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Schema describing one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub title: String,
    pub fields: Vec<FieldSpec>,
}

impl TableSchema {
    pub fn new(title: &str, fields: Vec<FieldSpec>) -> Self {
        TableSchema {
            title: title.to_string(),
            fields,
        }
    }

    /// Column names in declaration order.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// The persistence contract every backend must satisfy.
///
/// All operations are async and fallible. Reads of a missing table are not
/// errors where the contract says so (`read_all` on an absent audit table
/// returns empty at the repository level); writes to an unavailable backend
/// surface retryable [`crate::FlowboardError::Storage`] errors.
#[async_trait::async_trait]
pub trait StorageDriver: Send + Sync {
    /// Create the backing table if it does not exist.
    async fn create_storage(&self, path: &str, schema: &TableSchema) -> Result<bool>;

    /// Read every record, oldest first.
    async fn read_all(&self, path: &str, schema: &TableSchema) -> Result<Vec<Record>>;

    /// Read one record by its [`RECORD_ID_FIELD`] value.
    async fn read_by_id(
        &self,
        path: &str,
        schema: &TableSchema,
        id: &str,
    ) -> Result<Option<Record>>;

    /// Append one record, assigning an id when the record carries none.
    /// Returns the record id.
    async fn create(&self, path: &str, schema: &TableSchema, record: Record) -> Result<String>;

    /// Replace the record with the given id. Returns false when absent.
    async fn update_by_id(
        &self,
        path: &str,
        schema: &TableSchema,
        id: &str,
        record: Record,
    ) -> Result<bool>;

    /// Delete the record with the given id. Returns false when absent.
    async fn delete_by_id(&self, path: &str, schema: &TableSchema, id: &str) -> Result<bool>;

    /// Whether the table exists at all.
    async fn exists(&self, path: &str) -> bool;

    /// Whether the table holds at least one record.
    async fn has_data(&self, path: &str) -> Result<bool>;

    /// Rewrite the table from `old` to `new` column layout, backing the
    /// previous contents up first. Added columns receive type defaults;
    /// removed columns are dropped; shared columns carry over by name.
    async fn migrate_schema(
        &self,
        path: &str,
        old: &TableSchema,
        new: &TableSchema,
    ) -> Result<bool>;

    /// Append many records in one call. Returns the ids in input order.
    async fn bulk_create(
        &self,
        path: &str,
        schema: &TableSchema,
        records: Vec<Record>,
    ) -> Result<Vec<String>>;

    /// Case-insensitive substring search over one column. Returns matching
    /// record ids, bounded by `limit`.
    async fn search(
        &self,
        path: &str,
        schema: &TableSchema,
        field: &str,
        q: &str,
        limit: usize,
    ) -> Result<Vec<String>>;
}
