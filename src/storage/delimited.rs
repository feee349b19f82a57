// Delimited flat-file storage driver

//! # Delimited File Driver
//!
//! One file per table, one record per line, columns joined by a delimiter
//! (semicolon by default). The format exists because operators want a
//! diffable artefact: a process table or audit log can be inspected and
//! versioned with ordinary text tooling.
//!
//! Layout per line: the record id in the reserved first column, then the
//! schema's columns in declaration order. Column values are escaped
//! (`\\`, `\;`, `\n`) so JSON-encoded structured columns survive the
//! round-trip. Schema migration writes a `.bak` copy of the previous file
//! before rewriting.
//!
//! A per-table mutex serializes file access; the delimited backend handles
//! one operation at a time per table.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::models::ident;
use crate::storage::{Record, StorageDriver, TableSchema, RECORD_ID_FIELD};
use crate::Result;

/// [`StorageDriver`] writing semicolon-delimited text files.
pub struct DelimitedFileDriver {
    base_dir: PathBuf,
    delimiter: char,
    extension: String,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DelimitedFileDriver {
    /// Driver rooted at `base_dir` with the default `;` delimiter and
    /// `.txt` extension.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        DelimitedFileDriver {
            base_dir: base_dir.into(),
            delimiter: ';',
            extension: ".txt".to_string(),
            locks: DashMap::new(),
        }
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn file_path(&self, table: &str) -> PathBuf {
        self.base_dir.join(format!("{table}{}", self.extension))
    }

    fn lock_for(&self, table: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn escape(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        for c in value.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                c if c == self.delimiter => {
                    out.push('\\');
                    out.push(c);
                }
                c => out.push(c),
            }
        }
        out
    }

    fn split_line(&self, line: &str) -> Vec<String> {
        let mut values = Vec::new();
        let mut current = String::new();
        let mut chars = line.chars();

        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => current.push('\n'),
                    Some(other) => current.push(other),
                    None => current.push('\\'),
                }
            } else if c == self.delimiter {
                values.push(std::mem::take(&mut current));
            } else {
                current.push(c);
            }
        }
        values.push(current);
        values
    }

    fn encode_row(&self, record: &Record, schema: &TableSchema) -> String {
        let mut columns = Vec::with_capacity(schema.fields.len() + 1);
        columns.push(self.escape(record.get(RECORD_ID_FIELD).map(String::as_str).unwrap_or("")));
        for field in &schema.fields {
            let value = record
                .get(&field.name)
                .map(String::as_str)
                .unwrap_or_else(|| field.field_type.default_value());
            columns.push(self.escape(value));
        }
        columns.join(&self.delimiter.to_string())
    }

    fn decode_row(&self, line: &str, schema: &TableSchema) -> Record {
        let values = self.split_line(line);
        let mut record = Record::new();

        record.insert(
            RECORD_ID_FIELD.to_string(),
            values.first().cloned().unwrap_or_default(),
        );
        for (i, field) in schema.fields.iter().enumerate() {
            record.insert(
                field.name.clone(),
                values.get(i + 1).cloned().unwrap_or_default(),
            );
        }
        record
    }

    fn read_rows(&self, table: &str, schema: &TableSchema) -> Result<Vec<Record>> {
        let path = self.file_path(table);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("reading table file {}", path.display()))?;

        Ok(contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| self.decode_row(l, schema))
            .collect())
    }

    fn write_rows(&self, table: &str, schema: &TableSchema, rows: &[Record]) -> Result<()> {
        let path = self.file_path(table);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let mut body = String::new();
        for row in rows {
            body.push_str(&self.encode_row(row, schema));
            body.push('\n');
        }

        fs::write(&path, body).with_context(|| format!("writing table file {}", path.display()))?;
        Ok(())
    }

    fn append_row(&self, table: &str, schema: &TableSchema, record: &Record) -> Result<()> {
        use std::io::Write;

        let path = self.file_path(table);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening table file {}", path.display()))?;
        writeln!(file, "{}", self.encode_row(record, schema))
            .with_context(|| format!("appending to table file {}", path.display()))?;
        Ok(())
    }

    fn backup(&self, path: &Path) -> Result<()> {
        if path.exists() {
            let backup = path.with_extension("txt.bak");
            fs::copy(path, &backup)
                .with_context(|| format!("backing up {} before migration", path.display()))?;
            debug!(backup = %backup.display(), "schema migration backup written");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageDriver for DelimitedFileDriver {
    async fn create_storage(&self, path: &str, _schema: &TableSchema) -> Result<bool> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap();

        let file = self.file_path(path);
        if file.exists() {
            return Ok(false);
        }
        self.write_rows(path, &TableSchema::new("", vec![]), &[])?;
        Ok(true)
    }

    async fn read_all(&self, path: &str, schema: &TableSchema) -> Result<Vec<Record>> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap();
        self.read_rows(path, schema)
    }

    async fn read_by_id(
        &self,
        path: &str,
        schema: &TableSchema,
        id: &str,
    ) -> Result<Option<Record>> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap();
        Ok(self
            .read_rows(path, schema)?
            .into_iter()
            .find(|r| r.get(RECORD_ID_FIELD).map(String::as_str) == Some(id)))
    }

    async fn create(&self, path: &str, schema: &TableSchema, mut record: Record) -> Result<String> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap();

        let id = record
            .get(RECORD_ID_FIELD)
            .cloned()
            .unwrap_or_else(ident::generate);
        record.insert(RECORD_ID_FIELD.to_string(), id.clone());

        self.append_row(path, schema, &record)?;
        Ok(id)
    }

    async fn update_by_id(
        &self,
        path: &str,
        schema: &TableSchema,
        id: &str,
        mut record: Record,
    ) -> Result<bool> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap();

        let mut rows = self.read_rows(path, schema)?;
        let mut found = false;
        record.insert(RECORD_ID_FIELD.to_string(), id.to_string());

        for row in rows.iter_mut() {
            if row.get(RECORD_ID_FIELD).map(String::as_str) == Some(id) {
                *row = record.clone();
                found = true;
                break;
            }
        }

        if found {
            self.write_rows(path, schema, &rows)?;
        }
        Ok(found)
    }

    async fn delete_by_id(&self, path: &str, schema: &TableSchema, id: &str) -> Result<bool> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap();

        let mut rows = self.read_rows(path, schema)?;
        let before = rows.len();
        rows.retain(|r| r.get(RECORD_ID_FIELD).map(String::as_str) != Some(id));

        if rows.len() != before {
            self.write_rows(path, schema, &rows)?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn exists(&self, path: &str) -> bool {
        self.file_path(path).exists()
    }

    async fn has_data(&self, path: &str) -> Result<bool> {
        let file = self.file_path(path);
        if !file.exists() {
            return Ok(false);
        }
        let contents = fs::read_to_string(&file)
            .with_context(|| format!("reading table file {}", file.display()))?;
        Ok(contents.lines().any(|l| !l.trim().is_empty()))
    }

    async fn migrate_schema(
        &self,
        path: &str,
        old: &TableSchema,
        new: &TableSchema,
    ) -> Result<bool> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap();

        let file = self.file_path(path);
        if !file.exists() {
            return Ok(false);
        }

        self.backup(&file)?;

        let rows = self.read_rows(path, old)?;
        let migrated: Vec<Record> = rows
            .into_iter()
            .map(|row| {
                let mut out = Record::new();
                if let Some(id) = row.get(RECORD_ID_FIELD) {
                    out.insert(RECORD_ID_FIELD.to_string(), id.clone());
                }
                for field in &new.fields {
                    let value = row
                        .get(&field.name)
                        .cloned()
                        .unwrap_or_else(|| field.field_type.default_value().to_string());
                    out.insert(field.name.clone(), value);
                }
                out
            })
            .collect();

        self.write_rows(path, new, &migrated)?;
        debug!(table = path, "schema migration rewrote table");
        Ok(true)
    }

    async fn bulk_create(
        &self,
        path: &str,
        schema: &TableSchema,
        records: Vec<Record>,
    ) -> Result<Vec<String>> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap();

        let mut ids = Vec::with_capacity(records.len());
        for mut record in records {
            let id = record
                .get(RECORD_ID_FIELD)
                .cloned()
                .unwrap_or_else(ident::generate);
            record.insert(RECORD_ID_FIELD.to_string(), id.clone());
            self.append_row(path, schema, &record)?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn search(
        &self,
        path: &str,
        schema: &TableSchema,
        field: &str,
        q: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().unwrap();

        if schema.field(field).is_none() {
            warn!(field, table = path, "search on undeclared column");
            return Ok(Vec::new());
        }

        let needle = q.to_lowercase();
        Ok(self
            .read_rows(path, schema)?
            .into_iter()
            .filter(|r| {
                r.get(field)
                    .map_or(false, |v| v.to_lowercase().contains(&needle))
            })
            .filter_map(|r| r.get(RECORD_ID_FIELD).cloned())
            .take(limit)
            .collect())
    }
}
