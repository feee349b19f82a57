// In-memory storage driver for development and testing

//! # In-Memory Driver
//!
//! DashMap-backed tables keyed by path. Records keep their append order so
//! `read_all` behaves exactly like the file backend. Nothing survives the
//! process; use [`super::delimited::DelimitedFileDriver`] for durable data.

use dashmap::DashMap;

use crate::models::ident;
use crate::storage::{Record, StorageDriver, TableSchema, RECORD_ID_FIELD};
use crate::Result;

/// One table: records in append order.
#[derive(Default)]
struct Table {
    rows: Vec<Record>,
}

/// In-memory implementation of [`StorageDriver`].
#[derive(Default)]
pub struct MemoryDriver {
    tables: DashMap<String, Table>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        MemoryDriver::default()
    }
}

#[async_trait::async_trait]
impl StorageDriver for MemoryDriver {
    async fn create_storage(&self, path: &str, _schema: &TableSchema) -> Result<bool> {
        if self.tables.contains_key(path) {
            return Ok(false);
        }
        self.tables.insert(path.to_string(), Table::default());
        Ok(true)
    }

    async fn read_all(&self, path: &str, _schema: &TableSchema) -> Result<Vec<Record>> {
        Ok(self
            .tables
            .get(path)
            .map(|t| t.rows.clone())
            .unwrap_or_default())
    }

    async fn read_by_id(
        &self,
        path: &str,
        _schema: &TableSchema,
        id: &str,
    ) -> Result<Option<Record>> {
        Ok(self.tables.get(path).and_then(|t| {
            t.rows
                .iter()
                .find(|r| r.get(RECORD_ID_FIELD).map(String::as_str) == Some(id))
                .cloned()
        }))
    }

    async fn create(&self, path: &str, schema: &TableSchema, mut record: Record) -> Result<String> {
        let id = record
            .get(RECORD_ID_FIELD)
            .cloned()
            .unwrap_or_else(ident::generate);
        record.insert(RECORD_ID_FIELD.to_string(), id.clone());

        // Missing columns materialize as type defaults so every row is
        // rectangular.
        for field in &schema.fields {
            record
                .entry(field.name.clone())
                .or_insert_with(|| field.field_type.default_value().to_string());
        }

        self.tables
            .entry(path.to_string())
            .or_default()
            .rows
            .push(record);
        Ok(id)
    }

    async fn update_by_id(
        &self,
        path: &str,
        _schema: &TableSchema,
        id: &str,
        mut record: Record,
    ) -> Result<bool> {
        let Some(mut table) = self.tables.get_mut(path) else {
            return Ok(false);
        };

        record.insert(RECORD_ID_FIELD.to_string(), id.to_string());
        for row in table.rows.iter_mut() {
            if row.get(RECORD_ID_FIELD).map(String::as_str) == Some(id) {
                *row = record;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn delete_by_id(&self, path: &str, _schema: &TableSchema, id: &str) -> Result<bool> {
        let Some(mut table) = self.tables.get_mut(path) else {
            return Ok(false);
        };

        let before = table.rows.len();
        table
            .rows
            .retain(|r| r.get(RECORD_ID_FIELD).map(String::as_str) != Some(id));
        Ok(table.rows.len() != before)
    }

    async fn exists(&self, path: &str) -> bool {
        self.tables.contains_key(path)
    }

    async fn has_data(&self, path: &str) -> Result<bool> {
        Ok(self.tables.get(path).map_or(false, |t| !t.rows.is_empty()))
    }

    async fn migrate_schema(
        &self,
        path: &str,
        _old: &TableSchema,
        new: &TableSchema,
    ) -> Result<bool> {
        let Some(mut table) = self.tables.get_mut(path) else {
            return Ok(false);
        };

        for row in table.rows.iter_mut() {
            let mut migrated = Record::new();
            if let Some(id) = row.get(RECORD_ID_FIELD) {
                migrated.insert(RECORD_ID_FIELD.to_string(), id.clone());
            }
            for field in &new.fields {
                let value = row
                    .get(&field.name)
                    .cloned()
                    .unwrap_or_else(|| field.field_type.default_value().to_string());
                migrated.insert(field.name.clone(), value);
            }
            *row = migrated;
        }
        Ok(true)
    }

    async fn bulk_create(
        &self,
        path: &str,
        schema: &TableSchema,
        records: Vec<Record>,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(self.create(path, schema, record).await?);
        }
        Ok(ids)
    }

    async fn search(
        &self,
        path: &str,
        _schema: &TableSchema,
        field: &str,
        q: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let needle = q.to_lowercase();
        Ok(self
            .tables
            .get(path)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|r| {
                        r.get(field)
                            .map_or(false, |v| v.to_lowercase().contains(&needle))
                    })
                    .filter_map(|r| r.get(RECORD_ID_FIELD).cloned())
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FieldSpec, FieldType};

    fn schema() -> TableSchema {
        TableSchema::new(
            "People",
            vec![
                FieldSpec::new("name", FieldType::Text).required(),
                FieldSpec::new("age", FieldType::Number),
            ],
        )
    }

    fn record(name: &str, age: &str) -> Record {
        Record::from([
            ("name".to_string(), name.to_string()),
            ("age".to_string(), age.to_string()),
        ])
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let driver = MemoryDriver::new();
        let schema = schema();

        driver.create_storage("people", &schema).await.unwrap();
        let id = driver
            .create("people", &schema, record("Ana", "33"))
            .await
            .unwrap();

        assert!(ident::validate(&id));
        let found = driver
            .read_by_id("people", &schema, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get("name").unwrap(), "Ana");

        assert!(driver.exists("people").await);
        assert!(driver.has_data("people").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_and_delete_by_id() {
        let driver = MemoryDriver::new();
        let schema = schema();
        let id = driver
            .create("people", &schema, record("Ana", "33"))
            .await
            .unwrap();

        assert!(driver
            .update_by_id("people", &schema, &id, record("Ana", "34"))
            .await
            .unwrap());
        let found = driver
            .read_by_id("people", &schema, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get("age").unwrap(), "34");

        assert!(driver.delete_by_id("people", &schema, &id).await.unwrap());
        assert!(!driver.delete_by_id("people", &schema, &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive_and_limited() {
        let driver = MemoryDriver::new();
        let schema = schema();
        for name in ["Ana", "Anabela", "Bruno"] {
            driver
                .create("people", &schema, record(name, "1"))
                .await
                .unwrap();
        }

        let hits = driver
            .search("people", &schema, "name", "ana", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);

        let hits = driver
            .search("people", &schema, "name", "ana", 1)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_migrate_schema_adds_defaults() {
        let driver = MemoryDriver::new();
        let old = schema();
        driver
            .create("people", &old, record("Ana", "33"))
            .await
            .unwrap();

        let new = TableSchema::new(
            "People",
            vec![
                FieldSpec::new("name", FieldType::Text).required(),
                FieldSpec::new("active", FieldType::Checkbox),
            ],
        );
        assert!(driver.migrate_schema("people", &old, &new).await.unwrap());

        let rows = driver.read_all("people", &new).await.unwrap();
        assert_eq!(rows[0].get("active").unwrap(), "False");
        assert!(rows[0].get("age").is_none());
    }
}
