// Tag service - tags-as-state over any addressable object

//! # Tag Service
//!
//! Tags mark state on processes and arbitrary form records alike, enabling
//! multi-actor collaboration and event-driven flows outside the kanban
//! state machine proper. The service sits directly on a storage driver and
//! keeps full history: removal is soft, so "who tagged what when, and who
//! untagged it" is always answerable.
//!
//! Idempotency contract: adding an already-active tag is a no-op, removing
//! a non-active tag is a no-op, and neither loses history.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::models::tag::{is_valid_tag, TagRecord};
use crate::storage::{FieldSpec, FieldType, Record, StorageDriver, TableSchema, RECORD_ID_FIELD};
use crate::{FlowboardError, Result};

/// Default table name for tag records.
pub const TAG_TABLE: &str = "object_tags";

fn tag_schema() -> TableSchema {
    TableSchema::new(
        "Object Tags",
        vec![
            FieldSpec::new("object_type", FieldType::Text).required(),
            FieldSpec::new("object_id", FieldType::Text).required(),
            FieldSpec::new("tag", FieldType::Text).required(),
            FieldSpec::new("applied_at", FieldType::Text).required(),
            FieldSpec::new("applied_by", FieldType::Text).required(),
            FieldSpec::new("removed_at", FieldType::Text),
            FieldSpec::new("removed_by", FieldType::Text),
            // JSON object
            FieldSpec::new("metadata", FieldType::Text),
        ],
    )
}

/// High-level tag operations over a storage driver.
pub struct TagService {
    driver: Arc<dyn StorageDriver>,
    table: String,
}

impl TagService {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        TagService {
            driver,
            table: TAG_TABLE.to_string(),
        }
    }

    /// Apply a tag. Returns false (and changes nothing) when the tag is
    /// already active on the object.
    pub async fn add_tag(
        &self,
        object_type: &str,
        object_id: &str,
        tag: &str,
        actor: &str,
        metadata: Option<Value>,
    ) -> Result<bool> {
        validate_tag(tag)?;

        if self.has_tag(object_type, object_id, tag).await? {
            return Ok(false);
        }

        let record = flatten(&TagRecord {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
            tag: tag.to_string(),
            applied_at: Utc::now(),
            applied_by: actor.to_string(),
            removed_at: None,
            removed_by: None,
            metadata,
        });

        self.driver.create(&self.table, &tag_schema(), record).await?;
        debug!(object_type, object_id, tag, actor, "tag applied");
        Ok(true)
    }

    /// Soft-remove an active tag. Returns false when the tag is not
    /// active; history is preserved either way.
    pub async fn remove_tag(
        &self,
        object_type: &str,
        object_id: &str,
        tag: &str,
        actor: &str,
    ) -> Result<bool> {
        validate_tag(tag)?;

        let rows = self.driver.read_all(&self.table, &tag_schema()).await?;
        let Some((row_id, mut record)) = rows.into_iter().find_map(|row| {
            let matches = row.get("object_type").map(String::as_str) == Some(object_type)
                && row.get("object_id").map(String::as_str) == Some(object_id)
                && row.get("tag").map(String::as_str) == Some(tag)
                && row.get("removed_at").map(String::as_str) == Some("");
            matches
                .then(|| row.get(RECORD_ID_FIELD).cloned().map(|id| (id, row)))
                .flatten()
        }) else {
            return Ok(false);
        };

        record.insert("removed_at".to_string(), Utc::now().to_rfc3339());
        record.insert("removed_by".to_string(), actor.to_string());
        self.driver
            .update_by_id(&self.table, &tag_schema(), &row_id, record)
            .await?;
        debug!(object_type, object_id, tag, actor, "tag removed");
        Ok(true)
    }

    /// Whether the tag is currently active on the object.
    pub async fn has_tag(&self, object_type: &str, object_id: &str, tag: &str) -> Result<bool> {
        Ok(self
            .active_tags(object_type, object_id)
            .await?
            .iter()
            .any(|t| t == tag))
    }

    /// Whether any of `tags` is active on the object.
    pub async fn has_any_tag(
        &self,
        object_type: &str,
        object_id: &str,
        tags: &[&str],
    ) -> Result<bool> {
        let active = self.active_tags(object_type, object_id).await?;
        Ok(tags.iter().any(|t| active.iter().any(|a| a == t)))
    }

    /// Active tags of one object, in application order.
    pub async fn active_tags(&self, object_type: &str, object_id: &str) -> Result<Vec<String>> {
        Ok(self
            .records_for(object_type, object_id)
            .await?
            .into_iter()
            .filter(TagRecord::is_active)
            .map(|r| r.tag)
            .collect())
    }

    /// Full tag history of one object, including removed tags.
    pub async fn tag_history(&self, object_type: &str, object_id: &str) -> Result<Vec<TagRecord>> {
        self.records_for(object_type, object_id).await
    }

    /// Ids of every object of `object_type` carrying `tag` actively.
    pub async fn objects_with_tag(&self, object_type: &str, tag: &str) -> Result<Vec<String>> {
        let rows = self.driver.read_all(&self.table, &tag_schema()).await?;
        let mut ids: Vec<String> = rows
            .iter()
            .filter_map(inflate)
            .filter(|r| r.object_type == object_type && r.tag == tag && r.is_active())
            .map(|r| r.object_id)
            .collect();
        ids.dedup();
        Ok(ids)
    }

    /// Atomic state transition: remove `from_tag`, apply `to_tag`.
    /// Returns false without changes when `from_tag` is not active.
    pub async fn transition(
        &self,
        object_type: &str,
        object_id: &str,
        from_tag: &str,
        to_tag: &str,
        actor: &str,
    ) -> Result<bool> {
        validate_tag(from_tag)?;
        validate_tag(to_tag)?;

        if !self.remove_tag(object_type, object_id, from_tag, actor).await? {
            return Ok(false);
        }
        self.add_tag(object_type, object_id, to_tag, actor, None)
            .await?;
        Ok(true)
    }

    async fn records_for(&self, object_type: &str, object_id: &str) -> Result<Vec<TagRecord>> {
        let rows = self.driver.read_all(&self.table, &tag_schema()).await?;
        Ok(rows
            .iter()
            .filter_map(inflate)
            .filter(|r| r.object_type == object_type && r.object_id == object_id)
            .collect())
    }
}

fn validate_tag(tag: &str) -> Result<()> {
    if is_valid_tag(tag) {
        Ok(())
    } else {
        Err(FlowboardError::InvalidInput(format!(
            "invalid tag '{tag}': tags are lower-case alphanumeric plus '_'"
        )))
    }
}

fn flatten(record: &TagRecord) -> Record {
    let mut row = Record::new();
    row.insert("object_type".to_string(), record.object_type.clone());
    row.insert("object_id".to_string(), record.object_id.clone());
    row.insert("tag".to_string(), record.tag.clone());
    row.insert("applied_at".to_string(), record.applied_at.to_rfc3339());
    row.insert("applied_by".to_string(), record.applied_by.clone());
    row.insert(
        "removed_at".to_string(),
        record
            .removed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
    );
    row.insert(
        "removed_by".to_string(),
        record.removed_by.clone().unwrap_or_default(),
    );
    row.insert(
        "metadata".to_string(),
        record
            .metadata
            .as_ref()
            .and_then(|m| serde_json::to_string(m).ok())
            .unwrap_or_default(),
    );
    row
}

fn inflate(row: &Record) -> Option<TagRecord> {
    let get = |key: &str| row.get(key).cloned().unwrap_or_default();
    let parse_time = |s: String| crate::storage::repository::parse_timestamp(&s);

    Some(TagRecord {
        object_type: get("object_type"),
        object_id: get("object_id"),
        tag: get("tag"),
        applied_at: parse_time(get("applied_at"))?,
        applied_by: get("applied_by"),
        removed_at: parse_time(get("removed_at")),
        removed_by: Some(get("removed_by")).filter(|s| !s.is_empty()),
        metadata: serde_json::from_str(&get("metadata")).ok(),
    })
}
