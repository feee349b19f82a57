// Tag records - tags-as-state with soft removal

//! # Tag Records
//!
//! Tags mark state on any addressable object (a process or an arbitrary
//! form record). Removal is soft: the record keeps its `applied_*` fields
//! and gains `removed_*` fields, so the full tag history of an object is
//! always reconstructible. A tag is **active** iff `removed_at` is empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One application of one tag to one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRecord {
    /// Kind of object the tag is on (e.g. `process`, a form path)
    pub object_type: String,

    pub object_id: String,

    /// Lower-case token: alphanumeric plus `_`
    pub tag: String,

    pub applied_at: DateTime<Utc>,
    pub applied_by: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl TagRecord {
    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }
}

/// Whether `tag` is a well-formed tag token.
pub fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
