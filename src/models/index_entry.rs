//! Represents a queryable record describing one uploaded photo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use uuid::Uuid;

/// A row in the metadata index.
///
/// The index is append-only on upload: uploading the same name twice leaves
/// two entries behind. Entries are independent of the blob itself and may
/// outlive it after a partial failure.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct IndexEntry {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Sanitized asset name, also the content-store key.
    pub name: String,

    /// Owner recorded at upload time.
    pub user: String,

    /// When the entry was appended.
    pub timestamp: DateTime<Utc>,

    /// Route the asset is served from.
    pub url: Option<String>,

    /// Users granted read access, when the upload was restricted.
    pub allowed_users: Option<Json<Vec<String>>>,
}

impl IndexEntry {
    pub fn new(
        name: impl Into<String>,
        user: impl Into<String>,
        url: Option<String>,
        allowed_users: Option<Vec<String>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            user: user.into(),
            timestamp: Utc::now(),
            url,
            allowed_users: allowed_users.map(Json),
        }
    }

    pub fn allowed_users(&self) -> Option<&[String]> {
        self.allowed_users.as_ref().map(|users| users.0.as_slice())
    }
}

/// Columns the index can be filtered on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexField {
    Name,
    User,
}

impl IndexField {
    pub fn column(self) -> &'static str {
        match self {
            IndexField::Name => "name",
            IndexField::User => "user",
        }
    }
}

/// Partial update applied to every entry matching a name.
#[derive(Clone, Debug, Default)]
pub struct IndexPatch {
    /// `Some(None)` clears the list, `None` leaves it untouched.
    pub allowed_users: Option<Option<Vec<String>>>,
}
