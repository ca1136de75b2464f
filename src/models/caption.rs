//! The title/description pair derived for a photo and stored as a JSON sidecar.

use serde::{Deserialize, Serialize};

/// Description used whenever captioning fails outright.
pub const FAILED_DESCRIPTION: &str = "No description available. Image analysis failed.";

/// Description used when the model answered JSON without the expected fields.
pub const INCOMPLETE_DESCRIPTION: &str = "Analyzed image content.";

/// Description shown in listings for assets without a readable sidecar.
pub const MISSING_DESCRIPTION: &str = "No description available.";

/// A caption record. Serialized as exactly `{"title": .., "description": ..}`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Caption {
    pub title: String,
    pub description: String,
}

impl Caption {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }

    /// Deterministic caption substituted when the generator cannot produce one.
    pub fn fallback(filename: &str) -> Self {
        Self::new(fallback_title(filename), FAILED_DESCRIPTION)
    }
}

pub fn fallback_title(filename: &str) -> String {
    format!("Image: {}", filename)
}
