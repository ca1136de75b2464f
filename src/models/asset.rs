//! Views of an asset returned by the pipeline to the HTTP layer.

use super::caption::Caption;
use serde::Serialize;

/// One entry of the photo listing: index data merged with its sidecar.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct AssetView {
    pub name: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub user: String,
}

/// Result of a successful upload.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct UploadReceipt {
    pub name: String,
    pub url: String,
    pub caption: Caption,

    /// False when the sidecar could not be written or was skipped.
    pub sidecar_stored: bool,
}
