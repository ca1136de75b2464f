//! src/services/pipeline.rs
//!
//! EnrichmentPipeline: upload, caption, index, list, serve and delete
//! photos across three independent stores. Nothing here is transactional:
//! each store call stands alone and earlier steps are never rolled back.
//! What happens when a step fails is decided by [`Step::severity`].

use super::{
    caption_service::CaptionGenerator,
    content_store::{ContentStore, ContentStoreError},
    metadata_index::{IndexError, MetadataIndex},
    naming::{asset_url, content_type_for, sanitize_filename, sidecar_name},
};
use crate::models::{
    asset::{AssetView, UploadReceipt},
    caption::{Caption, MISSING_DESCRIPTION},
    index_entry::{IndexEntry, IndexField, IndexPatch},
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Sidecar reads in flight at once while building a listing.
const SIDECAR_READ_CONCURRENCY: usize = 16;

/// How a failing step affects the operation it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// The operation fails with this error.
    Fatal,
    /// The operation succeeds with a substitute value.
    Degraded,
    /// The failure is logged and the step skipped.
    BestEffort,
}

/// Individual store interactions performed by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    StoreBlob,
    SetAccess,
    Caption,
    StoreSidecar,
    AppendIndex,
    ReadIndex,
    ReadSidecar,
    CheckSidecar,
    ReadBlob,
    ReadAccess,
    DeleteBlob,
    DeleteSidecar,
    DeleteIndex,
    UpdateIndex,
    CheckBlob,
}

impl Step {
    pub const fn severity(self) -> Severity {
        match self {
            Step::StoreBlob => Severity::Fatal,
            Step::SetAccess => Severity::Fatal,
            Step::Caption => Severity::Degraded,
            Step::StoreSidecar => Severity::BestEffort,
            Step::AppendIndex => Severity::Fatal,
            Step::ReadIndex => Severity::Fatal,
            Step::ReadSidecar => Severity::BestEffort,
            Step::CheckSidecar => Severity::BestEffort,
            Step::ReadBlob => Severity::Fatal,
            Step::ReadAccess => Severity::Fatal,
            Step::DeleteBlob => Severity::Fatal,
            Step::DeleteSidecar => Severity::BestEffort,
            Step::DeleteIndex => Severity::Fatal,
            Step::UpdateIndex => Severity::Fatal,
            Step::CheckBlob => Severity::BestEffort,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Step::StoreBlob => "store blob",
            Step::SetAccess => "set access",
            Step::Caption => "caption",
            Step::StoreSidecar => "store sidecar",
            Step::AppendIndex => "append index entry",
            Step::ReadIndex => "read index",
            Step::ReadSidecar => "read sidecar",
            Step::CheckSidecar => "check sidecar name",
            Step::ReadBlob => "read blob",
            Step::ReadAccess => "read access",
            Step::DeleteBlob => "delete blob",
            Step::DeleteSidecar => "delete sidecar",
            Step::DeleteIndex => "delete index entries",
            Step::UpdateIndex => "update index entries",
            Step::CheckBlob => "check blob",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("asset `{0}` not found")]
    NotFound(String),
    #[error("invalid asset name `{0}`")]
    InvalidName(String),
    #[error("{step} failed for `{subject}`: {source}")]
    ContentStore {
        step: Step,
        subject: String,
        source: ContentStoreError,
    },
    #[error("{step} failed for `{subject}`: {source}")]
    Index {
        step: Step,
        subject: String,
        source: IndexError,
    },
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Store errors that can be attributed to a pipeline step.
trait StepError {
    fn at(self, step: Step, subject: &str) -> PipelineError;
}

impl StepError for ContentStoreError {
    fn at(self, step: Step, subject: &str) -> PipelineError {
        match self {
            ContentStoreError::NotFound(name) => PipelineError::NotFound(name),
            ContentStoreError::InvalidName(name) => PipelineError::InvalidName(name),
            source => PipelineError::ContentStore {
                step,
                subject: subject.to_string(),
                source,
            },
        }
    }
}

impl StepError for IndexError {
    fn at(self, step: Step, subject: &str) -> PipelineError {
        PipelineError::Index {
            step,
            subject: subject.to_string(),
            source: self,
        }
    }
}

/// Propagate the error of a fatal step.
fn fatal<T, E: StepError>(step: Step, subject: &str, result: Result<T, E>) -> PipelineResult<T> {
    debug_assert_eq!(step.severity(), Severity::Fatal, "{step} is not fatal");
    result.map_err(|err| err.at(step, subject))
}

/// Log and drop the error of a non-fatal step.
fn absorb<T, E: fmt::Display>(step: Step, subject: &str, result: Result<T, E>) -> Option<T> {
    debug_assert_ne!(step.severity(), Severity::Fatal, "{step} is fatal");
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(severity = ?step.severity(), "{} failed for {}: {}", step, subject, err);
            None
        }
    }
}

/// Trim, drop blanks and de-duplicate an access list, keeping first-seen order.
fn normalize_users(users: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    users
        .into_iter()
        .map(|user| user.trim().to_string())
        .filter(|user| !user.is_empty() && seen.insert(user.clone()))
        .collect()
}

/// Outcome of comparing the index against the content store.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct ReconcileReport {
    /// Distinct names found in the index.
    pub checked: usize,
    /// Names indexed without a blob.
    pub orphaned: Vec<String>,
    /// Index entries removed for orphaned names.
    pub pruned: u64,
}

/// The upload → caption → sidecar → index pipeline.
///
/// Collaborators are built once at startup and shared; cloning the pipeline
/// only clones the handles.
#[derive(Clone)]
pub struct EnrichmentPipeline {
    content: Arc<dyn ContentStore>,
    index: Arc<dyn MetadataIndex>,
    captioner: Arc<dyn CaptionGenerator>,
    caption_timeout: Duration,
}

impl EnrichmentPipeline {
    pub fn new(
        content: Arc<dyn ContentStore>,
        index: Arc<dyn MetadataIndex>,
        captioner: Arc<dyn CaptionGenerator>,
        caption_timeout: Duration,
    ) -> Self {
        Self {
            content,
            index,
            captioner,
            caption_timeout,
        }
    }

    pub fn content_store(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    pub fn metadata_index(&self) -> &Arc<dyn MetadataIndex> {
        &self.index
    }

    /// Store a photo, caption it and index it.
    ///
    /// Returns `Ok(None)` without touching any store when there is no usable
    /// file: a missing or unsanitizable filename, or empty content.
    pub async fn upload(
        &self,
        data: Bytes,
        filename: Option<&str>,
        owner: &str,
        allowed_users: Option<Vec<String>>,
    ) -> PipelineResult<Option<UploadReceipt>> {
        let name = sanitize_filename(filename.unwrap_or_default());
        if name.is_empty() || data.is_empty() {
            debug!(
                "ignoring upload of {:?} ({} bytes): nothing to store",
                filename,
                data.len()
            );
            return Ok(None);
        }
        let allowed_users = allowed_users.map(normalize_users);

        fatal(Step::StoreBlob, &name, self.content.put(&name, data.clone()).await)?;
        info!("stored {} ({} bytes) for {}", name, data.len(), owner);

        if let Some(users) = &allowed_users {
            fatal(Step::SetAccess, &name, self.replace_readers(&name, users).await)?;
        }

        let caption = self.generate_caption(&data, &name).await;
        let sidecar_stored = self.store_sidecar(&name, &caption).await;

        let url = asset_url(&name);
        let entry = IndexEntry::new(&name, owner, Some(url.clone()), allowed_users);
        fatal(Step::AppendIndex, &name, self.index.append(&entry).await)?;

        Ok(Some(UploadReceipt {
            name,
            url,
            caption,
            sidecar_stored,
        }))
    }

    /// Every indexed photo merged with its caption, newest first.
    pub async fn list_assets(&self) -> PipelineResult<Vec<AssetView>> {
        let entries = fatal(Step::ReadIndex, "all entries", self.index.list_all().await)?;
        Ok(self.views(entries).await)
    }

    /// Photos indexed for one owner, newest first.
    pub async fn list_assets_for(&self, user: &str) -> PipelineResult<Vec<AssetView>> {
        let entries = fatal(
            Step::ReadIndex,
            user,
            self.index.query_by_field(IndexField::User, user).await,
        )?;
        Ok(self.views(entries).await)
    }

    /// Blob bytes and the content type implied by the name's extension.
    pub async fn get_asset(&self, name: &str) -> PipelineResult<(Bytes, &'static str)> {
        let bytes = fatal(Step::ReadBlob, name, self.content.get(name).await)?;
        Ok((bytes, content_type_for(name)))
    }

    /// Remove the blob, its sidecar and every index entry for `name`.
    ///
    /// Returns the number of index entries removed. Deleting an unknown name
    /// succeeds and removes nothing.
    pub async fn delete(&self, name: &str) -> PipelineResult<u64> {
        fatal(Step::DeleteBlob, name, self.content.delete(name).await)?;

        if let Some(sidecar) = self.sidecar_for(name).await {
            absorb(Step::DeleteSidecar, &sidecar, self.content.delete(&sidecar).await);
        }

        let removed = fatal(
            Step::DeleteIndex,
            name,
            self.index.delete_matching(IndexField::Name, name).await,
        )?;
        info!("deleted {} ({} index entries)", name, removed);
        Ok(removed)
    }

    /// Replace the users allowed to read `name`. Last writer wins.
    pub async fn update_access(&self, name: &str, users: Vec<String>) -> PipelineResult<Vec<String>> {
        let users = normalize_users(users);
        fatal(Step::SetAccess, name, self.replace_readers(name, &users).await)?;

        let patch = IndexPatch {
            allowed_users: Some(Some(users.clone())),
        };
        let updated = fatal(
            Step::UpdateIndex,
            name,
            self.index.update_record(name, &patch).await,
        )?;
        info!(
            "access to {} set to {:?} ({} index entries)",
            name, users, updated
        );
        Ok(users)
    }

    /// Users allowed to read `name`; `None` when unrestricted.
    pub async fn access(&self, name: &str) -> PipelineResult<Option<Vec<String>>> {
        fatal(Step::ReadAccess, name, self.content.readers(name).await)
    }

    /// Find index entries whose blob is gone and optionally delete them.
    pub async fn reconcile(&self, prune: bool) -> PipelineResult<ReconcileReport> {
        let entries = fatal(Step::ReadIndex, "all entries", self.index.list_all().await)?;
        let names: BTreeSet<String> = entries.into_iter().map(|entry| entry.name).collect();

        let mut orphaned = Vec::new();
        for name in &names {
            if absorb(Step::CheckBlob, name, self.content.exists(name).await) == Some(false) {
                orphaned.push(name.clone());
            }
        }

        let mut pruned = 0;
        if prune {
            for name in &orphaned {
                pruned += fatal(
                    Step::DeleteIndex,
                    name,
                    self.index.delete_matching(IndexField::Name, name).await,
                )?;
            }
        }

        if !orphaned.is_empty() {
            warn!(
                "{} of {} indexed names have no blob (pruned {} entries)",
                orphaned.len(),
                names.len(),
                pruned
            );
        }

        Ok(ReconcileReport {
            checked: names.len(),
            orphaned,
            pruned,
        })
    }

    async fn replace_readers(&self, name: &str, users: &[String]) -> Result<(), ContentStoreError> {
        self.content.revoke_readers(name).await?;
        self.content.grant_readers(name, users).await
    }

    async fn generate_caption(&self, image: &[u8], filename: &str) -> Caption {
        let attempt = timeout(self.caption_timeout, self.captioner.caption(image, filename)).await;
        absorb(Step::Caption, filename, attempt).unwrap_or_else(|| Caption::fallback(filename))
    }

    /// Returns whether the sidecar was written.
    async fn store_sidecar(&self, name: &str, caption: &Caption) -> bool {
        let Some(sidecar) = self.sidecar_for(name).await else {
            warn!("not writing a caption sidecar for {}: it would replace an asset", name);
            return false;
        };

        let Some(text) = absorb(Step::StoreSidecar, &sidecar, serde_json::to_string(caption)) else {
            return false;
        };
        absorb(
            Step::StoreSidecar,
            &sidecar,
            self.content
                .put_text(&sidecar, &text, "application/json")
                .await,
        )
        .is_some()
    }

    /// Sidecar name for `name`, or `None` when that name holds an asset:
    /// `name` itself, or another upload that is still indexed.
    async fn sidecar_for(&self, name: &str) -> Option<String> {
        let sidecar = sidecar_name(name);
        if sidecar == name {
            return None;
        }
        let owners = absorb(
            Step::CheckSidecar,
            &sidecar,
            self.index.query_by_field(IndexField::Name, &sidecar).await,
        )?;
        if !owners.is_empty() {
            debug!("{} is an indexed asset, not the caption of {}", sidecar, name);
            return None;
        }
        Some(sidecar)
    }

    async fn read_sidecar(&self, name: &str) -> Option<Caption> {
        let sidecar = self.sidecar_for(name).await?;
        let text = absorb(Step::ReadSidecar, &sidecar, self.content.get_text(&sidecar).await)?;
        absorb(Step::ReadSidecar, &sidecar, serde_json::from_str::<Caption>(&text))
    }

    async fn views(&self, entries: Vec<IndexEntry>) -> Vec<AssetView> {
        let lookups = entries
            .into_iter()
            .filter(|entry| !entry.name.is_empty())
            .map(|entry| async move {
                let caption = self.read_sidecar(&entry.name).await;
                let (title, description) = match caption {
                    Some(caption) => (caption.title, caption.description),
                    None => (entry.name.clone(), MISSING_DESCRIPTION.to_string()),
                };
                AssetView {
                    url: asset_url(&entry.name),
                    name: entry.name,
                    title,
                    description,
                    user: entry.user,
                }
            });
        stream::iter(lookups)
            .buffered(SIDECAR_READ_CONCURRENCY)
            .collect()
            .await
    }
}
