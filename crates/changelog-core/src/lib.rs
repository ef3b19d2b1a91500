//! Changelog document model and the save-by-path workflow.
//!
//! The crate holds everything that does not depend on a concrete database:
//! - [`ChangelogDocument`] and its request types.
//! - [`resolve_save`] and [`apply_patch`], the pure merge functions.
//! - [`DocumentStore`], the persistence seam implemented by storage crates.
//! - [`ChangelogWorkflow`], which runs the operations against a store and an
//!   optional [`ContentCache`].

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod cache;
mod workflow;

pub use cache::{CacheConfig, ContentCache};
pub use workflow::ChangelogWorkflow;

pub const DEFAULT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ChangelogError {
    #[error("changelog document not found: {0}")]
    NotFound(String),
    #[error("changelog document conflict: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
}

impl ChangelogError {
    /// Stable machine code used by the HTTP and CLI surfaces.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation_error",
            Self::Store(_) => "store_error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct DocumentId(pub Ulid);

impl DocumentId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DocumentId {
    type Err = ChangelogError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(raw.trim())
            .map(Self)
            .map_err(|err| ChangelogError::Validation(format!("invalid document id {raw}: {err}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChangelogDocument {
    pub id: DocumentId,
    pub path: String,
    pub name: String,
    pub version: String,
    pub content: String,
    pub size: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub created_by: String,
    pub last_modified_by: String,
    pub is_active: bool,
}

/// Input of the save-by-path operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SaveFileRequest {
    pub path: String,
    pub content: String,
    pub author: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl SaveFileRequest {
    /// # Errors
    /// Returns [`ChangelogError::Validation`] when `path` or `author` is blank.
    pub fn validate(&self) -> Result<(), ChangelogError> {
        require_non_blank("path", &self.path)?;
        require_non_blank("author", &self.author)
    }
}

/// Input of the plain create operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewDocument {
    pub path: String,
    pub content: String,
    pub author: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl NewDocument {
    /// # Errors
    /// Returns [`ChangelogError::Validation`] when `path` or `author` is blank.
    pub fn validate(&self) -> Result<(), ChangelogError> {
        require_non_blank("path", &self.path)?;
        require_non_blank("author", &self.author)
    }

    /// Builds the document this input describes, stamped at `now`.
    ///
    /// # Errors
    /// Returns [`ChangelogError::Validation`] when the input is invalid.
    pub fn into_document(self, now: OffsetDateTime) -> Result<ChangelogDocument, ChangelogError> {
        self.validate()?;
        let mut document = fresh_document(
            &self.path,
            self.content,
            &self.author,
            self.name.as_deref(),
            self.version.as_deref(),
            now,
        );
        if let Some(is_active) = self.is_active {
            document.is_active = is_active;
        }
        Ok(document)
    }
}

/// Partial update applied by id. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPatch {
    pub author: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl DocumentPatch {
    /// # Errors
    /// Returns [`ChangelogError::Validation`] when `author` is blank or a
    /// supplied `path` is blank.
    pub fn validate(&self) -> Result<(), ChangelogError> {
        require_non_blank("author", &self.author)?;
        if let Some(path) = &self.path {
            require_non_blank("path", path)?;
        }
        Ok(())
    }

    /// The normalized target path when the patch moves the document.
    #[must_use]
    pub fn target_path(&self) -> Option<&str> {
        self.path.as_deref().map(str::trim)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSave {
    pub document: ChangelogDocument,
    pub outcome: UpsertOutcome,
}

/// Resolves a save-by-path request against the document currently stored at
/// that path.
///
/// With no existing document a new one is built: fresh id, `now` for both
/// timestamps, the author on both attribution fields, `version` defaulting to
/// [`DEFAULT_VERSION`] and `name` defaulting to the final path segment.
///
/// With an existing document the id, path, creation stamp and creator are
/// kept; `name` and `version` fall back to the stored values when omitted.
/// `updated_at` always moves strictly forward, even when `now` does not.
///
/// # Errors
/// Returns [`ChangelogError::Validation`] when the request is invalid.
pub fn resolve_save(
    existing: Option<&ChangelogDocument>,
    request: &SaveFileRequest,
    now: OffsetDateTime,
) -> Result<ResolvedSave, ChangelogError> {
    request.validate()?;

    let Some(existing) = existing else {
        return Ok(ResolvedSave {
            document: fresh_document(
                &request.path,
                request.content.clone(),
                &request.author,
                request.name.as_deref(),
                request.version.as_deref(),
                now,
            ),
            outcome: UpsertOutcome::Created,
        });
    };

    let mut document = existing.clone();
    document.content.clone_from(&request.content);
    document.size = size_label(&document.content);
    if let Some(name) = supplied(request.name.as_deref()) {
        document.name = name.to_string();
    }
    if let Some(version) = supplied(request.version.as_deref()) {
        document.version = version.to_string();
    }
    document.last_modified_by = request.author.trim().to_string();
    document.updated_at = advance_timestamp(existing.updated_at, now);

    Ok(ResolvedSave { document, outcome: UpsertOutcome::Updated })
}

/// Applies a partial update to `existing`.
///
/// # Errors
/// Returns [`ChangelogError::Validation`] when the patch is invalid.
pub fn apply_patch(
    existing: &ChangelogDocument,
    patch: &DocumentPatch,
    now: OffsetDateTime,
) -> Result<ChangelogDocument, ChangelogError> {
    patch.validate()?;

    let mut document = existing.clone();
    if let Some(path) = patch.target_path() {
        document.path = path.to_string();
    }
    if let Some(name) = supplied(patch.name.as_deref()) {
        document.name = name.to_string();
    }
    if let Some(version) = supplied(patch.version.as_deref()) {
        document.version = version.to_string();
    }
    if let Some(content) = &patch.content {
        document.content.clone_from(content);
    }
    if let Some(is_active) = patch.is_active {
        document.is_active = is_active;
    }
    document.size = size_label(&document.content);
    document.last_modified_by = patch.author.trim().to_string();
    document.updated_at = advance_timestamp(existing.updated_at, now);
    Ok(document)
}

/// Display size of a content body: UTF-16 code units times two, in KiB with
/// one decimal, e.g. `"2.0 KB"` for 1024 characters.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn size_label(content: &str) -> String {
    let units = content.encode_utf16().count();
    let kibibytes = (units as f64 * 2.0) / 1024.0;
    let rounded = (kibibytes * 10.0).round() / 10.0;
    format!("{rounded:.1} KB")
}

/// Last non-empty `/`-separated segment of `path`, or the trimmed path when it
/// has none.
#[must_use]
pub fn name_from_path(path: &str) -> String {
    let trimmed = path.trim();
    trimmed
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(trimmed)
        .to_string()
}

/// Uniform `{success, message, data}` wrapper returned at the outer surfaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self { success: true, message: None, data: Some(data) }
    }

    #[must_use]
    pub fn ok_with_message(data: T, message: impl Into<String>) -> Self {
        Self { success: true, message: Some(message.into()), data: Some(data) }
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ChangelogError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ChangelogError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ChangelogError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ChangelogError::Validation("timestamp MUST use UTC offset Z".to_string()));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ChangelogError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ChangelogError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ChangelogError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Persistence seam for changelog documents.
///
/// Implementations keep `path` unique and report a clash as
/// [`ChangelogError::Conflict`]. Absence is `Ok(None)` / `Ok(false)`, never an
/// error.
pub trait DocumentStore {
    /// # Errors
    /// Returns [`ChangelogError::Store`] when the lookup fails.
    fn find_by_path(&self, path: &str) -> Result<Option<ChangelogDocument>, ChangelogError>;

    /// # Errors
    /// Returns [`ChangelogError::Store`] when the lookup fails.
    fn find_by_id(&self, id: DocumentId) -> Result<Option<ChangelogDocument>, ChangelogError>;

    /// All documents ordered by path.
    ///
    /// # Errors
    /// Returns [`ChangelogError::Store`] when the scan fails.
    fn list(&self) -> Result<Vec<ChangelogDocument>, ChangelogError>;

    /// # Errors
    /// Returns [`ChangelogError::Conflict`] when the id or path is taken.
    fn insert(&mut self, document: ChangelogDocument) -> Result<ChangelogDocument, ChangelogError>;

    /// # Errors
    /// Returns [`ChangelogError::NotFound`] when `id` is unknown and
    /// [`ChangelogError::Conflict`] when the new path belongs to another
    /// document.
    fn replace(
        &mut self,
        id: DocumentId,
        document: ChangelogDocument,
    ) -> Result<ChangelogDocument, ChangelogError>;

    /// # Errors
    /// Returns [`ChangelogError::Store`] when the delete fails.
    fn remove(&mut self, id: DocumentId) -> Result<bool, ChangelogError>;

    /// Lookup, merge and write for one save-by-path request.
    ///
    /// The default body reads and then writes without isolation; a concurrent
    /// create on the same path is caught by the uniqueness constraint as a
    /// conflict. Stores with transactions should override it.
    ///
    /// # Errors
    /// Propagates validation, conflict and store errors.
    fn upsert_by_path(
        &mut self,
        request: &SaveFileRequest,
        now: OffsetDateTime,
    ) -> Result<ResolvedSave, ChangelogError> {
        request.validate()?;
        let existing = self.find_by_path(request.path.trim())?;
        let resolved = resolve_save(existing.as_ref(), request, now)?;
        let document = match resolved.outcome {
            UpsertOutcome::Created => self.insert(resolved.document)?,
            UpsertOutcome::Updated => self.replace(resolved.document.id, resolved.document)?,
        };
        Ok(ResolvedSave { document, outcome: resolved.outcome })
    }
}

fn fresh_document(
    path: &str,
    content: String,
    author: &str,
    name: Option<&str>,
    version: Option<&str>,
    now: OffsetDateTime,
) -> ChangelogDocument {
    let path = path.trim().to_string();
    let author = author.trim().to_string();
    ChangelogDocument {
        id: DocumentId::generate(),
        name: supplied(name).map_or_else(|| name_from_path(&path), ToString::to_string),
        version: supplied(version).unwrap_or(DEFAULT_VERSION).to_string(),
        size: size_label(&content),
        path,
        content,
        created_at: now,
        updated_at: now,
        created_by: author.clone(),
        last_modified_by: author,
        is_active: true,
    }
}

fn supplied(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn advance_timestamp(previous: OffsetDateTime, now: OffsetDateTime) -> OffsetDateTime {
    if now > previous {
        now
    } else {
        previous + Duration::nanoseconds(1)
    }
}

fn require_non_blank(field: &str, value: &str) -> Result<(), ChangelogError> {
    if value.trim().is_empty() {
        return Err(ChangelogError::Validation(format!("{field} MUST be provided")));
    }
    Ok(())
}
