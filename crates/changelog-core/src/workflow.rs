use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{
    apply_patch, now_utc, ChangelogDocument, ChangelogError, ContentCache, DocumentId,
    DocumentPatch, DocumentStore, NewDocument, SaveFileRequest, UpsertOutcome,
};

/// Runs changelog operations against a [`DocumentStore`].
///
/// The workflow holds no state between calls apart from the optional cache,
/// which is shared and injected by the caller.
pub struct ChangelogWorkflow<S> {
    store: S,
    cache: Option<Arc<ContentCache>>,
}

impl<S: DocumentStore> ChangelogWorkflow<S> {
    pub fn new(store: S) -> Self {
        Self { store, cache: None }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ContentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Creates the document at `request.path` or updates the one already there.
    ///
    /// # Errors
    /// Returns [`ChangelogError::Validation`] for a blank path or author and
    /// [`ChangelogError::Store`] / [`ChangelogError::Conflict`] from the store.
    pub fn save_file(
        &mut self,
        request: &SaveFileRequest,
    ) -> Result<ChangelogDocument, ChangelogError> {
        self.save_file_at(request, now_utc())
    }

    /// [`Self::save_file`] with an explicit clock reading.
    ///
    /// # Errors
    /// See [`Self::save_file`].
    pub fn save_file_at(
        &mut self,
        request: &SaveFileRequest,
        now: OffsetDateTime,
    ) -> Result<ChangelogDocument, ChangelogError> {
        let resolved = self.store.upsert_by_path(request, now)?;
        let action = match resolved.outcome {
            UpsertOutcome::Created => "created",
            UpsertOutcome::Updated => "updated",
        };
        debug!(
            path = %resolved.document.path,
            id = %resolved.document.id,
            action,
            "changelog document saved"
        );
        self.remember(&resolved.document);
        Ok(resolved.document)
    }

    /// # Errors
    /// Returns [`ChangelogError::Conflict`] when the path is already taken.
    pub fn create(&mut self, input: NewDocument) -> Result<ChangelogDocument, ChangelogError> {
        input.validate()?;
        let path = input.path.trim().to_string();
        if self.store.find_by_path(&path)?.is_some() {
            return Err(ChangelogError::Conflict(format!("path already exists: {path}")));
        }

        let document = self.store.insert(input.into_document(now_utc())?)?;
        debug!(path = %document.path, id = %document.id, "changelog document created");
        self.remember(&document);
        Ok(document)
    }

    /// # Errors
    /// Returns [`ChangelogError::NotFound`] for an unknown id. A store failure
    /// is answered from the cache when it holds a fresh copy.
    pub fn get_by_id(&self, id: DocumentId) -> Result<ChangelogDocument, ChangelogError> {
        match self.store.find_by_id(id) {
            Ok(Some(document)) => {
                self.remember(&document);
                Ok(document)
            }
            Ok(None) => Err(ChangelogError::NotFound(format!("id {id}"))),
            Err(err @ ChangelogError::Store(_)) => {
                self.cached(err, |cache| cache.get_by_id(id))
            }
            Err(err) => Err(err),
        }
    }

    /// # Errors
    /// Returns [`ChangelogError::NotFound`] for an unknown path. A store
    /// failure is answered from the cache when it holds a fresh copy.
    pub fn get_by_path(&self, path: &str) -> Result<ChangelogDocument, ChangelogError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(ChangelogError::Validation("path MUST be provided".to_string()));
        }

        match self.store.find_by_path(path) {
            Ok(Some(document)) => {
                self.remember(&document);
                Ok(document)
            }
            Ok(None) => Err(ChangelogError::NotFound(format!("path {path}"))),
            Err(err @ ChangelogError::Store(_)) => {
                self.cached(err, |cache| cache.get_by_path(path))
            }
            Err(err) => Err(err),
        }
    }

    /// # Errors
    /// Returns [`ChangelogError::NotFound`] for an unknown id and
    /// [`ChangelogError::Conflict`] when the patch moves the document onto a
    /// path held by another one.
    pub fn update(
        &mut self,
        id: DocumentId,
        patch: &DocumentPatch,
    ) -> Result<ChangelogDocument, ChangelogError> {
        patch.validate()?;
        let existing = self
            .store
            .find_by_id(id)?
            .ok_or_else(|| ChangelogError::NotFound(format!("id {id}")))?;

        if let Some(target) = patch.target_path() {
            if target != existing.path {
                if let Some(other) = self.store.find_by_path(target)? {
                    return Err(ChangelogError::Conflict(format!(
                        "path {target} already belongs to document {}",
                        other.id
                    )));
                }
            }
        }

        let document = self.store.replace(id, apply_patch(&existing, patch, now_utc())?)?;
        debug!(path = %document.path, id = %document.id, "changelog document patched");
        self.remember(&document);
        Ok(document)
    }

    /// Removes a document by id. Returns `false` when nothing was removed.
    ///
    /// # Errors
    /// Returns [`ChangelogError::Store`] when the delete fails.
    pub fn delete(&mut self, id: DocumentId) -> Result<bool, ChangelogError> {
        let removed = self.store.remove(id)?;
        if let Some(cache) = &self.cache {
            cache.evict_id(id);
        }
        if removed {
            debug!(%id, "changelog document deleted");
        }
        Ok(removed)
    }

    /// # Errors
    /// Returns [`ChangelogError::Store`] when the scan fails.
    pub fn list(&self) -> Result<Vec<ChangelogDocument>, ChangelogError> {
        self.store.list()
    }

    fn remember(&self, document: &ChangelogDocument) {
        if let Some(cache) = &self.cache {
            cache.put(document);
        }
    }

    fn cached(
        &self,
        err: ChangelogError,
        lookup: impl FnOnce(&ContentCache) -> Option<ChangelogDocument>,
    ) -> Result<ChangelogDocument, ChangelogError> {
        match self.cache.as_deref().and_then(lookup) {
            Some(document) => {
                warn!(
                    error = %err,
                    path = %document.path,
                    "store unavailable, serving cached changelog document"
                );
                Ok(document)
            }
            None => Err(err),
        }
    }
}
