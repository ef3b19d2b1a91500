use std::path::PathBuf;
use std::sync::Arc;

use changelog_core::{
    ChangelogDocument, ChangelogError, ChangelogWorkflow, ContentCache, DocumentId,
    DocumentPatch, NewDocument, SaveFileRequest,
};
use changelog_store_sqlite::{SchemaStatus, SqliteDocumentStore};
use tracing::warn;

/// Handle used by request handlers. Each call opens its own connection, so the
/// handle is cheap to clone into blocking tasks; only the cache is shared.
///
/// Request paths never migrate. [`ChangelogApi::migrate`] runs once at startup
/// and `/ready` reports whether the schema is current.
#[derive(Debug, Clone)]
pub struct ChangelogApi {
    db_path: PathBuf,
    cache: Arc<ContentCache>,
}

impl ChangelogApi {
    pub fn new(db_path: PathBuf, cache: Arc<ContentCache>) -> Self {
        Self { db_path, cache }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn migrate(&self) -> anyhow::Result<SchemaStatus> {
        let store = SqliteDocumentStore::open(&self.db_path)?;
        store.migrate()?;
        store.schema_status()
    }

    pub fn schema_status(&self) -> Result<SchemaStatus, ChangelogError> {
        SqliteDocumentStore::open(&self.db_path)
            .and_then(|store| store.schema_status())
            .map_err(|err| ChangelogError::Store(format!("{err:#}")))
    }

    pub fn list(&self) -> Result<Vec<ChangelogDocument>, ChangelogError> {
        self.workflow()?.list()
    }

    pub fn get_by_id(&self, raw_id: &str) -> Result<ChangelogDocument, ChangelogError> {
        let id: DocumentId = raw_id.parse()?;
        match self.workflow() {
            Ok(workflow) => workflow.get_by_id(id),
            Err(err) => serve_cached(err, self.cache.get_by_id(id)),
        }
    }

    pub fn get_by_path(&self, path: &str) -> Result<ChangelogDocument, ChangelogError> {
        match self.workflow() {
            Ok(workflow) => workflow.get_by_path(path),
            Err(err) => serve_cached(err, self.cache.get_by_path(path)),
        }
    }

    pub fn create(&self, input: NewDocument) -> Result<ChangelogDocument, ChangelogError> {
        self.workflow()?.create(input)
    }

    pub fn update(
        &self,
        raw_id: &str,
        patch: &DocumentPatch,
    ) -> Result<ChangelogDocument, ChangelogError> {
        let id: DocumentId = raw_id.parse()?;
        self.workflow()?.update(id, patch)
    }

    pub fn delete(&self, raw_id: &str) -> Result<bool, ChangelogError> {
        let id: DocumentId = raw_id.parse()?;
        self.workflow()?.delete(id)
    }

    pub fn save_file(
        &self,
        request: &SaveFileRequest,
    ) -> Result<ChangelogDocument, ChangelogError> {
        self.workflow()?.save_file(request)
    }

    fn workflow(&self) -> Result<ChangelogWorkflow<SqliteDocumentStore>, ChangelogError> {
        let store = SqliteDocumentStore::open(&self.db_path)
            .map_err(|err| ChangelogError::Store(format!("{err:#}")))?;
        Ok(ChangelogWorkflow::new(store).with_cache(Arc::clone(&self.cache)))
    }
}

fn serve_cached(
    err: ChangelogError,
    cached: Option<ChangelogDocument>,
) -> Result<ChangelogDocument, ChangelogError> {
    match cached {
        Some(document) => {
            warn!(
                error = %err,
                path = %document.path,
                "database unavailable, serving cached changelog document"
            );
            Ok(document)
        }
        None => Err(err),
    }
}
