#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{Context, Result};
use changelog_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, resolve_save, ChangelogDocument, ChangelogError,
    DocumentId, DocumentStore, ResolvedSave, SaveFileRequest, UpsertOutcome,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const CHANGELOG_MIGRATION_VERSION: i64 = 1;

const SCHEMA_CHANGELOG_V1: &str = r"
CREATE TABLE IF NOT EXISTS changelog_documents (
  id TEXT PRIMARY KEY,
  path TEXT NOT NULL UNIQUE CHECK (length(trim(path)) > 0),
  name TEXT NOT NULL,
  version TEXT NOT NULL,
  content TEXT NOT NULL,
  size TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  created_by TEXT NOT NULL,
  last_modified_by TEXT NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1))
);

CREATE TRIGGER IF NOT EXISTS trg_changelog_documents_identity_immutable
BEFORE UPDATE ON changelog_documents
WHEN NEW.id <> OLD.id
  OR NEW.created_at <> OLD.created_at
  OR NEW.created_by <> OLD.created_by
BEGIN
  SELECT RAISE(FAIL, 'changelog_documents identity columns are immutable');
END;

CREATE INDEX IF NOT EXISTS idx_changelog_documents_updated_at
  ON changelog_documents(updated_at);
";

const DOCUMENT_COLUMNS: &str = "id, path, name, version, content, size,
    created_at, updated_at, created_by, last_modified_by, is_active";

pub struct SqliteDocumentStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub documents_table_present: bool,
}

impl SchemaStatus {
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.documents_table_present && self.current_version >= self.target_version
    }
}

impl SqliteDocumentStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Opens the database and applies pending migrations.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_CHANGELOG_V1)
            .context("failed to apply changelog schema")?;

        let now = format_rfc3339(now_utc())?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CHANGELOG_MIGRATION_VERSION, now],
            )
            .context("failed to register changelog schema migration")?;
        if inserted > 0 {
            debug!(version = CHANGELOG_MIGRATION_VERSION, "applied changelog schema migration");
        }

        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let current_version = if table_exists(&self.conn, "schema_migrations")? {
            self.conn
                .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
                    row.get::<_, i64>(0)
                })
                .context("failed to read schema_migrations")?
        } else {
            0
        };

        Ok(SchemaStatus {
            current_version,
            target_version: CHANGELOG_MIGRATION_VERSION,
            documents_table_present: table_exists(&self.conn, "changelog_documents")?,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn find_by_path(&self, path: &str) -> Result<Option<ChangelogDocument>, ChangelogError> {
        select_by_path(&self.conn, path)
    }

    fn find_by_id(&self, id: DocumentId) -> Result<Option<ChangelogDocument>, ChangelogError> {
        self.conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM changelog_documents WHERE id = ?1"),
                params![id.to_string()],
                parse_document_row,
            )
            .optional()
            .map_err(|err| store_error("failed to load changelog document by id", err))
    }

    fn list(&self) -> Result<Vec<ChangelogDocument>, ChangelogError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM changelog_documents ORDER BY path ASC"
            ))
            .map_err(|err| store_error("failed to prepare changelog listing", err))?;
        let rows = stmt
            .query_map([], parse_document_row)
            .map_err(|err| store_error("failed to list changelog documents", err))?;
        collect_rows(rows)
    }

    fn insert(&mut self, document: ChangelogDocument) -> Result<ChangelogDocument, ChangelogError> {
        insert_row(&self.conn, &document)?;
        Ok(document)
    }

    fn replace(
        &mut self,
        id: DocumentId,
        document: ChangelogDocument,
    ) -> Result<ChangelogDocument, ChangelogError> {
        if document.id != id {
            return Err(ChangelogError::Validation(format!(
                "document id {} does not match target id {id}",
                document.id
            )));
        }
        update_row(&self.conn, &document)?;
        Ok(document)
    }

    fn remove(&mut self, id: DocumentId) -> Result<bool, ChangelogError> {
        let affected = self
            .conn
            .execute("DELETE FROM changelog_documents WHERE id = ?1", params![id.to_string()])
            .map_err(|err| store_error("failed to delete changelog document", err))?;
        Ok(affected > 0)
    }

    /// Runs lookup, merge and write inside one `IMMEDIATE` transaction so the
    /// write lock is held from the read onward.
    fn upsert_by_path(
        &mut self,
        request: &SaveFileRequest,
        now: OffsetDateTime,
    ) -> Result<ResolvedSave, ChangelogError> {
        request.validate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| store_error("failed to start upsert transaction", err))?;

        let existing = select_by_path(&tx, request.path.trim())?;
        let resolved = resolve_save(existing.as_ref(), request, now)?;
        match resolved.outcome {
            UpsertOutcome::Created => insert_row(&tx, &resolved.document)?,
            UpsertOutcome::Updated => update_row(&tx, &resolved.document)?,
        }

        tx.commit().map_err(|err| store_error("failed to commit upsert transaction", err))?;
        Ok(resolved)
    }
}

fn select_by_path(
    conn: &Connection,
    path: &str,
) -> Result<Option<ChangelogDocument>, ChangelogError> {
    conn.query_row(
        &format!("SELECT {DOCUMENT_COLUMNS} FROM changelog_documents WHERE path = ?1"),
        params![path],
        parse_document_row,
    )
    .optional()
    .map_err(|err| store_error("failed to load changelog document by path", err))
}

fn insert_row(conn: &Connection, document: &ChangelogDocument) -> Result<(), ChangelogError> {
    conn.execute(
        &format!(
            "INSERT INTO changelog_documents({DOCUMENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            document.id.to_string(),
            document.path,
            document.name,
            document.version,
            document.content,
            document.size,
            format_rfc3339(document.created_at)?,
            format_rfc3339(document.updated_at)?,
            document.created_by,
            document.last_modified_by,
            bool_to_sql(document.is_active),
        ],
    )
    .map_err(|err| store_error("failed to insert changelog document", err))?;
    Ok(())
}

fn update_row(conn: &Connection, document: &ChangelogDocument) -> Result<(), ChangelogError> {
    let affected = conn
        .execute(
            "UPDATE changelog_documents SET
                path = ?2,
                name = ?3,
                version = ?4,
                content = ?5,
                size = ?6,
                updated_at = ?7,
                last_modified_by = ?8,
                is_active = ?9
             WHERE id = ?1",
            params![
                document.id.to_string(),
                document.path,
                document.name,
                document.version,
                document.content,
                document.size,
                format_rfc3339(document.updated_at)?,
                document.last_modified_by,
                bool_to_sql(document.is_active),
            ],
        )
        .map_err(|err| store_error("failed to update changelog document", err))?;

    if affected == 0 {
        return Err(ChangelogError::NotFound(format!("id {}", document.id)));
    }
    Ok(())
}

fn parse_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangelogDocument> {
    let id_raw: String = row.get(0)?;
    let created_at_raw: String = row.get(6)?;
    let updated_at_raw: String = row.get(7)?;
    let is_active: i64 = row.get(10)?;

    Ok(ChangelogDocument {
        id: parse_document_id(&id_raw)?,
        path: row.get(1)?,
        name: row.get(2)?,
        version: row.get(3)?,
        content: row.get(4)?,
        size: row.get(5)?,
        created_at: parse_rfc3339_utc(&created_at_raw).map_err(|err| to_sql_error(6, &err))?,
        updated_at: parse_rfc3339_utc(&updated_at_raw).map_err(|err| to_sql_error(7, &err))?,
        created_by: row.get(8)?,
        last_modified_by: row.get(9)?,
        is_active: is_active != 0,
    })
}

fn parse_document_id(raw: &str) -> rusqlite::Result<DocumentId> {
    let parsed = Ulid::from_string(raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid ULID: {raw}"),
            )),
        )
    })?;

    Ok(DocumentId(parsed))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn to_sql_error(column: usize, err: &ChangelogError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())),
    )
}

/// Maps a SQLite failure onto the domain taxonomy. Unique-key violations are
/// conflicts; other constraint failures are validation errors.
fn store_error(context: &str, err: rusqlite::Error) -> ChangelogError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        match failure.extended_code {
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                return ChangelogError::Conflict(format!("{context}: {err}"));
            }
            rusqlite::ffi::SQLITE_CONSTRAINT_CHECK | rusqlite::ffi::SQLITE_CONSTRAINT_TRIGGER => {
                return ChangelogError::Validation(format!("{context}: {err}"));
            }
            _ => {}
        }
    }
    ChangelogError::Store(format!("{context}: {err}"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, ChangelogError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(|err| store_error("failed to decode changelog row", err))?);
    }
    Ok(values)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use changelog_core::{ChangelogWorkflow, DocumentPatch, NewDocument};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteDocumentStore {
        must(SqliteDocumentStore::open_migrated(Path::new(":memory:")))
    }

    fn save(path: &str, content: &str, author: &str) -> SaveFileRequest {
        SaveFileRequest {
            path: path.to_string(),
            content: content.to_string(),
            author: author.to_string(),
            name: None,
            version: None,
        }
    }

    fn path_count(store: &SqliteDocumentStore, path: &str) -> i64 {
        must(store.connection().query_row(
            "SELECT COUNT(*) FROM changelog_documents WHERE path = ?1",
            params![path],
            |row| row.get::<_, i64>(0),
        ))
    }

    #[allow(clippy::let_and_return)]
    fn index_columns(conn: &Connection, index_name: &str) -> Vec<String> {
        let mut stmt = must(conn.prepare(&format!("PRAGMA index_info({index_name})")));
        let rows = must(stmt.query_map([], |row| row.get::<_, String>(2)));
        let columns: Vec<String> = rows.map(must).collect();
        columns
    }

    #[test]
    fn schema_contract_has_unique_path_and_identity_trigger() {
        let store = fixture_store();
        assert!(must(table_exists(store.connection(), "changelog_documents")));
        assert!(must(table_exists(store.connection(), "schema_migrations")));

        let mut stmt = must(store.connection().prepare("PRAGMA index_list(changelog_documents)"));
        let indexes: Vec<(String, i64)> = must(stmt.query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        }))
        .map(must)
        .collect();
        let has_unique_path = indexes.iter().any(|(name, unique)| {
            *unique == 1 && index_columns(store.connection(), name) == ["path"]
        });
        assert!(has_unique_path, "expected UNIQUE(path) on changelog_documents: {indexes:?}");

        let trigger_count: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type='trigger' AND name = 'trg_changelog_documents_identity_immutable'",
            [],
            |row| row.get(0),
        ));
        assert_eq!(trigger_count, 1);
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let mut store = fixture_store();
        let saved = must(store.upsert_by_path(&save("/a.md", "body", "bob"), now_utc()));

        must(store.migrate());
        must(store.migrate());

        let status = must(store.schema_status());
        assert!(status.is_current());
        assert_eq!(status.current_version, CHANGELOG_MIGRATION_VERSION);
        assert_eq!(must(store.find_by_id(saved.document.id)), Some(saved.document));
    }

    #[test]
    fn schema_status_reports_unmigrated_database() {
        let store = must(SqliteDocumentStore::open(Path::new(":memory:")));
        let status = must(store.schema_status());
        assert_eq!(status.current_version, 0);
        assert!(!status.documents_table_present);
        assert!(!status.is_current());
    }

    #[test]
    fn upsert_creates_then_updates_same_row() {
        let mut store = fixture_store();
        let first = must(store.upsert_by_path(&save("/x/y.md", "hello", "bob"), now_utc()));
        assert_eq!(first.outcome, UpsertOutcome::Created);

        let second = must(store.upsert_by_path(&save("/x/y.md", "hello again", "eve"), now_utc()));
        assert_eq!(second.outcome, UpsertOutcome::Updated);
        assert_eq!(second.document.id, first.document.id);
        assert_eq!(second.document.created_at, first.document.created_at);
        assert_eq!(second.document.created_by, "bob");
        assert_eq!(second.document.last_modified_by, "eve");
        assert!(second.document.updated_at > first.document.updated_at);

        let stored = must(store.find_by_path("/x/y.md"));
        assert_eq!(stored, Some(second.document));
        assert_eq!(path_count(&store, "/x/y.md"), 1);
    }

    #[test]
    fn insert_on_taken_path_is_a_conflict() {
        let mut store = fixture_store();
        let first = must(store.upsert_by_path(&save("/a.md", "one", "bob"), now_utc()));

        let mut clash = first.document.clone();
        clash.id = DocumentId::generate();
        match store.insert(clash) {
            Ok(doc) => panic!("expected conflict, inserted {}", doc.id),
            Err(err) => assert_eq!(err.code(), "conflict"),
        }
        assert_eq!(path_count(&store, "/a.md"), 1);
    }

    #[test]
    fn replace_unknown_id_is_not_found() {
        let mut store = fixture_store();
        let resolved = must(resolve_save(None, &save("/ghost.md", "", "bob"), now_utc()));
        let id = resolved.document.id;

        match store.replace(id, resolved.document) {
            Ok(_) => panic!("expected replace of unknown id to fail"),
            Err(err) => assert_eq!(err.code(), "not_found"),
        }
    }

    #[test]
    fn identity_columns_cannot_be_rewritten() {
        let mut store = fixture_store();
        let saved = must(store.upsert_by_path(&save("/a.md", "one", "bob"), now_utc()));

        let result = store.connection().execute(
            "UPDATE changelog_documents SET created_by = 'mallory' WHERE id = ?1",
            params![saved.document.id.to_string()],
        );
        let err = match result {
            Ok(_) => panic!("expected trigger to block identity rewrite"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn remove_reports_presence() {
        let mut store = fixture_store();
        let saved = must(store.upsert_by_path(&save("/a.md", "one", "bob"), now_utc()));

        assert!(!must(store.remove(DocumentId::generate())));
        assert!(must(store.remove(saved.document.id)));
        assert!(!must(store.remove(saved.document.id)));
        assert_eq!(must(store.find_by_id(saved.document.id)), None);
    }

    #[test]
    fn list_is_ordered_by_path() {
        let mut store = fixture_store();
        for path in ["/c.md", "/a.md", "/b.md"] {
            let _ = must(store.upsert_by_path(&save(path, "body", "bob"), now_utc()));
        }
        let paths: Vec<String> = must(store.list()).into_iter().map(|doc| doc.path).collect();
        assert_eq!(paths, ["/a.md", "/b.md", "/c.md"]);
    }

    #[test]
    fn workflow_round_trip_against_sqlite() {
        let mut workflow = ChangelogWorkflow::new(fixture_store());
        let created = must(workflow.create(NewDocument {
            path: "/change-logs/CHANGELOG.md".to_string(),
            content: "a".repeat(1024),
            author: "alice".to_string(),
            name: None,
            version: Some("2.0.0".to_string()),
            is_active: None,
        }));
        assert_eq!(created.name, "CHANGELOG.md");
        assert_eq!(created.size, "2.0 KB");

        let saved = must(workflow.save_file(&save("/change-logs/CHANGELOG.md", "short", "bob")));
        assert_eq!(saved.id, created.id);
        assert_eq!(saved.version, "2.0.0");
        assert_eq!(saved.size, "0.0 KB");

        let moved = must(workflow.update(
            created.id,
            &DocumentPatch {
                author: "carol".to_string(),
                path: Some("/change-logs/HISTORY.md".to_string()),
                is_active: Some(false),
                ..DocumentPatch::default()
            },
        ));
        assert_eq!(moved.path, "/change-logs/HISTORY.md");
        assert!(!moved.is_active);
        match workflow.get_by_path("/change-logs/CHANGELOG.md") {
            Ok(_) => panic!("old path must no longer resolve"),
            Err(err) => assert_eq!(err.code(), "not_found"),
        }
    }

    #[test]
    fn data_survives_reopen_of_file_database() {
        let db_path =
            std::env::temp_dir().join(format!("changelog-store-reopen-{}.sqlite3", Ulid::new()));

        let id = {
            let mut store = must(SqliteDocumentStore::open_migrated(&db_path));
            must(store.upsert_by_path(&save("/a.md", "persisted", "bob"), now_utc())).document.id
        };

        let store = must(SqliteDocumentStore::open_migrated(&db_path));
        let reloaded = must(store.find_by_id(id));
        assert_eq!(reloaded.map(|doc| doc.content), Some("persisted".to_string()));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn concurrent_upserts_on_one_path_leave_a_single_row() {
        let db_path =
            std::env::temp_dir().join(format!("changelog-store-race-{}.sqlite3", Ulid::new()));
        drop(must(SqliteDocumentStore::open_migrated(&db_path)));

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let db_path = db_path.clone();
                std::thread::spawn(move || {
                    let mut store = must(SqliteDocumentStore::open(&db_path));
                    for round in 0..10 {
                        let content = format!("worker {worker} round {round}");
                        let _ = must(store.upsert_by_path(
                            &save("/shared.md", &content, "racer"),
                            now_utc(),
                        ));
                    }
                })
            })
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                panic!("upsert worker panicked");
            }
        }

        let store = must(SqliteDocumentStore::open(&db_path));
        assert_eq!(path_count(&store, "/shared.md"), 1);

        let _ = std::fs::remove_file(&db_path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_save_sequence_keeps_one_document_per_path(
            saves in prop::collection::vec((0usize..4, "[a-z]{0,12}"), 1..40)
        ) {
            let mut workflow = ChangelogWorkflow::new(fixture_store());
            let mut first_ids: BTreeMap<String, DocumentId> = BTreeMap::new();

            for (slot, content) in &saves {
                let path = format!("/docs/file-{slot}.md");
                let saved = must(workflow.save_file(&save(&path, content, "prop")));
                let first = *first_ids.entry(path.clone()).or_insert(saved.id);
                prop_assert_eq!(first, saved.id);
                prop_assert_eq!(&saved.content, content);
            }

            let documents = must(workflow.list());
            prop_assert_eq!(documents.len(), first_ids.len());
            for path in first_ids.keys() {
                prop_assert_eq!(path_count(workflow.store(), path), 1);
            }
        }
    }
}
