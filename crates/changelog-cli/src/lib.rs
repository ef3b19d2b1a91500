//! Command surface for the storefront changelog document store.
//!
//! Every subcommand prints a JSON envelope on stdout. Failed operations print
//! a failure envelope carrying the error code and then return an error so the
//! binary exits non-zero.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use changelog_core::{
    ChangelogError, ChangelogWorkflow, DocumentId, DocumentPatch, Envelope, NewDocument,
    SaveFileRequest,
};
use changelog_store_sqlite::SqliteDocumentStore;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "changelog")]
#[command(about = "Storefront changelog document CLI")]
pub struct Cli {
    #[arg(long, env = "CHANGELOG_DB", default_value = "./changelog.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or update the document stored at a path.
    SaveFile(SaveFileArgs),
    /// Create a document; fails when the path is taken.
    Create(CreateArgs),
    Show(IdArgs),
    /// Look up a document by its storage path.
    ShowPath(PathArgs),
    Update(UpdateArgs),
    Delete(IdArgs),
    List,
}

/// Body for `save-file` and `create`. One source must be given; an empty
/// `--content ""` is a valid body.
#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct RequiredContentArgs {
    #[arg(long)]
    content: Option<String>,
    #[arg(long)]
    content_file: Option<PathBuf>,
}

/// Body for `update`; leaving both out keeps the stored content.
#[derive(Debug, Args)]
#[group(required = false, multiple = false)]
pub struct ContentArgs {
    #[arg(long)]
    content: Option<String>,
    #[arg(long)]
    content_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct SaveFileArgs {
    #[arg(long)]
    path: String,
    #[arg(long)]
    author: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    version: Option<String>,
    #[command(flatten)]
    content: RequiredContentArgs,
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    #[arg(long)]
    path: String,
    #[arg(long)]
    author: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    version: Option<String>,
    #[arg(long)]
    inactive: bool,
    #[command(flatten)]
    content: RequiredContentArgs,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    author: String,
    #[arg(long)]
    path: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    version: Option<String>,
    #[arg(long)]
    active: Option<bool>,
    #[command(flatten)]
    content: ContentArgs,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct PathArgs {
    #[arg(long)]
    path: String,
}

#[derive(Debug, Serialize)]
struct FailureEnvelope {
    success: bool,
    message: String,
    code: &'static str,
}

impl RequiredContentArgs {
    fn resolve(&self) -> Result<String> {
        read_content(self.content.as_deref(), self.content_file.as_deref())?
            .ok_or_else(|| anyhow!("one of --content or --content-file is required"))
    }
}

impl ContentArgs {
    fn resolve(&self) -> Result<Option<String>> {
        read_content(self.content.as_deref(), self.content_file.as_deref())
    }
}

fn read_content(content: Option<&str>, content_file: Option<&Path>) -> Result<Option<String>> {
    if let Some(path) = content_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read content file {}", path.display()))?;
        return Ok(Some(content));
    }
    Ok(content.map(ToString::to_string))
}

/// Executes a parsed [`Cli`] against the database it names.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated, a content
/// file cannot be read, or the requested operation fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = open_store(&cli.db)?;
    let mut workflow = ChangelogWorkflow::new(store);
    run_command(cli.command, &mut workflow)
}

/// Executes a parsed command against an existing workflow.
///
/// # Errors
/// Returns an error when the operation fails; the failure envelope has
/// already been printed at that point.
pub fn run_command(
    command: Command,
    workflow: &mut ChangelogWorkflow<SqliteDocumentStore>,
) -> Result<()> {
    match command {
        Command::SaveFile(args) => {
            let request = SaveFileRequest {
                path: args.path,
                content: args.content.resolve()?,
                author: args.author,
                name: args.name,
                version: args.version,
            };
            emit(workflow.save_file(&request), Some("file saved"))
        }
        Command::Create(args) => {
            let input = NewDocument {
                path: args.path,
                content: args.content.resolve()?,
                author: args.author,
                name: args.name,
                version: args.version,
                is_active: Some(!args.inactive),
            };
            emit(workflow.create(input), Some("changelog document created"))
        }
        Command::Show(args) => {
            let found = parse_id(&args.id).and_then(|id| workflow.get_by_id(id));
            emit(found, None)
        }
        Command::ShowPath(args) => emit(workflow.get_by_path(&args.path), None),
        Command::Update(args) => {
            let patch = DocumentPatch {
                author: args.author,
                path: args.path,
                name: args.name,
                version: args.version,
                content: args.content.resolve()?,
                is_active: args.active,
            };
            let updated = parse_id(&args.id).and_then(|id| workflow.update(id, &patch));
            emit(updated, Some("changelog document updated"))
        }
        Command::Delete(args) => {
            let removed = parse_id(&args.id).and_then(|id| {
                if workflow.delete(id)? {
                    Ok(true)
                } else {
                    Err(ChangelogError::NotFound(id.to_string()))
                }
            });
            emit(removed, Some("changelog document deleted"))
        }
        Command::List => emit(workflow.list(), None),
    }
}

fn open_store(db_path: &Path) -> Result<SqliteDocumentStore> {
    let store = SqliteDocumentStore::open(db_path)?;
    store.migrate()?;
    debug!(db = %db_path.display(), "changelog store ready");
    Ok(store)
}

fn parse_id(raw: &str) -> Result<DocumentId, ChangelogError> {
    raw.parse()
}

fn emit<T: Serialize>(result: Result<T, ChangelogError>, message: Option<&str>) -> Result<()> {
    match result {
        Ok(data) => {
            let envelope = match message {
                Some(message) => Envelope::ok_with_message(data, message),
                None => Envelope::ok(data),
            };
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            Ok(())
        }
        Err(err) => {
            let envelope = FailureEnvelope {
                success: false,
                message: format!("operation failed: {err}"),
                code: err.code(),
            };
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            Err(anyhow!(err))
        }
    }
}
