pub mod collection;
pub mod diff;
pub mod git;
pub(crate) mod helpers;
pub mod model;
pub mod parsers;
pub mod paths;
pub mod repo;
pub mod sync;
pub mod write;

use miette::{Diagnostic, SourceSpan};
use model::{NoteId, NotetypeId};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Sqlx Error: {source}")]
    Sqlx { source: sqlx::Error },
    #[error("Io Error: {description}, {source}")]
    Io {
        description: String,
        source: std::io::Error,
    },
    #[error("Json Error: {description}, {source}")]
    Json {
        description: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Ini(#[from] ini::Error),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Library(#[from] LibraryError),
}

// Note that `LibraryError` is `Clone` while `Error` is not.
#[derive(Clone, Debug, Diagnostic, Error)]
pub enum LibraryError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] PathErrorKind),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Git(#[from] GitErrorKind),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Repo(#[from] RepoErrorKind),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Sync(#[from] SyncErrorKind),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Note(#[from] NoteErrorKind),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Notetype(#[from] NotetypeErrorKind),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(#[from] ParseErrorKind),
}

/// Violations of the path-state discipline. Constructors in [`paths`] resolve
/// a path, classify it, and fail with one of these when the actual state of
/// the filesystem disagrees with the requested refinement.
#[derive(Clone, Debug, Diagnostic, Error)]
pub enum PathErrorKind {
    #[error("File not found: '{}'", .0.display())]
    MissingFile(PathBuf),
    #[error("Directory not found: '{}'", .0.display())]
    MissingDirectory(PathBuf),
    #[error("A file was expected at this location, but got a directory: '{}'", .0.display())]
    ExpectedFileButGotDirectory(PathBuf),
    #[error("A directory was expected at this location, but got a file: '{}'", .0.display())]
    ExpectedDirectoryButGotFile(PathBuf),
    #[error("An empty directory was expected at this location, but it is nonempty: '{}'", .0.display())]
    ExpectedEmptyDirectory(PathBuf),
    #[error(
        "A normal file or directory was expected, but got a weird pseudofile (e.g. a socket, or a device): '{}'",
        .0.display()
    )]
    StrangePath(PathBuf),
    #[error("fatal: destination path '{}' already exists and is not an empty directory.", .0.display())]
    TargetExists(PathBuf),
}

#[derive(Clone, Debug, Diagnostic, Error)]
pub enum GitErrorKind {
    #[error("Repo at '{}' doesn't contain ref '{sha}'", .repo.display())]
    RefNotFound { repo: PathBuf, sha: String },
    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("Not a git repository: '{}'", .0.display())]
    NotARepository(PathBuf),
}

#[derive(Clone, Debug, Diagnostic, Error)]
pub enum RepoErrorKind {
    #[error(
        "fatal: not a ki repository (or any parent up to mount point /)\nStopping at filesystem boundary."
    )]
    NotKiRepo,
    #[error("Invalid config at '{}': {reason}", .path.display())]
    InvalidConfig { path: PathBuf, reason: String },
}

#[derive(Clone, Debug, Diagnostic, Error)]
pub enum SyncErrorKind {
    #[error("Failed to push some refs to '{}'", .0.display())]
    #[diagnostic(help(
        "Updates were rejected because the tip of your current branch is behind\n\
         the Anki remote collection. Integrate the remote changes (e.g.\n\
         'ki pull ...') before pushing again."
    ))]
    UpdatesRejected(PathBuf),
    #[error("Checksum mismatch on {}. Was file changed?", .0.display())]
    CollectionChecksum(PathBuf),
}

#[derive(Clone, Debug, Diagnostic, Error)]
pub enum NoteErrorKind {
    #[error("Failed to locate note with nid '{0}' in Anki database.")]
    MissingNoteId(NoteId),
    #[error("Note with nid '{nid}' has invalid fields: {description}")]
    FieldValidation { nid: NoteId, description: String },
    #[error("Note with nid '{nid}' failed the fields health check with code {code}.")]
    Unhealthy { nid: NoteId, code: u8 },
}

#[derive(Clone, Debug, Diagnostic, Error)]
pub enum NotetypeErrorKind {
    #[error("Notetype '{0}' doesn't exist. Create it in Anki before adding notes via ki.")]
    #[diagnostic(help(
        "This may be caused by a corrupted notetypes manifest. The manifest must \
         contain definitions for all notetypes that appear in all note files."
    ))]
    Missing(String),
    #[error("Field with ordinal {ord} missing from notetype '{notetype}'.")]
    MissingFieldOrdinal { ord: u32, notetype: String },
    #[error(
        "Notetype '{model}' specified in note with nid '{nid}' does not match notetype '{expected}'."
    )]
    Mismatch {
        model: String,
        nid: NoteId,
        expected: String,
    },
    #[error("Notetype with id '{0}' not found in the collection.")]
    MissingId(NotetypeId),
}

/// Note grammar violations. Every variant pins the exact position of the
/// offense so callers (and tests) can report it without re-lexing.
#[derive(Clone, Debug, Diagnostic, Error)]
pub enum ParseErrorKind {
    #[error("Unexpected token {token:?} at line {line}, column {column}; expected {}", .expected.join(", "))]
    UnexpectedToken {
        line: usize,
        column: usize,
        token: String,
        /// Names of the terminals that would have been accepted here.
        expected: Vec<String>,
        /// The token lexed immediately before the offending one.
        context: Option<String>,
        #[source_code]
        src: String,
        #[label("here")]
        at: SourceSpan,
    },
    #[error("Forbidden character {character:?} at line {line}, column {column}")]
    ForbiddenCharacter {
        line: usize,
        column: usize,
        character: char,
        #[source_code]
        src: String,
        #[label("this character")]
        at: SourceSpan,
    },
}
