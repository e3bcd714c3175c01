//! The note file grammar:
//!
//! ```text
//! file    : "## " TITLE NEWLINE
//!           "nid: " INT NEWLINE
//!           "model: " MODEL NEWLINE
//!           "deck: " DECK NEWLINE
//!           "tags:" (" " TAG ("," " "? TAG)*)? NEWLINE
//!           "markdown: " ("true"|"false") NEWLINE
//!           NEWLINE
//!           field+
//! field   : "### " NAME NEWLINE BODY
//! ```
//!
//! Parsing is reversible: [`crate::model::FlatNote::render`] reproduces a
//! machine-written file byte for byte.

use crate::paths::ExtantFile;
use fancy_regex::Regex;
use std::sync::LazyLock;

mod notes;

pub use notes::parse_note;

static NID_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^nid: [0-9]+$").unwrap());

/// Cheap pre-filter used by the diff walk: does this look like a note file?
/// Full validation happens in [`parse_note`].
pub fn is_note_file(file: &ExtantFile) -> bool {
    if file.as_path().extension().is_none_or(|e| e != "md") {
        return false;
    }
    let Ok(contents) = file.read_to_string() else {
        return false;
    };
    let mut lines = contents.lines();
    let Some(first) = lines.next() else {
        return false;
    };
    let Some(second) = lines.next() else {
        return false;
    };
    first.starts_with("## ") && NID_LINE_REGEX.is_match(second).unwrap_or(false)
}
