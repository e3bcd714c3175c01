//! Shared types for the sync engine. The JSON-facing types (`Notetype`,
//! `Field`, `Template`, `Deck`) round-trip unknown keys through a flattened
//! map so manifests written by us can be read back by Anki unchanged.

use crate::paths::ExtantFile;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

pub type NoteId = i64;
pub type NotetypeId = i64;
pub type DeckId = i64;

/// In-memory form of a parsed note file.
#[derive(Clone, Debug, PartialEq)]
pub struct FlatNote {
    pub title: String,
    pub nid: NoteId,
    pub model: String,
    pub deck: String,
    pub tags: Vec<String>,
    pub markdown: bool,
    /// Field name to field body, in file order.
    pub fields: IndexMap<String, String>,
}

impl FlatNote {
    /// Render back to the note file format. For files written by the engine
    /// itself, `parse_note(note.render())` is the identity.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("## {}\n", self.title));
        out.push_str(&format!("nid: {}\n", self.nid));
        out.push_str(&format!("model: {}\n", self.model));
        out.push_str(&format!("deck: {}\n", self.deck));
        if self.tags.is_empty() {
            out.push_str("tags:\n");
        } else {
            out.push_str(&format!("tags: {}\n", self.tags.join(", ")));
        }
        out.push_str(&format!("markdown: {}\n", self.markdown));
        for (name, body) in &self.fields {
            out.push_str(&format!("\n### {}\n{}\n", name, body));
        }
        out
    }
}

/// A field descriptor of a notetype.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub ord: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A card template descriptor of a notetype.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub qfmt: String,
    #[serde(default)]
    pub afmt: String,
    #[serde(default)]
    pub ord: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A notetype as stored in the collection's `models` JSON and in the
/// notetypes manifests.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Notetype {
    pub id: NotetypeId,
    pub name: String,
    /// 0 for standard notetypes, 1 for cloze.
    #[serde(rename = "type", default)]
    pub kind: i64,
    pub flds: Vec<Field>,
    pub tmpls: Vec<Template>,
    /// Index of the sort field in `flds`.
    #[serde(default)]
    pub sortf: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Notetype {
    /// Map from field name to (ordinal, field descriptor).
    pub fn field_map(&self) -> IndexMap<&str, (u32, &Field)> {
        self.flds
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.as_str(), (f.ord.unwrap_or(i as u32), f)))
            .collect()
    }

    pub fn sort_idx(&self) -> u32 {
        self.sortf
    }

    /// Name of the sort field, if the sort index resolves to one.
    pub fn sort_field_name(&self) -> Option<&str> {
        self.field_map()
            .into_iter()
            .find(|(_, (ord, _))| *ord == self.sortf)
            .map(|(name, _)| name)
    }

    /// The names of the fields, in ordinal order.
    pub fn field_names(&self) -> Vec<&str> {
        self.flds.iter().map(|f| f.name.as_str()).collect()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Deck {
    pub id: DeckId,
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A note as loaded from the collection database.
#[derive(Clone, Debug, PartialEq)]
pub struct ColNote {
    pub nid: NoteId,
    pub guid: String,
    pub notetype_id: NotetypeId,
    pub deck: String,
    pub tags: Vec<String>,
    /// Field name to field value, in notetype field order.
    pub fields: IndexMap<String, String>,
}

/// Kinds of per-file change between two commits.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChangeType {
    Added,
    Deleted,
    Renamed,
    Modified,
    TypeChanged,
}

impl ChangeType {
    pub const ALL: [ChangeType; 5] = [
        ChangeType::Added,
        ChangeType::Deleted,
        ChangeType::Renamed,
        ChangeType::Modified,
        ChangeType::TypeChanged,
    ];

    /// The status letter used by `git diff --name-status`.
    pub fn letter(self) -> char {
        match self {
            ChangeType::Added => 'A',
            ChangeType::Deleted => 'D',
            ChangeType::Renamed => 'R',
            ChangeType::Modified => 'M',
            ChangeType::TypeChanged => 'T',
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// The change for a single file, with the absolute path into the tree the
/// file can currently be read from and the path relative to the repo root.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Delta {
    pub status: ChangeType,
    pub path: ExtantFile,
    pub relpath: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_no_tags() {
        let mut fields = IndexMap::new();
        fields.insert("Front".to_string(), "r".to_string());
        fields.insert("Back".to_string(), "s".to_string());
        let note = FlatNote {
            title: "Note".to_string(),
            nid: 123_412_341_234,
            model: "Basic".to_string(),
            deck: "a".to_string(),
            tags: vec![],
            markdown: false,
            fields,
        };
        let expected = indoc! {"
            ## Note
            nid: 123412341234
            model: Basic
            deck: a
            tags:
            markdown: false

            ### Front
            r

            ### Back
            s
        "};
        assert_eq!(note.render(), expected);
    }

    #[test]
    fn test_render_tags_joined_with_commas() {
        let mut fields = IndexMap::new();
        fields.insert("Front".to_string(), "q".to_string());
        let note = FlatNote {
            title: "Note".to_string(),
            nid: 1,
            model: "Basic".to_string(),
            deck: "a::b".to_string(),
            tags: vec!["math".to_string(), "easy".to_string()],
            markdown: true,
            fields,
        };
        assert!(note.render().contains("tags: math, easy\n"));
        assert!(note.render().contains("markdown: true\n"));
    }

    #[test]
    fn test_notetype_json_preserves_unknown_keys() {
        let raw = r#"{"id": 1, "name": "Basic", "type": 0, "css": ".card {}", "flds": [{"name": "Front", "ord": 0, "font": "Arial"}], "tmpls": [{"name": "Card 1", "qfmt": "{{Front}}", "afmt": "{{Back}}", "ord": 0}], "sortf": 0}"#;
        let nt: Notetype = serde_json::from_str(raw).unwrap();
        assert_eq!(nt.extra.get("css").unwrap(), ".card {}");
        assert_eq!(nt.flds[0].extra.get("font").unwrap(), "Arial");
        let back = serde_json::to_value(&nt).unwrap();
        assert_eq!(back.get("css").unwrap(), ".card {}");
        assert_eq!(back.get("type").unwrap(), 0);
    }
}
