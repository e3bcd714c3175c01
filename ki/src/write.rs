//! Write-out engine: render an opened collection into a deck-nested tree of
//! note files plus notetype manifests, tidying HTML fields in batches along
//! the way.

use crate::collection::Collection;
use crate::helpers::{field_note_id, has_html};
use crate::helpers::{slugify, strip_html_tags};
use crate::model::{ColNote, FlatNote, Notetype, NotetypeId};
use crate::paths::{classify, ExtantDir, ExtantFile, PathState};
use crate::repo::MANIFEST_FILE;
use crate::Error;
use indexmap::IndexMap;
use indicatif::ProgressBar;
use log::warn;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::process::Command;

/// HTML tidying is offloaded to child processes in batches this large, to
/// amortize process startup.
const TIDY_BATCH_SIZE: usize = 500;

/// Filenames keep at most this many characters of the slug.
const MAX_FILENAME_LEN: usize = 30;

/// The title written into every machine-generated note file.
const NOTE_TITLE: &str = "Note";

/// Render the whole collection into `targetdir`.
pub async fn write_repository(
    col: &Collection,
    targetdir: &ExtantDir,
    silent: bool,
) -> Result<(), Error> {
    let nids = col.find_notes().await?;
    let progress = if silent {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(nids.len() as u64)
    };

    let mut decks: IndexMap<String, Vec<ColNote>> = IndexMap::new();
    for nid in nids {
        let note = col.get_note(nid).await?;
        decks.entry(note.deck.clone()).or_default().push(note);
        progress.inc(1);
    }
    progress.finish_and_clear();

    // Spill HTML-looking field bodies to files so the external tidier can
    // rewrite them in place.
    let spill_tmp = tempfile::tempdir().map_err(|e| Error::Io {
        description: "Failed to create temporary directory".to_string(),
        source: e,
    })?;
    let spill_dir = ExtantDir::check(spill_tmp.path())?;
    let mut spilled: HashMap<String, ExtantFile> = HashMap::new();
    for notes in decks.values() {
        for note in notes {
            for (fieldname, text) in &note.fields {
                if has_html(text) {
                    let fid = field_note_id(note.nid, fieldname);
                    let file = spill_dir.write_file(&fid, text)?;
                    spilled.insert(fid, file);
                }
            }
        }
    }
    tidy_html_recursively(&spill_dir, silent)?;

    write_decks(col, targetdir, &decks, &spilled)?;

    // Root manifest: every notetype in the collection.
    write_manifest(targetdir, col.notetypes())?;
    Ok(())
}

/// Run the external HTML tidier over every spilled file, in place.
fn tidy_html_recursively(root: &ExtantDir, silent: bool) -> Result<(), Error> {
    let files = root.files()?;
    let progress = if silent {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(files.len() as u64)
    };
    for batch in files.chunks(TIDY_BATCH_SIZE) {
        let mut command = Command::new("tidy");
        command.args(["-q", "-m", "-i", "-omit", "-utf8", "--tidy-mark", "no"]);
        for file in batch {
            command.arg(file.as_path());
        }
        // Tidy exits nonzero on mere warnings; only a spawn failure counts.
        command.output().map_err(|e| Error::Io {
            description: "Failed to run tidy".to_string(),
            source: e,
        })?;
        progress.inc(batch.len() as u64);
    }
    progress.finish_and_clear();
    Ok(())
}

#[derive(Default)]
struct DeckNode<'a> {
    children: BTreeMap<String, DeckNode<'a>>,
    notes: Vec<&'a ColNote>,
}

/// Write every deck directory. Traversal is a DFS over the deck tree, with
/// each node's notetype set propagated to its parent so a deck's manifest
/// covers its whole subtree.
fn write_decks(
    col: &Collection,
    targetdir: &ExtantDir,
    decks: &IndexMap<String, Vec<ColNote>>,
    spilled: &HashMap<String, ExtantFile>,
) -> Result<(), Error> {
    let mut root = DeckNode::default();
    for (deck_name, notes) in decks {
        let mut node = &mut root;
        for component in deck_name.split("::") {
            // Strip leading periods so we don't get hidden folders.
            let component = component.strip_prefix('.').unwrap_or(component);
            node = node.children.entry(component.to_string()).or_default();
        }
        node.notes.extend(notes.iter());
    }
    for (name, child) in &root.children {
        let child_dir = targetdir.mkdir_forced(name)?;
        write_deck_node(col, child, &child_dir, spilled)?;
    }
    Ok(())
}

fn write_deck_node(
    col: &Collection,
    node: &DeckNode<'_>,
    dir: &ExtantDir,
    spilled: &HashMap<String, ExtantFile>,
) -> Result<HashSet<NotetypeId>, Error> {
    let mut notetype_ids = HashSet::new();
    for note in &node.notes {
        let Ok(notetype) = col.notetype(note.notetype_id) else {
            warn!("Couldn't find notetype for note {}", note.nid);
            continue;
        };
        notetype_ids.insert(notetype.id);
        let Some(sort_field_text) = get_sort_field_text(note, notetype) else {
            warn!("Couldn't find sort field for note {}", note.nid);
            continue;
        };
        let filename = fresh_note_filename(dir, &sort_field_text);
        let payload = tidied_payload(note, &notetype.name, spilled)?;
        dir.write_file(&filename, &payload)?;
    }
    for (name, child) in &node.children {
        let child_dir = dir.mkdir_forced(name)?;
        notetype_ids.extend(write_deck_node(col, child, &child_dir, spilled)?);
    }
    let subtree_models = col.notetypes().filter(|nt| notetype_ids.contains(&nt.id));
    write_manifest(dir, subtree_models)?;
    Ok(notetype_ids)
}

/// The sort field content of a note, through the notetype's field map and
/// sort index. `None` when any indirection is missing.
pub fn get_sort_field_text(note: &ColNote, notetype: &Notetype) -> Option<String> {
    let name = notetype.sort_field_name()?;
    note.fields.get(name).cloned()
}

/// Derive a filename from the sort field: strip markup, slugify, cap the
/// length, then disambiguate numerically against files already present.
pub fn fresh_note_filename(dir: &ExtantDir, sort_field_text: &str) -> String {
    let mut name: String = slugify(&strip_html_tags(sort_field_text))
        .chars()
        .take(MAX_FILENAME_LEN)
        .collect();
    if name.is_empty() {
        name = "note".to_string();
    }
    let mut filename = format!("{}.md", name);
    let mut i = 1;
    while !matches!(classify(dir.as_path().join(&filename)), PathState::Missing(_)) {
        filename = format!("{}_{}.md", name, i);
        i += 1;
    }
    filename
}

/// Render a note loaded from the collection to its file payload.
pub(crate) fn render_note(note: &ColNote, model_name: &str) -> String {
    render_fields(note, model_name, note.fields.clone())
}

fn render_fields(note: &ColNote, model_name: &str, fields: IndexMap<String, String>) -> String {
    FlatNote {
        title: NOTE_TITLE.to_string(),
        nid: note.nid,
        model: model_name.to_string(),
        deck: note.deck.clone(),
        tags: note.tags.clone(),
        markdown: false,
        fields,
    }
    .render()
}

/// The note file payload, with tidied bodies substituted where a field was
/// spilled for the tidier.
fn tidied_payload(
    note: &ColNote,
    model_name: &str,
    spilled: &HashMap<String, ExtantFile>,
) -> Result<String, Error> {
    let mut fields = IndexMap::new();
    for (fieldname, text) in &note.fields {
        let fid = field_note_id(note.nid, fieldname);
        let body = match spilled.get(&fid) {
            Some(file) => file.read_to_string()?,
            None => text.clone(),
        };
        fields.insert(fieldname.clone(), body);
    }
    Ok(render_fields(note, model_name, fields))
}

/// Serialize notetypes to a `notetypes-manifest.json` in `dir`, keyed by id.
fn write_manifest<'a>(
    dir: &ExtantDir,
    models: impl Iterator<Item = &'a Notetype>,
) -> Result<(), Error> {
    let map: IndexMap<String, &Notetype> = models.map(|nt| (nt.id.to_string(), nt)).collect();
    let json = serde_json::to_string_pretty(&map).map_err(|e| Error::Json {
        description: "Failed to serialize notetypes manifest".to_string(),
        source: e,
    })?;
    dir.write_file(MANIFEST_FILE, &json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::tests::basic_notetype;
    use crate::parsers::parse_note;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fresh_note_filename_disambiguates() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ExtantDir::check(tmp.path()).unwrap();
        assert_eq!(fresh_note_filename(&dir, "r"), "r.md");
        dir.write_file("r.md", "x").unwrap();
        assert_eq!(fresh_note_filename(&dir, "r"), "r_1.md");
        dir.write_file("r_1.md", "x").unwrap();
        assert_eq!(fresh_note_filename(&dir, "r"), "r_2.md");
    }

    #[test]
    fn test_fresh_note_filename_strips_markup_and_caps_length() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ExtantDir::check(tmp.path()).unwrap();
        assert_eq!(fresh_note_filename(&dir, "<b>Hello</b> World"), "hello-world.md");
        let long = "x".repeat(100);
        assert_eq!(fresh_note_filename(&dir, &long), format!("{}.md", "x".repeat(30)));
    }

    #[tokio::test]
    async fn test_write_repository_builds_deck_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let mut col = Collection::create(tmp.path().join("collection.anki2"))
            .await
            .unwrap();
        let mid = col.add_notetype(basic_notetype());
        col.add_note(mid, &["r".to_string(), "s".to_string()], &[], "a")
            .await
            .unwrap();
        col.add_note(mid, &["q".to_string(), "t".to_string()], &[], "top::sub")
            .await
            .unwrap();

        let out = tmp.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let target = ExtantDir::check(&out).unwrap();
        write_repository(&col, &target, true).await.unwrap();

        let note = parse_note(&std::fs::read_to_string(out.join("a/r.md")).unwrap()).unwrap();
        assert_eq!(note.model, "Basic");
        assert_eq!(note.deck, "a");
        assert_eq!(note.fields["Back"], "s");
        assert!(out.join("top/sub/q.md").is_file());

        // Root manifest lists the notetype; so does every deck level on the
        // path to a note, the parent inheriting the child's set.
        for manifest in [
            out.join(MANIFEST_FILE),
            out.join("a").join(MANIFEST_FILE),
            out.join("top").join(MANIFEST_FILE),
            out.join("top/sub").join(MANIFEST_FILE),
        ] {
            let json: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(&manifest).unwrap()).unwrap();
            assert!(
                json.get(mid.to_string()).is_some(),
                "missing notetype in {}",
                manifest.display()
            );
        }
        col.close().await.unwrap();
    }
}
