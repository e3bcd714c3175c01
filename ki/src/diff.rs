//! Diff engine: classify per-file changes between the last-push baseline and
//! HEAD into [`Delta`]s, decomposing renames that cross note-id boundaries.

use crate::git::RepoRef;
use crate::model::{ChangeType, Delta};
use crate::parsers::{is_note_file, parse_note};
use crate::paths::{classify, ExtantFile, PathState};
use crate::repo::{GITIGNORE_FILE, GITMODULES_FILE, GIT_DIR, KI, MANIFEST_FILE};
use crate::Error;
use itertools::Itertools;
use log::warn;
use std::path::Path;

/// Path names that never participate in a sync.
const IGNORE: [&str; 5] = [GIT_DIR, KI, GITIGNORE_FILE, GITMODULES_FILE, MANIFEST_FILE];

/// Whether the relative path carries one of the well-known ignore names.
fn name_ignored(rel: &Path) -> bool {
    for component in rel.components() {
        let name = component.as_os_str();
        if IGNORE.iter().any(|p| name == *p) {
            warn!("Ignoring {} matching pattern {:?}", rel.display(), name);
            return true;
        }
    }
    false
}

/// Whether a path should be skipped: ignored by name, or an extant file
/// that is not a parseable note file.
fn ignored(abs: &Path, rel: &Path) -> bool {
    if name_ignored(rel) {
        return true;
    }
    if let PathState::File(file) = classify(abs) {
        if !is_note_file(&file) {
            warn!("Not a note file: {}", abs.display());
            return true;
        }
    }
    false
}

/// Compute the deltas between `baseline` and the HEAD of its repository.
///
/// Deleted files no longer exist in the working tree, so the baseline commit
/// is checked out into an ephemeral clone and deleted-side paths resolve
/// there. Renames whose two sides disagree on nid become a delete plus an
/// add; parsing failures on either side of a rename abort the diff.
pub fn get_deltas_since_last_push(baseline: &RepoRef) -> Result<Vec<Delta>, Error> {
    let a_root = tempfile::tempdir()
        .map_err(|e| Error::Io {
            description: "Failed to create temporary directory".to_string(),
            source: e,
        })?
        .into_path();
    let a_repo = baseline.repo.clone_recursive(&a_root.join("deleted"))?;
    a_repo.reset_hard(&baseline.sha)?;

    let a_dir = a_repo.root();
    let b_dir = baseline.repo.root();

    let mut deltas: Vec<Delta> = Vec::new();
    for kind in ChangeType::ALL {
        for (rel, new_rel) in baseline.repo.diff_name_status(&baseline.sha, "HEAD", kind)? {
            match kind {
                ChangeType::Deleted => {
                    if ignored(&a_dir.join(&rel), &rel) {
                        continue;
                    }
                    let Ok(a_path) = ExtantFile::check(a_dir.join(&rel)) else {
                        warn!("Deleted file not found in source commit: {}", rel.display());
                        continue;
                    };
                    deltas.push(Delta {
                        status: ChangeType::Deleted,
                        path: a_path,
                        relpath: rel,
                    });
                }
                ChangeType::Renamed => {
                    let Some(new_rel) = new_rel else {
                        warn!("Rename without target: {}", rel.display());
                        continue;
                    };
                    if name_ignored(&rel) || name_ignored(&new_rel) {
                        continue;
                    }
                    let a_path = ExtantFile::check(a_dir.join(&rel))?;
                    let b_path = ExtantFile::check(b_dir.join(&new_rel))?;
                    // A rename where neither side resembles a note is not
                    // ours to track. A side that resembles one but fails to
                    // parse is a real error, not a droppable delta.
                    if !is_note_file(&a_path) && !is_note_file(&b_path) {
                        warn!("Ignoring rename of non-note file {}", rel.display());
                        continue;
                    }
                    let a_note = parse_note(&a_path.read_to_string()?)?;
                    let b_note = parse_note(&b_path.read_to_string()?)?;
                    if a_note.nid == b_note.nid {
                        deltas.push(Delta {
                            status: ChangeType::Renamed,
                            path: b_path,
                            relpath: new_rel,
                        });
                    } else {
                        deltas.push(Delta {
                            status: ChangeType::Deleted,
                            path: a_path,
                            relpath: rel,
                        });
                        deltas.push(Delta {
                            status: ChangeType::Added,
                            path: b_path,
                            relpath: new_rel,
                        });
                    }
                }
                _ => {
                    if ignored(&b_dir.join(&rel), &rel) {
                        continue;
                    }
                    let Ok(b_path) = ExtantFile::check(b_dir.join(&rel)) else {
                        warn!("Diff target not found: {}", rel.display());
                        continue;
                    };
                    deltas.push(Delta {
                        status: kind,
                        path: b_path,
                        relpath: rel,
                    });
                }
            }
        }
    }
    Ok(deltas
        .into_iter()
        .unique_by(|d| (d.status, d.relpath.clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitRepo;
    use crate::paths::ExtantDir;
    use std::fs;
    use std::path::PathBuf;

    fn note_text(nid: i64, front: &str) -> String {
        format!(
            "## Note\nnid: {}\nmodel: Basic\ndeck: a\ntags:\nmarkdown: false\n\n### Front\n{}\n\n### Back\ns\n",
            nid, front
        )
    }

    fn scratch_repo() -> (tempfile::TempDir, GitRepo) {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("a")).unwrap();
        fs::write(tmp.path().join("a/r.md"), note_text(1, "r")).unwrap();
        fs::write(tmp.path().join("a/q.md"), note_text(2, "q")).unwrap();
        fs::write(tmp.path().join("notetypes-manifest.json"), "{}").unwrap();
        let dir = ExtantDir::check(tmp.path()).unwrap();
        let repo = GitRepo::init(&dir).unwrap();
        repo.add_all().unwrap();
        repo.commit("Initial commit").unwrap();
        (tmp, repo)
    }

    #[test]
    fn test_modified_added_deleted() {
        let (tmp, repo) = scratch_repo();
        let baseline = RepoRef::head(repo.clone()).unwrap();

        fs::write(tmp.path().join("a/r.md"), note_text(1, "r2")).unwrap();
        fs::write(tmp.path().join("a/new.md"), note_text(0, "new")).unwrap();
        fs::remove_file(tmp.path().join("a/q.md")).unwrap();
        repo.add_all().unwrap();
        repo.commit("edits").unwrap();

        let deltas = get_deltas_since_last_push(&baseline).unwrap();
        let mut kinds: Vec<(ChangeType, PathBuf)> = deltas
            .iter()
            .map(|d| (d.status, d.relpath.clone()))
            .collect();
        kinds.sort_by_key(|(_, p)| p.clone());
        assert_eq!(
            kinds,
            vec![
                (ChangeType::Added, PathBuf::from("a/new.md")),
                (ChangeType::Deleted, PathBuf::from("a/q.md")),
                (ChangeType::Modified, PathBuf::from("a/r.md")),
            ]
        );
        // Deleted-side files resolve in the ephemeral baseline checkout.
        let deleted = deltas
            .iter()
            .find(|d| d.status == ChangeType::Deleted)
            .unwrap();
        assert!(deleted.path.as_path().is_file());
    }

    #[test]
    fn test_rename_same_nid_stays_single() {
        let (tmp, repo) = scratch_repo();
        let baseline = RepoRef::head(repo.clone()).unwrap();

        fs::rename(tmp.path().join("a/r.md"), tmp.path().join("a/renamed.md")).unwrap();
        repo.add_all().unwrap();
        repo.commit("rename").unwrap();

        let deltas = get_deltas_since_last_push(&baseline).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].status, ChangeType::Renamed);
        assert_eq!(deltas[0].relpath, PathBuf::from("a/renamed.md"));
    }

    #[test]
    fn test_rename_with_nid_change_decomposes() {
        let (tmp, repo) = scratch_repo();
        let baseline = RepoRef::head(repo.clone()).unwrap();

        fs::remove_file(tmp.path().join("a/r.md")).unwrap();
        fs::write(tmp.path().join("a/moved.md"), note_text(999, "r")).unwrap();
        repo.add_all().unwrap();
        repo.commit("rename with new nid").unwrap();

        let deltas = get_deltas_since_last_push(&baseline).unwrap();
        let mut kinds: Vec<(ChangeType, PathBuf)> = deltas
            .iter()
            .map(|d| (d.status, d.relpath.clone()))
            .collect();
        kinds.sort_by_key(|(_, p)| p.clone());
        assert_eq!(
            kinds,
            vec![
                (ChangeType::Added, PathBuf::from("a/moved.md")),
                (ChangeType::Deleted, PathBuf::from("a/r.md")),
            ]
        );
    }

    #[test]
    fn test_manifest_and_non_note_files_are_ignored() {
        let (tmp, repo) = scratch_repo();
        let baseline = RepoRef::head(repo.clone()).unwrap();

        fs::write(tmp.path().join("notetypes-manifest.json"), r#"{"1": {}}"#).unwrap();
        fs::write(tmp.path().join("a/README.txt"), "not a note").unwrap();
        repo.add_all().unwrap();
        repo.commit("noise").unwrap();

        let deltas = get_deltas_since_last_push(&baseline).unwrap();
        assert!(deltas.is_empty());
    }

    #[test]
    fn test_unparseable_rename_side_is_an_error() {
        let (tmp, repo) = scratch_repo();
        let baseline = RepoRef::head(repo.clone()).unwrap();

        // Same bytes except a mangled nid line: git still sees a rename, but
        // the new side no longer parses.
        let mangled = note_text(1, "r").replace("nid: 1", "nid: x");
        fs::remove_file(tmp.path().join("a/r.md")).unwrap();
        fs::write(tmp.path().join("a/renamed.md"), mangled).unwrap();
        repo.add_all().unwrap();
        repo.commit("mangled rename").unwrap();

        let deltas = get_deltas_since_last_push(&baseline);
        match deltas {
            Err(Error::Library(crate::LibraryError::Parse(_))) => {}
            other => panic!("expected parse error, got {:?}", other.map(|d| d.len())),
        }
    }
}
