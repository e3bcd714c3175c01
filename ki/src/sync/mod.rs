//! Sync driver: orchestrates clone, push, and pull; owns the hashes log,
//! the last-push file, the backups, and the internal mirror; holds the
//! database lock for the duration of a sync.

use crate::collection::{Collection, CollectionLock, FieldsCheck};
use crate::diff::get_deltas_since_last_push;
use crate::git::{GitRepo, RepoRef, BRANCH_NAME};
use crate::helpers::{markdown_to_html, md5_of_file, plain_to_html};
use crate::model::{ChangeType, FlatNote, NoteId, Notetype, NotetypeId};
use crate::parsers::parse_note;
use crate::paths::{
    self, copy_file, copytree, mkdir_empty, EmptyDir, ExtantDir, ExtantFile, NoPath,
};
use crate::repo::{
    self, append_md5sum, KiRepo, BACKUPS_DIR, CONFIG_FILE, GITIGNORE_FILE, HASHES_FILE, KI,
    LAST_PUSH_FILE, MANIFEST_FILE, MIRROR_DIR,
};
use crate::write::{fresh_note_filename, get_sort_field_text, render_note, write_repository};
use crate::{
    Error, GitErrorKind, LibraryError, NoteErrorKind, NotetypeErrorKind, SyncErrorKind,
};
use indexmap::IndexMap;
use log::{info, warn};
use std::path::PathBuf;


const REMOTE_NAME: &str = "anki";

/// Outcome of a push or pull.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncStatus {
    UpToDate,
    Synced,
}

fn echo(message: &str, silent: bool) {
    if !silent {
        println!("{}", message);
    }
}

fn ephemeral_dir(suffix: &str) -> Result<PathBuf, Error> {
    let tmp = tempfile::tempdir()
        .map_err(|e| Error::Io {
            description: "Failed to create temporary directory".to_string(),
            source: e,
        })?
        .into_path();
    Ok(tmp.join(suffix))
}

// CLONE

/// Clone a collection into `directory` (default: the collection filename
/// stem under the working directory). On any failure after the target was
/// created, the target is removed.
pub async fn clone(collection: &str, directory: Option<&str>) -> Result<(), Error> {
    echo("Cloning.", false);
    let col_file = ExtantFile::check(collection)?;
    let target = match directory {
        Some(d) => mkdir_empty(d)?,
        None => {
            let cwd = paths::current_dir()?;
            mkdir_empty(cwd.as_path().join(col_file.file_stem()))?
        }
    };
    let target_path = target.as_path().to_path_buf();
    match clone_into(&col_file, target, "Initial commit", false).await {
        Ok(_) => Ok(()),
        Err(err) => {
            echo("Failed: exiting.", false);
            if target_path.is_dir() {
                let _ = std::fs::remove_dir_all(&target_path);
            }
            Err(err)
        }
    }
}

/// Materialize the collection into `targetdir`, initialize both repos, seed
/// the internal mirror, and record the first hash and last-push commit.
async fn clone_into(
    col_file: &ExtantFile,
    targetdir: EmptyDir,
    msg: &str,
    silent: bool,
) -> Result<ExtantDir, Error> {
    echo(
        &format!("Found collection file at '{}'", col_file.as_path().display()),
        silent,
    );
    let md5sum = md5_of_file(col_file)?;
    echo(&format!("Computed md5sum: {}", md5sum), silent);
    echo(
        &format!("Cloning into '{}'...", targetdir.as_path().display()),
        silent,
    );

    // Sidecar leaves.
    let (targetdir, ki_dir) = targetdir.mksubdir(KI)?;
    let ki_dir = ki_dir.into_extant();
    let config_file = ki_dir.touch(CONFIG_FILE)?;
    repo::write_config(&config_file, col_file)?;
    ki_dir.touch(LAST_PUSH_FILE)?;
    ki_dir.mkdir_forced(BACKUPS_DIR)?;
    let mirror_dir = ki_dir.mkdir_forced(MIRROR_DIR)?;
    targetdir.write_file(GITIGNORE_FILE, ".ki/\n")?;

    // Render the whole database into the tree.
    let col = Collection::open(col_file).await?;
    write_repository(&col, &targetdir, silent).await?;
    col.close().await?;

    // Main repository, then an empty repository for the mirror.
    let main_repo = GitRepo::init(&targetdir)?;
    main_repo.add_all()?;
    main_repo.commit(msg)?;
    GitRepo::init(&mirror_dir)?;

    append_md5sum(&ki_dir, &md5sum, &col_file.file_name())?;
    echo(
        &format!(
            "Wrote md5sum to '{}'",
            ki_dir.as_path().join(HASHES_FILE).display()
        ),
        silent,
    );

    // Seed the mirror with the flattened tree and write the first
    // last-push ref.
    let kirepo = repo::load_repo(&targetdir)?;
    let head = RepoRef::head(kirepo.repo.clone())?;
    let stage = build_stage(&kirepo, &head)?;
    replace_mirror(&kirepo, &stage)?;
    kirepo.write_last_push(&head.sha)?;
    Ok(targetdir)
}

// STAGING

/// An ephemeral copy of the main repository with submodules flattened and
/// its `.git/` replaced by the internal mirror's, plus one new commit for
/// the current tree. The mirror's history flows through every stage.
struct Stage {
    repo: GitRepo,
    root: ExtantDir,
    /// Mirror HEAD before the stage commit; `None` on the very first stage.
    baseline: Option<String>,
    head_sha: String,
}

fn build_stage(kirepo: &KiRepo, head: &RepoRef) -> Result<Stage, Error> {
    let stage_path = ephemeral_dir("stage")?;
    let stage_repo = kirepo.repo.clone_recursive(&stage_path)?;
    stage_repo.reset_hard(&head.sha)?;
    stage_repo.flatten_submodules()?;

    let stage_git = ExtantDir::check(stage_repo.git_dir()?)?;
    let vacated = stage_git.rmtree()?;
    let mirror_git = ExtantDir::check(kirepo.mirror_repo.git_dir()?)?;
    copytree(&mirror_git, vacated)?;

    let root = ExtantDir::check(&stage_path)?;
    let repo = GitRepo::open(&root)?;
    let baseline = repo.head_sha().ok();
    repo.add_all()?;
    let head_sha = repo.commit(&format!("Pull changes from ref {}", head.sha))?;
    Ok(Stage {
        repo,
        root,
        baseline,
        head_sha,
    })
}

/// Replace the internal mirror with the staged tree. History is preserved
/// because the stage carries the mirror's own `.git/`.
fn replace_mirror(kirepo: &KiRepo, stage: &Stage) -> Result<(), Error> {
    let mirror_root = ExtantDir::check(kirepo.mirror_repo.root())?;
    let vacated = mirror_root.rmtree()?;
    copytree(&stage.root, vacated)?;
    Ok(())
}

// PUSH

/// Push local working-copy changes into the collection database.
pub async fn push(cwd: &ExtantDir) -> Result<SyncStatus, Error> {
    let kirepo = repo::find_repo(cwd)?;
    let lock = CollectionLock::acquire(&kirepo.col_file).await?;
    match push_inner(&kirepo).await {
        Ok(status) => {
            lock.release().await?;
            Ok(status)
        }
        Err(err) => {
            let _ = lock.release().await;
            Err(err)
        }
    }
}

async fn push_inner(kirepo: &KiRepo) -> Result<SyncStatus, Error> {
    let md5sum = md5_of_file(&kirepo.col_file)?;
    if !kirepo.latest_hash_matches(&md5sum)? {
        return Err(Error::Library(LibraryError::Sync(
            SyncErrorKind::UpdatesRejected(kirepo.col_file.as_path().to_path_buf()),
        )));
    }

    let head = RepoRef::head(kirepo.repo.clone())?;
    let stage = build_stage(kirepo, &head)?;
    let Some(baseline_sha) = stage.baseline.clone() else {
        return Err(Error::Library(LibraryError::Git(GitErrorKind::RefNotFound {
            repo: kirepo.mirror_repo.root().to_path_buf(),
            sha: "HEAD".to_string(),
        })));
    };
    let baseline = RepoRef::new(stage.repo.clone(), &baseline_sha)?;
    let deltas = get_deltas_since_last_push(&baseline)?;
    let new_models = read_models_recursively(&stage.root)?;
    if deltas.is_empty() {
        echo("ki push: up to date.", false);
        return Ok(SyncStatus::UpToDate);
    }

    echo(
        &format!("Pushing to '{}'", kirepo.col_file.as_path().display()),
        false,
    );
    echo(&format!("Computed md5sum: {}", md5sum), false);

    // Edit a copy; the real collection is only overwritten once everything
    // has succeeded.
    let temp_col_dir = ephemeral_dir("col")?;
    std::fs::create_dir_all(&temp_col_dir).map_err(|e| Error::Io {
        description: format!("Failed to create {}", temp_col_dir.display()),
        source: e,
    })?;
    let new_col_file = copy_file(
        &kirepo.col_file,
        temp_col_dir.join(kirepo.col_file.file_name()),
    )?;
    info!(
        "Generating local collection file from latest commit: {}",
        head.sha
    );
    let mut col = Collection::open(&new_col_file).await?;

    for mut notetype in new_models.into_values() {
        if col.id_for_name(&notetype.name).is_none() {
            col.ensure_name_unique(&mut notetype);
            col.add_notetype(notetype);
        }
    }

    // Make the on-disk tree match the state the deltas describe.
    let stashed = kirepo.repo.stash_push()?;
    kirepo.repo.reset_hard("HEAD")?;

    let mut reassignment_log: Vec<String> = Vec::new();
    for delta in &deltas {
        if delta.status == ChangeType::Deleted {
            let flatnote = parse_note(&delta.path.read_to_string()?)?;
            col.remove_notes(&[flatnote.nid]).await?;
            continue;
        }
        let flatnote = parse_note(&delta.path.read_to_string()?)?;
        match col.get_note(flatnote.nid).await {
            Ok(_) => update_note_from_flatnote(&mut col, &flatnote).await?,
            Err(Error::Library(LibraryError::Note(NoteErrorKind::MissingNoteId(_)))) => {
                let Some(new_nid) = add_note_from_flatnote(&mut col, &flatnote).await? else {
                    continue;
                };
                info!("Reassigned nid: '{}' -> '{}'", flatnote.nid, new_nid);
                let relpath =
                    regenerate_note_file(kirepo, &col, new_nid, &delta.relpath).await?;
                if let Some(relpath) = relpath {
                    reassignment_log
                        .push(format!("Wrote note '{}' in file {}", new_nid, relpath.display()));
                }
            }
            Err(err) => return Err(err),
        }
    }

    if !reassignment_log.is_empty() {
        let msg = format!("Generated new nid(s).\n\n{}\n", reassignment_log.join("\n"));
        for sm_path in kirepo.repo.submodule_paths()? {
            let sm_dir = ExtantDir::check(kirepo.root.as_path().join(sm_path))?;
            let subrepo = GitRepo::open(&sm_dir)?;
            subrepo.add_all()?;
            subrepo.commit(&msg)?;
        }
        kirepo.repo.add_all()?;
        kirepo.repo.commit(&msg)?;
    }
    if stashed {
        kirepo.repo.stash_pop()?;
    }

    col.close().await?;

    // The reassignment commit moved HEAD, so the mirror and the last-push
    // ref must be rebuilt from the new tree or the next push would see the
    // regenerated files as changes.
    let (final_stage, final_head) = if reassignment_log.is_empty() {
        (stage, head)
    } else {
        let new_head = RepoRef::head(kirepo.repo.clone())?;
        let new_stage = build_stage(kirepo, &new_head)?;
        (new_stage, new_head)
    };

    kirepo.backup_collection()?;
    copy_file(&new_col_file, kirepo.col_file.as_path())?;
    echo(
        &format!("Overwrote '{}'", kirepo.col_file.as_path().display()),
        false,
    );
    let new_md5sum = md5_of_file(&kirepo.col_file)?;
    kirepo.append_md5sum(&new_md5sum)?;
    replace_mirror(kirepo, &final_stage)?;
    kirepo.write_last_push(&final_head.sha)?;
    Ok(SyncStatus::Synced)
}

/// Find and merge every notetypes manifest in the tree.
fn read_models_recursively(root: &ExtantDir) -> Result<IndexMap<NotetypeId, Notetype>, Error> {
    let mut merged: IndexMap<NotetypeId, Notetype> = IndexMap::new();
    for manifest in root.rglob(MANIFEST_FILE) {
        let models: IndexMap<String, Notetype> =
            serde_json::from_str(&manifest.read_to_string()?).map_err(|e| Error::Json {
                description: format!("Failed to parse {}", manifest.as_path().display()),
                source: e,
            })?;
        merged.extend(models.into_values().map(|nt| (nt.id, nt)));
    }
    Ok(merged)
}

/// Field bodies rendered to the HTML form stored in the database.
fn html_fields(flatnote: &FlatNote) -> Vec<String> {
    flatnote
        .fields
        .values()
        .map(|body| {
            if flatnote.markdown {
                markdown_to_html(body)
            } else {
                plain_to_html(body)
            }
        })
        .collect()
}

/// Validate that the note's field names are exactly the notetype's, in order.
fn validate_flatnote_fields(notetype: &Notetype, flatnote: &FlatNote) -> Result<(), Error> {
    let expected = notetype.field_names();
    let given: Vec<&str> = flatnote.fields.keys().map(String::as_str).collect();
    if given.len() != expected.len() {
        return Err(Error::Library(LibraryError::Note(
            NoteErrorKind::FieldValidation {
                nid: flatnote.nid,
                description: format!(
                    "expected {} fields for notetype '{}', got {}",
                    expected.len(),
                    notetype.name,
                    given.len()
                ),
            },
        )));
    }
    for (x, y) in expected.iter().zip(given.iter()) {
        if x != y {
            return Err(Error::Library(LibraryError::Note(
                NoteErrorKind::FieldValidation {
                    nid: flatnote.nid,
                    description: format!("inconsistent field names ({} != {})", x, y),
                },
            )));
        }
    }
    Ok(())
}

fn log_health(nid: NoteId, check: FieldsCheck) {
    match check {
        FieldsCheck::Normal => {}
        FieldsCheck::Empty => warn!("Found empty note '{}' (health check code 1).", nid),
        FieldsCheck::Duplicate => {
            warn!("Found duplicate note '{}': notetype and first field match an existing note (health check code 2).", nid);
        }
    }
}

async fn update_note_from_flatnote(col: &mut Collection, flatnote: &FlatNote) -> Result<(), Error> {
    let notetype = col
        .notetype_by_name(&flatnote.model)
        .ok_or_else(|| {
            Error::Library(LibraryError::Notetype(NotetypeErrorKind::Missing(
                flatnote.model.clone(),
            )))
        })?
        .clone();
    let existing = col.get_note(flatnote.nid).await?;
    if existing.notetype_id != notetype.id {
        let expected = col
            .notetype(existing.notetype_id)
            .map(|nt| nt.name.clone())
            .unwrap_or_default();
        return Err(Error::Library(LibraryError::Notetype(
            NotetypeErrorKind::Mismatch {
                model: flatnote.model.clone(),
                nid: flatnote.nid,
                expected,
            },
        )));
    }
    validate_flatnote_fields(&notetype, flatnote)?;
    col.update_note(
        flatnote.nid,
        &html_fields(flatnote),
        &flatnote.tags,
        &flatnote.deck,
    )
    .await?;
    log_health(flatnote.nid, col.fields_check(flatnote.nid).await?);
    Ok(())
}

/// Add a new note for a flatnote whose nid is not in the database. Returns
/// the fresh nid, or `None` when the note failed its health check and was
/// not kept.
async fn add_note_from_flatnote(
    col: &mut Collection,
    flatnote: &FlatNote,
) -> Result<Option<NoteId>, Error> {
    let notetype = col
        .notetype_by_name(&flatnote.model)
        .ok_or_else(|| {
            Error::Library(LibraryError::Notetype(NotetypeErrorKind::Missing(
                flatnote.model.clone(),
            )))
        })?
        .clone();
    validate_flatnote_fields(&notetype, flatnote)?;
    let nid = col
        .add_note(
            notetype.id,
            &html_fields(flatnote),
            &flatnote.tags,
            &flatnote.deck,
        )
        .await?;
    let health = col.fields_check(nid).await?;
    if health != FieldsCheck::Normal {
        log_health(nid, health);
        warn!("Note was not added to collection!");
        col.remove_notes(&[nid]).await?;
        return Ok(None);
    }
    Ok(Some(nid))
}

/// After a nid reassignment, drop the placeholder file and write the note
/// back at its slug-derived path. Returns the new relative path, or `None`
/// if the sort field could not be resolved.
async fn regenerate_note_file(
    kirepo: &KiRepo,
    col: &Collection,
    nid: NoteId,
    old_relpath: &std::path::Path,
) -> Result<Option<PathBuf>, Error> {
    let old_path = kirepo.root.as_path().join(old_relpath);
    if let Ok(file) = ExtantFile::check(&old_path) {
        file.unlink()?;
    }
    let note = col.get_note(nid).await?;
    let Ok(notetype) = col.notetype(note.notetype_id) else {
        warn!("Couldn't find notetype for note {}", nid);
        return Ok(None);
    };
    let Some(sort_field_text) = get_sort_field_text(&note, notetype) else {
        warn!("Couldn't find sort field for note {}", nid);
        return Ok(None);
    };
    let parent = kirepo
        .root
        .mkdir_forced(old_relpath.parent().unwrap_or_else(|| std::path::Path::new("")))?;
    let filename = fresh_note_filename(&parent, &sort_field_text);
    let payload = render_note(&note, &notetype.name);
    let written = parent.write_file(&filename, &payload)?;
    let relpath = written
        .as_path()
        .strip_prefix(kirepo.root.as_path())
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(|_| written.as_path().to_path_buf());
    Ok(Some(relpath))
}

// PULL

/// Pull changes made directly in the database into the working copy.
pub async fn pull(cwd: &ExtantDir) -> Result<SyncStatus, Error> {
    let kirepo = repo::find_repo(cwd)?;
    let lock = CollectionLock::acquire(&kirepo.col_file).await?;
    match pull_inner(&kirepo).await {
        Ok(status) => {
            lock.release().await?;
            Ok(status)
        }
        Err(err) => {
            let _ = lock.release().await;
            Err(err)
        }
    }
}

async fn pull_inner(kirepo: &KiRepo) -> Result<SyncStatus, Error> {
    let md5sum = md5_of_file(&kirepo.col_file)?;
    if kirepo.latest_hash_matches(&md5sum)? {
        echo("ki pull: up to date.", false);
        return Ok(SyncStatus::UpToDate);
    }

    echo(
        &format!("Pulling from '{}'", kirepo.col_file.as_path().display()),
        false,
    );
    echo(&format!("Computed md5sum: {}", md5sum), false);

    // The anchor: the main repository as it looked at the last push. The
    // content diff anchor..remote is then exactly the edits made directly
    // in the database, and the anchor is the common ancestor that lets the
    // merge machinery see the true delta on each side.
    let sha = kirepo.last_push_sha()?;
    let _ = RepoRef::new(kirepo.repo.clone(), &sha)?;
    let anchor_path = ephemeral_dir("local")?;
    let anchor_repo = kirepo.repo.clone_recursive(&anchor_path)?;
    anchor_repo.reset_hard(&sha)?;

    // A fresh clone of the current database state.
    let remote_path = ephemeral_dir("remote")?.join(&md5sum);
    let remote_target = NoPath::check(&remote_path)?.mkdir()?;
    let msg = format!(
        "Fetch changes from DB at '{}' with md5sum '{}'",
        kirepo.col_file.as_path().display(),
        md5sum
    );
    let remote_root = clone_into(&kirepo.col_file, remote_target, &msg, true).await?;
    let remote_repo = GitRepo::open(&remote_root)?;

    // Database edits merge into the anchor first, preferring the database
    // side on any textual collision.
    anchor_repo.create_remote(REMOTE_NAME, &remote_repo.git_dir()?)?;
    anchor_repo.set_config("pull.rebase", "false")?;
    echo(
        &format!("Pulling into {}", anchor_repo.root().display()),
        false,
    );
    anchor_repo.pull(REMOTE_NAME, BRANCH_NAME, true)?;
    anchor_repo.delete_remote(REMOTE_NAME)?;

    // Then the anchor merges into the working copy with no preference;
    // conflicts surface to the user as ordinary merge conflicts.
    kirepo.repo.create_remote(REMOTE_NAME, &anchor_repo.git_dir()?)?;
    kirepo.repo.set_config("pull.rebase", "false")?;
    match kirepo.repo.pull(REMOTE_NAME, BRANCH_NAME, false) {
        Ok(output) => echo(&output, false),
        Err(Error::Library(LibraryError::Git(GitErrorKind::CommandFailed {
            stderr, ..
        }))) => {
            echo(&stderr, false);
        }
        Err(err) => {
            kirepo.repo.delete_remote(REMOTE_NAME)?;
            return Err(err);
        }
    }
    kirepo.repo.delete_remote(REMOTE_NAME)?;

    kirepo.append_md5sum(&md5sum)?;
    if md5_of_file(&kirepo.col_file)? != md5sum {
        return Err(Error::Library(LibraryError::Sync(
            SyncErrorKind::CollectionChecksum(kirepo.col_file.as_path().to_path_buf()),
        )));
    }
    Ok(SyncStatus::Synced)
}
