//! The ki working-copy model: recognizing a working copy, locating sidecar
//! files, and binding to the associated collection.

use crate::git::GitRepo;
use crate::paths::{classify, ExtantDir, ExtantFile, PathState};
use crate::{helpers, Error, LibraryError, RepoErrorKind};
use ini::Ini;
use std::io::Write;

pub const KI: &str = ".ki";
pub const CONFIG_FILE: &str = "config";
pub const HASHES_FILE: &str = "hashes";
pub const BACKUPS_DIR: &str = "backups";
pub const LAST_PUSH_FILE: &str = "last_push";
pub const MIRROR_DIR: &str = "internal_mirror";
pub const MANIFEST_FILE: &str = "notetypes-manifest.json";
pub const GITIGNORE_FILE: &str = ".gitignore";
pub const GITMODULES_FILE: &str = ".gitmodules";
pub const GIT_DIR: &str = ".git";

const REMOTE_CONFIG_SECTION: &str = "remote";
const COL_PATH_CONFIG_KEY: &str = "path";

/// A loaded ki working copy. Every component's existence was verified at
/// load time.
#[derive(Debug)]
pub struct KiRepo {
    pub repo: GitRepo,
    pub root: ExtantDir,
    pub ki_dir: ExtantDir,
    pub col_file: ExtantFile,
    pub backups_dir: ExtantDir,
    pub config_file: ExtantFile,
    pub hashes_file: ExtantFile,
    pub manifest_file: ExtantFile,
    pub last_push_file: ExtantFile,
    pub mirror_repo: GitRepo,
}

/// Walk ancestors of `cwd` until a directory containing the sidecar is
/// found, then load it. Reaching the filesystem root is `NotKiRepo`.
pub fn find_repo(cwd: &ExtantDir) -> Result<KiRepo, Error> {
    let mut current = cwd.clone();
    loop {
        match classify(current.as_path().join(KI)) {
            PathState::Dir(_) | PathState::Empty(_) => break,
            _ => {}
        }
        if current.is_root() {
            return Err(Error::Library(LibraryError::Repo(RepoErrorKind::NotKiRepo)));
        }
        current = current.parent()?;
    }
    load_repo(&current)
}

/// Load and validate the working copy rooted at `root`. Any missing sidecar
/// component aborts with a typed error naming it.
pub fn load_repo(root: &ExtantDir) -> Result<KiRepo, Error> {
    let repo = GitRepo::open(root)?;
    let ki_dir = ExtantDir::check(root.as_path().join(KI))?;
    let backups_dir = ExtantDir::check(ki_dir.as_path().join(BACKUPS_DIR))?;
    let config_file = ExtantFile::check(ki_dir.as_path().join(CONFIG_FILE))?;
    let hashes_file = ExtantFile::check(ki_dir.as_path().join(HASHES_FILE))?;
    let last_push_file = ExtantFile::check(ki_dir.as_path().join(LAST_PUSH_FILE))?;
    let manifest_file = ExtantFile::check(root.as_path().join(MANIFEST_FILE))?;
    let mirror_dir = ExtantDir::check(ki_dir.as_path().join(MIRROR_DIR))?;
    let mirror_repo = GitRepo::open(&mirror_dir)?;
    let col_file = read_config(&config_file)?;
    Ok(KiRepo {
        repo,
        root: root.clone(),
        ki_dir,
        col_file,
        backups_dir,
        config_file,
        hashes_file,
        manifest_file,
        last_push_file,
        mirror_repo,
    })
}

/// Write the sidecar config binding the working copy to its collection.
pub fn write_config(config_file: &ExtantFile, col_file: &ExtantFile) -> Result<(), Error> {
    let mut conf = Ini::new();
    conf.with_section(Some(REMOTE_CONFIG_SECTION)).set(
        COL_PATH_CONFIG_KEY,
        col_file.as_path().to_string_lossy().into_owned(),
    );
    conf.write_to_file(config_file.as_path())
        .map_err(|e| Error::Io {
            description: format!("Failed to write {}", config_file.as_path().display()),
            source: e,
        })
}

/// Resolve the collection path from the sidecar config.
pub fn read_config(config_file: &ExtantFile) -> Result<ExtantFile, Error> {
    let conf = Ini::load_from_file(config_file.as_path())?;
    let path = conf
        .section(Some(REMOTE_CONFIG_SECTION))
        .and_then(|s| s.get(COL_PATH_CONFIG_KEY))
        .ok_or_else(|| {
            Error::Library(LibraryError::Repo(RepoErrorKind::InvalidConfig {
                path: config_file.as_path().to_path_buf(),
                reason: format!(
                    "missing key '{}' in section [{}]",
                    COL_PATH_CONFIG_KEY, REMOTE_CONFIG_SECTION
                ),
            }))
        })?;
    ExtantFile::check(path)
}

/// Append one `"<md5>  <tag>"` line to the hashes log.
pub fn append_md5sum(ki_dir: &ExtantDir, md5sum: &str, tag: &str) -> Result<(), Error> {
    let hashes_path = ki_dir.as_path().join(HASHES_FILE);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&hashes_path)
        .map_err(|e| Error::Io {
            description: format!("Failed to open {}", hashes_path.display()),
            source: e,
        })?;
    writeln!(file, "{}  {}", md5sum, tag).map_err(|e| Error::Io {
        description: format!("Failed to append to {}", hashes_path.display()),
        source: e,
    })
}

impl KiRepo {
    /// The non-empty lines of the hashes log, oldest first.
    pub fn hashes(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .hashes_file
            .read_to_string()?
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Whether the newest hashes-log line records `md5sum`.
    pub fn latest_hash_matches(&self, md5sum: &str) -> Result<bool, Error> {
        Ok(self
            .hashes()?
            .last()
            .is_some_and(|line| line.contains(md5sum)))
    }

    pub fn append_md5sum(&self, md5sum: &str) -> Result<(), Error> {
        append_md5sum(&self.ki_dir, md5sum, &self.col_file.file_name())
    }

    pub fn last_push_sha(&self) -> Result<String, Error> {
        Ok(self.last_push_file.read_to_string()?.trim().to_string())
    }

    pub fn write_last_push(&self, sha: &str) -> Result<(), Error> {
        self.last_push_file.write_text(sha)
    }

    /// Snapshot the collection into the backups directory, keyed by hash.
    /// A backup for the current hash is never overwritten.
    pub fn backup_collection(&self) -> Result<(), Error> {
        let md5sum = helpers::md5_of_file(&self.col_file)?;
        let backup_path = self.backups_dir.as_path().join(format!("{}.anki2", md5sum));
        if backup_path.is_file() {
            log::info!("Backup already exists.");
            return Ok(());
        }
        crate::paths::copy_file(&self.col_file, backup_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PathErrorKind;

    #[test]
    fn test_find_repo_stops_at_root() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = ExtantDir::check(tmp.path()).unwrap();
        let err = find_repo(&cwd).unwrap_err();
        assert!(matches!(
            err,
            Error::Library(LibraryError::Repo(RepoErrorKind::NotKiRepo))
        ));
    }

    #[test]
    fn test_load_repo_names_missing_component() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join(KI)).unwrap();
        let root = ExtantDir::check(tmp.path()).unwrap();
        let repo = GitRepo::init(&root).unwrap();
        let _ = repo;
        let err = load_repo(&root).unwrap_err();
        // The first missing leaf is the backups directory.
        match err {
            Error::Library(LibraryError::Path(PathErrorKind::MissingDirectory(p))) => {
                assert!(p.ends_with(".ki/backups"));
            }
            other => panic!("expected MissingDirectory, got {:?}", other),
        }
    }

    #[test]
    fn test_config_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ExtantDir::check(tmp.path()).unwrap();
        let col = dir.write_file("collection.anki2", "stub").unwrap();
        let config = dir.touch("config").unwrap();
        write_config(&config, &col).unwrap();
        let resolved = read_config(&config).unwrap();
        assert_eq!(resolved, col);
    }

    #[test]
    fn test_append_md5sum_is_append_only() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ExtantDir::check(tmp.path()).unwrap();
        append_md5sum(&dir, "aaaa", "collection.anki2").unwrap();
        append_md5sum(&dir, "bbbb", "collection.anki2").unwrap();
        let contents = std::fs::read_to_string(tmp.path().join(HASHES_FILE)).unwrap();
        assert_eq!(contents, "aaaa  collection.anki2\nbbbb  collection.anki2\n");
    }
}
