//! Thin wrapper over the `git` client, invoked by name on `PATH`. Only the
//! operations the sync driver needs are exposed; working-tree mutations all
//! go through the CLI so its safety semantics apply.

use crate::model::ChangeType;
use crate::paths::ExtantDir;
use crate::{Error, GitErrorKind, LibraryError};
use log::debug;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const BRANCH_NAME: &str = "main";

#[derive(Clone, Debug)]
pub struct GitRepo {
    root: PathBuf,
}

fn git_err(kind: GitErrorKind) -> Error {
    Error::Library(LibraryError::Git(kind))
}

impl GitRepo {
    /// Initialize a fresh repository on [`BRANCH_NAME`].
    pub fn init(root: &ExtantDir) -> Result<Self, Error> {
        let repo = Self {
            root: root.as_path().to_path_buf(),
        };
        repo.run(&["init", "--initial-branch", BRANCH_NAME])?;
        repo.ensure_identity()?;
        Ok(repo)
    }

    /// Commits made by the engine need a committer identity even on machines
    /// with no global git config.
    fn ensure_identity(&self) -> Result<(), Error> {
        if self.run(&["config", "user.email"]).is_err() {
            self.run(&["config", "user.email", "ki@localhost"])?;
            self.run(&["config", "user.name", "ki"])?;
        }
        Ok(())
    }

    /// Open an existing repository rooted at `root`.
    pub fn open(root: &ExtantDir) -> Result<Self, Error> {
        let repo = Self {
            root: root.as_path().to_path_buf(),
        };
        repo.run(&["rev-parse", "--is-inside-work-tree"])
            .map_err(|_| git_err(GitErrorKind::NotARepository(repo.root.clone())))?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run(&self, args: &[&str]) -> Result<String, Error> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| Error::Io {
                description: "Failed to spawn git".to_string(),
                source: e,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout)
            .trim_end()
            .to_string();
        debug!("git {:?}: {}", args, output.status);
        if !output.status.success() {
            return Err(git_err(GitErrorKind::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            }));
        }
        Ok(stdout)
    }

    pub fn add_all(&self) -> Result<(), Error> {
        self.run(&["add", "--all"]).map(|_| ())
    }

    /// Commit the index. Empty commits are allowed so that snapshot commits
    /// can be taken unconditionally.
    pub fn commit(&self, message: &str) -> Result<String, Error> {
        self.run(&["commit", "--allow-empty", "--message", message])?;
        self.head_sha()
    }

    pub fn head_sha(&self) -> Result<String, Error> {
        self.run(&["rev-parse", "HEAD"])
    }

    pub fn branch(&self) -> Result<String, Error> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn ref_exists(&self, sha: &str) -> bool {
        self.run(&["rev-parse", "--verify", "--quiet", sha]).is_ok()
    }

    /// Resolve a ref, failing with `RefNotFound` if it is not in the repo.
    pub fn rev_parse(&self, reference: &str) -> Result<String, Error> {
        self.run(&["rev-parse", "--verify", "--quiet", reference])
            .map_err(|_| {
                git_err(GitErrorKind::RefNotFound {
                    repo: self.root.clone(),
                    sha: reference.to_string(),
                })
            })
    }

    pub fn git_dir(&self) -> Result<PathBuf, Error> {
        self.run(&["rev-parse", "--absolute-git-dir"]).map(PathBuf::from)
    }

    /// Clone this repository (with submodules) to `target` on the current
    /// branch.
    pub fn clone_recursive(&self, target: &Path) -> Result<Self, Error> {
        let branch = self.branch()?;
        let source = self.root.to_string_lossy().into_owned();
        let destination = target.to_string_lossy().into_owned();
        let output = Command::new("git")
            .args([
                "clone",
                "--recurse-submodules",
                "--branch",
                branch.as_str(),
                source.as_str(),
                destination.as_str(),
            ])
            .output()
            .map_err(|e| Error::Io {
                description: "Failed to spawn git".to_string(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(git_err(GitErrorKind::CommandFailed {
                command: "clone".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            }));
        }
        let cloned = Self {
            root: target.to_path_buf(),
        };
        cloned.ensure_identity()?;
        Ok(cloned)
    }

    pub fn reset_hard(&self, reference: &str) -> Result<(), Error> {
        self.run(&["reset", "--hard", reference]).map(|_| ())
    }

    /// Stash staged and unstaged changes, untracked files included. Returns
    /// whether a stash entry was actually created.
    pub fn stash_push(&self) -> Result<bool, Error> {
        let out = self.run(&["stash", "push", "--include-untracked", "--keep-index"])?;
        Ok(!out.starts_with("No local changes to save"))
    }

    pub fn stash_pop(&self) -> Result<(), Error> {
        self.run(&["stash", "pop"]).map(|_| ())
    }

    pub fn create_remote(&self, name: &str, url: &Path) -> Result<(), Error> {
        let url = url.to_string_lossy().into_owned();
        self.run(&["remote", "add", name, url.as_str()]).map(|_| ())
    }

    pub fn delete_remote(&self, name: &str) -> Result<(), Error> {
        self.run(&["remote", "remove", name]).map(|_| ())
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<(), Error> {
        self.run(&["config", key, value]).map(|_| ())
    }

    /// Pull `remote`/`branch`. With `prefer_theirs`, textual conflicts are
    /// resolved in favor of the remote side and unrelated histories are
    /// allowed; otherwise the default merge applies and conflicts surface
    /// to the caller.
    pub fn pull(&self, remote: &str, branch: &str, prefer_theirs: bool) -> Result<String, Error> {
        if prefer_theirs {
            self.run(&[
                "pull",
                "-v",
                "--allow-unrelated-histories",
                "--strategy-option",
                "theirs",
                remote,
                branch,
            ])
        } else {
            self.run(&["pull", "-v", remote, branch])
        }
    }

    /// Per-file diff entries of one change kind between two refs. Each entry
    /// is `(path, new_path)`; `new_path` is only present for renames.
    pub fn diff_name_status(
        &self,
        a: &str,
        b: &str,
        kind: ChangeType,
    ) -> Result<Vec<(PathBuf, Option<PathBuf>)>, Error> {
        let filter = format!("--diff-filter={}", kind.letter());
        let out = self.run(&[
            "diff",
            "--find-renames",
            "--name-status",
            filter.as_str(),
            a,
            b,
        ])?;
        let mut entries = Vec::new();
        for line in out.lines().filter(|l| !l.is_empty()) {
            let mut parts = line.split('\t');
            let Some(_status) = parts.next() else {
                continue;
            };
            let Some(path) = parts.next() else {
                continue;
            };
            entries.push((PathBuf::from(path), parts.next().map(PathBuf::from)));
        }
        Ok(entries)
    }

    /// Paths of the repository's submodules, from `.gitmodules`.
    pub fn submodule_paths(&self) -> Result<Vec<PathBuf>, Error> {
        if !self.root.join(".gitmodules").is_file() {
            return Ok(Vec::new());
        }
        let out = self.run(&[
            "config",
            "--file",
            ".gitmodules",
            "--get-regexp",
            r"^submodule\..*\.path$",
        ])?;
        Ok(out
            .lines()
            .filter_map(|line| line.split_once(' ').map(|(_, p)| PathBuf::from(p)))
            .collect())
    }

    /// Convert every submodule into an ordinary subdirectory, destroying the
    /// submodule's own history. Mutates the repo in place.
    pub fn flatten_submodules(&self) -> Result<(), Error> {
        let submodules = self.submodule_paths()?;
        for sm_path in &submodules {
            let sm = sm_path.to_string_lossy().into_owned();
            self.run(&["submodule", "update", "--init", "--", sm.as_str()])?;
            self.run(&["rm", "-r", "--cached", sm.as_str()])?;
            let dotgit = self.root.join(sm_path).join(".git");
            if dotgit.exists() {
                if dotgit.is_dir() {
                    std::fs::remove_dir_all(&dotgit)
                } else {
                    std::fs::remove_file(&dotgit)
                }
                .map_err(|e| Error::Io {
                    description: format!("Failed to remove {}", dotgit.display()),
                    source: e,
                })?;
            }
            self.run(&["add", sm.as_str()])?;
            self.commit(&format!("Add submodule {} as ordinary directory.", sm))?;
        }
        if self.root.join(".gitmodules").is_file() {
            self.run(&["rm", "--force", ".gitmodules"])?;
            self.commit("Remove '.gitmodules' file.")?;
        }
        Ok(())
    }
}

/// A repo-commit pair where the sha is verified to exist in the repo.
#[derive(Clone, Debug)]
pub struct RepoRef {
    pub repo: GitRepo,
    pub sha: String,
}

impl RepoRef {
    pub fn new(repo: GitRepo, sha: &str) -> Result<Self, Error> {
        if !repo.ref_exists(sha) {
            return Err(git_err(GitErrorKind::RefNotFound {
                repo: repo.root().to_path_buf(),
                sha: sha.to_string(),
            }));
        }
        Ok(Self {
            repo,
            sha: sha.to_string(),
        })
    }

    pub fn head(repo: GitRepo) -> Result<Self, Error> {
        let sha = repo.head_sha()?;
        Ok(Self { repo, sha })
    }
}
