//! Phantom-typed filesystem wrappers. A value of one of these types is
//! evidence that the path had the claimed state at the moment it was
//! classified. Constructors resolve and classify; operations demand the
//! right refinement on input and return the refinement they establish.
//! Nothing in this module hands back a bare untagged path.

use crate::{Error, LibraryError, PathErrorKind};
use std::fs;
use std::path::{Path, PathBuf};

/// The file was extant when the value was constructed.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ExtantFile(PathBuf);

/// The directory was extant when the value was constructed.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ExtantDir(PathBuf);

/// The directory was extant and empty when the value was constructed.
/// Deliberately not coercible to [`ExtantDir`]; widen with
/// [`EmptyDir::into_extant`] once the emptiness no longer matters.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct EmptyDir(PathBuf);

/// The path did not exist when the value was constructed.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NoPath(PathBuf);

/// Result of classifying an arbitrary path.
#[derive(Clone, Debug)]
pub enum PathState {
    File(ExtantFile),
    Dir(ExtantDir),
    Empty(EmptyDir),
    Missing(NoPath),
    /// Extant but neither a regular file nor a directory (socket, device).
    Strange(PathBuf),
}

fn path_err(kind: PathErrorKind) -> Error {
    Error::Library(LibraryError::Path(kind))
}

pub(crate) fn io_err(description: impl Into<String>, source: std::io::Error) -> Error {
    Error::Io {
        description: description.into(),
        source,
    }
}

/// Make the path absolute, following symlinks when it exists.
fn resolve(path: &Path) -> PathBuf {
    if path.exists() {
        fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    } else {
        std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
    }
}

fn dir_is_empty(path: &Path) -> bool {
    fs::read_dir(path).map_or(false, |mut entries| entries.next().is_none())
}

/// Classify a path by its current state.
pub fn classify(path: impl AsRef<Path>) -> PathState {
    let path = resolve(path.as_ref());
    if path.is_file() {
        return PathState::File(ExtantFile(path));
    }
    if path.is_dir() {
        if dir_is_empty(&path) {
            return PathState::Empty(EmptyDir(path));
        }
        return PathState::Dir(ExtantDir(path));
    }
    if path.exists() {
        return PathState::Strange(path);
    }
    PathState::Missing(NoPath(path))
}

impl ExtantFile {
    /// Refine a path into an extant file, or fail with the precise reason.
    pub fn check(path: impl AsRef<Path>) -> Result<Self, Error> {
        match classify(path.as_ref()) {
            PathState::File(file) => Ok(file),
            PathState::Dir(d) => Err(path_err(PathErrorKind::ExpectedFileButGotDirectory(
                d.into_path_buf(),
            ))),
            PathState::Empty(d) => Err(path_err(PathErrorKind::ExpectedFileButGotDirectory(
                d.into_path_buf(),
            ))),
            PathState::Strange(p) => Err(path_err(PathErrorKind::StrangePath(p))),
            PathState::Missing(p) => Err(path_err(PathErrorKind::MissingFile(p.into_path_buf()))),
        }
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    pub fn file_name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn file_stem(&self) -> String {
        self.0
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn parent(&self) -> Result<ExtantDir, Error> {
        ExtantDir::check(self.0.parent().unwrap_or_else(|| Path::new("/")))
    }

    pub fn read_to_string(&self) -> Result<String, Error> {
        fs::read_to_string(&self.0)
            .map_err(|e| io_err(format!("Failed to read {}", self.0.display()), e))
    }

    pub fn write_text(&self, contents: &str) -> Result<(), Error> {
        fs::write(&self.0, contents)
            .map_err(|e| io_err(format!("Failed to write {}", self.0.display()), e))
    }

    /// Delete the file.
    pub fn unlink(self) -> Result<NoPath, Error> {
        fs::remove_file(&self.0)
            .map_err(|e| io_err(format!("Failed to remove {}", self.0.display()), e))?;
        Ok(NoPath(self.0))
    }
}

impl ExtantDir {
    pub fn check(path: impl AsRef<Path>) -> Result<Self, Error> {
        match classify(path.as_ref()) {
            PathState::Dir(dir) => Ok(dir),
            PathState::Empty(dir) => Ok(dir.into_extant()),
            PathState::File(f) => Err(path_err(PathErrorKind::ExpectedDirectoryButGotFile(
                f.into_path_buf(),
            ))),
            PathState::Strange(p) => Err(path_err(PathErrorKind::StrangePath(p))),
            PathState::Missing(p) => {
                Err(path_err(PathErrorKind::MissingDirectory(p.into_path_buf())))
            }
        }
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    pub fn parent(&self) -> Result<ExtantDir, Error> {
        ExtantDir::check(self.0.parent().unwrap_or_else(|| Path::new("/")))
    }

    pub fn is_root(&self) -> bool {
        self.0.parent().is_none()
    }

    pub fn is_empty(&self) -> bool {
        dir_is_empty(&self.0)
    }

    /// Create (or reuse) a subdirectory; parents are created as needed.
    pub fn mkdir_forced(&self, suffix: impl AsRef<Path>) -> Result<ExtantDir, Error> {
        let path = self.0.join(suffix);
        fs::create_dir_all(&path)
            .map_err(|e| io_err(format!("Failed to create {}", path.display()), e))?;
        ExtantDir::check(path)
    }

    /// Create an empty file inside the directory. Any `/` in `name` is
    /// stripped so the result is always a direct child.
    pub fn touch(&self, name: &str) -> Result<ExtantFile, Error> {
        self.write_file(&name.replace('/', ""), "")
    }

    /// Write a file inside the directory, overwriting if present.
    pub fn write_file(&self, name: &str, contents: &str) -> Result<ExtantFile, Error> {
        let path = self.0.join(name.replace('/', ""));
        fs::write(&path, contents)
            .map_err(|e| io_err(format!("Failed to write {}", path.display()), e))?;
        ExtantFile::check(path)
    }

    /// Delete the directory and everything below it.
    pub fn rmtree(self) -> Result<NoPath, Error> {
        fs::remove_dir_all(&self.0)
            .map_err(|e| io_err(format!("Failed to remove {}", self.0.display()), e))?;
        Ok(NoPath(self.0))
    }

    /// All files named exactly `name` below the directory, recursively.
    pub fn rglob(&self, name: &str) -> Vec<ExtantFile> {
        walkdir::WalkDir::new(&self.0)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && e.file_name() == name)
            .filter_map(|e| ExtantFile::check(e.path()).ok())
            .collect()
    }

    /// The regular files directly inside the directory.
    pub fn files(&self) -> Result<Vec<ExtantFile>, Error> {
        let entries = fs::read_dir(&self.0)
            .map_err(|e| io_err(format!("Failed to list {}", self.0.display()), e))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err("Failed to read directory entry", e))?;
            if let PathState::File(file) = classify(entry.path()) {
                files.push(file);
            }
        }
        Ok(files)
    }
}

impl EmptyDir {
    pub fn check(path: impl AsRef<Path>) -> Result<Self, Error> {
        match classify(path.as_ref()) {
            PathState::Empty(dir) => Ok(dir),
            PathState::Dir(d) => Err(path_err(PathErrorKind::ExpectedEmptyDirectory(
                d.into_path_buf(),
            ))),
            PathState::File(f) => Err(path_err(PathErrorKind::ExpectedDirectoryButGotFile(
                f.into_path_buf(),
            ))),
            PathState::Strange(p) => Err(path_err(PathErrorKind::StrangePath(p))),
            PathState::Missing(p) => {
                Err(path_err(PathErrorKind::MissingDirectory(p.into_path_buf())))
            }
        }
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Explicit widening. The emptiness evidence is consumed.
    pub fn into_extant(self) -> ExtantDir {
        ExtantDir(self.0)
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// Create a subdirectory (with parents). The parent stops being empty,
    /// so it is handed back widened.
    pub fn mksubdir(self, suffix: impl AsRef<Path>) -> Result<(ExtantDir, EmptyDir), Error> {
        let subdir = self.0.join(suffix);
        fs::create_dir_all(&subdir)
            .map_err(|e| io_err(format!("Failed to create {}", subdir.display()), e))?;
        Ok((ExtantDir(self.0), EmptyDir(subdir)))
    }
}

impl NoPath {
    pub fn check(path: impl AsRef<Path>) -> Result<Self, Error> {
        match classify(path.as_ref()) {
            PathState::Missing(nopath) => Ok(nopath),
            PathState::File(f) => Err(path_err(PathErrorKind::TargetExists(f.into_path_buf()))),
            PathState::Dir(d) => Err(path_err(PathErrorKind::TargetExists(d.into_path_buf()))),
            PathState::Empty(d) => Err(path_err(PathErrorKind::TargetExists(d.into_path_buf()))),
            PathState::Strange(p) => Err(path_err(PathErrorKind::StrangePath(p))),
        }
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// Create the directory (with parents).
    pub fn mkdir(self) -> Result<EmptyDir, Error> {
        fs::create_dir_all(&self.0)
            .map_err(|e| io_err(format!("Failed to create {}", self.0.display()), e))?;
        Ok(EmptyDir(self.0))
    }
}

/// Make an empty directory out of `path`. A missing path is created; an
/// already-empty directory is accepted; anything else is `TargetExists`.
pub fn mkdir_empty(path: impl AsRef<Path>) -> Result<EmptyDir, Error> {
    match classify(path.as_ref()) {
        PathState::Missing(nopath) => nopath.mkdir(),
        PathState::Empty(dir) => Ok(dir),
        PathState::File(f) => Err(path_err(PathErrorKind::TargetExists(f.into_path_buf()))),
        PathState::Dir(d) => Err(path_err(PathErrorKind::TargetExists(d.into_path_buf()))),
        PathState::Strange(p) => Err(path_err(PathErrorKind::StrangePath(p))),
    }
}

/// The process working directory.
pub fn current_dir() -> Result<ExtantDir, Error> {
    let cwd = std::env::current_dir().map_err(|e| io_err("Failed to get working directory", e))?;
    ExtantDir::check(cwd)
}

/// Copy a whole tree to a path that does not exist yet.
pub fn copytree(source: &ExtantDir, target: NoPath) -> Result<ExtantDir, Error> {
    let errors = copy_dir::copy_dir(source.as_path(), target.as_path()).map_err(|e| {
        io_err(
            format!(
                "Failed to copy {} to {}",
                source.as_path().display(),
                target.as_path().display()
            ),
            e,
        )
    })?;
    if let Some(first) = errors.into_iter().next() {
        return Err(io_err(
            format!("Failed to copy into {}", target.as_path().display()),
            first,
        ));
    }
    ExtantDir::check(target.into_path_buf())
}

/// Force copy a file, overwriting the target if it exists.
pub fn copy_file(source: &ExtantFile, target: impl AsRef<Path>) -> Result<ExtantFile, Error> {
    let target = target.as_ref();
    fs::copy(source.as_path(), target).map_err(|e| {
        io_err(
            format!(
                "Failed to copy {} to {}",
                source.as_path().display(),
                target.display()
            ),
            e,
        )
    })?;
    ExtantFile::check(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_states() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();

        assert!(matches!(classify(root), PathState::Empty(_)));

        let file = root.join("f");
        fs::write(&file, "x").unwrap();
        assert!(matches!(classify(&file), PathState::File(_)));
        assert!(matches!(classify(root), PathState::Dir(_)));
        assert!(matches!(classify(root.join("nothing")), PathState::Missing(_)));
    }

    #[test]
    fn test_check_wrong_state_is_typed() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, "x").unwrap();

        let err = ExtantDir::check(&file).unwrap_err();
        assert!(matches!(
            err,
            Error::Library(LibraryError::Path(
                PathErrorKind::ExpectedDirectoryButGotFile(_)
            ))
        ));
        let err = ExtantFile::check(tmp.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::Library(LibraryError::Path(
                PathErrorKind::ExpectedFileButGotDirectory(_)
            ))
        ));
    }

    #[test]
    fn test_mkdir_empty_rejects_nonempty() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("f"), "x").unwrap();
        let err = mkdir_empty(tmp.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::Library(LibraryError::Path(PathErrorKind::TargetExists(_)))
        ));
    }

    #[test]
    fn test_mksubdir_widens_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let empty = EmptyDir::check(tmp.path()).unwrap();
        let (parent, sub) = empty.mksubdir("a/b").unwrap();
        assert!(sub.as_path().ends_with("a/b"));
        assert!(!parent.is_empty());
    }

    #[test]
    fn test_touch_strips_separators() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ExtantDir::check(tmp.path()).unwrap();
        let file = dir.touch("a/b").unwrap();
        assert_eq!(file.file_name(), "ab");
    }

    #[test]
    fn test_copytree_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("inner")).unwrap();
        fs::write(src.join("inner/f"), "x").unwrap();
        let src = ExtantDir::check(&src).unwrap();
        let target = NoPath::check(tmp.path().join("dst")).unwrap();
        let copied = copytree(&src, target).unwrap();
        assert!(copied.as_path().join("inner/f").is_file());
    }
}
