//! Per-user sandbox directories and path-escape-safe file operations.
//!
//! Every user owns `<server root>/<login>`. Paths coming from clients are
//! resolved against the user's working directory and must land strictly
//! inside that user's sandbox, otherwise the operation is rejected before
//! any filesystem call is made.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::error::StorageError;

#[derive(Debug, Clone)]
struct UserDirs {
    root: PathBuf,
    working_dir: PathBuf,
}

/// Owner of the server root and of every user's sandbox bookkeeping.
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
    users: RwLock<HashMap<String, UserDirs>>,
}

impl Storage {
    /// Opens (creating if needed) the server root.
    pub fn open(root: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            users: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates `<root>/<login>` and starts tracking it.
    ///
    /// The login must name exactly one directory directly below the server
    /// root; separators, `.` and `..` are refused. The directory must end up
    /// readable and writable. On failure nothing is recorded and a directory
    /// created by this call is removed again.
    pub fn create_sandbox(&self, login: &str) -> Result<PathBuf, StorageError> {
        if let Some(existing) = self.users.read().get(login) {
            return Ok(existing.root.clone());
        }

        if !is_single_component(login) {
            warn!(login = %login, "refusing login that is not a plain folder name");
            return Err(StorageError::AccessDenied);
        }
        let dir = self.root.join(login);
        if self.owner_of(&dir).is_some() {
            warn!(login = %login, dir = %dir.display(), "sandbox already owned by another login");
            return Err(StorageError::AccessDenied);
        }

        let created = match fs::create_dir(&dir) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => false,
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = check_usable_dir(&dir, &self.root) {
            if created {
                let _ = fs::remove_dir(&dir);
            }
            return Err(e);
        }

        let mut users = self.users.write();
        let canonical = dir.canonicalize()?;
        // a different spelling of a tracked folder (case-insensitive filesystems)
        if users
            .values()
            .any(|owned| owned.root.canonicalize().ok().as_ref() == Some(&canonical))
        {
            warn!(login = %login, dir = %dir.display(), "sandbox already owned by another login");
            return Err(StorageError::AccessDenied);
        }
        users.insert(
            login.to_string(),
            UserDirs {
                root: dir.clone(),
                working_dir: dir.clone(),
            },
        );
        debug!(login = %login, dir = %dir.display(), "sandbox ready");
        Ok(dir)
    }

    /// Login whose sandbox root is exactly `dir`, if any.
    fn owner_of(&self, dir: &Path) -> Option<String> {
        self.users
            .read()
            .iter()
            .find(|(_, owned)| owned.root == dir)
            .map(|(login, _)| login.clone())
    }

    /// Working directory shown to the user, relative to their sandbox (`/` at the root).
    pub fn working_dir_display(&self, login: &str) -> Option<String> {
        let users = self.users.read();
        let dirs = users.get(login)?;
        let rel = dirs.working_dir.strip_prefix(&dirs.root).ok()?;
        let mut shown = String::from("/");
        shown.push_str(
            &rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"),
        );
        Some(shown)
    }

    /// Resolves a client path for `login`.
    ///
    /// An absolute request loses its root and is treated as relative. The
    /// result is anchored at the working directory and must be a strict
    /// descendant of the sandbox root, also after following any symlinks
    /// that already exist along the way.
    pub fn resolve(&self, login: &str, requested: &str) -> Result<PathBuf, StorageError> {
        if requested.contains('\0') {
            return Err(StorageError::AccessDenied);
        }
        let (root, working_dir) = {
            let users = self.users.read();
            let dirs = users.get(login).ok_or(StorageError::NoSession)?;
            (dirs.root.clone(), dirs.working_dir.clone())
        };

        let relative = strip_root(&normalize_lexically(Path::new(requested)));
        let resolved = normalize_lexically(&working_dir.join(relative));
        if !resolved.starts_with(&root) || resolved == root {
            return Err(StorageError::AccessDenied);
        }
        ensure_no_symlink_escape(&resolved, &root)?;
        Ok(resolved)
    }

    /// Writes `data` to the resolved path, creating parents and overwriting.
    pub fn upload(&self, login: &str, path: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let target = self.resolve(login, path)?;
        ensure_parent_exists(&target)?;
        fs::write(&target, data)?;
        Ok(target)
    }

    /// Reads the whole file at the resolved path.
    pub fn download(&self, login: &str, path: &str) -> Result<(PathBuf, Vec<u8>), StorageError> {
        self.download_within(login, path, u64::MAX)
    }

    /// Like [`Storage::download`], refusing files longer than `max_len` bytes.
    pub fn download_within(
        &self,
        login: &str,
        path: &str,
        max_len: u64,
    ) -> Result<(PathBuf, Vec<u8>), StorageError> {
        let source = self.resolve(login, path)?;
        let mut file = match fs::File::open(&source) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata()?.len();
        if size > max_len {
            return Err(StorageError::TooLarge { size, max: max_len });
        }
        let mut bytes = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
        file.read_to_end(&mut bytes)?;
        Ok((source, bytes))
    }

    /// Renames `source` to `dest`; both are resolved independently.
    pub fn move_file(
        &self,
        login: &str,
        source: &str,
        dest: &str,
    ) -> Result<(PathBuf, PathBuf), StorageError> {
        let from = self.resolve(login, source)?;
        let to = self.resolve(login, dest)?;
        ensure_parent_exists(&to)?;
        fs::rename(&from, &to)?;
        Ok((from, to))
    }
}

/// Lexical normalisation: drops `.`, folds `name/..`, keeps leading `..` of
/// relative paths and treats the parent of a root as the root itself.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::Normal(name) => out.push(name),
        }
    }
    out
}

/// True when `login` is exactly one normal path component, spelled as given.
fn is_single_component(login: &str) -> bool {
    if login.contains('\0') {
        return false;
    }
    let mut components = Path::new(login).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == login
    )
}

/// Removes root and prefix components so the path can be joined as relative.
fn strip_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::Prefix(_) | Component::RootDir))
        .map(|c| OsString::from(c.as_os_str()))
        .collect()
}

/// The deepest existing ancestor of `path` must canonicalize to somewhere
/// inside `root`.
fn ensure_no_symlink_escape(path: &Path, root: &Path) -> Result<(), StorageError> {
    let mut cursor = Some(path);
    while let Some(candidate) = cursor {
        if fs::symlink_metadata(candidate).is_ok() {
            let canonical = candidate.canonicalize().map_err(|_| StorageError::AccessDenied)?;
            if !canonical.starts_with(root) {
                return Err(StorageError::AccessDenied);
            }
            return Ok(());
        }
        cursor = candidate.parent();
    }
    Err(StorageError::AccessDenied)
}

fn check_usable_dir(dir: &Path, server_root: &Path) -> Result<(), StorageError> {
    let canonical = dir.canonicalize()?;
    if !canonical.starts_with(server_root) || canonical == server_root {
        return Err(StorageError::AccessDenied);
    }
    let meta = fs::metadata(&canonical)?;
    if !meta.is_dir() || meta.permissions().readonly() {
        return Err(StorageError::AccessDenied);
    }
    fs::read_dir(&canonical)?;
    Ok(())
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir_exists(parent)?;
    }
    Ok(())
}
