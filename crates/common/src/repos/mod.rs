//! Content-addressed blob repository.
//!
//! Objects live at `<dir>/<2 hex>/<126 hex>`, named by the SHA-512 of their
//! full encoding. Users get a directory at `<dir>/<2 hex>/<62 hex>/` named
//! by their public key, and everything under it is a hard link to some
//! object. The link count of an object therefore counts its named
//! references: an object whose only link is its sum path is garbage.
//!
//! ```text
//! <dir>/
//!   tmp/tmp_<n>             staging, emptied at open
//!   3f/<126 hex>            object
//!   a1/<62 hex>/asn/editors user slot -> object
//! ```
//!
//! All operations are blocking filesystem calls; async callers should run
//! them on a blocking thread.

mod gc;
mod links;
mod permission;
mod sum;
mod user;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha512};

use crate::blob::{Blob, BlobError};
use crate::crypto::{KeyError, PublicKey};
use crate::proto::ErrCode;

pub use gc::GcReport;
pub use links::Delivery;
pub use sum::{Sum, SUM_HEX_LEN, SUM_SIZE};
pub use user::{parse_keys, read_header, read_object, ReposUser, CONTROL_NAMES};

const TMP_DIR: &str = "tmp";
const KEY_HEX_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ReposError {
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad path: {0}")]
    BadPath(String),
    #[error("repository i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("blob error: {0}")]
    Blob(#[from] BlobError),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

impl ReposError {
    pub fn code(&self) -> ErrCode {
        match self {
            ReposError::Permission(_) => ErrCode::Denied,
            ReposError::BadPath(_) | ReposError::Blob(_) | ReposError::Key(_) => ErrCode::IllFormed,
            ReposError::NotFound(_) | ReposError::Io(_) => ErrCode::Failure,
        }
    }
}

/// Result of [`Repos::store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    pub sum: Sum,
    /// Object path when the object is new, `None` when it already existed.
    pub path: Option<PathBuf>,
}

impl Stored {
    pub fn is_new(&self) -> bool {
        self.path.is_some()
    }
}

/// Result of [`Repos::ingest`].
#[derive(Debug, Clone)]
pub struct Ingested {
    pub sum: Sum,
    pub new: bool,
    pub deliveries: Vec<Delivery>,
}

#[derive(Debug)]
pub struct Repos {
    dir: PathBuf,
    service: PublicKey,
    admin: Option<PublicKey>,
    users: Mutex<HashMap<PublicKey, ReposUser>>,
    tmp_counter: AtomicU64,
    /// Held shared by store+link, exclusive by gc, so gc never sees an
    /// object between its creation and its first named link.
    sweep: RwLock<()>,
}

impl Repos {
    /// Open (creating if needed) the repository at `dir`. Leftover staging
    /// files are removed and every user directory's control slots loaded.
    pub fn open(
        dir: impl AsRef<Path>,
        service: PublicKey,
        admin: Option<PublicKey>,
    ) -> Result<Self, ReposError> {
        let dir = dir.as_ref().to_path_buf();
        let tmp = dir.join(TMP_DIR);
        fs::create_dir_all(&tmp)?;
        for entry in fs::read_dir(&tmp)? {
            let entry = entry?;
            if let Err(e) = fs::remove_file(entry.path()) {
                tracing::warn!(path = %entry.path().display(), error = %e, "failed to flush staging file");
            }
        }

        let repos = Self {
            dir,
            service,
            admin,
            users: Mutex::new(HashMap::new()),
            tmp_counter: AtomicU64::new(0),
            sweep: RwLock::new(()),
        };
        let users = repos.scan_users()?;
        tracing::info!(dir = %repos.dir.display(), users = users.len(), "opened repository");
        *repos.users.lock() = users;
        Ok(repos)
    }

    fn scan_users(&self) -> Result<HashMap<PublicKey, ReposUser>, ReposError> {
        let mut users = HashMap::new();
        for dd in fs::read_dir(&self.dir)? {
            let dd = dd?;
            let prefix = dd.file_name().to_string_lossy().into_owned();
            if !is_hex(&prefix, 2) || !dd.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(dd.path())? {
                let entry = entry?;
                let rest = entry.file_name().to_string_lossy().into_owned();
                if !is_hex(&rest, KEY_HEX_LEN - 2) || !entry.file_type()?.is_dir() {
                    continue;
                }
                let key = PublicKey::from_hex(&format!("{}{}", prefix, rest))?;
                match ReposUser::load(key, &entry.path()) {
                    Ok(user) => {
                        users.insert(key, user);
                    }
                    Err(e) => {
                        tracing::warn!(user = %key.short(), error = %e, "skipping unreadable user")
                    }
                }
            }
        }
        Ok(users)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn service(&self) -> &PublicKey {
        &self.service
    }

    pub fn admin(&self) -> Option<&PublicKey> {
        self.admin.as_ref()
    }

    pub fn is_privileged(&self, key: &PublicKey) -> bool {
        *key == self.service || self.admin.as_ref() == Some(key)
    }

    pub fn object_path(&self, sum: &Sum) -> PathBuf {
        self.dir.join(sum.rel_path())
    }

    pub fn user_dir(&self, key: &PublicKey) -> PathBuf {
        let hex = key.to_hex();
        self.dir.join(&hex[..2]).join(&hex[2..])
    }

    /// Cached state of `key`; users never written to are empty.
    pub fn user(&self, key: &PublicKey) -> ReposUser {
        self.users
            .lock()
            .entry(*key)
            .or_insert_with(|| ReposUser::new(*key))
            .clone()
    }

    /// Whether `key` has a user directory.
    pub fn has_user(&self, key: &PublicKey) -> bool {
        self.user_dir(key).is_dir()
    }

    pub fn users(&self) -> Vec<PublicKey> {
        let mut keys: Vec<_> = self.users.lock().keys().copied().collect();
        keys.sort();
        keys
    }

    /// User whose `asn/auth` slot names `key`.
    pub fn user_for_auth(&self, key: &PublicKey) -> Option<PublicKey> {
        self.users
            .lock()
            .values()
            .find(|u| u.auth.as_ref() == Some(key))
            .map(|u| u.key)
    }

    pub fn new_user(&self, key: &PublicKey) -> Result<bool, ReposError> {
        let dir = self.user_dir(key);
        if dir.is_dir() {
            return Ok(false);
        }
        fs::create_dir_all(dir.join("asn"))?;
        self.user(key);
        tracing::info!(user = %key.short(), "created user");
        Ok(true)
    }

    fn update_user<F: FnOnce(&mut ReposUser)>(&self, key: &PublicKey, f: F) {
        let mut users = self.users.lock();
        f(users.entry(*key).or_insert_with(|| ReposUser::new(*key)));
    }

    fn tmp_path(&self) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.dir.join(TMP_DIR).join(format!("tmp_{}", n))
    }

    /// Write `blob` followed by `content` as an object. The encoding is
    /// hashed while it streams to a staging file, which is then linked into
    /// place unless an object with the same sum already exists.
    pub fn store<R: Read>(&self, blob: &Blob, content: &mut R) -> Result<Stored, ReposError> {
        let tmp = self.tmp_path();
        let result = self.store_staged(&tmp, blob, content);
        if let Err(e) = fs::remove_file(&tmp) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %tmp.display(), error = %e, "failed to remove staging file");
            }
        }
        result
    }

    fn store_staged<R: Read>(
        &self,
        tmp: &Path,
        blob: &Blob,
        content: &mut R,
    ) -> Result<Stored, ReposError> {
        let mut file = File::create(tmp)?;
        let mut hasher = Sha512::new();

        let mut header = Vec::with_capacity(blob.encoded_len());
        blob.write_to(&mut header)?;
        hasher.update(&header);
        file.write_all(&header)?;

        let mut buf = [0u8; 8192];
        loop {
            let n = content.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])?;
        }
        file.sync_all()?;

        let sum = Sum::from_hasher(hasher);
        let path = self.object_path(&sum);
        if path.exists() {
            tracing::debug!(%sum, "object already stored");
            return Ok(Stored { sum, path: None });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::hard_link(tmp, &path) {
            Ok(()) => Ok(Stored {
                sum,
                path: Some(path),
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(Stored { sum, path: None }),
            Err(e) => Err(e.into()),
        }
    }

    /// Store and fan out a blob written by `acting`: permission check,
    /// [`Repos::store`], then [`Repos::mk_links`] for new objects.
    pub fn ingest<R: Read>(
        &self,
        blob: &Blob,
        content: &mut R,
        acting: &PublicKey,
    ) -> Result<Ingested, ReposError> {
        check_name(&blob.name)?;
        self.permission(blob, acting)?;

        let _sweep = self.sweep.read();
        let stored = self.store(blob, content)?;
        let deliveries = if stored.is_new() {
            self.mk_links(blob, &stored.sum)?
        } else {
            Vec::new()
        };
        tracing::info!(
            sum = %stored.sum,
            name = %blob.name,
            owner = %blob.owner.short(),
            author = %blob.author.short(),
            new = stored.is_new(),
            deliveries = deliveries.len(),
            "ingested blob"
        );
        Ok(Ingested {
            sum: stored.sum,
            new: stored.is_new(),
            deliveries,
        })
    }

    /// Map a command argument to a path in the repository:
    /// `~<key hex>/<rel>` is under that user, a bare 128 hex sum is an
    /// object, anything else is relative to `acting`'s directory.
    pub fn resolve(&self, acting: &PublicKey, arg: &str) -> Result<PathBuf, ReposError> {
        if let Some(rest) = arg.strip_prefix('~') {
            let (key, rel) = rest.split_once('/').unwrap_or((rest, ""));
            let key = PublicKey::from_hex(key)?;
            check_rel(rel)?;
            return Ok(self.user_dir(&key).join(rel));
        }
        if is_hex(arg, SUM_HEX_LEN) {
            return Ok(self.object_path(&Sum::from_hex(arg)?));
        }
        check_rel(arg)?;
        Ok(self.user_dir(acting).join(arg))
    }

    /// Open an object or link for reading, positioned at its content.
    pub fn cat(&self, path: &Path) -> Result<(Blob, File), ReposError> {
        let mut file = File::open(path).map_err(|e| not_found(e, path))?;
        let blob = Blob::read_from(&mut file)?;
        Ok((blob, file))
    }

    /// Entry names under `path`, sorted, directories suffixed with `/`.
    pub fn ls(&self, path: &Path) -> Result<Vec<String>, ReposError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| not_found(e, path))? {
            let entry = entry?;
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Remove a named link. Users may only remove links in their own tree.
    pub fn rm(&self, acting: &PublicKey, path: &Path) -> Result<(), ReposError> {
        if !self.is_privileged(acting) && !path.starts_with(self.user_dir(acting)) {
            return Err(ReposError::Permission(format!(
                "{} is outside your tree",
                self.display(path)
            )));
        }
        let meta = fs::symlink_metadata(path).map_err(|e| not_found(e, path))?;
        if meta.is_dir() {
            fs::remove_dir(path)?;
        } else {
            fs::remove_file(path)?;
        }
        tracing::info!(path = %self.display(path), by = %acting.short(), "removed link");
        Ok(())
    }

    /// `path` relative to the repository root, for replies and logs.
    pub fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.dir)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    /// Hard link `sum`'s object at `to`. An existing link is left alone.
    fn link(&self, sum: &Sum, to: &Path) -> Result<bool, ReposError> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::hard_link(self.object_path(sum), to) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn not_found(e: io::Error, path: &Path) -> ReposError {
    if e.kind() == io::ErrorKind::NotFound {
        ReposError::NotFound(path.display().to_string())
    } else {
        ReposError::Io(e)
    }
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Relative path with no root, `..` or `.` components.
fn check_rel(rel: &str) -> Result<(), ReposError> {
    let ok = Path::new(rel)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(ReposError::BadPath(rel.to_string()))
    }
}

/// Blob names become paths under a user directory.
fn check_name(name: &str) -> Result<(), ReposError> {
    if name.starts_with('/') || name.split('/').any(|part| part == ".." || part == ".") {
        return Err(ReposError::BadPath(name.to_string()));
    }
    check_rel(name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_name_checks() {
        assert!(check_name("asn/messages").is_ok());
        assert!(check_name("photos/").is_ok());
        assert!(check_name("").is_ok());
        assert!(check_name("../escape").is_err());
        assert!(check_name("/etc/passwd").is_err());
        assert!(check_name("a/./b").is_err());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ReposError::Permission("x".into()).code(), ErrCode::Denied);
        assert_eq!(ReposError::BadPath("x".into()).code(), ErrCode::IllFormed);
        assert_eq!(ReposError::NotFound("x".into()).code(), ErrCode::Failure);
    }
}
