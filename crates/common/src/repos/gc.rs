use std::fs::{self, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::blob::{Blob, REMOVALS};

use super::{is_hex, read_header, read_object, Repos, ReposError, Sum, SUM_HEX_LEN, TMP_DIR};

/// What a [`Repos::gc`] pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Named links dropped because their author listed them for removal.
    pub unlinked: usize,
    /// Objects deleted because nothing linked to them any more.
    pub removed: usize,
}

impl Repos {
    /// Call `f` for every object whose header time is after `epoch`. The
    /// unix epoch itself selects everything.
    pub fn filter<F>(&self, epoch: DateTime<Utc>, mut f: F) -> Result<(), ReposError>
    where
        F: FnMut(&Sum, &Path, &Blob) -> Result<(), ReposError>,
    {
        let all = crate::proto::nanos(&epoch) == 0;
        for dd in fs::read_dir(&self.dir)? {
            let dd = dd?;
            let prefix = dd.file_name().to_string_lossy().into_owned();
            if prefix == TMP_DIR || !is_hex(&prefix, 2) || !dd.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(dd.path())? {
                let entry = entry?;
                let rest = entry.file_name().to_string_lossy().into_owned();
                if !is_hex(&rest, SUM_HEX_LEN - 2) || !entry.file_type()?.is_file() {
                    continue;
                }
                let path = entry.path();
                let Some(sum) = Sum::from_object_path(&path) else {
                    continue;
                };
                let blob = match read_header(&path) {
                    Ok(blob) => blob,
                    Err(e) => {
                        tracing::warn!(%sum, error = %e, "skipping unreadable object");
                        continue;
                    }
                };
                if all || blob.time > epoch {
                    f(&sum, &path, &blob)?;
                }
            }
        }
        Ok(())
    }

    /// Apply every removal log, then delete objects after `epoch` that no
    /// named link points to.
    pub fn gc(&self, epoch: DateTime<Utc>) -> Result<GcReport, ReposError> {
        let _sweep = self.sweep.write();
        let mut report = GcReport::default();

        for user in self.users() {
            let dir = self.user_dir(&user);
            let logs = dir.join(REMOVALS);
            if !logs.is_dir() {
                continue;
            }
            for log in removal_logs(&logs)? {
                let content = match read_object(&log) {
                    Ok((_, content)) => content,
                    Err(e) => {
                        tracing::warn!(
                            log = %self.display(&log),
                            error = %e,
                            "skipping unreadable removal log"
                        );
                        continue;
                    }
                };
                for word in String::from_utf8_lossy(&content).split_whitespace() {
                    let Ok(sum) = Sum::from_hex(word) else {
                        continue;
                    };
                    let Ok(target) = fs::metadata(self.object_path(&sum)) else {
                        continue;
                    };
                    report.unlinked += unlink_matching(&dir, &logs, &target)?;
                }
            }
        }

        let mut dead = Vec::new();
        self.filter(epoch, |_, path, _| {
            if fs::metadata(path)?.nlink() == 1 {
                dead.push(path.to_path_buf());
            }
            Ok(())
        })?;
        for path in dead {
            fs::remove_file(&path)?;
            report.removed += 1;
        }

        tracing::info!(
            unlinked = report.unlinked,
            removed = report.removed,
            %epoch,
            "garbage collected"
        );
        Ok(report)
    }
}

/// Every regular file under `dir`, however deep.
fn removal_logs(dir: &Path) -> Result<Vec<PathBuf>, ReposError> {
    let mut logs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            logs.extend(removal_logs(&entry.path())?);
        } else if file_type.is_file() {
            logs.push(entry.path());
        }
    }
    Ok(logs)
}

/// Remove every file under `dir`, except inside `skip`, that is the same
/// inode as `target`.
fn unlink_matching(dir: &Path, skip: &Path, target: &Metadata) -> Result<usize, ReposError> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path == skip {
            continue;
        }
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            count += unlink_matching(&path, skip, target)?;
        } else if meta.dev() == target.dev() && meta.ino() == target.ino() {
            fs::remove_file(&path)?;
            tracing::debug!(path = %path.display(), "unlinked removed object");
            count += 1;
        }
    }
    Ok(count)
}
