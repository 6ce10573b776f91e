use std::fs;
use std::io;
use std::path::PathBuf;

use crate::blob::{self, Blob, BlobKind};
use crate::crypto::PublicKey;

use super::{read_header, read_object, Repos, ReposError, Sum, SUM_HEX_LEN};

/// A blob that must be pushed to every live session of `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: PublicKey,
    pub sum: Sum,
    /// Link to read the object from.
    pub path: PathBuf,
}

impl Repos {
    /// Create the named links for a freshly stored object and report who
    /// has to receive it. Which links depends on the blob's name.
    ///
    /// A bridged blob keeps no canonical object: each subscriber's
    /// `asn/bridge/` entry is the only reference, so [`Repos::gc`] never
    /// sees it. The data goes when the last recipient removes its entry
    /// with [`Repos::rm`].
    pub fn mk_links(&self, blob: &Blob, sum: &Sum) -> Result<Vec<Delivery>, ReposError> {
        let entry = format!("{}_{}", blob.epoch(), sum.to_hex());
        match blob.kind() {
            BlobKind::Message => {
                let author = self.user_dir(&blob.author);
                self.link(sum, &author.join(blob::MESSAGES).join(&entry))?;
                let owner = self.user(&blob.owner);
                let recipients = if owner.moderators.is_empty() {
                    audience(&owner.key, &owner.subscribers, &blob.author)
                } else {
                    audience_of(&owner.moderators, &blob.author)
                };
                self.deliver_messages(sum, &entry, recipients)
            }
            BlobKind::Bridge => {
                let owner = self.user(&blob.owner);
                let mut deliveries = Vec::new();
                for to in audience_of(&owner.subscribers, &blob.author) {
                    let path = self.user_dir(&to).join(blob::BRIDGE).join(&entry);
                    self.link(sum, &path)?;
                    deliveries.push(Delivery { to, sum: *sum, path });
                }
                fs::remove_file(self.object_path(sum))?;
                Ok(deliveries)
            }
            BlobKind::Mark => {
                let path = self.user_dir(&blob.author).join(&blob.name);
                match fs::remove_file(&path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
                self.link(sum, &path)?;
                let (_, content) = read_object(&path)?;
                let content = String::from_utf8_lossy(&content).into_owned();
                self.update_user(&blob.author, |u| {
                    u.refresh(&blob.name, &content);
                });
                Ok(Vec::new())
            }
            BlobKind::Approvals => {
                let path = self
                    .user_dir(&blob.owner)
                    .join(format!("{}{}", blob.name, entry));
                self.link(sum, &path)?;
                let (_, content) = read_object(&path)?;
                self.approve(blob, &String::from_utf8_lossy(&content))
            }
            BlobKind::Removals => {
                let path = self
                    .user_dir(&blob.author)
                    .join(format!("{}{}", blob.name, entry));
                self.link(sum, &path)?;
                Ok(Vec::new())
            }
            BlobKind::Collection => {
                let path = self
                    .user_dir(&blob.owner)
                    .join(format!("{}{}", blob.name, entry));
                self.link(sum, &path)?;
                Ok(self.owner_delivery(blob, sum, path))
            }
            BlobKind::Slot => self.replace_slot(blob, sum),
        }
    }

    fn deliver_messages(
        &self,
        sum: &Sum,
        entry: &str,
        recipients: Vec<PublicKey>,
    ) -> Result<Vec<Delivery>, ReposError> {
        let mut deliveries = Vec::with_capacity(recipients.len());
        for to in recipients {
            let path = self.user_dir(&to).join(blob::MESSAGES).join(entry);
            self.link(sum, &path)?;
            deliveries.push(Delivery { to, sum: *sum, path });
        }
        Ok(deliveries)
    }

    /// Release held messages. Each listed sum is fanned out to its owner's
    /// audience if the approver moderates that owner.
    fn approve(&self, approval: &Blob, content: &str) -> Result<Vec<Delivery>, ReposError> {
        let mut deliveries = Vec::new();
        for word in content.split_whitespace() {
            if word.len() != SUM_HEX_LEN {
                continue;
            }
            let sum = match Sum::from_hex(word) {
                Ok(sum) => sum,
                Err(_) => continue,
            };
            let original = match read_header(&self.object_path(&sum)) {
                Ok(original) => original,
                Err(e) => {
                    tracing::warn!(%sum, error = %e, "approved object is unreadable");
                    continue;
                }
            };
            let owner = self.user(&original.owner);
            if !owner.is_moderator(&approval.author) && !self.is_privileged(&approval.author) {
                tracing::warn!(
                    %sum,
                    approver = %approval.author.short(),
                    "approver does not moderate owner"
                );
                continue;
            }
            let entry = format!("{}_{}", original.epoch(), sum.to_hex());
            let recipients = audience(&owner.key, &owner.subscribers, &original.author);
            deliveries.extend(self.deliver_messages(&sum, &entry, recipients)?);
        }
        Ok(deliveries)
    }

    /// Named slot: replaced only by a strictly newer write.
    fn replace_slot(&self, blob: &Blob, sum: &Sum) -> Result<Vec<Delivery>, ReposError> {
        let path = self.user_dir(&blob.owner).join(&blob.name);
        if path.is_file() {
            let current = read_header(&path)?;
            if current.time >= blob.time {
                tracing::debug!(name = %blob.name, "slot already holds a newer write");
                return Ok(Vec::new());
            }
            fs::remove_file(&path)?;
        }
        self.link(sum, &path)?;

        if super::CONTROL_NAMES.contains(&blob.name.as_str()) {
            let (_, content) = read_object(&path)?;
            let content = String::from_utf8_lossy(&content).into_owned();
            self.update_user(&blob.owner, |u| {
                u.refresh(&blob.name, &content);
            });
            tracing::info!(user = %blob.owner.short(), slot = %blob.name, "control slot updated");
        }
        Ok(self.owner_delivery(blob, sum, path))
    }

    fn owner_delivery(&self, blob: &Blob, sum: &Sum, path: PathBuf) -> Vec<Delivery> {
        if blob.author == blob.owner {
            Vec::new()
        } else {
            vec![Delivery {
                to: blob.owner,
                sum: *sum,
                path,
            }]
        }
    }
}

/// Owner plus subscribers, minus the author, without repeats.
fn audience(owner: &PublicKey, subscribers: &[PublicKey], author: &PublicKey) -> Vec<PublicKey> {
    let mut keys = vec![*owner];
    keys.extend_from_slice(subscribers);
    audience_of(&keys, author)
}

fn audience_of(keys: &[PublicKey], author: &PublicKey) -> Vec<PublicKey> {
    let mut out: Vec<PublicKey> = Vec::with_capacity(keys.len());
    for key in keys {
        if key != author && !out.contains(key) {
            out.push(*key);
        }
    }
    out
}
