use crate::blob::{Blob, BlobKind};
use crate::crypto::PublicKey;

use super::{Repos, ReposError};

impl Repos {
    /// May `acting` write `blob`?
    ///
    /// Admin and service keys may write anything. Everyone else must be the
    /// blob's author; a mark then needs nothing more, any other write needs
    /// `acting` to be the owner, the owner's registered author or one of the
    /// owner's editors.
    pub fn permission(&self, blob: &Blob, acting: &PublicKey) -> Result<(), ReposError> {
        if self.is_privileged(acting) {
            return Ok(());
        }
        if blob.author != *acting {
            return Err(ReposError::Permission(format!(
                "{} cannot write as {}",
                acting.short(),
                blob.author.short()
            )));
        }
        if blob.kind() == BlobKind::Mark || blob.owner == *acting {
            return Ok(());
        }
        let owner = self.user(&blob.owner);
        if owner.author.as_ref() == Some(acting) || owner.is_editor(acting) {
            return Ok(());
        }
        Err(ReposError::Permission(format!(
            "{} cannot write {}'s {}",
            acting.short(),
            blob.owner.short(),
            if blob.name.is_empty() { "messages" } else { &blob.name }
        )))
    }
}
