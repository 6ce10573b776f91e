use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::blob::{self, Blob};
use crate::crypto::PublicKey;

use super::ReposError;

/// Names of the per-user slots whose content is cached in [`ReposUser`].
pub const CONTROL_NAMES: [&str; 8] = [
    blob::AUTHOR,
    blob::AUTH,
    blob::EDITORS,
    blob::MODERATORS,
    blob::SUBSCRIBERS,
    blob::INVITES,
    blob::MARK,
    blob::MARK_SERVER,
];

/// Cached control lists of one user, mirrored from the user's control
/// slots on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReposUser {
    pub key: PublicKey,
    /// Key registered as writing on this user's behalf.
    pub author: Option<PublicKey>,
    /// Extra key allowed to log in as this user.
    pub auth: Option<PublicKey>,
    pub editors: Vec<PublicKey>,
    pub moderators: Vec<PublicKey>,
    pub subscribers: Vec<PublicKey>,
    pub invites: Vec<PublicKey>,
    /// Last location the user published with `mark`.
    pub mark: Option<String>,
}

impl ReposUser {
    pub fn new(key: PublicKey) -> Self {
        Self {
            key,
            author: None,
            auth: None,
            editors: Vec::new(),
            moderators: Vec::new(),
            subscribers: Vec::new(),
            invites: Vec::new(),
            mark: None,
        }
    }

    /// Read every control slot present under `dir`.
    pub fn load(key: PublicKey, dir: &Path) -> Result<Self, ReposError> {
        let mut user = Self::new(key);
        for name in CONTROL_NAMES {
            let path = dir.join(name);
            if !path.is_file() {
                continue;
            }
            let (_, content) = read_object(&path)?;
            user.refresh(name, &String::from_utf8_lossy(&content));
        }
        Ok(user)
    }

    /// Update the cache after `name` was written with `content`. Returns
    /// `false` if `name` is not a control slot.
    pub fn refresh(&mut self, name: &str, content: &str) -> bool {
        match name {
            blob::AUTHOR => self.author = parse_keys(content).into_iter().next(),
            blob::AUTH => self.auth = parse_keys(content).into_iter().next(),
            blob::EDITORS => self.editors = parse_keys(content),
            blob::MODERATORS => self.moderators = parse_keys(content),
            blob::SUBSCRIBERS => self.subscribers = parse_keys(content),
            blob::INVITES => self.invites = parse_keys(content),
            blob::MARK | blob::MARK_SERVER => self.mark = Some(content.trim().to_string()),
            _ => return false,
        }
        true
    }

    pub fn is_editor(&self, key: &PublicKey) -> bool {
        self.editors.contains(key)
    }

    pub fn is_moderator(&self, key: &PublicKey) -> bool {
        self.moderators.contains(key)
    }

    pub fn is_invited(&self, key: &PublicKey) -> bool {
        self.invites.contains(key)
    }
}

/// Whitespace separated hex keys. Unparseable entries are skipped.
pub fn parse_keys(content: &str) -> Vec<PublicKey> {
    content
        .split_whitespace()
        .filter_map(|word| match PublicKey::from_hex(word) {
            Ok(key) => Some(key),
            Err(_) => {
                tracing::warn!(entry = word, "ignoring bad key in control list");
                None
            }
        })
        .collect()
}

/// Header and content of a stored object.
pub fn read_object(path: &Path) -> Result<(Blob, Vec<u8>), ReposError> {
    let mut reader = BufReader::new(File::open(path)?);
    let blob = Blob::read_from(&mut reader)?;
    let mut content = Vec::new();
    reader.read_to_end(&mut content)?;
    Ok((blob, content))
}

/// Header only.
pub fn read_header(path: &Path) -> Result<Blob, ReposError> {
    let mut reader = BufReader::new(File::open(path)?);
    Ok(Blob::read_from(&mut reader)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::SecretKey;

    #[test]
    fn test_refresh_control_lists() {
        let a = SecretKey::generate().public();
        let b = SecretKey::generate().public();
        let mut user = ReposUser::new(a);

        assert!(user.refresh(blob::EDITORS, &format!("{}\n{}\n", a.to_hex(), b.to_hex())));
        assert!(user.is_editor(&b));
        assert!(user.refresh(blob::MARK, "  somewhere.example:2323\n"));
        assert_eq!(user.mark.as_deref(), Some("somewhere.example:2323"));
        assert!(user.refresh(blob::AUTHOR, &b.to_hex()));
        assert_eq!(user.author, Some(b));
        assert!(!user.refresh("photos/", "whatever"));
    }

    #[test]
    fn test_bad_keys_are_skipped() {
        let a = SecretKey::generate().public();
        let keys = parse_keys(&format!("nothex {} deadbeef", a.to_hex()));
        assert_eq!(keys, vec![a]);
    }
}
