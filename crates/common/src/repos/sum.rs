use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha512};

use super::ReposError;

/// Size of a content sum in bytes
pub const SUM_SIZE: usize = 64;
/// Length of a sum in hex
pub const SUM_HEX_LEN: usize = SUM_SIZE * 2;

/// SHA-512 of a full encoded object, header included.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sum([u8; SUM_SIZE]);

impl From<[u8; SUM_SIZE]> for Sum {
    fn from(bytes: [u8; SUM_SIZE]) -> Self {
        Sum(bytes)
    }
}

impl Sum {
    pub fn of(data: &[u8]) -> Self {
        Self::from_hasher(Sha512::new_with_prefix(data))
    }

    pub(crate) fn from_hasher(hasher: Sha512) -> Self {
        let mut buff = [0u8; SUM_SIZE];
        buff.copy_from_slice(&hasher.finalize());
        Sum(buff)
    }

    pub fn from_hex(hex: &str) -> Result<Self, ReposError> {
        let mut buff = [0u8; SUM_SIZE];
        hex::decode_to_slice(hex, &mut buff)
            .map_err(|_| ReposError::BadPath(hex.to_string()))?;
        Ok(Sum(buff))
    }

    pub fn as_bytes(&self) -> &[u8; SUM_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Object path relative to the repository root: `<2 hex>/<126 hex>`.
    pub fn rel_path(&self) -> PathBuf {
        let hex = self.to_hex();
        Path::new(&hex[..2]).join(&hex[2..])
    }

    /// Recover a sum from an object path's last two components.
    pub fn from_object_path(path: &Path) -> Option<Self> {
        let rest = path.file_name()?.to_str()?;
        let dd = path.parent()?.file_name()?.to_str()?;
        if dd.len() != 2 || rest.len() != SUM_HEX_LEN - 2 {
            return None;
        }
        Sum::from_hex(&format!("{}{}", dd, rest)).ok()
    }
}

impl fmt::Display for Sum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sum({}…)", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_object_path_round_trip() {
        let sum = Sum::of(b"some object");
        let path = Path::new("/repos").join(sum.rel_path());
        assert_eq!(Sum::from_object_path(&path), Some(sum));
        assert_eq!(Sum::from_hex(&sum.to_hex()).unwrap(), sum);
    }

    #[test]
    fn test_rejects_non_object_paths() {
        assert_eq!(Sum::from_object_path(Path::new("/repos/tmp/tmp_1")), None);
        assert!(Sum::from_hex("abc").is_err());
    }
}
