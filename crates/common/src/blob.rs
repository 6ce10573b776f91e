//! Self-describing blob header.
//!
//! Every object in the repository, and every Blob PDU body, is this header
//! followed by opaque content running to end of file:
//!
//! ```text
//! "asnmagic"(8) random(32) owner(32) author(32) time(8, BE nanos) name_len(1) name
//! ```

use std::io::{self, Read, Write};

use chrono::{DateTime, Utc};

use crate::crypto::PublicKey;
use crate::pdu::{Pdu, PduPool};
use crate::proto::{read_array, read_u64, read_u8, Header, Id, ProtoError, Req, REQ_SIZE};

pub const MAGIC: &[u8; 8] = b"asnmagic";
pub const RANDOM_SIZE: usize = 32;
pub const MAX_NAME_LEN: usize = 255;

pub const MESSAGES: &str = "asn/messages";
pub const BRIDGE: &str = "asn/bridge";
pub const MARK: &str = "asn/mark";
pub const MARK_SERVER: &str = "asn/mark-server";
pub const APPROVALS: &str = "asn/approvals/";
pub const REMOVALS: &str = "asn/removals/";
pub const VOUCHERS: &str = "asn/vouchers/";
pub const AUTHOR: &str = "asn/author";
pub const AUTH: &str = "asn/auth";
pub const EDITORS: &str = "asn/editors";
pub const MODERATORS: &str = "asn/moderators";
pub const SUBSCRIBERS: &str = "asn/subscribers";
pub const INVITES: &str = "asn/invites";

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("bad blob magic")]
    Magic,
    #[error("blob name is {0} bytes, limit is {MAX_NAME_LEN}")]
    NameTooLong(usize),
    #[error("blob name is not utf-8")]
    NameEncoding,
    #[error("blob header: {0}")]
    Proto(#[from] ProtoError),
    #[error("blob i/o error: {0}")]
    Io(#[from] io::Error),
}

/// How the repository treats a blob, decided purely from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    /// Empty name or `asn/messages`: delivered to the owner's audience.
    Message,
    /// `asn/bridge`: relayed to subscribers, never archived.
    Bridge,
    /// `asn/mark` or `asn/mark-server`: the author's single location slot.
    Mark,
    /// `asn/approvals/...`: moderator releasing held messages.
    Approvals,
    /// `asn/removals/...`: sums the author wants collected.
    Removals,
    /// Name ending in `/`: append-only collection under the owner.
    Collection,
    /// Anything else: one overwritable named slot.
    Slot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub random: [u8; RANDOM_SIZE],
    pub owner: PublicKey,
    pub author: PublicKey,
    pub time: DateTime<Utc>,
    pub name: String,
}

impl Blob {
    /// New header stamped now with fresh random bytes.
    pub fn new(owner: PublicKey, author: PublicKey, name: &str) -> Result<Self, BlobError> {
        if name.len() > MAX_NAME_LEN {
            return Err(BlobError::NameTooLong(name.len()));
        }
        let mut random = [0u8; RANDOM_SIZE];
        getrandom::getrandom(&mut random).expect("failed to generate random bytes");
        Ok(Self {
            random,
            owner,
            author,
            time: Utc::now(),
            name: name.to_string(),
        })
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    pub fn kind(&self) -> BlobKind {
        let name = self.name.as_str();
        if name.is_empty() || name == MESSAGES {
            BlobKind::Message
        } else if name == BRIDGE {
            BlobKind::Bridge
        } else if name == MARK || name == MARK_SERVER {
            BlobKind::Mark
        } else if name.starts_with(APPROVALS) {
            BlobKind::Approvals
        } else if name.starts_with(REMOVALS) {
            BlobKind::Removals
        } else if name.ends_with('/') {
            BlobKind::Collection
        } else {
            BlobKind::Slot
        }
    }

    /// Nanoseconds since the unix epoch, as written on the wire.
    pub fn epoch(&self) -> u64 {
        crate::proto::nanos(&self.time)
    }

    /// Correlation token for the Ack of a Blob PDU. Blob PDUs carry no
    /// explicit request field, so the first random bytes stand in for one.
    pub fn req(&self) -> Req {
        let mut buff = [0u8; REQ_SIZE];
        buff.copy_from_slice(&self.random[..REQ_SIZE]);
        Req::from(buff)
    }

    pub fn encoded_len(&self) -> usize {
        MAGIC.len() + RANDOM_SIZE + 32 + 32 + 8 + 1 + self.name.len()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), BlobError> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(BlobError::NameTooLong(self.name.len()));
        }
        w.write_all(MAGIC)?;
        w.write_all(&self.random)?;
        w.write_all(self.owner.as_bytes())?;
        w.write_all(self.author.as_bytes())?;
        w.write_all(&self.epoch().to_be_bytes())?;
        w.write_all(&[self.name.len() as u8])?;
        w.write_all(self.name.as_bytes())?;
        Ok(())
    }

    /// Read a header, leaving the reader at the start of the content.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, BlobError> {
        let magic: [u8; 8] = read_array(r)?;
        if &magic != MAGIC {
            return Err(BlobError::Magic);
        }
        let random = read_array(r)?;
        let owner = PublicKey::from(read_array(r)?);
        let author = PublicKey::from(read_array(r)?);
        let time = DateTime::from_timestamp_nanos(read_u64(r)? as i64);
        let name_len = read_u8(r)? as usize;
        let mut name = vec![0u8; name_len];
        r.read_exact(&mut name).map_err(ProtoError::from)?;
        let name = String::from_utf8(name).map_err(|_| BlobError::NameEncoding)?;
        Ok(Self {
            random,
            owner,
            author,
            time,
            name,
        })
    }

    /// Blob PDU: protocol header, blob header, then `content`.
    pub fn to_pdu<R: Read>(
        &self,
        version: u8,
        content: &mut R,
        pool: &PduPool,
    ) -> Result<Pdu, BlobError> {
        let mut pdu = pool.alloc();
        Header::new(version, Id::Blob).write(&mut pdu)?;
        self.write_to(&mut pdu)?;
        io::copy(content, &mut pdu)?;
        Ok(pdu)
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    prop_compose! {
        fn arb_blob()(
            random in any::<[u8; 32]>(),
            owner in any::<[u8; 32]>(),
            author in any::<[u8; 32]>(),
            nanos in 0i64..i64::MAX,
            name in "[a-z0-9/_.-]{0,255}",
        ) -> Blob {
            Blob {
                random,
                owner: PublicKey::from(owner),
                author: PublicKey::from(author),
                time: DateTime::from_timestamp_nanos(nanos),
                name,
            }
        }
    }

    proptest! {
        #[test]
        fn test_blob_round_trip(blob in arb_blob(), content in proptest::collection::vec(any::<u8>(), 0..512)) {
            let pool = PduPool::default();
            let mut pdu = blob.to_pdu(0, &mut content.as_slice(), &pool).unwrap();
            let header = Header::read(&mut pdu).unwrap();
            prop_assert_eq!(header.id, Id::Blob);
            let parsed = Blob::read_from(&mut pdu).unwrap();
            prop_assert_eq!(&parsed, &blob);
            prop_assert_eq!(pdu.read_remaining().unwrap(), content);
        }
    }

    fn blob_named(name: &str) -> Blob {
        let key = PublicKey::from([7u8; 32]);
        Blob::new(key, key, name).unwrap()
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(blob_named("").kind(), BlobKind::Message);
        assert_eq!(blob_named(MESSAGES).kind(), BlobKind::Message);
        assert_eq!(blob_named(BRIDGE).kind(), BlobKind::Bridge);
        assert_eq!(blob_named(MARK).kind(), BlobKind::Mark);
        assert_eq!(blob_named(MARK_SERVER).kind(), BlobKind::Mark);
        assert_eq!(blob_named("asn/approvals/").kind(), BlobKind::Approvals);
        assert_eq!(blob_named("asn/removals/").kind(), BlobKind::Removals);
        assert_eq!(blob_named("photos/").kind(), BlobKind::Collection);
        assert_eq!(blob_named("profile").kind(), BlobKind::Slot);
    }

    #[test]
    fn test_name_limit() {
        let key = PublicKey::from([1u8; 32]);
        assert!(Blob::new(key, key, &"n".repeat(MAX_NAME_LEN)).is_ok());
        assert!(matches!(
            Blob::new(key, key, &"n".repeat(MAX_NAME_LEN + 1)),
            Err(BlobError::NameTooLong(256))
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = Vec::new();
        blob_named("x").write_to(&mut bytes).unwrap();
        bytes[0] = b'A';
        assert!(matches!(
            Blob::read_from(&mut bytes.as_slice()),
            Err(BlobError::Magic)
        ));
    }

    #[test]
    fn test_encoded_len_matches() {
        let blob = blob_named("some/name");
        let mut bytes = Vec::new();
        blob.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), blob.encoded_len());
    }
}
