//! Wire format of ASN PDUs.
//!
//! Every decrypted PDU starts with a two byte header, `version` then a
//! version-mapped type [`Id`], followed by type specific fields. All
//! integers are big-endian. Request messages carry an 8 byte [`Req`] right
//! after the header; the matching [`Ack`] echoes it back.

mod ack;
mod err;
mod id;
mod messages;
mod req;

use std::io::{self, Read, Write};

use crate::pdu::{Pdu, PduError, PduPool};

pub use ack::{Ack, AckFailure, AckOutcome};
pub(crate) use ack::nanos;
pub use err::ErrCode;
pub use id::{negotiate, Id, LATEST_VERSION};
pub use messages::{Exec, Index, Login, Pause, Quit, Redirect, Resume};
pub use req::{Req, Requester, REQ_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("pdu i/o error: {0}")]
    Io(io::Error),
    #[error("pdu too short")]
    Short,
    #[error("ill-formed pdu: {0}")]
    IllFormed(String),
    #[error("incompatible protocol version {0}")]
    Incompatible(u8),
    #[error("unknown pdu id {id} in version {version}")]
    UnknownId { version: u8, id: u8 },
    #[error("pdu error: {0}")]
    Pdu(#[from] PduError),
}

impl From<io::Error> for ProtoError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProtoError::Short
        } else {
            ProtoError::Io(e)
        }
    }
}

impl ProtoError {
    /// Code to report when this error ends a request.
    pub fn code(&self) -> ErrCode {
        match self {
            ProtoError::Short => ErrCode::Short,
            ProtoError::IllFormed(_) => ErrCode::IllFormed,
            ProtoError::Incompatible(_) => ErrCode::Incompatible,
            ProtoError::UnknownId { .. } => ErrCode::Unknown,
            ProtoError::Io(_) | ProtoError::Pdu(_) => ErrCode::Failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub id: Id,
}

impl Header {
    pub const SIZE: usize = 2;

    pub fn new(version: u8, id: Id) -> Self {
        Self { version, id }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), ProtoError> {
        w.write_all(&[self.version, self.id.to_wire(self.version)?])?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self, ProtoError> {
        let [version, id] = read_array::<_, 2>(r)?;
        Ok(Self {
            version,
            id: Id::from_wire(version, id)?,
        })
    }
}

/// A request PDU with a fixed body layout.
pub trait Message: Sized {
    const ID: Id;

    fn req(&self) -> Req;

    fn write_body<W: Write>(&self, w: &mut W) -> Result<(), ProtoError>;

    /// Parse the body of a PDU whose header has already been read.
    fn read_body<R: Read>(r: &mut R) -> Result<Self, ProtoError>;

    fn format(&self, version: u8, pdu: &mut Pdu) -> Result<(), ProtoError> {
        Header::new(version, Self::ID).write(pdu)?;
        self.write_body(pdu)
    }

    fn to_pdu(&self, version: u8, pool: &PduPool) -> Result<Pdu, ProtoError> {
        let mut pdu = pool.alloc();
        self.format(version, &mut pdu)?;
        Ok(pdu)
    }
}

pub(crate) fn read_array<R: Read, const N: usize>(r: &mut R) -> Result<[u8; N], ProtoError> {
    let mut buff = [0u8; N];
    r.read_exact(&mut buff)?;
    Ok(buff)
}

pub(crate) fn read_u8<R: Read>(r: &mut R) -> Result<u8, ProtoError> {
    Ok(read_array::<_, 1>(r)?[0])
}

pub(crate) fn read_u64<R: Read>(r: &mut R) -> Result<u64, ProtoError> {
    Ok(u64::from_be_bytes(read_array(r)?))
}

pub(crate) fn read_rest<R: Read>(r: &mut R) -> Result<Vec<u8>, ProtoError> {
    let mut rest = Vec::new();
    r.read_to_end(&mut rest)?;
    Ok(rest)
}
