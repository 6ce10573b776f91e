use std::fmt;

use super::ProtoError;

/// Newest wire version this build speaks.
pub const LATEST_VERSION: u8 = 0;

/// Stable internal identifier of a PDU type.
///
/// The byte that goes on the wire is looked up per version, so the wire
/// numbering can change between versions without touching dispatch code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Id {
    Ack,
    Exec,
    Login,
    Pause,
    Quit,
    Redirect,
    Resume,
    Blob,
    Index,
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Id::Ack => "ack",
            Id::Exec => "exec",
            Id::Login => "login",
            Id::Pause => "pause",
            Id::Quit => "quit",
            Id::Redirect => "redirect",
            Id::Resume => "resume",
            Id::Blob => "blob",
            Id::Index => "index",
        };
        f.write_str(name)
    }
}

impl Id {
    pub fn from_wire(version: u8, byte: u8) -> Result<Self, ProtoError> {
        let id = match (version, byte) {
            (0, 1) => Id::Ack,
            (0, 2) => Id::Exec,
            (0, 3) => Id::Login,
            (0, 4) => Id::Pause,
            (0, 5) => Id::Quit,
            (0, 6) => Id::Redirect,
            (0, 7) => Id::Resume,
            (0, 8) => Id::Blob,
            (0, 9) => Id::Index,
            (v, _) if v > LATEST_VERSION => return Err(ProtoError::Incompatible(v)),
            (version, id) => return Err(ProtoError::UnknownId { version, id }),
        };
        Ok(id)
    }

    pub fn to_wire(self, version: u8) -> Result<u8, ProtoError> {
        match version {
            0 => Ok(match self {
                Id::Ack => 1,
                Id::Exec => 2,
                Id::Login => 3,
                Id::Pause => 4,
                Id::Quit => 5,
                Id::Redirect => 6,
                Id::Resume => 7,
                Id::Blob => 8,
                Id::Index => 9,
            }),
            v => Err(ProtoError::Incompatible(v)),
        }
    }
}

/// Version both sides can speak: the peer's if it is not newer than ours.
pub fn negotiate(current: u8, peer: u8) -> Result<u8, ProtoError> {
    if peer > LATEST_VERSION {
        return Err(ProtoError::Incompatible(peer));
    }
    Ok(current.min(peer))
}
