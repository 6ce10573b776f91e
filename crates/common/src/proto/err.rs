use std::fmt;

use super::ProtoError;

/// Error code carried by an Ack frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrCode {
    Success = 0,
    Denied = 1,
    Failure = 2,
    IllFormed = 3,
    Incompatible = 4,
    Redirect = 5,
    Short = 6,
    Unexpected = 7,
    Unknown = 8,
    Unsupported = 9,
}

impl TryFrom<u8> for ErrCode {
    type Error = ProtoError;
    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Ok(match b {
            0 => ErrCode::Success,
            1 => ErrCode::Denied,
            2 => ErrCode::Failure,
            3 => ErrCode::IllFormed,
            4 => ErrCode::Incompatible,
            5 => ErrCode::Redirect,
            6 => ErrCode::Short,
            7 => ErrCode::Unexpected,
            8 => ErrCode::Unknown,
            9 => ErrCode::Unsupported,
            b => return Err(ProtoError::IllFormed(format!("error code {}", b))),
        })
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrCode::Success => "success",
            ErrCode::Denied => "denied",
            ErrCode::Failure => "failure",
            ErrCode::IllFormed => "ill-formed",
            ErrCode::Incompatible => "incompatible",
            ErrCode::Redirect => "redirect",
            ErrCode::Short => "short",
            ErrCode::Unexpected => "unexpected",
            ErrCode::Unknown => "unknown",
            ErrCode::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

impl ErrCode {
    pub fn is_success(self) -> bool {
        self == ErrCode::Success
    }
}
