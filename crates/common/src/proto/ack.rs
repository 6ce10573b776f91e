use std::io::{Read, Write};

use chrono::{DateTime, Utc};

use super::{read_array, read_rest, read_u64, read_u8, ErrCode, Header, Id, ProtoError, Req};
use crate::pdu::{Pdu, PduPool};

/// Why a request failed, as reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {reason}")]
pub struct AckFailure {
    pub code: ErrCode,
    pub reason: String,
}

/// Pre-decoded result of an Ack, handed to the waiting requester.
pub type AckOutcome = Result<(), AckFailure>;

/// Ack envelope: `Req(8)` + `time(8, nanos)` + `ErrCode(1)`.
///
/// On success the rest of the PDU is the reply payload. On failure the rest
/// is a UTF-8 reason, decoded into [`Ack::reason`] by [`Ack::read_body`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub req: Req,
    pub time: DateTime<Utc>,
    pub err: ErrCode,
    pub reason: Option<String>,
}

impl Ack {
    pub fn success(req: Req) -> Self {
        Self {
            req,
            time: Utc::now(),
            err: ErrCode::Success,
            reason: None,
        }
    }

    pub fn failure(req: Req, err: ErrCode, reason: impl Into<String>) -> Self {
        Self {
            req,
            time: Utc::now(),
            err,
            reason: Some(reason.into()),
        }
    }

    pub fn outcome(&self) -> AckOutcome {
        if self.err.is_success() {
            Ok(())
        } else {
            Err(AckFailure {
                code: self.err,
                reason: self.reason.clone().unwrap_or_default(),
            })
        }
    }

    /// Write header and envelope. Success payload is appended by the caller.
    pub fn format(&self, version: u8, pdu: &mut Pdu) -> Result<(), ProtoError> {
        Header::new(version, Id::Ack).write(pdu)?;
        self.write_body(pdu)
    }

    pub fn to_pdu(&self, version: u8, pool: &PduPool) -> Result<Pdu, ProtoError> {
        let mut pdu = pool.alloc();
        self.format(version, &mut pdu)?;
        Ok(pdu)
    }

    pub fn write_body<W: Write>(&self, w: &mut W) -> Result<(), ProtoError> {
        w.write_all(self.req.as_bytes())?;
        w.write_all(&nanos(&self.time).to_be_bytes())?;
        w.write_all(&[self.err as u8])?;
        if let (false, Some(reason)) = (self.err.is_success(), &self.reason) {
            w.write_all(reason.as_bytes())?;
        }
        Ok(())
    }

    /// Read the envelope. A success ack leaves the reader at the payload.
    pub fn read_body<R: Read>(r: &mut R) -> Result<Self, ProtoError> {
        let req = Req::from(read_array(r)?);
        let time = DateTime::from_timestamp_nanos(read_u64(r)? as i64);
        let err = ErrCode::try_from(read_u8(r)?)?;
        let reason = if err.is_success() {
            None
        } else {
            Some(String::from_utf8_lossy(&read_rest(r)?).into_owned())
        };
        Ok(Self {
            req,
            time,
            err,
            reason,
        })
    }
}

pub(crate) fn nanos(time: &DateTime<Utc>) -> u64 {
    time.timestamp_nanos_opt().unwrap_or(0).max(0) as u64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_success_ack_leaves_payload() {
        let pool = PduPool::default();
        let ack = Ack::success(Req::counter(7));
        let mut pdu = ack.to_pdu(0, &pool).unwrap();
        pdu.append(b"payload").unwrap();

        let header = Header::read(&mut pdu).unwrap();
        assert_eq!(header.id, Id::Ack);
        let parsed = Ack::read_body(&mut pdu).unwrap();
        assert_eq!(parsed, ack);
        assert!(parsed.outcome().is_ok());
        assert_eq!(pdu.read_remaining().unwrap(), b"payload");
    }

    #[test]
    fn test_failure_ack_carries_reason() {
        let pool = PduPool::default();
        let ack = Ack::failure(Req::literal("exec"), ErrCode::Denied, "not yours");
        let mut pdu = ack.to_pdu(0, &pool).unwrap();

        Header::read(&mut pdu).unwrap();
        let parsed = Ack::read_body(&mut pdu).unwrap();
        let failure = parsed.outcome().unwrap_err();
        assert_eq!(failure.code, ErrCode::Denied);
        assert_eq!(failure.reason, "not yours");
    }

    #[test]
    fn test_truncated_ack_is_short() {
        let pool = PduPool::default();
        let mut pdu = pool.from_bytes(&[0, 1, 0, 0, 0]).unwrap();
        Header::read(&mut pdu).unwrap();
        assert!(matches!(Ack::read_body(&mut pdu), Err(ProtoError::Short)));
    }
}
