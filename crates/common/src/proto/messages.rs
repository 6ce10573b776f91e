use std::io::{Read, Write};

use super::{read_array, read_rest, Id, Message, ProtoError, Req};
use crate::crypto::{Nonce, PublicKey, Signature, NONCE_SIZE, SIGNATURE_SIZE};
use crate::repos::{Sum, SUM_SIZE};

/// Run a command on the peer. Arguments go on the wire NUL-separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exec {
    pub req: Req,
    pub args: Vec<String>,
}

impl Exec {
    pub fn new<S: AsRef<str>>(req: Req, args: &[S]) -> Self {
        Self {
            req,
            args: args.iter().map(|a| a.as_ref().to_string()).collect(),
        }
    }
}

impl Message for Exec {
    const ID: Id = Id::Exec;

    fn req(&self) -> Req {
        self.req
    }

    fn write_body<W: Write>(&self, w: &mut W) -> Result<(), ProtoError> {
        if self.args.iter().any(|a| a.contains('\0')) {
            return Err(ProtoError::IllFormed("exec argument contains NUL".into()));
        }
        w.write_all(self.req.as_bytes())?;
        w.write_all(self.args.join("\0").as_bytes())?;
        Ok(())
    }

    fn read_body<R: Read>(r: &mut R) -> Result<Self, ProtoError> {
        let req = Req::from(read_array(r)?);
        let rest = String::from_utf8(read_rest(r)?)
            .map_err(|_| ProtoError::IllFormed("exec arguments are not utf-8".into()))?;
        let args = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split('\0').map(str::to_string).collect()
        };
        Ok(Self { req, args })
    }
}

/// Prove ownership of `user` by signing the dialer's ephemeral session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub req: Req,
    pub user: PublicKey,
    pub sig: Signature,
}

impl Message for Login {
    const ID: Id = Id::Login;

    fn req(&self) -> Req {
        self.req
    }

    fn write_body<W: Write>(&self, w: &mut W) -> Result<(), ProtoError> {
        w.write_all(self.req.as_bytes())?;
        w.write_all(self.user.as_bytes())?;
        w.write_all(&self.sig.to_bytes())?;
        Ok(())
    }

    fn read_body<R: Read>(r: &mut R) -> Result<Self, ProtoError> {
        let req = Req::from(read_array(r)?);
        let user = PublicKey::from(read_array(r)?);
        let sig = Signature::from_bytes(&read_array::<_, SIGNATURE_SIZE>(r)?);
        Ok(Self { req, user, sig })
    }
}

macro_rules! bare_request {
    ($(#[$doc:meta])* $name:ident, $id:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub req: Req,
        }

        impl Message for $name {
            const ID: Id = $id;

            fn req(&self) -> Req {
                self.req
            }

            fn write_body<W: Write>(&self, w: &mut W) -> Result<(), ProtoError> {
                w.write_all(self.req.as_bytes())?;
                Ok(())
            }

            fn read_body<R: Read>(r: &mut R) -> Result<Self, ProtoError> {
                Ok(Self {
                    req: Req::from(read_array(r)?),
                })
            }
        }
    };
}

bare_request!(
    /// Suspend the session so the box can be rotated.
    Pause,
    Id::Pause
);
bare_request!(
    /// Close the session once this request is acknowledged.
    Quit,
    Id::Quit
);

/// Leave `suspended` and reseed the box nonces from `nonce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resume {
    pub req: Req,
    pub nonce: Nonce,
}

impl Message for Resume {
    const ID: Id = Id::Resume;

    fn req(&self) -> Req {
        self.req
    }

    fn write_body<W: Write>(&self, w: &mut W) -> Result<(), ProtoError> {
        w.write_all(self.req.as_bytes())?;
        w.write_all(self.nonce.as_bytes())?;
        Ok(())
    }

    fn read_body<R: Read>(r: &mut R) -> Result<Self, ProtoError> {
        let req = Req::from(read_array(r)?);
        let nonce = Nonce::from(read_array::<_, NONCE_SIZE>(r)?);
        Ok(Self { req, nonce })
    }
}

/// Tell the peer to reconnect to `target` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub req: Req,
    pub target: String,
}

impl Message for Redirect {
    const ID: Id = Id::Redirect;

    fn req(&self) -> Req {
        self.req
    }

    fn write_body<W: Write>(&self, w: &mut W) -> Result<(), ProtoError> {
        w.write_all(self.req.as_bytes())?;
        w.write_all(self.target.as_bytes())?;
        Ok(())
    }

    fn read_body<R: Read>(r: &mut R) -> Result<Self, ProtoError> {
        let req = Req::from(read_array(r)?);
        let target = String::from_utf8(read_rest(r)?)
            .map_err(|_| ProtoError::IllFormed("redirect target is not utf-8".into()))?;
        Ok(Self { req, target })
    }
}

/// List of sums a peer is about to send, ahead of a clone stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub req: Req,
    pub sums: Vec<Sum>,
}

impl Message for Index {
    const ID: Id = Id::Index;

    fn req(&self) -> Req {
        self.req
    }

    fn write_body<W: Write>(&self, w: &mut W) -> Result<(), ProtoError> {
        w.write_all(self.req.as_bytes())?;
        for sum in &self.sums {
            w.write_all(sum.as_bytes())?;
        }
        Ok(())
    }

    fn read_body<R: Read>(r: &mut R) -> Result<Self, ProtoError> {
        let req = Req::from(read_array(r)?);
        let rest = read_rest(r)?;
        if rest.len() % SUM_SIZE != 0 {
            return Err(ProtoError::Short);
        }
        let sums = rest
            .chunks_exact(SUM_SIZE)
            .map(|chunk| {
                let mut buff = [0u8; SUM_SIZE];
                buff.copy_from_slice(chunk);
                Sum::from(buff)
            })
            .collect();
        Ok(Self { req, sums })
    }
}
