//! Commands a logged in peer can run with an Exec PDU.
//!
//! Every command answers with exactly one Ack: a short text line, a spooled
//! listing or file, or a Nack carrying a single-line reason.

use std::io;

use chrono::{DateTime, Utc};
use common::blob::{self, Blob};
use common::crypto::Signature;
use common::pdu::Pdu;
use common::prelude::{PublicKey, Req, ReposError, Session, Sum};
use common::proto::{Exec, Index};

use super::{Service, ServiceError};

/// What a successful command sends back.
enum Reply {
    Text(String),
    /// A prepared large Ack.
    Pdu(Pdu),
}

pub(crate) async fn run(service: Service, session: Session, acting: PublicKey, exec: Exec) {
    let req = exec.req;
    let ctx = Ctx {
        service,
        session,
        acting,
        req,
    };
    let result = ctx.dispatch(&exec.args).await;
    let session = &ctx.session;
    let sent = match result {
        Ok(Reply::Text(text)) => session.ack(req, text.as_bytes()).await,
        Ok(Reply::Pdu(pdu)) => {
            session.tx(pdu).await;
            Ok(())
        }
        Err(e) => {
            tracing::info!(
                session = %session.name(),
                command = exec.args.first().map(String::as_str).unwrap_or(""),
                error = %e,
                "command failed"
            );
            session.nack(req, e.code(), e.to_string()).await
        }
    };
    if let Err(e) = sent {
        tracing::debug!(session = %session.name(), %req, error = %e, "command reply not sent");
    }
}

struct Ctx {
    service: Service,
    session: Session,
    acting: PublicKey,
    req: Req,
}

fn usage(text: &str) -> ServiceError {
    ServiceError::Usage(text.to_string())
}

/// Exactly one argument.
fn one<'a>(args: &'a [String], text: &str) -> Result<&'a str, ServiceError> {
    match args {
        [arg] => Ok(arg.as_str()),
        _ => Err(usage(text)),
    }
}

/// Optional nanoseconds since the unix epoch; absent means all of time.
fn parse_epoch(arg: Option<&String>) -> Result<DateTime<Utc>, ServiceError> {
    match arg {
        None => Ok(DateTime::<Utc>::UNIX_EPOCH),
        Some(arg) => arg
            .parse::<i64>()
            .map(DateTime::from_timestamp_nanos)
            .map_err(|_| usage("epoch must be nanoseconds since 1970")),
    }
}

impl Ctx {
    async fn dispatch(&self, args: &[String]) -> Result<Reply, ServiceError> {
        let (cmd, rest) = args
            .split_first()
            .ok_or_else(|| usage("empty command"))?;
        tracing::debug!(session = %self.session.name(), command = %cmd, args = rest.len(), "exec");
        match cmd.as_str() {
            "echo" => Ok(Reply::Text(format!("{}\n", rest.join(" ")))),
            "blob" => self.blob(rest).await,
            "cat" => self.cat(rest).await,
            "ls" => self.ls(rest).await,
            "fetch" => self.fetch(rest).await,
            "clone" => self.clone_since(rest).await,
            "rm" => self.rm(rest).await,
            "gc" => self.gc(rest).await,
            "mark" => self.mark(rest).await,
            "auth" => self.auth(rest).await,
            "vouch" => self.vouch(rest).await,
            "newuser" => self.newuser(rest).await,
            "who" => Ok(self.who()),
            "trace" => self.trace(rest),
            other => Err(ServiceError::Unknown(other.to_string())),
        }
    }

    fn require_privileged(&self, what: &str) -> Result<(), ServiceError> {
        if self.service.repos().is_privileged(&self.acting) {
            Ok(())
        } else {
            Err(ServiceError::Denied(format!("{} needs the admin key", what)))
        }
    }

    /// Write `content` as `name` for `owner`, authored by the acting user,
    /// and push it wherever the repository says.
    async fn put(&self, owner: PublicKey, name: &str, content: Vec<u8>) -> Result<Sum, ServiceError> {
        let blob = Blob::new(owner, self.acting, name)?;
        let acting = self.acting;
        let ingested = self
            .service
            .blocking(move |repos| Ok(repos.ingest(&blob, &mut content.as_slice(), &acting)?))
            .await?;
        self.service.deliver(ingested.deliveries);
        Ok(ingested.sum)
    }

    /// `blob <[~owner/]name> [- data...]`
    async fn blob(&self, args: &[String]) -> Result<Reply, ServiceError> {
        const USAGE: &str = "blob <[~owner/]name> [- data...]";
        let (target, rest) = args.split_first().ok_or_else(|| usage(USAGE))?;
        let content = match rest.split_first() {
            None => String::new(),
            Some((dash, data)) if dash == "-" => data.join(" "),
            Some(_) => return Err(usage(USAGE)),
        };
        let (owner, name) = match target.strip_prefix('~') {
            Some(rest) => {
                let (key, name) = rest.split_once('/').unwrap_or((rest, ""));
                (PublicKey::from_hex(key)?, name)
            }
            None => (self.acting, target.as_str()),
        };
        let sum = self.put(owner, name, content.into_bytes()).await?;
        Ok(Reply::Text(format!("{}\n", sum)))
    }

    /// `cat <path>`: content of an object or link, without its header.
    async fn cat(&self, args: &[String]) -> Result<Reply, ServiceError> {
        let path = self
            .service
            .repos()
            .resolve(&self.acting, one(args, "cat <path>")?)?;
        let mut pdu = self.session.large_ack(self.req)?;
        let pdu = self
            .service
            .blocking(move |repos| {
                let (_, mut file) = repos.cat(&path)?;
                io::copy(&mut file, &mut pdu)?;
                Ok(pdu)
            })
            .await?;
        Ok(Reply::Pdu(pdu))
    }

    /// `ls [path]`: one entry per line, directories end in `/`.
    async fn ls(&self, args: &[String]) -> Result<Reply, ServiceError> {
        let arg = match args {
            [] => "",
            [arg] => arg.as_str(),
            _ => return Err(usage("ls [path]")),
        };
        let path = self.service.repos().resolve(&self.acting, arg)?;
        let mut pdu = self.session.large_ack(self.req)?;
        let pdu = self
            .service
            .blocking(move |repos| {
                for name in repos.ls(&path)? {
                    pdu.append(name.as_bytes())?;
                    pdu.append(b"\n")?;
                }
                Ok(pdu)
            })
            .await?;
        Ok(Reply::Pdu(pdu))
    }

    /// `fetch <sum|path>`: push one object to the caller as a Blob PDU.
    async fn fetch(&self, args: &[String]) -> Result<Reply, ServiceError> {
        let repos = self.service.repos();
        let path = repos.resolve(&self.acting, one(args, "fetch <sum|path>")?)?;
        let shown = repos.display(&path);
        self.service.push_object(&self.session, path).await?;
        Ok(Reply::Text(format!("{}\n", shown)))
    }

    /// `clone [since]`: an Index of every object newer than `since`, then
    /// each object as a Blob PDU.
    async fn clone_since(&self, args: &[String]) -> Result<Reply, ServiceError> {
        self.require_privileged("clone")?;
        if args.len() > 1 {
            return Err(usage("clone [since]"));
        }
        let epoch = parse_epoch(args.first())?;
        let objects = self
            .service
            .blocking(move |repos| {
                let mut objects = Vec::new();
                repos.filter(epoch, |sum, path, _| {
                    objects.push((*sum, path.to_path_buf()));
                    Ok(())
                })?;
                Ok(objects)
            })
            .await?;

        let index = Index {
            req: self.session.next_req(),
            sums: objects.iter().map(|(sum, _)| *sum).collect(),
        };
        self.session.request(&index).await?;
        for (_, path) in &objects {
            self.service
                .push_object(&self.session, path.clone())
                .await?;
        }
        tracing::info!(session = %self.session.name(), objects = objects.len(), %epoch, "cloned");
        Ok(Reply::Text(format!("{}\n", objects.len())))
    }

    /// `rm <path>`: drop a named link in the caller's tree.
    async fn rm(&self, args: &[String]) -> Result<Reply, ServiceError> {
        let repos = self.service.repos();
        let path = repos.resolve(&self.acting, one(args, "rm <path>")?)?;
        let shown = repos.display(&path);
        let acting = self.acting;
        self.service
            .blocking(move |repos| Ok(repos.rm(&acting, &path)?))
            .await?;
        Ok(Reply::Text(format!("{}\n", shown)))
    }

    /// `gc [since]`
    async fn gc(&self, args: &[String]) -> Result<Reply, ServiceError> {
        self.require_privileged("gc")?;
        if args.len() > 1 {
            return Err(usage("gc [since]"));
        }
        let epoch = parse_epoch(args.first())?;
        let report = self
            .service
            .blocking(move |repos| Ok(repos.gc(epoch)?))
            .await?;
        Ok(Reply::Text(format!(
            "unlinked {} removed {}\n",
            report.unlinked, report.removed
        )))
    }

    /// `mark <location...>`: publish where the caller can be reached.
    async fn mark(&self, args: &[String]) -> Result<Reply, ServiceError> {
        if args.is_empty() {
            return Err(usage("mark <location>"));
        }
        let sum = self
            .put(self.acting, blob::MARK, args.join(" ").into_bytes())
            .await?;
        Ok(Reply::Text(format!("{}\n", sum)))
    }

    /// `auth <key>`: let another key log in as the caller.
    async fn auth(&self, args: &[String]) -> Result<Reply, ServiceError> {
        let key = PublicKey::from_hex(one(args, "auth <key>")?)?;
        let sum = self
            .put(self.acting, blob::AUTH, key.to_hex().into_bytes())
            .await?;
        Ok(Reply::Text(format!("{}\n", sum)))
    }

    /// `vouch <sum> <signature>`: record the caller's signature over a sum.
    async fn vouch(&self, args: &[String]) -> Result<Reply, ServiceError> {
        let [sum, sig] = args else {
            return Err(usage("vouch <sum> <signature>"));
        };
        let sum = Sum::from_hex(sum)?;
        let bytes = hex::decode(sig).map_err(|_| usage("signature must be hex"))?;
        let sig = Signature::from_slice(&bytes).map_err(|_| usage("signature must be 64 bytes"))?;
        if self.acting.verify(sum.as_bytes(), &sig).is_err() {
            return Err(ServiceError::Denied(format!(
                "signature does not match {}",
                self.acting.short()
            )));
        }
        let record = format!("{} {}\n", sum, hex::encode(sig.to_bytes()));
        let stored = self
            .put(self.acting, blob::VOUCHERS, record.into_bytes())
            .await?;
        Ok(Reply::Text(format!("{}\n", stored)))
    }

    /// `newuser <key>`: admin, or a user who invited `key`.
    async fn newuser(&self, args: &[String]) -> Result<Reply, ServiceError> {
        let key = PublicKey::from_hex(one(args, "newuser <key>")?)?;
        let repos = self.service.repos();
        if !repos.is_privileged(&self.acting) && !repos.user(&self.acting).is_invited(&key) {
            return Err(ReposError::Permission(format!("{} is not invited", key.short())).into());
        }
        let created = self
            .service
            .blocking(move |repos| Ok(repos.new_user(&key)?))
            .await?;
        let what = if created { "created" } else { "exists" };
        Ok(Reply::Text(format!("{} {}\n", what, key)))
    }

    /// `who`: every live session, one per line.
    fn who(&self) -> Reply {
        let mut out = String::new();
        for (user, name, state) in self.service.registry().who() {
            out.push_str(&format!("{} {} {}\n", user, name, state));
        }
        Reply::Text(out)
    }

    /// `trace [flush]`
    fn trace(&self, args: &[String]) -> Result<Reply, ServiceError> {
        self.require_privileged("trace")?;
        let ring = self.service.trace();
        match args {
            [] => {
                let mut pdu = self.session.large_ack(self.req)?;
                pdu.append(ring.dump().as_bytes())?;
                Ok(Reply::Pdu(pdu))
            }
            [flush] if flush == "flush" => Ok(Reply::Text(format!("flushed {}\n", ring.flush()))),
            _ => Err(usage("trace [flush]")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_epoch() {
        assert_eq!(parse_epoch(None).unwrap(), DateTime::<Utc>::UNIX_EPOCH);
        let t = parse_epoch(Some(&"1500000000000000000".to_string())).unwrap();
        assert_eq!(t.timestamp(), 1_500_000_000);
        assert!(matches!(
            parse_epoch(Some(&"yesterday".to_string())),
            Err(ServiceError::Usage(_))
        ));
    }

    #[test]
    fn test_one_argument() {
        let args = vec!["a".to_string()];
        assert_eq!(one(&args, "x").unwrap(), "a");
        assert!(one(&[], "x").is_err());
        assert!(one(&["a".to_string(), "b".to_string()], "x").is_err());
    }
}
