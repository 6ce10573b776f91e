//! Dialing side of a session: connect with backoff, log in, run commands.
//!
//! Blob PDUs the service pushes (fetch, clone, deliveries) are Ack'd as they
//! arrive and, if a mirror repository is configured, stored there.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::blob::Blob;
use common::pdu::Pdu;
use common::prelude::{
    PduPool, PublicKey, Repos, SecretKey, SeqLen, Session, SessionReceiver, Sum,
};
use common::repos::SUM_SIZE;
use common::proto::{Id, Index, Message, Pause, Quit, Redirect, Resume};
use common::session::handshake::{self, Dialed};
use common::session::{Received, SessionConfig, SessionError, DEFAULT_IO_TIMEOUT};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// First retry delay after a failed connect
pub const BACKOFF_START: Duration = Duration::from_millis(100);
/// Retry delays stop growing here
pub const BACKOFF_CAP: Duration = Duration::from_secs(3);
pub const DEFAULT_ATTEMPTS: u32 = 8;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("could not reach {addr} after {attempts} attempts: {source}")]
    Unreachable {
        addr: String,
        attempts: u32,
        source: std::io::Error,
    },
    #[error("redirected to {0}")]
    Redirected(String),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("pdu error: {0}")]
    Pdu(#[from] common::pdu::PduError),
    #[error("blob error: {0}")]
    Blob(#[from] common::blob::BlobError),
    #[error("unexpected reply: {0}")]
    BadReply(String),
}

/// Exponential retry delays: doubling from [`BACKOFF_START`] up to
/// [`BACKOFF_CAP`], for a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
    remaining: u32,
}

impl Backoff {
    pub fn new(attempts: u32) -> Self {
        Self {
            next: BACKOFF_START,
            cap: BACKOFF_CAP,
            remaining: attempts,
        }
    }

    /// Delay before the next retry, or `None` once attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.next;
        self.next = (self.next * 2).min(self.cap);
        Some(delay)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Service key the box is agreed with
    pub service: PublicKey,
    /// Identity to log in as
    pub user: SecretKey,
    pub seq_len: SeqLen,
    pub io_timeout: Duration,
    pub attempts: u32,
    pub pool: PduPool,
    /// Store pushed blobs here
    pub mirror: Option<Arc<Repos>>,
}

impl ClientConfig {
    pub fn new(service: PublicKey, user: SecretKey) -> Self {
        Self {
            service,
            user,
            seq_len: SeqLen::default(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
            pool: PduPool::default(),
            mirror: None,
        }
    }
}

#[derive(Debug)]
pub struct Client {
    session: Session,
    received: Arc<AtomicUsize>,
}

impl Client {
    /// Dial `addr`, retrying with [`Backoff`], then log in.
    pub async fn connect(addr: &str, config: ClientConfig) -> Result<Self, ClientError> {
        let mut backoff = Backoff::new(config.attempts);
        let mut attempts = 0;
        let stream = loop {
            attempts += 1;
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::debug!(addr, attempts, ?delay, error = %e, "connect failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(ClientError::Unreachable {
                            addr: addr.to_string(),
                            attempts,
                            source: e,
                        })
                    }
                },
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(addr, error = %e, "failed to set nodelay");
        }
        Self::start(stream, addr, config).await
    }

    /// Handshake and log in over an already connected stream.
    pub async fn start<S>(mut stream: S, name: &str, config: ClientConfig) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Dialed { cbox, ephemeral } =
            handshake::dial(&mut stream, &config.service, config.seq_len, config.io_timeout)
                .await?;
        let mut session_config = SessionConfig::new(name, config.pool.clone());
        session_config.io_timeout = config.io_timeout;
        let (session, rx) = Session::start(stream, cbox, session_config);

        let received = Arc::new(AtomicUsize::new(0));
        tokio::spawn(pump(
            session.clone(),
            rx,
            config.mirror.clone(),
            received.clone(),
        ));

        session.login(&config.user, &ephemeral.public()).await?;
        Ok(Self { session, received })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Blob PDUs received so far.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::Relaxed)
    }

    /// Run one command and return the Ack payload.
    pub async fn exec<S: AsRef<str>>(&self, args: &[S]) -> Result<Vec<u8>, ClientError> {
        match self.session.exec(args).await {
            Ok(mut reply) => Ok(reply.read_remaining()?),
            Err(SessionError::Closed) => match self.session.redirect_target() {
                Some(target) => Err(ClientError::Redirected(target)),
                None => Err(SessionError::Closed.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Send `content` as a Blob PDU and return the sum the service stored
    /// it under.
    pub async fn put<R: std::io::Read>(&self, blob: &Blob, content: &mut R) -> Result<Sum, ClientError> {
        let pdu = blob.to_pdu(self.session.version(), content, self.session.pool())?;
        let mut reply = self.session.request_pdu(blob.req(), pdu).await?;
        let bytes = reply.read_remaining()?;
        let sum: [u8; SUM_SIZE] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| ClientError::BadReply(format!("{} byte sum", b.len())))?;
        Ok(Sum::from(sum))
    }

    /// Pause and resume, rotating the session box.
    pub async fn rekey(&self) -> Result<(), ClientError> {
        self.session.pause().await?;
        self.session.resume().await?;
        Ok(())
    }

    pub async fn quit(self) -> Result<(), ClientError> {
        self.session.quit().await?;
        Ok(())
    }
}

/// Answer what the service sends on its own initiative.
async fn pump(
    session: Session,
    mut rx: SessionReceiver,
    mirror: Option<Arc<Repos>>,
    received: Arc<AtomicUsize>,
) {
    while let Some(Received { header, mut pdu }) = rx.recv().await {
        let handled = match header.id {
            Id::Blob => {
                // counted before the Ack so the request that caused it sees it
                received.fetch_add(1, Ordering::Relaxed);
                accept_blob(&session, pdu, mirror.clone()).await
            }
            Id::Index => match Index::read_body(&mut pdu) {
                Ok(index) => {
                    tracing::info!(session = %session.name(), sums = index.sums.len(), "incoming index");
                    session.ack(index.req, &[]).await
                }
                Err(e) => Err(e.into()),
            },
            Id::Redirect => match Redirect::read_body(&mut pdu) {
                Ok(redirect) => session.handle_redirect(&redirect).await,
                Err(e) => Err(e.into()),
            },
            Id::Quit => match Quit::read_body(&mut pdu) {
                Ok(quit) => session.handle_quit(&quit).await,
                Err(e) => Err(e.into()),
            },
            Id::Pause => match Pause::read_body(&mut pdu) {
                Ok(pause) => session.handle_pause(&pause).await,
                Err(e) => Err(e.into()),
            },
            Id::Resume => match Resume::read_body(&mut pdu) {
                Ok(resume) => session.handle_resume(&resume).await,
                Err(e) => Err(e.into()),
            },
            other => {
                tracing::debug!(session = %session.name(), id = %other, "ignoring pdu");
                Ok(())
            }
        };
        if let Err(e) = handled {
            tracing::warn!(session = %session.name(), id = %header.id, error = %e, "failed to answer pdu");
        }
    }
}

async fn accept_blob(
    session: &Session,
    mut pdu: Pdu,
    mirror: Option<Arc<Repos>>,
) -> Result<(), SessionError> {
    let blob = match Blob::read_from(&mut pdu) {
        Ok(blob) => blob,
        Err(e) => {
            tracing::warn!(session = %session.name(), error = %e, "unreadable blob");
            return Ok(());
        }
    };
    tracing::info!(
        session = %session.name(),
        name = %blob.name,
        author = %blob.author.short(),
        len = pdu.remaining(),
        "blob received"
    );
    let req = blob.req();
    let Some(repos) = mirror else {
        return session.ack(req, &[]).await;
    };
    let stored = tokio::task::spawn_blocking(move || repos.store(&blob, &mut pdu)).await;
    match stored {
        Ok(Ok(stored)) => session.ack(req, stored.sum.as_bytes()).await,
        Ok(Err(e)) => session.nack(req, e.code(), e.to_string()).await,
        Err(e) => {
            session
                .nack(req, common::prelude::ErrCode::Failure, e.to_string())
                .await
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(8);
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        let millis: Vec<_> = delays.iter().map(|d| d.as_millis()).collect();
        assert_eq!(millis, vec![100, 200, 400, 800, 1600, 3000, 3000, 3000]);
    }

    #[test]
    fn test_backoff_without_attempts() {
        assert_eq!(Backoff::new(0).next_delay(), None);
    }

    #[tokio::test]
    async fn test_connect_gives_up() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut config = ClientConfig::new(SecretKey::generate().public(), SecretKey::generate());
        config.attempts = 1;
        match Client::connect(&addr, config).await {
            Err(ClientError::Unreachable { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected unreachable, got {:?}", other.map(|_| ())),
        }
    }
}
