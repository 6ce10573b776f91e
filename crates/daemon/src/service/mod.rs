//! The ASN service.
//!
//! Accepts connections, runs the cleartext handshake, and serves one
//! [`Session`] per connection against a shared [`Repos`]. Blobs stored
//! through one session are pushed to every established session of the
//! users the repository says must receive them.

mod connection;
mod exec;
mod registry;
mod trace;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::blob::BlobError;
use common::crypto::KeyError;
use common::pdu::PduError;
use common::prelude::{ErrCode, Id, PduPool, PublicKey, Repos, ReposError, SecretKey, Session};
use common::proto::ProtoError;
use common::repos::Delivery;
use common::session::handshake::{self, Accepted};
use common::session::{SessionConfig, SessionError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};

use crate::ServiceConfig;

pub use registry::Registry;
pub use trace::{Direction, TraceEvent, TraceRing};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error(transparent)]
    Repos(#[from] ReposError),
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
    #[error("blob error: {0}")]
    Blob(#[from] BlobError),
    #[error("pdu error: {0}")]
    Pdu(#[from] PduError),
    #[error("bad key: {0}")]
    Key(#[from] KeyError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("usage: {0}")]
    Usage(String),
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("permission denied: {0}")]
    Denied(String),
    #[error(transparent)]
    Default(#[from] anyhow::Error),
}

impl ServiceError {
    /// Code a failed request is Nack'd with.
    pub fn code(&self) -> ErrCode {
        match self {
            ServiceError::Repos(e) => e.code(),
            ServiceError::Proto(e) => e.code(),
            ServiceError::Blob(_) | ServiceError::Key(_) | ServiceError::Usage(_) => {
                ErrCode::IllFormed
            }
            ServiceError::Unknown(_) => ErrCode::Unknown,
            ServiceError::Denied(_) => ErrCode::Denied,
            ServiceError::Session(SessionError::Nack(failure)) => failure.code,
            _ => ErrCode::Failure,
        }
    }
}

struct ServiceInner {
    secret: SecretKey,
    repos: Repos,
    pool: PduPool,
    io_timeout: Duration,
    redirect: Option<String>,
    registry: Registry,
    trace: TraceRing,
    slots: Arc<Semaphore>,
    connections: AtomicU64,
}

#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("public", &self.public())
            .field("sessions", &self.inner.registry.len())
            .finish()
    }
}

impl Service {
    /// Open the repository and set up shared state. Nothing listens yet.
    pub fn new(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let repos = Repos::open(&config.repos_dir, config.secret.public(), config.admin)?;
        Ok(Self {
            inner: Arc::new(ServiceInner {
                secret: config.secret.clone(),
                repos,
                pool: config.pool(),
                io_timeout: config.io_timeout,
                redirect: config.redirect.clone(),
                registry: Registry::new(),
                trace: TraceRing::new(config.trace_capacity),
                slots: Arc::new(Semaphore::new(config.max_sessions)),
                connections: AtomicU64::new(0),
            }),
        })
    }

    pub fn public(&self) -> PublicKey {
        self.inner.secret.public()
    }

    pub fn repos(&self) -> &Repos {
        &self.inner.repos
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn trace(&self) -> &TraceRing {
        &self.inner.trace
    }

    pub fn pool(&self) -> &PduPool {
        &self.inner.pool
    }

    /// Accept connections until `shutdown` fires, then close every live
    /// session.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<(), ServiceError> {
        tracing::info!(addr = ?listener.local_addr().ok(), key = %self.public(), "accepting sessions");
        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            let permit = match self.inner.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(%addr, "session limit reached, dropping connection");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%addr, error = %e, "failed to set nodelay");
            }
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.accept(stream, addr.to_string()).await {
                    tracing::info!(%addr, error = %e, "connection failed");
                }
                drop(permit);
            });
        }

        let live = self.registry().all();
        tracing::info!(sessions = live.len(), "shutting down");
        let quits = live.iter().map(|session| async move {
            if let Err(e) = session.quit().await {
                tracing::debug!(session = %session.name(), error = %e, "quit not acknowledged");
            }
        });
        futures::future::join_all(quits).await;
        Ok(())
    }

    /// Run the handshake on `stream` and serve the resulting session until
    /// it closes.
    pub async fn accept<S>(&self, mut stream: S, peer: String) -> Result<(), ServiceError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let n = self.inner.connections.fetch_add(1, Ordering::Relaxed);
        let Accepted { cbox, ephemeral } =
            handshake::accept(&mut stream, &self.inner.secret, self.inner.io_timeout).await?;

        let mut config = SessionConfig::new(format!("{}#{}", peer, n), self.pool().clone());
        config.io_timeout = self.inner.io_timeout;
        let (session, rx) = Session::start(stream, cbox, config);
        connection::serve(self.clone(), session, rx, ephemeral).await;
        Ok(())
    }

    /// Where an established session of `user` should go instead, if
    /// anywhere.
    pub(crate) fn redirect_for(&self, user: &PublicKey) -> Option<String> {
        match &self.inner.redirect {
            Some(target) if !self.repos().is_privileged(user) => Some(target.clone()),
            _ => None,
        }
    }

    /// Run a repository operation on the blocking pool.
    pub(crate) async fn blocking<F, T>(&self, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&Repos) -> Result<T, ServiceError> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.clone();
        tokio::task::spawn_blocking(move || f(service.repos())).await?
    }

    /// Push each delivery to every established session of its recipient.
    /// Recipients without a live session pick the blob up later.
    pub(crate) fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            for session in self.registry().sessions_for(&delivery.to) {
                let service = self.clone();
                let path = delivery.path.clone();
                let sum = delivery.sum;
                tokio::spawn(async move {
                    if let Err(e) = service.push_object(&session, path).await {
                        tracing::warn!(
                            session = %session.name(),
                            %sum,
                            error = %e,
                            "delivery failed"
                        );
                    }
                });
            }
        }
    }

    /// Send the object at `path` to `session`'s peer as a Blob PDU and wait
    /// for the peer to Ack it.
    pub(crate) async fn push_object(
        &self,
        session: &Session,
        path: PathBuf,
    ) -> Result<(), ServiceError> {
        let version = session.version();
        let pool = session.pool().clone();
        let (blob, pdu) = self
            .blocking(move |repos| {
                let (blob, mut file) = repos.cat(&path)?;
                let pdu = blob.to_pdu(version, &mut file, &pool)?;
                Ok((blob, pdu))
            })
            .await?;
        self.trace()
            .record(session.name(), Direction::Out, Id::Blob, pdu.len());
        session.request_pdu(blob.req(), pdu).await?;
        Ok(())
    }
}
