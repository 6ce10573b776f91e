//! One encrypted ASN connection.
//!
//! A [`Session`] owns the socket halves through two tasks. The receiver
//! reassembles PDUs, routes Acks to the [`Acker`] and hands everything else
//! to the [`SessionReceiver`]. The sender drains a bounded queue of
//! `(pdu, box)` pairs onto the socket. Dropping the queue's sender is how the
//! sender is told to stop; the receiver stops when the connection closes.
//!
//! The box travels with each queued PDU so a box swapped in by Resume never
//! applies to PDUs queued before the swap.

mod framing;
pub mod handshake;
mod state;

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

use crate::acker::{Acker, AckerError};
use crate::crypto::{BoxError, CryptoBox, Nonce, PublicKey, SecretKey};
use crate::pdu::{Pdu, PduError, PduPool};
use crate::proto::{
    Ack, AckFailure, ErrCode, Exec, Header, Id, Login, Message, Pause, ProtoError, Quit, Redirect,
    Req, Requester, Resume, LATEST_VERSION, REQ_SIZE,
};

pub use framing::{Deadline, FrameError, MAX_PLAIN_SZ, MAX_SEG_SZ, MORE_FLAG};
pub use state::State;

/// Default socket deadline; an idle expiry is retried
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);
/// Default wait for the Ack of a request
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(60);
/// Default depth of the inbound and outbound queues
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("timed out")]
    Timeout,
    #[error("invalid session transition {from} -> {to}")]
    Transition { from: State, to: State },
    #[error("login rejected: {0}")]
    Login(String),
    #[error("request failed: {0}")]
    Nack(#[from] AckFailure),
    #[error("session i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
    #[error("box error: {0}")]
    Box(#[from] BoxError),
    #[error("pdu error: {0}")]
    Pdu(#[from] PduError),
    #[error("acker error: {0}")]
    Acker(#[from] AckerError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shows up in every log line of the session.
    pub name: String,
    pub pool: PduPool,
    pub io_timeout: Duration,
    pub ack_timeout: Duration,
    pub queue_depth: usize,
}

impl SessionConfig {
    pub fn new(name: impl Into<String>, pool: PduPool) -> Self {
        Self {
            name: name.into(),
            pool,
            io_timeout: DEFAULT_IO_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// A reassembled non-Ack PDU, positioned just past its header.
#[derive(Debug)]
pub struct Received {
    pub header: Header,
    pub pdu: Pdu,
}

struct Outbound {
    pdu: Pdu,
    cbox: Arc<Mutex<CryptoBox>>,
}

struct SessionInner {
    config: SessionConfig,
    version: AtomicU8,
    state: watch::Sender<State>,
    cbox: RwLock<Arc<Mutex<CryptoBox>>>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    acker: Acker,
    requester: Requester,
    remote_user: Mutex<Option<PublicKey>>,
    redirect: Mutex<Option<String>>,
}

impl SessionInner {
    fn current_box(&self) -> Arc<Mutex<CryptoBox>> {
        self.cbox.read().clone()
    }

    /// Install a box with the same shared key and nonces reseeded from
    /// `nonce`. Returns the box it replaced.
    fn rotate(&self, nonce: &Nonce) -> Arc<Mutex<CryptoBox>> {
        let next = self.current_box().lock().rekeyed(nonce);
        std::mem::replace(&mut *self.cbox.write(), Arc::new(Mutex::new(next)))
    }
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("version", &self.version())
            .field("remote_user", &self.remote_user())
            .finish()
    }
}

/// Inbound half of a session. `recv` yields `None` once the connection is
/// gone.
#[derive(Debug)]
pub struct SessionReceiver {
    rx: mpsc::Receiver<Received>,
}

impl SessionReceiver {
    pub async fn recv(&mut self) -> Option<Received> {
        self.rx.recv().await
    }
}

impl Session {
    /// Take over `stream`, already carrying an agreed box, and spawn the
    /// receiver and sender tasks. The session starts provisional.
    pub fn start<S>(stream: S, cbox: CryptoBox, config: SessionConfig) -> (Session, SessionReceiver)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel(config.queue_depth);
        let (in_tx, in_rx) = mpsc::channel(config.queue_depth);
        let (state, _) = watch::channel(State::Opened);

        let session = Session {
            inner: Arc::new(SessionInner {
                config,
                version: AtomicU8::new(LATEST_VERSION),
                state,
                cbox: RwLock::new(Arc::new(Mutex::new(cbox))),
                outbound: Mutex::new(Some(out_tx)),
                acker: Acker::new(),
                requester: Requester::new(),
                remote_user: Mutex::new(None),
                redirect: Mutex::new(None),
            }),
        };
        if let Err(e) = session.transition(State::Provisional) {
            tracing::error!(session = %session.name(), error = %e, "fresh session refused box");
        }

        tokio::spawn(recv_loop(session.clone(), reader, in_tx));
        tokio::spawn(send_loop(session.clone(), writer, out_rx));
        tracing::debug!(session = %session.name(), "session started");

        (session, SessionReceiver { rx: in_rx })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn pool(&self) -> &PduPool {
        &self.inner.config.pool
    }

    pub fn version(&self) -> u8 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Drop to `version` if it is lower than the current one. Never raises.
    pub fn downgrade_version(&self, version: u8) {
        let prev = self.inner.version.fetch_min(version, Ordering::AcqRel);
        if version < prev {
            tracing::info!(session = %self.name(), from = prev, to = version, "downgraded protocol version");
        }
    }

    pub fn state(&self) -> State {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    /// Move to `to`. Repeating the current state is a no-op.
    pub fn transition(&self, to: State) -> Result<(), SessionError> {
        let mut result = Ok(());
        self.inner.state.send_if_modified(|state| {
            if *state == to {
                false
            } else if state.can_transition(to) {
                tracing::debug!(session = %self.inner.config.name, from = %state, %to, "session state");
                *state = to;
                true
            } else {
                result = Err(SessionError::Transition { from: *state, to });
                false
            }
        });
        result
    }

    /// Wait until the session reaches `want`, or closes.
    pub async fn wait_state(&self, want: State) -> State {
        let mut rx = self.inner.state.subscribe();
        let result = match rx.wait_for(|s| *s == want || *s == State::Closed).await {
            Ok(state) => *state,
            Err(_) => State::Closed,
        };
        result
    }

    pub async fn wait_closed(&self) {
        self.wait_state(State::Closed).await;
    }

    /// User proven by Login, on the accepting side.
    pub fn remote_user(&self) -> Option<PublicKey> {
        *self.inner.remote_user.lock()
    }

    /// Target from a Redirect the peer sent us, if any.
    pub fn redirect_target(&self) -> Option<String> {
        self.inner.redirect.lock().clone()
    }

    pub fn next_req(&self) -> Req {
        self.inner.requester.next()
    }

    pub fn pending_acks(&self) -> usize {
        self.inner.acker.pending()
    }

    /// Queue `pdu` under the current box. A no-op once the session closed.
    pub async fn tx(&self, pdu: Pdu) {
        let cbox = self.inner.current_box();
        self.tx_with(pdu, cbox).await
    }

    async fn tx_with(&self, pdu: Pdu, cbox: Arc<Mutex<CryptoBox>>) {
        let sender = self.inner.outbound.lock().clone();
        match sender {
            Some(sender) => {
                if sender.send(Outbound { pdu, cbox }).await.is_err() {
                    tracing::trace!(session = %self.name(), "sender gone, pdu dropped");
                }
            }
            None => tracing::trace!(session = %self.name(), "send on closed session ignored"),
        }
    }

    pub async fn tx_msg<M: Message>(&self, msg: &M) -> Result<(), SessionError> {
        let pdu = msg.to_pdu(self.version(), self.pool())?;
        self.tx(pdu).await;
        Ok(())
    }

    /// Send `msg` and wait for its Ack. A success returns the Ack PDU
    /// positioned at its payload; a failure comes back as [`SessionError::Nack`].
    pub async fn request<M: Message>(&self, msg: &M) -> Result<Pdu, SessionError> {
        let pdu = msg.to_pdu(self.version(), self.pool())?;
        self.request_pdu(msg.req(), pdu).await
    }

    /// [`Session::request`] for a PDU built by hand, such as a Blob.
    pub async fn request_pdu(&self, req: Req, pdu: Pdu) -> Result<Pdu, SessionError> {
        let rx = self.inner.acker.map_oneshot(req)?;
        self.tx(pdu).await;
        let (outcome, payload) = self.await_ack(req, rx).await?;
        outcome?;
        Ok(payload)
    }

    async fn await_ack<T>(&self, req: Req, rx: oneshot::Receiver<T>) -> Result<T, SessionError> {
        if self.is_closed() && self.inner.acker.unmap(&req) {
            return Err(SessionError::Closed);
        }
        match tokio::time::timeout(self.inner.config.ack_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                self.inner.acker.unmap(&req);
                tracing::warn!(session = %self.name(), %req, "ack timed out");
                Err(SessionError::Timeout)
            }
        }
    }

    pub async fn exec<S: AsRef<str>>(&self, args: &[S]) -> Result<Pdu, SessionError> {
        self.request(&Exec::new(self.next_req(), args)).await
    }

    /// Successful Ack carrying `payload`.
    pub async fn ack(&self, req: Req, payload: &[u8]) -> Result<(), SessionError> {
        let pdu = Ack::success(req).to_pdu(self.version(), self.pool())?;
        pdu.append(payload)?;
        self.tx(pdu).await;
        Ok(())
    }

    /// Successful Ack written straight to a temp file, for listings and
    /// file contents. Append the payload, then [`Session::tx`] it.
    pub fn large_ack(&self, req: Req) -> Result<Pdu, SessionError> {
        let mut pdu = self.pool().alloc_spooled()?;
        Ack::success(req).format(self.version(), &mut pdu)?;
        Ok(pdu)
    }

    pub async fn nack(
        &self,
        req: Req,
        code: ErrCode,
        reason: impl Into<String>,
    ) -> Result<(), SessionError> {
        let pdu = Ack::failure(req, code, reason).to_pdu(self.version(), self.pool())?;
        self.tx(pdu).await;
        Ok(())
    }

    /// Nack `req` and hang up once the Nack is written.
    pub async fn reject(&self, req: Req, code: ErrCode, reason: &str) -> Result<(), SessionError> {
        tracing::info!(session = %self.name(), %req, %code, reason, "rejecting peer");
        let _ = self.transition(State::Quitting);
        self.nack(req, code, reason).await?;
        self.close_outbound();
        Ok(())
    }

    /// Prove `user` to the accepting side by signing our ephemeral key.
    pub async fn login(&self, user: &SecretKey, ephemeral: &PublicKey) -> Result<(), SessionError> {
        let login = Login {
            req: Req::LOGIN,
            user: user.public(),
            sig: user.sign(ephemeral.as_bytes()),
        };
        self.request(&login).await?;
        self.transition(State::Established)?;
        tracing::info!(session = %self.name(), user = %user.public().short(), "logged in");
        Ok(())
    }

    /// Check a Login signature against the dialer's ephemeral key. On
    /// success the session is established for the signing user; on failure
    /// the peer is Nack'd and the session quits.
    pub async fn handle_login(
        &self,
        login: &Login,
        ephemeral: &PublicKey,
    ) -> Result<PublicKey, SessionError> {
        if self.state() != State::Provisional {
            self.nack(login.req, ErrCode::Unexpected, "already logged in")
                .await?;
            return Err(SessionError::Login("already logged in".into()));
        }
        if login.user.verify(ephemeral.as_bytes(), &login.sig).is_err() {
            self.reject(login.req, ErrCode::Denied, "bad login signature")
                .await?;
            return Err(SessionError::Login(format!(
                "bad signature from {}",
                login.user.short()
            )));
        }
        *self.inner.remote_user.lock() = Some(login.user);
        self.transition(State::Established)?;
        self.ack(login.req, &[]).await?;
        tracing::info!(session = %self.name(), user = %login.user.short(), "login accepted");
        Ok(login.user)
    }

    /// Ask the peer to hold traffic so the box can be rotated.
    pub async fn pause(&self) -> Result<(), SessionError> {
        self.request(&Pause { req: Req::PAUSE }).await?;
        self.transition(State::Suspended)
    }

    pub async fn handle_pause(&self, pause: &Pause) -> Result<(), SessionError> {
        match self.transition(State::Suspended) {
            Ok(()) => self.ack(pause.req, &[]).await,
            Err(e) => self.nack(pause.req, ErrCode::Unexpected, e.to_string()).await,
        }
    }

    /// Leave `suspended` with a fresh base nonce. Our box is swapped as soon
    /// as the Ack has been opened under the old one.
    pub async fn resume(&self) -> Result<(), SessionError> {
        if self.state() != State::Suspended {
            return Err(SessionError::Transition {
                from: self.state(),
                to: State::Established,
            });
        }
        let resume = Resume {
            req: Req::RESUME,
            nonce: Nonce::generate(),
        };
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        let nonce = resume.nonce;
        self.inner.acker.map(resume.req, move |outcome, _| {
            if outcome.is_ok() {
                inner.rotate(&nonce);
            }
            let _ = tx.send(outcome);
        })?;
        self.tx_msg(&resume).await?;
        self.await_ack(resume.req, rx).await??;
        self.transition(State::Established)
    }

    /// Rotate our box and Ack under the old one, so the peer can open the
    /// Ack before it swaps too.
    pub async fn handle_resume(&self, resume: &Resume) -> Result<(), SessionError> {
        if self.state() != State::Suspended {
            return self
                .nack(resume.req, ErrCode::Unexpected, "session not suspended")
                .await;
        }
        let old = self.inner.rotate(&resume.nonce);
        let ack = Ack::success(resume.req).to_pdu(self.version(), self.pool())?;
        self.tx_with(ack, old).await;
        self.transition(State::Established)
    }

    /// Tell the peer to reconnect to `target`, then hang up.
    pub async fn redirect(&self, target: &str) -> Result<(), SessionError> {
        let redirect = Redirect {
            req: self.next_req(),
            target: target.to_string(),
        };
        let _ = self.transition(State::Quitting);
        let result = self.request(&redirect).await;
        self.close();
        result.map(|_| ())
    }

    pub async fn handle_redirect(&self, redirect: &Redirect) -> Result<(), SessionError> {
        tracing::info!(session = %self.name(), target = %redirect.target, "redirected");
        *self.inner.redirect.lock() = Some(redirect.target.clone());
        let _ = self.transition(State::Quitting);
        self.ack(redirect.req, &[]).await?;
        self.close_outbound();
        Ok(())
    }

    /// Send Quit, wait for its Ack, then close.
    pub async fn quit(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Ok(());
        }
        let _ = self.transition(State::Quitting);
        let result = self.request(&Quit { req: Req::QUIT }).await;
        self.close();
        result.map(|_| ())
    }

    /// Ack the peer's Quit; the connection closes once the Ack is written.
    pub async fn handle_quit(&self, quit: &Quit) -> Result<(), SessionError> {
        let _ = self.transition(State::Quitting);
        self.ack(quit.req, &[]).await?;
        self.close_outbound();
        Ok(())
    }

    /// Stop accepting outbound PDUs. The sender drains what is queued, shuts
    /// the socket down and closes the session.
    fn close_outbound(&self) {
        self.inner.outbound.lock().take();
    }

    /// Close now. Idempotent.
    pub fn close(&self) {
        let _ = self.transition(State::Closed);
        self.close_outbound();
        self.inner.acker.clear();
    }

    fn live(&self) -> impl Fn() -> bool + Send + Sync + 'static {
        let session = self.clone();
        move || session.state().is_live()
    }

    /// Nack a PDU of a newer protocol at the version we speak, then hang up.
    /// Every request body starts with its Req.
    async fn refuse_version(&self, pdu: &mut Pdu, version: u8) {
        let mut req = [0u8; REQ_SIZE];
        if io::Read::read_exact(pdu, &mut req).is_err() {
            self.close();
            return;
        }
        let reason = format!("protocol version {} unsupported", version);
        let _ = self.transition(State::Quitting);
        let nack = Ack::failure(Req::from(req), ErrCode::Incompatible, reason);
        match nack.to_pdu(LATEST_VERSION, self.pool()) {
            Ok(nack) => {
                self.tx(nack).await;
                self.close_outbound();
            }
            Err(_) => self.close(),
        }
    }

    /// Route one reassembled PDU. Returns `false` when the session must end.
    async fn dispatch(&self, mut pdu: Pdu, inbound: &mpsc::Sender<Received>) -> bool {
        let header = match Header::read(&mut pdu) {
            Ok(header) => header,
            Err(ProtoError::Incompatible(version)) => {
                tracing::warn!(session = %self.name(), version, "peer speaks a newer protocol");
                self.refuse_version(&mut pdu, version).await;
                return true;
            }
            Err(e) => {
                tracing::warn!(session = %self.name(), error = %e, "dropping unreadable pdu");
                return true;
            }
        };
        self.downgrade_version(header.version);

        if header.id == Id::Ack {
            match Ack::read_body(&mut pdu) {
                Ok(ack) => {
                    if let Err(e) = self.inner.acker.rx(ack.req, ack.outcome(), pdu) {
                        tracing::warn!(session = %self.name(), error = %e, "dropping ack");
                    }
                }
                Err(e) => tracing::warn!(session = %self.name(), error = %e, "ill-formed ack"),
            }
            return true;
        }

        tracing::trace!(session = %self.name(), id = %header.id, len = pdu.len(), "received pdu");
        inbound.send(Received { header, pdu }).await.is_ok()
    }
}

async fn recv_loop<R>(session: Session, mut reader: R, inbound: mpsc::Sender<Received>)
where
    R: AsyncRead + Unpin,
{
    let deadline = Deadline::new(session.inner.config.io_timeout, session.live());
    let mut state = session.inner.state.subscribe();
    loop {
        let inner = &session.inner;
        let read = tokio::select! {
            read = framing::read_pdu(&mut reader, || inner.current_box(), &inner.config.pool, &deadline) => read,
            _ = closed(&mut state) => break,
        };
        match read {
            Ok(Some(pdu)) => {
                if !session.dispatch(pdu, &inbound).await {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!(session = %session.name(), "peer hung up");
                break;
            }
            Err(e) => {
                if session.state().is_live() {
                    tracing::warn!(session = %session.name(), error = %e, "receive failed");
                }
                break;
            }
        }
    }
    session.close();
}

async fn closed(state: &mut watch::Receiver<State>) {
    let _ = state.wait_for(|s| *s == State::Closed).await;
}

async fn send_loop<W>(session: Session, mut writer: W, mut outbound: mpsc::Receiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    let deadline = Deadline::new(session.inner.config.io_timeout, session.live());
    while let Some(Outbound { pdu, cbox }) = outbound.recv().await {
        if let Err(e) = framing::write_pdu(&mut writer, &cbox, &pdu, &deadline).await {
            tracing::warn!(session = %session.name(), error = %e, "send failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
    session.close();
    tracing::debug!(session = %session.name(), "session closed");
}
