use common::blob::Blob;
use common::pdu::Pdu;
use common::prelude::{ErrCode, Id, PublicKey, ReposError, Session, SessionReceiver};
use common::proto::{Exec, Index, Login, Message, Pause, Quit, Redirect, Resume};
use common::repos::Ingested;
use common::session::Received;

use super::{exec, Direction, Service, ServiceError};

/// Serve one session until its peer goes away.
pub(crate) async fn serve(
    service: Service,
    session: Session,
    mut rx: SessionReceiver,
    ephemeral: PublicKey,
) {
    let mut conn = Connection {
        service,
        session,
        ephemeral,
        user: None,
    };
    while let Some(Received { header, pdu }) = rx.recv().await {
        conn.service
            .trace()
            .record(conn.session.name(), Direction::In, header.id, pdu.len());
        if let Err(e) = conn.handle(header.id, pdu).await {
            tracing::warn!(
                session = %conn.session.name(),
                id = %header.id,
                error = %e,
                "dropping pdu"
            );
        }
    }
    conn.finish();
}

struct Connection {
    service: Service,
    session: Session,
    /// Dialer's handshake key, signed by its Login.
    ephemeral: PublicKey,
    /// Acting user and registry id once logged in.
    user: Option<(PublicKey, u64)>,
}

impl Connection {
    async fn handle(&mut self, id: Id, mut pdu: Pdu) -> Result<(), ServiceError> {
        match id {
            Id::Login => {
                let login = Login::read_body(&mut pdu)?;
                return self.login(login).await;
            }
            Id::Quit => {
                let quit = Quit::read_body(&mut pdu)?;
                return Ok(self.session.handle_quit(&quit).await?);
            }
            // routed to the acker by the session itself
            Id::Ack => return Ok(()),
            _ => {}
        }
        match self.user {
            Some((acting, _)) => self.handle_established(id, pdu, acting).await,
            None => {
                tracing::warn!(session = %self.session.name(), %id, "pdu before login ignored");
                Ok(())
            }
        }
    }

    async fn handle_established(
        &self,
        id: Id,
        mut pdu: Pdu,
        acting: PublicKey,
    ) -> Result<(), ServiceError> {
        match id {
            Id::Exec => {
                let exec = Exec::read_body(&mut pdu)?;
                tokio::spawn(exec::run(
                    self.service.clone(),
                    self.session.clone(),
                    acting,
                    exec,
                ));
            }
            Id::Blob => {
                tokio::spawn(ingest(
                    self.service.clone(),
                    self.session.clone(),
                    acting,
                    pdu,
                ));
            }
            Id::Pause => {
                let pause = Pause::read_body(&mut pdu)?;
                self.session.handle_pause(&pause).await?;
            }
            Id::Resume => {
                let resume = Resume::read_body(&mut pdu)?;
                self.session.handle_resume(&resume).await?;
            }
            Id::Redirect => {
                let redirect = Redirect::read_body(&mut pdu)?;
                self.session.handle_redirect(&redirect).await?;
            }
            Id::Index => {
                let index = Index::read_body(&mut pdu)?;
                tracing::debug!(session = %self.session.name(), sums = index.sums.len(), "peer index");
                self.session.ack(index.req, &[]).await?;
            }
            Id::Login | Id::Quit | Id::Ack => {}
        }
        Ok(())
    }

    /// Accept a login from a known user, or from a key some user names in
    /// its `asn/auth` slot, in which case the session acts for that user.
    async fn login(&mut self, login: Login) -> Result<(), ServiceError> {
        let repos = self.service.repos();
        let acting = if repos.is_privileged(&login.user) || repos.has_user(&login.user) {
            Some(login.user)
        } else {
            repos.user_for_auth(&login.user)
        };
        let Some(acting) = acting else {
            self.session
                .reject(login.req, ErrCode::Denied, "unknown user")
                .await?;
            return Err(ServiceError::Denied(format!(
                "unknown user {}",
                login.user.short()
            )));
        };

        self.session.handle_login(&login, &self.ephemeral).await?;
        let id = self
            .service
            .registry()
            .register(acting, self.session.clone());
        self.user = Some((acting, id));
        tracing::info!(
            session = %self.session.name(),
            user = %acting.short(),
            key = %login.user.short(),
            "session established"
        );

        if let Some(target) = self.service.redirect_for(&acting) {
            let session = self.session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.redirect(&target).await {
                    tracing::debug!(session = %session.name(), error = %e, "redirect not acknowledged");
                }
            });
        }
        Ok(())
    }

    fn finish(self) {
        if let Some((user, id)) = self.user {
            self.service.registry().unregister(&user, id);
        }
        self.session.close();
        tracing::debug!(session = %self.session.name(), "connection done");
    }
}

/// Store a Blob PDU for `acting`, Ack it with the object's sum and push the
/// resulting deliveries.
async fn ingest(service: Service, session: Session, acting: PublicKey, mut pdu: Pdu) {
    let stored = service
        .blocking(move |repos| {
            let blob = Blob::read_from(&mut pdu)?;
            let ingested = repos.ingest(&blob, &mut pdu, &acting);
            Ok((blob, ingested))
        })
        .await;
    let (blob, ingested): (Blob, Result<Ingested, ReposError>) = match stored {
        Ok(stored) => stored,
        Err(e) => {
            tracing::warn!(session = %session.name(), error = %e, "unreadable blob pdu");
            return;
        }
    };

    let sent = match ingested {
        Ok(ingested) => {
            let sent = session.ack(blob.req(), ingested.sum.as_bytes()).await;
            service.deliver(ingested.deliveries);
            sent
        }
        Err(e) => {
            tracing::info!(
                session = %session.name(),
                name = %blob.name,
                error = %e,
                "blob refused"
            );
            session.nack(blob.req(), e.code(), e.to_string()).await
        }
    };
    if let Err(e) = sent {
        tracing::debug!(session = %session.name(), error = %e, "blob ack not sent");
    }
}
