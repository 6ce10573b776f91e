//! Shared test utilities for session and repository integration tests
#![allow(dead_code)]

use std::time::Duration;

use chrono::{DateTime, Utc};
use ::common::blob::Blob;
use ::common::crypto::{PublicKey, SecretKey, SeqLen};
use ::common::pdu::PduPool;
use ::common::repos::{Ingested, Repos};
use ::common::session::handshake::{self, Accepted, Dialed};
use ::common::session::{Session, SessionConfig, SessionReceiver};
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A repository in a temp dir with fresh admin and service keys
pub struct ReposEnv {
    pub repos: Repos,
    pub admin: SecretKey,
    pub service: SecretKey,
    pub dir: TempDir,
}

pub fn repos_env() -> ReposEnv {
    let dir = TempDir::new().unwrap();
    let admin = SecretKey::generate();
    let service = SecretKey::generate();
    let repos = Repos::open(dir.path(), service.public(), Some(admin.public())).unwrap();
    ReposEnv {
        repos,
        admin,
        service,
        dir,
    }
}

/// Store `content` under `name`, written by `author` for `owner`.
pub fn put(
    repos: &Repos,
    owner: &PublicKey,
    author: &PublicKey,
    name: &str,
    content: &[u8],
) -> (Blob, Ingested) {
    let blob = Blob::new(*owner, *author, name).unwrap();
    let ingested = repos.ingest(&blob, &mut &content[..], author).unwrap();
    (blob, ingested)
}

/// Same as [`put`] with an explicit header time.
pub fn put_at(
    repos: &Repos,
    owner: &PublicKey,
    name: &str,
    content: &[u8],
    time: DateTime<Utc>,
) -> (Blob, Ingested) {
    let blob = Blob::new(*owner, *owner, name).unwrap().with_time(time);
    let ingested = repos.ingest(&blob, &mut &content[..], owner).unwrap();
    (blob, ingested)
}

pub struct Client {
    pub session: Session,
    pub rx: SessionReceiver,
    pub ephemeral: SecretKey,
}

pub struct Server {
    pub session: Session,
    pub rx: SessionReceiver,
    pub ephemeral: PublicKey,
}

/// Handshake over an in-memory socket and start both ends.
pub async fn session_pair(service: &SecretKey, pool: &PduPool) -> (Client, Server) {
    let (mut client_io, mut server_io) = tokio::io::duplex(64 * 1024);
    let service_pub = service.public();
    let (dialed, accepted) = tokio::join!(
        handshake::dial(&mut client_io, &service_pub, SeqLen::Eight, TIMEOUT),
        handshake::accept(&mut server_io, service, TIMEOUT),
    );
    let Dialed { cbox, ephemeral } = dialed.unwrap();
    let (session, rx) = Session::start(client_io, cbox, SessionConfig::new("client", pool.clone()));
    let client = Client {
        session,
        rx,
        ephemeral,
    };

    let Accepted { cbox, ephemeral } = accepted.unwrap();
    let (session, rx) = Session::start(server_io, cbox, SessionConfig::new("server", pool.clone()));
    let server = Server {
        session,
        rx,
        ephemeral,
    };
    (client, server)
}
