//! Shared setup for service integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ::common::crypto::{PublicKey, SecretKey};
use ::common::repos::Repos;
use asn_daemon::service_config::DEFAULT_TRACE_CAPACITY;
use asn_daemon::{Client, ClientConfig, ClientError, Service, ServiceConfig};
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A service over a temp repository with a fresh admin key
pub struct ServiceEnv {
    pub service: Service,
    pub admin: SecretKey,
    pub dir: TempDir,
}

pub fn config(dir: &TempDir, admin: &SecretKey) -> ServiceConfig {
    ServiceConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        secret: SecretKey::generate(),
        io_timeout: TIMEOUT,
        max_sessions: 16,
        redirect: None,
        repos_dir: dir.path().join("repos"),
        admin: Some(admin.public()),
        pdu_pool_size: 16,
        pdu_mem_capacity: 64 * 1024,
        trace_capacity: DEFAULT_TRACE_CAPACITY,
        log_level: tracing::Level::DEBUG,
        log_dir: None,
    }
}

pub fn service_env() -> ServiceEnv {
    let dir = TempDir::new().unwrap();
    let admin = SecretKey::generate();
    let service = Service::new(&config(&dir, &admin)).unwrap();
    ServiceEnv {
        service,
        admin,
        dir,
    }
}

impl ServiceEnv {
    /// A registered user with a fresh key.
    pub fn user(&self) -> SecretKey {
        let key = SecretKey::generate();
        self.service.repos().new_user(&key.public()).unwrap();
        key
    }

    pub fn client_config(&self, user: &SecretKey) -> ClientConfig {
        let mut config = ClientConfig::new(self.service.public(), user.clone());
        config.io_timeout = TIMEOUT;
        config
    }

    /// Log `user` in over an in-memory socket.
    pub async fn connect(&self, user: &SecretKey) -> Result<Client, ClientError> {
        self.connect_with(self.client_config(user)).await
    }

    pub async fn connect_with(&self, config: ClientConfig) -> Result<Client, ClientError> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let service = self.service.clone();
        tokio::spawn(async move {
            let _ = service.accept(server_io, "test".to_string()).await;
        });
        Client::start(client_io, "client", config).await
    }

    /// A client whose pushed blobs are stored in a repository of its own.
    pub async fn connect_mirrored(
        &self,
        user: &SecretKey,
    ) -> (Client, Arc<Repos>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mirror = Arc::new(
            Repos::open(dir.path(), self.service.public(), Some(user.public())).unwrap(),
        );
        let mut config = self.client_config(user);
        config.mirror = Some(mirror.clone());
        let client = self.connect_with(config).await.unwrap();
        (client, mirror, dir)
    }

    /// Wait until `user` has an established session registered.
    pub async fn wait_registered(&self, user: &PublicKey) {
        tokio::time::timeout(TIMEOUT, async {
            while self.service.registry().sessions_for(user).is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}

/// Run one command and return the reply as text.
pub async fn exec(client: &Client, args: &[&str]) -> String {
    String::from_utf8(client.exec(args).await.unwrap()).unwrap()
}

/// Poll until `client` has received `n` pushed blobs.
pub async fn wait_received(client: &Client, n: usize) {
    tokio::time::timeout(TIMEOUT, async {
        while client.received() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
