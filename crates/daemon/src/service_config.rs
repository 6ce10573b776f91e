use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use common::prelude::{PduPool, PublicKey, SecretKey};
use common::session::DEFAULT_IO_TIMEOUT;

use crate::state::{AppState, StateError};

/// Capacity of the in-memory PDU trace ring
pub const DEFAULT_TRACE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    // network
    /// address the service accepts sessions on
    pub listen_addr: SocketAddr,
    /// identity sessions are opened against
    pub secret: SecretKey,
    /// socket deadline, idle expiry is retried
    pub io_timeout: Duration,
    /// connections above this are turned away
    pub max_sessions: usize,
    /// if set, logged in sessions are sent here instead
    pub redirect: Option<String>,

    // repository
    pub repos_dir: PathBuf,
    /// key with administrator rights, next to the service key itself
    pub admin: Option<PublicKey>,

    // buffers
    pub pdu_pool_size: usize,
    pub pdu_mem_capacity: usize,
    pub trace_capacity: usize,

    // logging
    pub log_level: tracing::Level,
    /// Directory for log files (optional, logs to stdout only if not set)
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Build the service configuration from an initialized state directory.
    pub fn from_state(state: &AppState) -> Result<Self, StateError> {
        let listen_addr = state
            .config
            .listen_addr
            .parse()
            .map_err(|_| {
                StateError::InvalidConfig(format!("listen address {}", state.config.listen_addr))
            })?;
        Ok(Self {
            listen_addr,
            secret: state.load_key()?,
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_sessions: state.config.max_sessions,
            redirect: state.config.redirect.clone(),
            repos_dir: state.repos_path.clone(),
            admin: state.config.admin()?,
            pdu_pool_size: state.config.pdu_pool_size,
            pdu_mem_capacity: state.config.pdu_mem_capacity,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
            log_level: state.config.log_level()?,
            log_dir: None,
        })
    }

    pub fn pool(&self) -> PduPool {
        PduPool::new(self.pdu_pool_size, self.pdu_mem_capacity)
    }
}
