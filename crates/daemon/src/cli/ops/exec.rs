use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use asn_daemon::state::{AppState, StateError};
use asn_daemon::{Client, ClientConfig, ClientError};
use common::crypto::KeyError;
use common::prelude::{PublicKey, Repos, ReposError};

#[derive(Args, Debug, Clone)]
pub struct Exec {
    /// Service address, host:port
    pub server: String,

    /// Hex public key of the service
    pub service_key: String,

    /// Command and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub args: Vec<String>,

    /// Store blobs the service pushes into a repository at this path
    #[arg(long)]
    pub mirror: Option<PathBuf>,

    /// Connection attempts before giving up
    #[arg(long)]
    pub attempts: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("bad service key: {0}")]
    Key(#[from] KeyError),

    #[error("mirror error: {0}")]
    Mirror(#[from] ReposError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Exec {
    type Error = ExecError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let user = state.load_key()?;
        let service = PublicKey::from_hex(&self.service_key)?;

        let mut config = ClientConfig::new(service, user.clone());
        config.seq_len = state.config.seq_len()?;
        if let Some(attempts) = self.attempts {
            config.attempts = attempts;
        }
        if let Some(dir) = &self.mirror {
            config.mirror = Some(Arc::new(Repos::open(dir, service, Some(user.public()))?));
        }

        let client = Client::connect(&self.server, config).await?;
        let reply = client.exec(&self.args).await?;
        let received = client.received();
        if let Err(e) = client.quit().await {
            tracing::debug!(error = %e, "quit not acknowledged");
        }

        let mut output = String::from_utf8_lossy(&reply).into_owned();
        if received > 0 {
            output.push_str(&format!("\n({} blobs received)", received));
        }
        Ok(output)
    }
}
