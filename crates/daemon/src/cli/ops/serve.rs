use clap::Args;

use asn_daemon::state::{AppState, StateError};
use asn_daemon::{spawn_service, ServiceConfig};

#[derive(Args, Debug, Clone)]
pub struct Serve {
    /// Override the listen address from config
    #[arg(long)]
    pub listen_addr: Option<std::net::SocketAddr>,

    /// Directory for log files (logs to stdout only if not set)
    #[arg(long)]
    pub log_dir: Option<std::path::PathBuf>,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Serve {
    type Error = StateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;

        let mut config = ServiceConfig::from_state(&state)?;
        if let Some(listen_addr) = self.listen_addr {
            config.listen_addr = listen_addr;
        }
        config.log_dir = self.log_dir.clone();

        spawn_service(&config).await;
        Ok("service ended".to_string())
    }
}
