use clap::Args;

use asn_daemon::state::{AppConfig, AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Address to accept sessions on
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// Hex public key with administrator rights over the repository
    #[arg(long)]
    pub admin_key: Option<String>,

    /// Counter bytes per session nonce (0, 1, 2, 4 or 8)
    #[arg(long)]
    pub seq_len: Option<u8>,

    /// Send unprivileged sessions to this address instead
    #[arg(long)]
    pub redirect: Option<String>,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = StateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut config = AppConfig::default();
        if let Some(listen_addr) = &self.listen_addr {
            config.listen_addr = listen_addr.clone();
        }
        if let Some(seq_len) = self.seq_len {
            config.seq_len = seq_len;
        }
        config.admin_key = self.admin_key.clone();
        config.redirect = self.redirect.clone();

        let state = AppState::init(ctx.config_path.clone(), Some(config))?;
        let key = state.load_key()?;

        Ok(format!(
            "initialized {}\nservice key: {}\nlisten: {}",
            state.asn_dir.display(),
            key.public(),
            state.config.listen_addr
        ))
    }
}
