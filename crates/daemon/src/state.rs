use std::{fs, path::PathBuf};

use common::prelude::{PublicKey, SecretKey, SeqLen};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "asn";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const KEY_FILE_NAME: &str = "key.pem";
pub const REPOS_DIR_NAME: &str = "repos";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Address the service accepts sessions on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Hex public key with administrator rights over the repository
    #[serde(default)]
    pub admin_key: Option<String>,
    /// Counter bytes at the end of each session nonce: 0, 1, 2, 4 or 8
    #[serde(default = "default_seq_len")]
    pub seq_len: u8,
    /// Concurrent sessions before new connections are turned away
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_pdu_pool_size")]
    pub pdu_pool_size: usize,
    /// PDUs growing past this many bytes spool to a temp file
    #[serde(default = "default_pdu_mem_capacity")]
    pub pdu_mem_capacity: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Send every logged in, unprivileged session to this address instead
    #[serde(default)]
    pub redirect: Option<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:2323".to_string()
}

fn default_seq_len() -> u8 {
    8
}

fn default_max_sessions() -> usize {
    256
}

fn default_pdu_pool_size() -> usize {
    common::pdu::DEFAULT_POOL_SIZE
}

fn default_pdu_mem_capacity() -> usize {
    common::pdu::DEFAULT_MEM_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_key: None,
            seq_len: default_seq_len(),
            max_sessions: default_max_sessions(),
            pdu_pool_size: default_pdu_pool_size(),
            pdu_mem_capacity: default_pdu_mem_capacity(),
            log_level: default_log_level(),
            redirect: None,
        }
    }
}

impl AppConfig {
    pub fn admin(&self) -> Result<Option<PublicKey>, StateError> {
        self.admin_key
            .as_deref()
            .map(|hex| PublicKey::from_hex(hex).map_err(|e| StateError::InvalidKey(e.to_string())))
            .transpose()
    }

    /// Sequence length for dialed sessions. Zero is a static nonce, which
    /// sessions never use.
    pub fn seq_len(&self) -> Result<SeqLen, StateError> {
        match SeqLen::try_from(self.seq_len) {
            Ok(seq_len) if !seq_len.is_none() => Ok(seq_len),
            Ok(_) => Err(StateError::InvalidConfig("seq_len 0".to_string())),
            Err(e) => Err(StateError::InvalidConfig(e.to_string())),
        }
    }

    pub fn log_level(&self) -> Result<tracing::Level, StateError> {
        self.log_level
            .parse()
            .map_err(|_| StateError::InvalidConfig(format!("log level {}", self.log_level)))
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the asn directory (~/.asn)
    pub asn_dir: PathBuf,
    /// Path to the service key PEM file
    pub key_path: PathBuf,
    /// Path to the repository
    pub repos_path: PathBuf,
    /// Path to the config file
    pub config_path: PathBuf,
    /// Loaded configuration
    pub config: AppConfig,
}

impl AppState {
    /// Get the asn directory path (custom or default ~/.asn)
    pub fn asn_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        if let Some(path) = custom_path {
            return Ok(path);
        }

        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    /// Initialize a new asn state directory
    pub fn init(
        custom_path: Option<PathBuf>,
        config: Option<AppConfig>,
    ) -> Result<Self, StateError> {
        let asn_dir = Self::asn_dir(custom_path)?;

        if asn_dir.exists() {
            return Err(StateError::AlreadyInitialized);
        }

        let config = config.unwrap_or_default();
        config.admin()?;
        config.seq_len()?;

        fs::create_dir_all(&asn_dir)?;

        let repos_path = asn_dir.join(REPOS_DIR_NAME);
        fs::create_dir_all(&repos_path)?;

        let key = SecretKey::generate();
        let key_path = asn_dir.join(KEY_FILE_NAME);
        fs::write(&key_path, key.to_pem())?;

        let config_path = asn_dir.join(CONFIG_FILE_NAME);
        let config_toml = toml::to_string_pretty(&config)?;
        fs::write(&config_path, config_toml)?;

        Ok(Self {
            asn_dir,
            key_path,
            repos_path,
            config_path,
            config,
        })
    }

    /// Load existing state from the asn directory
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let asn_dir = Self::asn_dir(custom_path)?;

        if !asn_dir.exists() {
            return Err(StateError::NotInitialized);
        }

        let key_path = asn_dir.join(KEY_FILE_NAME);
        let repos_path = asn_dir.join(REPOS_DIR_NAME);
        let config_path = asn_dir.join(CONFIG_FILE_NAME);

        if !key_path.exists() {
            return Err(StateError::MissingFile(KEY_FILE_NAME.to_string()));
        }
        if !repos_path.exists() {
            return Err(StateError::MissingFile(format!("{}/", REPOS_DIR_NAME)));
        }
        if !config_path.exists() {
            return Err(StateError::MissingFile(CONFIG_FILE_NAME.to_string()));
        }

        let config_toml = fs::read_to_string(&config_path)?;
        let config: AppConfig = toml::from_str(&config_toml)?;
        config.admin()?;
        config.seq_len()?;

        Ok(Self {
            asn_dir,
            key_path,
            repos_path,
            config_path,
            config,
        })
    }

    /// Load the secret key from the key file
    pub fn load_key(&self) -> Result<SecretKey, StateError> {
        let pem = fs::read_to_string(&self.key_path)?;
        let key = SecretKey::from_pem(&pem).map_err(|e| StateError::InvalidKey(e.to_string()))?;
        Ok(key)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("asn directory not initialized. Run 'asn init' first")]
    NotInitialized,

    #[error("asn directory already initialized")]
    AlreadyInitialized,

    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("missing required file: {0}")]
    MissingFile(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
