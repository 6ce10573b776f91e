// Dialing side (CLI exec, tests)
pub mod client;

// Service modules
pub mod process;
pub mod service;
pub mod service_config;

// App state (configuration, paths)
pub mod state;

pub use client::{Client, ClientConfig, ClientError};
pub use process::{spawn_service, start_service, ShutdownHandle};
pub use service::{Service, ServiceError};
pub use service_config::Config as ServiceConfig;
pub use state::{AppConfig, AppState, StateError};
