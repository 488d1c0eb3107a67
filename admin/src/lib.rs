//! Configuration and service wiring for the `tessera-admin` binary.

mod app;
mod config;

pub use app::{App, AppError};
pub use config::{
    AppConfig, AppConfigError, DatabaseConfig, ENV_DATABASE_PATH, ENV_WEBHOOK_SECRET, KeysConfig,
    WebhookConfig,
};
