#[allow(clippy::module_inception)]
pub mod config;

pub use config::{ChannelConfig, Config, ConfigError, ReconnectConfig};
