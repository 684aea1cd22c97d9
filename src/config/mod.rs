use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
pub use validator::Validate;

use crate::engine::RetryPolicy;

pub const DEFAULT_CONFIG_STR: &str = include_str!("default.toml");

#[non_exhaustive]
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct Config {
    pub data_dir: PathBuf,
    pub download_dir: PathBuf,
    #[validate(url(message = "base_url must be a valid URL"))]
    pub base_url: String,
    #[validate(length(min = 1, message = "user_agent must not be empty"))]
    pub user_agent: String,
    pub timeout: u64,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub max_fetch_errors: u32,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_millis(self.retry_delay_ms),
            max_consecutive: self.max_fetch_errors,
        }
    }
}
