use anyhow::{Context, Result};

use crate::bfl::BflClient;
use crate::config::Config;
use crate::db::Db;
use crate::session::{RateLimiter, Sessions};
use crate::tracker::{EditJobTracker, SystemClock};

/// Всё, что нужно обработчикам: передаётся в диспетчер через `dptree::deps!` как `Arc<AppContext>`.
pub struct AppContext {
    pub config: Config,
    pub db: Db,
    pub tracker: EditJobTracker<BflClient>,
    pub sessions: Sessions,
    pub rate_limiter: RateLimiter,
    pub http: reqwest::Client,
}

impl AppContext {
    pub fn new(config: Config, db: Db) -> Result<Self> {
        let api = BflClient::new(
            &config.bfl_api_base_url,
            &config.bfl_model_path,
            &config.bfl_api_key,
            config.http_timeout(),
        )
        .context("failed to build BFL client")?;
        let tracker = EditJobTracker::new(api, SystemClock, config.tracker_settings());
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            rate_limiter: RateLimiter::per_minute(config.rate_limit_per_minute),
            sessions: Sessions::new(),
            tracker,
            http,
            db,
            config,
        })
    }

    pub fn telegram_file_url(&self, file_path: &str) -> String {
        format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.config.telegram_bot_token, file_path
        )
    }
}
