use std::ffi::OsString;
use std::fmt::Display;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};

use crate::bfl::EditOptions;
use crate::imaging::ImageLimits;
use crate::runner::{Backoff, PollSchedule};
use crate::tracker::TrackerSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(alias = "TELEGRAM_BOT_TOKEN", default)]
    pub telegram_bot_token: String,
    #[serde(alias = "BOT_USERNAME", default = "default_bot_username")]
    pub bot_username: String,
    #[serde(alias = "BFL_API_KEY", default)]
    pub bfl_api_key: String,
    #[serde(alias = "BFL_API_BASE_URL", default = "default_bfl_base")]
    pub bfl_api_base_url: String,
    #[serde(alias = "BFL_MODEL_PATH", default = "default_bfl_model_path")]
    pub bfl_model_path: String,
    #[serde(alias = "DB_PATH", default = "default_db_path")]
    pub db_path: String,
    #[serde(alias = "ENVIRONMENT", default = "default_environment")]
    pub environment: String,
    #[serde(alias = "MAX_IMAGE_SIZE_MB", default = "default_max_image_size_mb", deserialize_with = "flexible")]
    pub max_image_size_mb: u64,
    #[serde(alias = "MAX_IMAGE_PIXELS", default = "default_max_image_pixels", deserialize_with = "flexible")]
    pub max_image_pixels: u64,
    #[serde(alias = "POLLING_INTERVAL_SECONDS", default = "default_polling_interval", deserialize_with = "flexible")]
    pub polling_interval_seconds: u64,
    #[serde(alias = "MAX_POLLING_ATTEMPTS", default = "default_max_polling_attempts", deserialize_with = "flexible")]
    pub max_polling_attempts: u32,
    #[serde(alias = "POLL_BACKOFF", default = "default_backoff", deserialize_with = "flexible")]
    pub poll_backoff: Backoff,
    #[serde(alias = "POLL_MAX_INTERVAL_SECONDS", default = "default_poll_max_interval", deserialize_with = "flexible")]
    pub poll_max_interval_seconds: u64,
    #[serde(alias = "PROMPT_MIN_CHARS", default = "default_prompt_min", deserialize_with = "flexible")]
    pub prompt_min_chars: usize,
    #[serde(alias = "PROMPT_MAX_CHARS", default = "default_prompt_max", deserialize_with = "flexible")]
    pub prompt_max_chars: usize,
    #[serde(alias = "RATE_LIMIT_PER_MINUTE", default = "default_rate_limit", deserialize_with = "flexible")]
    pub rate_limit_per_minute: usize,
    #[serde(alias = "HTTP_TIMEOUT_SECONDS", default = "default_http_timeout", deserialize_with = "flexible")]
    pub http_timeout_seconds: u64,
    #[serde(alias = "DEFAULT_ASPECT_RATIO", default = "default_aspect_ratio")]
    pub default_aspect_ratio: String,
    #[serde(alias = "DEFAULT_OUTPUT_FORMAT", default = "default_output_format")]
    pub default_output_format: String,
    #[serde(alias = "SAFETY_TOLERANCE", default = "default_safety_tolerance", deserialize_with = "flexible")]
    pub safety_tolerance: u8,
    #[serde(alias = "ADMIN_USER_IDS", default, deserialize_with = "id_list")]
    pub admin_user_ids: Vec<u64>,
    /// Порт HTTP-эндпоинтов `/health` и `/stats`; без него сервер не запускается.
    #[serde(alias = "HEALTH_PORT", default, deserialize_with = "optional_port")]
    pub health_port: Option<u16>,
}

fn default_bot_username() -> String {
    "MedusaXDAIBot".to_string()
}

fn default_bfl_base() -> String {
    "https://api.bfl.ai/v1".to_string()
}

fn default_bfl_model_path() -> String {
    "/flux-kontext-pro".to_string()
}

fn default_db_path() -> String {
    "bot.db".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_max_image_size_mb() -> u64 {
    20
}

fn default_max_image_pixels() -> u64 {
    20_000_000
}

fn default_polling_interval() -> u64 {
    2
}

fn default_max_polling_attempts() -> u32 {
    150
}

fn default_backoff() -> Backoff {
    Backoff::Fixed
}

fn default_poll_max_interval() -> u64 {
    30
}

fn default_prompt_min() -> usize {
    3
}

fn default_prompt_max() -> usize {
    500
}

fn default_rate_limit() -> usize {
    10
}

fn default_http_timeout() -> u64 {
    300
}

fn default_aspect_ratio() -> String {
    "1:1".to_string()
}

fn default_output_format() -> String {
    "jpeg".to_string()
}

fn default_safety_tolerance() -> u8 {
    2
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flexible<T> {
    Value(T),
    Text(String),
}

/// Environment values are always strings; JSON configs carry real numbers. Accept both.
fn flexible<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    match Flexible::<T>::deserialize(deserializer)? {
        Flexible::Value(v) => Ok(v),
        Flexible::Text(s) => s.trim().parse::<T>().map_err(serde::de::Error::custom),
    }
}

/// `[1, 2]` или `"1, 2"`; нечисловые элементы строки пропускаются.
fn id_list<'de, D>(deserializer: D) -> std::result::Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Flexible::<Vec<u64>>::deserialize(deserializer)? {
        Flexible::Value(v) => Ok(v),
        Flexible::Text(s) => Ok(s
            .split(',')
            .filter_map(|part| part.trim().parse::<u64>().ok())
            .collect()),
    }
}

fn optional_port<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Flexible<u16>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Flexible::Value(port)) => Ok(Some(port)),
        Some(Flexible::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Flexible::Text(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

impl Config {
    /// Загружает конфигурацию: `CONFIG_PATH` (JSON-файл), иначе переменные окружения.
    pub fn load() -> Result<Self> {
        let cfg = match std::env::var("CONFIG_PATH") {
            Ok(path) => load_config(&path)?,
            Err(_) => Self::from_env()?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_env_vars(std::env::vars_os())
    }

    /// Переменные с не-UTF-8 именем или значением пропускаются.
    fn from_env_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let map: serde_json::Map<String, serde_json::Value> = vars
            .into_iter()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, serde_json::Value::String(v.into_string().ok()?))))
            .collect();
        serde_json::from_value(serde_json::Value::Object(map))
            .context("invalid configuration in environment")
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let cfg: Config = serde_json::from_str(raw).context("invalid config JSON")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram_bot_token.trim().is_empty() {
            bail!("TELEGRAM_BOT_TOKEN is not set");
        }
        if self.bfl_api_key.trim().is_empty() {
            bail!("BFL_API_KEY is not set");
        }
        if self.max_polling_attempts == 0 {
            bail!("MAX_POLLING_ATTEMPTS must be at least 1");
        }
        if self.polling_interval_seconds == 0 {
            bail!("POLLING_INTERVAL_SECONDS must be at least 1");
        }
        if self.prompt_min_chars > self.prompt_max_chars {
            bail!(
                "PROMPT_MIN_CHARS ({}) is greater than PROMPT_MAX_CHARS ({})",
                self.prompt_min_chars,
                self.prompt_max_chars
            );
        }
        if !matches!(self.default_output_format.as_str(), "jpeg" | "png") {
            bail!(
                "DEFAULT_OUTPUT_FORMAT must be jpeg or png, got {}",
                self.default_output_format
            );
        }
        if self.safety_tolerance > 6 {
            bail!("SAFETY_TOLERANCE must be within 0..=6");
        }
        if self.max_image_size_mb == 0 {
            bail!("MAX_IMAGE_SIZE_MB must be at least 1");
        }
        Ok(())
    }

    pub fn is_admin(&self, user_id: u64) -> bool {
        self.admin_user_ids.contains(&user_id)
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            max_attempts: self.max_polling_attempts,
            prompt_min_chars: self.prompt_min_chars,
            prompt_max_chars: self.prompt_max_chars,
        }
    }

    pub fn poll_schedule(&self) -> PollSchedule {
        PollSchedule {
            backoff: self.poll_backoff,
            max_interval: Duration::from_secs(self.poll_max_interval_seconds),
            ..PollSchedule::fixed(Duration::from_secs(self.polling_interval_seconds))
        }
    }

    pub fn image_limits(&self) -> ImageLimits {
        ImageLimits {
            max_bytes: (self.max_image_size_mb as usize).saturating_mul(1024 * 1024),
            max_pixels: self.max_image_pixels,
        }
    }

    pub fn edit_options(&self) -> EditOptions {
        EditOptions {
            aspect_ratio: self.default_aspect_ratio.clone(),
            output_format: self.default_output_format.clone(),
            seed: None,
            safety_tolerance: self.safety_tolerance,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("не удалось прочитать config: {}", path))?;
    let cfg: Config =
        serde_json::from_str(&raw).with_context(|| format!("некорректный JSON: {}", path))?;
    Ok(cfg)
}
