mod bfl;
mod bot;
mod config;
mod context;
mod db;
mod health;
mod imaging;
mod job;
mod logging;
mod runner;
mod session;
mod tracker;

use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands as _;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::bot::{schema, BotCommand};
use crate::config::Config;
use crate::context::AppContext;
use crate::db::Db;
use crate::health::HealthState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init_logging();

    // Parse CLI args for --config-json
    let mut config_json_arg: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some(rest) = arg.strip_prefix("--config-json=") {
            config_json_arg = Some(rest.to_string());
            break;
        }
        if arg == "--config-json" {
            config_json_arg = args.next();
            break;
        }
    }

    let config = if let Some(json) = config_json_arg {
        info!("Loading config from --config-json");
        Config::from_json_str(&json).context("failed to parse --config-json")?
    } else {
        Config::load().context("failed to load config")?
    };
    info!(
        environment = %config.environment,
        model = %config.bfl_model_path,
        max_attempts = config.max_polling_attempts,
        interval_secs = config.polling_interval_seconds,
        backoff = ?config.poll_backoff,
        admins = config.admin_user_ids.len(),
        "Config loaded"
    );

    let db = Db::open(&config.db_path).await.context("failed to open sqlite db")?;
    let expired = db.expire_unfinished(OffsetDateTime::now_utc()).await?;
    if expired > 0 {
        warn!(expired, "jobs left unfinished by a previous run marked as timed out");
    }

    if let Some(port) = config.health_port {
        let state = Arc::new(HealthState {
            db: db.clone(),
            service: config.bot_username.clone(),
            environment: config.environment.clone(),
        });
        tokio::spawn(async move {
            if let Err(err) = health::serve(port, state).await {
                error!(error = %err, "Health endpoint failed");
            }
        });
    }

    let bot = Bot::new(config.telegram_bot_token.clone());
    let ctx = Arc::new(AppContext::new(config, db)?);

    // Log bot identity
    match bot.get_me().await {
        Ok(me) => {
            info!(
                id = me.id.0,
                username = me.user.username.as_deref().unwrap_or(""),
                "Bot started"
            );
        }
        Err(err) => warn!(error = %err, "Failed to fetch bot info"),
    }
    if let Err(err) = bot.set_my_commands(BotCommand::bot_commands()).await {
        warn!(error = %err, "Failed to register bot commands");
    }

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![ctx])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Bot stopped");
    Ok(())
}
