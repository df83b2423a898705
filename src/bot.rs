use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use teloxide::dispatching::{UpdateFilterExt, UpdateHandler};
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::{
    FileId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, PhotoSize, User,
};
use teloxide::utils::command::BotCommands;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bfl::BflClient;
use crate::context::AppContext;
use crate::db::{NewEdit, UserProfile, UserRecord};
use crate::imaging::{classify_edit_type, guess_mime, humanize, sha256_hex, validate_image, EditType};
use crate::job::{EditJob, JobStatus};
use crate::logging::compact;
use crate::runner::{drive, Notifier};
use crate::session::{PendingImage, RateLimiter, Sessions};
use crate::tracker::TrackerSettings;

#[derive(Debug, BotCommands, Clone, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum BotCommand {
    #[command(description = "welcome message")]
    Start,
    #[command(description = "how to use the bot")]
    Help,
    #[command(description = "your editing statistics")]
    Stats,
    #[command(description = "about this bot")]
    About,
    #[command(description = "drop the pending image or stop the running edit")]
    Cancel,
}

#[derive(Debug, BotCommands, Clone)]
#[command(rename_rule = "snake_case", description = "Admin commands:")]
pub enum AdminCommand {
    #[command(description = "global statistics")]
    AdminStats,
    #[command(description = "ban a user: /ban <user_id>")]
    Ban(String),
    #[command(description = "unban a user: /unban <user_id>")]
    Unban(String),
    #[command(description = "message every active user: /broadcast <text>")]
    Broadcast(String),
    #[command(description = "this list")]
    AdminHelp,
}

const BROADCAST_PAUSE: Duration = Duration::from_millis(50);
const APOLOGY: &str = "Something went wrong while processing your request. Please try again.";
const BUSY: &str = "You already have an edit in progress. Wait for it or use /cancel.";

/// Дерево обработчиков: команды, админ-команды, фото, документы, текст и кнопки.
pub fn schema() -> UpdateHandler<anyhow::Error> {
    let messages = Update::filter_message()
        .branch(
            dptree::entry()
                .filter_command::<BotCommand>()
                .endpoint(handle_command),
        )
        .branch(
            dptree::entry()
                .filter_command::<AdminCommand>()
                .endpoint(handle_admin_command),
        )
        .branch(dptree::filter(|msg: Message| msg.photo().is_some()).endpoint(handle_photo))
        .branch(dptree::filter(|msg: Message| msg.document().is_some()).endpoint(handle_document))
        .branch(dptree::filter(|msg: Message| msg.text().is_some()).endpoint(handle_text));

    dptree::entry()
        .branch(messages)
        .branch(Update::filter_callback_query().endpoint(handle_callback))
}

/// Ошибка обработчика уходит в лог, пользователь получает общее извинение.
async fn reply_on_error<F, Fut>(handler: &str, result: Result<()>, apologize: F) -> Result<()>
where
    F: FnOnce(&'static str) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if let Err(err) = result {
        error!(handler, error = %err, "handler failed");
        apologize(APOLOGY).await?;
    }
    Ok(())
}

async fn send_text(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    bot.send_message(chat_id, text).await?;
    Ok(())
}

async fn handle_command(bot: Bot, msg: Message, cmd: BotCommand, ctx: Arc<AppContext>) -> Result<()> {
    info!(chat_id = %msg.chat.id, from = ?msg.from.as_ref().map(|u| u.id.0), command = ?cmd, "Command received");
    let result = match msg.from.as_ref() {
        Some(user) => on_command(&bot, msg.chat.id, user, cmd, &ctx).await,
        None => Ok(()),
    };
    reply_on_error("command", result, |text| send_text(&bot, msg.chat.id, text)).await
}

async fn handle_admin_command(
    bot: Bot,
    msg: Message,
    cmd: AdminCommand,
    ctx: Arc<AppContext>,
) -> Result<()> {
    let result = on_admin_command(&bot, &msg, cmd, &ctx).await;
    reply_on_error("admin_command", result, |text| send_text(&bot, msg.chat.id, text)).await
}

async fn handle_photo(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    let result = on_photo(&bot, &msg, &ctx).await;
    reply_on_error("photo", result, |text| send_text(&bot, msg.chat.id, text)).await
}

async fn handle_document(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    let result = on_document(&bot, &msg, &ctx).await;
    reply_on_error("document", result, |text| send_text(&bot, msg.chat.id, text)).await
}

async fn handle_text(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    let result = on_text(&bot, &msg, &ctx).await;
    reply_on_error("text", result, |text| send_text(&bot, msg.chat.id, text)).await
}

async fn handle_callback(bot: Bot, q: CallbackQuery, ctx: Arc<AppContext>) -> Result<()> {
    if let Err(err) = bot.answer_callback_query(q.id.clone()).await {
        debug!(error = %err, "failed to answer callback query");
    }
    let Some(chat_id) = q.message.as_ref().map(|m| m.chat().id) else {
        return Ok(());
    };
    info!(%chat_id, user_id = q.from.id.0, data = ?q.data, "Button pressed");
    let result = on_button(&bot, chat_id, &q.from, q.data.as_deref().unwrap_or_default(), &ctx).await;
    reply_on_error("callback", result, |text| send_text(&bot, chat_id, text)).await
}

fn profile_of(user: &User) -> UserProfile {
    UserProfile {
        telegram_id: user.id.0,
        username: user.username.clone(),
        first_name: Some(user.first_name.clone()),
        last_name: user.last_name.clone(),
        language_code: user.language_code.clone(),
    }
}

/// Регистрирует/обновляет пользователя. Забаненному отправляет уведомление и возвращает `None`.
async fn admit(bot: &Bot, chat_id: ChatId, user: &User, ctx: &AppContext) -> Result<Option<(UserProfile, UserRecord)>> {
    let profile = profile_of(user);
    let record = ctx.db.upsert_user(&profile, OffsetDateTime::now_utc()).await?;
    if record.is_new {
        info!(user_id = profile.telegram_id, username = ?profile.username, "new user registered");
    }
    if record.is_banned {
        warn!(user_id = profile.telegram_id, "banned user attempted access");
        bot.send_message(chat_id, "Your account has been suspended.")
            .await?;
        return Ok(None);
    }
    Ok(Some((profile, record)))
}

async fn admit_sender(bot: &Bot, msg: &Message, ctx: &AppContext) -> Result<Option<(UserProfile, UserRecord)>> {
    match msg.from.as_ref() {
        Some(user) => admit(bot, msg.chat.id, user, ctx).await,
        None => {
            debug!(chat_id = %msg.chat.id, "update without sender, ignored");
            Ok(None)
        }
    }
}

async fn on_command(bot: &Bot, chat_id: ChatId, user: &User, cmd: BotCommand, ctx: &AppContext) -> Result<()> {
    let Some((profile, record)) = admit(bot, chat_id, user, ctx).await? else {
        return Ok(());
    };
    let user_id = profile.telegram_id;

    match cmd {
        BotCommand::Start => {
            let mut text = format!(
                "Hi, {}! I am {}, an AI image editor.\n\n\
                 1. Send me a photo (or an image file).\n\
                 2. Then describe the change in plain words, e.g. \"Change the car color to red\".\n\n\
                 I will send back the edited image.",
                profile.display_name(),
                ctx.config.bot_username
            );
            if record.is_new {
                text.push_str("\n\nWelcome aboard! Use /help to see everything I can do.");
            }
            bot.send_message(chat_id, text).await?;
        }
        BotCommand::Help => {
            let text = format!(
                "{}\n\nHow to edit:\n\
                 • send a JPEG, PNG or WEBP image up to {} MB;\n\
                 • reply with an instruction of {} to {} characters.\n\n\
                 Examples:\n\
                 • Replace 'Hello' with 'Welcome'\n\
                 • Make the sky more dramatic\n\
                 • Turn it into a watercolor painting",
                BotCommand::descriptions(),
                ctx.config.max_image_size_mb,
                ctx.config.prompt_min_chars,
                ctx.config.prompt_max_chars
            );
            bot.send_message(chat_id, text).await?;
        }
        BotCommand::Stats => {
            let text = match ctx.db.user_stats(user_id).await? {
                Some(stats) if stats.total_edits > 0 => {
                    let mut text = format!(
                        "Your statistics:\n\n\
                         Total edits: {}\n\
                         Successful: {}\n\
                         Failed: {}\n\
                         Success rate: {:.1}%",
                        stats.total_edits,
                        stats.successful_edits,
                        stats.failed_edits,
                        stats.success_rate()
                    );
                    if !stats.favorite_edit_types.is_empty() {
                        text.push_str("\n\nFavorite edit types:");
                        for (kind, count) in &stats.favorite_edit_types {
                            text.push_str(&format!("\n• {}: {}", humanize(kind), count));
                        }
                    }
                    if !stats.recent_edits.is_empty() {
                        text.push_str("\n\nRecent edits:");
                        for edit in &stats.recent_edits {
                            text.push_str(&format!("\n• {} ({})", compact(&edit.prompt, 40), edit.status));
                        }
                    }
                    if let Some(since) = stats.member_since {
                        text.push_str(&format!("\n\nMember since: {}", since.date()));
                    }
                    text
                }
                _ => "You have not edited any images yet. Send me a photo to start!".to_string(),
            };
            bot.send_message(chat_id, text).await?;
        }
        BotCommand::About => {
            let text = format!(
                "{} v{}\n\n\
                 Edits images from a text instruction using the FLUX.1 Kontext model by Black Forest Labs.\n\
                 Environment: {}",
                ctx.config.bot_username,
                env!("CARGO_PKG_VERSION"),
                ctx.config.environment
            );
            bot.send_message(chat_id, text).await?;
        }
        BotCommand::Cancel => {
            let outcome = ctx.sessions.cancel(user_id).await;
            info!(user_id, ?outcome, "cancel requested");
            let text = if outcome.cancelled_job {
                "Stopping your current edit..."
            } else if outcome.dropped_image {
                "Pending image discarded. Send a new photo whenever you are ready."
            } else {
                "Nothing to cancel."
            };
            bot.send_message(chat_id, text).await?;
        }
    }
    Ok(())
}

async fn on_admin_command(bot: &Bot, msg: &Message, cmd: AdminCommand, ctx: &AppContext) -> Result<()> {
    let Some((profile, _)) = admit_sender(bot, msg, ctx).await? else {
        return Ok(());
    };
    if !ctx.config.is_admin(profile.telegram_id) {
        warn!(user_id = profile.telegram_id, command = ?cmd, "admin command from non-admin");
        bot.send_message(msg.chat.id, "This command is only available to administrators.")
            .await?;
        return Ok(());
    }
    info!(admin_id = profile.telegram_id, command = ?cmd, "Admin command received");

    match cmd {
        AdminCommand::AdminStats => {
            let stats = ctx.db.global_stats().await?;
            let mut text = format!(
                "Global statistics:\n\n\
                 Users: {} (banned: {})\n\
                 Edits: {}\n\
                 Success rate: {:.1}%",
                stats.total_users,
                stats.banned_users,
                stats.total_edits,
                stats.success_rate()
            );
            if let Some(avg) = stats.average_processing_secs {
                text.push_str(&format!("\nAverage processing time: {avg:.1}s"));
            }
            if !stats.top_edit_types.is_empty() {
                text.push_str("\n\nTop edit types:");
                for (kind, count) in &stats.top_edit_types {
                    text.push_str(&format!("\n• {}: {}", humanize(kind), count));
                }
            }
            bot.send_message(msg.chat.id, text).await?;
        }
        AdminCommand::Ban(raw) => set_ban(bot, msg, ctx, &raw, true).await?,
        AdminCommand::Unban(raw) => set_ban(bot, msg, ctx, &raw, false).await?,
        AdminCommand::Broadcast(text) => {
            let text = text.trim();
            if text.is_empty() {
                bot.send_message(msg.chat.id, "Usage: /broadcast <text>").await?;
                return Ok(());
            }
            let ids = ctx.db.active_user_ids().await?;
            let (mut sent, mut failed) = (0usize, 0usize);
            for id in ids {
                match bot.send_message(ChatId(id as i64), text).await {
                    Ok(_) => sent += 1,
                    Err(err) => {
                        debug!(user_id = id, error = %err, "broadcast: delivery failed");
                        failed += 1;
                    }
                }
                tokio::time::sleep(BROADCAST_PAUSE).await;
            }
            info!(sent, failed, "broadcast finished");
            bot.send_message(
                msg.chat.id,
                format!("Broadcast finished: {sent} delivered, {failed} failed."),
            )
            .await?;
        }
        AdminCommand::AdminHelp => {
            bot.send_message(msg.chat.id, AdminCommand::descriptions().to_string())
                .await?;
        }
    }
    Ok(())
}

async fn set_ban(bot: &Bot, msg: &Message, ctx: &AppContext, raw: &str, banned: bool) -> Result<()> {
    let verb = if banned { "ban" } else { "unban" };
    let Ok(target) = raw.trim().parse::<u64>() else {
        bot.send_message(msg.chat.id, format!("Usage: /{verb} <user_id>"))
            .await?;
        return Ok(());
    };
    let text = if ctx.db.set_banned(target, banned).await? {
        info!(target, banned, "user ban flag changed");
        format!("User {target}: {verb} applied.")
    } else {
        format!("User {target} not found.")
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

/// Что делает нажатая кнопка (`callback_data`).
#[derive(Debug, Clone, PartialEq, Eq)]
enum ButtonAction {
    Command(BotCommand),
    PromptHint(Option<EditType>),
    EditAgain,
}

impl ButtonAction {
    fn parse(data: &str) -> Option<Self> {
        let action = match data {
            "start" => ButtonAction::Command(BotCommand::Start),
            "help" => ButtonAction::Command(BotCommand::Help),
            "stats" => ButtonAction::Command(BotCommand::Stats),
            "about" => ButtonAction::Command(BotCommand::About),
            "prompt_color" => ButtonAction::PromptHint(Some(EditType::ColorChange)),
            "prompt_text" => ButtonAction::PromptHint(Some(EditType::TextEdit)),
            "prompt_background" => ButtonAction::PromptHint(Some(EditType::BackgroundChange)),
            "prompt_custom" => ButtonAction::PromptHint(None),
            "edit_again" => ButtonAction::EditAgain,
            _ => return None,
        };
        Some(action)
    }
}

fn prompt_hint(kind: Option<EditType>) -> &'static str {
    match kind {
        Some(EditType::ColorChange) => {
            "Tell me which object and which color, e.g. \"Change the car color to red\"."
        }
        Some(EditType::TextEdit) => {
            "Tell me the text to replace, e.g. \"Replace 'Hello' with 'Welcome'\"."
        }
        Some(EditType::BackgroundChange) => {
            "Describe the new background, e.g. \"Add a sunset background\"."
        }
        _ => "Type your own instruction, e.g. \"Remove the person from the image\".",
    }
}

fn prompt_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new([
        [InlineKeyboardButton::callback("🎨 Color Change", "prompt_color")],
        [InlineKeyboardButton::callback("📝 Text Edit", "prompt_text")],
        [InlineKeyboardButton::callback("🖼️ Background", "prompt_background")],
        [InlineKeyboardButton::callback("✏️ Custom Prompt", "prompt_custom")],
    ])
}

fn result_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new([
        [InlineKeyboardButton::callback("🔄 Edit Again", "edit_again")],
        [InlineKeyboardButton::callback("📊 My Stats", "stats")],
        [InlineKeyboardButton::callback("ℹ️ About", "about")],
    ])
}

async fn on_button(bot: &Bot, chat_id: ChatId, user: &User, data: &str, ctx: &AppContext) -> Result<()> {
    match ButtonAction::parse(data) {
        Some(ButtonAction::Command(cmd)) => on_command(bot, chat_id, user, cmd, ctx).await,
        Some(ButtonAction::PromptHint(kind)) => send_text(bot, chat_id, prompt_hint(kind)).await,
        Some(ButtonAction::EditAgain) => {
            send_text(bot, chat_id, "Send me the next photo you want to edit.").await
        }
        None => send_text(bot, chat_id, "Unknown command.").await,
    }
}

async fn on_photo(bot: &Bot, msg: &Message, ctx: &AppContext) -> Result<()> {
    let Some((profile, _)) = admit_sender(bot, msg, ctx).await? else {
        return Ok(());
    };
    let Some(photos) = msg.photo() else { return Ok(()); };

    // Choose the biggest photo variant
    let Some(best) = photos
        .iter()
        .max_by_key(|p: &&PhotoSize| p.width as u64 * p.height as u64)
    else {
        return Ok(());
    };

    info!(
        chat_id = %msg.chat.id,
        user_id = profile.telegram_id,
        count = photos.len(),
        chosen_w = best.width,
        chosen_h = best.height,
        "Photo received"
    );
    accept_image(bot, msg, ctx, profile.telegram_id, best.file.id.clone()).await
}

async fn on_document(bot: &Bot, msg: &Message, ctx: &AppContext) -> Result<()> {
    let Some((profile, _)) = admit_sender(bot, msg, ctx).await? else {
        return Ok(());
    };
    let Some(doc) = msg.document() else { return Ok(()); };

    let is_image = doc
        .mime_type
        .as_ref()
        .is_some_and(|m| m.essence_str().starts_with("image/"));
    if !is_image {
        bot.send_message(msg.chat.id, "Please send an image file (JPEG, PNG or WEBP).")
            .await?;
        return Ok(());
    }
    let limits = ctx.config.image_limits();
    if doc.file.size as usize > limits.max_bytes {
        bot.send_message(
            msg.chat.id,
            format!(
                "This file is too large. The maximum size is {} MB.",
                ctx.config.max_image_size_mb
            ),
        )
        .await?;
        return Ok(());
    }

    info!(
        chat_id = %msg.chat.id,
        user_id = profile.telegram_id,
        file_name = ?doc.file_name,
        size = doc.file.size,
        "Image document received"
    );
    accept_image(bot, msg, ctx, profile.telegram_id, doc.file.id.clone()).await
}

/// Скачивает файл, проверяет его и сохраняет как ожидающее изображение пользователя.
async fn accept_image(bot: &Bot, msg: &Message, ctx: &AppContext, user_id: u64, file_id: FileId) -> Result<()> {
    let bytes = download_telegram_file(bot, ctx, file_id).await?;
    let info = match validate_image(&bytes, &ctx.config.image_limits()) {
        Ok(info) => info,
        Err(err) => {
            warn!(user_id, error = %err, "image rejected");
            bot.send_message(msg.chat.id, format!("I can't use this image: {err}."))
                .await?;
            return Ok(());
        }
    };
    debug!(user_id, w = info.width, h = info.height, mime = info.mime(), "Image validated");

    ctx.sessions
        .set_pending(
            user_id,
            PendingImage {
                bytes,
                info,
                message_id: msg.id.0,
            },
        )
        .await;
    bot.send_message(
        msg.chat.id,
        format!(
            "Got it! ({}x{}, {}, {:.1} MB)\n\nNow tell me what to change: pick a quick option below or type your own instruction.",
            info.width,
            info.height,
            info.format_name(),
            info.size_mb()
        ),
    )
    .reply_markup(prompt_keyboard())
    .await?;
    Ok(())
}

async fn download_telegram_file(bot: &Bot, ctx: &AppContext, file_id: FileId) -> Result<Vec<u8>> {
    let file = bot.get_file(file_id).await?;
    let bytes = ctx
        .http
        .get(ctx.telegram_file_url(&file.path))
        .send()
        .await
        .context("failed to download image")?
        .error_for_status()
        .context("telegram file request failed")?
        .bytes()
        .await
        .context("failed to read image bytes")?;
    debug!(size = bytes.len(), "Image downloaded");
    Ok(bytes.to_vec())
}

/// Почему текстовая инструкция не может быть запущена прямо сейчас.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PromptRejection {
    NoImage,
    Length { len: usize, min: usize, max: usize },
    Busy,
    RateLimited(Duration),
}

impl PromptRejection {
    fn message(&self) -> String {
        match self {
            PromptRejection::NoImage => "Please send a photo first, then describe the edit.".to_string(),
            PromptRejection::Length { len, min, max } => {
                format!("Please describe your edit in {min} to {max} characters (you sent {len}).")
            }
            PromptRejection::Busy => BUSY.to_string(),
            PromptRejection::RateLimited(wait) => {
                format!("Too many requests. Please wait {} seconds.", wait.as_secs().max(1))
            }
        }
    }
}

/// Проверки перед запуском, по порядку: изображение, длина, активная задача, лимит.
/// Лимит расходуется только если все предыдущие проверки пройдены.
async fn check_prompt(
    sessions: &Sessions,
    limiter: &RateLimiter,
    settings: &TrackerSettings,
    user_id: u64,
    prompt: &str,
    now: Instant,
) -> Result<(), PromptRejection> {
    if !sessions.has_pending(user_id).await {
        return Err(PromptRejection::NoImage);
    }
    let len = prompt.chars().count();
    if len < settings.prompt_min_chars || len > settings.prompt_max_chars {
        return Err(PromptRejection::Length {
            len,
            min: settings.prompt_min_chars,
            max: settings.prompt_max_chars,
        });
    }
    if sessions.has_active_job(user_id).await {
        return Err(PromptRejection::Busy);
    }
    limiter
        .check(user_id, now)
        .await
        .map_err(PromptRejection::RateLimited)
}

async fn on_text(bot: &Bot, msg: &Message, ctx: &Arc<AppContext>) -> Result<()> {
    let Some((profile, _)) = admit_sender(bot, msg, ctx).await? else {
        return Ok(());
    };
    let user_id = profile.telegram_id;
    let Some(text) = msg.text() else { return Ok(()); };

    if text.starts_with('/') {
        bot.send_message(msg.chat.id, "Unknown command. Use /help to see what I can do.")
            .await?;
        return Ok(());
    }

    let prompt = text.trim();
    let checked = check_prompt(
        &ctx.sessions,
        &ctx.rate_limiter,
        ctx.tracker.settings(),
        user_id,
        prompt,
        Instant::now(),
    )
    .await;
    if let Err(rejection) = checked {
        info!(user_id, ?rejection, "prompt rejected");
        bot.send_message(msg.chat.id, rejection.message()).await?;
        return Ok(());
    }

    let started = ctx
        .sessions
        .with_job_slot(user_id, |cancel| start_edit(bot, msg.chat.id, ctx, user_id, prompt, cancel))
        .await;
    match started {
        Some(outcome) => {
            outcome?;
        }
        None => {
            bot.send_message(msg.chat.id, BUSY).await?;
        }
    }
    Ok(())
}

/// Отправляет задачу и запускает фоновый опрос. `Ok(true)`, если опрос запущен.
async fn start_edit(
    bot: &Bot,
    chat_id: ChatId,
    ctx: &Arc<AppContext>,
    user_id: u64,
    prompt: &str,
    cancel: CancellationToken,
) -> Result<bool> {
    let Some(pending) = ctx.sessions.take_pending(user_id).await else {
        bot.send_message(chat_id, PromptRejection::NoImage.message()).await?;
        return Ok(false);
    };

    let edit_type = classify_edit_type(prompt);
    let status_msg = bot
        .send_message(chat_id, format!("Processing your edit ({})...", edit_type.label()))
        .await?;

    let options = ctx.config.edit_options();
    let job = match ctx.tracker.submit(&pending.bytes, prompt, &options).await {
        Ok(job) => job,
        Err(err) => {
            error!(user_id, error = %err, "edit submission failed");
            if let Err(db_err) = ctx.db.record_failed_submission(user_id).await {
                warn!(user_id, error = %db_err, "failed to record failed submission");
            }
            bot.edit_message_text(chat_id, status_msg.id, err.user_message())
                .await?;
            return Ok(false);
        }
    };

    let edit = NewEdit {
        telegram_user_id: user_id,
        message_id: pending.message_id,
        prompt: prompt.to_string(),
        edit_type: edit_type.as_str().to_string(),
        aspect_ratio: options.aspect_ratio.clone(),
        output_format: options.output_format.clone(),
        seed: options.seed,
        safety_tolerance: options.safety_tolerance,
        input_size: pending.bytes.len(),
        input_sha256: sha256_hex(&pending.bytes),
    };
    if let Err(err) = ctx.db.insert_edit(&edit, &job).await {
        warn!(job_id = %job.id(), error = %err, "failed to store edit record");
    }
    info!(user_id, job_id = %job.id(), edit_type = edit_type.as_str(), "edit job started");

    let notifier = ChatNotifier {
        bot: bot.clone(),
        api: ctx.tracker.api().clone(),
        chat_id,
        status_message: status_msg.id,
        prompt: prompt.to_string(),
        edit_type,
    };
    let bot = bot.clone();
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let schedule = ctx.config.poll_schedule();
        let outcome = drive(&ctx.tracker, job, &schedule, &cancel, &ctx.db, &notifier).await;
        ctx.sessions.finish_job(user_id).await;
        if let Err(err) = outcome {
            error!(user_id, error = %err, "edit job aborted");
            if let Err(send_err) = bot
                .edit_message_text(chat_id, status_msg.id, err.user_message())
                .await
            {
                warn!(user_id, error = %send_err, "failed to report aborted job");
            }
        }
    });
    Ok(true)
}

fn result_caption(prompt: &str, edit_type: EditType, job: &EditJob) -> String {
    let mut caption = format!(
        "Edit complete!\n\nPrompt: {}\nType: {}",
        compact(prompt, 200),
        edit_type.label()
    );
    if let Some(took) = job.processing_time() {
        caption.push_str(&format!("\nProcessing time: {:.1}s", took.as_seconds_f64()));
    }
    caption
}

/// Текст для статусного сообщения, если задача закончилась без изображения.
fn unfinished_text(job: &EditJob) -> Option<String> {
    match job.status() {
        JobStatus::Failed => Some(format!(
            "Sorry, the edit failed: {}\n\nTry a different prompt or image.",
            compact(job.error_detail().unwrap_or("unknown error"), 300)
        )),
        JobStatus::Cancelled => Some("Edit cancelled.".to_string()),
        JobStatus::TimedOut => {
            Some("Your edit is taking too long. Please try again later.".to_string())
        }
        JobStatus::Ready | JobStatus::Pending | JobStatus::Processing => None,
    }
}

/// Доставляет результат задачи в чат, из которого она была запущена.
struct ChatNotifier {
    bot: Bot,
    api: BflClient,
    chat_id: ChatId,
    status_message: MessageId,
    prompt: String,
    edit_type: EditType,
}

impl ChatNotifier {
    async fn replace_status(&self, text: String) -> Result<()> {
        self.bot
            .edit_message_text(self.chat_id, self.status_message, text)
            .await?;
        Ok(())
    }

    async fn deliver(&self, job: &EditJob, url: &str) -> Result<()> {
        let bytes = self.api.download_image(url).await?;
        let ext = guess_mime(&bytes).trim_start_matches("image/");
        self.bot
            .send_photo(self.chat_id, InputFile::memory(bytes).file_name(format!("edited.{ext}")))
            .caption(result_caption(&self.prompt, self.edit_type, job))
            .reply_markup(result_keyboard())
            .await?;
        if let Err(err) = self.bot.delete_message(self.chat_id, self.status_message).await {
            debug!(error = %err, "failed to delete status message");
        }
        Ok(())
    }
}

impl Notifier for ChatNotifier {
    async fn job_finished(&self, job: &EditJob) -> Result<()> {
        if let Some(text) = unfinished_text(job) {
            return self.replace_status(text).await;
        }
        if job.status() != JobStatus::Ready {
            return Ok(());
        }
        let Some(url) = job.result_location() else {
            return self
                .replace_status("The edit finished but no image was returned. Please try again.".into())
                .await;
        };
        if let Err(err) = self.deliver(job, url).await {
            warn!(job_id = %job.id(), error = %err, "failed to deliver result image");
            self.replace_status(format!(
                "Your image is ready, but I couldn't upload it here. Download it within 10 minutes:\n{url}"
            ))
            .await?;
        }
        Ok(())
    }
}
