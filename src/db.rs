use anyhow::Result;
use rusqlite::OptionalExtension;
use time::OffsetDateTime;
use tokio_rusqlite::Connection;

use crate::job::{EditJob, JobStatus};
use crate::runner::JobSink;

/// Данные профиля Telegram, обновляемые при каждом обращении пользователя.
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub telegram_id: u64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
}

impl UserProfile {
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name, &self.username) {
            (Some(first), Some(last), _) => format!("{first} {last}"),
            (Some(first), None, _) => first.clone(),
            (None, _, Some(username)) => format!("@{username}"),
            _ => format!("User {}", self.telegram_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRecord {
    pub is_new: bool,
    pub is_banned: bool,
}

/// Метаданные запроса, которые не входят в `EditJob`.
#[derive(Debug, Clone)]
pub struct NewEdit {
    pub telegram_user_id: u64,
    pub message_id: i32,
    pub prompt: String,
    pub edit_type: String,
    pub aspect_ratio: String,
    pub output_format: String,
    pub seed: Option<u64>,
    pub safety_tolerance: u8,
    pub input_size: usize,
    pub input_sha256: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecentEdit {
    pub prompt: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserStats {
    pub total_edits: i64,
    pub successful_edits: i64,
    pub failed_edits: i64,
    pub favorite_edit_types: Vec<(String, i64)>,
    pub recent_edits: Vec<RecentEdit>,
    pub member_since: Option<OffsetDateTime>,
    pub last_seen: Option<OffsetDateTime>,
}

impl UserStats {
    pub fn success_rate(&self) -> f64 {
        percent(self.successful_edits, self.total_edits)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GlobalStats {
    pub total_users: i64,
    pub banned_users: i64,
    pub total_edits: i64,
    pub successful_edits: i64,
    pub average_processing_secs: Option<f64>,
    pub top_edit_types: Vec<(String, i64)>,
}

impl GlobalStats {
    pub fn success_rate(&self) -> f64 {
        percent(self.successful_edits, self.total_edits)
    }
}

fn percent(part: i64, total: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64 * 1000.0).round() / 10.0
    }
}

fn unix(ts: OffsetDateTime) -> i64 {
    ts.unix_timestamp()
}

fn from_unix(secs: Option<i64>) -> Option<OffsetDateTime> {
    secs.and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok())
}

const TERMINAL_STATUSES: &str = "('ready','failed','cancelled','timed_out')";

#[derive(Clone)]
pub struct Db {
    conn: Connection,
}

impl Db {
/// Открывает (или создаёт) базу SQLite по пути `path` и гарантирует наличие схемы.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).await?;
        let db = Self { conn };
        db.init().await?;
        Ok(db)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init().await?;
        Ok(db)
    }

/// Инициализирует схему БД (идемпотентно):
/// - `users`: пользователи бота, флаг бана и счётчики правок;
/// - `image_edits`: журнал запросов на редактирование со снимком состояния задачи.
    async fn init(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode = WAL;
                    CREATE TABLE IF NOT EXISTS users (
                        telegram_id INTEGER PRIMARY KEY,
                        username TEXT,
                        first_name TEXT,
                        last_name TEXT,
                        language_code TEXT,
                        is_banned INTEGER NOT NULL DEFAULT 0,
                        total_edits INTEGER NOT NULL DEFAULT 0,
                        successful_edits INTEGER NOT NULL DEFAULT 0,
                        failed_edits INTEGER NOT NULL DEFAULT 0,
                        created_at INTEGER NOT NULL,
                        last_seen INTEGER NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS image_edits (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        job_id TEXT NOT NULL UNIQUE,
                        telegram_user_id INTEGER NOT NULL,
                        message_id INTEGER,
                        prompt TEXT NOT NULL,
                        edit_type TEXT NOT NULL,
                        aspect_ratio TEXT NOT NULL,
                        output_format TEXT NOT NULL,
                        seed INTEGER,
                        safety_tolerance INTEGER NOT NULL,
                        input_size INTEGER NOT NULL,
                        input_sha256 TEXT NOT NULL,
                        polling_url TEXT NOT NULL,
                        status TEXT NOT NULL,
                        attempt_count INTEGER NOT NULL DEFAULT 0,
                        result_url TEXT,
                        error_message TEXT,
                        submitted_at INTEGER NOT NULL,
                        started_at INTEGER,
                        completed_at INTEGER,
                        processing_secs REAL
                    );
                    CREATE INDEX IF NOT EXISTS idx_image_edits_user ON image_edits(telegram_user_id, submitted_at);
                    CREATE INDEX IF NOT EXISTS idx_image_edits_status ON image_edits(status);
                    "#,
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

/// Создаёт пользователя или обновляет профиль и `last_seen`.
/// Возвращает, новый ли это пользователь и не забанен ли он.
    pub async fn upsert_user(&self, profile: &UserProfile, now: OffsetDateTime) -> Result<UserRecord> {
        let p = profile.clone();
        let ts = unix(now);
        let record = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT is_banned FROM users WHERE telegram_id = ?1",
                        [p.telegram_id as i64],
                        |row| row.get(0),
                    )
                    .optional()?;
                let record = match existing {
                    Some(banned) => {
                        tx.execute(
                            "UPDATE users SET username = ?2, first_name = ?3, last_name = ?4, \
                             language_code = ?5, last_seen = ?6 WHERE telegram_id = ?1",
                            rusqlite::params![
                                p.telegram_id as i64,
                                p.username,
                                p.first_name,
                                p.last_name,
                                p.language_code,
                                ts
                            ],
                        )?;
                        UserRecord { is_new: false, is_banned: banned != 0 }
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO users(telegram_id, username, first_name, last_name, language_code, created_at, last_seen) \
                             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                            rusqlite::params![
                                p.telegram_id as i64,
                                p.username,
                                p.first_name,
                                p.last_name,
                                p.language_code,
                                ts
                            ],
                        )?;
                        UserRecord { is_new: true, is_banned: false }
                    }
                };
                tx.commit()?;
                Ok(record)
            })
            .await?;
        Ok(record)
    }

/// Ставит или снимает бан. `Ok(false)`, если пользователь неизвестен.
    pub async fn set_banned(&self, telegram_id: u64, banned: bool) -> Result<bool> {
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE users SET is_banned = ?2 WHERE telegram_id = ?1",
                    rusqlite::params![telegram_id as i64, banned as i64],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed > 0)
    }

    pub async fn insert_edit(&self, edit: &NewEdit, job: &EditJob) -> Result<()> {
        let e = edit.clone();
        let job_id = job.id().to_string();
        let polling_url = job.polling_endpoint().to_string();
        let status = job.status().as_str();
        let attempts = job.attempt_count() as i64;
        let submitted = unix(job.submitted_at());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO image_edits(job_id, telegram_user_id, message_id, prompt, edit_type, \
                     aspect_ratio, output_format, seed, safety_tolerance, input_size, input_sha256, \
                     polling_url, status, attempt_count, submitted_at) \
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    rusqlite::params![
                        job_id,
                        e.telegram_user_id as i64,
                        e.message_id,
                        e.prompt,
                        e.edit_type,
                        e.aspect_ratio,
                        e.output_format,
                        e.seed.map(|s| s as i64),
                        e.safety_tolerance,
                        e.input_size as i64,
                        e.input_sha256,
                        polling_url,
                        status,
                        attempts,
                        submitted
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

/// Сохраняет снимок задачи. При первом терминальном снимке в той же транзакции
/// обновляет счётчики владельца; повторные терминальные снимки счётчики не трогают.
    pub async fn save_job(&self, job: &EditJob) -> Result<()> {
        let job_id = job.id().to_string();
        let status = job.status();
        let attempts = job.attempt_count() as i64;
        let result_url = job.result_location().map(str::to_string);
        let error_message = job.error_detail().map(str::to_string);
        let started = job.started_at().map(unix);
        let completed = job.completed_at().map(unix);
        let processing = job.processing_time().map(|d| d.as_seconds_f64());

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let owner: Option<i64> = tx
                    .query_row(
                        &format!(
                            "SELECT telegram_user_id FROM image_edits \
                             WHERE job_id = ?1 AND status NOT IN {TERMINAL_STATUSES}"
                        ),
                        [&job_id],
                        |row| row.get(0),
                    )
                    .optional()?;

                tx.execute(
                    &format!(
                        "UPDATE image_edits SET status = ?2, attempt_count = ?3, result_url = ?4, \
                         error_message = ?5, started_at = ?6, completed_at = ?7, processing_secs = ?8 \
                         WHERE job_id = ?1 AND status NOT IN {TERMINAL_STATUSES}"
                    ),
                    rusqlite::params![
                        job_id,
                        status.as_str(),
                        attempts,
                        result_url,
                        error_message,
                        started,
                        completed,
                        processing
                    ],
                )?;

                if let (Some(user_id), true) = (owner, status.is_terminal()) {
                    bump_counters(&tx, user_id, status == JobStatus::Ready)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

/// Неудачная отправка: задачи нет, но попытка засчитывается пользователю.
    pub async fn record_failed_submission(&self, telegram_id: u64) -> Result<()> {
        self.conn
            .call(move |conn| {
                bump_counters(conn, telegram_id as i64, false)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn user_stats(&self, telegram_id: u64) -> Result<Option<UserStats>> {
        let id = telegram_id as i64;
        let stats = self
            .conn
            .call(move |conn| {
                let base = conn
                    .query_row(
                        "SELECT total_edits, successful_edits, failed_edits, created_at, last_seen \
                         FROM users WHERE telegram_id = ?1",
                        [id],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, i64>(1)?,
                                row.get::<_, i64>(2)?,
                                row.get::<_, Option<i64>>(3)?,
                                row.get::<_, Option<i64>>(4)?,
                            ))
                        },
                    )
                    .optional()?;
                let Some((total, ok, failed, created, seen)) = base else {
                    return Ok(None);
                };

                let mut stmt = conn.prepare(
                    "SELECT edit_type, COUNT(*) AS n FROM image_edits WHERE telegram_user_id = ?1 \
                     GROUP BY edit_type ORDER BY n DESC, edit_type ASC LIMIT 3",
                )?;
                let favorite = stmt
                    .query_map([id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut stmt = conn.prepare(
                    "SELECT prompt, status FROM image_edits WHERE telegram_user_id = ?1 \
                     ORDER BY submitted_at DESC, id DESC LIMIT 3",
                )?;
                let recent = stmt
                    .query_map([id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
                    .into_iter()
                    .filter_map(|(prompt, status)| {
                        JobStatus::parse(&status).map(|status| RecentEdit { prompt, status })
                    })
                    .collect();

                Ok(Some(UserStats {
                    total_edits: total,
                    successful_edits: ok,
                    failed_edits: failed,
                    favorite_edit_types: favorite,
                    recent_edits: recent,
                    member_since: from_unix(created),
                    last_seen: from_unix(seen),
                }))
            })
            .await?;
        Ok(stats)
    }

    pub async fn global_stats(&self) -> Result<GlobalStats> {
        let stats = self
            .conn
            .call(|conn| {
                let (total_users, banned_users): (i64, i64) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(is_banned), 0) FROM users",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let (total_edits, successful_edits): (i64, i64) = conn.query_row(
                    "SELECT COALESCE(SUM(total_edits), 0), COALESCE(SUM(successful_edits), 0) FROM users",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let average_processing_secs: Option<f64> = conn.query_row(
                    "SELECT AVG(processing_secs) FROM image_edits WHERE status = 'ready'",
                    [],
                    |row| row.get(0),
                )?;
                let mut stmt = conn.prepare(
                    "SELECT edit_type, COUNT(*) AS n FROM image_edits \
                     GROUP BY edit_type ORDER BY n DESC, edit_type ASC LIMIT 5",
                )?;
                let top_edit_types = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(GlobalStats {
                    total_users,
                    banned_users,
                    total_edits,
                    successful_edits,
                    average_processing_secs,
                    top_edit_types,
                })
            })
            .await?;
        Ok(stats)
    }

/// Идентификаторы незабаненных пользователей (для рассылки).
    pub async fn active_user_ids(&self) -> Result<Vec<u64>> {
        let ids = self
            .conn
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT telegram_id FROM users WHERE is_banned = 0 ORDER BY telegram_id")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, i64>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids.into_iter().map(|id| id as u64).collect())
    }

/// Задачи, оставшиеся незавершёнными после перезапуска, продолжать некому:
/// помечаем их `timed_out` и засчитываем владельцам как неудачные.
    pub async fn expire_unfinished(&self, now: OffsetDateTime) -> Result<usize> {
        let ts = unix(now);
        let expired = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let owners = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT telegram_user_id FROM image_edits WHERE status NOT IN {TERMINAL_STATUSES}"
                    ))?;
                    let owners = stmt
                        .query_map([], |row| row.get::<_, i64>(0))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    owners
                };
                tx.execute(
                    &format!(
                        "UPDATE image_edits SET status = 'timed_out', completed_at = ?1 \
                         WHERE status NOT IN {TERMINAL_STATUSES}"
                    ),
                    [ts],
                )?;
                for owner in &owners {
                    bump_counters(&tx, *owner, false)?;
                }
                tx.commit()?;
                Ok(owners.len())
            })
            .await?;
        Ok(expired)
    }

    #[cfg(test)]
    async fn edit_status(&self, job_id: &str) -> Result<Option<(String, i64)>> {
        let id = job_id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT status, attempt_count FROM image_edits WHERE job_id = ?1",
                        [id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(row)
    }
}

fn bump_counters(conn: &rusqlite::Connection, user_id: i64, success: bool) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET total_edits = total_edits + 1, \
         successful_edits = successful_edits + ?2, failed_edits = failed_edits + ?3 \
         WHERE telegram_id = ?1",
        rusqlite::params![user_id, success as i64, (!success) as i64],
    )?;
    Ok(())
}

impl JobSink for Db {
    async fn record(&self, job: &EditJob) -> Result<()> {
        self.save_job(job).await
    }
}
