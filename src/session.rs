use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::imaging::ImageInfo;

/// Изображение, присланное пользователем и ожидающее текстовой инструкции.
#[derive(Debug, Clone)]
pub struct PendingImage {
    pub bytes: Vec<u8>,
    pub info: ImageInfo,
    pub message_id: i32,
}

#[derive(Debug, Default)]
struct UserSession {
    pending: Option<PendingImage>,
    active: Option<CancellationToken>,
}

/// Состояние диалогов в памяти процесса: ожидающие изображения и активные задачи.
/// На пользователя допускается не больше одной задачи одновременно.
#[derive(Debug, Default)]
pub struct Sessions {
    inner: Mutex<HashMap<u64, UserSession>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Заменяет ранее сохранённое изображение, если оно было.
    pub async fn set_pending(&self, user_id: u64, image: PendingImage) {
        let mut guard = self.inner.lock().await;
        guard.entry(user_id).or_default().pending = Some(image);
    }

    pub async fn has_pending(&self, user_id: u64) -> bool {
        let guard = self.inner.lock().await;
        guard.get(&user_id).is_some_and(|s| s.pending.is_some())
    }

    pub async fn take_pending(&self, user_id: u64) -> Option<PendingImage> {
        let mut guard = self.inner.lock().await;
        guard.get_mut(&user_id).and_then(|s| s.pending.take())
    }

    /// Регистрирует задачу пользователя. `None`, если у него уже есть активная.
    pub async fn begin_job(&self, user_id: u64) -> Option<CancellationToken> {
        let mut guard = self.inner.lock().await;
        let session = guard.entry(user_id).or_default();
        if session.active.is_some() {
            return None;
        }
        let token = CancellationToken::new();
        session.active = Some(token.clone());
        Some(token)
    }

    /// Занимает слот задачи и выполняет `start` с токеном отмены.
    ///
    /// `Ok(true)` значит, что слот передан фоновой задаче и та освободит его сама.
    /// При `Ok(false)` или ошибке слот освобождается здесь же.
    /// `None`, если у пользователя уже есть активная задача.
    pub async fn with_job_slot<F, Fut>(&self, user_id: u64, start: F) -> Option<anyhow::Result<bool>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        let token = self.begin_job(user_id).await?;
        let outcome = start(token).await;
        if !matches!(outcome, Ok(true)) {
            self.finish_job(user_id).await;
        }
        Some(outcome)
    }

    pub async fn finish_job(&self, user_id: u64) {
        let mut guard = self.inner.lock().await;
        if let Some(session) = guard.get_mut(&user_id) {
            session.active = None;
            if session.pending.is_none() {
                guard.remove(&user_id);
            }
        }
    }

    pub async fn has_active_job(&self, user_id: u64) -> bool {
        let guard = self.inner.lock().await;
        guard.get(&user_id).is_some_and(|s| s.active.is_some())
    }

    /// `/cancel`: сбрасывает ожидающее изображение и поднимает флаг отмены активной задачи.
    pub async fn cancel(&self, user_id: u64) -> CancelOutcome {
        let mut guard = self.inner.lock().await;
        let Some(session) = guard.get_mut(&user_id) else {
            return CancelOutcome::default();
        };
        let dropped_image = session.pending.take().is_some();
        let cancelled_job = match &session.active {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        };
        CancelOutcome { dropped_image, cancelled_job }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelOutcome {
    pub dropped_image: bool,
    pub cancelled_job: bool,
}

impl CancelOutcome {
    pub fn is_noop(&self) -> bool {
        !self.dropped_image && !self.cancelled_job
    }
}

/// Скользящее окно: не больше `limit` запросов за `window` на пользователя.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: Mutex<HashMap<u64, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn per_minute(limit: usize) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Засчитывает запрос, если он укладывается в лимит.
    /// Иначе возвращает, через сколько освободится место.
    pub async fn check(&self, user_id: u64, now: Instant) -> Result<(), Duration> {
        if self.limit == 0 {
            return Ok(());
        }
        let mut guard = self.hits.lock().await;
        for hits in guard.values_mut() {
            while hits
                .front()
                .is_some_and(|&oldest| now.saturating_duration_since(oldest) >= self.window)
            {
                hits.pop_front();
            }
        }
        guard.retain(|_, hits| !hits.is_empty());

        let hits = guard.entry(user_id).or_default();
        if hits.len() >= self.limit {
            let oldest = hits.front().copied().unwrap_or(now);
            return Err(self.window.saturating_sub(now.saturating_duration_since(oldest)));
        }
        hits.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
impl RateLimiter {
    async fn tracked_users(&self) -> usize {
        self.hits.lock().await.len()
    }
}
