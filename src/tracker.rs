use std::future::Future;

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::bfl::{BflError, EditOptions, EditRequest, Submission};
use crate::imaging::encode_base64;
use crate::job::{EditJob, InvalidTransition, JobStatus, RemoteStatus};

/// Источник текущего времени; в тестах подменяется фиксированными часами.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// The two remote calls the tracker needs from the editing service.
pub trait EditApi: Send + Sync {
    fn submit(
        &self,
        request: &EditRequest,
    ) -> impl Future<Output = Result<Submission, BflError>> + Send;

    fn fetch_status(
        &self,
        polling_url: &str,
    ) -> impl Future<Output = Result<RemoteStatus, BflError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    pub max_attempts: u32,
    pub prompt_min_chars: usize,
    pub prompt_max_chars: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 150,
            prompt_min_chars: 3,
            prompt_max_chars: 500,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("prompt must be {min}..={max} characters, got {len}")]
    PromptLength { len: usize, min: usize, max: usize },

    #[error(transparent)]
    Api(#[from] BflError),
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("submission failed: {0}")]
    Submission(#[from] SubmissionError),

    #[error("poll attempt {attempt} failed: {source}")]
    TransientPoll {
        attempt: u32,
        #[source]
        source: BflError,
    },

    #[error("job {job_id} timed out after {attempts} polls")]
    PollTimeout { job_id: String, attempts: u32 },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl TrackerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrackerError::TransientPoll { .. })
    }

    /// Text that can be shown to the end user as-is.
    pub fn user_message(&self) -> String {
        match self {
            TrackerError::Submission(SubmissionError::PromptLength { min, max, .. }) => {
                format!("Please describe your edit in {min} to {max} characters.")
            }
            TrackerError::Submission(SubmissionError::Api(_)) => {
                "The image editing service rejected the request. Please try again with a different image or prompt.".to_string()
            }
            TrackerError::TransientPoll { .. } => {
                "The image editing service is not responding right now. Still trying...".to_string()
            }
            TrackerError::PollTimeout { .. } => {
                "Your edit is taking too long. Please try again later.".to_string()
            }
            TrackerError::InvalidTransition(_) => {
                "Something went wrong on our side. Please try again.".to_string()
            }
        }
    }
}

/// Ведёт одну задачу от отправки до терминального статуса.
///
/// Трекер не владеет таймером и не хранит задачи: вызывающий код сам решает,
/// когда вызывать `poll`, и сохраняет каждый снимок `EditJob`.
pub struct EditJobTracker<A, C = SystemClock> {
    api: A,
    clock: C,
    settings: TrackerSettings,
}

impl<A: EditApi, C: Clock> EditJobTracker<A, C> {
    pub fn new(api: A, clock: C, settings: TrackerSettings) -> Self {
        Self { api, clock, settings }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub async fn submit(
        &self,
        image: &[u8],
        prompt: &str,
        options: &EditOptions,
    ) -> Result<EditJob, TrackerError> {
        let prompt = prompt.trim();
        let len = prompt.chars().count();
        if len < self.settings.prompt_min_chars || len > self.settings.prompt_max_chars {
            return Err(SubmissionError::PromptLength {
                len,
                min: self.settings.prompt_min_chars,
                max: self.settings.prompt_max_chars,
            }
            .into());
        }

        let request = EditRequest::new(prompt, encode_base64(image), options);
        let submission = self
            .api
            .submit(&request)
            .await
            .map_err(SubmissionError::Api)?;

        let job = EditJob::new(submission.id, submission.polling_url, self.clock.now());
        info!(job_id = %job.id(), image_size = image.len(), "tracker: job submitted");
        Ok(job)
    }

    /// One status request. The attempt counts against the budget whatever its outcome.
    pub async fn poll(&self, job: &mut EditJob) -> Result<JobStatus, TrackerError> {
        job.check_open(JobStatus::Processing)?;

        if job.attempt_count() >= self.settings.max_attempts {
            return Err(self.expire(job)?);
        }

        let fetched = self.api.fetch_status(job.polling_endpoint()).await;
        job.record_attempt();
        let attempt = job.attempt_count();

        match fetched {
            Ok(remote) => {
                debug!(job_id = %job.id(), attempt, remote = ?remote, "tracker: poll result");
                let previous = job.status();
                job.apply_remote(remote, self.clock.now())?;
                if job.status() != previous {
                    info!(job_id = %job.id(), from = %previous, to = %job.status(), attempt, "tracker: status changed");
                }
                if job.is_terminal() {
                    return Ok(job.status());
                }
                if attempt >= self.settings.max_attempts {
                    return Err(self.expire(job)?);
                }
                Ok(job.status())
            }
            Err(source) => {
                warn!(job_id = %job.id(), attempt, error = %source, "tracker: poll failed");
                if attempt >= self.settings.max_attempts {
                    return Err(self.expire(job)?);
                }
                Err(TrackerError::TransientPoll { attempt, source })
            }
        }
    }

    pub fn cancel(&self, job: &mut EditJob) -> Result<(), TrackerError> {
        job.cancel(self.clock.now())?;
        info!(job_id = %job.id(), attempts = job.attempt_count(), "tracker: job cancelled");
        Ok(())
    }

    fn expire(&self, job: &mut EditJob) -> Result<TrackerError, TrackerError> {
        job.time_out(self.clock.now())?;
        warn!(job_id = %job.id(), attempts = job.attempt_count(), "tracker: attempt budget exhausted");
        Ok(TrackerError::PollTimeout {
            job_id: job.id().to_string(),
            attempts: job.attempt_count(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use time::OffsetDateTime;

    use super::*;

    /// Fake API answering polls from a script; an exhausted script keeps answering `Processing`.
    pub struct ScriptedApi {
        pub submit_result: Mutex<Option<Result<Submission, BflError>>>,
        pub polls: Mutex<VecDeque<Result<RemoteStatus, BflError>>>,
        pub submitted: Mutex<Vec<String>>,
        pub poll_calls: Mutex<u32>,
    }

    impl ScriptedApi {
        pub fn new(polls: Vec<Result<RemoteStatus, BflError>>) -> Self {
            Self {
                submit_result: Mutex::new(None),
                polls: Mutex::new(polls.into()),
                submitted: Mutex::new(Vec::new()),
                poll_calls: Mutex::new(0),
            }
        }

        pub fn statuses(polls: Vec<RemoteStatus>) -> Self {
            Self::new(polls.into_iter().map(Ok).collect())
        }

        pub fn poll_calls(&self) -> u32 {
            *self.poll_calls.lock().unwrap()
        }
    }

    impl EditApi for ScriptedApi {
        async fn submit(&self, request: &EditRequest) -> Result<Submission, BflError> {
            self.submitted.lock().unwrap().push(request.prompt.clone());
            self.submit_result.lock().unwrap().take().unwrap_or_else(|| {
                Ok(Submission {
                    id: "job-1".into(),
                    polling_url: "https://api.example/v1/get_result?id=job-1".into(),
                })
            })
        }

        async fn fetch_status(&self, _polling_url: &str) -> Result<RemoteStatus, BflError> {
            *self.poll_calls.lock().unwrap() += 1;
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(RemoteStatus::Processing))
        }
    }

    pub struct FixedClock(pub OffsetDateTime);

    impl Clock for FixedClock {
        fn now(&self) -> OffsetDateTime {
            self.0
        }
    }

    pub fn transient() -> BflError {
        BflError::Status { status: 503, body: "upstream unavailable".into() }
    }

    pub fn tracker(api: ScriptedApi, max_attempts: u32) -> EditJobTracker<ScriptedApi, FixedClock> {
        EditJobTracker::new(
            api,
            FixedClock(time::macros::datetime!(2025-03-01 12:00 UTC)),
            TrackerSettings { max_attempts, ..TrackerSettings::default() },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn ready() -> RemoteStatus {
        RemoteStatus::Ready { sample: "https://delivery.example/out.jpg".into() }
    }

    async fn submitted(t: &EditJobTracker<ScriptedApi, FixedClock>) -> EditJob {
        t.submit(b"\x89PNG fake", "make the car red", &EditOptions::default())
            .await
            .expect("отправка должна пройти")
    }

    #[tokio::test]
    async fn submit_creates_pending_job() {
        let t = tracker(ScriptedApi::statuses(vec![]), 3);
        let job = submitted(&t).await;
        assert_eq!(job.id(), "job-1");
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.attempt_count(), 0);
        assert_eq!(job.polling_endpoint(), "https://api.example/v1/get_result?id=job-1");
    }

    #[tokio::test]
    async fn submit_rejects_prompt_outside_bounds_without_calling_api() {
        let t = tracker(ScriptedApi::statuses(vec![]), 3);
        let err = t.submit(b"img", "  hi  ", &EditOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Submission(SubmissionError::PromptLength { len: 2, min: 3, max: 500 })
        ));
        let long = "x".repeat(501);
        assert!(t.submit(b"img", &long, &EditOptions::default()).await.is_err());
        assert!(t.api.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_api_failure_creates_no_job() {
        let api = ScriptedApi::statuses(vec![]);
        *api.submit_result.lock().unwrap() =
            Some(Err(BflError::InvalidResponse("missing id".into())));
        let t = tracker(api, 3);
        let err = t.submit(b"img", "add a sunset", &EditOptions::default()).await.unwrap_err();
        assert!(matches!(err, TrackerError::Submission(SubmissionError::Api(_))));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn processing_processing_ready_ends_ready_after_three() {
        let t = tracker(
            ScriptedApi::statuses(vec![RemoteStatus::Processing, RemoteStatus::Processing, ready()]),
            3,
        );
        let mut job = submitted(&t).await;
        assert_eq!(t.poll(&mut job).await.unwrap(), JobStatus::Processing);
        assert_eq!(t.poll(&mut job).await.unwrap(), JobStatus::Processing);
        assert_eq!(t.poll(&mut job).await.unwrap(), JobStatus::Ready);
        assert_eq!(job.attempt_count(), 3);
        assert_eq!(job.result_location(), Some("https://delivery.example/out.jpg"));
        assert!(job.completed_at().is_some());
    }

    #[tokio::test]
    async fn three_processing_polls_time_out() {
        let t = tracker(
            ScriptedApi::statuses(vec![RemoteStatus::Processing; 3]),
            3,
        );
        let mut job = submitted(&t).await;
        t.poll(&mut job).await.unwrap();
        t.poll(&mut job).await.unwrap();
        let err = t.poll(&mut job).await.unwrap_err();
        assert!(matches!(err, TrackerError::PollTimeout { attempts: 3, .. }));
        assert_eq!(job.status(), JobStatus::TimedOut);
        assert_eq!(job.attempt_count(), 3);
        assert!(job.completed_at().is_some());
        assert!(job.result_location().is_none());
        assert!(job.error_detail().is_none());
    }

    #[tokio::test]
    async fn ready_on_attempt_k_wins() {
        for k in 1..=4u32 {
            let mut script = vec![RemoteStatus::Queued; (k - 1) as usize];
            script.push(ready());
            let t = tracker(ScriptedApi::statuses(script), 4);
            let mut job = submitted(&t).await;
            let mut last = Ok(JobStatus::Pending);
            while !job.is_terminal() {
                last = t.poll(&mut job).await;
            }
            assert_eq!(last.unwrap(), JobStatus::Ready, "k = {k}");
            assert_eq!(job.attempt_count(), k);
        }
    }

    #[tokio::test]
    async fn transient_error_keeps_status_but_counts_attempt() {
        let t = tracker(
            ScriptedApi::new(vec![Ok(RemoteStatus::Processing), Err(transient()), Ok(ready())]),
            5,
        );
        let mut job = submitted(&t).await;
        t.poll(&mut job).await.unwrap();

        let err = t.poll(&mut job).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, TrackerError::TransientPoll { attempt: 2, .. }));
        assert_eq!(job.status(), JobStatus::Processing);
        assert_eq!(job.attempt_count(), 2);

        assert_eq!(t.poll(&mut job).await.unwrap(), JobStatus::Ready);
        assert_eq!(job.attempt_count(), 3);
    }

    #[tokio::test]
    async fn transient_error_on_last_attempt_times_out() {
        let t = tracker(ScriptedApi::new(vec![Ok(RemoteStatus::Queued), Err(transient())]), 2);
        let mut job = submitted(&t).await;
        t.poll(&mut job).await.unwrap();
        let err = t.poll(&mut job).await.unwrap_err();
        assert!(matches!(err, TrackerError::PollTimeout { .. }));
        assert_eq!(job.status(), JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn remote_error_fails_job() {
        let t = tracker(
            ScriptedApi::statuses(vec![RemoteStatus::Error { message: "Request Moderated".into() }]),
            3,
        );
        let mut job = submitted(&t).await;
        assert_eq!(t.poll(&mut job).await.unwrap(), JobStatus::Failed);
        assert_eq!(job.error_detail(), Some("Request Moderated"));
        assert_eq!(job.attempt_count(), 1);
    }

    #[tokio::test]
    async fn poll_on_terminal_job_is_rejected_without_network() {
        let t = tracker(ScriptedApi::statuses(vec![ready()]), 3);
        let mut job = submitted(&t).await;
        t.poll(&mut job).await.unwrap();
        let calls = t.api.poll_calls();

        let err = t.poll(&mut job).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidTransition(_)));
        assert_eq!(job.attempt_count(), 1);
        assert_eq!(t.api.poll_calls(), calls);
        assert!(t.cancel(&mut job).is_err());
    }

    #[tokio::test]
    async fn cancel_before_any_poll() {
        let t = tracker(ScriptedApi::statuses(vec![]), 3);
        let mut job = submitted(&t).await;
        t.cancel(&mut job).unwrap();
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert_eq!(job.attempt_count(), 0);
        assert_eq!(t.api.poll_calls(), 0);
        assert!(matches!(
            t.poll(&mut job).await,
            Err(TrackerError::InvalidTransition(_))
        ));
    }

    #[test]
    fn user_messages_are_human_readable() {
        let timeout = TrackerError::PollTimeout { job_id: "j".into(), attempts: 3 };
        assert!(timeout.user_message().contains("try again later"));
        let prompt = TrackerError::Submission(SubmissionError::PromptLength { len: 1, min: 3, max: 500 });
        assert!(prompt.user_message().contains("3 to 500"));
    }
}
