use std::fmt;

use time::OffsetDateTime;

/// Статус задачи редактирования.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Processing,
    Ready,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Ready | JobStatus::Failed | JobStatus::Cancelled | JobStatus::TimedOut
        )
    }

    /// Строковое представление для БД.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Ready => "ready",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::TimedOut => "timed_out",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "ready" => Some(JobStatus::Ready),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "timed_out" => Some(JobStatus::TimedOut),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by the editing API, reduced to the cases the tracker acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Queued,
    Processing,
    Ready { sample: String },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {job_id}: transition {from} -> {to} is not allowed")]
pub struct InvalidTransition {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Одна задача редактирования изображения: от отправки до терминального статуса.
///
/// Поля меняются только через методы, которые проверяют допустимость перехода,
/// поэтому `result_location` заполнен только у `Ready`, а `error_detail` только у `Failed`.
#[derive(Debug, Clone, PartialEq)]
pub struct EditJob {
    id: String,
    polling_endpoint: String,
    status: JobStatus,
    submitted_at: OffsetDateTime,
    started_at: Option<OffsetDateTime>,
    completed_at: Option<OffsetDateTime>,
    attempt_count: u32,
    result_location: Option<String>,
    error_detail: Option<String>,
}

impl EditJob {
    pub fn new(id: impl Into<String>, polling_endpoint: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            id: id.into(),
            polling_endpoint: polling_endpoint.into(),
            status: JobStatus::Pending,
            submitted_at: now,
            started_at: None,
            completed_at: None,
            attempt_count: 0,
            result_location: None,
            error_detail: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn polling_endpoint(&self) -> &str {
        &self.polling_endpoint
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn submitted_at(&self) -> OffsetDateTime {
        self.submitted_at
    }

    pub fn started_at(&self) -> Option<OffsetDateTime> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<OffsetDateTime> {
        self.completed_at
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn result_location(&self) -> Option<&str> {
        self.result_location.as_deref()
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Время обработки: от старта (или отправки, если API так и не ответил) до завершения.
    pub fn processing_time(&self) -> Option<time::Duration> {
        let completed = self.completed_at?;
        Some(completed - self.started_at.unwrap_or(self.submitted_at))
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempt_count = self.attempt_count.saturating_add(1);
    }

    /// Applies one remote status. `Queued` and `Processing` both land in `Processing`.
    pub(crate) fn apply_remote(
        &mut self,
        remote: RemoteStatus,
        now: OffsetDateTime,
    ) -> Result<(), InvalidTransition> {
        let next = match &remote {
            RemoteStatus::Queued | RemoteStatus::Processing => JobStatus::Processing,
            RemoteStatus::Ready { .. } => JobStatus::Ready,
            RemoteStatus::Error { .. } => JobStatus::Failed,
        };
        self.check_open(next)?;

        if self.status == JobStatus::Pending && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        match remote {
            RemoteStatus::Queued | RemoteStatus::Processing => {
                self.status = JobStatus::Processing;
            }
            RemoteStatus::Ready { sample } => {
                self.result_location = Some(sample);
                self.finish(JobStatus::Ready, now);
            }
            RemoteStatus::Error { message } => {
                self.error_detail = Some(message);
                self.finish(JobStatus::Failed, now);
            }
        }
        Ok(())
    }

    pub(crate) fn time_out(&mut self, now: OffsetDateTime) -> Result<(), InvalidTransition> {
        self.check_open(JobStatus::TimedOut)?;
        self.finish(JobStatus::TimedOut, now);
        Ok(())
    }

    pub(crate) fn cancel(&mut self, now: OffsetDateTime) -> Result<(), InvalidTransition> {
        self.check_open(JobStatus::Cancelled)?;
        self.finish(JobStatus::Cancelled, now);
        Ok(())
    }

    pub(crate) fn check_open(&self, to: JobStatus) -> Result<(), InvalidTransition> {
        if self.status.is_terminal() {
            return Err(InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    fn finish(&mut self, status: JobStatus, now: OffsetDateTime) {
        self.status = status;
        self.completed_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn job() -> EditJob {
        EditJob::new("job-1", "https://api.example/poll?id=job-1", datetime!(2025-01-01 10:00 UTC))
    }

    #[test]
    fn new_job_is_pending_and_empty() {
        let j = job();
        assert_eq!(j.status(), JobStatus::Pending);
        assert_eq!(j.attempt_count(), 0);
        assert!(j.started_at().is_none());
        assert!(j.completed_at().is_none());
        assert!(j.result_location().is_none());
        assert!(j.error_detail().is_none());
    }

    #[test]
    fn queued_moves_pending_to_processing_and_records_start() {
        let mut j = job();
        let t = datetime!(2025-01-01 10:00:02 UTC);
        j.apply_remote(RemoteStatus::Queued, t).unwrap();
        assert_eq!(j.status(), JobStatus::Processing);
        assert_eq!(j.started_at(), Some(t));

        // повторный processing не сдвигает started_at
        j.apply_remote(RemoteStatus::Processing, datetime!(2025-01-01 10:00:04 UTC))
            .unwrap();
        assert_eq!(j.status(), JobStatus::Processing);
        assert_eq!(j.started_at(), Some(t));
        assert!(j.completed_at().is_none());
    }

    #[test]
    fn ready_straight_from_pending_sets_result_only() {
        let mut j = job();
        let t = datetime!(2025-01-01 10:00:10 UTC);
        j.apply_remote(RemoteStatus::Ready { sample: "https://cdn/x.jpg".into() }, t)
            .unwrap();
        assert_eq!(j.status(), JobStatus::Ready);
        assert_eq!(j.result_location(), Some("https://cdn/x.jpg"));
        assert!(j.error_detail().is_none());
        assert_eq!(j.started_at(), Some(t));
        assert_eq!(j.completed_at(), Some(t));
    }

    #[test]
    fn error_from_processing_sets_detail_only() {
        let mut j = job();
        j.apply_remote(RemoteStatus::Processing, datetime!(2025-01-01 10:00:02 UTC))
            .unwrap();
        j.apply_remote(
            RemoteStatus::Error { message: "Content Moderated".into() },
            datetime!(2025-01-01 10:00:30 UTC),
        )
        .unwrap();
        assert_eq!(j.status(), JobStatus::Failed);
        assert_eq!(j.error_detail(), Some("Content Moderated"));
        assert!(j.result_location().is_none());
        assert_eq!(j.processing_time(), Some(time::Duration::seconds(28)));
    }

    #[test]
    fn terminal_states_reject_every_event() {
        let t = datetime!(2025-01-01 11:00 UTC);
        let mut terminal = Vec::new();

        let mut ready = job();
        ready.apply_remote(RemoteStatus::Ready { sample: "s".into() }, t).unwrap();
        terminal.push(ready);
        let mut failed = job();
        failed.apply_remote(RemoteStatus::Error { message: "e".into() }, t).unwrap();
        terminal.push(failed);
        let mut cancelled = job();
        cancelled.cancel(t).unwrap();
        terminal.push(cancelled);
        let mut timed_out = job();
        timed_out.time_out(t).unwrap();
        terminal.push(timed_out);

        for mut j in terminal {
            let before = j.clone();
            assert!(j.apply_remote(RemoteStatus::Processing, t).is_err());
            assert!(j.apply_remote(RemoteStatus::Ready { sample: "other".into() }, t).is_err());
            assert!(j.cancel(t).is_err());
            let err = j.time_out(t).unwrap_err();
            assert_eq!(err.from, before.status());
            assert_eq!(err.to, JobStatus::TimedOut);
            assert_eq!(j, before, "терминальная задача не должна меняться");
        }
    }

    #[test]
    fn cancel_and_timeout_leave_result_fields_empty() {
        let t = datetime!(2025-01-01 10:05 UTC);
        let mut c = job();
        c.cancel(t).unwrap();
        assert_eq!(c.status(), JobStatus::Cancelled);
        assert!(c.started_at().is_none());
        assert!(c.result_location().is_none() && c.error_detail().is_none());

        let mut to = job();
        to.apply_remote(RemoteStatus::Processing, datetime!(2025-01-01 10:00:02 UTC))
            .unwrap();
        to.time_out(t).unwrap();
        assert_eq!(to.status(), JobStatus::TimedOut);
        assert_eq!(to.completed_at(), Some(t));
        assert!(to.result_location().is_none() && to.error_detail().is_none());
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Ready,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::TimedOut,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::parse("completed"), None);
    }
}
