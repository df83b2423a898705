use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::job::EditJob;
use crate::tracker::{Clock, EditApi, EditJobTracker, TrackerError};

/// Receives every job snapshot after a poll or a cancellation.
pub trait JobSink: Send + Sync {
    fn record(&self, job: &EditJob) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Receives the job once it reaches a terminal state.
pub trait Notifier: Send + Sync {
    fn job_finished(&self, job: &EditJob) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Exponential,
}

impl FromStr for Backoff {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Backoff::Fixed),
            "exponential" | "exp" => Ok(Backoff::Exponential),
            other => Err(format!("unknown backoff '{other}', expected fixed or exponential")),
        }
    }
}

/// Интервалы между опросами.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub backoff: Backoff,
    pub max_interval: Duration,
}

impl PollSchedule {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            backoff: Backoff::Fixed,
            max_interval: interval,
        }
    }

    /// Delay before the poll that follows `attempts_done` earlier polls.
    pub fn delay_for(&self, attempts_done: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempts_done.min(31)).unwrap_or(u32::MAX);
                self.interval
                    .saturating_mul(factor)
                    .min(self.max_interval.max(self.interval))
            }
        }
    }
}

/// Polls `job` until it reaches a terminal state or `cancel` fires.
///
/// Cancellation interrupts the wait between polls; a request already in flight
/// is allowed to finish.
///
/// Every snapshot goes to `sink`, the terminal one also to `notifier`.
/// Sink and notifier failures are logged and never stop the loop.
pub async fn drive<A, C, S, N>(
    tracker: &EditJobTracker<A, C>,
    mut job: EditJob,
    schedule: &PollSchedule,
    cancel: &CancellationToken,
    sink: &S,
    notifier: &N,
) -> Result<EditJob, TrackerError>
where
    A: EditApi,
    C: Clock,
    S: JobSink,
    N: Notifier,
{
    loop {
        if cancel.is_cancelled() {
            tracker.cancel(&mut job)?;
            finish(&job, sink, notifier).await;
            return Ok(job);
        }

        let delay = schedule.delay_for(job.attempt_count());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => continue,
            _ = tokio::time::sleep(delay) => {}
        }

        match tracker.poll(&mut job).await {
            Ok(status) => {
                if job.is_terminal() {
                    finish(&job, sink, notifier).await;
                    return Ok(job);
                }
                debug!(job_id = %job.id(), %status, attempt = job.attempt_count(), "runner: still running");
                persist(&job, sink).await;
            }
            Err(err) if err.is_retryable() => {
                warn!(job_id = %job.id(), error = %err, "runner: transient poll error, will retry");
                persist(&job, sink).await;
            }
            Err(TrackerError::PollTimeout { .. }) => {
                finish(&job, sink, notifier).await;
                return Ok(job);
            }
            Err(err) => {
                error!(job_id = %job.id(), error = %err, "runner: job loop aborted");
                return Err(err);
            }
        }
    }
}

async fn persist<S: JobSink>(job: &EditJob, sink: &S) {
    if let Err(err) = sink.record(job).await {
        warn!(job_id = %job.id(), error = %err, "runner: failed to persist snapshot");
    }
}

async fn finish<S: JobSink, N: Notifier>(job: &EditJob, sink: &S, notifier: &N) {
    persist(job, sink).await;
    info!(
        job_id = %job.id(),
        status = %job.status(),
        attempts = job.attempt_count(),
        "runner: job finished"
    );
    if let Err(err) = notifier.job_finished(job).await {
        warn!(job_id = %job.id(), error = %err, "runner: failed to notify");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bfl::EditOptions;
    use crate::job::{JobStatus, RemoteStatus};
    use crate::tracker::testing::*;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(JobStatus, u32)>>);

    impl JobSink for RecordingSink {
        async fn record(&self, job: &EditJob) -> anyhow::Result<()> {
            self.0.lock().unwrap().push((job.status(), job.attempt_count()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier(Mutex<Vec<EditJob>>);

    impl Notifier for RecordingNotifier {
        async fn job_finished(&self, job: &EditJob) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(job.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl JobSink for FailingSink {
        async fn record(&self, _job: &EditJob) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    async fn start(t: &EditJobTracker<ScriptedApi, FixedClock>) -> EditJob {
        t.submit(b"img", "replace the sky", &EditOptions::default()).await.unwrap()
    }

    fn no_wait() -> PollSchedule {
        PollSchedule::fixed(Duration::ZERO)
    }

    #[tokio::test]
    async fn drives_to_ready_and_records_every_poll() {
        let t = tracker(
            ScriptedApi::new(vec![
                Ok(RemoteStatus::Queued),
                Err(transient()),
                Ok(RemoteStatus::Ready { sample: "https://out/1.jpg".into() }),
            ]),
            10,
        );
        let job = start(&t).await;
        let sink = RecordingSink::default();
        let notifier = RecordingNotifier::default();

        let done = drive(&t, job, &no_wait(), &CancellationToken::new(), &sink, &notifier)
            .await
            .unwrap();

        assert_eq!(done.status(), JobStatus::Ready);
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![
                (JobStatus::Processing, 1),
                (JobStatus::Processing, 2),
                (JobStatus::Ready, 3)
            ]
        );
        let notified = notifier.0.lock().unwrap();
        assert_eq!(notified.len(), 1);
        assert_eq!(notified[0].result_location(), Some("https://out/1.jpg"));
    }

    #[tokio::test]
    async fn budget_exhaustion_notifies_timeout() {
        let t = tracker(ScriptedApi::statuses(vec![]), 3);
        let job = start(&t).await;
        let sink = RecordingSink::default();
        let notifier = RecordingNotifier::default();

        let done = drive(&t, job, &no_wait(), &CancellationToken::new(), &sink, &notifier)
            .await
            .unwrap();

        assert_eq!(done.status(), JobStatus::TimedOut);
        assert_eq!(done.attempt_count(), 3);
        assert_eq!(t_calls(&t), 3);
        assert_eq!(sink.0.lock().unwrap().last(), Some(&(JobStatus::TimedOut, 3)));
        assert_eq!(notifier.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_polls() {
        let t = tracker(ScriptedApi::statuses(vec![]), 3);
        let job = start(&t).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sink = RecordingSink::default();
        let notifier = RecordingNotifier::default();

        let done = drive(&t, job, &no_wait(), &cancel, &sink, &notifier).await.unwrap();

        assert_eq!(done.status(), JobStatus::Cancelled);
        assert_eq!(done.attempt_count(), 0);
        assert_eq!(t_calls(&t), 0);
        assert_eq!(*sink.0.lock().unwrap(), vec![(JobStatus::Cancelled, 0)]);
        assert_eq!(notifier.0.lock().unwrap()[0].status(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_the_loop() {
        let t = tracker(
            ScriptedApi::statuses(vec![
                RemoteStatus::Processing,
                RemoteStatus::Error { message: "boom".into() },
            ]),
            5,
        );
        let job = start(&t).await;
        let notifier = RecordingNotifier::default();
        let done = drive(&t, job, &no_wait(), &CancellationToken::new(), &FailingSink, &notifier)
            .await
            .unwrap();
        assert_eq!(done.status(), JobStatus::Failed);
        assert_eq!(notifier.0.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_the_wait_between_polls() {
        let t = tracker(ScriptedApi::statuses(vec![]), 10);
        let job = start(&t).await;
        let sink = RecordingSink::default();
        let notifier = RecordingNotifier::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let began = tokio::time::Instant::now();
        let slow = PollSchedule::fixed(Duration::from_secs(30));
        let done = drive(&t, job, &slow, &cancel, &sink, &notifier).await.unwrap();

        assert_eq!(done.status(), JobStatus::Cancelled);
        assert!(began.elapsed() < Duration::from_secs(2), "waited {:?}", began.elapsed());
        assert_eq!(t_calls(&t), 0);
        assert_eq!(notifier.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn fixed_schedule_is_constant() {
        let s = PollSchedule::fixed(Duration::from_secs(2));
        assert_eq!(s.delay_for(0), Duration::from_secs(2));
        assert_eq!(s.delay_for(40), Duration::from_secs(2));
    }

    #[test]
    fn exponential_schedule_doubles_and_caps() {
        let s = PollSchedule {
            interval: Duration::from_secs(1),
            backoff: Backoff::Exponential,
            max_interval: Duration::from_secs(10),
        };
        assert_eq!(s.delay_for(0), Duration::from_secs(1));
        assert_eq!(s.delay_for(1), Duration::from_secs(2));
        assert_eq!(s.delay_for(3), Duration::from_secs(8));
        assert_eq!(s.delay_for(4), Duration::from_secs(10));
        assert_eq!(s.delay_for(200), Duration::from_secs(10));
    }

    #[test]
    fn backoff_parses_case_insensitively() {
        assert_eq!("Exponential".parse::<Backoff>(), Ok(Backoff::Exponential));
        assert_eq!(" fixed ".parse::<Backoff>(), Ok(Backoff::Fixed));
        assert!("linear".parse::<Backoff>().is_err());
    }

    fn t_calls(t: &EditJobTracker<ScriptedApi, FixedClock>) -> u32 {
        t.api().poll_calls()
    }
}
