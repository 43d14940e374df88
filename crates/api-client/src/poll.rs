//! Cancellable status polling.
//!
//! The abort signal is checked before every request, raced against every
//! request in flight, and checked throughout every sleep, which is sliced so
//! cancellation is observed within [`SLEEP_SLICE`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_common::signal::AbortSignal;

use crate::client::{ExportStatusClient, GenerationClient};
use crate::models::{ExportStatusResponse, GenerationStatus, Terminal};

pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Longest uninterrupted sleep between abort checks.
pub const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Request failures in a row tolerated before polling gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub fn clamp_poll_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

/// Call `fetch` until it returns a terminal status.
///
/// `interval` is clamped to 2-3 s.
pub async fn poll_until_terminal<T, F, Fut>(fetch: F, interval: Duration, abort: &AbortSignal) -> CutlineResult<T>
where
    T: Terminal,
    F: FnMut() -> Fut,
    Fut: Future<Output = CutlineResult<T>>,
{
    poll_loop(fetch, clamp_poll_interval(interval), abort).await
}

pub(crate) async fn poll_loop<T, F, Fut>(mut fetch: F, interval: Duration, abort: &AbortSignal) -> CutlineResult<T>
where
    T: Terminal,
    F: FnMut() -> Fut,
    Fut: Future<Output = CutlineResult<T>>,
{
    let mut attempts = 0u32;
    let mut failures = 0u32;
    loop {
        abort.check()?;
        attempts += 1;
        let reply = tokio::select! {
            reply = fetch() => reply,
            () = abort.aborted() => {
                debug!(attempts, "Polling aborted during a request");
                return Err(CutlineError::Cancelled);
            }
        };
        match reply {
            Ok(status) if status.is_terminal() => {
                debug!(attempts, "Polling reached a terminal status");
                return Ok(status);
            }
            Ok(_) => failures = 0,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                failures += 1;
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(CutlineError::api(format!(
                        "Polling failed {failures} times in a row, last error: {e}"
                    )));
                }
                warn!(attempts, failures, error = %e, "Status request failed, retrying");
            }
        }
        sleep_or_abort(interval, abort).await?;
    }
}

/// Sleep for `duration`, returning `Err(Cancelled)` as soon as `abort` is
/// observed.
pub async fn sleep_or_abort(duration: Duration, abort: &AbortSignal) -> CutlineResult<()> {
    let deadline = Instant::now() + duration;
    loop {
        abort.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        tokio::time::sleep((deadline - now).min(SLEEP_SLICE)).await;
    }
}

/// Poll a server-side export job until it completes or fails.
pub async fn wait_for_export(
    client: &dyn ExportStatusClient,
    job_id: &str,
    interval: Duration,
    abort: &AbortSignal,
) -> CutlineResult<ExportStatusResponse> {
    poll_until_terminal(|| client.export_status(job_id), interval, abort).await
}

/// Poll a generation until it completes or fails.
pub async fn wait_for_generation(
    client: &dyn GenerationClient,
    generation_id: &str,
    interval: Duration,
    abort: &AbortSignal,
) -> CutlineResult<GenerationStatus> {
    poll_until_terminal(|| client.generation(generation_id), interval, abort).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExportStatus;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn status(status: ExportStatus) -> ExportStatusResponse {
        ExportStatusResponse {
            status,
            download_url: (status == ExportStatus::Completed).then(|| "https://cdn/out.mp4".to_string()),
            error: None,
        }
    }

    struct Scripted {
        replies: Mutex<VecDeque<CutlineResult<ExportStatusResponse>>>,
        requests: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<CutlineResult<ExportStatusResponse>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: AtomicUsize::new(0),
            }
        }

        async fn next(&self) -> CutlineResult<ExportStatusResponse> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(status(ExportStatus::Processing)))
        }
    }

    #[test]
    fn test_interval_is_clamped() {
        assert_eq!(clamp_poll_interval(Duration::from_millis(10)), MIN_POLL_INTERVAL);
        assert_eq!(clamp_poll_interval(Duration::from_millis(2500)), Duration::from_millis(2500));
        assert_eq!(clamp_poll_interval(Duration::from_secs(60)), MAX_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn test_stops_on_terminal_status() {
        let server = Scripted::new(vec![
            Ok(status(ExportStatus::Processing)),
            Ok(status(ExportStatus::Processing)),
            Ok(status(ExportStatus::Completed)),
        ]);
        let abort = AbortSignal::new();
        let done = poll_loop(|| server.next(), Duration::from_millis(5), &abort)
            .await
            .unwrap();
        assert_eq!(done.status, ExportStatus::Completed);
        assert_eq!(server.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_aborted_before_start_sends_nothing() {
        let server = Scripted::new(Vec::new());
        let abort = AbortSignal::new();
        abort.abort();
        let err = poll_loop(|| server.next(), Duration::from_millis(5), &abort)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(server.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_abort_interrupts_sleep() {
        let server = Scripted::new(Vec::new());
        let abort = AbortSignal::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.abort();
        });

        let started = std::time::Instant::now();
        let err = poll_loop(|| server.next(), Duration::from_secs(30), &abort)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(server.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_interrupts_request_in_flight() {
        let abort = AbortSignal::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.abort();
        });

        let sent = AtomicUsize::new(0);
        let requests = &sent;
        let hanging = move || async move {
            requests.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, CutlineError>(status(ExportStatus::Completed))
        };

        let started = std::time::Instant::now();
        let err = poll_loop(hanging, Duration::from_millis(5), &abort)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tolerates_transient_failures() {
        let server = Scripted::new(vec![
            Err(CutlineError::api("503")),
            Err(CutlineError::api("503")),
            Ok(status(ExportStatus::Processing)),
            Err(CutlineError::api("503")),
            Ok(status(ExportStatus::Failed)),
        ]);
        let abort = AbortSignal::new();
        let done = poll_loop(|| server.next(), Duration::from_millis(1), &abort)
            .await
            .unwrap();
        assert_eq!(done.status, ExportStatus::Failed);
    }

    #[tokio::test]
    async fn test_gives_up_after_repeated_failures() {
        let server = Scripted::new(vec![
            Err(CutlineError::api("503")),
            Err(CutlineError::api("503")),
            Err(CutlineError::api("503")),
        ]);
        let abort = AbortSignal::new();
        let err = poll_loop(|| server.next(), Duration::from_millis(1), &abort)
            .await
            .unwrap_err();
        assert!(matches!(err, CutlineError::Api { .. }));
        assert_eq!(server.requests.load(Ordering::SeqCst), MAX_CONSECUTIVE_FAILURES as usize);
    }

    proptest! {
        #[test]
        fn test_clamped_interval_stays_in_range(ms in 0u64..600_000) {
            let clamped = clamp_poll_interval(Duration::from_millis(ms));
            prop_assert!(clamped >= MIN_POLL_INTERVAL && clamped <= MAX_POLL_INTERVAL);
        }
    }
}
