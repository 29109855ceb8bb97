//! Pod readiness watcher: streaming watch with a polling fallback.

use std::time::Duration;

use kubelab_core::{LabError, LabResult, PodEvent, PodLifecycle, PodSnapshot};
use kubelab_kubehub::ClusterApi;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Wall-clock budget for the whole wait, watch restarts included.
    pub timeout: Duration,
    /// Pause before re-opening a watch that closed early.
    pub retry_delay: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self { Self { timeout: Duration::from_secs(300), retry_delay: Duration::from_secs(2) } }
}

impl WaitOptions {
    pub fn from_env() -> Self {
        Self {
            timeout: kubelab_core::env_secs("LAB_POD_READY_TIMEOUT_SECS", 300),
            retry_delay: kubelab_core::env_millis("LAB_WATCH_RETRY_MS", 2000),
        }
    }
}

/// Report `pod` and decide whether the wait is over.
fn observe<F>(pod: &PodSnapshot, cancel: &CancellationToken, on_update: &mut F) -> LabResult<Option<PodSnapshot>>
where
    F: FnMut(&PodSnapshot),
{
    if cancel.is_cancelled() {
        return Err(LabError::Cancelled);
    }
    on_update(pod);
    match pod.lifecycle() {
        PodLifecycle::Ready => Ok(Some(pod.clone())),
        PodLifecycle::Failed => Err(LabError::PodFailed { pod: pod.name.clone(), reason: pod.failure_reason() }),
        _ => Ok(None),
    }
}

/// Wait until `pod` is Running with every container ready.
///
/// Each watch event is passed to `on_update`. When the watch ends before a
/// terminal state, the pod is read once directly and, if still not ready, the
/// watch is reopened after `opts.retry_delay`. Fails with `Timeout` once
/// `opts.timeout` has elapsed, `PodFailed` when the pod fails, `Cancelled`
/// when `cancel` fires; `on_update` is never called after any of these.
pub async fn wait_for_ready<F>(
    cluster: &dyn ClusterApi,
    namespace: &str,
    pod: &str,
    opts: WaitOptions,
    cancel: &CancellationToken,
    mut on_update: F,
) -> LabResult<PodSnapshot>
where
    F: FnMut(&PodSnapshot) + Send,
{
    let deadline = Instant::now() + opts.timeout;
    let timed_out = || LabError::Timeout { what: format!("pod {} to become ready", pod), after: opts.timeout };
    let mut round = 0u32;

    loop {
        round += 1;
        let opened = tokio::select! {
            _ = cancel.cancelled() => return Err(LabError::Cancelled),
            _ = sleep_until(deadline) => return Err(timed_out()),
            w = cluster.watch_pod(namespace, pod) => w,
        };
        match opened {
            Ok(mut watch) => {
                debug!(pod = %pod, round, "readiness: watch open");
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => {
                            watch.cancel();
                            return Err(LabError::Cancelled);
                        }
                        _ = sleep_until(deadline) => {
                            watch.cancel();
                            return Err(timed_out());
                        }
                        ev = watch.rx.recv() => ev,
                    };
                    let snapshot = match next {
                        Some(Ok(PodEvent::Applied(p))) => p,
                        // the controller will recreate it; report as not yet scheduled
                        Some(Ok(PodEvent::Deleted(p))) => PodSnapshot { name: p.name, ..Default::default() },
                        Some(Err(e)) => {
                            warn!(pod = %pod, error = %e, "readiness: watch error");
                            break;
                        }
                        None => {
                            debug!(pod = %pod, "readiness: watch closed early");
                            break;
                        }
                    };
                    match observe(&snapshot, cancel, &mut on_update) {
                        Ok(Some(ready)) => {
                            watch.cancel();
                            info!(pod = %pod, "readiness: pod ready");
                            return Ok(ready);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            watch.cancel();
                            return Err(e);
                        }
                    }
                }
            }
            Err(e) if e.is_retryable() => warn!(pod = %pod, error = %e, "readiness: cannot open watch"),
            Err(e) => return Err(e.into()),
        }

        // Watch interrupted: one direct read before reopening.
        let polled = tokio::select! {
            _ = cancel.cancelled() => return Err(LabError::Cancelled),
            _ = sleep_until(deadline) => return Err(timed_out()),
            p = cluster.pod_status(namespace, pod) => p,
        };
        match polled {
            Ok(Some(p)) => {
                if let Some(ready) = observe(&p, cancel, &mut on_update)? {
                    info!(pod = %pod, "readiness: pod ready (poll)");
                    return Ok(ready);
                }
            }
            Ok(None) => debug!(pod = %pod, "readiness: pod not created yet"),
            Err(e) if e.is_retryable() => warn!(pod = %pod, error = %e, "readiness: poll failed"),
            Err(e) => return Err(e.into()),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(LabError::Cancelled),
            _ = sleep_until(deadline) => return Err(timed_out()),
            _ = sleep(opts.retry_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubelab_core::{ClusterError, PodPhase};
    use kubelab_kubehub::fake::{pod_in, ready_pod, FakeCluster, WatchEnd, WatchScript};
    use std::sync::{Arc, Mutex};

    const NS: &str = "lab";
    const POD: &str = "jupyter-abc-0";

    fn opts(timeout_ms: u64) -> WaitOptions {
        WaitOptions { timeout: Duration::from_millis(timeout_ms), retry_delay: Duration::from_millis(20) }
    }

    fn running_not_ready() -> PodSnapshot { pod_in(POD, PodPhase::Running) }

    #[tokio::test]
    async fn resolves_after_ready_event_exactly_once() {
        let fake = FakeCluster::new();
        fake.push_watch(
            WatchScript::new(WatchEnd::Hang)
                .applied(Duration::ZERO, pod_in(POD, PodPhase::Pending))
                .applied(Duration::from_millis(5), running_not_ready())
                .applied(Duration::from_millis(5), ready_pod(POD))
                .applied(Duration::from_millis(5), running_not_ready()),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let pod = wait_for_ready(&fake, NS, POD, opts(2000), &CancellationToken::new(), move |p| {
            s.lock().unwrap().push(p.lifecycle())
        })
        .await
        .expect("ready");
        assert!(pod.is_ready());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![PodLifecycle::Unscheduled, PodLifecycle::RunningNotReady, PodLifecycle::Ready]
        );
        assert_eq!(fake.watch_calls(), 1);
    }

    #[tokio::test]
    async fn failed_pod_surfaces_reason() {
        let fake = FakeCluster::new();
        let mut failed = pod_in(POD, PodPhase::Failed);
        failed.message = "OOMKilled".into();
        fake.push_watch(WatchScript::new(WatchEnd::Hang).applied(Duration::ZERO, failed));
        let err = wait_for_ready(&fake, NS, POD, opts(2000), &CancellationToken::new(), |_| {}).await.unwrap_err();
        match err {
            LabError::PodFailed { pod, reason } => {
                assert_eq!(pod, POD);
                assert_eq!(reason, "OOMKilled");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn early_close_falls_back_to_poll_then_rewatches() {
        let fake = FakeCluster::new();
        fake.push_watch(WatchScript::new(WatchEnd::Close).applied(Duration::ZERO, pod_in(POD, PodPhase::Pending)));
        fake.push_watch(
            WatchScript::new(WatchEnd::Hang).error(Duration::from_millis(5), ClusterError::Connection("reset".into())),
        );
        fake.push_watch(WatchScript::new(WatchEnd::Hang).applied(Duration::from_millis(5), ready_pod(POD)));
        let pod = wait_for_ready(&fake, NS, POD, opts(2000), &CancellationToken::new(), |_| {}).await.expect("ready");
        assert!(pod.is_ready());
        assert_eq!(fake.watch_calls(), 3);
        assert_eq!(fake.pod_status_calls(), 2);
    }

    #[tokio::test]
    async fn poll_after_close_can_find_ready_pod() {
        let fake = FakeCluster::new();
        fake.put_pod(NS, ready_pod(POD));
        fake.push_watch(WatchScript::new(WatchEnd::Close));
        let pod = wait_for_ready(&fake, NS, POD, opts(2000), &CancellationToken::new(), |_| {}).await.expect("ready");
        assert!(pod.is_ready());
        assert_eq!(fake.watch_calls(), 1);
    }

    #[tokio::test]
    async fn keeps_rewatching_until_timeout() {
        let fake = FakeCluster::new();
        fake.put_pod(NS, running_not_ready());
        for _ in 0..50 {
            fake.push_watch(WatchScript::new(WatchEnd::Close).applied(Duration::ZERO, running_not_ready()));
        }
        let started = std::time::Instant::now();
        let err = wait_for_ready(&fake, NS, POD, opts(150), &CancellationToken::new(), |_| {}).await.unwrap_err();
        assert!(matches!(err, LabError::Timeout { .. }), "got {:?}", err);
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(fake.watch_calls() > 1);
    }

    #[tokio::test]
    async fn cancellation_stops_updates() {
        let fake = FakeCluster::new();
        fake.push_watch(
            WatchScript::new(WatchEnd::Hang)
                .applied(Duration::ZERO, pod_in(POD, PodPhase::Pending))
                .applied(Duration::from_millis(200), ready_pod(POD)),
        );
        let cancel = CancellationToken::new();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c2.cancel();
        });
        let count = Arc::new(Mutex::new(0usize));
        let c = count.clone();
        let err = wait_for_ready(&fake, NS, POD, opts(5000), &cancel, move |_| *c.lock().unwrap() += 1).await.unwrap_err();
        assert!(err.is_cancelled());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn forbidden_watch_is_fatal() {
        struct Denied;
        #[async_trait::async_trait]
        impl ClusterApi for Denied {
            async fn check_access(&self, _: &str) -> Result<(), ClusterError> { Ok(()) }
            async fn get_controller(&self, _: &str, _: &str) -> Result<Option<kubelab_core::ControllerInfo>, ClusterError> { Ok(None) }
            async fn pod_status(&self, _: &str, _: &str) -> Result<Option<PodSnapshot>, ClusterError> { Ok(None) }
            async fn watch_pod(&self, _: &str, _: &str) -> Result<kubelab_kubehub::PodWatch, ClusterError> {
                Err(ClusterError::Forbidden("pods is forbidden".into()))
            }
            async fn create(&self, _: &str, _: &kubelab_kubehub::ResourceObject) -> Result<(), ClusterError> { Ok(()) }
            async fn delete_controller(&self, _: &str, _: &str) -> Result<bool, ClusterError> { Ok(false) }
            async fn delete_service(&self, _: &str, _: &str) -> Result<bool, ClusterError> { Ok(false) }
            async fn open_port_stream(&self, _: &str, _: &str, _: u16) -> Result<kubelab_kubehub::PortConnection, ClusterError> {
                Err(ClusterError::Connection("n/a".into()))
            }
        }
        let err = wait_for_ready(&Denied, NS, POD, opts(1000), &CancellationToken::new(), |_| {}).await.unwrap_err();
        assert_eq!(err.kind(), "auth");
    }
}
