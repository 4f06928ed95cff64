//! Waiting for a workload's pod to come up.
//!
//! The poller lists pods at a fixed one second cadence until one of them is
//! `Running` with the selected container `Ready`, or the timeout has elapsed.
//! A failed list call ends the wait immediately; only "not ready yet" is retried.

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use std::fmt;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub static ADMIN_CONSOLE_LABEL: &str = "app=kotsadm";
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
static POD_PHASE_RUNNING: &str = "Running";

/// Read-only access to pods, by namespace and label selector.
#[async_trait]
pub trait PodLister: Send + Sync {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> anyhow::Result<Vec<Pod>>;
}

#[async_trait]
impl PodLister for Client {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> anyhow::Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.clone(), namespace);
        let lp = ListParams::default().labels(label_selector);
        let pod_list = pods.list(&lp).await.with_context(|| {
            format!(
                "Failed to list pods in namespace {} with selector {}",
                namespace, label_selector
            )
        })?;
        Ok(pod_list.items)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSelector {
    pub namespace: String,
    pub label_selector: String,
    pub container_index: usize,
}

impl WorkloadSelector {
    pub fn new(
        namespace: impl Into<String>,
        label_selector: impl Into<String>,
        container_index: usize,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            label_selector: label_selector.into(),
            container_index,
        }
    }

    /// The admin console pod, judged by its first container.
    pub fn admin_console(namespace: impl Into<String>) -> Self {
        Self::new(namespace, ADMIN_CONSOLE_LABEL, 0)
    }
}

impl fmt::Display for WorkloadSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in namespace {} (container {})",
            self.label_selector, self.namespace, self.container_index
        )
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    /// Name of the first pod found ready.
    Ready(String),
    TimedOut,
    /// Listing pods failed. Never retried.
    TransientError(anyhow::Error),
    Cancelled,
}

impl PollOutcome {
    pub fn into_result(
        self,
        selector: &WorkloadSelector,
        timeout: Duration,
    ) -> anyhow::Result<String> {
        match self {
            PollOutcome::Ready(pod_name) => Ok(pod_name),
            PollOutcome::TimedOut => anyhow::bail!(
                "Timeout waiting for pod matching {} to become ready within {} seconds",
                selector,
                timeout.as_secs()
            ),
            PollOutcome::TransientError(e) => Err(e.context("Failed to list pods")),
            PollOutcome::Cancelled => {
                anyhow::bail!("Cancelled while waiting for pod matching {}", selector)
            }
        }
    }
}

/// A pod is ready when it is `Running` and the container status at
/// `container_index` reports ready. Missing statuses count as not ready.
pub fn is_pod_ready(pod: &Pod, container_index: usize) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };

    status.phase.as_deref() == Some(POD_PHASE_RUNNING)
        && status
            .container_statuses
            .as_ref()
            .and_then(|statuses| statuses.get(container_index))
            .is_some_and(|container_status| container_status.ready)
}

pub async fn poll<L>(lister: &L, selector: &WorkloadSelector, timeout: Duration) -> PollOutcome
where
    L: PodLister + ?Sized,
{
    poll_until_cancelled(lister, selector, timeout, &CancellationToken::new()).await
}

/// Same as [`poll`], but gives up with [`PollOutcome::Cancelled`] as soon as
/// `cancel` fires while sleeping between attempts.
pub async fn poll_until_cancelled<L>(
    lister: &L,
    selector: &WorkloadSelector,
    timeout: Duration,
    cancel: &CancellationToken,
) -> PollOutcome
where
    L: PodLister + ?Sized,
{
    info!(
        "Waiting up to {} seconds for pod matching {}",
        timeout.as_secs(),
        selector
    );
    let start = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let pods = match lister
            .list_pods(&selector.namespace, &selector.label_selector)
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                warn!(
                    "Listing pods matching {} failed on attempt {}: {:#}",
                    selector, attempt, e
                );
                return PollOutcome::TransientError(e);
            }
        };

        debug!(
            "Attempt {}: {} pods match {}",
            attempt,
            pods.len(),
            selector
        );

        if let Some(pod) = pods
            .iter()
            .find(|pod| is_pod_ready(pod, selector.container_index))
        {
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            info!(
                "Pod {} is ready after {:?} ({} attempts)",
                pod_name,
                start.elapsed(),
                attempt
            );
            return PollOutcome::Ready(pod_name);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Stopped waiting for pod matching {}", selector);
                return PollOutcome::Cancelled;
            }
            _ = sleep(POLL_INTERVAL) => {}
        }

        if start.elapsed() > timeout {
            warn!(
                "No pod matching {} became ready within {} seconds",
                selector,
                timeout.as_secs()
            );
            return PollOutcome::TimedOut;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Response {
        Pods(Vec<Pod>),
        Fail(&'static str),
    }

    /// Replays scripted responses; the last one repeats forever.
    struct ScriptedLister {
        script: Mutex<VecDeque<Response>>,
        calls: AtomicUsize,
    }

    impl ScriptedLister {
        fn new(script: Vec<Response>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PodLister for ScriptedLister {
        async fn list_pods(
            &self,
            namespace: &str,
            label_selector: &str,
        ) -> anyhow::Result<Vec<Pod>> {
            assert_eq!(namespace, "kotsadm");
            assert_eq!(label_selector, "app=kotsadm");
            self.calls.fetch_add(1, Ordering::SeqCst);
            let response = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script.front().cloned().unwrap()
                }
            };
            match response {
                Response::Pods(pods) => Ok(pods),
                Response::Fail(message) => Err(anyhow::anyhow!(message)),
            }
        }
    }

    fn pod(name: &str, phase: &str, ready: &[bool]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(
                    ready
                        .iter()
                        .enumerate()
                        .map(|(i, ready)| ContainerStatus {
                            name: format!("container-{}", i),
                            ready: *ready,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn selector() -> WorkloadSelector {
        WorkloadSelector::admin_console("kotsadm")
    }

    #[test]
    fn test_is_pod_ready() {
        assert!(is_pod_ready(&pod("a", "Running", &[true]), 0));
        assert!(!is_pod_ready(&pod("a", "Running", &[false]), 0));
        assert!(!is_pod_ready(&pod("a", "Pending", &[true]), 0));
        assert!(!is_pod_ready(&pod("a", "Succeeded", &[true]), 0));
    }

    #[test]
    fn test_is_pod_ready_uses_container_index() {
        let pod = pod("a", "Running", &[false, true]);
        assert!(!is_pod_ready(&pod, 0));
        assert!(is_pod_ready(&pod, 1));
        assert!(!is_pod_ready(&pod, 2));
    }

    #[test]
    fn test_is_pod_ready_without_status() {
        let mut no_statuses = pod("a", "Running", &[]);
        assert!(!is_pod_ready(&no_statuses, 0));
        no_statuses.status.as_mut().unwrap().container_statuses = None;
        assert!(!is_pod_ready(&no_statuses, 0));
        assert!(!is_pod_ready(&Pod::default(), 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_returns_ready_immediately() {
        let lister = ScriptedLister::new(vec![Response::Pods(vec![pod(
            "kotsadm-abc",
            "Running",
            &[true],
        )])]);
        let start = Instant::now();

        let outcome = poll(&lister, &selector(), Duration::from_secs(60)).await;

        assert!(matches!(outcome, PollOutcome::Ready(ref name) if name == "kotsadm-abc"));
        assert_eq!(lister.calls(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_waits_until_pod_becomes_ready() {
        let lister = ScriptedLister::new(vec![
            Response::Pods(vec![]),
            Response::Pods(vec![pod("kotsadm-abc", "Pending", &[false])]),
            Response::Pods(vec![pod("kotsadm-abc", "Running", &[true])]),
        ]);
        let start = Instant::now();

        let outcome = poll(&lister, &selector(), Duration::from_secs(60)).await;

        assert!(matches!(outcome, PollOutcome::Ready(ref name) if name == "kotsadm-abc"));
        assert_eq!(lister.calls(), 3);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_returns_first_ready_pod() {
        let lister = ScriptedLister::new(vec![Response::Pods(vec![
            pod("kotsadm-old", "Running", &[false]),
            pod("kotsadm-one", "Running", &[true]),
            pod("kotsadm-two", "Running", &[true]),
        ])]);

        let outcome = poll(&lister, &selector(), Duration::from_secs(5)).await;

        assert!(matches!(outcome, PollOutcome::Ready(ref name) if name == "kotsadm-one"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_never_before_timeout() {
        let lister = ScriptedLister::new(vec![Response::Pods(vec![pod(
            "kotsadm-abc",
            "Running",
            &[false],
        )])]);
        let timeout = Duration::from_secs(5);
        let start = Instant::now();

        let outcome = poll(&lister, &selector(), timeout).await;

        assert!(matches!(outcome, PollOutcome::TimedOut));
        assert!(start.elapsed() >= timeout);
        // one attempt per second from t=0 through t=5, timeout noticed at t=6
        assert_eq!(lister.calls(), 6);
        assert!(start.elapsed() < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_fails_fast_on_first_list_error() {
        let lister = ScriptedLister::new(vec![Response::Fail("connection refused")]);
        let start = Instant::now();

        let outcome = poll(&lister, &selector(), Duration::from_secs(60)).await;

        match outcome {
            PollOutcome::TransientError(e) => assert_eq!(e.to_string(), "connection refused"),
            other => panic!("expected TransientError, got {:?}", other),
        }
        assert_eq!(lister.calls(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_does_not_retry_list_error_after_not_ready() {
        let lister = ScriptedLister::new(vec![
            Response::Pods(vec![pod("kotsadm-abc", "Pending", &[false])]),
            Response::Fail("apiserver unavailable"),
            Response::Pods(vec![pod("kotsadm-abc", "Running", &[true])]),
        ]);

        let outcome = poll(&lister, &selector(), Duration::from_secs(60)).await;

        assert!(matches!(outcome, PollOutcome::TransientError(_)));
        assert_eq!(lister.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_cancelled_stops_between_attempts() {
        let lister = ScriptedLister::new(vec![Response::Pods(vec![])]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let outcome =
            poll_until_cancelled(&lister, &selector(), Duration::from_secs(60), &cancel).await;

        assert!(matches!(outcome, PollOutcome::Cancelled));
        assert_eq!(lister.calls(), 3);
    }

    #[test]
    fn test_into_result_messages() {
        let selector = selector();
        let timeout = Duration::from_secs(120);

        assert_eq!(
            PollOutcome::Ready("kotsadm-abc".to_string())
                .into_result(&selector, timeout)
                .unwrap(),
            "kotsadm-abc"
        );

        let timed_out = PollOutcome::TimedOut
            .into_result(&selector, timeout)
            .unwrap_err();
        assert_eq!(
            timed_out.to_string(),
            "Timeout waiting for pod matching app=kotsadm in namespace kotsadm (container 0) to become ready within 120 seconds"
        );

        let transient = PollOutcome::TransientError(anyhow::anyhow!("boom"))
            .into_result(&selector, timeout)
            .unwrap_err();
        assert_eq!(format!("{:#}", transient), "Failed to list pods: boom");
    }

    mod kube_client {
        use super::*;
        use http::{Request, Response};
        use kube::client::Body;
        use std::convert::Infallible;

        fn client_returning(status: u16, body: &'static str) -> Client {
            let service = tower::service_fn(move |request: Request<Body>| async move {
                let matches_request = request.uri().path() == "/api/v1/namespaces/kotsadm/pods"
                    && request
                        .uri()
                        .query()
                        .is_some_and(|q| q.contains("labelSelector=app%3Dkotsadm"));
                let (status, body) = if matches_request {
                    (status, body)
                } else {
                    (404, r#"{"kind":"Status","apiVersion":"v1","status":"Failure","message":"not found","reason":"NotFound","code":404}"#)
                };
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(status)
                        .header("content-type", "application/json")
                        .body(Body::from(body.as_bytes().to_vec()))
                        .unwrap(),
                )
            });
            Client::new(service, "default")
        }

        #[tokio::test]
        async fn test_client_lists_pods_by_namespace_and_label() {
            let client = client_returning(
                200,
                r#"{
                    "apiVersion": "v1",
                    "kind": "PodList",
                    "metadata": {},
                    "items": [{
                        "metadata": {"name": "kotsadm-5d8f", "namespace": "kotsadm"},
                        "status": {
                            "phase": "Running",
                            "containerStatuses": [{
                                "name": "kotsadm",
                                "image": "kotsadm/kotsadm:v1",
                                "imageID": "",
                                "ready": true,
                                "restartCount": 0
                            }]
                        }
                    }]
                }"#,
            );

            let outcome = poll(&client, &selector(), Duration::from_secs(5)).await;

            assert!(matches!(outcome, PollOutcome::Ready(ref name) if name == "kotsadm-5d8f"));
        }

        #[tokio::test]
        async fn test_client_api_error_is_transient_error() {
            let client = client_returning(
                500,
                r#"{"kind":"Status","apiVersion":"v1","status":"Failure","message":"etcdserver: request timed out","reason":"InternalError","code":500}"#,
            );

            let outcome = poll(&client, &selector(), Duration::from_secs(5)).await;

            assert!(matches!(outcome, PollOutcome::TransientError(_)));
        }
    }
}
