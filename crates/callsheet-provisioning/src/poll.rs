//! Poll-to-completion for long-running remote operations.
//!
//! A remote API answers a create/delete request with a tracking URI (the
//! `Azure-AsyncOperation` or `Location` header) or tells us the resource already
//! exists. [`poll_to_completion`] re-requests the tracking URI on a fixed interval
//! until the status is terminal, the policy's timeout elapses, or the run is
//! cancelled, and reports which of those happened.

use crate::error::Result;
use async_trait::async_trait;
use callsheet_abstraction::OperationContext;
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use serde::Serialize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Header carrying the ARM async-operation status URI.
pub const AZURE_ASYNC_OPERATION: &str = "azure-asyncoperation";

/// Interval and overall timeout of a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Wait between polls when the API gives no `Retry-After` hint.
    pub interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl PollPolicy {
    /// ARM template deployments and resource-group deletions.
    pub const ARM: Self = Self { interval: Duration::from_secs(5), timeout: Duration::from_secs(600) };
    /// CDS database provisioning.
    pub const CDS: Self = Self { interval: Duration::from_secs(5), timeout: Duration::from_secs(300) };
    /// LUIS model training.
    pub const LUIS: Self = Self { interval: Duration::from_secs(2), timeout: Duration::from_secs(600) };

    /// Creates a policy.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Next wait, never reaching past `deadline`.
    fn wait(&self, retry_after: Option<Duration>, deadline: Instant) -> Duration {
        retry_after.unwrap_or(self.interval).min(deadline.saturating_duration_since(Instant::now()))
    }
}

/// How the initial response says completion can be observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tracking {
    /// Poll this URI and read the `status` field of its body.
    AzureAsyncOperation(String),
    /// Poll this URI; its status code or body tells the state.
    Location(String),
    /// The resource already exists; nothing to wait for.
    AlreadyExists,
    /// The resource to delete is already gone; nothing to wait for.
    AlreadyGone,
    /// The request completed synchronously.
    Done,
}

impl Tracking {
    /// The URI to poll, if any.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::AzureAsyncOperation(url) | Self::Location(url) => Some(url),
            Self::AlreadyExists | Self::AlreadyGone | Self::Done => None,
        }
    }

    /// Whether the target was already in the requested state.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::AlreadyExists | Self::AlreadyGone)
    }
}

/// One observed response: the initial reply or a poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollReading {
    /// HTTP status code.
    pub status: u16,
    /// Parsed body (`Null` when empty, a string when not JSON).
    pub body: Value,
    /// `Retry-After` hint for the next wait.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl PollReading {
    /// Creates a reading without a retry hint.
    #[must_use]
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body, retry_after: None }
    }
}

/// The reply to the request that started a long-running operation.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialResponse {
    /// How to observe completion.
    pub tracking: Tracking,
    /// The reply itself.
    pub reading: PollReading,
}

impl InitialResponse {
    /// Classifies a reply.
    ///
    /// `Azure-AsyncOperation` wins over `Location`. A status listed in
    /// `exists_statuses` (typically 409 for creates, 404 for deletes) means there
    /// is nothing to do (a listed 404 means already gone); any other reply
    /// without tracking headers completed synchronously.
    pub fn from_reply(reading: PollReading, headers: &HeaderMap, exists_statuses: &[u16]) -> Self {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        let tracking = if exists_statuses.contains(&reading.status) {
            if reading.status == 404 { Tracking::AlreadyGone } else { Tracking::AlreadyExists }
        } else if let Some(url) = header(AZURE_ASYNC_OPERATION) {
            Tracking::AzureAsyncOperation(url)
        } else if let Some(url) = header(LOCATION.as_str()) {
            Tracking::Location(url)
        } else {
            Tracking::Done
        };
        Self { tracking, reading }
    }
}

/// Parses a `Retry-After` header given in seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// State a reading reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Still in progress.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully.
    Failed,
}

/// How to read state out of a poll response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusSchema {
    /// ARM-style body: `status` (or `properties.provisioningState`), compared
    /// case-insensitively.
    #[default]
    ArmBody,
    /// Only the HTTP status code matters (deletion polls).
    HttpStatus,
    /// LUIS training status: one entry per model with `details.status`.
    LuisTraining,
}

impl StatusSchema {
    /// Classifies a reading.
    pub fn classify(&self, reading: &PollReading) -> PollState {
        match self {
            Self::ArmBody => classify_arm(reading),
            Self::HttpStatus => match reading.status {
                200 | 204 | 404 => PollState::Succeeded,
                202 => PollState::Running,
                _ => PollState::Failed,
            },
            Self::LuisTraining => classify_luis(&reading.body),
        }
    }
}

fn classify_arm(reading: &PollReading) -> PollState {
    if reading.status >= 400 {
        return PollState::Failed;
    }
    let status = reading
        .body
        .get("status")
        .or_else(|| reading.body.pointer("/properties/provisioningState"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    if status.eq_ignore_ascii_case("succeeded") {
        PollState::Succeeded
    } else if ["failed", "canceled", "notfound", "internalservererror"]
        .iter()
        .any(|terminal| status.eq_ignore_ascii_case(terminal))
    {
        PollState::Failed
    } else {
        PollState::Running
    }
}

fn classify_luis(body: &Value) -> PollState {
    let Some(models) = body.as_array().filter(|m| !m.is_empty()) else {
        return PollState::Running;
    };
    let statuses: Vec<&str> = models
        .iter()
        .map(|m| m.pointer("/details/status").and_then(Value::as_str).unwrap_or_default())
        .collect();

    if statuses.iter().any(|s| s.eq_ignore_ascii_case("fail")) {
        PollState::Failed
    } else if statuses
        .iter()
        .all(|s| s.eq_ignore_ascii_case("success") || s.eq_ignore_ascii_case("uptodate"))
    {
        PollState::Succeeded
    } else {
        PollState::Running
    }
}

/// Issues one poll request.
#[async_trait]
pub trait PollSource: Send + Sync {
    /// Requests the tracking URI once.
    async fn poll(&self, url: &str) -> Result<PollReading>;
}

/// How a poll loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Terminal success (or nothing to wait for).
    Succeeded(PollReading),
    /// Terminal failure.
    Failed(PollReading),
    /// Still running when the timeout elapsed.
    TimedOut(Option<PollReading>),
    /// The run was cancelled during a wait.
    Cancelled(Option<PollReading>),
}

impl PollOutcome {
    /// Short name used in step results.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
            Self::TimedOut(_) => "timed_out",
            Self::Cancelled(_) => "cancelled",
        }
    }

    /// The last observed response.
    pub fn reading(&self) -> Option<&PollReading> {
        match self {
            Self::Succeeded(r) | Self::Failed(r) => Some(r),
            Self::TimedOut(r) | Self::Cancelled(r) => r.as_ref(),
        }
    }

    /// Whether the operation finished successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// JSON form stored as an operation result.
    pub fn to_json(&self) -> Value {
        let reading = self.reading();
        json!({
            "outcome": self.label(),
            "status": reading.map(|r| r.status),
            "body": reading.map_or(Value::Null, |r| r.body.clone()),
        })
    }
}

/// Waits for a long-running operation to reach a terminal state.
///
/// Performs no requests when the initial response needs no tracking. Each wait is
/// raced against the context's cancellation token.
pub async fn poll_to_completion(
    source: &dyn PollSource,
    initial: &InitialResponse,
    schema: StatusSchema,
    policy: PollPolicy,
    ctx: &OperationContext,
) -> Result<PollOutcome> {
    let Some(url) = initial.tracking.url() else {
        match initial.tracking {
            Tracking::AlreadyExists => ctx.log().info("Resource already exists, skipping wait"),
            Tracking::AlreadyGone => ctx.log().info("Resource already gone, skipping wait"),
            _ => {}
        }
        return Ok(PollOutcome::Succeeded(initial.reading.clone()));
    };

    let deadline = Instant::now() + policy.timeout;
    let mut wait = policy.wait(initial.reading.retry_after, deadline);
    let mut last: Option<PollReading> = None;
    let mut polls = 0_u32;

    loop {
        tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => {
                ctx.log().warn(format!("Stopped waiting for {url}: run cancelled"));
                return Ok(PollOutcome::Cancelled(last));
            }
            () = tokio::time::sleep(wait) => {}
        }
        if Instant::now() >= deadline {
            ctx.log().warn(format!("Gave up waiting for {url} after {}s", policy.timeout.as_secs()));
            return Ok(PollOutcome::TimedOut(last));
        }

        let reading = source.poll(url).await?;
        polls += 1;
        let state = schema.classify(&reading);
        debug!(url = %url, polls, status = reading.status, state = ?state, "Polled operation");

        match state {
            PollState::Succeeded => return Ok(PollOutcome::Succeeded(reading)),
            PollState::Failed => {
                ctx.log().warn(format!("Operation at {url} failed after {polls} polls"));
                return Ok(PollOutcome::Failed(reading));
            }
            PollState::Running => {}
        }

        wait = policy.wait(reading.retry_after, deadline);
        last = Some(reading);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted readings; repeats the last one when the script runs out.
    struct Scripted {
        readings: Mutex<VecDeque<PollReading>>,
        polls: AtomicUsize,
    }

    impl Scripted {
        fn new(readings: Vec<PollReading>) -> Self {
            Self { readings: Mutex::new(readings.into()), polls: AtomicUsize::new(0) }
        }

        fn polls(&self) -> usize {
            self.polls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PollSource for Scripted {
        async fn poll(&self, _url: &str) -> Result<PollReading> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut readings = self.readings.lock().unwrap();
            let reading = if readings.len() > 1 { readings.pop_front() } else { readings.front().cloned() };
            Ok(reading.expect("script must not be empty"))
        }
    }

    fn fast() -> PollPolicy {
        PollPolicy::new(Duration::from_millis(1), Duration::from_secs(5))
    }

    fn tracked(url: &str) -> InitialResponse {
        InitialResponse {
            tracking: Tracking::AzureAsyncOperation(url.to_string()),
            reading: PollReading::new(201, Value::Null),
        }
    }

    #[tokio::test]
    async fn test_running_then_succeeded_polls_twice() {
        let source = Scripted::new(vec![
            PollReading::new(200, json!({"status": "Running"})),
            PollReading::new(200, json!({"status": "Succeeded"})),
        ]);
        let ctx = OperationContext::detached();

        let outcome = poll_to_completion(&source, &tracked("https://arm/op"), StatusSchema::ArmBody, fast(), &ctx)
            .await
            .unwrap();

        assert_eq!(source.polls(), 2);
        assert_eq!(outcome, PollOutcome::Succeeded(PollReading::new(200, json!({"status": "Succeeded"}))));
    }

    #[tokio::test]
    async fn test_already_exists_performs_no_polls() {
        let source = Scripted::new(vec![PollReading::new(200, json!({"status": "Running"}))]);
        let initial = InitialResponse {
            tracking: Tracking::AlreadyExists,
            reading: PollReading::new(409, json!({"error": {"code": "Conflict"}})),
        };
        let ctx = OperationContext::detached();

        let outcome =
            poll_to_completion(&source, &initial, StatusSchema::ArmBody, fast(), &ctx).await.unwrap();

        assert_eq!(source.polls(), 0);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_failed_status_is_terminal() {
        let source = Scripted::new(vec![PollReading::new(200, json!({"status": "failed"}))]);
        let ctx = OperationContext::detached();

        let outcome = poll_to_completion(&source, &tracked("u"), StatusSchema::ArmBody, fast(), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome.label(), "failed");
        assert_eq!(source.polls(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_from_failure() {
        let source = Scripted::new(vec![PollReading::new(200, json!({"status": "Running"}))]);
        let ctx = OperationContext::detached();
        let policy = PollPolicy::new(Duration::from_millis(2), Duration::from_millis(20));

        let outcome =
            poll_to_completion(&source, &tracked("u"), StatusSchema::ArmBody, policy, &ctx).await.unwrap();

        assert!(matches!(outcome, PollOutcome::TimedOut(Some(_))));
        assert_eq!(outcome.to_json()["outcome"], "timed_out");
        assert!(source.polls() >= 1);
    }

    #[tokio::test]
    async fn test_retry_after_hint_does_not_outlast_timeout() {
        let running = PollReading {
            status: 200,
            body: json!({"status": "Running"}),
            retry_after: Some(Duration::from_secs(30)),
        };
        let source = Scripted::new(vec![running.clone()]);
        let initial = InitialResponse { tracking: Tracking::AzureAsyncOperation("u".to_string()), reading: running };
        let ctx = OperationContext::detached();
        let policy = PollPolicy::new(Duration::from_millis(10), Duration::from_millis(200));

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            poll_to_completion(&source, &initial, StatusSchema::ArmBody, policy, &ctx),
        )
        .await
        .expect("poll loop must stop at its timeout")
        .unwrap();

        assert_eq!(outcome.label(), "timed_out");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(source.polls(), 0);
    }

    #[tokio::test]
    async fn test_already_gone_performs_no_polls() {
        let source = Scripted::new(vec![PollReading::new(202, Value::Null)]);
        let initial = InitialResponse::from_reply(PollReading::new(404, Value::Null), &HeaderMap::new(), &[404]);
        let ctx = OperationContext::detached();

        let outcome =
            poll_to_completion(&source, &initial, StatusSchema::HttpStatus, fast(), &ctx).await.unwrap();

        assert_eq!(initial.tracking, Tracking::AlreadyGone);
        assert!(initial.tracking.is_settled());
        assert!(outcome.is_success());
        assert_eq!(source.polls(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let source = Scripted::new(vec![PollReading::new(200, json!({"status": "Running"}))]);
        let ctx = OperationContext::detached();
        ctx.cancellation().cancel();
        let policy = PollPolicy::new(Duration::from_secs(30), Duration::from_secs(60));

        let outcome =
            poll_to_completion(&source, &tracked("u"), StatusSchema::ArmBody, policy, &ctx).await.unwrap();

        assert_eq!(outcome, PollOutcome::Cancelled(None));
        assert_eq!(source.polls(), 0);
    }

    #[tokio::test]
    async fn test_deletion_polls_on_status_code() {
        let source = Scripted::new(vec![
            PollReading::new(202, Value::Null),
            PollReading::new(202, Value::Null),
            PollReading::new(200, Value::Null),
        ]);
        let ctx = OperationContext::detached();
        let initial = InitialResponse {
            tracking: Tracking::Location("https://arm/delete".to_string()),
            reading: PollReading::new(202, Value::Null),
        };

        let outcome =
            poll_to_completion(&source, &initial, StatusSchema::HttpStatus, fast(), &ctx).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(source.polls(), 3);
    }

    #[test]
    fn test_arm_classification_is_case_insensitive() {
        let read = |body: Value| StatusSchema::ArmBody.classify(&PollReading::new(200, body));
        assert_eq!(read(json!({"status": "SUCCEEDED"})), PollState::Succeeded);
        assert_eq!(read(json!({"status": "NotFound"})), PollState::Failed);
        assert_eq!(read(json!({"status": "InternalServerError"})), PollState::Failed);
        assert_eq!(read(json!({"status": "Accepted"})), PollState::Running);
        assert_eq!(
            read(json!({"properties": {"provisioningState": "Succeeded"}})),
            PollState::Succeeded
        );
        assert_eq!(
            StatusSchema::ArmBody.classify(&PollReading::new(500, Value::Null)),
            PollState::Failed
        );
    }

    #[test]
    fn test_luis_classification() {
        let read = |body: Value| StatusSchema::LuisTraining.classify(&PollReading::new(200, body));
        let model = |status: &str| json!({"modelId": "m", "details": {"status": status}});

        assert_eq!(read(json!([])), PollState::Running);
        assert_eq!(read(json!([model("Success"), model("UpToDate")])), PollState::Succeeded);
        assert_eq!(read(json!([model("Success"), model("InProgress")])), PollState::Running);
        assert_eq!(read(json!([model("Queued"), model("Fail")])), PollState::Failed);
    }

    #[test]
    fn test_initial_response_classification() {
        let mut headers = HeaderMap::new();
        headers.insert("Location", HeaderValue::from_static("https://arm/location"));
        headers.insert("Azure-AsyncOperation", HeaderValue::from_static("https://arm/async"));
        headers.insert("Retry-After", HeaderValue::from_static("7"));

        let initial = InitialResponse::from_reply(PollReading::new(201, Value::Null), &headers, &[409]);
        assert_eq!(initial.tracking, Tracking::AzureAsyncOperation("https://arm/async".to_string()));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));

        let conflict = InitialResponse::from_reply(PollReading::new(409, Value::Null), &headers, &[409]);
        assert_eq!(conflict.tracking, Tracking::AlreadyExists);

        let sync = InitialResponse::from_reply(PollReading::new(200, Value::Null), &HeaderMap::new(), &[409]);
        assert_eq!(sync.tracking, Tracking::Done);
    }
}
