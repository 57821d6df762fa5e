//! # Continuation Queue
//!
//! Durable, at-least-once, delayed dispatch of HTTP requests back into this
//! service. Every hop of a pipeline run is one dispatch; the payload it
//! carries is the run's only continuation.

use super::errors::MessagingError;
use crate::cloud::{GoogleApiClient, TokenSource};
use crate::logging::log_dispatch_operation;
use crate::orchestration::step::HttpMethod;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One scheduled invocation of a service endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub queue_id: String,
    pub method: HttpMethod,
    /// Path plus query string, relative to the service root
    pub relative_uri: String,
    /// Encoded payload; only POST requests carry a body
    pub body: Option<String>,
    pub delay: Duration,
}

impl DispatchRequest {
    pub fn new(
        queue_id: impl Into<String>,
        method: HttpMethod,
        relative_uri: impl Into<String>,
        body: Option<String>,
        delay: Duration,
    ) -> Result<Self, MessagingError> {
        let relative_uri = relative_uri.into();
        let body = match method {
            HttpMethod::Post => Some(body.ok_or_else(|| MessagingError::MissingBody {
                relative_uri: relative_uri.clone(),
            })?),
            HttpMethod::Get => None,
        };

        Ok(Self {
            queue_id: queue_id.into(),
            method,
            relative_uri,
            body,
            delay,
        })
    }

    pub fn schedule_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.delay).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[async_trait]
pub trait ContinuationQueue: Send + Sync {
    /// Schedule the request; returns the queue's name for the created task
    async fn dispatch(&self, request: DispatchRequest) -> Result<String, MessagingError>;
}

/// Cloud Tasks REST queue routing to an App Engine service
#[derive(Debug, Clone)]
pub struct CloudTasksQueue {
    api: GoogleApiClient,
    project: String,
    location: String,
    service: String,
}

impl CloudTasksQueue {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn TokenSource>,
        project: impl Into<String>,
        location: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            api: GoogleApiClient::new(http, tokens),
            project: project.into(),
            location: location.into(),
            service: service.into(),
        }
    }

    fn tasks_url(&self, queue_id: &str) -> String {
        format!(
            "https://cloudtasks.googleapis.com/v2/projects/{}/locations/{}/queues/{}/tasks",
            self.project, self.location, queue_id
        )
    }

    /// Request body for `tasks.create`. The delivered request body is the
    /// encoded payload itself, so it is base64-wrapped once more for the
    /// API's bytes field.
    pub(crate) fn task_body(&self, request: &DispatchRequest, now: DateTime<Utc>) -> serde_json::Value {
        let mut http_request = json!({
            "httpMethod": request.method.as_str(),
            "relativeUri": request.relative_uri,
            "appEngineRouting": { "service": self.service },
        });
        if let Some(body) = &request.body {
            http_request["body"] = json!(STANDARD.encode(body));
        }

        json!({
            "task": {
                "appEngineHttpRequest": http_request,
                "scheduleTime": request.schedule_time(now).to_rfc3339(),
            }
        })
    }
}

#[async_trait]
impl ContinuationQueue for CloudTasksQueue {
    async fn dispatch(&self, request: DispatchRequest) -> Result<String, MessagingError> {
        let url = reqwest::Url::parse(&self.tasks_url(&request.queue_id)).map_err(|e| {
            MessagingError::configuration("cloud_tasks", format!("Invalid queue URL: {e}"))
        })?;
        let body = self.task_body(&request, Utc::now());

        debug!(queue = %request.queue_id, uri = %request.relative_uri, "Creating continuation task");
        let response = self
            .api
            .send_json("cloudtasks", Method::POST, url, Some(&body))
            .await?;

        let task_name = response["name"].as_str().unwrap_or_default().to_string();
        log_dispatch_operation(
            &request.queue_id,
            &request.relative_uri,
            request.method.as_str(),
            request.delay.as_secs(),
            "created",
        );
        info!(task_name = %task_name, "Created continuation task");
        Ok(task_name)
    }
}

/// Queue that records dispatches instead of sending them. Used by the test
/// environment and by tests asserting on what a handler scheduled.
#[derive(Debug, Default)]
pub struct RecordingQueue {
    dispatched: Mutex<Vec<DispatchRequest>>,
    failure: Mutex<Option<String>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) -> Vec<DispatchRequest> {
        self.dispatched.lock().clone()
    }

    pub fn last(&self) -> Option<DispatchRequest> {
        self.dispatched.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.dispatched.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatched.lock().is_empty()
    }

    pub fn clear(&self) {
        self.dispatched.lock().clear();
    }

    /// Make every following dispatch fail with `message`
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(message.into());
    }

    /// Accept dispatches again after [`RecordingQueue::fail_with`]
    pub fn recover(&self) {
        *self.failure.lock() = None;
    }
}

#[async_trait]
impl ContinuationQueue for RecordingQueue {
    async fn dispatch(&self, request: DispatchRequest) -> Result<String, MessagingError> {
        if let Some(message) = self.failure.lock().clone() {
            return Err(MessagingError::queue_operation(
                request.queue_id,
                "create_task",
                message,
            ));
        }

        log_dispatch_operation(
            &request.queue_id,
            &request.relative_uri,
            request.method.as_str(),
            request.delay.as_secs(),
            "recorded",
        );
        let mut dispatched = self.dispatched.lock();
        dispatched.push(request);
        Ok(format!("recorded-{}", dispatched.len()))
    }
}
