//! Generic long-task monitor over Server-Sent Events.
//!
//! Ingestion, backup, restore and fork all follow the same shape in the
//! source: a POST starts the task and returns `{task_id, sse_url}`, then a
//! separate SSE connection delivers `heartbeat`/`progress`/`completed`/
//! `failed`/`error` events until a terminal one arrives (`client.py`'s
//! `_monitor_ingestion_sse`/`_monitor_task_sse`). This module is the one
//! reusable implementation every `*_with_sse` operation on `BackendClient`
//! calls into, per the §9 redesign note.
//!
//! Notably, this never returns a transport-level `Result` for a started
//! task: every failure mode (connection error, malformed stream, deadline)
//! is folded into `TaskResult { status: Failed, .. }`, matching the
//! source's blanket `except Exception` that always returns a dict.

use std::time::{Duration, Instant};

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use serde_json::Value;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);
const STALE_HEARTBEAT_WARNING: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub status: TaskOutcome,
    pub task_id: String,
    pub records_loaded: Option<u64>,
    pub duration_seconds: Option<f64>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl TaskResult {
    fn failed(task_id: &str, error: impl Into<String>) -> Self {
        TaskResult {
            status: TaskOutcome::Failed,
            task_id: task_id.to_string(),
            records_loaded: None,
            duration_seconds: None,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Connect to `<base_url><sse_path>` and monitor `task_id` until a terminal
/// event, the overall `timeout` elapses, or the stream ends early.
pub async fn monitor_task_sse(
    http: &reqwest::Client,
    base_url: &str,
    sse_path: &str,
    task_id: &str,
    task_type: &str,
    headers: HeaderMap,
    timeout: Duration,
) -> TaskResult {
    let url = format!("{}{}", base_url.trim_end_matches('/'), sse_path);
    let task_id_owned = task_id.to_string();

    let body = async move {
        let response = match http.get(&url).headers(headers).send().await {
            Ok(r) => r,
            Err(e) => return TaskResult::failed(&task_id_owned, format!("SSE connection error: {e}")),
        };
        if !response.status().is_success() {
            return TaskResult::failed(
                &task_id_owned,
                format!("SSE endpoint returned {}", response.status()),
            );
        }

        let mut stream = response.bytes_stream().eventsource();
        let mut last_heartbeat = Instant::now();
        let mut last_progress_log = Instant::now() - PROGRESS_LOG_INTERVAL;

        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(task_id = %task_id_owned, error = %e, "SSE transport error, skipping event");
                    continue;
                }
            };

            let data: Value = if event.data.is_empty() {
                Value::Null
            } else {
                match serde_json::from_str(&event.data) {
                    Ok(v) => v,
                    Err(_) => {
                        tracing::warn!(task_id = %task_id_owned, raw = %event.data, "unparseable SSE event data, skipping");
                        continue;
                    }
                }
            };

            match event.event.as_str() {
                "heartbeat" => {
                    last_heartbeat = Instant::now();
                    tracing::debug!(task_id = %task_id_owned, task_type, "heartbeat");
                }
                "progress" => {
                    if last_progress_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                        tracing::info!(task_id = %task_id_owned, task_type, progress = %data, "task progress");
                        last_progress_log = Instant::now();
                    }
                }
                "completed" => {
                    let result = data.get("result").cloned();
                    let duration = data.get("duration_seconds").and_then(Value::as_f64);
                    let records_loaded = result
                        .as_ref()
                        .and_then(|r| r.get("records_loaded"))
                        .and_then(Value::as_u64);
                    tracing::info!(task_id = %task_id_owned, task_type, "task completed");
                    return TaskResult {
                        status: TaskOutcome::Completed,
                        task_id: task_id_owned,
                        records_loaded,
                        duration_seconds: duration,
                        result,
                        error: None,
                    };
                }
                "failed" | "error" => {
                    let error = data
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string();
                    tracing::error!(task_id = %task_id_owned, task_type, error, "task failed");
                    return TaskResult::failed(&task_id_owned, error);
                }
                other => {
                    tracing::debug!(task_id = %task_id_owned, event = other, "ignoring unrecognized SSE event type");
                }
            }

            if last_heartbeat.elapsed() > STALE_HEARTBEAT_WARNING {
                tracing::warn!(task_id = %task_id_owned, "no heartbeat for 120s, connection may be stale");
            }
        }

        TaskResult::failed(&task_id_owned, "SSE stream ended unexpectedly")
    };

    match tokio::time::timeout(timeout, body).await {
        Ok(result) => result,
        Err(_) => TaskResult::failed(task_id, format!("Timeout after {} seconds", timeout.as_secs())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_result_carries_error_and_no_data() {
        let result = TaskResult::failed("t-1", "boom");
        assert_eq!(result.status, TaskOutcome::Failed);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert!(result.records_loaded.is_none());
    }

    #[tokio::test]
    async fn connection_error_becomes_failed_result_not_a_panic() {
        let http = reqwest::Client::new();
        let result = monitor_task_sse(
            &http,
            "http://127.0.0.1:1", // nothing listens here
            "/tasks/t-1/monitor",
            "t-1",
            "ingestion",
            HeaderMap::new(),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(result.status, TaskOutcome::Failed);
        assert!(result.error.is_some());
    }
}
