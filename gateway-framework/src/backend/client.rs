//! The HTTP client spoken to a single backend worker instance.
//!
//! Grounded on `graph_api/client/{base,client}.py`: one `reqwest::Client`
//! per `ClientConfig`, every call routed through `execute_with_retry`
//! (circuit breaker check, retry with exponential backoff + jitter,
//! response classification via [`super::classify_response`]), and the
//! long-running operations (ingest/backup/restore/fork) additionally
//! offered in an `_with_sse` variant that hands off to
//! [`super::sse::monitor_task_sse`] once the worker has accepted the task.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::{json, Value};

use super::sse::{monitor_task_sse, TaskResult};
use super::ClientConfig;
use crate::errors::Error;

use super::circuit_breaker::CircuitBreaker;

/// Ingest/backup/restore calls run with `timeout_multiplier`x the client's
/// base timeout, matching `client.py`'s longer timeout for synchronous
/// ingest vs. the default request timeout.
const SYNC_OPERATION_TIMEOUT_MULTIPLIER: u32 = 30;

pub struct BackendClient {
    http: reqwest::Client,
    config: ClientConfig,
    circuit_breaker: CircuitBreaker,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub data: Vec<Value>,
    pub columns: Vec<String>,
    pub row_count: usize,
}

impl BackendClient {
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        if config.base_url.is_empty() {
            return Err(Error::Configuration(
                "base_url must be provided or set in environment".to_string(),
            ));
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_keepalive_connections)
            .pool_idle_timeout(config.keepalive_expiry)
            .danger_accept_invalid_certs(!config.verify_ssl);

        builder = builder.default_headers(Self::build_headers(&config)?);

        let http = builder
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;

        let circuit_breaker =
            CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_timeout);

        Ok(BackendClient { http, config, circuit_breaker })
    }

    fn build_headers(config: &ClientConfig) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &config.api_key {
            let value = HeaderValue::from_str(api_key)
                .map_err(|e| Error::Configuration(format!("invalid api key header: {e}")))?;
            headers.insert(HeaderName::from_static("x-graph-api-key"), value);
            tracing::debug!("backend client configured with API key");
        } else {
            tracing::debug!("backend client initialized without API key");
        }
        for (name, value) in &config.headers {
            let header_name = HeaderName::try_from(name.as_str())
                .map_err(|e| Error::Configuration(format!("invalid header name {name}: {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| Error::Configuration(format!("invalid header value for {name}: {e}")))?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_delay.as_secs_f64() * self.config.retry_backoff.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0.0..(base * 0.1).max(0.0001));
        Duration::from_secs_f64(base + jitter)
    }

    /// Route a single call through the circuit breaker and retry policy.
    /// `body` is re-invoked on each attempt since `reqwest::RequestBuilder`
    /// is not `Clone`-and-replay friendly once consumed.
    async fn execute_with_retry<F, Fut>(&self, body: F) -> Result<reqwest::Response, Error>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, Error>>,
    {
        if !self.circuit_breaker.allow_request() {
            return Err(Error::transient(
                format!(
                    "circuit breaker open for {}, retry after {:?}",
                    self.config.base_url, self.config.circuit_breaker_timeout
                ),
                None,
            ));
        }

        let mut attempt = 0u32;
        loop {
            match body().await {
                Ok(response) => {
                    self.circuit_breaker.on_success();
                    return Ok(response);
                }
                Err(err) => {
                    let retriable = err.is_retriable() && !matches!(err, Error::Syntax { .. });
                    self.circuit_breaker.on_failure();

                    if !retriable || attempt >= self.config.max_retries {
                        if retriable {
                            return Err(Error::RetriesExhausted {
                                attempts: attempt + 1,
                                last: Box::new(err),
                            });
                        }
                        return Err(err);
                    }

                    let delay = self.retry_delay(attempt);
                    tracing::debug!(attempt, delay = ?delay, "retrying backend request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        json_body: Option<Value>,
        params: Option<&[(&str, String)]>,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        let response = self
            .execute_with_retry(|| async {
                let mut builder = self.http.request(method.clone(), self.url(path));
                if let Some(body) = &json_body {
                    builder = builder.json(body);
                }
                if let Some(params) = params {
                    builder = builder.query(params);
                }
                if let Some(t) = timeout {
                    builder = builder.timeout(t);
                }

                let response = builder.send().await.map_err(Error::from)?;
                let status = response.status();
                if status.as_u16() >= 400 {
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(super::classify_response(status.as_u16(), &body_text));
                }
                Ok(response)
            })
            .await?;

        if response.content_length() == Some(0) {
            return Ok(Value::Null);
        }
        let bytes = response.bytes().await.map_err(Error::from)?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::server(format!("malformed JSON response: {e}"), None))
    }

    // -- health / metadata --------------------------------------------

    pub async fn health_check(&self) -> Result<Value, Error> {
        self.request(Method::GET, "/health", None, None, None).await
    }

    pub async fn get_info(&self) -> Result<Value, Error> {
        self.request(Method::GET, "/info", None, None, None).await
    }

    // -- databases ------------------------------------------------------

    pub async fn list_databases(&self) -> Result<Value, Error> {
        self.request(Method::GET, "/databases", None, None, None).await
    }

    pub async fn get_database(&self, graph_id: &str) -> Result<Value, Error> {
        self.request(Method::GET, &format!("/databases/{graph_id}"), None, None, None).await
    }

    pub async fn database_exists(&self, graph_id: &str) -> Result<bool, Error> {
        match self.get_database(graph_id).await {
            Ok(_) => Ok(true),
            Err(Error::Client { status: Some(404), .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// `is_subgraph` bypasses the worker's per-instance `max_databases`
    /// check; it is reserved for subgraph placement, where capacity was
    /// already accounted for against the parent.
    pub async fn create_database(
        &self,
        graph_id: &str,
        schema_type: &str,
        repository_name: Option<&str>,
        custom_schema_ddl: Option<&str>,
        is_subgraph: bool,
    ) -> Result<Value, Error> {
        let mut payload = json!({ "graph_id": graph_id, "schema_type": schema_type });
        if let Some(repo) = repository_name {
            payload["repository_name"] = json!(repo);
        }
        if let Some(ddl) = custom_schema_ddl {
            payload["custom_schema_ddl"] = json!(ddl);
        }
        if is_subgraph {
            payload["is_subgraph"] = json!(true);
        }
        self.request(Method::POST, "/databases", Some(payload), None, None).await
    }

    pub async fn delete_database(&self, graph_id: &str) -> Result<Value, Error> {
        self.request(Method::DELETE, &format!("/databases/{graph_id}"), None, None, None).await
    }

    // -- schema -----------------------------------------------------------

    pub async fn get_schema(&self, graph_id: &str) -> Result<Value, Error> {
        self.request(Method::GET, &format!("/databases/{graph_id}/schema"), None, None, None).await
    }

    /// Installs either a named base schema plus named extensions, or a raw
    /// DDL payload. `custom_ddl` takes precedence when both are supplied.
    pub async fn install_schema(
        &self,
        graph_id: &str,
        base: Option<&str>,
        extensions: Option<&[String]>,
        custom_ddl: Option<&str>,
    ) -> Result<Value, Error> {
        let payload = if let Some(ddl) = custom_ddl {
            json!({ "type": "ddl", "ddl": ddl })
        } else {
            json!({
                "type": "custom",
                "metadata": {
                    "base_schema": base,
                    "extensions": extensions.unwrap_or_default(),
                },
            })
        };
        self.request(Method::POST, &format!("/databases/{graph_id}/schema"), Some(payload), None, None)
            .await
    }

    // -- query --------------------------------------------------------

    pub async fn query(
        &self,
        graph_id: &str,
        cypher: &str,
        parameters: Option<Value>,
    ) -> Result<QueryResult, Error> {
        let mut payload = json!({ "cypher": cypher, "database": graph_id });
        if let Some(params) = parameters {
            payload["parameters"] = params;
        }
        let response = self
            .request(Method::POST, &format!("/databases/{graph_id}/query"), Some(payload), None, None)
            .await?;

        let data = response
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let columns = response
            .get("columns")
            .and_then(Value::as_array)
            .map(|c| c.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let row_count = response
            .get("row_count")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(data.len());

        Ok(QueryResult { data, columns, row_count })
    }

    /// Stream a large result set as NDJSON, one row per line, without
    /// buffering the whole response.
    pub async fn query_streaming(
        &self,
        graph_id: &str,
        cypher: &str,
        parameters: Option<Value>,
    ) -> Result<impl Stream<Item = Result<Value, Error>>, Error> {
        if !self.circuit_breaker.allow_request() {
            return Err(Error::transient(
                format!("circuit breaker open for {}", self.config.base_url),
                None,
            ));
        }

        let mut payload = json!({ "cypher": cypher, "database": graph_id });
        if let Some(params) = parameters {
            payload["parameters"] = params;
        }

        let response = self
            .http
            .post(self.url(&format!("/databases/{graph_id}/query")))
            .query(&[("streaming", "true")])
            .json(&payload)
            .send()
            .await
            .map_err(Error::from)?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body_text = response.text().await.unwrap_or_default();
            self.circuit_breaker.on_failure();
            return Err(super::classify_response(status.as_u16(), &body_text));
        }
        self.circuit_breaker.on_success();

        Ok(NdjsonStream::new(response.bytes_stream()))
    }

    pub async fn execute_ddl(&self, graph_id: &str, ddl: &str) -> Result<Value, Error> {
        let payload = json!({ "ddl": ddl, "database": graph_id });
        self.request(Method::POST, &format!("/databases/{graph_id}/ddl"), Some(payload), None, None)
            .await
    }

    pub async fn node_exists(
        &self,
        graph_id: &str,
        label: &str,
        filters: &HashMap<String, Value>,
    ) -> Result<bool, Error> {
        let conditions: Vec<String> = filters
            .keys()
            .map(|key| format!("n.{key} = ${key}"))
            .collect();
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let cypher = format!("MATCH (n:{label}){where_clause} RETURN count(n) AS count");
        let parameters = serde_json::to_value(filters).ok();
        let result = self.query(graph_id, &cypher, parameters).await?;
        let count = result
            .data
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(count > 0)
    }

    // -- ingestion --------------------------------------------------------

    /// `mode` is `"sync"` (file-path + table-name) or `"async"`
    /// (pipeline-run-id + bucket + files). Sync ingestion runs with the 30x
    /// timeout multiplier like the other synchronous long operations; async
    /// ingestion only waits for the worker to accept the task, so it keeps
    /// the base timeout.
    pub async fn ingest(&self, graph_id: &str, mode: &str, payload: Value) -> Result<Value, Error> {
        let mut body = payload;
        body["mode"] = json!(mode);
        let timeout = if mode == "async" {
            self.config.timeout
        } else {
            self.config.timeout * SYNC_OPERATION_TIMEOUT_MULTIPLIER
        };
        self.request(Method::POST, &format!("/databases/{graph_id}/ingest"), Some(body), None, Some(timeout))
            .await
    }

    /// Starts a staged-table copy (`POST /databases/{id}/copy`) and monitors
    /// it over SSE until a terminal event.
    pub async fn ingest_with_sse(
        &self,
        graph_id: &str,
        table_name: &str,
        s3_pattern: &str,
        s3_credentials: Option<Value>,
        ignore_errors: bool,
        overall_timeout: Duration,
    ) -> Result<TaskResult, Error> {
        let mut payload = json!({
            "s3_pattern": s3_pattern,
            "table_name": table_name,
            "ignore_errors": ignore_errors,
        });
        if let Some(credentials) = s3_credentials {
            payload["s3_credentials"] = credentials;
        }
        let started = self
            .request(Method::POST, &format!("/databases/{graph_id}/copy"), Some(payload), None, None)
            .await?;

        let task_id = started
            .get("task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::server("copy response missing task_id", None))?
            .to_string();
        let sse_path = started
            .get("sse_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("/tasks/{task_id}/monitor"));

        Ok(monitor_task_sse(
            &self.http,
            &self.config.base_url,
            &sse_path,
            &task_id,
            "ingestion",
            HeaderMap::new(),
            overall_timeout,
        )
        .await)
    }

    // -- tasks ------------------------------------------------------------

    pub async fn list_tasks(&self, status: Option<&str>) -> Result<Value, Error> {
        let params = status.map(|s| vec![("status", s.to_string())]);
        self.request(Method::GET, "/tasks", None, params.as_deref(), None).await
    }

    pub async fn get_task_status(&self, task_id: &str) -> Result<Value, Error> {
        self.request(Method::GET, &format!("/tasks/{task_id}/status"), None, None, None).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<Value, Error> {
        self.request(Method::DELETE, &format!("/tasks/{task_id}"), None, None, None).await
    }

    pub async fn get_queue_info(&self) -> Result<Value, Error> {
        self.request(Method::GET, "/tasks/queue/info", None, None, None).await
    }

    // -- backup / restore --------------------------------------------------

    pub async fn create_backup(&self, graph_id: &str, options: Value) -> Result<Value, Error> {
        let timeout = self.config.timeout * SYNC_OPERATION_TIMEOUT_MULTIPLIER;
        self.request(
            Method::POST,
            &format!("/databases/{graph_id}/backup"),
            Some(options),
            None,
            Some(timeout),
        )
        .await
    }

    pub async fn backup_with_sse(
        &self,
        graph_id: &str,
        options: Value,
        overall_timeout: Duration,
    ) -> Result<TaskResult, Error> {
        let mut body = options;
        body["async"] = json!(true);
        let started = self
            .request(Method::POST, &format!("/databases/{graph_id}/backup"), Some(body), None, None)
            .await?;
        let task_id = started
            .get("task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::server("backup response missing task_id", None))?
            .to_string();
        let sse_path = format!("/tasks/{task_id}/monitor");

        Ok(monitor_task_sse(
            &self.http,
            &self.config.base_url,
            &sse_path,
            &task_id,
            "backup",
            HeaderMap::new(),
            overall_timeout,
        )
        .await)
    }

    pub async fn download_backup(&self, graph_id: &str) -> Result<Bytes, Error> {
        let response = self
            .execute_with_retry(|| async {
                let response = self
                    .http
                    .post(self.url(&format!("/databases/{graph_id}/backup-download")))
                    .send()
                    .await
                    .map_err(Error::from)?;
                let status = response.status();
                if status.as_u16() >= 400 {
                    let text = response.text().await.unwrap_or_default();
                    return Err(super::classify_response(status.as_u16(), &text));
                }
                Ok(response)
            })
            .await?;
        response.bytes().await.map_err(Error::from)
    }

    pub async fn restore_backup(&self, graph_id: &str, s3_key: &str) -> Result<Value, Error> {
        let payload = json!({ "s3_key": s3_key });
        let timeout = self.config.timeout * SYNC_OPERATION_TIMEOUT_MULTIPLIER;
        self.request(Method::POST, &format!("/databases/{graph_id}/restore"), Some(payload), None, Some(timeout))
            .await
    }

    pub async fn restore_with_sse(
        &self,
        graph_id: &str,
        s3_key: &str,
        overall_timeout: Duration,
    ) -> Result<TaskResult, Error> {
        let payload = json!({ "s3_key": s3_key, "async": true });
        let started = self
            .request(Method::POST, &format!("/databases/{graph_id}/restore"), Some(payload), None, None)
            .await?;
        let task_id = started
            .get("task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::server("restore response missing task_id", None))?
            .to_string();
        let sse_path = format!("/tasks/{task_id}/monitor");

        Ok(monitor_task_sse(
            &self.http,
            &self.config.base_url,
            &sse_path,
            &task_id,
            "restore",
            HeaderMap::new(),
            overall_timeout,
        )
        .await)
    }

    /// Restoring directly from an in-memory byte buffer (rather than an S3
    /// key the worker fetches itself) has no endpoint on the worker API.
    pub async fn restore_from_bytes(&self, _graph_id: &str, _data: Bytes) -> Result<Value, Error> {
        Err(Error::Configuration(
            "restore from an in-memory buffer is not supported; use restore_backup with an S3 key"
                .to_string(),
        ))
    }

    // -- tables -------------------------------------------------------

    pub async fn create_table(&self, graph_id: &str, definition: Value) -> Result<Value, Error> {
        self.request(Method::POST, &format!("/databases/{graph_id}/tables"), Some(definition), None, None)
            .await
    }

    pub async fn list_tables(&self, graph_id: &str) -> Result<Value, Error> {
        self.request(Method::GET, &format!("/databases/{graph_id}/tables"), None, None, None).await
    }

    pub async fn query_table(&self, graph_id: &str, payload: Value) -> Result<Value, Error> {
        self.request(Method::POST, &format!("/databases/{graph_id}/tables/query"), Some(payload), None, None)
            .await
    }

    pub async fn delete_table(&self, graph_id: &str, table_name: &str) -> Result<Value, Error> {
        self.request(
            Method::DELETE,
            &format!("/databases/{graph_id}/tables/{table_name}"),
            None,
            None,
            None,
        )
        .await
    }

    pub async fn ingest_table_to_graph(
        &self,
        graph_id: &str,
        table_name: &str,
        payload: Value,
    ) -> Result<Value, Error> {
        self.request(
            Method::POST,
            &format!("/databases/{graph_id}/tables/{table_name}/ingest"),
            Some(payload),
            None,
            None,
        )
        .await
    }

    // -- fork ---------------------------------------------------------

    pub async fn fork_from_parent(
        &self,
        parent_id: &str,
        subgraph_id: &str,
        tables: Option<Vec<String>>,
        ignore_errors: bool,
    ) -> Result<Value, Error> {
        let mut payload = json!({
            "parent_graph_id": parent_id,
            "subgraph_id": subgraph_id,
            "ignore_errors": ignore_errors,
        });
        if let Some(tables) = tables {
            payload["tables"] = json!(tables);
        }
        let timeout = self.config.timeout * SYNC_OPERATION_TIMEOUT_MULTIPLIER;
        self.request(Method::POST, &format!("/databases/{subgraph_id}/fork"), Some(payload), None, Some(timeout))
            .await
    }
}

/// Decodes newline-delimited JSON from a `reqwest` byte stream without
/// buffering the whole body, one value at a time as bytes arrive.
struct NdjsonStream<S> {
    inner: S,
    buffer: String,
    upstream_done: bool,
}

impl<S> NdjsonStream<S> {
    fn new(inner: S) -> Self {
        NdjsonStream { inner, buffer: String::new(), upstream_done: false }
    }
}

impl<S> Stream for NdjsonStream<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    type Item = Result<Value, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(pos) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=pos).collect();
                let line = line.trim_end_matches('\n').trim();
                if line.is_empty() {
                    continue;
                }
                return Poll::Ready(Some(
                    serde_json::from_str(line)
                        .map_err(|e| Error::server(format!("malformed NDJSON line: {e}"), None)),
                ));
            }

            if self.upstream_done {
                let remainder = self.buffer.trim().to_string();
                self.buffer.clear();
                if remainder.is_empty() {
                    return Poll::Ready(None);
                }
                return Poll::Ready(Some(
                    serde_json::from_str(&remainder)
                        .map_err(|e| Error::server(format!("malformed NDJSON line: {e}"), None)),
                ));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(Error::from(e)))),
                Poll::Ready(None) => self.upstream_done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_empty_base_url() {
        let err = BackendClient::new(ClientConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn new_accepts_configured_base_url() {
        let client = BackendClient::new(ClientConfig::new("http://localhost:8001"));
        assert!(client.is_ok());
    }

    #[test]
    fn url_joins_path_without_double_slash() {
        let client = BackendClient::new(ClientConfig::new("http://localhost:8001/")).unwrap();
        assert_eq!(client.url("/health"), "http://localhost:8001/health");
        assert_eq!(client.url("health"), "http://localhost:8001/health");
    }

    #[tokio::test]
    async fn ndjson_stream_splits_on_newlines_across_chunks() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"{\"a\":1}\n{\"a\":")),
            Ok(Bytes::from_static(b"2}\n")),
        ];
        let source = futures::stream::iter(chunks);
        let mut stream = NdjsonStream::new(source);
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first["a"], 1);
        assert_eq!(second["a"], 2);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn ndjson_stream_flushes_trailing_line_without_newline() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![Ok(Bytes::from_static(b"{\"a\":3}"))];
        let source = futures::stream::iter(chunks);
        let mut stream = NdjsonStream::new(source);
        let value = stream.next().await.unwrap().unwrap();
        assert_eq!(value["a"], 3);
        assert!(stream.next().await.is_none());
    }
}
