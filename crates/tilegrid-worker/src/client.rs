//! Worker RPC client.
//!
//! Two calls cross the wire: a load query and a task start. Both are plain
//! HTTP/1.1 JSON requests over a fresh connection with a hard timeout, so
//! an unreachable worker costs one timeout and never blocks the caller
//! indefinitely.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use tilegrid_state::{TaskExecution, WorkerInfo};

/// Failure talking to a worker. Never fatal to the dispatcher.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("request to {endpoint} failed: {reason}")]
    Request { endpoint: String, reason: String },

    #[error("{endpoint} answered HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("{endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("invalid response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },
}

impl WorkerError {
    /// The worker could not be reached at all (as opposed to answering
    /// with an error).
    pub fn is_unreachable(&self) -> bool {
        matches!(self, WorkerError::Connect { .. } | WorkerError::Timeout { .. })
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Boxed future returned by [`WorkerClient`] methods.
pub type WorkerFuture<'a, T> = Pin<Box<dyn Future<Output = WorkerResult<T>> + Send + 'a>>;

/// Live status a worker reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Work units currently running. Negative means the worker does not know.
    pub task_load: f64,
    #[serde(default)]
    pub local_work_capacity: Option<f64>,
    #[serde(default)]
    pub cluster_work_capacity: Option<f64>,
}

impl WorkerStatus {
    /// Reported capacity for the class the worker dispatches to.
    pub fn capacity_for(&self, cluster: bool) -> Option<f64> {
        if cluster {
            self.cluster_work_capacity
        } else {
            self.local_work_capacity
        }
    }
}

/// What a worker needs to run one task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPayload {
    pub execution_id: String,
    pub stage_id: String,
    pub task_id: String,
    pub tile_relative_path: String,
    pub script: String,
    pub interpreter: Option<String>,
    pub args: Vec<String>,
    pub log_file: String,
    pub expected_exit_code: i32,
    pub is_cluster: bool,
    pub work_units: f64,
}

impl From<&TaskExecution> for ExecutionPayload {
    fn from(exec: &TaskExecution) -> Self {
        Self {
            execution_id: exec.id.clone(),
            stage_id: exec.stage_id.clone(),
            task_id: exec.task_id.clone(),
            tile_relative_path: exec.tile_relative_path.clone(),
            script: exec.resolved_script.clone(),
            interpreter: exec.resolved_interpreter.clone(),
            args: exec.resolved_args.clone(),
            log_file: exec.log_file.clone(),
            expected_exit_code: exec.expected_exit_code,
            is_cluster: exec.is_cluster,
            work_units: exec.work_units,
        }
    }
}

/// Worker's acknowledgement of a started execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartedExecution {
    /// Worker-side (or cluster job) id, if the worker assigns one.
    #[serde(default)]
    pub remote_execution_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<u64>,
}

/// Remote worker operations the dispatcher depends on.
pub trait WorkerClient: Send + Sync {
    fn query_worker<'a>(&'a self, worker: &'a WorkerInfo) -> WorkerFuture<'a, WorkerStatus>;

    fn start_task_execution<'a>(
        &'a self,
        worker: &'a WorkerInfo,
        payload: &'a ExecutionPayload,
    ) -> WorkerFuture<'a, StartedExecution>;
}

/// [`WorkerClient`] over HTTP/1.1 using hyper.
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    timeout: Duration,
}

impl HttpWorkerClient {
    pub const STATUS_PATH: &'static str = "/api/v1/status";
    pub const EXECUTIONS_PATH: &'static str = "/api/v1/executions";

    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        method: http::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> WorkerResult<T> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, send(endpoint, method, path, body)).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout {
                endpoint: endpoint.to_string(),
                timeout,
            }),
        }
    }
}

impl WorkerClient for HttpWorkerClient {
    fn query_worker<'a>(&'a self, worker: &'a WorkerInfo) -> WorkerFuture<'a, WorkerStatus> {
        Box::pin(async move {
            let endpoint = worker.endpoint();
            self.call(&endpoint, http::Method::GET, Self::STATUS_PATH, None)
                .await
        })
    }

    fn start_task_execution<'a>(
        &'a self,
        worker: &'a WorkerInfo,
        payload: &'a ExecutionPayload,
    ) -> WorkerFuture<'a, StartedExecution> {
        Box::pin(async move {
            let endpoint = worker.endpoint();
            let body = serde_json::to_vec(payload).map_err(|e| WorkerError::Request {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
            self.call(&endpoint, http::Method::POST, Self::EXECUTIONS_PATH, Some(body))
                .await
        })
    }
}

async fn send<T: DeserializeOwned>(
    endpoint: &str,
    method: http::Method,
    path: &str,
    body: Option<Vec<u8>>,
) -> WorkerResult<T> {
    let uri = format!("http://{endpoint}{path}");

    let stream = tokio::net::TcpStream::connect(endpoint)
        .await
        .map_err(|e| WorkerError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| WorkerError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method(method)
        .uri(&uri)
        .header("host", endpoint)
        .header("user-agent", "tilegrid-worker/0.1")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.unwrap_or_default())))
        .map_err(|e| WorkerError::Request {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| WorkerError::Request {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

    let status = resp.status();
    if !status.is_success() {
        debug!(%uri, %status, "worker call non-2xx");
        return Err(WorkerError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        });
    }

    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| WorkerError::Request {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?
        .to_bytes();

    serde_json::from_slice(&bytes).map_err(|e| WorkerError::Decode {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })
}
