//! Unix socket JSON-RPC server.
//!
//! Listens on `<data_dir>/keywatch.sock` for newline-delimited JSON-RPC 2.0
//! requests. Local-only, no TCP exposure and no caller authentication.
//! Key views returned here never contain the secret.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{debug, error, info};

use crate::adapters::ServiceKind;
use crate::monitor::scheduler::Scheduler;
use crate::monitor::{HealthMonitor, MonitorError};
use crate::vault::{Metadata, NewCredential, Secret};

/// Longest accepted request line, newline included.
const MAX_REQUEST_BYTES: u64 = 1_048_576;

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const STORE_ERROR: i32 = -32000;
const NOT_FOUND: i32 = -32004;

// ── JSON-RPC Types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    params: Option<Value>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0".into(), result: Some(result), error: None, id }
    }
    fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self { jsonrpc: "2.0".into(), result: None, error: Some(JsonRpcError { code, message }), id }
    }
    fn from_monitor_error(id: Option<Value>, err: MonitorError) -> Self {
        match err {
            MonitorError::NotFound(key_id) => Self::error(id, NOT_FOUND, format!("Key '{}' not found", key_id)),
            MonitorError::Store(e) => {
                error!("Store failure while serving request: {}", e);
                Self::error(id, STORE_ERROR, e.to_string())
            }
        }
    }
}

// ── Server ──────────────────────────────────────────────────────────

pub struct Server {
    socket_path: PathBuf,
    monitor: Arc<HealthMonitor>,
    scheduler: Arc<Scheduler>,
}

impl Server {
    pub fn new(socket_path: PathBuf, monitor: Arc<HealthMonitor>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            socket_path,
            monitor,
            scheduler,
        }
    }

    pub async fn run(&self) -> Result<()> {
        // Remove stale socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(socket = %self.socket_path.display(), "🔭 keywatch server listening");

        loop {
            let (stream, _) = listener.accept().await?;
            let monitor = Arc::clone(&self.monitor);
            let scheduler = Arc::clone(&self.scheduler);

            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                serve_connection(reader, writer, &monitor, &scheduler, MAX_REQUEST_BYTES).await;
            });
        }
    }
}

/// Answer newline-delimited requests until EOF. The byte limit applies to
/// each request line; a line over it gets an error and ends the connection.
async fn serve_connection<R, W>(
    reader: R,
    mut writer: W,
    monitor: &HealthMonitor,
    scheduler: &Scheduler,
    max_request_bytes: u64,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader.take(max_request_bytes));
    let mut line = String::new();

    loop {
        line.clear();
        reader.get_mut().set_limit(max_request_bytes);
        let response = match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) if !line.ends_with('\n') && reader.get_ref().limit() == 0 => {
                debug!(limit = max_request_bytes, "Request line too large, closing connection");
                JsonRpcResponse::error(None, INVALID_REQUEST, "Request too large".into())
            }
            Ok(_) => {
                if line.trim().is_empty() {
                    continue;
                }
                handle_request(&line, monitor, scheduler).await
            }
            Err(e) => {
                debug!("Connection read failed: {}", e);
                break;
            }
        };

        let resp_json = serde_json::to_string(&response).unwrap_or_default();
        if writer.write_all(resp_json.as_bytes()).await.is_err() { break; }
        if writer.write_all(b"\n").await.is_err() { break; }
        if response.error.as_ref().is_some_and(|e| e.code == INVALID_REQUEST) {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

// ── Params ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AddKeyParams {
    service: ServiceKind,
    name: String,
    #[serde(alias = "key_value")]
    secret: String,
    #[serde(default, alias = "metadata_json")]
    metadata: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    id: String,
    limit: Option<usize>,
}

fn parse_params<T: serde::de::DeserializeOwned>(id: &Option<Value>, params: Value) -> Result<T, JsonRpcResponse> {
    serde_json::from_value(params)
        .map_err(|e| JsonRpcResponse::error(id.clone(), INVALID_PARAMS, format!("Invalid params: {}", e)))
}

// ── Request Handling ────────────────────────────────────────────────

async fn handle_request(raw: &str, monitor: &HealthMonitor, scheduler: &Scheduler) -> JsonRpcResponse {
    let req: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => return JsonRpcResponse::error(None, PARSE_ERROR, format!("Parse error: {}", e)),
    };

    debug!(method = %req.method, "Request");
    let params = req.params.unwrap_or(Value::Null);

    match req.method.as_str() {
        "kw.keys.add" => handle_add_key(req.id, params, monitor).await,
        "kw.keys.list" => handle_list_keys(req.id, monitor),
        "kw.keys.get" => handle_get_key(req.id, params, monitor),
        "kw.keys.remove" => handle_remove_key(req.id, params, monitor),
        "kw.checks.trigger" => handle_trigger(req.id, params, monitor).await,
        "kw.checks.list" => handle_list_checks(req.id, params, monitor),
        "kw.status" => handle_status(req.id, monitor, scheduler),
        _ => JsonRpcResponse::error(req.id, METHOD_NOT_FOUND, format!("Unknown method: {}", req.method)),
    }
}

async fn handle_add_key(id: Option<Value>, params: Value, monitor: &HealthMonitor) -> JsonRpcResponse {
    let params: AddKeyParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let new = NewCredential {
        service: params.service,
        name: params.name,
        secret: Secret::new(params.secret),
        metadata: params.metadata.unwrap_or_default(),
    };

    match monitor.register(new).await {
        Ok(reg) => JsonRpcResponse::success(id, json!({ "key": reg.credential, "check": reg.outcome })),
        Err(e) => JsonRpcResponse::from_monitor_error(id, e),
    }
}

fn handle_list_keys(id: Option<Value>, monitor: &HealthMonitor) -> JsonRpcResponse {
    match monitor.list() {
        Ok(keys) => JsonRpcResponse::success(id, json!({ "keys": keys })),
        Err(e) => JsonRpcResponse::from_monitor_error(id, e),
    }
}

fn handle_get_key(id: Option<Value>, params: Value, monitor: &HealthMonitor) -> JsonRpcResponse {
    let params: IdParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match monitor.get(&params.id) {
        Ok(key) => JsonRpcResponse::success(id, json!({ "key": key })),
        Err(e) => JsonRpcResponse::from_monitor_error(id, e),
    }
}

fn handle_remove_key(id: Option<Value>, params: Value, monitor: &HealthMonitor) -> JsonRpcResponse {
    let params: IdParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match monitor.remove(&params.id) {
        Ok(_) => JsonRpcResponse::success(id, json!({ "ok": true, "removed": params.id })),
        Err(e) => JsonRpcResponse::from_monitor_error(id, e),
    }
}

async fn handle_trigger(id: Option<Value>, params: Value, monitor: &HealthMonitor) -> JsonRpcResponse {
    let params: IdParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match monitor.trigger(&params.id).await {
        Ok(outcome) => JsonRpcResponse::success(id, json!({ "check": outcome })),
        Err(e) => JsonRpcResponse::from_monitor_error(id, e),
    }
}

fn handle_list_checks(id: Option<Value>, params: Value, monitor: &HealthMonitor) -> JsonRpcResponse {
    let params: HistoryParams = match parse_params(&id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match monitor.history(&params.id, params.limit) {
        Ok(checks) => JsonRpcResponse::success(id, json!({ "checks": checks })),
        Err(e) => JsonRpcResponse::from_monitor_error(id, e),
    }
}

fn handle_status(id: Option<Value>, monitor: &HealthMonitor, scheduler: &Scheduler) -> JsonRpcResponse {
    let keys = match monitor.list() {
        Ok(keys) => keys.len(),
        Err(e) => return JsonRpcResponse::from_monitor_error(id, e),
    };
    let config = scheduler.config();
    JsonRpcResponse::success(
        id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "scheduler": {
                "state": scheduler.state(),
                "interval_secs": config.interval.as_secs(),
                "max_concurrency": config.max_concurrency,
                "last_tick": scheduler.last_tick(),
            },
            "services": monitor.services(),
            "keys": keys,
        }),
    )
}
