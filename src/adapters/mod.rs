//! Service probes, one adapter per service kind.
//!
//! An adapter turns a credential into a single HTTP request against its
//! service and reports what came back. Adapters never return errors: bad
//! settings and transport failures are folded into the `RawResult`, so
//! every probe attempt still ends up as exactly one recorded outcome.
//! Adding a service = implementing `ProbeAdapter` in a new file, then
//! registering it in `AdapterRegistry::with_defaults`.

pub mod azure;
pub mod custom;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod settings;

use async_trait::async_trait;
use http::{HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub use settings::ProbeConfigError;

use crate::vault::Credential;

/// Per-probe timeout, identical for every service kind.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest response body kept as error detail.
const MAX_DETAIL_CHARS: usize = 1000;

/// Bytes of a probe response read before the rest is discarded.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

// ── Service kinds ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    OpenAi,
    #[serde(alias = "azure_openai")]
    Azure,
    #[serde(alias = "google")]
    Gemini,
    Ollama,
    Custom,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 5] = [
        ServiceKind::OpenAi,
        ServiceKind::Azure,
        ServiceKind::Gemini,
        ServiceKind::Ollama,
        ServiceKind::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::OpenAi => "openai",
            ServiceKind::Azure => "azure",
            ServiceKind::Gemini => "gemini",
            ServiceKind::Ollama => "ollama",
            ServiceKind::Custom => "custom",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown service kind '{0}'")]
pub struct UnknownServiceKind(pub String);

impl FromStr for ServiceKind {
    type Err = UnknownServiceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ServiceKind::OpenAi),
            "azure" | "azure_openai" => Ok(ServiceKind::Azure),
            "gemini" | "google" => Ok(ServiceKind::Gemini),
            "ollama" => Ok(ServiceKind::Ollama),
            "custom" => Ok(ServiceKind::Custom),
            _ => Err(UnknownServiceKind(s.to_string())),
        }
    }
}

// ── Probe results ───────────────────────────────────────────────────

/// What a single probe observed, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    /// A response came back (whatever its status code).
    pub succeeded: bool,
    pub http_status: Option<u16>,
    /// Response body, or the failure description when nothing came back.
    pub body_or_error: String,
    /// Wall-clock time from request start to body read or failure.
    pub elapsed_ms: f64,
}

impl RawResult {
    pub fn transport_failure(error: String, elapsed_ms: f64) -> Self {
        Self {
            succeeded: false,
            http_status: None,
            body_or_error: error,
            elapsed_ms,
        }
    }

    pub fn config_invalid(err: &ProbeConfigError) -> Self {
        Self::transport_failure(format!("invalid probe configuration: {}", err), 0.0)
    }

    /// Human-readable failure detail; never empty.
    pub fn error_detail(&self) -> String {
        let body = self.body_or_error.trim();
        match (body.is_empty(), self.http_status) {
            (true, Some(code)) => format!("HTTP {}", code),
            (true, None) => "probe failed without a response".to_string(),
            (false, _) => truncate_chars(body, MAX_DETAIL_CHARS),
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// How to turn a status code into a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuccessCriterion {
    /// 200 ok, 401 expired, 429 rate limited, anything else an error.
    Standard,
    /// Success iff the code is in the set; no finer attribution.
    StatusCodes(BTreeSet<u16>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub raw: RawResult,
    pub criterion: SuccessCriterion,
}

// ── Probe requests ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ProbeBody {
    Text(String),
    Json(serde_json::Value),
}

/// A fully-resolved probe, ready to send.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub method: Method,
    pub url: reqwest::Url,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Option<ProbeBody>,
    pub criterion: SuccessCriterion,
}

impl ProbeRequest {
    pub fn get(url: reqwest::Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: Vec::new(),
            body: None,
            criterion: SuccessCriterion::Standard,
        }
    }

    pub fn header(mut self, name: &str, value: &str, sensitive: bool) -> Result<Self, ProbeConfigError> {
        self.headers.push(build_header(name, value, sensitive)?);
        Ok(self)
    }

    pub fn bearer(self, secret: &str) -> Result<Self, ProbeConfigError> {
        self.header("authorization", &format!("Bearer {}", secret), true)
    }
}

pub(crate) fn build_header(
    name: &str,
    value: &str,
    sensitive: bool,
) -> Result<(HeaderName, HeaderValue), ProbeConfigError> {
    let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| ProbeConfigError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    let mut header_value = HeaderValue::from_str(value).map_err(|e| ProbeConfigError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    header_value.set_sensitive(sensitive);
    Ok((header_name, header_value))
}

/// Join a base URL and a path, tolerating trailing/leading slashes.
pub(crate) fn join_url(base: &str, path: &str) -> Result<reqwest::Url, ProbeConfigError> {
    let joined = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    reqwest::Url::parse(&joined).map_err(|e| ProbeConfigError::InvalidUrl {
        url: joined.clone(),
        reason: e.to_string(),
    })
}

/// Send a probe and time it. Never fails: transport errors become a
/// `RawResult` with no status.
pub async fn execute(client: &reqwest::Client, request: ProbeRequest) -> ProbeReport {
    let ProbeRequest {
        method,
        url,
        headers,
        body,
        criterion,
    } = request;

    let mut builder = client.request(method, url).timeout(PROBE_TIMEOUT);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder = match body {
        Some(ProbeBody::Text(text)) => builder.body(text),
        Some(ProbeBody::Json(value)) => builder.json(&value),
        None => builder,
    };

    let start = Instant::now();
    let raw = match builder.send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            match read_body(resp).await {
                Ok(body) => RawResult {
                    succeeded: true,
                    http_status: Some(status),
                    body_or_error: body,
                    elapsed_ms: elapsed_ms(start),
                },
                Err(e) => RawResult::transport_failure(describe_transport_error(e), elapsed_ms(start)),
            }
        }
        Err(e) => RawResult::transport_failure(describe_transport_error(e), elapsed_ms(start)),
    };

    ProbeReport { raw, criterion }
}

/// Read at most `MAX_BODY_BYTES` of the body; the connection is dropped
/// with anything left unread.
async fn read_body(mut resp: reqwest::Response) -> Result<String, reqwest::Error> {
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = MAX_BODY_BYTES - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Describe a reqwest failure without echoing the request URL.
fn describe_transport_error(err: reqwest::Error) -> String {
    if err.is_timeout() {
        return format!("request timed out after {}s", PROBE_TIMEOUT.as_secs());
    }
    let err = err.without_url();
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }
    message
}

/// Probe an already-prepared request, or report why it could not be prepared.
pub(crate) async fn run_prepared(
    client: &reqwest::Client,
    prepared: Result<ProbeRequest, ProbeConfigError>,
) -> ProbeReport {
    match prepared {
        Ok(request) => execute(client, request).await,
        Err(e) => ProbeReport {
            raw: RawResult::config_invalid(&e),
            criterion: SuccessCriterion::Standard,
        },
    }
}

// ── Adapter trait ───────────────────────────────────────────────────

/// The probe contract every service kind implements.
#[async_trait]
pub trait ProbeAdapter: Send + Sync {
    fn kind(&self) -> ServiceKind;

    fn display_name(&self) -> &str;

    /// Resolve the credential's settings into the request to send.
    fn prepare(&self, credential: &Credential) -> Result<ProbeRequest, ProbeConfigError>;

    /// Probe one credential. The secret must not be logged or cached.
    async fn probe(&self, client: &reqwest::Client, credential: &Credential) -> ProbeReport {
        run_prepared(client, self.prepare(credential)).await
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// Dispatch table from service kind to adapter, sharing one HTTP client.
pub struct AdapterRegistry {
    client: reqwest::Client,
    adapters: HashMap<ServiceKind, Arc<dyn ProbeAdapter>>,
}

impl AdapterRegistry {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            adapters: HashMap::new(),
        }
    }

    /// Registry with every built-in adapter installed.
    pub fn with_defaults() -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("keywatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let mut registry = Self::new(client);
        registry.register(Arc::new(openai::OpenAiAdapter));
        registry.register(Arc::new(azure::AzureAdapter));
        registry.register(Arc::new(gemini::GeminiAdapter));
        registry.register(Arc::new(ollama::OllamaAdapter));
        registry.register(Arc::new(custom::CustomAdapter));
        Ok(registry)
    }

    /// Install an adapter, replacing any previous one for the same kind.
    pub fn register(&mut self, adapter: Arc<dyn ProbeAdapter>) -> Option<Arc<dyn ProbeAdapter>> {
        self.adapters.insert(adapter.kind(), adapter)
    }

    pub fn get(&self, kind: ServiceKind) -> Option<&Arc<dyn ProbeAdapter>> {
        self.adapters.get(&kind)
    }

    /// Service kinds that currently have an adapter.
    pub fn kinds(&self) -> Vec<ServiceKind> {
        ServiceKind::ALL
            .into_iter()
            .filter(|kind| self.adapters.contains_key(kind))
            .collect()
    }

    /// Check that a credential's settings resolve to a sendable request.
    pub fn validate(&self, credential: &Credential) -> Result<(), ProbeConfigError> {
        match self.get(credential.service) {
            Some(adapter) => adapter.prepare(credential).map(|_| ()),
            None => Err(ProbeConfigError::NoAdapter(credential.service)),
        }
    }

    pub async fn probe(&self, credential: &Credential) -> ProbeReport {
        match self.get(credential.service) {
            Some(adapter) => {
                debug!(key_id = %credential.id, adapter = adapter.display_name(), "Probing key...");
                adapter.probe(&self.client, credential).await
            }
            None => ProbeReport {
                raw: RawResult::config_invalid(&ProbeConfigError::NoAdapter(credential.service)),
                criterion: SuccessCriterion::Standard,
            },
        }
    }
}
