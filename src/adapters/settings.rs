//! Per-service probe settings, resolved from a credential's metadata map.
//!
//! One settings type per service kind; each adapter resolves its own.
//! Unknown keys are ignored and missing keys fall back to defaults. Only
//! the Azure endpoint and the custom probe URL are required.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::ServiceKind;
use crate::vault::Metadata;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const AZURE_API_VERSION: &str = "2024-10-21";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Placeholder in custom probe headers replaced by the secret.
pub const KEY_PLACEHOLDER: &str = "{key}";

#[derive(Debug, thiserror::Error)]
pub enum ProbeConfigError {
    #[error("missing required setting '{0}'")]
    Missing(&'static str),
    #[error("invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("malformed settings: {0}")]
    Malformed(String),
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("no probe registered for service kind '{0}'")]
    NoAdapter(ServiceKind),
}

fn from_metadata<T: DeserializeOwned>(metadata: &Metadata) -> Result<T, ProbeConfigError> {
    serde_json::from_value(Value::Object(metadata.clone()))
        .map_err(|e| ProbeConfigError::Malformed(e.to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// ── OpenAI ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub organization: Option<String>,
    /// Probe this model instead of listing all models.
    pub model: Option<String>,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: OPENAI_BASE_URL.to_string(),
            organization: None,
            model: None,
        }
    }
}

impl OpenAiSettings {
    pub fn from_metadata(metadata: &Metadata) -> Result<Self, ProbeConfigError> {
        let mut settings: Self = from_metadata(metadata)?;
        settings.organization = non_empty(settings.organization);
        settings.model = non_empty(settings.model);
        Ok(settings)
    }
}

// ── Azure ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AzureSettings {
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`.
    pub endpoint: String,
    pub api_version: String,
    pub deployment: Option<String>,
}

impl Default for AzureSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_version: AZURE_API_VERSION.to_string(),
            deployment: None,
        }
    }
}

impl AzureSettings {
    pub fn from_metadata(metadata: &Metadata) -> Result<Self, ProbeConfigError> {
        let mut settings: Self = from_metadata(metadata)?;
        if settings.endpoint.trim().is_empty() {
            return Err(ProbeConfigError::Missing("endpoint"));
        }
        settings.deployment = non_empty(settings.deployment);
        Ok(settings)
    }
}

// ── Gemini ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GeminiSettings {
    pub base_url: String,
    pub model: Option<String>,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            base_url: GEMINI_BASE_URL.to_string(),
            model: None,
        }
    }
}

impl GeminiSettings {
    pub fn from_metadata(metadata: &Metadata) -> Result<Self, ProbeConfigError> {
        let mut settings: Self = from_metadata(metadata)?;
        // Accept both "gemini-2.5-flash" and "models/gemini-2.5-flash".
        settings.model = non_empty(settings.model)
            .map(|m| m.strip_prefix("models/").map(str::to_string).unwrap_or(m));
        Ok(settings)
    }
}

// ── Ollama ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OllamaSettings {
    pub base_url: String,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: OLLAMA_BASE_URL.to_string(),
        }
    }
}

impl OllamaSettings {
    pub fn from_metadata(metadata: &Metadata) -> Result<Self, ProbeConfigError> {
        from_metadata(metadata)
    }
}

// ── Custom ──────────────────────────────────────────────────────────

fn default_method() -> String {
    "GET".to_string()
}

fn default_success_codes() -> Vec<u16> {
    vec![200]
}

/// A user-defined probe: exactly the request to send and the codes that
/// count as healthy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CustomProbe {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub url: String,
    /// Header values may contain `{key}`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Strings are sent verbatim, anything else as JSON.
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default = "default_success_codes")]
    pub success_status_codes: Vec<u16>,
}

impl CustomProbe {
    /// The definition is either inline in the metadata, or under
    /// `definition` as an object or a JSON/YAML document.
    pub fn from_metadata(metadata: &Metadata) -> Result<Self, ProbeConfigError> {
        let probe: Self = match metadata.get("definition") {
            Some(Value::String(text)) => serde_yaml::from_str(text)
                .map_err(|e| ProbeConfigError::Malformed(format!("probe definition: {}", e)))?,
            Some(definition @ Value::Object(_)) => serde_json::from_value(definition.clone())
                .map_err(|e| ProbeConfigError::Malformed(format!("probe definition: {}", e)))?,
            Some(_) => {
                return Err(ProbeConfigError::Invalid {
                    field: "definition",
                    reason: "expected an object or a string".into(),
                })
            }
            None => from_metadata(metadata)?,
        };
        probe.validate()
    }

    fn validate(self) -> Result<Self, ProbeConfigError> {
        if self.url.trim().is_empty() {
            return Err(ProbeConfigError::Missing("url"));
        }
        if self.success_status_codes.is_empty() {
            return Err(ProbeConfigError::Invalid {
                field: "success_status_codes",
                reason: "must list at least one status code".into(),
            });
        }
        if let Some(code) = self.success_status_codes.iter().find(|c| !(100..=599).contains(*c)) {
            return Err(ProbeConfigError::Invalid {
                field: "success_status_codes",
                reason: format!("{} is not an HTTP status code", code),
            });
        }
        Ok(self)
    }
}
