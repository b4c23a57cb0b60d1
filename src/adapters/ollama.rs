//! Ollama adapter. Lists local models. Plain Ollama has no auth; a bearer
//! token is only sent when the credential carries one (reverse proxies).

use async_trait::async_trait;

use super::settings::OllamaSettings;
use super::*;

pub struct OllamaAdapter;

#[async_trait]
impl ProbeAdapter for OllamaAdapter {
    fn kind(&self) -> ServiceKind { ServiceKind::Ollama }
    fn display_name(&self) -> &str { "Ollama" }

    fn prepare(&self, credential: &Credential) -> Result<ProbeRequest, ProbeConfigError> {
        let settings = OllamaSettings::from_metadata(&credential.metadata)?;
        let request = ProbeRequest::get(join_url(&settings.base_url, "api/tags")?);
        if credential.secret.is_empty() {
            Ok(request)
        } else {
            request.bearer(credential.secret.expose())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::tests::credential;
    use serde_json::json;

    #[test]
    fn test_no_auth_header_without_secret() {
        let request = OllamaAdapter
            .prepare(&credential(ServiceKind::Ollama, "", json!({})))
            .unwrap();
        assert_eq!(request.url.as_str(), "http://localhost:11434/api/tags");
        assert!(request.headers.is_empty());
    }

    #[test]
    fn test_bearer_with_secret() {
        let request = OllamaAdapter
            .prepare(&credential(ServiceKind::Ollama, "proxy-token", json!({"base_url": "https://llm.internal"})))
            .unwrap();
        assert_eq!(request.url.as_str(), "https://llm.internal/api/tags");
        assert_eq!(request.headers.len(), 1);
    }
}
