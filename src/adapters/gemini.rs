//! Google Gemini adapter for the generativelanguage REST API.
//!
//! The key travels in `x-goog-api-key`, never in the query string, so it
//! cannot leak through URLs in error messages.

use async_trait::async_trait;

use super::settings::GeminiSettings;
use super::*;

pub struct GeminiAdapter;

#[async_trait]
impl ProbeAdapter for GeminiAdapter {
    fn kind(&self) -> ServiceKind { ServiceKind::Gemini }
    fn display_name(&self) -> &str { "Google Gemini" }

    fn prepare(&self, credential: &Credential) -> Result<ProbeRequest, ProbeConfigError> {
        let settings = GeminiSettings::from_metadata(&credential.metadata)?;
        let path = match &settings.model {
            Some(model) => format!("models/{}", model),
            None => "models".to_string(),
        };
        ProbeRequest::get(join_url(&settings.base_url, &path)?)
            .header("x-goog-api-key", credential.secret.expose(), true)
    }
}
