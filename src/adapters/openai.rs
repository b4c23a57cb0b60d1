//! OpenAI adapter. Lists models with the key as a bearer token.

use async_trait::async_trait;

use super::settings::OpenAiSettings;
use super::*;

pub struct OpenAiAdapter;

#[async_trait]
impl ProbeAdapter for OpenAiAdapter {
    fn kind(&self) -> ServiceKind { ServiceKind::OpenAi }
    fn display_name(&self) -> &str { "OpenAI" }

    fn prepare(&self, credential: &Credential) -> Result<ProbeRequest, ProbeConfigError> {
        let settings = OpenAiSettings::from_metadata(&credential.metadata)?;
        let path = match &settings.model {
            Some(model) => format!("models/{}", model),
            None => "models".to_string(),
        };
        let mut request = ProbeRequest::get(join_url(&settings.base_url, &path)?)
            .bearer(credential.secret.expose())?;
        if let Some(org) = &settings.organization {
            request = request.header("openai-organization", org, false)?;
        }
        Ok(request)
    }
}
