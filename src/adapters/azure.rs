//! Azure OpenAI adapter. Sends the `api-key` header against a resource endpoint.

use async_trait::async_trait;

use super::settings::AzureSettings;
use super::*;

pub struct AzureAdapter;

#[async_trait]
impl ProbeAdapter for AzureAdapter {
    fn kind(&self) -> ServiceKind { ServiceKind::Azure }
    fn display_name(&self) -> &str { "Azure OpenAI" }

    fn prepare(&self, credential: &Credential) -> Result<ProbeRequest, ProbeConfigError> {
        let settings = AzureSettings::from_metadata(&credential.metadata)?;
        let path = match &settings.deployment {
            Some(deployment) => format!("openai/deployments/{}", deployment),
            None => "openai/models".to_string(),
        };
        let mut url = join_url(&settings.endpoint, &path)?;
        url.query_pairs_mut().append_pair("api-version", &settings.api_version);

        ProbeRequest::get(url).header("api-key", credential.secret.expose(), true)
    }
}
