//! Custom adapter. Sends exactly the request the credential defines.
//!
//! Success is membership of the status code in the configured set; there
//! is no expired/rate-limited attribution for arbitrary services.

use async_trait::async_trait;

use super::settings::{CustomProbe, KEY_PLACEHOLDER};
use super::*;

pub struct CustomAdapter;

#[async_trait]
impl ProbeAdapter for CustomAdapter {
    fn kind(&self) -> ServiceKind { ServiceKind::Custom }
    fn display_name(&self) -> &str { "Custom HTTP probe" }

    fn prepare(&self, credential: &Credential) -> Result<ProbeRequest, ProbeConfigError> {
        let probe = CustomProbe::from_metadata(&credential.metadata)?;

        let method = Method::from_bytes(probe.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|e| ProbeConfigError::Invalid {
                field: "method",
                reason: e.to_string(),
            })?;
        let url = reqwest::Url::parse(probe.url.trim()).map_err(|e| ProbeConfigError::InvalidUrl {
            url: probe.url.clone(),
            reason: e.to_string(),
        })?;

        let mut request = ProbeRequest::get(url);
        request.method = method;
        request.criterion = SuccessCriterion::StatusCodes(probe.success_status_codes.iter().copied().collect());

        for (name, template) in &probe.headers {
            let sensitive = template.contains(KEY_PLACEHOLDER);
            let value = template.replace(KEY_PLACEHOLDER, credential.secret.expose());
            request = request.header(name, &value, sensitive)?;
        }

        request.body = probe.body.map(|body| match body {
            serde_json::Value::String(text) => ProbeBody::Text(text),
            other => ProbeBody::Json(other),
        });

        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::tests::credential;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_placeholder_substitution_and_codes() {
        let request = CustomAdapter
            .prepare(&credential(
                ServiceKind::Custom,
                "tok-9",
                json!({
                    "method": "post",
                    "url": "https://api.example.com/verify",
                    "headers": {"Authorization": "Token {key}", "Accept": "application/json"},
                    "success_status_codes": [200, 204]
                }),
            ))
            .unwrap();

        assert_eq!(request.method, Method::POST);
        let auth = request.headers.iter().find(|(n, _)| n == "authorization").unwrap();
        assert_eq!(auth.1, "Token tok-9");
        assert!(auth.1.is_sensitive());
        let accept = request.headers.iter().find(|(n, _)| n == "accept").unwrap();
        assert!(!accept.1.is_sensitive());
        assert_eq!(
            request.criterion,
            SuccessCriterion::StatusCodes([200, 204].into_iter().collect())
        );
    }

    #[test]
    fn test_invalid_method_is_config_error() {
        let err = CustomAdapter
            .prepare(&credential(ServiceKind::Custom, "k", json!({"method": "GE T", "url": "http://x"})))
            .unwrap_err();
        assert!(matches!(err, ProbeConfigError::Invalid { field: "method", .. }));
    }

    #[tokio::test]
    async fn test_probe_sends_defined_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/health"))
            .and(header("x-api-key", "secret-1"))
            .and(body_json(json!({"ping": 1})))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let key = credential(
            ServiceKind::Custom,
            "secret-1",
            json!({
                "method": "POST",
                "url": format!("{}/health", server.uri()),
                "headers": {"X-Api-Key": "{key}"},
                "body": {"ping": 1},
                "success_status_codes": [200, 204]
            }),
        );
        let report = CustomAdapter.probe(&reqwest::Client::new(), &key).await;
        assert_eq!(report.raw.http_status, Some(204));
        assert!(matches!(report.criterion, SuccessCriterion::StatusCodes(ref codes) if codes.contains(&204)));
    }

    #[tokio::test]
    async fn test_unparsable_definition_becomes_failed_result() {
        let key = credential(ServiceKind::Custom, "k", json!({"definition": "{{ not yaml"}));
        let report = CustomAdapter.probe(&reqwest::Client::new(), &key).await;
        assert!(!report.raw.succeeded);
        assert!(report.raw.body_or_error.contains("invalid probe configuration"));
    }
}
