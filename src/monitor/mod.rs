//! Health monitor: probe, classify, append.
//!
//! `check` is the per-credential step shared by the scheduler tick and the
//! manual trigger path: exactly one probe, one classification and one
//! appended outcome per call. Probe failures never surface as errors here;
//! only registry and history failures do.

pub mod classifier;
pub mod scheduler;

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::adapters::{AdapterRegistry, ServiceKind};
use crate::vault::{
    Credential, CredentialRegistry, HealthStatus, HistoryStore, NewCredential, NewOutcome, Outcome, StoreError,
};

use classifier::classify;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("credential '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for MonitorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => MonitorError::NotFound(id),
            other => MonitorError::Store(other),
        }
    }
}

/// A freshly registered credential and its initial outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub credential: Credential,
    pub outcome: Outcome,
}

pub struct HealthMonitor {
    registry: Arc<dyn CredentialRegistry>,
    history: Arc<dyn HistoryStore>,
    adapters: Arc<AdapterRegistry>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<dyn CredentialRegistry>,
        history: Arc<dyn HistoryStore>,
        adapters: Arc<AdapterRegistry>,
    ) -> Self {
        Self {
            registry,
            history,
            adapters,
        }
    }

    /// Probe one credential and record the outcome.
    pub async fn check(&self, credential: &Credential) -> Result<Outcome, MonitorError> {
        let report = self.adapters.probe(credential).await;
        let status = classify(&report.raw, &report.criterion);
        let error_message = (status != HealthStatus::Ok).then(|| report.raw.error_detail());

        let outcome = self.history.append(NewOutcome {
            credential_id: credential.id.clone(),
            checked_at: None,
            status,
            latency_ms: report.raw.elapsed_ms.max(0.0),
            error_message,
        })?;

        match status {
            HealthStatus::Ok => info!(
                key_id = %credential.id,
                service = %credential.service,
                latency_ms = outcome.latency_ms,
                "✅ Key healthy"
            ),
            _ => warn!(
                key_id = %credential.id,
                service = %credential.service,
                status = %status,
                http_status = ?report.raw.http_status,
                "⚠️ Key check failed"
            ),
        }

        Ok(outcome)
    }

    /// On-demand check of a single credential by id.
    pub async fn trigger(&self, id: &str) -> Result<Outcome, MonitorError> {
        let credential = self.registry.get(id)?;
        self.check(&credential).await
    }

    /// Add a credential and check it before returning. Settings that fail to
    /// resolve are accepted; the initial outcome records them as an error.
    ///
    /// The returned credential carries the initial outcome's timestamp as
    /// `last_checked`, even if a scheduled tick has since recorded a newer one.
    pub async fn register(&self, new: NewCredential) -> Result<Registration, MonitorError> {
        let mut credential = self.registry.add(new)?;
        if let Err(e) = self.adapters.validate(&credential) {
            warn!(key_id = %credential.id, service = %credential.service, "Registering key with invalid settings: {}", e);
        }

        let outcome = match self.check(&credential).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Never leave a key behind that was not checked.
                if let Err(cleanup) = self.registry.remove(&credential.id) {
                    warn!(key_id = %credential.id, "Rollback of unchecked key failed: {}", cleanup);
                }
                return Err(e);
            }
        };
        credential.last_checked = Some(outcome.checked_at);

        Ok(Registration { credential, outcome })
    }

    pub fn remove(&self, id: &str) -> Result<Credential, MonitorError> {
        Ok(self.registry.remove(id)?)
    }

    pub fn get(&self, id: &str) -> Result<Credential, MonitorError> {
        Ok(self.registry.get(id)?)
    }

    pub fn list(&self) -> Result<Vec<Credential>, MonitorError> {
        Ok(self.registry.list()?)
    }

    /// Service kinds that can be probed.
    pub fn services(&self) -> Vec<ServiceKind> {
        self.adapters.kinds()
    }

    /// Outcomes for one credential, newest first.
    pub fn history(&self, id: &str, limit: Option<usize>) -> Result<Vec<Outcome>, MonitorError> {
        self.registry.get(id)?;
        Ok(self.history.list_for(id, limit)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adapters::tests::closed_port_url;
    use crate::vault::store::KeyStore;
    use crate::vault::{Metadata, Secret};
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn open_monitor(dir: &TempDir) -> (Arc<HealthMonitor>, Arc<KeyStore>) {
        let store = Arc::new(KeyStore::open(&dir.path().join("keywatch.db"), b"test-master").unwrap());
        let adapters = Arc::new(AdapterRegistry::with_defaults().unwrap());
        let monitor = HealthMonitor::new(store.clone(), store.clone(), adapters);
        (Arc::new(monitor), store)
    }

    pub(crate) fn openai_key(name: &str, secret: &str, base_url: &str) -> NewCredential {
        let mut metadata = Metadata::new();
        metadata.insert("base_url".into(), json!(base_url));
        NewCredential {
            service: ServiceKind::OpenAi,
            name: name.into(),
            secret: Secret::new(secret),
            metadata,
        }
    }

    /// Stub OpenAI: "valid" → 200, "bad" → 401 with a body.
    pub(crate) async fn openai_stub() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer valid"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"data":[]}"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer bad"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Incorrect API key provided"))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_register_valid_key_is_ok() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = open_monitor(&dir);
        let stub = openai_stub().await;

        let reg = monitor
            .register(openai_key("prod", "valid", &format!("{}/v1", stub.uri())))
            .await
            .unwrap();

        assert_eq!(reg.outcome.status, HealthStatus::Ok);
        assert_eq!(reg.outcome.error_message, None);
        assert_eq!(reg.credential.last_checked, Some(reg.outcome.checked_at));
        assert_eq!(monitor.history(&reg.credential.id, None).unwrap(), vec![reg.outcome]);
    }

    #[tokio::test]
    async fn test_register_rejected_key_is_expired() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = open_monitor(&dir);
        let stub = openai_stub().await;

        let reg = monitor
            .register(openai_key("old", "bad", &format!("{}/v1", stub.uri())))
            .await
            .unwrap();

        assert_eq!(reg.outcome.status, HealthStatus::Expired);
        assert_eq!(reg.outcome.error_message.as_deref(), Some("Incorrect API key provided"));
    }

    #[tokio::test]
    async fn test_invalid_settings_still_register() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = open_monitor(&dir);

        let reg = monitor
            .register(NewCredential {
                service: ServiceKind::Azure,
                name: "no-endpoint".into(),
                secret: Secret::new("az"),
                metadata: Metadata::new(),
            })
            .await
            .unwrap();

        assert_eq!(reg.outcome.status, HealthStatus::Error);
        assert!(reg.outcome.error_message.unwrap().contains("endpoint"));
        assert_eq!(monitor.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_service_records_error() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = open_monitor(&dir);

        let reg = monitor
            .register(openai_key("offline", "valid", &closed_port_url()))
            .await
            .unwrap();

        assert_eq!(reg.outcome.status, HealthStatus::Error);
        assert!(reg.outcome.error_message.is_some());
        assert!(reg.outcome.latency_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_trigger_appends_newest_first() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = open_monitor(&dir);
        let stub = openai_stub().await;

        let reg = monitor
            .register(openai_key("prod", "valid", &format!("{}/v1", stub.uri())))
            .await
            .unwrap();
        let second = monitor.trigger(&reg.credential.id).await.unwrap();

        let history = monitor.history(&reg.credential.id, None).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], second);
        assert!(history[0].checked_at > history[1].checked_at);
        assert_eq!(monitor.get(&reg.credential.id).unwrap().last_checked, Some(second.checked_at));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let dir = TempDir::new().unwrap();
        let (monitor, store) = open_monitor(&dir);

        assert!(matches!(monitor.trigger("nope").await, Err(MonitorError::NotFound(_))));
        assert!(matches!(monitor.remove("nope"), Err(MonitorError::NotFound(_))));
        assert!(matches!(monitor.history("nope", None), Err(MonitorError::NotFound(_))));
        assert!(store.list_for("nope", None).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_triggers_keep_history_ordered() {
        let dir = TempDir::new().unwrap();
        let (monitor, store) = open_monitor(&dir);
        let stub = openai_stub().await;
        let key = store.add(openai_key("busy", "valid", &format!("{}/v1", stub.uri()))).unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..40 {
            let monitor = Arc::clone(&monitor);
            let id = key.id.clone();
            tasks.spawn(async move { monitor.trigger(&id).await });
        }
        let mut recorded = 0;
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
            recorded += 1;
        }
        assert_eq!(recorded, 40);

        let history = monitor.history(&key.id, None).unwrap();
        assert_eq!(history.len(), 40);
        assert!(history.windows(2).all(|pair| pair[0].checked_at > pair[1].checked_at));
        assert_eq!(store.get(&key.id).unwrap().last_checked, Some(history[0].checked_at));
    }

    /// Records a second outcome right after each append, as a scheduled
    /// tick landing between the registration check and its return would.
    struct TickAfterEachAppend {
        inner: Arc<KeyStore>,
    }

    impl HistoryStore for TickAfterEachAppend {
        fn append(&self, outcome: NewOutcome) -> Result<Outcome, StoreError> {
            let first = self.inner.append(outcome.clone())?;
            self.inner.append(NewOutcome {
                checked_at: None,
                ..outcome
            })?;
            Ok(first)
        }

        fn list_for(&self, credential_id: &str, limit: Option<usize>) -> Result<Vec<Outcome>, StoreError> {
            self.inner.list_for(credential_id, limit)
        }
    }

    #[tokio::test]
    async fn test_registration_reports_its_own_check_time() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KeyStore::open(&dir.path().join("keywatch.db"), b"test-master").unwrap());
        let history = Arc::new(TickAfterEachAppend { inner: store.clone() });
        let monitor = HealthMonitor::new(
            store.clone(),
            history,
            Arc::new(AdapterRegistry::with_defaults().unwrap()),
        );
        let stub = openai_stub().await;

        let reg = monitor
            .register(openai_key("prod", "valid", &format!("{}/v1", stub.uri())))
            .await
            .unwrap();

        assert_eq!(reg.credential.last_checked, Some(reg.outcome.checked_at));
        let stored = store.get(&reg.credential.id).unwrap().last_checked.unwrap();
        assert!(stored > reg.outcome.checked_at);
        assert_eq!(store.list_for(&reg.credential.id, None).unwrap().len(), 2);
    }

    #[test]
    fn test_services_lists_registered_kinds() {
        let dir = TempDir::new().unwrap();
        let (monitor, _) = open_monitor(&dir);
        assert_eq!(monitor.services(), ServiceKind::ALL.to_vec());
    }
}
