//! Generation client — the facade callers use.
//!
//! Every operation runs through the [`RetryOrchestrator`]. A billing rejection
//! is escalated once to the dedicated fallback key when one is configured.

use crate::classify::{classify, sanitize};
use crate::retry::RetryOrchestrator;
use rendergate_types::{
    ApiKey, GenError, GenerationProvider, ImageRequest, JobRef, TextRequest, UserFacingError,
    VideoRequest,
};
use std::future::Future;
use std::sync::Arc;

/// Resilient image, video and text generation over a shared key pool.
#[derive(Clone)]
pub struct GenerationClient {
    orchestrator: RetryOrchestrator,
    provider: Arc<dyn GenerationProvider>,
    fallback_key: Option<ApiKey>,
}

impl GenerationClient {
    pub fn new(orchestrator: RetryOrchestrator, provider: Arc<dyn GenerationProvider>) -> Self {
        Self {
            orchestrator,
            provider,
            fallback_key: None,
        }
    }

    /// Key tried once when the pool's keys are rejected for billing.
    #[must_use]
    pub fn with_fallback_key(mut self, key: ApiKey) -> Self {
        self.fallback_key = Some(key);
        self
    }

    #[must_use]
    pub fn orchestrator(&self) -> &RetryOrchestrator {
        &self.orchestrator
    }

    /// Standard image generation or edit. Returns `data:` URIs.
    ///
    /// # Errors
    ///
    /// Returns a [`UserFacingError`] once retries (and the fallback) are spent.
    pub async fn image(
        &self,
        request: &ImageRequest,
        job: Option<&JobRef>,
    ) -> Result<Vec<String>, UserFacingError> {
        self.run(job, |key| async move {
            self.provider.generate_image(&key, request).await
        })
        .await
    }

    /// High-resolution image generation at the request's resolution tier.
    ///
    /// # Errors
    ///
    /// Returns a [`UserFacingError`] once retries (and the fallback) are spent.
    pub async fn hd_image(
        &self,
        request: &ImageRequest,
        job: Option<&JobRef>,
    ) -> Result<Vec<String>, UserFacingError> {
        self.run(job, |key| async move {
            self.provider.generate_hd_image(&key, request).await
        })
        .await
    }

    /// Video generation. Returns the generated video URI.
    ///
    /// # Errors
    ///
    /// Returns a [`UserFacingError`] once retries (and the fallback) are spent.
    pub async fn video(
        &self,
        request: &VideoRequest,
        job: Option<&JobRef>,
    ) -> Result<String, UserFacingError> {
        self.run(job, |key| async move {
            self.provider.generate_video(&key, request).await
        })
        .await
    }

    /// Text generation.
    ///
    /// # Errors
    ///
    /// Returns a [`UserFacingError`] once retries (and the fallback) are spent.
    pub async fn text(
        &self,
        request: &TextRequest,
        job: Option<&JobRef>,
    ) -> Result<String, UserFacingError> {
        self.run(job, |key| async move {
            self.provider.generate_text(&key, request).await
        })
        .await
    }

    async fn run<T, F, Fut>(&self, job: Option<&JobRef>, operation: F) -> Result<T, UserFacingError>
    where
        F: Fn(ApiKey) -> Fut,
        Fut: Future<Output = Result<T, GenError>>,
    {
        match self.orchestrator.execute(job, &operation).await {
            Err(err) if err.is_billing() => match &self.fallback_key {
                Some(key) => self.fallback(job, key, &operation, err).await,
                None => Err(err),
            },
            result => result,
        }
    }

    async fn fallback<T, F, Fut>(
        &self,
        job: Option<&JobRef>,
        key: &ApiKey,
        operation: &F,
        rejected: UserFacingError,
    ) -> Result<T, UserFacingError>
    where
        F: Fn(ApiKey) -> Fut,
        Fut: Future<Output = Result<T, GenError>>,
    {
        tracing::warn!(
            key = %key,
            attempts = rejected.attempts,
            "billing rejected, falling back to dedicated key"
        );
        if let Some(job) = job {
            self.orchestrator.report(job, key).await;
        }
        operation(key.clone()).await.map_err(|raw| {
            let record = classify(&raw);
            tracing::warn!(key = %key, kind = %record.kind, "fallback key failed");
            UserFacingError::new(record.kind, sanitize(&record), rejected.attempts + 1)
                .with_raw(raw)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RetryPolicy;
    use async_trait::async_trait;
    use rendergate_store::{InMemoryJobReporter, InMemoryKeyPool};
    use rendergate_types::{FailureKind, traits::Result};
    use std::sync::Mutex;
    use std::time::Duration;

    const FALLBACK: &str = "fallback-key-9999";

    /// Rejects every pool key for billing unless told otherwise; the fallback
    /// key succeeds unless `fallback_fails` is set.
    #[derive(Default)]
    struct FakeProvider {
        pool_ok: bool,
        fallback_fails: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeProvider {
        fn answer(&self, key: &ApiKey) -> Result<String> {
            self.calls.lock().unwrap().push(key.expose().to_string());
            let billing = GenError::Upstream {
                status: 400,
                body: r#"{"error":{"code":400,"message":"Only available for billed users."}}"#
                    .into(),
            };
            match key.expose() {
                FALLBACK if self.fallback_fails => Err(GenError::Upstream {
                    status: 503,
                    body: "overloaded".into(),
                }),
                FALLBACK => Ok(format!("via {}", key.fingerprint())),
                _ if self.pool_ok => Ok(format!("via {}", key.fingerprint())),
                _ => Err(billing),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GenerationProvider for FakeProvider {
        async fn generate_image(&self, key: &ApiKey, _: &ImageRequest) -> Result<Vec<String>> {
            self.answer(key).map(|s| vec![s])
        }

        async fn generate_hd_image(&self, key: &ApiKey, _: &ImageRequest) -> Result<Vec<String>> {
            self.answer(key).map(|s| vec![s, "second".into()])
        }

        async fn generate_video(&self, key: &ApiKey, _: &VideoRequest) -> Result<String> {
            self.answer(key)
        }

        async fn generate_text(&self, key: &ApiKey, _: &TextRequest) -> Result<String> {
            self.answer(key)
        }
    }

    fn client(
        provider: Arc<FakeProvider>,
        reporter: Option<Arc<InMemoryJobReporter>>,
    ) -> GenerationClient {
        let pool = Arc::new(InMemoryKeyPool::with_keys(
            ["pool-key-0001"],
            Duration::from_secs(60),
        ));
        let mut orchestrator = RetryOrchestrator::new(pool, RetryPolicy::default());
        if let Some(reporter) = reporter {
            orchestrator = orchestrator.with_reporter(reporter);
        }
        GenerationClient::new(orchestrator, provider)
    }

    fn text_request() -> TextRequest {
        TextRequest::builder().prompt("hello").build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_through_pool() {
        let provider = Arc::new(FakeProvider {
            pool_ok: true,
            ..Default::default()
        });
        let c = client(Arc::clone(&provider), None);
        let req = ImageRequest::builder().prompt("villa").build();
        let out = c.hd_image(&req, None).await.unwrap();
        assert_eq!(out, vec!["via …0001".to_string(), "second".to_string()]);
        assert_eq!(provider.calls(), vec!["pool-key-0001"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_billing_without_fallback_propagates() {
        let provider = Arc::new(FakeProvider::default());
        let c = client(Arc::clone(&provider), None);
        let err = c.text(&text_request(), None).await.unwrap_err();
        assert!(err.is_billing());
        assert_eq!(err.attempts, 1);
        assert_eq!(provider.calls().len(), 1);
        assert!(err.to_string().contains("billed users"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_billing_escalates_to_fallback_once() {
        let provider = Arc::new(FakeProvider::default());
        let reporter = Arc::new(InMemoryJobReporter::new());
        let c = client(Arc::clone(&provider), Some(Arc::clone(&reporter)))
            .with_fallback_key(ApiKey::new(FALLBACK));
        let job = JobRef::new("job-42");

        let out = c.video(&VideoRequest::builder().prompt("pan").build(), Some(&job))
            .await
            .unwrap();
        assert_eq!(out, "via …9999");
        assert_eq!(provider.calls(), vec!["pool-key-0001", FALLBACK]);
        assert_eq!(reporter.key_for(&job).as_deref(), Some("…9999"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_failure_is_sanitized() {
        let provider = Arc::new(FakeProvider {
            fallback_fails: true,
            ..Default::default()
        });
        let c = client(Arc::clone(&provider), None).with_fallback_key(ApiKey::new(FALLBACK));
        let err = c.text(&text_request(), None).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ServiceOverloaded);
        assert_eq!(err.attempts, 2);
        assert_eq!(err.message, crate::classify::OVERLOADED_MESSAGE);
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_unused_on_success() {
        let provider = Arc::new(FakeProvider {
            pool_ok: true,
            ..Default::default()
        });
        let c = client(Arc::clone(&provider), None).with_fallback_key(ApiKey::new(FALLBACK));
        c.text(&text_request(), None).await.unwrap();
        assert_eq!(provider.calls(), vec!["pool-key-0001"]);
    }
}
