//! LLM client with retry, backoff, and circuit-breaker handling around the
//! remote chat-completion path.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::message::Message;
use super::remote::RemoteBackend;

#[cfg(feature = "local")]
use super::local::LocalBackend;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default number of attempts per remote request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default exponential backoff base in seconds.
pub const DEFAULT_RETRY_BACKOFF_SECS: f64 = 2.0;

/// Default upper bound on random backoff jitter in seconds.
pub const DEFAULT_RETRY_JITTER_SECS: f64 = 0.5;

/// Default number of consecutive failed requests before the circuit
/// breaker opens.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Ceiling for a single retry sleep when the computed backoff cannot be
/// represented as a `Duration` (NaN, negative, or past `Duration::MAX`).
const MAX_BACKOFF: Duration = Duration::from_secs(3_600);

/// Client errors.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("request failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("circuit breaker open after {0} consecutive failures")]
    BreakerOpen(u32),
    #[error("local inference failed: {0}")]
    Local(String),
}

/// Configuration for an [`LlmClient`], captured once at construction.
///
/// An API key selects the remote chat-completion backend; without one the
/// client loads a local model instead (requires the `local` feature).
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Output language for generated summaries.
    pub lang: String,
    pub timeout: Duration,
    pub max_retries: u32,
    /// Exponential backoff base in seconds; the delay before retry `k`
    /// (0-based) is `retry_backoff * 2^k` plus jitter.
    pub retry_backoff: f64,
    /// Upper bound on the uniform random jitter added to each backoff.
    pub retry_jitter: f64,
    pub max_consecutive_failures: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: None,
            lang: "English".to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF_SECS,
            retry_jitter: DEFAULT_RETRY_JITTER_SECS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl LlmConfig {
    /// Set the API key, selecting the remote backend.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Override the chat-completion endpoint base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the model identifier sent with remote requests.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the output language for generated summaries.
    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of attempts per remote request.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the exponential backoff base in seconds.
    pub fn with_retry_backoff(mut self, secs: f64) -> Self {
        self.retry_backoff = secs;
        self
    }

    /// Set the upper bound on backoff jitter in seconds.
    pub fn with_retry_jitter(mut self, secs: f64) -> Self {
        self.retry_jitter = secs;
        self
    }

    /// Set how many consecutive failed requests open the circuit breaker.
    pub fn with_max_consecutive_failures(mut self, count: u32) -> Self {
        self.max_consecutive_failures = count;
        self
    }

    fn validate(&self) -> Result<(), LlmError> {
        if self.max_retries == 0 {
            return Err(LlmError::InvalidConfig(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.retry_backoff < 0.0 || self.retry_jitter < 0.0 {
            return Err(LlmError::InvalidConfig(
                "retry_backoff and retry_jitter must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Backend handle, fixed for the client's lifetime. The retry and breaker
/// logic applies only to the remote variant; the local variant is invoked
/// directly, exactly once per request.
pub(crate) enum Backend {
    Remote(RemoteBackend),
    #[cfg(feature = "local")]
    Local(LocalBackend),
    #[cfg(test)]
    Scripted(ScriptedBackend),
}

impl Backend {
    fn is_remote(&self) -> bool {
        match self {
            Backend::Remote(_) => true,
            #[cfg(feature = "local")]
            Backend::Local(_) => false,
            #[cfg(test)]
            Backend::Scripted(scripted) => scripted.is_remote(),
        }
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        match self {
            Backend::Remote(remote) => remote.complete(messages).await,
            #[cfg(feature = "local")]
            Backend::Local(local) => local.complete(messages).await,
            #[cfg(test)]
            Backend::Scripted(scripted) => scripted.complete(messages),
        }
    }
}

/// Chat-completion client over a remote API or a local model.
///
/// Construct one with [`LlmClient::new`] and pass it to whatever needs to
/// generate text. `generate` takes `&mut self` because the failure counter is
/// mutable state; callers that share a client across tasks must wrap it in a
/// lock of their choosing.
pub struct LlmClient {
    config: LlmConfig,
    backend: Backend,
    consecutive_failures: u32,
}

impl LlmClient {
    /// Build a client from the given configuration.
    ///
    /// With an API key the remote backend is used and `max_retries` must be
    /// at least 1. Without one, the local model is downloaded (first run
    /// only) and loaded; the base URL and model overrides are ignored on
    /// that path.
    pub async fn new(config: LlmConfig) -> Result<Self, LlmError> {
        config.validate()?;
        let backend = match config.api_key.as_deref() {
            Some(api_key) => {
                info!(
                    model = config.model.as_deref().unwrap_or("provider default"),
                    "using remote chat-completion backend"
                );
                Backend::Remote(RemoteBackend::new(
                    api_key,
                    config.base_url.as_deref(),
                    config.model.as_deref(),
                    config.timeout,
                )?)
            }
            None => Self::local_backend().await?,
        };
        Ok(Self {
            config,
            backend,
            consecutive_failures: 0,
        })
    }

    /// Build a client with all-default settings, logging that a default was
    /// created. Convenience for callers that never call [`LlmClient::new`]
    /// themselves.
    pub async fn with_defaults() -> Result<Self, LlmError> {
        info!("no client configured, creating one with default settings");
        Self::new(LlmConfig::default()).await
    }

    #[cfg(feature = "local")]
    async fn local_backend() -> Result<Backend, LlmError> {
        info!("no API key supplied, using local model backend");
        Ok(Backend::Local(LocalBackend::load().await?))
    }

    #[cfg(not(feature = "local"))]
    async fn local_backend() -> Result<Backend, LlmError> {
        Err(LlmError::InvalidConfig(
            "no API key supplied and local inference is not enabled; \
             build with the `local` feature or configure an API key"
                .to_string(),
        ))
    }

    /// Configured output language for generated summaries.
    pub fn lang(&self) -> &str {
        &self.config.lang
    }

    /// Generate one completion for the given conversation.
    ///
    /// On the remote backend this retries with exponential backoff and
    /// short-circuits once too many requests in a row have failed; on the
    /// local backend it makes exactly one attempt.
    pub async fn generate(&mut self, messages: &[Message]) -> Result<String, LlmError> {
        if self.backend.is_remote() {
            return self.generate_remote(messages).await;
        }
        match self.backend.complete(messages).await {
            Ok(text) => Ok(text),
            Err(e) => {
                error!(error = %e, "local chat completion failed");
                Err(e)
            }
        }
    }

    /// Like [`generate`](Self::generate), but collapses every failure to an
    /// empty string. Callers that need to tell failure kinds apart should use
    /// `generate` instead.
    pub async fn generate_or_empty(&mut self, messages: &[Message]) -> String {
        self.generate(messages).await.unwrap_or_default()
    }

    async fn generate_remote(&mut self, messages: &[Message]) -> Result<String, LlmError> {
        if self.consecutive_failures >= self.config.max_consecutive_failures {
            warn!(
                failures = self.consecutive_failures,
                "skipping chat completion, circuit breaker is open"
            );
            return Err(LlmError::BreakerOpen(self.consecutive_failures));
        }

        let mut attempt: u32 = 0;
        loop {
            match self.backend.complete(messages).await {
                Ok(text) => {
                    self.consecutive_failures = 0;
                    return Ok(text);
                }
                Err(e) => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "chat completion attempt failed"
                    );
                    if attempt >= self.config.max_retries {
                        self.consecutive_failures += 1;
                        error!("chat completion failed after all retries");
                        return Err(LlmError::RetriesExhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    sleep(self.backoff_delay(attempt - 1)).await;
                }
            }
        }
    }

    /// Delay before retrying after the failed attempt with 0-based index
    /// `attempt`: `retry_backoff * 2^attempt + uniform(0, retry_jitter)`.
    /// `2^attempt` leaves `Duration` range quickly for large attempt
    /// indexes, so the result is clamped to [`MAX_BACKOFF`].
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.config.retry_jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..self.config.retry_jitter)
        } else {
            0.0
        };
        let secs = self.config.retry_backoff * 2f64.powi(attempt as i32) + jitter;
        Duration::try_from_secs_f64(secs).unwrap_or(MAX_BACKOFF)
    }
}

/// Scripted backend for unit tests: replays a fixed sequence of outcomes and
/// records every call.
#[cfg(test)]
#[derive(Clone)]
pub(crate) struct ScriptedBackend {
    inner: std::sync::Arc<ScriptInner>,
}

#[cfg(test)]
struct ScriptInner {
    remote: bool,
    responses: std::sync::Mutex<std::collections::VecDeque<Result<String, String>>>,
    calls: std::sync::atomic::AtomicU32,
    seen: std::sync::Mutex<Vec<Vec<Message>>>,
}

#[cfg(test)]
impl ScriptedBackend {
    pub(crate) fn new(remote: bool, responses: Vec<Result<String, String>>) -> Self {
        Self {
            inner: std::sync::Arc::new(ScriptInner {
                remote,
                responses: std::sync::Mutex::new(responses.into_iter().collect()),
                calls: std::sync::atomic::AtomicU32::new(0),
                seen: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    fn is_remote(&self) -> bool {
        self.inner.remote
    }

    fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.inner
            .calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.seen.lock().unwrap().push(messages.to_vec());
        match self.inner.responses.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(LlmError::Api(message)),
            None => Err(LlmError::Api("script exhausted".to_string())),
        }
    }

    pub(crate) fn calls(&self) -> u32 {
        self.inner.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub(crate) fn seen(&self) -> Vec<Vec<Message>> {
        self.inner.seen.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl LlmClient {
    fn scripted(config: LlmConfig, backend: ScriptedBackend) -> Self {
        Self {
            config,
            backend: Backend::Scripted(backend),
            consecutive_failures: 0,
        }
    }
}
