//! Client configuration.

use crate::identity::{IdentityProvider, IdentityStore};
use crate::transport::Transport;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable consulted when no API host is set explicitly.
pub const API_HOST_ENV: &str = "ST_TRACKING_SERVER";

/// Default poll interval for batch dispatch.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5000);

/// Default ceiling on waiting for the host ready signal.
pub const DEFAULT_ENVIRONMENT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default ceiling on waiting for identity resolution.
pub const DEFAULT_IDENTITY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How events leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Send each event as soon as the readiness gate is open, buffering until then.
    #[default]
    Immediate,
    /// Always buffer; a recurring timer sends the whole buffer as one batch.
    Poll,
}

/// What kind of host the client runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Runtime {
    /// A host with a startup window: waits for [`environment_ready`] and resolves
    /// identity through the configured provider.
    ///
    /// [`environment_ready`]: crate::Analytics::environment_ready
    #[default]
    Interactive,
    /// A non-interactive process: ready at construction, identified by host name.
    Headless,
}

/// Analytics client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) collection_id: String,
    pub(crate) search_token: String,
    pub(crate) api_host: String,
    pub(crate) mode: DispatchMode,
    pub(crate) runtime: Runtime,
    pub(crate) poll_interval: Duration,
    pub(crate) environment_timeout: Duration,
    pub(crate) identity_timeout: Duration,
    pub(crate) timeout: Duration,
}

impl Config {
    /// Get the collection id.
    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    /// Get the search token.
    pub fn search_token(&self) -> &str {
        &self.search_token
    }

    /// Get the API host.
    pub fn api_host(&self) -> &str {
        &self.api_host
    }

    /// Get the dispatch mode.
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Get the runtime kind.
    pub fn runtime(&self) -> Runtime {
        self.runtime
    }

    /// Get the initial poll interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Get the environment readiness ceiling.
    pub fn environment_timeout(&self) -> Duration {
        self.environment_timeout
    }

    /// Get the identity readiness ceiling.
    pub fn identity_timeout(&self) -> Duration {
        self.identity_timeout
    }

    /// Get the request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Builder for the analytics client.
pub struct AnalyticsBuilder {
    collection_id: String,
    search_token: String,
    api_host: Option<String>,
    mode: Option<DispatchMode>,
    runtime: Option<Runtime>,
    poll_interval: Option<Duration>,
    environment_timeout: Option<Duration>,
    identity_timeout: Option<Duration>,
    timeout: Option<Duration>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) identity_provider: Option<Arc<dyn IdentityProvider>>,
    pub(crate) identity_store: Option<Arc<dyn IdentityStore>>,
}

impl fmt::Debug for AnalyticsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyticsBuilder")
            .field("collection_id", &self.collection_id)
            .field("api_host", &self.api_host)
            .field("mode", &self.mode)
            .field("runtime", &self.runtime)
            .field("poll_interval", &self.poll_interval)
            .field("custom_transport", &self.transport.is_some())
            .field("custom_identity_provider", &self.identity_provider.is_some())
            .finish_non_exhaustive()
    }
}

impl AnalyticsBuilder {
    /// Create a new builder for the given collection and search token.
    pub fn new(collection_id: impl Into<String>, search_token: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            search_token: search_token.into(),
            api_host: None,
            mode: None,
            runtime: None,
            poll_interval: None,
            environment_timeout: None,
            identity_timeout: None,
            timeout: None,
            transport: None,
            identity_provider: None,
            identity_store: None,
        }
    }

    /// Set the API host. Overrides `ST_TRACKING_SERVER`.
    pub fn api_host(mut self, host: impl Into<String>) -> Self {
        self.api_host = Some(host.into());
        self
    }

    /// Set the dispatch mode.
    pub fn mode(mut self, mode: DispatchMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set the runtime kind.
    pub fn runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set the poll interval used in [`DispatchMode::Poll`].
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set how long to wait for the host ready signal.
    pub fn environment_timeout(mut self, timeout: Duration) -> Self {
        self.environment_timeout = Some(timeout);
        self
    }

    /// Set how long to wait for identity resolution.
    pub fn identity_timeout(mut self, timeout: Duration) -> Self {
        self.identity_timeout = Some(timeout);
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use a custom transport instead of the HTTP one.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom identity provider.
    pub fn identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity_provider = Some(provider);
        self
    }

    /// Use a custom cookie store for the default identity provider.
    pub fn identity_store(mut self, store: Arc<dyn IdentityStore>) -> Self {
        self.identity_store = Some(store);
        self
    }

    /// Build the configuration.
    pub(crate) fn build_config(&self) -> Result<Config, crate::Error> {
        if self.collection_id.is_empty() {
            return Err(crate::Error::Config("collection_id cannot be empty".into()));
        }
        if self.search_token.is_empty() {
            return Err(crate::Error::Config("search_token cannot be empty".into()));
        }

        let api_host = match &self.api_host {
            Some(host) => host.clone(),
            None => std::env::var(API_HOST_ENV).map_err(|_| {
                crate::Error::Config(format!("api_host not set and {API_HOST_ENV} is missing"))
            })?,
        };
        if api_host.is_empty() {
            return Err(crate::Error::Config("api_host cannot be empty".into()));
        }

        let poll_interval = self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL);
        if poll_interval.is_zero() {
            return Err(crate::Error::Config("poll_interval must be non-zero".into()));
        }

        Ok(Config {
            collection_id: self.collection_id.clone(),
            search_token: self.search_token.clone(),
            api_host,
            mode: self.mode.unwrap_or_default(),
            runtime: self.runtime.unwrap_or_default(),
            poll_interval,
            environment_timeout: self
                .environment_timeout
                .unwrap_or(DEFAULT_ENVIRONMENT_TIMEOUT),
            identity_timeout: self.identity_timeout.unwrap_or(DEFAULT_IDENTITY_TIMEOUT),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
        })
    }
}
