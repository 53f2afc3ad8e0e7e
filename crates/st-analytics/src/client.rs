//! Analytics client implementation.

use crate::builders::EventBuilder;
use crate::config::{AnalyticsBuilder, Config, DispatchMode, Runtime};
use crate::dispatch::Dispatcher;
use crate::gate::ReadinessGate;
use crate::identity::{
    host_identity, CollectorIdentity, CurrentUser, IdentityProvider, IdentityStore, MemoryStore,
};
use crate::search::{
    empty_search_data, search_query_data, EMPTY_SEARCH_QUERY_EVENT, SEARCH_QUERY_EVENT,
};
use crate::transport::{HttpTransport, Transport};
use crate::types::SearchResponse;
use crate::Error;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Analytics client.
///
/// Events sent before the client is ready (host environment loaded and a
/// user id known, or their timeouts elapsed) are buffered and delivered once
/// it is. No method reports delivery failures to the caller; they are logged
/// and the affected events are dropped.
///
/// Must be built inside a Tokio runtime.
///
/// # Example
///
/// ```rust,no_run
/// use st_analytics::Analytics;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), st_analytics::Error> {
///     let client = Analytics::builder("collection_id", "search_token")
///         .api_host("https://tracking.example.com")
///         .build()?;
///
///     client.set_global_props(&json!({ "app": "storefront" }));
///     client.send_event("addToCart", json!({ "sku": "A-1" })).await;
///
///     // Host signal: the page has finished loading.
///     client.environment_ready();
///
///     client.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct Analytics {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    gate: ReadinessGate,
    dispatcher: Arc<Dispatcher>,
    identity: Arc<dyn IdentityProvider>,
    user: Arc<CurrentUser>,
    global_props: RwLock<Value>,
    is_shutdown: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AnalyticsBuilder {
    /// Build the analytics client.
    pub fn build(self) -> Result<Analytics, Error> {
        let config = self.build_config()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config)?),
        };

        let identity: Arc<dyn IdentityProvider> = match self.identity_provider {
            Some(provider) => provider,
            None => {
                let store: Arc<dyn IdentityStore> = match self.identity_store {
                    Some(store) => store,
                    None => Arc::new(MemoryStore::new()),
                };
                Arc::new(CollectorIdentity::new(
                    store,
                    transport.clone(),
                    config.collection_id(),
                ))
            }
        };

        Ok(Analytics::from_parts(config, transport, identity))
    }
}

impl Analytics {
    /// Create a new builder for the given collection and search token.
    pub fn builder(
        collection_id: impl Into<String>,
        search_token: impl Into<String>,
    ) -> AnalyticsBuilder {
        AnalyticsBuilder::new(collection_id, search_token)
    }

    fn from_parts(
        config: Config,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let user = Arc::new(CurrentUser::new());
        let dispatcher = Arc::new(Dispatcher::new(config.mode(), transport, user.clone()));

        if config.mode() == DispatchMode::Poll {
            dispatcher.start_polling(config.poll_interval());
        }

        let inner = Arc::new(Inner {
            config,
            gate: ReadinessGate::new(),
            dispatcher,
            identity,
            user,
            global_props: RwLock::new(Value::Null),
            is_shutdown: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
        });
        inner.start_readiness();

        Self { inner }
    }

    /// Get the client configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the number of buffered events.
    pub async fn pending_event_count(&self) -> usize {
        self.inner.dispatcher.pending().await
    }

    /// Whether events may currently leave the process.
    pub fn is_dispatch_allowed(&self) -> bool {
        self.inner.gate.is_dispatch_allowed()
    }

    /// Wait until events may leave the process.
    pub async fn wait_until_ready(&self) {
        self.inner.gate.opened().await
    }

    /// The user id attached to outgoing events.
    pub fn user_id(&self) -> String {
        self.inner.user.get()
    }

    // ============================================
    // READINESS
    // ============================================

    /// Signal that the host environment has finished loading.
    pub fn environment_ready(&self) {
        self.inner.mark_environment_ready();
    }

    /// Override the resolved user id.
    ///
    /// Interactive clients also persist the id for later runs. Either way the
    /// identity is considered ready from here on.
    pub fn set_user(&self, user_id: impl Into<String>) -> &Self {
        let user_id = user_id.into();
        if self.inner.config.runtime() == Runtime::Interactive {
            self.inner.identity.persist_identity(&user_id);
        }
        self.inner.user.set(user_id);
        self.inner.mark_identity_ready();
        self
    }

    // ============================================
    // EVENTS
    // ============================================

    /// Set the properties merged into every event, replacing any previous set.
    ///
    /// Anything other than a JSON object is logged as an error but stored anyway.
    pub fn set_global_props<T: Serialize + ?Sized>(&self, properties: &T) {
        let value = match serde_json::to_value(properties) {
            Ok(value) => {
                if !value.is_object() {
                    error!("invalid data provided for global event properties");
                }
                value
            }
            Err(e) => {
                error!(error = %e, "global event properties are not serializable");
                Value::Null
            }
        };

        *self
            .inner
            .global_props
            .write()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Get the current global properties.
    pub fn global_props(&self) -> Value {
        self.inner
            .global_props
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send an event.
    ///
    /// `data` is layered over the global properties, with `data` winning on
    /// conflicts. In immediate mode with the client ready this waits for the
    /// collector to answer; otherwise it returns once the event is buffered.
    pub async fn send_event(&self, event_name: impl Into<String>, data: Value) {
        self.dispatch(EventBuilder::new(event_name).data(data)).await
    }

    /// Start building an event.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use st_analytics::Analytics;
    /// # async fn example(client: &Analytics) {
    /// client.event("checkout")
    ///     .property("total", 42.5)
    ///     .ip_v4("203.0.113.7")
    ///     .send()
    ///     .await;
    /// # }
    /// ```
    pub fn event(&self, event_name: impl Into<String>) -> SendableEvent<'_> {
        SendableEvent {
            builder: EventBuilder::new(event_name),
            client: self,
        }
    }

    /// Report a search and its top results, labelled by the `label` field.
    pub async fn search_query(&self, response: &SearchResponse, label: &str) {
        self.send_event(SEARCH_QUERY_EVENT, search_query_data(response, label))
            .await
    }

    /// Report a search that returned no results.
    pub async fn empty_search_results(&self, response: &SearchResponse) {
        self.send_event(EMPTY_SEARCH_QUERY_EVENT, empty_search_data(response))
            .await
    }

    // ============================================
    // LIFECYCLE
    // ============================================

    /// Change how often buffered events are sent. Poll mode only.
    ///
    /// Returns after any flush in progress has finished and the timer has
    /// been rescheduled.
    #[instrument(skip(self))]
    pub async fn set_poll_interval(&self, interval: Duration) {
        if self.inner.is_shutdown.load(Ordering::SeqCst) {
            warn!("client has been shut down, poll interval ignored");
            return;
        }
        self.inner.dispatcher.set_poll_interval(interval).await
    }

    /// Try to send buffered events now. Returns how many were delivered.
    ///
    /// In immediate mode nothing is sent while the client is not yet ready.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> usize {
        if self.inner.dispatcher.mode() == DispatchMode::Immediate
            && !self.inner.gate.is_dispatch_allowed()
        {
            debug!("not ready yet, keeping events buffered");
            return 0;
        }
        self.inner.dispatcher.flush().await
    }

    /// Shutdown the client gracefully.
    ///
    /// Stops the background timers and sends whatever is still buffered,
    /// ready or not. Events sent afterwards are dropped.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.inner.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("shutting down client");

        self.inner.abort_background();
        self.inner.dispatcher.close().await;

        let delivered = self.inner.dispatcher.flush().await;
        debug!(delivered, "final flush complete");
    }

    // ============================================
    // INTERNAL
    // ============================================

    async fn dispatch(&self, builder: EventBuilder) {
        if self.inner.is_shutdown.load(Ordering::SeqCst) {
            warn!("client has been shut down, dropping event");
            return;
        }

        let event = {
            let global_props = self
                .inner
                .global_props
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            builder.build(self.inner.config.collection_id(), &global_props)
        };

        self.inner.dispatcher.submit(event, &self.inner.gate).await;
    }
}

impl Inner {
    fn start_readiness(self: &Arc<Self>) {
        match self.config.runtime() {
            Runtime::Headless => {
                let user_id = host_identity().unwrap_or_else(|| self.user.fallback().to_string());
                self.user.set_if_unset(user_id);
                self.mark_environment_ready();
                self.mark_identity_ready();
            }
            Runtime::Interactive => {
                let tasks = vec![
                    self.after(self.config.environment_timeout(), |inner| {
                        debug!("environment ready timeout elapsed");
                        inner.mark_environment_ready();
                    }),
                    self.after(self.config.identity_timeout(), |inner| {
                        debug!("identity timeout elapsed");
                        inner.mark_identity_ready();
                    }),
                    self.spawn_identity_resolution(),
                ];
                self.background
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(tasks);
            }
        }
    }

    fn after(
        self: &Arc<Self>,
        delay: Duration,
        action: impl FnOnce(Arc<Inner>) + Send + 'static,
    ) -> JoinHandle<()> {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                action(inner);
            }
        })
    }

    fn spawn_identity_resolution(self: &Arc<Self>) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(self);
        let identity = self.identity.clone();

        tokio::spawn(async move {
            let resolved = identity.resolve_identity().await;
            if let Some(inner) = inner.upgrade() {
                inner.apply_resolved_identity(resolved);
            }
        })
    }

    fn apply_resolved_identity(self: &Arc<Self>, resolved: Option<String>) {
        match resolved {
            Some(user_id) => {
                if self.user.set_if_unset(user_id.clone()) {
                    debug!(user_id = %user_id, "identity resolved");
                    self.identity.persist_identity(&user_id);
                }
            }
            None => {
                warn!(
                    fallback = %self.user.fallback(),
                    "identity unresolved, using process-local id"
                );
            }
        }
        self.mark_identity_ready();
    }

    fn mark_environment_ready(self: &Arc<Self>) {
        if self.gate.mark_environment_ready() {
            self.on_gate_open();
        }
    }

    fn mark_identity_ready(self: &Arc<Self>) {
        if self.gate.mark_identity_ready() {
            self.on_gate_open();
        }
    }

    fn on_gate_open(&self) {
        info!("dispatch allowed");

        if self.dispatcher.mode() == DispatchMode::Immediate {
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.drain_individually().await;
            });
        }
    }

    fn abort_background(&self) {
        let tasks = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The poll task holds only a weak reference and ends on its own, after
        // any batch it is posting.
        self.abort_background();
    }
}

// ============================================
// SENDABLE WRAPPER
// ============================================

/// Sendable event builder.
pub struct SendableEvent<'a> {
    builder: EventBuilder,
    client: &'a Analytics,
}

impl<'a> SendableEvent<'a> {
    /// Replace the event data wholesale.
    pub fn data(mut self, data: Value) -> Self {
        self.builder = self.builder.data(data);
        self
    }

    /// Add a property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.builder = self.builder.property(key, value);
        self
    }

    /// Attach the caller's IPv4 address.
    pub fn ip_v4(mut self, ip: impl Into<String>) -> Self {
        self.builder = self.builder.ip_v4(ip);
        self
    }

    /// Set custom timestamp.
    pub fn timestamp(mut self, ts: i64) -> Self {
        self.builder = self.builder.timestamp(ts);
        self
    }

    /// Send the event.
    pub async fn send(self) {
        self.client.dispatch(self.builder).await
    }
}
