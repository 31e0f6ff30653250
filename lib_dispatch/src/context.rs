//! # Dispatch Context
//!
//! The application root owns one [`DispatchContext`]; every component is
//! reached through it instead of through process-wide singletons. A context
//! is bound to one identity. Switching users means dropping it and building a
//! new one.

use std::sync::Arc;

use crate::configs::DispatchConfig;
use crate::core::{
    ConnectionHandle, ConnectionManager, Connector, ControllerDeps, EventRouter, MapSink, NoMap,
    NoPosition, PositionSource, RideLifecycleController,
};
use crate::error::ContextError;
use crate::models::identity::Identity;
use crate::outbox::{MemoryPendingStore, PendingStore};
use crate::retrieve::RideApi;

pub struct DispatchContext {
    config: DispatchConfig,
    identity: Identity,
    router: EventRouter,
    connection: ConnectionManager,
    controller: RideLifecycleController,
    store: Arc<dyn PendingStore>,
}

impl DispatchContext {
    pub fn builder(config: DispatchConfig, identity: Identity) -> DispatchContextBuilder {
        DispatchContextBuilder {
            config,
            identity,
            connector: None,
            api: None,
            store: None,
            position: None,
            map: None,
            auth_token: None,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn rides(&self) -> &RideLifecycleController {
        &self.controller
    }

    pub fn store(&self) -> &Arc<dyn PendingStore> {
        &self.store
    }

    /// Resumes requests queued by a previous run, then opens the push channel.
    ///
    /// The outbox is resumed first so a queued request keeps its place as
    /// the current ride even if connecting fails.
    pub async fn start(&self) -> Result<ConnectionHandle, ContextError> {
        let resumed = self.controller.resume_pending().await?;
        if resumed > 0 {
            tracing::info!(resumed, identity = %self.identity, "outbox resumed");
        }
        let handle = self
            .connection
            .connect(self.identity.role, self.identity.user_id.clone())
            .await?;
        Ok(handle)
    }

    /// Stops every timer and closes the push channel. Queued requests stay in
    /// the store for the next run.
    pub fn shutdown(&self) {
        self.controller.shutdown();
        self.connection.disconnect();
        tracing::info!(identity = %self.identity, "dispatch context shut down");
    }
}

/// Collects the collaborators of a [`DispatchContext`].
///
/// Anything not supplied falls back to a default: the WebSocket connector and
/// the HTTP ride API built from the config (when their features are enabled),
/// an in-memory outbox, no position source and no map.
pub struct DispatchContextBuilder {
    config: DispatchConfig,
    identity: Identity,
    connector: Option<Arc<dyn Connector>>,
    api: Option<Arc<dyn RideApi>>,
    store: Option<Arc<dyn PendingStore>>,
    position: Option<Arc<dyn PositionSource>>,
    map: Option<Arc<dyn MapSink>>,
    auth_token: Option<String>,
}

impl DispatchContextBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn api(mut self, api: Arc<dyn RideApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn store(mut self, store: Arc<dyn PendingStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn position(mut self, position: Arc<dyn PositionSource>) -> Self {
        self.position = Some(position);
        self
    }

    pub fn map(mut self, map: Arc<dyn MapSink>) -> Self {
        self.map = Some(map);
        self
    }

    /// Bearer token passed through to the default HTTP ride API.
    pub fn auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn build(self) -> Result<DispatchContext, ContextError> {
        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector(&self.config)?,
        };
        let api = match self.api {
            Some(api) => api,
            None => default_api(&self.config, self.auth_token)?,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryPendingStore::new()));

        let router = EventRouter::new();
        let connection =
            ConnectionManager::new(connector, router.clone(), self.config.connection.clone());
        let controller = RideLifecycleController::new(ControllerDeps {
            identity: self.identity.clone(),
            ride_config: self.config.ride.clone(),
            relay_config: self.config.relay.clone(),
            connection: connection.clone(),
            api,
            store: store.clone(),
            position: self.position.unwrap_or_else(|| Arc::new(NoPosition)),
            map: self.map.unwrap_or_else(|| Arc::new(NoMap)),
        });

        tracing::debug!(identity = %self.identity, "dispatch context built");
        Ok(DispatchContext {
            config: self.config,
            identity: self.identity,
            router,
            connection,
            controller,
            store,
        })
    }
}

#[cfg(feature = "ws")]
fn default_connector(config: &DispatchConfig) -> Result<Arc<dyn Connector>, ContextError> {
    Ok(Arc::new(crate::core::WsConnector::new(config.ws_url.clone())))
}

#[cfg(not(feature = "ws"))]
fn default_connector(_config: &DispatchConfig) -> Result<Arc<dyn Connector>, ContextError> {
    Err(ContextError::Missing("connector"))
}

#[cfg(feature = "http")]
fn default_api(
    config: &DispatchConfig,
    auth_token: Option<String>,
) -> Result<Arc<dyn RideApi>, ContextError> {
    let api = crate::retrieve::HttpRideApi::new(&config.api_base_url, auth_token)
        .map_err(|e| ContextError::Api(e.to_string()))?;
    Ok(Arc::new(api))
}

#[cfg(not(feature = "http"))]
fn default_api(
    _config: &DispatchConfig,
    _auth_token: Option<String>,
) -> Result<Arc<dyn RideApi>, ContextError> {
    Err(ContextError::Missing("ride API"))
}
