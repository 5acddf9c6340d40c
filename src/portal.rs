//! Top-level [`Portal`] and its builder.
//!
//! The portal is opened via [`PortalBuilder`], which restores the persisted
//! session and wires the gateway, router and notification connector
//! together. Views get everything they need from the portal instead of
//! reaching for globals.

use std::io;
use std::sync::Arc;

use crate::api::PortalApi;
use crate::client::{Gateway, HttpGateway};
use crate::config::PortalConfig;
use crate::dashboard::PaymentDashboard;
use crate::error::{LoginError, SessionError};
use crate::guard::{GuardHandle, LOGIN_PATH, RouteGuard, RouteTable, Router};
use crate::notification::{ChannelHandle, ChannelMode, NotificationCallback};
use crate::poll::start_polling;
use crate::push::{PushConnector, WsConnector, start_push};
use crate::records::Credentials;
use crate::session::{Session, SessionStore};
use crate::storage::{FileStorage, SessionStorage};

/// The wired-up client: session, API, router and channels.
///
/// `Clone` is cheap; all state is shared.
#[derive(Clone)]
pub struct Portal {
    config: PortalConfig,
    session: SessionStore,
    api: PortalApi,
    router: Router,
    route_table: RouteTable,
    connector: Arc<dyn PushConnector>,
    channel: Arc<tokio::sync::Mutex<Option<ChannelHandle>>>,
    guard: Arc<tokio::sync::Mutex<Option<GuardHandle>>>,
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("path", &self.router.current())
            .finish_non_exhaustive()
    }
}

impl Portal {
    /// Returns the session store.
    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// Returns the typed endpoint helpers.
    pub fn api(&self) -> &PortalApi {
        &self.api
    }

    /// Returns the router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Returns the configuration the portal was opened with.
    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    /// Sign in with `credentials`.
    ///
    /// On success the identity is persisted and published; a running route
    /// guard then moves the router off the login page.
    ///
    /// # Errors
    ///
    /// * [`LoginError::Gateway`] -- the backend refused or was unreachable.
    ///   Nothing changes.
    /// * [`LoginError::Session`] -- the identity could not be stored; the
    ///   previous session is kept.
    pub async fn login(&self, credentials: &Credentials) -> Result<Session, LoginError> {
        let identity = match self.api.login(credentials).await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(email = %credentials.email, error = %e, "login failed");
                return Err(e.into());
            }
        };
        Ok(self.session.login(identity)?)
    }

    /// Sign out and stop the notification channel, if one is running.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] if the persisted entry could not be
    /// removed. The in-memory session is cleared regardless.
    pub async fn logout(&self) -> Result<(), SessionError> {
        if let Err(e) = self.stop_notifications().await {
            tracing::warn!(error = %e, "notification channel did not stop cleanly");
        }
        self.session.logout()
    }

    /// Start the route guard.
    ///
    /// Can only be called once per portal until the guard is shut down
    /// through [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::AlreadyExists`] if the guard is running.
    pub async fn start_route_guard(&self) -> io::Result<GuardHandle> {
        let mut slot = self.guard.lock().await;
        if slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "route guard already started",
            ));
        }
        let handle = RouteGuard::new(self.route_table.clone()).spawn(&self.session, &self.router);
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Start the configured notification channel, delivering to `callback`.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::AlreadyExists`] if a channel is running.
    pub async fn start_notifications(&self, callback: NotificationCallback) -> io::Result<ChannelHandle> {
        let mut slot = self.channel.lock().await;
        if slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "notification channel already started",
            ));
        }
        let handle = self.spawn_channel(callback);
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Stop the channel started by
    /// [`start_notifications`](Self::start_notifications). A no-op if none
    /// is running.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the channel task panicked.
    pub async fn stop_notifications(&self) -> io::Result<()> {
        let handle = self.channel.lock().await.take();
        match handle {
            Some(handle) => handle.shutdown().await,
            None => Ok(()),
        }
    }

    /// Mount the patient dashboard with its own notification channel.
    ///
    /// The channel is owned by the dashboard and stops when it unmounts.
    pub async fn mount_dashboard(&self) -> PaymentDashboard {
        let dashboard = PaymentDashboard::mount(self.api.clone(), self.config.notification.clone());
        let channel = self.spawn_channel(dashboard.callback());
        dashboard.attach(channel).await;
        dashboard
    }

    /// Stop the route guard and the notification channel.
    ///
    /// # Errors
    ///
    /// Returns the first `io::Error` from a task that panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        let guard = self.guard.lock().await.take();
        let guard_result = match guard {
            Some(guard) => guard.shutdown().await,
            None => Ok(()),
        };
        let channel_result = self.stop_notifications().await;
        guard_result.and(channel_result)
    }

    fn spawn_channel(&self, callback: NotificationCallback) -> ChannelHandle {
        let config = &self.config;
        match config.channel_mode {
            ChannelMode::Poll => start_polling(self.api.clone(), &config.notification, callback),
            ChannelMode::Push => start_push(
                Arc::clone(&self.connector),
                config.push_url.clone(),
                &config.notification,
                callback,
            ),
        }
    }
}

/// Builder for configuring and opening a [`Portal`].
///
/// Anything not set falls back to the production wiring derived from the
/// [`PortalConfig`]: file storage under `session_dir`, an HTTP gateway at
/// `api_url`, and a WebSocket connector.
///
/// # Examples
///
/// ```no_run
/// use clinic_portal::{PortalBuilder, PortalConfig};
///
/// # fn example() -> std::io::Result<()> {
/// let portal = PortalBuilder::new()
///     .config(PortalConfig {
///         api_url: "http://127.0.0.1:4004/api".into(),
///         ..PortalConfig::default()
///     })
///     .open()?;
/// assert!(!portal.session().snapshot().is_loading());
/// # Ok(())
/// # }
/// ```
pub struct PortalBuilder {
    config: PortalConfig,
    storage: Option<Arc<dyn SessionStorage>>,
    gateway: Option<Arc<dyn Gateway>>,
    connector: Option<Arc<dyn PushConnector>>,
    route_table: RouteTable,
    initial_path: String,
}

impl PortalBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: PortalConfig::default(),
            storage: None,
            gateway: None,
            connector: None,
            route_table: RouteTable::default(),
            initial_path: LOGIN_PATH.to_owned(),
        }
    }

    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: PortalConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist the session in `storage`.
    pub fn storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Send requests through `gateway`.
    pub fn gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Open push connections through `connector`.
    pub fn connector(mut self, connector: Arc<dyn PushConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Guard routes with `table`.
    pub fn route_table(mut self, table: RouteTable) -> Self {
        self.route_table = table;
        self
    }

    /// Path the router starts on.
    pub fn initial_path(mut self, path: impl Into<String>) -> Self {
        self.initial_path = path.into();
        self
    }

    /// Build the portal and restore the persisted session.
    ///
    /// The session is resolved (authenticated or anonymous) before this
    /// returns. Call from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the default HTTP client could not be built.
    pub fn open(self) -> io::Result<Portal> {
        let config = self.config;

        let storage = match self.storage {
            Some(storage) => storage,
            None => Arc::new(FileStorage::new(config.session_dir.clone())),
        };
        let gateway: Arc<dyn Gateway> = match self.gateway {
            Some(gateway) => gateway,
            None => Arc::new(
                HttpGateway::with_timeout(config.api_url.clone(), config.request_timeout)
                    .map_err(io::Error::other)?,
            ),
        };
        let connector = self.connector.unwrap_or_else(|| Arc::new(WsConnector));

        let session = SessionStore::new(storage);
        session.restore();

        let api = PortalApi::new(gateway, session.clone())
            .with_notifications_path(config.notifications_path.clone());

        tracing::info!(
            api_url = %config.api_url,
            phase = ?session.phase(),
            "portal opened"
        );

        Ok(Portal {
            config,
            session,
            api,
            router: Router::new(self.initial_path),
            route_table: self.route_table,
            connector,
            channel: Arc::new(tokio::sync::Mutex::new(None)),
            guard: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }
}

impl Default for PortalBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// Portals are shared across tasks.
const _: () = {
    #[allow(dead_code)]
    fn assert_send_sync<T: Send + Sync>() {}

    #[allow(dead_code)]
    fn check() {
        assert_send_sync::<Portal>();
        assert_send_sync::<PortalBuilder>();
    }
};
