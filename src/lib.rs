//! Client core for the clinic patient and receptionist portals: session
//! lifecycle, route gating, payment notifications and the backend gateway.

pub mod api;
mod auth;
pub mod client;
mod config;
pub mod dashboard;
mod error;
pub mod guard;
pub mod notification;
pub mod poll;
mod portal;
pub mod push;
pub mod records;
pub mod roster;
pub mod scope;
pub mod session;
mod storage;

pub use api::PortalApi;
pub use client::{Gateway, GatewayRequest, HttpGateway};
pub use config::PortalConfig;
pub use dashboard::{Banner, BannerSeverity, PatientRecords, PaymentDashboard};
pub use error::{
    CONNECTIVITY_MESSAGE, ConfigError, GatewayError, INVALID_CREDENTIALS_MESSAGE,
    LOGIN_FAILED_MESSAGE, LoginError, SERVER_FAILURE_MESSAGE, SessionError,
    VALIDATION_FALLBACK_MESSAGE,
};
pub use guard::{GuardDecision, GuardHandle, Redirect, RouteGuard, RouteTable, RouteView, Router};
pub use notification::{
    ChannelHandle, ChannelMode, ChannelStatus, NotificationCallback, NotificationConfig,
    PaymentNotification, PaymentStatus, parse_notification,
};
pub use poll::start_polling;
pub use portal::{Portal, PortalBuilder};
pub use push::{PushConnection, PushConnector, PushFrame, WsConnector, start_push};
pub use records::{Credentials, Patient, PatientDetails, PaymentAttempt};
pub use roster::{Roster, RosterFilter, RosterStats};
pub use scope::{ScopeToken, ViewScope, ViewState};
pub use session::{Identity, SESSION_KEY, Session, SessionPhase, SessionStore};
pub use storage::{FileStorage, MemoryStorage, SessionStorage};
