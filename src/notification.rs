//! Payment notification contract shared by the poll and push channels.
//!
//! This module provides [`PaymentNotification`] (the event both channels
//! deliver), [`NotificationConfig`] for the channel and dashboard timings,
//! and [`ChannelHandle`] for controlling a running channel. The loops
//! themselves live in [`crate::poll`] and [`crate::push`].

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::GatewayError;

/// Payment status carried by a notification.
///
/// Unknown statuses are kept verbatim in [`PaymentStatus::Other`] so a
/// backend that adds a status never breaks delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentStatus {
    /// Consultation or visit fee paid.
    Paid,
    /// Checkout session created, waiting for the user.
    AwaitingPayment,
    /// Payment submitted, not settled yet.
    Pending,
    /// Billing attempt completed.
    Completed,
    /// Payment failed.
    Failed,
    /// Checkout session expired.
    Expired,
    /// Any other status string.
    Other(String),
}

impl PaymentStatus {
    /// Wire spelling of the status.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Paid => "PAID",
            Self::AwaitingPayment => "AWAITING_PAYMENT",
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
            Self::Other(s) => s,
        }
    }

    /// Returns `true` if the status means the payment went through.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Paid | Self::Completed)
    }
}

impl From<String> for PaymentStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "PAID" => Self::Paid,
            "AWAITING_PAYMENT" => Self::AwaitingPayment,
            "PENDING" => Self::Pending,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "EXPIRED" => Self::Expired,
            _ => Self::Other(s),
        }
    }
}

impl From<PaymentStatus> for String {
    fn from(status: PaymentStatus) -> Self {
        match status {
            PaymentStatus::Other(s) => s,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment status change pushed or polled from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentNotification {
    /// New payment status.
    pub status: PaymentStatus,
    /// Payment type, e.g. `CONSULTATION_FEE` or `VISIT_FEE`.
    #[serde(default)]
    pub payment_type: Option<String>,
    /// Visit the payment belongs to, if any.
    #[serde(default)]
    pub visit_id: Option<i64>,
    /// Free-form message from the backend.
    #[serde(default)]
    pub message: Option<String>,
}

impl PaymentNotification {
    /// Build a notification with only a status and payment type.
    pub fn new(status: PaymentStatus, payment_type: impl Into<String>) -> Self {
        Self {
            status,
            payment_type: Some(payment_type.into()),
            visit_id: None,
            message: None,
        }
    }

    /// Text for the dashboard banner.
    ///
    /// `VISIT_FEE` + `PAID` reads "Payment successful! Your visit fee
    /// payment has been processed."
    pub fn banner_text(&self) -> String {
        if self.status.is_completed() {
            match self.payment_type.as_deref().filter(|t| !t.is_empty()) {
                Some(kind) => format!(
                    "Payment successful! Your {} payment has been processed.",
                    kind.replace('_', " ").to_lowercase()
                ),
                None => "Payment successful! Your payment has been processed.".to_owned(),
            }
        } else {
            format!("Payment status updated: {}", self.status)
        }
    }
}

/// Decode a notification from a response body or text frame.
///
/// # Errors
///
/// Returns [`GatewayError::Decode`] if `raw` is not a JSON object with at
/// least a string `status`.
pub fn parse_notification(raw: &str) -> Result<PaymentNotification, GatewayError> {
    serde_json::from_str(raw).map_err(|e| GatewayError::Decode(format!("payment notification: {e}")))
}

/// Decode a notification from an already-parsed JSON value.
pub(crate) fn notification_from_value(
    value: serde_json::Value,
) -> Result<PaymentNotification, GatewayError> {
    serde_json::from_value(value)
        .map_err(|e| GatewayError::Decode(format!("payment notification: {e}")))
}

/// Timing for the notification channels and the dashboard reaction.
///
/// All fields have defaults matching the deployed portals, accessible via
/// [`NotificationConfig::default()`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use clinic_portal::NotificationConfig;
///
/// let config = NotificationConfig {
///     poll_interval: Duration::from_secs(10),
///     ..NotificationConfig::default()
/// };
/// assert_eq!(config.poll_interval, Duration::from_secs(10));
/// assert_eq!(config.reconnect_delay, Duration::from_secs(3));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    /// Delay between polls of the notification endpoint.
    ///
    /// Default: 3 seconds.
    pub poll_interval: Duration,

    /// Delay before reconnecting after the push connection closes or fails
    /// to open.
    ///
    /// Default: 3 seconds.
    pub reconnect_delay: Duration,

    /// How long a banner stays up before it clears itself.
    ///
    /// Default: 5 seconds.
    pub banner_ttl: Duration,

    /// Delay between a completion notification and the refresh of the
    /// dashboard's dependent data.
    ///
    /// Default: 1 second.
    pub refetch_delay: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(3),
            banner_ttl: Duration::from_secs(5),
            refetch_delay: Duration::from_secs(1),
        }
    }
}

/// Receiver of delivered notifications.
///
/// Invoked on the channel's task, in arrival order, never after the
/// channel has shut down.
pub type NotificationCallback = Arc<dyn Fn(PaymentNotification) + Send + Sync>;

/// Which notification channel to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelMode {
    /// Periodic HTTP polling (patient portal).
    #[default]
    Poll,
    /// Persistent WebSocket connection (receptionist portal).
    Push,
}

impl std::str::FromStr for ChannelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" => Ok(Self::Poll),
            "push" | "ws" | "websocket" => Ok(Self::Push),
            other => Err(format!("unknown channel mode {other:?} (expected poll or push)")),
        }
    }
}

/// Observable health of a running channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Push: the socket is open. Poll: the last poll reached the server.
    pub connected: bool,
    /// Last failure, cleared by the next success.
    pub last_error: Option<String>,
}

/// Shared writer for a channel's [`ChannelStatus`].
#[derive(Clone)]
pub(crate) struct StatusCell {
    tx: Arc<watch::Sender<ChannelStatus>>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(ChannelStatus::default());
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn set_connected(&self) {
        self.tx.send_if_modified(|s| {
            let changed = !s.connected || s.last_error.is_some();
            s.connected = true;
            s.last_error = None;
            changed
        });
    }

    pub(crate) fn set_disconnected(&self, error: Option<String>) {
        self.tx.send_if_modified(|s| {
            let changed = s.connected || (error.is_some() && s.last_error != error);
            s.connected = false;
            if error.is_some() {
                s.last_error = error;
            }
            changed
        });
    }

    pub(crate) fn get(&self) -> ChannelStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.tx.subscribe()
    }
}

/// Handle for controlling a running notification channel.
///
/// Dropping the last clone of the handle also stops the loop, but without
/// waiting for it; call [`shutdown`](ChannelHandle::shutdown) to know the
/// channel is gone. Views that own a channel do so from their unmount path.
///
/// `Clone` is cheap: all fields are shared.
#[derive(Clone)]
pub struct ChannelHandle {
    mode: ChannelMode,
    /// Sends `true` to signal the loop to stop.
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) status: StatusCell,
    /// Taken and awaited exactly once by [`shutdown`](ChannelHandle::shutdown).
    pub(crate) task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("mode", &self.mode)
            .field("status", &self.status())
            .finish()
    }
}

impl ChannelHandle {
    /// Spawn `run` as the channel's loop.
    ///
    /// `run` receives the shutdown receiver and the status writer and must
    /// return once the receiver flips to `true`.
    pub(crate) fn spawn<F, Fut>(mode: ChannelMode, run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>, StatusCell) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = StatusCell::new();
        let task = tokio::spawn(run(shutdown_rx, status.clone()));
        tracing::debug!(?mode, "notification channel started");
        Self {
            mode,
            shutdown_tx,
            status,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    /// Returns which channel variant this handle controls.
    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Returns `true` while the channel is connected (push) or its last
    /// poll reached the server (poll).
    pub fn is_connected(&self) -> bool {
        self.status.get().connected
    }

    /// Returns the current channel status.
    pub fn status(&self) -> ChannelStatus {
        self.status.get()
    }

    /// Subscribe to channel status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    /// Signal the loop to stop and wait for it to exit.
    ///
    /// Once this returns, the callback will not be invoked again and no
    /// timer or connection owned by the channel remains. Calling `shutdown`
    /// more than once is safe; later calls return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the loop task panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        // The receiver is gone if the task already exited.
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().await.take();
        if let Some(join_handle) = task {
            join_handle
                .await
                .map_err(|e| io::Error::other(format!("notification task panicked: {e}")))?;
            tracing::debug!(mode = ?self.mode, "notification channel stopped");
        }
        Ok(())
    }
}
