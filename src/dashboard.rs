//! Patient dashboard: payment banner and dependent-data refresh.
//!
//! The dashboard owns a [`ViewScope`]. Everything it starts (the banner
//! timer, the deferred refetch, an attached notification channel) stops
//! when it unmounts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

use crate::api::PortalApi;
use crate::notification::{ChannelHandle, NotificationCallback, NotificationConfig, PaymentNotification};
use crate::records::{PatientDetails, PaymentAttempt};
use crate::scope::{ScopeToken, ViewScope, ViewState};

/// How a banner is styled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerSeverity {
    /// A payment completed.
    Success,
    /// Any other status change.
    Info,
}

/// The transient banner shown for a payment notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    /// Monotonic id; a timer only clears the banner it was started for.
    pub id: u64,
    /// Display text.
    pub text: String,
    /// Styling.
    pub severity: BannerSeverity,
    /// The notification that raised it.
    pub notification: PaymentNotification,
}

/// Patient details and billing history, fetched together.
#[derive(Clone)]
pub struct PatientRecords {
    api: PortalApi,
    scope: ScopeToken,
    details: ViewState<PatientDetails>,
    bills: ViewState<Vec<PaymentAttempt>>,
}

impl std::fmt::Debug for PatientRecords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatientRecords")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl PatientRecords {
    /// Create empty records bound to `scope`.
    pub fn new(api: PortalApi, scope: &ScopeToken) -> Self {
        Self {
            api,
            scope: scope.clone(),
            details: ViewState::new(scope),
            bills: ViewState::new(scope),
        }
    }

    /// Fetch details and billing history concurrently.
    ///
    /// Does nothing once the owning view has unmounted, and abandons the
    /// requests if it unmounts mid-flight.
    pub async fn refresh(&self) {
        if !self.scope.is_mounted() {
            return;
        }
        let details_ticket = self.details.begin();
        let bills_ticket = self.bills.begin();
        let fetch = async { tokio::join!(self.api.patient_details(), self.api.payment_attempts()) };
        let Some((details, bills)) = self.scope.run(fetch).await else {
            return;
        };
        if let Err(e) = &details {
            tracing::warn!(error = %e, "failed to load patient details");
        }
        if let Err(e) = &bills {
            tracing::warn!(error = %e, "failed to load billing history");
        }
        self.details.finish(details_ticket, details);
        self.bills.finish(bills_ticket, bills);
    }

    /// Patient details state.
    pub fn details(&self) -> &ViewState<PatientDetails> {
        &self.details
    }

    /// Billing history state.
    pub fn bills(&self) -> &ViewState<Vec<PaymentAttempt>> {
        &self.bills
    }
}

struct DashboardInner {
    scope: ScopeToken,
    config: NotificationConfig,
    banner_tx: watch::Sender<Option<Banner>>,
    next_banner: AtomicU64,
    records: PatientRecords,
}

impl DashboardInner {
    fn handle(self: &Arc<Self>, notification: PaymentNotification) {
        if !self.scope.is_mounted() {
            return;
        }

        let completed = notification.status.is_completed();
        let id = self.next_banner.fetch_add(1, Ordering::Relaxed) + 1;
        let banner = Banner {
            id,
            text: notification.banner_text(),
            severity: if completed {
                BannerSeverity::Success
            } else {
                BannerSeverity::Info
            },
            notification,
        };
        tracing::debug!(banner = id, text = %banner.text, "showing payment banner");
        self.banner_tx.send_replace(Some(banner));

        let inner = Arc::clone(self);
        let ttl = self.config.banner_ttl;
        self.scope.spawn(async move {
            tokio::time::sleep(ttl).await;
            inner.banner_tx.send_if_modified(|current| {
                if current.as_ref().is_some_and(|b| b.id == id) {
                    *current = None;
                    true
                } else {
                    false
                }
            });
        });

        if completed {
            let records = self.records.clone();
            let delay = self.config.refetch_delay;
            self.scope.spawn(async move {
                tokio::time::sleep(delay).await;
                tracing::debug!("refreshing records after completed payment");
                records.refresh().await;
            });
        }
    }
}

/// The mounted patient dashboard.
///
/// Dropping it unmounts the view, but an attached channel is only awaited
/// by [`unmount`](Self::unmount).
pub struct PaymentDashboard {
    scope: ViewScope,
    inner: Arc<DashboardInner>,
    channel: tokio::sync::Mutex<Option<ChannelHandle>>,
}

impl std::fmt::Debug for PaymentDashboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentDashboard")
            .field("mounted", &self.scope.is_mounted())
            .field("banner", &self.banner())
            .finish_non_exhaustive()
    }
}

impl PaymentDashboard {
    /// Mount the dashboard and start the initial load of its records.
    pub fn mount(api: PortalApi, config: NotificationConfig) -> Self {
        let scope = ViewScope::mount();
        let token = scope.token();
        let records = PatientRecords::new(api, &token);
        let (banner_tx, _rx) = watch::channel(None);

        let initial = records.clone();
        scope.spawn(async move { initial.refresh().await });

        Self {
            scope,
            inner: Arc::new(DashboardInner {
                scope: token,
                config,
                banner_tx,
                next_banner: AtomicU64::new(0),
                records,
            }),
            channel: tokio::sync::Mutex::new(None),
        }
    }

    /// React to one payment notification.
    ///
    /// Shows a banner that clears itself after `banner_ttl`. A completed
    /// payment additionally schedules one refresh of the records after
    /// `refetch_delay`. Ignored once unmounted.
    pub fn handle(&self, notification: PaymentNotification) {
        self.inner.handle(notification);
    }

    /// A callback that feeds this dashboard, for
    /// [`start_polling`](crate::poll::start_polling) or
    /// [`start_push`](crate::push::start_push).
    pub fn callback(&self) -> NotificationCallback {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |notification| inner.handle(notification))
    }

    /// Hand the dashboard the channel feeding it; it is shut down on unmount.
    ///
    /// A channel attached after unmount is shut down immediately.
    pub async fn attach(&self, channel: ChannelHandle) {
        let previous = {
            let mut slot = self.channel.lock().await;
            // Checked under the lock: `unmount` flips the scope before
            // taking it, so a stored channel is always seen by `unmount`.
            if !self.scope.is_mounted() {
                drop(slot);
                tracing::debug!("dashboard unmounted; stopping attached channel");
                if let Err(e) = channel.shutdown().await {
                    tracing::warn!(error = %e, "late notification channel failed to stop");
                }
                return;
            }
            slot.replace(channel)
        };
        if let Some(previous) = previous
            && let Err(e) = previous.shutdown().await
        {
            tracing::warn!(error = %e, "replaced notification channel failed to stop");
        }
    }

    /// Clear the banner now.
    pub fn dismiss(&self) {
        self.inner.banner_tx.send_replace(None);
    }

    /// The banner currently shown.
    pub fn banner(&self) -> Option<Banner> {
        self.inner.banner_tx.borrow().clone()
    }

    /// Subscribe to banner changes.
    pub fn subscribe_banner(&self) -> watch::Receiver<Option<Banner>> {
        self.inner.banner_tx.subscribe()
    }

    /// Patient details and billing history.
    pub fn records(&self) -> &PatientRecords {
        &self.inner.records
    }

    /// The attached channel, if any.
    pub async fn channel(&self) -> Option<ChannelHandle> {
        self.channel.lock().await.clone()
    }

    /// Returns `true` until [`unmount`](Self::unmount).
    pub fn is_mounted(&self) -> bool {
        self.scope.is_mounted()
    }

    /// Stop the attached channel, then every timer and fetch the view owns.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the channel task panicked.
    pub async fn unmount(&self) -> std::io::Result<()> {
        self.scope.unmount();
        let channel = self.channel.lock().await.take();
        match channel {
            Some(channel) => channel.shutdown().await,
            None => Ok(()),
        }
    }
}
