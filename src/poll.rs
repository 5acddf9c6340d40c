//! Poll variant of the notification channel.

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::api::PortalApi;
use crate::notification::{
    ChannelHandle, ChannelMode, NotificationCallback, NotificationConfig, StatusCell,
};

/// Start polling the notification endpoint.
///
/// The first poll happens one `poll_interval` after the call, then every
/// `poll_interval`. Ticks while the session has no token are skipped
/// without a request.
///
/// # Arguments
///
/// * `api` - Endpoint helpers; the token is read from its session on every
///   tick.
/// * `config` - Only `poll_interval` is used.
/// * `callback` - Receives each delivered notification.
///
/// # Returns
///
/// A [`ChannelHandle`] whose `shutdown` stops the timer and abandons any
/// request in flight.
pub fn start_polling(
    api: PortalApi,
    config: &NotificationConfig,
    callback: NotificationCallback,
) -> ChannelHandle {
    let interval = config.poll_interval;
    ChannelHandle::spawn(ChannelMode::Poll, move |shutdown_rx, status| {
        run_poll_loop(api, interval, callback, status, shutdown_rx)
    })
}

/// Core loop spawned by [`start_polling`].
async fn run_poll_loop(
    api: PortalApi,
    poll_interval: std::time::Duration,
    callback: NotificationCallback,
    status: StatusCell,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it.
    ticker.tick().await;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => return,
        }

        if api.session().token().is_none() {
            tracing::trace!("poll: no session token, skipping tick");
            continue;
        }

        let outcome = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            outcome = api.payment_notification() => outcome,
        };

        match outcome {
            Ok(Some(notification)) => {
                status.set_connected();
                tracing::info!(status = %notification.status, "poll: payment notification received");
                callback(notification);
            }
            Ok(None) => status.set_connected(),
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "poll: request failed");
                status.set_disconnected(Some(e.user_message()));
            }
            Err(e) => {
                // The server answered; only the body or status was wrong.
                tracing::warn!(error = %e, "poll: notification rejected");
                status.set_connected();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::api::NOTIFICATIONS_PATH;
    use crate::client::test_fixtures::FakeGateway;
    use crate::error::GatewayError;
    use crate::notification::{PaymentNotification, PaymentStatus};
    use crate::session::{Identity, SessionStore};
    use crate::storage::MemoryStorage;

    fn session(signed_in: bool) -> SessionStore {
        let store = SessionStore::new(Arc::new(MemoryStorage::new()));
        store.restore();
        if signed_in {
            store
                .login(Identity::new("p1", "Jane Doe", "t1"))
                .expect("login");
        }
        store
    }

    fn collector() -> (NotificationCallback, Arc<Mutex<Vec<PaymentNotification>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: NotificationCallback =
            Arc::new(move |n| sink.lock().expect("sink lock").push(n));
        (callback, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn polls_every_interval_and_delivers_200_bodies() {
        let gateway = Arc::new(FakeGateway::new(|_| {
            Ok(Some(json!({"status": "PAID", "paymentType": "VISIT_FEE"})))
        }));
        let api = PortalApi::new(gateway.clone(), session(true));
        let (callback, seen) = collector();

        let handle = start_polling(api, &NotificationConfig::default(), callback);

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(gateway.count(), 0, "no request before the first interval");

        tokio::time::sleep(Duration::from_millis(6_200)).await;
        assert_eq!(gateway.count_path(NOTIFICATIONS_PATH), 3);
        assert_eq!(seen.lock().expect("lock").len(), 3);
        assert_eq!(seen.lock().expect("lock")[0].status, PaymentStatus::Paid);
        assert!(handle.is_connected());
        assert_eq!(gateway.requests()[0].token.as_deref(), Some("t1"));

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn no_token_means_no_request() {
        let gateway = Arc::new(FakeGateway::new(|_| Ok(None)));
        let api = PortalApi::new(gateway.clone(), session(false));
        let (callback, seen) = collector();

        let handle = start_polling(api, &NotificationConfig::default(), callback);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(gateway.count(), 0);
        assert!(seen.lock().expect("lock").is_empty());
        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn no_content_and_errors_are_not_delivered_and_loop_continues() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();
        let gateway = Arc::new(FakeGateway::new(move |_| {
            let mut n = counter.lock().expect("lock");
            *n += 1;
            match *n {
                1 => Ok(None),
                2 => Err(GatewayError::Server { status: 500 }),
                3 => Err(GatewayError::Transport("connection reset".into())),
                4 => Ok(Some(json!({"not": "a notification"}))),
                _ => Ok(Some(json!({"status": "FAILED", "paymentType": "VISIT_FEE"}))),
            }
        }));
        let api = PortalApi::new(gateway.clone(), session(true));
        let (callback, seen) = collector();

        let handle = start_polling(api, &NotificationConfig::default(), callback);

        tokio::time::sleep(Duration::from_millis(9_100)).await;
        assert_eq!(gateway.count(), 3);
        assert!(!handle.is_connected(), "transport error marks disconnected");
        assert!(handle.status().last_error.is_some());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(gateway.count(), 5);
        let seen = seen.lock().expect("lock").clone();
        assert_eq!(seen.len(), 1, "only the well-formed 200 is delivered");
        assert_eq!(seen[0].status, PaymentStatus::Failed);
        assert!(handle.is_connected());

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_timer_and_abandons_in_flight_request() {
        let gateway = Arc::new(
            FakeGateway::new(|_| Ok(Some(json!({"status": "PAID", "paymentType": "VISIT_FEE"}))))
                .with_delay(Duration::from_secs(2)),
        );
        let api = PortalApi::new(gateway.clone(), session(true));
        let (callback, seen) = collector();

        let handle = start_polling(api, &NotificationConfig::default(), callback);

        // First request starts at t=3s and would answer at t=5s.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(gateway.count(), 1);
        handle.shutdown().await.expect("shutdown");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(gateway.count(), 1, "zero requests after shutdown");
        assert!(seen.lock().expect("lock").is_empty(), "abandoned response is not delivered");
    }

    #[tokio::test(start_paused = true)]
    async fn token_appearing_later_starts_requests() {
        let gateway = Arc::new(FakeGateway::new(|_| Ok(None)));
        let store = session(false);
        let api = PortalApi::new(gateway.clone(), store.clone());
        let (callback, _seen) = collector();
        let handle = start_polling(api, &NotificationConfig::default(), callback);

        tokio::time::sleep(Duration::from_millis(6_500)).await;
        assert_eq!(gateway.count(), 0);

        store
            .login(Identity::new("p1", "Jane Doe", "t1"))
            .expect("login");
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(gateway.count(), 1);

        handle.shutdown().await.expect("shutdown");
    }
}
