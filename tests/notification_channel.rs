//! Notification channels driving the dashboard, through the public API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clinic_portal::{
    BannerSeverity, ChannelMode, Gateway, GatewayError, GatewayRequest, Identity, MemoryStorage,
    NotificationCallback, PaymentNotification, PaymentStatus, PortalBuilder, PortalConfig,
    PushConnection, PushConnector, PushFrame, SESSION_KEY,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

const DETAILS: &str = "/patients/me/details";
const NOTIFICATIONS: &str = "/patients/me/payment-notifications";

/// Backend whose notification endpoint answers from a queue; an empty queue
/// answers 204.
#[derive(Default)]
struct Backend {
    pending: Mutex<Vec<Value>>,
    calls: Mutex<Vec<String>>,
}

impl Backend {
    fn queue(&self, notification: Value) {
        self.pending.lock().expect("pending lock").push(notification);
    }

    fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|p| *p == path)
            .count()
    }
}

#[async_trait::async_trait]
impl Gateway for Backend {
    async fn request(&self, request: GatewayRequest) -> Result<Option<Value>, GatewayError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(request.path.clone());
        if request.token.is_none() {
            return Err(GatewayError::Unauthorized { message: None });
        }
        match request.path.as_str() {
            NOTIFICATIONS => {
                let mut pending = self.pending.lock().expect("pending lock");
                Ok((!pending.is_empty()).then(|| pending.remove(0)))
            }
            DETAILS => Ok(Some(json!({
                "id": "8a1f6c9e-0d6b-4a53-9a55-1f4e3c2b7d10",
                "name": "Jane Doe"
            }))),
            _ => Ok(Some(json!([]))),
        }
    }
}

/// Connector whose connections are fed by the test. Each successful
/// connect hands the test a sender; dropping it ends that connection's
/// stream.
struct TestConnector {
    servers: mpsc::UnboundedSender<mpsc::UnboundedSender<PushFrame>>,
    closes: Arc<Mutex<Vec<u16>>>,
}

struct TestConnection {
    frames: mpsc::UnboundedReceiver<PushFrame>,
    closes: Arc<Mutex<Vec<u16>>>,
}

#[async_trait::async_trait]
impl PushConnector for TestConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn PushConnection>, GatewayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.servers
            .send(tx)
            .map_err(|_| GatewayError::Transport("test finished".into()))?;
        Ok(Box::new(TestConnection {
            frames: rx,
            closes: self.closes.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl PushConnection for TestConnection {
    async fn next_frame(&mut self) -> Option<Result<PushFrame, GatewayError>> {
        self.frames.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16, _reason: &str) -> Result<(), GatewayError> {
        self.closes.lock().expect("closes lock").push(code);
        Ok(())
    }
}

fn signed_in_storage() -> Arc<MemoryStorage> {
    let identity = Identity::new("8a1f6c9e-0d6b-4a53-9a55-1f4e3c2b7d10", "Jane Doe", "jwt-1");
    let blob = serde_json::to_string(&identity).expect("encode identity");
    Arc::new(MemoryStorage::with_entry(SESSION_KEY, blob))
}

fn text(status: &str, payment_type: &str) -> PushFrame {
    PushFrame::Text(json!({"status": status, "paymentType": payment_type}).to_string())
}

#[tokio::test(start_paused = true)]
async fn push_frames_drive_banner_and_refetch() {
    let backend = Arc::new(Backend::default());
    let (servers_tx, mut servers) = mpsc::unbounded_channel();
    let closes = Arc::new(Mutex::new(Vec::new()));
    let portal = PortalBuilder::new()
        .config(PortalConfig {
            channel_mode: ChannelMode::Push,
            ..PortalConfig::default()
        })
        .storage(signed_in_storage())
        .gateway(backend.clone())
        .connector(Arc::new(TestConnector {
            servers: servers_tx,
            closes: closes.clone(),
        }))
        .open()
        .expect("open");

    let dashboard = portal.mount_dashboard().await;
    let server = servers.recv().await.expect("connected");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.calls_to(DETAILS), 1, "initial load");

    server.send(text("PENDING", "VISIT_FEE")).expect("send");
    server.send(text("PAID", "VISIT_FEE")).expect("send");
    tokio::time::sleep(Duration::from_millis(10)).await;

    let banner = dashboard.banner().expect("banner");
    assert_eq!(banner.severity, BannerSeverity::Success);
    assert_eq!(banner.notification.status, PaymentStatus::Paid);
    assert_eq!(
        banner.text,
        "Payment successful! Your visit fee payment has been processed."
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(backend.calls_to(DETAILS), 2, "one refetch after completion");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(dashboard.banner(), None);

    dashboard.unmount().await.expect("unmount");
    assert_eq!(*closes.lock().expect("closes lock"), vec![1001]);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(servers.try_recv().is_err(), "no reconnect after unmount");
}

#[tokio::test(start_paused = true)]
async fn server_close_reconnects_once_after_delay() {
    let (servers_tx, mut servers) = mpsc::unbounded_channel();
    let closes = Arc::new(Mutex::new(Vec::new()));
    let portal = PortalBuilder::new()
        .config(PortalConfig {
            channel_mode: ChannelMode::Push,
            ..PortalConfig::default()
        })
        .storage(signed_in_storage())
        .gateway(Arc::new(Backend::default()))
        .connector(Arc::new(TestConnector {
            servers: servers_tx,
            closes,
        }))
        .open()
        .expect("open");

    let seen = Arc::new(Mutex::new(Vec::<PaymentNotification>::new()));
    let sink = seen.clone();
    let callback: NotificationCallback = Arc::new(move |n| sink.lock().expect("seen lock").push(n));
    let channel = portal.start_notifications(callback).await.expect("start");

    let first = servers.recv().await.expect("first connection");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(channel.is_connected());

    first
        .send(PushFrame::Closed {
            code: Some(1006),
            reason: String::new(),
        })
        .expect("send close");
    let closed_at = tokio::time::Instant::now();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!channel.is_connected());

    let second = servers.recv().await.expect("second connection");
    let waited = tokio::time::Instant::now() - closed_at;
    assert!(waited >= Duration::from_secs(3), "reconnect waits {waited:?}");
    assert!(waited < Duration::from_millis(3_100));

    second.send(text("COMPLETED", "CONSULTATION_FEE")).expect("send");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(seen.lock().expect("seen lock").len(), 1);
    assert!(servers.try_recv().is_err(), "exactly one reconnect");

    portal.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn polling_delivers_queued_notifications_only() {
    let backend = Arc::new(Backend::default());
    let portal = PortalBuilder::new()
        .storage(signed_in_storage())
        .gateway(backend.clone())
        .open()
        .expect("open");

    let seen = Arc::new(Mutex::new(Vec::<PaymentNotification>::new()));
    let sink = seen.clone();
    let channel = portal
        .start_notifications(Arc::new(move |n| sink.lock().expect("seen lock").push(n)))
        .await
        .expect("start");
    assert_eq!(channel.mode(), ChannelMode::Poll);

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    assert_eq!(backend.calls_to(NOTIFICATIONS), 1);
    assert!(seen.lock().expect("seen lock").is_empty(), "204 is ignored");

    backend.queue(json!({"status": "FAILED", "paymentType": "VISIT_FEE", "visitId": 12}));
    tokio::time::sleep(Duration::from_secs(3)).await;
    let delivered = seen.lock().expect("seen lock").clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].visit_id, Some(12));
    assert_eq!(delivered[0].banner_text(), "Payment status updated: FAILED");

    portal.logout().await.expect("logout");
    let polls = backend.calls_to(NOTIFICATIONS);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.calls_to(NOTIFICATIONS), polls, "logout stops polling");
}
