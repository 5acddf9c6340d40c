//! Watch payment notifications for one patient and log them until Ctrl-C.
//!
//! Restores the session from `PORTAL_SESSION_DIR`, or signs in with
//! `PORTAL_EMAIL` / `PORTAL_PASSWORD` when no session is stored.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use clinic_portal::{
    Credentials, NotificationCallback, PaymentStatus, PortalBuilder, PortalConfig, SessionPhase,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> ExitCode {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match PortalConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let portal = match PortalBuilder::new().config(config).open() {
        Ok(portal) => portal,
        Err(e) => {
            error!(error = %e, "failed to open portal");
            return ExitCode::FAILURE;
        }
    };

    if portal.session().phase() != SessionPhase::Authenticated {
        let (Ok(email), Ok(password)) = (env::var("PORTAL_EMAIL"), env::var("PORTAL_PASSWORD"))
        else {
            error!("no stored session; set PORTAL_EMAIL and PORTAL_PASSWORD to sign in");
            return ExitCode::FAILURE;
        };
        if let Err(e) = portal.login(&Credentials { email, password }).await {
            error!(error = %e, "{}", e.user_message());
            return ExitCode::FAILURE;
        }
    }

    let callback: NotificationCallback = Arc::new(|notification| {
        let visit = notification.visit_id;
        match notification.status {
            PaymentStatus::Failed | PaymentStatus::Expired => {
                warn!(status = %notification.status, ?visit, "{}", notification.banner_text())
            }
            _ => info!(status = %notification.status, ?visit, "{}", notification.banner_text()),
        }
    });

    let channel = match portal.start_notifications(callback).await {
        Ok(channel) => channel,
        Err(e) => {
            error!(error = %e, "failed to start notifications");
            return ExitCode::FAILURE;
        }
    };
    info!(mode = ?channel.mode(), "watching payment notifications");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
    }

    info!("shutting down");
    match portal.shutdown().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "shutdown failed");
            ExitCode::FAILURE
        }
    }
}
