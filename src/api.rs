//! Typed endpoint helpers for the patient and receptionist portals.
//!
//! [`PortalApi`] pairs a [`Gateway`] with the [`SessionStore`] so each call
//! picks up the current bearer token without the caller threading it
//! through.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::client::{Gateway, GatewayRequest};
use crate::error::GatewayError;
use crate::notification::{PaymentNotification, notification_from_value};
use crate::records::{
    AppointmentRequest, CheckoutSession, Credentials, LoginResponse, NewPatient, NewVisit, Page,
    PageQuery, Patient, PatientDetails, PaymentAttempt,
};
use crate::session::{Identity, SessionStore};

/// Default path of the polled notification endpoint.
pub const NOTIFICATIONS_PATH: &str = "/patients/me/payment-notifications";

/// Typed access to the backend endpoints the portals use.
///
/// `Clone` is cheap: the gateway and session are shared.
#[derive(Clone)]
pub struct PortalApi {
    gateway: Arc<dyn Gateway>,
    session: SessionStore,
    notifications_path: String,
}

impl fmt::Debug for PortalApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalApi")
            .field("session", &self.session)
            .field("notifications_path", &self.notifications_path)
            .finish()
    }
}

impl PortalApi {
    /// Create an API over `gateway` authenticated by `session`.
    pub fn new(gateway: Arc<dyn Gateway>, session: SessionStore) -> Self {
        Self {
            gateway,
            session,
            notifications_path: NOTIFICATIONS_PATH.to_owned(),
        }
    }

    /// Override the polled notification path.
    pub fn with_notifications_path(mut self, path: impl Into<String>) -> Self {
        self.notifications_path = path.into();
        self
    }

    /// Returns the session this API authenticates with.
    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// Returns the underlying gateway.
    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    /// Exchange credentials for an [`Identity`].
    ///
    /// Does not touch the session; see [`Portal::login`](crate::Portal::login)
    /// for the full flow.
    ///
    /// # Errors
    ///
    /// * [`GatewayError::Unauthorized`] -- wrong credentials.
    /// * [`GatewayError::LoginRejected`] -- the backend answered 2xx but
    ///   without a patient id or token.
    /// * any other [`GatewayError`] from the transport.
    pub async fn login(&self, credentials: &Credentials) -> Result<Identity, GatewayError> {
        let body = serde_json::to_value(credentials)
            .map_err(|e| GatewayError::Decode(format!("credentials: {e}")))?;
        let response = self
            .gateway
            .request(GatewayRequest::post("/patients/auth/login", body))
            .await?;

        let Some(value) = response else {
            return Err(GatewayError::LoginRejected { message: None });
        };
        let response: LoginResponse = decode(value, "login response")?;
        let message = response.message.clone().filter(|m| !m.trim().is_empty());
        response
            .into_identity()
            .ok_or(GatewayError::LoginRejected { message })
    }

    /// `GET /patients/me/details`.
    pub async fn patient_details(&self) -> Result<PatientDetails, GatewayError> {
        let value = self
            .authed(GatewayRequest::get("/patients/me/details"))
            .await?;
        decode(required(value, "patient details")?, "patient details")
    }

    /// Poll the notification endpoint once.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the backend has nothing pending (204).
    pub async fn payment_notification(&self) -> Result<Option<PaymentNotification>, GatewayError> {
        let request = GatewayRequest::get(self.notifications_path.clone());
        match self.authed(request).await? {
            Some(value) => notification_from_value(value).map(Some),
            None => Ok(None),
        }
    }

    /// `GET /billing/payments/my-attempts?patientId=` for the signed-in
    /// patient.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unauthorized`] without calling the backend if
    /// nobody is signed in.
    pub async fn payment_attempts(&self) -> Result<Vec<PaymentAttempt>, GatewayError> {
        let subject = self.subject_id()?;
        let request = GatewayRequest::get("/billing/payments/my-attempts")
            .with_query([("patientId", subject)]);
        match self.authed(request).await? {
            Some(value) => decode(value, "payment attempts"),
            None => Ok(Vec::new()),
        }
    }

    /// Start a hosted checkout for `visit_id`.
    pub async fn create_checkout_session(
        &self,
        visit_id: i64,
    ) -> Result<CheckoutSession, GatewayError> {
        let subject = self.subject_id()?;
        let request = GatewayRequest::post(
            format!("/billing/payments/visit/{visit_id}/create-checkout-session"),
            json!({ "patientId": subject }),
        );
        let value = self.authed(request).await?;
        decode(required(value, "checkout session")?, "checkout session")
    }

    /// `GET /patients/all` with paging and sorting.
    pub async fn list_patients(&self, query: &PageQuery) -> Result<Page<Patient>, GatewayError> {
        let request = GatewayRequest::get("/patients/all").with_query(query.to_query());
        match self.authed(request).await? {
            Some(value) => Page::from_value(value)
                .map_err(|e| GatewayError::Decode(format!("patient page: {e}"))),
            None => Ok(Page {
                content: Vec::new(),
                total_pages: Some(0),
                total_elements: Some(0),
            }),
        }
    }

    /// `GET /patients/recent`: the most recently registered patients.
    pub async fn recent_patients(&self) -> Result<Vec<Patient>, GatewayError> {
        match self.authed(GatewayRequest::get("/patients/recent")).await? {
            Some(value) => decode(value, "recent patients"),
            None => Ok(Vec::new()),
        }
    }

    /// `POST /patients`.
    pub async fn add_patient(&self, patient: &NewPatient) -> Result<Patient, GatewayError> {
        let request = GatewayRequest::post("/patients", encode(patient)?);
        let value = self.authed(request).await?;
        decode(required(value, "created patient")?, "created patient")
    }

    /// `POST /patients/{id}/visits`.
    ///
    /// The backend's body is not relied on; callers refetch the roster.
    pub async fn add_visit(&self, patient_id: Uuid, visit: &NewVisit) -> Result<(), GatewayError> {
        let request = GatewayRequest::post(format!("/patients/{patient_id}/visits"), encode(visit)?);
        self.authed(request).await?;
        Ok(())
    }

    /// `PUT /patients/{id}/appointment`.
    ///
    /// # Returns
    ///
    /// The backend's (possibly partial) patient object, ready for
    /// [`Roster::apply_patient_update`](crate::roster::Roster::apply_patient_update).
    pub async fn schedule_appointment(
        &self,
        patient_id: Uuid,
        appointment: &AppointmentRequest,
    ) -> Result<Value, GatewayError> {
        let request = GatewayRequest::put(
            format!("/patients/{patient_id}/appointment"),
            encode(appointment)?,
        );
        required(self.authed(request).await?, "scheduled patient")
    }

    /// `POST /patients/{id}/visits/{visitId}/schedule-appointment`.
    ///
    /// # Returns
    ///
    /// The backend's (possibly partial) visit object, ready for
    /// [`Roster::apply_visit_update`](crate::roster::Roster::apply_visit_update).
    pub async fn schedule_visit_appointment(
        &self,
        patient_id: Uuid,
        visit_id: i64,
        appointment: &AppointmentRequest,
    ) -> Result<Value, GatewayError> {
        let request = GatewayRequest::post(
            format!("/patients/{patient_id}/visits/{visit_id}/schedule-appointment"),
            encode(appointment)?,
        );
        required(self.authed(request).await?, "scheduled visit")
    }

    async fn authed(&self, request: GatewayRequest) -> Result<Option<Value>, GatewayError> {
        let request = request.with_token(self.session.token());
        self.gateway.request(request).await
    }

    fn subject_id(&self) -> Result<String, GatewayError> {
        self.session
            .snapshot()
            .identity()
            .map(|i| i.subject_id.clone())
            .ok_or(GatewayError::Unauthorized { message: None })
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, GatewayError> {
    serde_json::to_value(value).map_err(|e| GatewayError::Decode(format!("request body: {e}")))
}

fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T, GatewayError> {
    serde_json::from_value(value).map_err(|e| GatewayError::Decode(format!("{what}: {e}")))
}

fn required(value: Option<Value>, what: &str) -> Result<Value, GatewayError> {
    value.ok_or_else(|| GatewayError::Decode(format!("{what}: empty body")))
}
