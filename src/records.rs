//! Wire records exchanged with the backend gateway.
//!
//! Field names follow the backend's camelCase JSON. Optional fields are
//! `Option` because the backend omits or nulls them freely; unknown fields
//! are kept in `extra` on the records the portal patches locally, so a
//! shallow merge never loses data the client does not model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::session::Identity;

/// Consultation status used by the backend for a patient or visit.
pub const STATUS_PAID: &str = "PAID";

/// Login form payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Account email.
    pub email: String,
    /// Account password.
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Body of `POST /patients/auth/login`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    /// Bearer token, present on success.
    #[serde(default)]
    pub token: Option<String>,
    /// Patient id, present on success.
    #[serde(default)]
    pub patient_id: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Email address.
    #[serde(default)]
    pub email: Option<String>,
    /// Human-readable outcome.
    #[serde(default)]
    pub message: Option<String>,
    /// Backend's own success flag.
    #[serde(default)]
    pub success: Option<bool>,
}

impl LoginResponse {
    /// Convert a successful response into a session [`Identity`].
    ///
    /// # Returns
    ///
    /// `None` if the response lacks a patient id or token.
    pub fn into_identity(self) -> Option<Identity> {
        let subject_id = self.patient_id.filter(|id| !id.trim().is_empty())?;
        let token = self.token.filter(|t| !t.trim().is_empty())?;
        Some(Identity {
            display_name: self.name.unwrap_or_default(),
            subject_id,
            email_address: self.email,
            auth_token: Some(token),
        })
    }
}

/// A visit belonging to a patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientVisit {
    /// Visit id.
    pub id: i64,
    /// Reason for the visit.
    #[serde(default)]
    pub problem: Option<String>,
    /// Payment status of the visit fee.
    #[serde(default)]
    pub visit_payment_status: Option<String>,
    /// Scheduled doctor.
    #[serde(default)]
    pub appointment_doctor_name: Option<String>,
    /// Scheduled time, ISO-8601.
    #[serde(default)]
    pub appointment_date_time: Option<String>,
    /// Fields the portal does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PatientVisit {
    /// Returns `true` if the visit fee is paid.
    pub fn is_paid(&self) -> bool {
        self.visit_payment_status.as_deref() == Some(STATUS_PAID)
    }

    /// Returns `true` if an appointment time is set.
    pub fn is_scheduled(&self) -> bool {
        is_set(&self.appointment_date_time)
    }
}

/// A patient as listed by the receptionist portal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    /// Patient id.
    pub id: Uuid,
    /// Full name.
    pub name: String,
    /// Contact email.
    #[serde(default)]
    pub email: Option<String>,
    /// Registration date, ISO-8601.
    #[serde(default)]
    pub registered_date: Option<String>,
    /// Initial consultation status (`NOT_PAID`, `PAYMENT_PENDING`, `PAID`, `PAYMENT_FAILED`).
    #[serde(default)]
    pub consultation_payment_status: Option<String>,
    /// Main appointment doctor.
    #[serde(default)]
    pub appointment_doctor_name: Option<String>,
    /// Main appointment time, ISO-8601.
    #[serde(default)]
    pub appointment_date_time: Option<String>,
    /// Visits after the initial consultation.
    #[serde(default)]
    pub visits: Vec<PatientVisit>,
    /// Fields the portal does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Patient {
    /// Returns `true` if the initial consultation is paid.
    pub fn is_paid(&self) -> bool {
        self.consultation_payment_status.as_deref() == Some(STATUS_PAID)
    }

    /// Returns `true` if the main appointment has a time.
    pub fn is_scheduled(&self) -> bool {
        is_set(&self.appointment_date_time)
    }
}

/// Body of `GET /patients/me/details`.
///
/// Same shape as [`Patient`]; aliased for readability at call sites.
pub type PatientDetails = Patient;

/// One billing attempt (`GET /billing/payments/my-attempts`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAttempt {
    /// Attempt id.
    pub id: i64,
    /// Payment status (`PENDING`, `AWAITING_PAYMENT`, `COMPLETED`, `FAILED`, `EXPIRED`).
    pub status: String,
    /// Payment type (`CONSULTATION_FEE`, `VISIT_FEE`).
    #[serde(default)]
    pub payment_type: Option<String>,
    /// Visit the attempt pays for, if any.
    #[serde(default)]
    pub visit_id: Option<i64>,
    /// Amount as sent by the backend.
    #[serde(default)]
    pub amount: Option<Value>,
    /// ISO currency code.
    #[serde(default)]
    pub currency: Option<String>,
    /// Creation time.
    #[serde(default)]
    pub created_timestamp: Option<String>,
}

/// Body of `POST /billing/payments/visit/{visitId}/create-checkout-session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    /// Hosted checkout URL to send the user to.
    #[serde(default, alias = "checkoutUrl")]
    pub url: Option<String>,
    /// Payment provider session id.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Body of `POST /patients`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPatient {
    /// Full name.
    pub name: String,
    /// Contact email.
    pub email: String,
    /// Postal address.
    #[serde(default)]
    pub address: Option<String>,
    /// Date of birth, `YYYY-MM-DD`.
    pub date_of_birth: String,
    /// Presenting problem.
    pub problem: String,
    /// Clinic location.
    #[serde(default)]
    pub location: Option<String>,
    /// Consultation fee, sent as the string the receptionist typed.
    pub consultation_fee: String,
    /// Registration date, `YYYY-MM-DD`.
    #[serde(default)]
    pub registered_date: Option<String>,
}

/// Body of `POST /patients/{id}/visits`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVisit {
    /// Visit date, `YYYY-MM-DD`.
    pub visit_date: String,
    /// Reason for the visit.
    pub problem_description: String,
    /// Fee for the visit, as typed.
    pub consultation_fee: String,
    /// Free-form notes.
    #[serde(default)]
    pub notes: String,
}

/// Body of the two appointment scheduling calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentRequest {
    /// Doctor to see.
    pub doctor_name: String,
    /// Local date-time without offset, e.g. `2024-03-15T10:30:00`.
    pub appointment_date_time: String,
}

/// Sort direction for paged listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    /// Ascending.
    Asc,
    /// Descending.
    #[default]
    Desc,
}

impl SortDir {
    /// Query-string spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// Paging and sorting for `GET /patients/all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    /// Zero-based page index.
    pub page: u32,
    /// Page size.
    pub size: u32,
    /// Backend field to sort by.
    pub sort_by: String,
    /// Sort direction.
    pub sort_dir: SortDir,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: 0,
            size: 20,
            sort_by: "registeredDate".to_owned(),
            sort_dir: SortDir::Desc,
        }
    }
}

impl PageQuery {
    /// Query-string pairs in the backend's spelling.
    pub fn to_query(&self) -> Vec<(String, String)> {
        vec![
            ("page".to_owned(), self.page.to_string()),
            ("size".to_owned(), self.size.to_string()),
            ("sortBy".to_owned(), self.sort_by.clone()),
            ("sortDir".to_owned(), self.sort_dir.as_str().to_owned()),
        ]
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    /// Items on this page.
    pub content: Vec<T>,
    /// Total number of pages, when the backend paginated.
    #[serde(default)]
    pub total_pages: Option<u32>,
    /// Total number of items, when the backend paginated.
    #[serde(default)]
    pub total_elements: Option<u64>,
}

impl<T: serde::de::DeserializeOwned> Page<T> {
    /// Decode either a paged body (`{ content, totalPages, ... }`) or a bare
    /// array, which older backends return.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the value is neither shape.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        if value.is_array() {
            return Ok(Self {
                content: serde_json::from_value(value)?,
                total_pages: None,
                total_elements: None,
            });
        }
        serde_json::from_value(value)
    }
}

fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn login_response_into_identity() {
        let resp: LoginResponse = serde_json::from_value(json!({
            "token": "jwt",
            "patientId": "6f1c",
            "name": "Jane Doe",
            "email": "jane@example.com",
            "success": true
        }))
        .expect("decode");
        let identity = resp.into_identity().expect("complete response");
        assert_eq!(identity.subject_id, "6f1c");
        assert_eq!(identity.display_name, "Jane Doe");
        assert_eq!(identity.token(), Some("jwt"));
    }

    #[test]
    fn login_response_without_patient_id_is_rejected() {
        let resp: LoginResponse = serde_json::from_value(json!({
            "message": "Login failed",
            "success": false
        }))
        .expect("decode");
        assert!(resp.into_identity().is_none());
    }

    #[test]
    fn patient_keeps_unmodelled_fields() {
        let id = Uuid::new_v4();
        let value = json!({
            "id": id,
            "name": "Jane",
            "problem": "Back pain",
            "consultationPaymentStatus": "PAID",
            "appointmentDateTime": "2025-01-10T10:00:00"
        });
        let patient: Patient = serde_json::from_value(value).expect("decode");
        assert!(patient.is_paid());
        assert!(patient.is_scheduled());
        assert!(patient.visits.is_empty());
        assert_eq!(patient.extra.get("problem"), Some(&json!("Back pain")));

        let back = serde_json::to_value(&patient).expect("encode");
        assert_eq!(back["problem"], "Back pain");
    }

    #[test]
    fn blank_appointment_is_not_scheduled() {
        let patient: Patient = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "name": "Jane",
            "appointmentDateTime": "  "
        }))
        .expect("decode");
        assert!(!patient.is_scheduled());
    }

    #[test]
    fn page_decodes_paged_and_bare_bodies() {
        let paged: Page<i32> =
            Page::from_value(json!({"content": [1, 2], "totalPages": 3, "totalElements": 41}))
                .expect("paged");
        assert_eq!(paged.content, vec![1, 2]);
        assert_eq!(paged.total_elements, Some(41));

        let bare: Page<i32> = Page::from_value(json!([4, 5, 6])).expect("bare");
        assert_eq!(bare.content, vec![4, 5, 6]);
        assert_eq!(bare.total_pages, None);
    }

    #[test]
    fn new_visit_uses_backend_field_names() {
        let visit = NewVisit {
            visit_date: "2025-02-01".into(),
            problem_description: "Follow-up".into(),
            consultation_fee: "40.00".into(),
            notes: String::new(),
        };
        let value = serde_json::to_value(&visit).expect("encode");
        assert_eq!(value["visitDate"], "2025-02-01");
        assert_eq!(value["problemDescription"], "Follow-up");
        assert_eq!(value["consultationFee"], "40.00");
    }

    #[test]
    fn page_query_defaults_match_portal() {
        let q = PageQuery::default().to_query();
        assert_eq!(
            q,
            vec![
                ("page".to_owned(), "0".to_owned()),
                ("size".to_owned(), "20".to_owned()),
                ("sortBy".to_owned(), "registeredDate".to_owned()),
                ("sortDir".to_owned(), "desc".to_owned()),
            ]
        );
    }
}
