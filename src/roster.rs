//! Receptionist roster: client-side filtering, statistics, sorting and
//! optimistic patching of a fetched page of patients.

use std::cmp::Ordering;

use serde_json::Value;
use uuid::Uuid;

use crate::records::{AppointmentRequest, Page, Patient, PatientVisit, SortDir};

/// Consultation statuses counted as "pending" in the statistics.
const PENDING_STATUSES: [&str; 3] = ["NOT_PAID", "PAYMENT_FAILED", "PAYMENT_PENDING"];

/// Client-side roster filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RosterFilter {
    /// Everyone on the page.
    #[default]
    All,
    /// Consultation paid, but the main appointment or a paid visit still
    /// needs scheduling.
    PaidNeedsAppointment,
    /// Consultation paid and main appointment scheduled.
    PaidScheduled,
    /// Consultation unpaid, no visits yet, or any visit unpaid.
    PaymentNotCompleted,
}

impl RosterFilter {
    /// Every filter, in display order.
    pub const ALL: [RosterFilter; 4] = [
        Self::All,
        Self::PaidNeedsAppointment,
        Self::PaidScheduled,
        Self::PaymentNotCompleted,
    ];

    /// Button label.
    pub fn label(self) -> &'static str {
        match self {
            Self::All => "All Patients",
            Self::PaidNeedsAppointment => "Paid & Needs Appointment",
            Self::PaidScheduled => "Paid & Appointment Scheduled",
            Self::PaymentNotCompleted => "Payment Not Completed",
        }
    }

    /// Returns `true` if `patient` passes the filter.
    pub fn matches(self, patient: &Patient) -> bool {
        let paid = patient.is_paid();
        let scheduled = patient.is_scheduled();
        match self {
            Self::All => true,
            Self::PaidNeedsAppointment => {
                let unscheduled_paid_visit = patient
                    .visits
                    .iter()
                    .any(|v| v.is_paid() && !v.is_scheduled());
                paid && (!scheduled || unscheduled_paid_visit)
            }
            Self::PaidScheduled => paid && scheduled,
            Self::PaymentNotCompleted => {
                let unpaid_visits =
                    patient.visits.is_empty() || patient.visits.iter().any(|v| !v.is_paid());
                !paid || unpaid_visits
            }
        }
    }
}

/// Header statistics for the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RosterStats {
    /// Server total when known and non-zero, otherwise the page length.
    pub total: u64,
    /// Consultation paid.
    pub paid: usize,
    /// Main appointment scheduled.
    pub scheduled: usize,
    /// Consultation not paid, failed, or pending.
    pub pending: usize,
}

/// Field a roster can be sorted by, both server- and client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    /// Registration date.
    #[default]
    RegisteredDate,
    /// Name, case-insensitive.
    Name,
    /// Email, case-insensitive.
    Email,
    /// Consultation payment status.
    PaymentStatus,
}

impl SortKey {
    /// Backend field name, for [`PageQuery::sort_by`](crate::records::PageQuery::sort_by).
    pub fn as_field(self) -> &'static str {
        match self {
            Self::RegisteredDate => "registeredDate",
            Self::Name => "name",
            Self::Email => "email",
            Self::PaymentStatus => "consultationPaymentStatus",
        }
    }

    fn compare(self, a: &Patient, b: &Patient) -> Ordering {
        fn lower(s: &Option<String>) -> Option<String> {
            s.as_deref().map(str::to_lowercase)
        }
        match self {
            Self::RegisteredDate => a.registered_date.cmp(&b.registered_date),
            Self::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            Self::Email => lower(&a.email).cmp(&lower(&b.email)),
            Self::PaymentStatus => a
                .consultation_payment_status
                .cmp(&b.consultation_payment_status),
        }
    }
}

/// Why an appointment cannot be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleBlocked {
    /// The initial consultation is unpaid.
    #[error("Main appointment can only be scheduled if initial consultation is PAID.")]
    ConsultationUnpaid,
    /// The visit is unpaid.
    #[error("Appointment can only be scheduled for PAID visits.")]
    VisitUnpaid,
    /// The visit is not on this patient.
    #[error("Visit {0} does not belong to this patient.")]
    UnknownVisit(i64),
    /// No doctor given.
    #[error("Doctor name is required.")]
    MissingDoctor,
    /// No date-time given.
    #[error("A valid appointment date and time are required.")]
    MissingDateTime,
}

/// A fetched page of patients plus the totals the server reported.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Roster {
    patients: Vec<Patient>,
    total_elements: Option<u64>,
    total_pages: Option<u32>,
}

impl From<Page<Patient>> for Roster {
    fn from(page: Page<Patient>) -> Self {
        Self {
            patients: page.content,
            total_elements: page.total_elements,
            total_pages: page.total_pages,
        }
    }
}

impl Roster {
    /// Build a roster from a bare list (no server totals).
    pub fn from_patients(patients: Vec<Patient>) -> Self {
        Self {
            patients,
            total_elements: None,
            total_pages: None,
        }
    }

    /// Patients on the page, in current order.
    pub fn patients(&self) -> &[Patient] {
        &self.patients
    }

    /// Server-reported page count.
    pub fn total_pages(&self) -> Option<u32> {
        self.total_pages
    }

    /// Look up a patient by id.
    pub fn get(&self, id: Uuid) -> Option<&Patient> {
        self.patients.iter().find(|p| p.id == id)
    }

    /// Patients passing `filter`, in current order.
    pub fn filtered(&self, filter: RosterFilter) -> Vec<&Patient> {
        self.patients.iter().filter(|p| filter.matches(p)).collect()
    }

    /// Header statistics.
    pub fn stats(&self) -> RosterStats {
        let total = self
            .total_elements
            .filter(|t| *t > 0)
            .unwrap_or(self.patients.len() as u64);
        RosterStats {
            total,
            paid: self.patients.iter().filter(|p| p.is_paid()).count(),
            scheduled: self.patients.iter().filter(|p| p.is_scheduled()).count(),
            pending: self
                .patients
                .iter()
                .filter(|p| {
                    p.consultation_payment_status
                        .as_deref()
                        .is_some_and(|s| PENDING_STATUSES.contains(&s))
                })
                .count(),
        }
    }

    /// Sort the page in place. Stable, so equal keys keep server order.
    pub fn sort(&mut self, key: SortKey, dir: SortDir) {
        self.patients.sort_by(|a, b| {
            let ord = key.compare(a, b);
            match dir {
                SortDir::Asc => ord,
                SortDir::Desc => ord.reverse(),
            }
        });
    }

    /// Shallow-merge a server-returned patient object into the patient
    /// with `id`.
    ///
    /// # Returns
    ///
    /// `true` if the patient was found and the merged object still decodes.
    /// Otherwise the roster is left untouched.
    pub fn apply_patient_update(&mut self, id: Uuid, update: &Value) -> bool {
        match self.patients.iter_mut().find(|p| p.id == id) {
            Some(patient) => merge_into(patient, update),
            None => false,
        }
    }

    /// Shallow-merge a server-returned visit object into visit `visit_id`
    /// of patient `patient_id`.
    pub fn apply_visit_update(&mut self, patient_id: Uuid, visit_id: i64, update: &Value) -> bool {
        let visit = self
            .patients
            .iter_mut()
            .find(|p| p.id == patient_id)
            .and_then(|p| p.visits.iter_mut().find(|v| v.id == visit_id));
        match visit {
            Some(visit) => merge_into(visit, update),
            None => false,
        }
    }

    /// Check that the main appointment of `patient_id` may be scheduled.
    ///
    /// # Errors
    ///
    /// See [`ScheduleBlocked`].
    pub fn check_main_appointment(
        &self,
        patient_id: Uuid,
        request: &AppointmentRequest,
    ) -> Result<(), ScheduleBlocked> {
        check_request(request)?;
        match self.get(patient_id) {
            Some(p) if p.is_paid() => Ok(()),
            _ => Err(ScheduleBlocked::ConsultationUnpaid),
        }
    }

    /// Check that visit `visit_id` of `patient_id` may be scheduled.
    ///
    /// # Errors
    ///
    /// See [`ScheduleBlocked`].
    pub fn check_visit_appointment(
        &self,
        patient_id: Uuid,
        visit_id: i64,
        request: &AppointmentRequest,
    ) -> Result<(), ScheduleBlocked> {
        check_request(request)?;
        let visit: Option<&PatientVisit> = self
            .get(patient_id)
            .and_then(|p| p.visits.iter().find(|v| v.id == visit_id));
        match visit {
            Some(v) if v.is_paid() => Ok(()),
            Some(_) => Err(ScheduleBlocked::VisitUnpaid),
            None => Err(ScheduleBlocked::UnknownVisit(visit_id)),
        }
    }
}

fn check_request(request: &AppointmentRequest) -> Result<(), ScheduleBlocked> {
    if request.doctor_name.trim().is_empty() {
        return Err(ScheduleBlocked::MissingDoctor);
    }
    if request.appointment_date_time.trim().is_empty() {
        return Err(ScheduleBlocked::MissingDateTime);
    }
    Ok(())
}

/// Overlay the top-level keys of `update` onto `target`.
fn merge_into<T>(target: &mut T, update: &Value) -> bool
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let Some(fields) = update.as_object() else {
        tracing::warn!("ignoring non-object update");
        return false;
    };
    let mut current = match serde_json::to_value(&*target) {
        Ok(Value::Object(map)) => map,
        _ => return false,
    };
    for (key, value) in fields {
        current.insert(key.clone(), value.clone());
    }
    match serde_json::from_value(Value::Object(current)) {
        Ok(merged) => {
            *target = merged;
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "merged record no longer decodes; keeping local copy");
            false
        }
    }
}
