//! Single boundary between loosely-shaped backend rows and the canonical models.
//!
//! Historical column names are accepted here through serde aliases and nowhere
//! else in the crate.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::due_process::{classify_urgency, UrgencyLevel};
use crate::models::{Case, CaseStatus, Closure, DeadlineSummary, Followup, Id, Student};

impl CaseStatus {
    /// Accepts every spelling the backend has used for a status.
    pub fn normalize(raw: &str) -> Option<CaseStatus> {
        let key: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '_' || c == '-' || c.is_whitespace() { ' ' } else { c })
            .collect();
        match key.split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
            "reported" | "reportado" | "abierto" | "open" | "nuevo" => Some(CaseStatus::Reported),
            "in follow up" | "in followup" | "en seguimiento" | "seguimiento" | "en proceso" => {
                Some(CaseStatus::InFollowUp)
            }
            "closed" | "cerrado" => Some(CaseStatus::Closed),
            _ => None,
        }
    }
}

impl UrgencyLevel {
    pub fn normalize(raw: &str) -> Option<UrgencyLevel> {
        match raw.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
            "vencido" | "overdue" => Some(UrgencyLevel::Overdue),
            "vence-hoy" | "due-today" => Some(UrgencyLevel::DueToday),
            "proximo" | "próximo" | "due-soon" => Some(UrgencyLevel::DueSoon),
            "en-plazo" | "on-time" => Some(UrgencyLevel::OnTime),
            "sin-plazo" | "no-deadline" => Some(UrgencyLevel::NoDeadline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStudent {
    #[serde(alias = "nombre", alias = "full_name")]
    pub name: Option<String>,
    #[serde(alias = "rut", alias = "dni")]
    pub national_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCaseRow {
    pub id: Id,
    #[serde(default, alias = "fecha_incidente", alias = "incident_date")]
    pub incident_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "curso")]
    pub course: Option<String>,
    #[serde(default, alias = "tipo_conducta", alias = "conduct")]
    pub conduct_type: Option<String>,
    #[serde(default, alias = "categoria", alias = "categoria_conducta")]
    pub conduct_category: Option<String>,
    #[serde(default, alias = "descripcion", alias = "short_description")]
    pub description: Option<String>,
    #[serde(default, alias = "estado")]
    pub status: Option<String>,
    #[serde(default, alias = "responsable", alias = "responsable_nombre")]
    pub responsible_name: Option<String>,
    #[serde(default, alias = "responsable_rol")]
    pub responsible_role: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "fecha_cierre")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "resolucion")]
    pub resolution: Option<String>,
    #[serde(default, alias = "medida")]
    pub measure: Option<String>,
    #[serde(default, alias = "cerrado_por")]
    pub closed_by_name: Option<String>,
    #[serde(default, alias = "cerrado_por_rol")]
    pub closed_by_role: Option<String>,
    #[serde(default, alias = "seguimiento_started_at", alias = "due_process_started_at")]
    pub followup_started_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "fecha_limite_investigacion", alias = "due_date")]
    pub investigation_due_date: Option<NaiveDate>,
    #[serde(default, alias = "estudiante", alias = "students")]
    pub student: Option<RawStudent>,
    #[serde(default, alias = "estudiante_nombre")]
    pub student_name: Option<String>,
    #[serde(default, alias = "estudiante_rut")]
    pub student_national_id: Option<String>,
}

fn text(v: Option<String>) -> String {
    v.map(|s| s.trim().to_string()).unwrap_or_default()
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl RawCaseRow {
    /// Produces a canonical case; the closure timestamp decides whether it is closed.
    pub fn into_case(self) -> Case {
        let created_at = self.created_at.unwrap_or_else(Utc::now);
        let declared = self.status.as_deref().and_then(CaseStatus::normalize);
        let status = match (self.closed_at, declared) {
            (Some(_), _) => CaseStatus::Closed,
            (None, Some(CaseStatus::Closed)) | (None, None) => {
                if declared.is_some() {
                    warn!(case_id = self.id, "status says closed but no closure timestamp");
                }
                if self.followup_started_at.is_some() { CaseStatus::InFollowUp } else { CaseStatus::Reported }
            }
            (None, Some(s)) => s,
        };
        let closure = match (self.closed_at, non_empty(self.resolution)) {
            (Some(_), resolution) => Some(Closure {
                resolution: resolution.unwrap_or_default(),
                measure: non_empty(self.measure),
                closed_by_name: text(self.closed_by_name),
                closed_by_role: non_empty(self.closed_by_role),
            }),
            (None, _) => None,
        };
        let student = match self.student {
            Some(RawStudent { name: Some(name), national_id }) if !name.trim().is_empty() => Some(Student {
                name: name.trim().to_string(),
                national_id: non_empty(national_id),
            }),
            _ => non_empty(self.student_name).map(|name| Student {
                name,
                national_id: non_empty(self.student_national_id),
            }),
        };
        Case {
            id: self.id,
            incident_at: self.incident_at.unwrap_or(created_at),
            course: text(self.course),
            conduct_type: text(self.conduct_type),
            conduct_category: text(self.conduct_category),
            description: text(self.description),
            status,
            responsible_name: text(self.responsible_name),
            responsible_role: non_empty(self.responsible_role),
            created_at,
            closed_at: self.closed_at,
            closure,
            followup_started_at: self.followup_started_at,
            investigation_due_date: self.investigation_due_date,
            student,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFollowupRow {
    pub id: Id,
    #[serde(alias = "caso_id", alias = "incident_id")]
    pub case_id: Id,
    #[serde(default, alias = "fecha", alias = "fecha_accion")]
    pub action_date: Option<NaiveDate>,
    #[serde(default, alias = "tipo_accion", alias = "accion")]
    pub action_type: Option<String>,
    #[serde(default, alias = "etapa_debido_proceso", alias = "etapa", alias = "stage")]
    pub process_stage: Option<String>,
    #[serde(default, alias = "detalle", alias = "observaciones")]
    pub detail: Option<String>,
    #[serde(default, alias = "responsable")]
    pub responsible: Option<String>,
    #[serde(default, alias = "fecha_plazo")]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl RawFollowupRow {
    pub fn into_followup(self) -> Followup {
        let created_at = self.created_at.unwrap_or_else(Utc::now);
        Followup {
            id: self.id,
            case_id: self.case_id,
            action_date: self.action_date.unwrap_or_else(|| created_at.date_naive()),
            action_type: text(self.action_type),
            process_stage: text(self.process_stage),
            detail: text(self.detail),
            responsible: text(self.responsible),
            due_date: self.due_date,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDeadlineRow {
    #[serde(alias = "caso_id", alias = "incident_id")]
    pub case_id: Id,
    #[serde(default, alias = "dias_restantes")]
    pub days_remaining: Option<i64>,
    #[serde(default, alias = "alerta_urgencia", alias = "urgencia")]
    pub urgency: Option<String>,
}

impl RawDeadlineRow {
    /// Keeps the backend's label when it is recognizable, otherwise classifies the day count.
    pub fn into_summary(self) -> DeadlineSummary {
        let urgency = self
            .urgency
            .as_deref()
            .and_then(UrgencyLevel::normalize)
            .unwrap_or_else(|| classify_urgency(self.days_remaining).level());
        DeadlineSummary { case_id: self.case_id, days_remaining: self.days_remaining, urgency }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_spellings() {
        assert_eq!(CaseStatus::normalize("Reportado"), Some(CaseStatus::Reported));
        assert_eq!(CaseStatus::normalize("En Seguimiento"), Some(CaseStatus::InFollowUp));
        assert_eq!(CaseStatus::normalize("en_seguimiento"), Some(CaseStatus::InFollowUp));
        assert_eq!(CaseStatus::normalize("in-follow-up"), Some(CaseStatus::InFollowUp));
        assert_eq!(CaseStatus::normalize(" CERRADO "), Some(CaseStatus::Closed));
        assert_eq!(CaseStatus::normalize("archived"), None);
    }

    #[test]
    fn urgency_labels() {
        assert_eq!(UrgencyLevel::normalize("VENCIDO"), Some(UrgencyLevel::Overdue));
        assert_eq!(UrgencyLevel::normalize("VENCE_HOY"), Some(UrgencyLevel::DueToday));
        assert_eq!(UrgencyLevel::normalize("PROXIMO"), Some(UrgencyLevel::DueSoon));
        assert_eq!(UrgencyLevel::normalize("EN_PLAZO"), Some(UrgencyLevel::OnTime));
        assert_eq!(UrgencyLevel::normalize("SIN_PLAZO"), Some(UrgencyLevel::NoDeadline));
        assert_eq!(UrgencyLevel::normalize("due-soon"), Some(UrgencyLevel::DueSoon));
    }

    #[test]
    fn legacy_case_row() {
        let raw: RawCaseRow = serde_json::from_value(json!({
            "id": 7,
            "fecha_incidente": "2024-03-04T10:00:00Z",
            "curso": "2° Medio A",
            "tipo_conducta": "Grave",
            "descripcion": "Agresión verbal",
            "estado": "Cerrado",
            "fecha_cierre": "2024-03-20T10:00:00Z",
            "resolucion": "Medida formativa",
            "estudiante": { "nombre": "Ana Pérez", "rut": "11.111.111-1" }
        }))
        .unwrap();
        let c = raw.into_case();
        assert_eq!(c.course, "2° Medio A");
        assert_eq!(c.status, CaseStatus::Closed);
        assert_eq!(c.closure.unwrap().resolution, "Medida formativa");
        assert_eq!(c.student.unwrap().national_id.as_deref(), Some("11.111.111-1"));
    }

    #[test]
    fn closed_status_without_timestamp_is_not_closed() {
        let raw: RawCaseRow = serde_json::from_value(json!({
            "id": 1, "estado": "cerrado", "seguimiento_started_at": "2024-03-04T10:00:00Z"
        }))
        .unwrap();
        let c = raw.into_case();
        assert_eq!(c.status, CaseStatus::InFollowUp);
        assert!(c.closed_at.is_none());
    }

    #[test]
    fn closure_timestamp_wins_over_status() {
        let raw: RawCaseRow = serde_json::from_value(json!({
            "id": 1, "status": "reported", "closed_at": "2024-03-04T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(raw.into_case().status, CaseStatus::Closed);
    }

    #[test]
    fn legacy_followup_row() {
        let raw: RawFollowupRow = serde_json::from_value(json!({
            "id": 3, "caso_id": 7, "fecha": "2024-03-05",
            "tipo_accion": "Entrevista", "etapa": " 4.  Entrevistas ",
            "observaciones": "sin novedad", "responsable": "Convivencia"
        }))
        .unwrap();
        let f = raw.into_followup();
        assert_eq!(f.case_id, 7);
        assert_eq!(f.process_stage, "4.  Entrevistas");
        assert_eq!(f.detail, "sin novedad");
    }

    #[test]
    fn deadline_row_falls_back_to_day_count() {
        let raw: RawDeadlineRow = serde_json::from_value(json!({"caso_id": 1, "dias_restantes": 2})).unwrap();
        assert_eq!(raw.into_summary().urgency, UrgencyLevel::DueSoon);
        let raw: RawDeadlineRow =
            serde_json::from_value(json!({"case_id": 1, "days_remaining": -1, "alerta_urgencia": "VENCIDO"})).unwrap();
        assert_eq!(raw.into_summary().urgency, UrgencyLevel::Overdue);
    }
}
