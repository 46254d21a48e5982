use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::due_process::UrgencyLevel;
use crate::models::{Case, DeadlineSummary};

/// Inclusive incident-date window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl StatsRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map(|f| date >= f).unwrap_or(true) && self.to.map(|t| date <= t).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CaseStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_conduct_type: BTreeMap<String, usize>,
    pub by_course: BTreeMap<String, usize>,
    /// Keyed by `YYYY-MM` of the incident.
    pub by_month: BTreeMap<String, usize>,
    pub closed: usize,
    pub avg_days_to_close: Option<f64>,
    /// Open cases only.
    pub by_urgency: BTreeMap<String, usize>,
}

fn bump(map: &mut BTreeMap<String, usize>, key: &str) {
    let key = if key.trim().is_empty() { "(sin dato)" } else { key.trim() };
    *map.entry(key.to_string()).or_insert(0) += 1;
}

pub fn compute(cases: &[Case], deadlines: &[DeadlineSummary], range: &StatsRange) -> CaseStats {
    let urgency: HashMap<_, _> = deadlines.iter().map(|d| (d.case_id, d.urgency)).collect();
    let mut stats = CaseStats::default();
    let mut close_days: Vec<i64> = Vec::new();

    for case in cases.iter().filter(|c| range.contains(c.incident_at.date_naive())) {
        stats.total += 1;
        bump(&mut stats.by_status, case.status.as_str());
        bump(&mut stats.by_conduct_type, &case.conduct_type);
        bump(&mut stats.by_course, &case.course);
        bump(&mut stats.by_month, &case.incident_at.format("%Y-%m").to_string());
        match case.closed_at {
            Some(closed_at) => {
                stats.closed += 1;
                close_days.push((closed_at - case.created_at).num_days().max(0));
            }
            None => {
                let level = urgency.get(&case.id).copied().unwrap_or(UrgencyLevel::NoDeadline);
                bump(&mut stats.by_urgency, level.as_str());
            }
        }
    }
    if !close_days.is_empty() {
        stats.avg_days_to_close = Some(close_days.iter().sum::<i64>() as f64 / close_days.len() as f64);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CaseStatus, Closure};
    use chrono::{TimeZone, Utc};

    fn case(id: i64, course: &str, month: u32, closed_after_days: Option<i64>) -> Case {
        let created = Utc.with_ymd_and_hms(2024, month, 1, 9, 0, 0).unwrap();
        Case {
            id,
            incident_at: created,
            course: course.into(),
            conduct_type: "Grave".into(),
            conduct_category: String::new(),
            description: "x".into(),
            status: if closed_after_days.is_some() { CaseStatus::Closed } else { CaseStatus::InFollowUp },
            responsible_name: "Inspectoría".into(),
            responsible_role: None,
            created_at: created,
            closed_at: closed_after_days.map(|d| created + chrono::Duration::days(d)),
            closure: closed_after_days.map(|_| Closure {
                resolution: "ok".into(),
                measure: None,
                closed_by_name: "Dirección".into(),
                closed_by_role: None,
            }),
            followup_started_at: Some(created),
            investigation_due_date: None,
            student: None,
        }
    }

    #[test]
    fn aggregates() {
        let cases = vec![
            case(1, "1A", 3, Some(4)),
            case(2, "1A", 3, Some(10)),
            case(3, "2B", 4, None),
            case(4, "", 5, None),
        ];
        let deadlines = vec![DeadlineSummary { case_id: 3, days_remaining: Some(-2), urgency: UrgencyLevel::Overdue }];
        let s = compute(&cases, &deadlines, &StatsRange::default());
        assert_eq!(s.total, 4);
        assert_eq!(s.closed, 2);
        assert_eq!(s.avg_days_to_close, Some(7.0));
        assert_eq!(s.by_course["1A"], 2);
        assert_eq!(s.by_course["(sin dato)"], 1);
        assert_eq!(s.by_month["2024-03"], 2);
        assert_eq!(s.by_status["closed"], 2);
        assert_eq!(s.by_urgency["overdue"], 1);
        assert_eq!(s.by_urgency["no-deadline"], 1);
    }

    #[test]
    fn range_filters_on_incident_date() {
        let cases = vec![case(1, "1A", 3, None), case(2, "1A", 6, None)];
        let range = StatsRange {
            from: NaiveDate::from_ymd_opt(2024, 5, 1),
            to: None,
        };
        let s = compute(&cases, &[], &range);
        assert_eq!(s.total, 1);
        assert_eq!(s.avg_days_to_close, None);
    }
}
