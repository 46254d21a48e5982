//! Due-process progress derived from a case's followups.
//!
//! Everything here is a pure function of its inputs. Stage labels come from
//! configuration as free text, so every comparison goes through
//! [`normalize_stage_label`].

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::{Case, DeadlineSummary, Followup, Id, StageSla};

/// Group holding followups whose stage matches no configured stage.
pub const NO_STAGE: &str = "Sin etapa";

/// Used whenever the configured stage list is empty or unavailable.
pub const DEFAULT_STAGES: [&str; 8] = [
    "1. Comunicación al Estudiante",
    "2. Notificación Apoderados",
    "3. Recopilación Antecedentes",
    "4. Entrevistas",
    "5. Investigación/Análisis",
    "6. Resolución y Sanciones",
    "7. Apelación/Recursos",
    "8. Seguimiento",
];

/// Used whenever the remote action-type catalog is empty or unavailable.
pub const DEFAULT_ACTION_TYPES: &[&str] = &[
    "Entrevista estudiante",
    "Entrevista apoderado",
    "Citación apoderado",
    "Recepción de descargos",
    "Declaración de testigo",
    "Revisión de antecedentes",
    "Derivación a apoyo psicosocial",
    "Notificación de resolución",
    "Medida formativa",
    "Otro",
];

/// Trims and collapses runs of whitespace to a single space.
pub fn normalize_stage_label(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized, de-duplicated stage list, or the defaults when nothing usable is configured.
pub fn stages_or_default<S: AsRef<str>>(configured: &[S]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let stages: Vec<String> = configured
        .iter()
        .map(|s| normalize_stage_label(s.as_ref()))
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect();
    if stages.is_empty() {
        DEFAULT_STAGES.iter().map(|s| s.to_string()).collect()
    } else {
        stages
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StageGroup {
    pub stage: String,
    pub followups: Vec<Followup>,
}

/// Followups bucketed by stage, in canonical stage order.
///
/// Every configured stage has a group, possibly empty. Followups with an
/// unknown stage end up in a trailing [`NO_STAGE`] group that only exists
/// when it is non-empty.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageGroups {
    pub groups: Vec<StageGroup>,
}

impl StageGroups {
    pub fn get(&self, stage: &str) -> Option<&[Followup]> {
        let key = normalize_stage_label(stage);
        self.groups
            .iter()
            .find(|g| g.stage == key)
            .map(|g| g.followups.as_slice())
    }

    pub fn unstaged(&self) -> &[Followup] {
        self.get(NO_STAGE).unwrap_or(&[])
    }

    pub fn total(&self) -> usize {
        self.groups.iter().map(|g| g.followups.len()).sum()
    }
}

pub fn group_by_stage<S: AsRef<str>>(stages: &[S], followups: &[Followup]) -> StageGroups {
    let mut groups: Vec<StageGroup> = Vec::with_capacity(stages.len() + 1);
    for stage in stages {
        let stage = normalize_stage_label(stage.as_ref());
        if !groups.iter().any(|g| g.stage == stage) {
            groups.push(StageGroup { stage, followups: Vec::new() });
        }
    }
    let mut unstaged = Vec::new();
    for f in followups {
        let label = normalize_stage_label(&f.process_stage);
        match groups.iter_mut().find(|g| g.stage == label) {
            Some(g) => g.followups.push(f.clone()),
            None => unstaged.push(f.clone()),
        }
    }
    if !unstaged.is_empty() {
        groups.push(StageGroup { stage: NO_STAGE.to_string(), followups: unstaged });
    }
    // stable: ties keep insertion order
    for g in &mut groups {
        g.followups.sort_by_key(|f| f.action_date);
    }
    StageGroups { groups }
}

/// A stage is complete as soon as it has at least one recorded action.
pub fn completed_stages(followups: &[Followup]) -> BTreeSet<String> {
    followups
        .iter()
        .map(|f| normalize_stage_label(&f.process_stage))
        .filter(|s| !s.is_empty())
        .collect()
}

/// First stage not yet completed, or the last stage once all are done.
pub fn current_stage<S: AsRef<str>>(stages: &[S], completed: &BTreeSet<String>) -> Option<String> {
    let normalized: Vec<String> = stages.iter().map(|s| normalize_stage_label(s.as_ref())).collect();
    normalized
        .iter()
        .find(|s| !completed.contains(*s))
        .or_else(|| normalized.last())
        .cloned()
}

pub fn stage_sla_map(rows: &[StageSla]) -> HashMap<String, Option<i32>> {
    rows.iter()
        .map(|r| (normalize_stage_label(&r.stage), r.days))
        .collect()
}

/// Day budget for `stage`; `None` when not configured.
pub fn sla_for(map: &HashMap<String, Option<i32>>, stage: &str) -> Option<i32> {
    map.get(&normalize_stage_label(stage)).copied().flatten()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum UrgencyLevel {
    NoDeadline,
    Overdue,
    DueToday,
    DueSoon,
    OnTime,
}

impl UrgencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrgencyLevel::NoDeadline => "no-deadline",
            UrgencyLevel::Overdue => "overdue",
            UrgencyLevel::DueToday => "due-today",
            UrgencyLevel::DueSoon => "due-soon",
            UrgencyLevel::OnTime => "on-time",
        }
    }

    /// Sort key, most urgent first.
    pub fn rank(&self) -> u8 {
        match self {
            UrgencyLevel::Overdue => 0,
            UrgencyLevel::DueToday => 1,
            UrgencyLevel::DueSoon => 2,
            UrgencyLevel::OnTime => 3,
            UrgencyLevel::NoDeadline => 4,
        }
    }

    pub fn is_alert(&self) -> bool {
        matches!(self, UrgencyLevel::Overdue | UrgencyLevel::DueToday | UrgencyLevel::DueSoon)
    }

    /// Label used when no day count is known.
    pub fn label(&self) -> &'static str {
        match self {
            UrgencyLevel::NoDeadline => "no deadline",
            UrgencyLevel::Overdue => "overdue",
            UrgencyLevel::DueToday => "due today",
            UrgencyLevel::DueSoon => "due soon",
            UrgencyLevel::OnTime => "on time",
        }
    }
}

/// Deadline urgency with the day count that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    NoDeadline,
    Overdue { days: u64 },
    DueToday,
    DueSoon { days: u64 },
    OnTime { days: u64 },
}

/// Thresholds: `<0` overdue, `0` due today, `1..=3` due soon, `>=4` on time.
pub fn classify_urgency(days_remaining: Option<i64>) -> Urgency {
    match days_remaining {
        None => Urgency::NoDeadline,
        Some(d) if d < 0 => Urgency::Overdue { days: d.unsigned_abs() },
        Some(0) => Urgency::DueToday,
        Some(d) if d <= 3 => Urgency::DueSoon { days: d as u64 },
        Some(d) => Urgency::OnTime { days: d as u64 },
    }
}

fn days(n: u64) -> String {
    if n == 1 { "1 day".to_string() } else { format!("{n} days") }
}

impl Urgency {
    pub fn level(&self) -> UrgencyLevel {
        match self {
            Urgency::NoDeadline => UrgencyLevel::NoDeadline,
            Urgency::Overdue { .. } => UrgencyLevel::Overdue,
            Urgency::DueToday => UrgencyLevel::DueToday,
            Urgency::DueSoon { .. } => UrgencyLevel::DueSoon,
            Urgency::OnTime { .. } => UrgencyLevel::OnTime,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Urgency::NoDeadline => "no deadline".to_string(),
            Urgency::Overdue { days: n } => format!("overdue by {}", days(*n)),
            Urgency::DueToday => "due today".to_string(),
            Urgency::DueSoon { days: n } => format!("due in {}", days(*n)),
            Urgency::OnTime { days: n } => format!("on time ({} left)", days(*n)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeadlineView {
    pub days_remaining: Option<i64>,
    pub urgency: UrgencyLevel,
    pub label: String,
}

impl DeadlineView {
    pub fn from_days(days_remaining: Option<i64>) -> Self {
        let u = classify_urgency(days_remaining);
        Self { days_remaining, urgency: u.level(), label: u.label() }
    }

    /// Keeps the summary's urgency; the day count only refines the label when it agrees.
    pub fn from_summary(d: &DeadlineSummary) -> Self {
        let counted = classify_urgency(d.days_remaining);
        let label = if d.days_remaining.is_some() && counted.level() == d.urgency {
            counted.label()
        } else {
            d.urgency.label().to_string()
        };
        Self { days_remaining: d.days_remaining, urgency: d.urgency, label }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StageView {
    /// 1-based position in the configured order.
    pub position: usize,
    pub stage: String,
    pub sla_days: Option<i32>,
    pub completed: bool,
    pub current: bool,
    pub followups: Vec<Followup>,
}

/// Everything needed to render the due-process stepper for one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DueProcessView {
    pub case_id: Id,
    pub tracked: bool,
    pub stages: Vec<StageView>,
    pub unstaged: Vec<Followup>,
    pub completed_stages: Vec<String>,
    pub current_stage: Option<String>,
    pub deadline: DeadlineView,
}

pub fn build_view<S: AsRef<str>>(
    case: &Case,
    stages: &[S],
    sla_rows: &[StageSla],
    followups: &[Followup],
    days_remaining: Option<i64>,
) -> DueProcessView {
    let stages = stages_or_default(stages);
    let groups = group_by_stage(&stages, followups);
    let completed = completed_stages(followups);
    let current = current_stage(&stages, &completed);
    let sla = stage_sla_map(sla_rows);

    let views = stages
        .iter()
        .enumerate()
        .map(|(i, stage)| StageView {
            position: i + 1,
            stage: stage.clone(),
            sla_days: sla_for(&sla, stage),
            completed: completed.contains(stage),
            current: current.as_deref() == Some(stage.as_str()),
            followups: groups.get(stage).map(|f| f.to_vec()).unwrap_or_default(),
        })
        .collect();

    DueProcessView {
        case_id: case.id,
        tracked: case.is_tracked(),
        stages: views,
        unstaged: groups.unstaged().to_vec(),
        completed_stages: completed.into_iter().collect(),
        current_stage: current,
        deadline: DeadlineView::from_days(days_remaining),
    }
}
