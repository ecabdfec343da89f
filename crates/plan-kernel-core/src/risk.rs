use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::plan::{Plan, StepStatus};
use crate::{KernelError, PlanId, ProgramId};

const CONFLICT_KEYWORDS: [&str; 3] = ["conflict", "incompatible", "clash"];
const BEHAVIOR_CHANGE_KEYWORDS: [&str; 5] = [
    "breaking",
    "behavior change",
    "behaviour change",
    "regression",
    "api change",
];
const DEPENDENCY_KEYWORDS: [&str; 5] = [
    "depends on",
    "waiting on",
    "blocked by",
    "dependency",
    "upstream",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RiskType {
    Conflict,
    BehaviorChange,
    Dependency,
    Other,
}

impl RiskType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::BehaviorChange => "behavior_change",
            Self::Dependency => "dependency",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "conflict" => Some(Self::Conflict),
            "behavior_change" => Some(Self::BehaviorChange),
            "dependency" => Some(Self::Dependency),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    #[must_use]
    pub fn default_severity(self) -> RiskSeverity {
        match self {
            Self::Conflict => RiskSeverity::High,
            Self::BehaviorChange | Self::Dependency => RiskSeverity::Medium,
            Self::Other => RiskSeverity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DetectedBy {
    Auto,
    Manual,
}

impl DetectedBy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgramRisk {
    pub id: i64,
    pub program_id: ProgramId,
    pub title: String,
    pub risk_type: RiskType,
    pub severity: RiskSeverity,
    pub description: String,
    pub source_plan_id: Option<PlanId>,
    pub affected_plans: Vec<PlanId>,
    pub detected_by: DetectedBy,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewRisk {
    pub title: String,
    pub risk_type: RiskType,
    #[serde(default)]
    pub severity: Option<RiskSeverity>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_plan_id: Option<PlanId>,
    #[serde(default)]
    pub affected_plans: Vec<PlanId>,
    #[serde(default = "manual")]
    pub detected_by: DetectedBy,
}

fn manual() -> DetectedBy {
    DetectedBy::Manual
}

impl NewRisk {
    /// # Errors
    /// Returns [`KernelError::Validation`] when the title is blank.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.title.trim().is_empty() {
            return Err(KernelError::Validation(
                "risk title MUST be provided".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn effective_severity(&self) -> RiskSeverity {
        self.severity
            .unwrap_or_else(|| self.risk_type.default_severity())
    }
}

/// Keyword classifier; first matching class wins in the order conflict,
/// behavior change, dependency.
#[must_use]
pub fn classify_risk(text: &str) -> RiskType {
    let lowered = text.to_lowercase();
    let matches = |keywords: &[&str]| keywords.iter().any(|keyword| lowered.contains(keyword));
    if matches(&CONFLICT_KEYWORDS) {
        RiskType::Conflict
    } else if matches(&BEHAVIOR_CHANGE_KEYWORDS) {
        RiskType::BehaviorChange
    } else if matches(&DEPENDENCY_KEYWORDS) {
        RiskType::Dependency
    } else {
        RiskType::Other
    }
}

/// Candidate risks from blocked steps that carry notes.
#[must_use]
pub fn detect_blocked_step_risks(plan: &Plan) -> Vec<NewRisk> {
    plan.steps
        .iter()
        .filter(|step| step.status == StepStatus::Blocked)
        .filter_map(|step| {
            let notes = step.notes.as_deref()?.trim();
            if notes.is_empty() {
                return None;
            }
            let risk_type = classify_risk(notes);
            Some(NewRisk {
                title: format!("Blocked: {}", step.task),
                risk_type,
                severity: Some(risk_type.default_severity()),
                description: notes.to_string(),
                source_plan_id: Some(plan.id.clone()),
                affected_plans: vec![plan.id.clone()],
                detected_by: DetectedBy::Auto,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{NewStep, PlanStatus, Priority, StepType};
    use crate::WorkspaceId;

    #[test]
    fn keyword_classes_map_to_types_and_severities() {
        let cases = [
            ("Merge conflict with billing branch", RiskType::Conflict, RiskSeverity::High),
            ("Breaking API change in v2", RiskType::BehaviorChange, RiskSeverity::Medium),
            ("Waiting on upstream release", RiskType::Dependency, RiskSeverity::Medium),
            ("Flaky CI runner", RiskType::Other, RiskSeverity::Low),
        ];
        for (text, expected_type, expected_severity) in cases {
            let risk_type = classify_risk(text);
            assert_eq!(risk_type, expected_type, "{text}");
            assert_eq!(risk_type.default_severity(), expected_severity, "{text}");
        }
    }

    #[test]
    fn only_blocked_steps_with_notes_become_risks() {
        let now = crate::now_utc();
        let mut steps: Vec<_> = ["Wire API", "Migrate callers", "Write docs"]
            .iter()
            .enumerate()
            .map(|(index, task)| NewStep::new("build", task, StepType::Code).into_step(index))
            .collect();
        steps[0].status = StepStatus::Blocked;
        steps[0].notes = Some("blocked by upstream schema".to_string());
        steps[1].status = StepStatus::Blocked;
        steps[2].notes = Some("incompatible styles".to_string());

        let plan = Plan {
            id: PlanId::from("plan_risk"),
            workspace_id: WorkspaceId::from("ws_risk"),
            title: "risk".to_string(),
            description: String::new(),
            status: PlanStatus::Active,
            category: None,
            priority: Priority::Medium,
            schema_version: Some(2),
            current_phase: None,
            current_agent: None,
            program_id: None,
            steps,
            phases: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let risks = detect_blocked_step_risks(&plan);
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].title, "Blocked: Wire API");
        assert_eq!(risks[0].risk_type, RiskType::Dependency);
        assert_eq!(risks[0].detected_by, DetectedBy::Auto);
    }
}
