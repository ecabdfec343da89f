//! Agent sessions, lineage entries and worker limit checks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::roles::AgentType;
use crate::{KernelError, PlanId, SessionId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSession {
    pub id: SessionId,
    pub plan_id: PlanId,
    pub agent_type: AgentType,
    pub started_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub summary: Option<String>,
    pub is_orphaned: bool,
    pub step_budget: Option<u32>,
    pub token_budget: Option<u64>,
    pub steps_completed: u32,
    pub tokens_used: u64,
    pub declared_scope: Vec<String>,
    pub files_touched: Vec<String>,
    pub artifacts: Vec<String>,
}

impl AgentSession {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStart {
    #[serde(default)]
    pub step_budget: Option<u32>,
    #[serde(default)]
    pub token_budget: Option<u64>,
    #[serde(default)]
    pub declared_scope: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionCompletion {
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub steps_completed: u32,
    #[serde(default)]
    pub tokens_used: u64,
}

impl SessionCompletion {
    /// # Errors
    /// Returns [`KernelError::Validation`] when the summary is blank.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.summary.trim().is_empty() {
            return Err(KernelError::Validation(
                "session summary MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineageEntry {
    pub seq: i64,
    pub plan_id: PlanId,
    pub from_agent: AgentType,
    pub to_agent: AgentType,
    pub reason: String,
    pub data: Value,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandoffRequest {
    pub from: AgentType,
    pub to: AgentType,
    pub reason: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl HandoffRequest {
    /// Validates the reason and normalizes `data` to a JSON object.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for a blank reason or non-object
    /// payload.
    pub fn normalized_data(&self) -> Result<Value, KernelError> {
        if self.reason.trim().is_empty() {
            return Err(KernelError::Validation(
                "handoff reason MUST be provided".to_string(),
            ));
        }
        match &self.data {
            None | Some(Value::Null) => Ok(Value::Object(serde_json::Map::new())),
            Some(value @ Value::Object(_)) => Ok(value.clone()),
            Some(_) => Err(KernelError::Validation(
                "handoff data MUST be a JSON object".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LimitFlagKind {
    StepBudgetExceeded,
    TokenBudgetExceeded,
    ScopeEscalation,
}

impl LimitFlagKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StepBudgetExceeded => "step_budget_exceeded",
            Self::TokenBudgetExceeded => "token_budget_exceeded",
            Self::ScopeEscalation => "scope_escalation",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "step_budget_exceeded" => Some(Self::StepBudgetExceeded),
            "token_budget_exceeded" => Some(Self::TokenBudgetExceeded),
            "scope_escalation" => Some(Self::ScopeEscalation),
            _ => None,
        }
    }
}

/// A breach found on a worker session, waiting for the next agent to read it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitFlag {
    pub id: i64,
    pub plan_id: PlanId,
    pub session_id: SessionId,
    pub agent_type: AgentType,
    pub kind: LimitFlagKind,
    pub detail: String,
    pub created_at: OffsetDateTime,
    pub consumed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitBreach {
    pub kind: LimitFlagKind,
    pub detail: String,
}

/// A path is in scope when it equals a declared entry or lives beneath a
/// declared directory. An empty scope allows nothing.
#[must_use]
pub fn path_in_scope(path: &str, scope: &[String]) -> bool {
    let path = normalize_path(path);
    scope.iter().any(|entry| {
        let entry = normalize_path(entry);
        if entry.is_empty() {
            return false;
        }
        path == entry || path.starts_with(&format!("{entry}/"))
    })
}

fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let stripped = unified.strip_prefix("./").unwrap_or(&unified);
    stripped.trim_end_matches('/').to_string()
}

/// Budget and scope breaches for a session. Scope is only checked when the
/// session declared one.
#[must_use]
pub fn detect_limit_breaches(session: &AgentSession) -> Vec<LimitBreach> {
    let mut breaches = Vec::new();

    if let Some(budget) = session.step_budget {
        if session.steps_completed > budget {
            breaches.push(LimitBreach {
                kind: LimitFlagKind::StepBudgetExceeded,
                detail: format!(
                    "completed {} steps against a budget of {budget}",
                    session.steps_completed
                ),
            });
        }
    }

    if let Some(budget) = session.token_budget {
        if session.tokens_used > budget {
            breaches.push(LimitBreach {
                kind: LimitFlagKind::TokenBudgetExceeded,
                detail: format!(
                    "used {} tokens against a budget of {budget}",
                    session.tokens_used
                ),
            });
        }
    }

    if !session.declared_scope.is_empty() {
        let outside: Vec<&str> = session
            .files_touched
            .iter()
            .filter(|file| !path_in_scope(file, &session.declared_scope))
            .map(String::as_str)
            .collect();
        if !outside.is_empty() {
            breaches.push(LimitBreach {
                kind: LimitFlagKind::ScopeEscalation,
                detail: format!("touched files outside declared scope: {}", outside.join(", ")),
            });
        }
    }

    breaches
}

#[must_use]
pub fn is_session_stale(session: &AgentSession, now: OffsetDateTime, threshold: Duration) -> bool {
    session.is_open() && now - session.started_at > threshold
}

/// Next lineage timestamp: `now`, pushed forward when the clock has not
/// advanced past the previous entry.
#[must_use]
pub fn next_lineage_timestamp(
    previous: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> OffsetDateTime {
    match previous {
        Some(previous) if now <= previous => previous + Duration::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_session() -> AgentSession {
        AgentSession {
            id: SessionId::from("sess_fixture"),
            plan_id: PlanId::from("plan_fixture"),
            agent_type: AgentType::Worker,
            started_at: must(crate::parse_rfc3339_utc("2026-02-07T10:00:00Z")),
            completed_at: None,
            summary: None,
            is_orphaned: false,
            step_budget: Some(3),
            token_budget: Some(10_000),
            steps_completed: 2,
            tokens_used: 4_000,
            declared_scope: vec!["src/parser".to_string(), "Cargo.toml".to_string()],
            files_touched: vec!["src/parser/mod.rs".to_string(), "./Cargo.toml".to_string()],
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn session_within_limits_has_no_breaches() {
        assert!(detect_limit_breaches(&fixture_session()).is_empty());
    }

    #[test]
    fn every_breach_kind_is_reported() {
        let mut session = fixture_session();
        session.steps_completed = 5;
        session.tokens_used = 20_000;
        session.files_touched.push("src/parser_extra.rs".to_string());

        let kinds: Vec<LimitFlagKind> = detect_limit_breaches(&session)
            .into_iter()
            .map(|breach| breach.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                LimitFlagKind::StepBudgetExceeded,
                LimitFlagKind::TokenBudgetExceeded,
                LimitFlagKind::ScopeEscalation,
            ]
        );
    }

    #[test]
    fn prefix_match_respects_path_boundaries() {
        let scope = vec!["src/parser".to_string()];
        assert!(path_in_scope("src/parser/lexer.rs", &scope));
        assert!(path_in_scope("src\\parser", &scope));
        assert!(!path_in_scope("src/parser_old/lexer.rs", &scope));
    }

    #[test]
    fn staleness_only_applies_to_open_sessions() {
        let mut session = fixture_session();
        let later = must(crate::parse_rfc3339_utc("2026-02-07T13:00:00Z"));
        assert!(is_session_stale(&session, later, Duration::minutes(120)));
        assert!(!is_session_stale(&session, later, Duration::minutes(240)));
        session.completed_at = Some(later);
        assert!(!is_session_stale(&session, later, Duration::minutes(120)));
    }

    #[test]
    fn lineage_timestamps_strictly_increase() {
        let now = must(crate::parse_rfc3339_utc("2026-02-07T10:00:00Z"));
        let first = next_lineage_timestamp(None, now);
        let second = next_lineage_timestamp(Some(first), now);
        let third = next_lineage_timestamp(Some(second), now - Duration::seconds(5));
        assert!(first < second && second < third);
    }

    #[test]
    fn handoff_data_must_be_an_object() {
        let mut request = HandoffRequest {
            from: AgentType::Executor,
            to: AgentType::Reviewer,
            reason: "implementation complete".to_string(),
            data: None,
        };
        assert_eq!(must(request.normalized_data()), json!({}));
        request.data = Some(json!(["not", "an", "object"]));
        assert!(request.normalized_data().is_err());
        request.data = Some(json!({"files": 3}));
        request.reason = "  ".to_string();
        assert!(request.normalized_data().is_err());
    }
}
