//! JSON tool surface over [`SqlitePlanStore`].
//!
//! A request names its operation in `action` and carries the caller's
//! `workspace_id`; plan, program and session requests are refused unless the
//! entity lives in that workspace. Responses always use the envelope
//! `{"success": true, "data": ..}` or
//! `{"success": false, "error": {"code", "message", "retryable"}}`.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use plan_kernel_core::config::stale_threshold;
use plan_kernel_core::graph::NewDependency;
use plan_kernel_core::handoff::{HandoffRequest, SessionCompletion, SessionStart};
use plan_kernel_core::plan::{
    legacy_shape_advisory, program_upgrade_advisory, validate_step_order, MoveDirection,
    NewPlan, NewStep, NoteType, PlanTemplate, StepUpdate,
};
use plan_kernel_core::risk::{classify_risk, NewRisk};
use plan_kernel_core::roles::AgentType;
use plan_kernel_core::workflow::WorkflowConfig;
use plan_kernel_core::{KernelError, PlanId, ProgramId, SessionId, WorkspaceId};
use plan_kernel_store_sqlite::{NewBuildScript, SqlitePlanStore, StepPosition, TcpApprovalOracle};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

const DEFAULT_EVENT_LIMIT: usize = 100;

fn default_event_limit() -> usize {
    DEFAULT_EVENT_LIMIT
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ToolRequest {
    RegisterWorkspace {
        path: String,
        #[serde(default)]
        name: Option<String>,
    },
    ListWorkspaces,

    CreatePlan {
        #[serde(flatten)]
        plan: NewPlan,
    },
    CreatePlanFromTemplate {
        workspace_id: WorkspaceId,
        title: String,
        template: PlanTemplate,
        #[serde(default)]
        created_by: Option<AgentType>,
    },
    GetPlan {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
    },
    ListPlans {
        workspace_id: WorkspaceId,
        #[serde(default)]
        include_archived: bool,
    },
    UpdateStep {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        #[serde(flatten)]
        update: StepUpdate,
    },
    BatchUpdateSteps {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        updates: Vec<StepUpdate>,
    },
    InsertStep {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        #[serde(default)]
        position: StepPosition,
        step: NewStep,
    },
    DeleteStep {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        index: usize,
    },
    ReorderStep {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        index: usize,
        direction: MoveDirection,
    },
    MoveStep {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        from: usize,
        to: usize,
    },
    SortByPhase {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        #[serde(default)]
        phase_order: Option<Vec<String>>,
    },
    SetOrder {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        order: Vec<usize>,
    },
    ConsolidateSteps {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        indices: Vec<usize>,
        task: String,
    },
    ValidateStepOrder {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
    },
    PlanAdvisories {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
    },
    ConfirmStep {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        index: usize,
        confirmed_by: String,
    },
    ConfirmPhase {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        phase: String,
        confirmed_by: String,
    },
    RequestStepConfirmation {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        index: usize,
        approval_addr: SocketAddr,
    },
    AddNote {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        note_type: NoteType,
        message: String,
    },
    ListNotes {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        #[serde(default)]
        pending_only: bool,
    },
    ArchivePlan {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
    },
    DeletePlan {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
    },
    UpgradeLegacyPlan {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
    },
    ImportLegacyPlan {
        workspace_id: WorkspaceId,
        path: PathBuf,
    },

    CreateProgram {
        workspace_id: WorkspaceId,
        title: String,
        #[serde(default)]
        description: String,
    },
    GetProgram {
        workspace_id: WorkspaceId,
        program_id: ProgramId,
    },
    ListPrograms {
        workspace_id: WorkspaceId,
    },
    AddPlanToProgram {
        workspace_id: WorkspaceId,
        program_id: ProgramId,
        plan_id: PlanId,
    },
    RemovePlanFromProgram {
        workspace_id: WorkspaceId,
        program_id: ProgramId,
        plan_id: PlanId,
    },
    PromotePlanToProgram {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        #[serde(default)]
        title: Option<String>,
    },
    SetDependency {
        workspace_id: WorkspaceId,
        program_id: ProgramId,
        #[serde(flatten)]
        dependency: NewDependency,
    },
    RemoveDependency {
        workspace_id: WorkspaceId,
        program_id: ProgramId,
        dependency_id: i64,
    },
    GetDependencies {
        workspace_id: WorkspaceId,
        program_id: ProgramId,
        #[serde(default)]
        plan_id: Option<PlanId>,
    },
    GetDependents {
        workspace_id: WorkspaceId,
        program_id: ProgramId,
        plan_id: PlanId,
    },
    ValidateNoCycles {
        workspace_id: WorkspaceId,
        program_id: ProgramId,
    },
    AnnouncePhaseCompletion {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        phase: String,
    },
    AddRisk {
        workspace_id: WorkspaceId,
        program_id: ProgramId,
        #[serde(flatten)]
        risk: NewRisk,
    },
    ListRisks {
        workspace_id: WorkspaceId,
        program_id: ProgramId,
    },
    DetectRisks {
        workspace_id: WorkspaceId,
        program_id: ProgramId,
    },
    ClassifyRisk {
        workspace_id: WorkspaceId,
        text: String,
    },
    ArchiveProgram {
        workspace_id: WorkspaceId,
        program_id: ProgramId,
    },

    InitialiseAgent {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        agent: AgentType,
        #[serde(flatten)]
        start: SessionStart,
    },
    CompleteAgent {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        session_id: SessionId,
        #[serde(flatten)]
        completion: SessionCompletion,
    },
    Handoff {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        #[serde(flatten)]
        request: HandoffRequest,
    },
    ValidateAgent {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
        agent: AgentType,
    },
    GetCapabilities {
        workspace_id: WorkspaceId,
        agent: AgentType,
    },
    ListSessions {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
    },
    GetLineage {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
    },
    ConsumeLimitFlags {
        workspace_id: WorkspaceId,
        plan_id: PlanId,
    },
    SweepStaleSessions {
        workspace_id: WorkspaceId,
        #[serde(default)]
        stale_after_minutes: Option<i64>,
    },
    AddBuildScript {
        #[serde(flatten)]
        script: NewBuildScript,
    },
    ListBuildScripts {
        workspace_id: WorkspaceId,
        #[serde(default)]
        plan_id: Option<PlanId>,
    },
    DeleteBuildScript {
        workspace_id: WorkspaceId,
        script_id: i64,
    },

    SetWorkflowDefinition {
        workspace_id: WorkspaceId,
        category: String,
        workflow: WorkflowConfig,
    },
    GetWorkflowDefinition {
        workspace_id: WorkspaceId,
        category: String,
    },
    DeleteWorkflowDefinition {
        workspace_id: WorkspaceId,
        category: String,
    },
    ListWorkflowDefinitions {
        workspace_id: WorkspaceId,
    },
    ResolveCategoryWorkflow {
        workspace_id: WorkspaceId,
        #[serde(default)]
        category: Option<String>,
        #[serde(default)]
        workflow: Option<WorkflowConfig>,
    },

    ListEvents {
        workspace_id: WorkspaceId,
        #[serde(default)]
        plan_id: Option<PlanId>,
        #[serde(default)]
        after_seq: i64,
        #[serde(default = "default_event_limit")]
        limit: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ToolError {
    /// Maps a store failure to its envelope form. Typed kernel failures keep
    /// their code; anything else is reported as `storage`.
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        match err
            .chain()
            .find_map(|cause| cause.downcast_ref::<KernelError>())
        {
            Some(kernel) => Self {
                code: kernel.code().to_string(),
                message: kernel.to_string(),
                retryable: kernel.is_retryable(),
            },
            None => Self {
                code: "storage".to_string(),
                message: format!("{err:#}"),
                retryable: false,
            },
        }
    }
}

impl ToolResponse {
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(err: &anyhow::Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ToolError::from_error(err)),
        }
    }
}

/// Parses a raw JSON request and dispatches it. Malformed requests come back
/// as a `validation` envelope.
pub fn dispatch_json(store: &mut SqlitePlanStore, raw: &str) -> ToolResponse {
    match serde_json::from_str::<ToolRequest>(raw) {
        Ok(request) => dispatch(store, request),
        Err(err) => {
            let err = anyhow::Error::from(KernelError::Validation(format!(
                "invalid tool request: {err}"
            )));
            ToolResponse::failure(&err)
        }
    }
}

pub fn dispatch(store: &mut SqlitePlanStore, request: ToolRequest) -> ToolResponse {
    debug!(?request, "dispatching tool request");
    match execute(store, request) {
        Ok(data) => ToolResponse::ok(data),
        Err(err) => {
            let response = ToolResponse::failure(&err);
            if let Some(error) = &response.error {
                warn!(code = %error.code, error = %format!("{err:#}"), "tool request failed");
            }
            response
        }
    }
}

fn to_data<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn require_workspace(store: &SqlitePlanStore, workspace_id: &WorkspaceId) -> Result<()> {
    store.get_workspace(workspace_id).map(drop)
}

#[allow(clippy::too_many_lines)]
fn execute(store: &mut SqlitePlanStore, request: ToolRequest) -> Result<Value> {
    match request {
        ToolRequest::RegisterWorkspace { path, name } => {
            to_data(store.register_workspace(&path, name.as_deref())?)
        }
        ToolRequest::ListWorkspaces => to_data(store.list_workspaces()?),

        ToolRequest::CreatePlan { plan } => to_data(store.create_plan(&plan)?),
        ToolRequest::CreatePlanFromTemplate {
            workspace_id,
            title,
            template,
            created_by,
        } => to_data(store.create_plan_from_template(&workspace_id, &title, template, created_by)?),
        ToolRequest::GetPlan {
            workspace_id,
            plan_id,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.get_plan(&plan_id)?)
        }
        ToolRequest::ListPlans {
            workspace_id,
            include_archived,
        } => {
            require_workspace(store, &workspace_id)?;
            to_data(store.list_plans(&workspace_id, include_archived)?)
        }
        ToolRequest::UpdateStep {
            workspace_id,
            plan_id,
            update,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.update_step(&plan_id, &update)?)
        }
        ToolRequest::BatchUpdateSteps {
            workspace_id,
            plan_id,
            updates,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.batch_update_steps(&plan_id, &updates)?)
        }
        ToolRequest::InsertStep {
            workspace_id,
            plan_id,
            position,
            step,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.insert_step(&plan_id, position, &step)?)
        }
        ToolRequest::DeleteStep {
            workspace_id,
            plan_id,
            index,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.delete_step(&plan_id, index)?)
        }
        ToolRequest::ReorderStep {
            workspace_id,
            plan_id,
            index,
            direction,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.reorder_step(&plan_id, index, direction)?)
        }
        ToolRequest::MoveStep {
            workspace_id,
            plan_id,
            from,
            to,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.move_step(&plan_id, from, to)?)
        }
        ToolRequest::SortByPhase {
            workspace_id,
            plan_id,
            phase_order,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.sort_by_phase(&plan_id, phase_order.as_deref())?)
        }
        ToolRequest::SetOrder {
            workspace_id,
            plan_id,
            order,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.set_order(&plan_id, &order)?)
        }
        ToolRequest::ConsolidateSteps {
            workspace_id,
            plan_id,
            indices,
            task,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            let (plan, record) = store.consolidate_steps(&plan_id, &indices, &task)?;
            Ok(json!({ "plan": plan, "consolidation": record }))
        }
        ToolRequest::ValidateStepOrder {
            workspace_id,
            plan_id,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            let plan = store.get_plan(&plan_id)?;
            to_data(validate_step_order(&plan.steps))
        }
        ToolRequest::PlanAdvisories {
            workspace_id,
            plan_id,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            let plan = store.get_plan(&plan_id)?;
            let threshold = store.config().auto_upgrade_step_threshold;
            let advisories = [
                program_upgrade_advisory(&plan, threshold),
                legacy_shape_advisory(&plan),
            ];
            to_data(advisories.into_iter().flatten().collect::<Vec<_>>())
        }
        ToolRequest::ConfirmStep {
            workspace_id,
            plan_id,
            index,
            confirmed_by,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.confirm_step(&plan_id, index, &confirmed_by)?)
        }
        ToolRequest::ConfirmPhase {
            workspace_id,
            plan_id,
            phase,
            confirmed_by,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.confirm_phase(&plan_id, &phase, &confirmed_by)?)
        }
        ToolRequest::RequestStepConfirmation {
            workspace_id,
            plan_id,
            index,
            approval_addr,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            let oracle = TcpApprovalOracle::new(approval_addr);
            to_data(store.request_step_confirmation(&plan_id, index, &oracle)?)
        }
        ToolRequest::AddNote {
            workspace_id,
            plan_id,
            note_type,
            message,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.add_note(&plan_id, note_type, &message)?)
        }
        ToolRequest::ListNotes {
            workspace_id,
            plan_id,
            pending_only,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.list_notes(&plan_id, pending_only)?)
        }
        ToolRequest::ArchivePlan {
            workspace_id,
            plan_id,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.archive_plan(&plan_id)?)
        }
        ToolRequest::DeletePlan {
            workspace_id,
            plan_id,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            store.delete_plan(&plan_id)?;
            Ok(json!({ "deleted": plan_id }))
        }
        ToolRequest::UpgradeLegacyPlan {
            workspace_id,
            plan_id,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.upgrade_legacy_plan(&plan_id)?)
        }
        ToolRequest::ImportLegacyPlan { workspace_id, path } => {
            to_data(store.import_legacy_plan_file(&workspace_id, &path)?)
        }

        ToolRequest::CreateProgram {
            workspace_id,
            title,
            description,
        } => to_data(store.create_program(&workspace_id, &title, &description)?),
        ToolRequest::GetProgram {
            workspace_id,
            program_id,
        } => {
            store.ensure_program_in_workspace(&program_id, &workspace_id)?;
            to_data(store.get_program(&program_id)?)
        }
        ToolRequest::ListPrograms { workspace_id } => {
            require_workspace(store, &workspace_id)?;
            to_data(store.list_programs(&workspace_id)?)
        }
        ToolRequest::AddPlanToProgram {
            workspace_id,
            program_id,
            plan_id,
        } => {
            store.ensure_program_in_workspace(&program_id, &workspace_id)?;
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.add_plan_to_program(&program_id, &plan_id)?)
        }
        ToolRequest::RemovePlanFromProgram {
            workspace_id,
            program_id,
            plan_id,
        } => {
            store.ensure_program_in_workspace(&program_id, &workspace_id)?;
            to_data(store.remove_plan_from_program(&program_id, &plan_id)?)
        }
        ToolRequest::PromotePlanToProgram {
            workspace_id,
            plan_id,
            title,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.promote_plan_to_program(&plan_id, title.as_deref())?)
        }
        ToolRequest::SetDependency {
            workspace_id,
            program_id,
            dependency,
        } => {
            store.ensure_program_in_workspace(&program_id, &workspace_id)?;
            to_data(store.set_dependency(&program_id, &dependency)?)
        }
        ToolRequest::RemoveDependency {
            workspace_id,
            program_id,
            dependency_id,
        } => {
            store.ensure_program_in_workspace(&program_id, &workspace_id)?;
            store.remove_dependency(&program_id, dependency_id)?;
            Ok(json!({ "removed": dependency_id }))
        }
        ToolRequest::GetDependencies {
            workspace_id,
            program_id,
            plan_id,
        } => {
            store.ensure_program_in_workspace(&program_id, &workspace_id)?;
            to_data(store.get_dependencies(&program_id, plan_id.as_ref())?)
        }
        ToolRequest::GetDependents {
            workspace_id,
            program_id,
            plan_id,
        } => {
            store.ensure_program_in_workspace(&program_id, &workspace_id)?;
            to_data(store.get_dependents_of(&program_id, &plan_id)?)
        }
        ToolRequest::ValidateNoCycles {
            workspace_id,
            program_id,
        } => {
            store.ensure_program_in_workspace(&program_id, &workspace_id)?;
            to_data(store.validate_no_cycles(&program_id)?)
        }
        ToolRequest::AnnouncePhaseCompletion {
            workspace_id,
            plan_id,
            phase,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.announce_phase_completion(&plan_id, &phase)?)
        }
        ToolRequest::AddRisk {
            workspace_id,
            program_id,
            risk,
        } => {
            store.ensure_program_in_workspace(&program_id, &workspace_id)?;
            to_data(store.add_risk(&program_id, &risk)?)
        }
        ToolRequest::ListRisks {
            workspace_id,
            program_id,
        } => {
            store.ensure_program_in_workspace(&program_id, &workspace_id)?;
            to_data(store.list_risks(&program_id)?)
        }
        ToolRequest::DetectRisks {
            workspace_id,
            program_id,
        } => {
            store.ensure_program_in_workspace(&program_id, &workspace_id)?;
            to_data(store.detect_risks(&program_id)?)
        }
        ToolRequest::ClassifyRisk { workspace_id, text } => {
            require_workspace(store, &workspace_id)?;
            Ok(json!({ "risk_type": classify_risk(&text) }))
        }
        ToolRequest::ArchiveProgram {
            workspace_id,
            program_id,
        } => {
            store.ensure_program_in_workspace(&program_id, &workspace_id)?;
            to_data(store.archive_program(&program_id)?)
        }

        ToolRequest::InitialiseAgent {
            workspace_id,
            plan_id,
            agent,
            start,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.initialise_agent(&plan_id, agent, &start)?)
        }
        ToolRequest::CompleteAgent {
            workspace_id,
            plan_id,
            session_id,
            completion,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            let owned = store
                .list_sessions(&plan_id)?
                .iter()
                .any(|session| session.id == session_id);
            if !owned {
                return Err(KernelError::NotFound(format!(
                    "session {session_id} on plan {plan_id}"
                ))
                .into());
            }
            to_data(store.complete_agent(&session_id, &completion)?)
        }
        ToolRequest::Handoff {
            workspace_id,
            plan_id,
            request,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.handoff(&plan_id, &request)?)
        }
        ToolRequest::ValidateAgent {
            workspace_id,
            plan_id,
            agent,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.validate_agent_for_plan(&plan_id, agent)?)
        }
        ToolRequest::GetCapabilities {
            workspace_id,
            agent,
        } => {
            require_workspace(store, &workspace_id)?;
            to_data(agent.capabilities())
        }
        ToolRequest::ListSessions {
            workspace_id,
            plan_id,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.list_sessions(&plan_id)?)
        }
        ToolRequest::GetLineage {
            workspace_id,
            plan_id,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.get_lineage(&plan_id)?)
        }
        ToolRequest::ConsumeLimitFlags {
            workspace_id,
            plan_id,
        } => {
            store.ensure_plan_in_workspace(&plan_id, &workspace_id)?;
            to_data(store.consume_limit_flags(&plan_id)?)
        }
        ToolRequest::SweepStaleSessions {
            workspace_id,
            stale_after_minutes,
        } => {
            require_workspace(store, &workspace_id)?;
            let threshold = match stale_after_minutes {
                Some(minutes) => stale_threshold(minutes)?,
                None => store.config().stale_session_after(),
            };
            to_data(store.sweep_stale_sessions(threshold)?)
        }
        ToolRequest::AddBuildScript { script } => to_data(store.add_build_script(&script)?),
        ToolRequest::ListBuildScripts {
            workspace_id,
            plan_id,
        } => {
            require_workspace(store, &workspace_id)?;
            to_data(store.list_build_scripts(&workspace_id, plan_id.as_ref())?)
        }
        ToolRequest::DeleteBuildScript {
            workspace_id,
            script_id,
        } => {
            store.delete_build_script(&workspace_id, script_id)?;
            Ok(json!({ "removed": script_id }))
        }

        ToolRequest::SetWorkflowDefinition {
            workspace_id,
            category,
            workflow,
        } => {
            require_workspace(store, &workspace_id)?;
            to_data(store.set_workflow_definition(&category, &workflow)?)
        }
        ToolRequest::GetWorkflowDefinition {
            workspace_id,
            category,
        } => {
            require_workspace(store, &workspace_id)?;
            to_data(store.get_workflow_definition(&category)?)
        }
        ToolRequest::DeleteWorkflowDefinition {
            workspace_id,
            category,
        } => {
            require_workspace(store, &workspace_id)?;
            store.delete_workflow_definition(&category)?;
            Ok(json!({ "removed": category }))
        }
        ToolRequest::ListWorkflowDefinitions { workspace_id } => {
            require_workspace(store, &workspace_id)?;
            to_data(store.list_workflow_definitions()?)
        }
        ToolRequest::ResolveCategoryWorkflow {
            workspace_id,
            category,
            workflow,
        } => {
            require_workspace(store, &workspace_id)?;
            to_data(store.resolve_category_workflow(category.as_deref(), workflow)?)
        }

        ToolRequest::ListEvents {
            workspace_id,
            plan_id,
            after_seq,
            limit,
        } => {
            match &plan_id {
                Some(plan_id) => store.ensure_plan_in_workspace(plan_id, &workspace_id)?,
                None => require_workspace(store, &workspace_id)?,
            }
            to_data(store.list_events(plan_id.as_ref(), after_seq, limit)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{must, open_store};

    fn call(store: &mut SqlitePlanStore, request: Value) -> ToolResponse {
        dispatch_json(store, &request.to_string())
    }

    fn data(response: ToolResponse) -> Value {
        match (response.success, response.data) {
            (true, Some(data)) => data,
            (_, _) => panic!("expected success envelope, got {:?}", response.error),
        }
    }

    fn error_code(response: &ToolResponse) -> &str {
        match &response.error {
            Some(error) => error.code.as_str(),
            None => panic!("expected error envelope, got {:?}", response.data),
        }
    }

    fn string_field<'a>(value: &'a Value, field: &str) -> &'a str {
        match value.get(field).and_then(Value::as_str) {
            Some(text) => text,
            None => panic!("missing string field {field} in {value}"),
        }
    }

    fn register(store: &mut SqlitePlanStore, path: &str) -> String {
        let workspace = data(call(
            store,
            json!({ "action": "register_workspace", "path": path }),
        ));
        string_field(&workspace, "id").to_string()
    }

    fn create_plan(store: &mut SqlitePlanStore, workspace_id: &str, title: &str) -> String {
        let plan = data(call(
            store,
            json!({
                "action": "create_plan",
                "workspace_id": workspace_id,
                "title": title,
                "steps": [
                    { "phase": "build", "task": "Write the parser", "type": "code" },
                    { "phase": "verify", "task": "Run the suite", "type": "test" }
                ]
            }),
        ));
        string_field(&plan, "id").to_string()
    }

    #[test]
    fn out_of_range_sweep_window_is_a_validation_envelope() {
        let mut store = open_store();
        let workspace = register(&mut store, "/srv/tools-sweep");

        for minutes in [json!(i64::MAX), json!(i64::MIN), json!(0), json!(-30)] {
            let response = call(
                &mut store,
                json!({
                    "action": "sweep_stale_sessions",
                    "workspace_id": workspace,
                    "stale_after_minutes": minutes
                }),
            );
            assert!(!response.success);
            assert_eq!(error_code(&response), "validation");
        }

        let swept = data(call(
            &mut store,
            json!({
                "action": "sweep_stale_sessions",
                "workspace_id": workspace,
                "stale_after_minutes": 30
            }),
        ));
        assert_eq!(swept, json!([]));
    }

    #[test]
    fn malformed_requests_are_validation_errors() {
        let mut store = open_store();
        let response = dispatch_json(&mut store, "{not json");
        assert!(!response.success);
        assert_eq!(error_code(&response), "validation");

        let response = call(&mut store, json!({ "action": "launch_rocket" }));
        assert_eq!(error_code(&response), "validation");

        let response = call(&mut store, json!({ "action": "get_plan", "workspace_id": "ws_x" }));
        assert_eq!(error_code(&response), "validation");
    }

    #[test]
    fn plans_are_scoped_to_their_workspace() {
        let mut store = open_store();
        let home = register(&mut store, "/srv/home");
        let other = register(&mut store, "/srv/other");
        let plan_id = create_plan(&mut store, &home, "Parser");

        let plan = data(call(
            &mut store,
            json!({ "action": "get_plan", "workspace_id": home, "plan_id": plan_id }),
        ));
        assert_eq!(plan["steps"].as_array().map(Vec::len), Some(2));

        let foreign = call(
            &mut store,
            json!({ "action": "get_plan", "workspace_id": other, "plan_id": plan_id }),
        );
        assert_eq!(error_code(&foreign), "not_found");
        assert_eq!(foreign.error.map(|error| error.retryable), Some(false));
    }

    #[test]
    fn finishing_a_phase_releases_program_dependencies() {
        let mut store = open_store();
        let workspace = register(&mut store, "/srv/program");
        let upstream = create_plan(&mut store, &workspace, "Upstream");
        let downstream = create_plan(&mut store, &workspace, "Downstream");

        let program = data(call(
            &mut store,
            json!({ "action": "create_program", "workspace_id": workspace, "title": "Release" }),
        ));
        let program_id = string_field(&program, "id").to_string();
        for plan_id in [&upstream, &downstream] {
            data(call(
                &mut store,
                json!({
                    "action": "add_plan_to_program",
                    "workspace_id": workspace,
                    "program_id": program_id,
                    "plan_id": plan_id
                }),
            ));
        }
        data(call(
            &mut store,
            json!({
                "action": "set_dependency",
                "workspace_id": workspace,
                "program_id": program_id,
                "source_plan_id": upstream,
                "source_phase": "build",
                "target_plan_id": downstream,
                "dependency_type": "blocks"
            }),
        ));

        let updated = data(call(
            &mut store,
            json!({
                "action": "update_step",
                "workspace_id": workspace,
                "plan_id": upstream,
                "index": 0,
                "status": "done"
            }),
        ));
        assert_eq!(updated["completed_phases"], json!(["build"]));
        assert_eq!(updated["phase_reports"][0]["unblocked_plans"], json!([downstream]));

        let cycle = call(
            &mut store,
            json!({
                "action": "set_dependency",
                "workspace_id": workspace,
                "program_id": program_id,
                "source_plan_id": downstream,
                "source_phase": "build",
                "target_plan_id": upstream,
                "dependency_type": "blocks"
            }),
        );
        assert_eq!(error_code(&cycle), "cycle_detected");
    }

    #[test]
    fn role_boundaries_surface_as_boundary_violations() {
        let mut store = open_store();
        let workspace = register(&mut store, "/srv/roles");
        let plan_id = create_plan(&mut store, &workspace, "Roles");

        let response = call(
            &mut store,
            json!({
                "action": "handoff",
                "workspace_id": workspace,
                "plan_id": plan_id,
                "from": "archivist",
                "to": "executor",
                "reason": "reopen the work"
            }),
        );
        assert_eq!(error_code(&response), "boundary_violation");

        let lineage = data(call(
            &mut store,
            json!({ "action": "get_lineage", "workspace_id": workspace, "plan_id": plan_id }),
        ));
        assert_eq!(lineage, json!([]));

        let capabilities = data(call(
            &mut store,
            json!({ "action": "get_capabilities", "workspace_id": workspace, "agent": "coordinator" }),
        ));
        assert_eq!(capabilities["is_hub"], json!(true));
    }

    #[test]
    fn non_kernel_failures_are_storage_errors() {
        let err = anyhow::anyhow!("disk I/O error");
        let error = ToolError::from_error(&err);
        assert_eq!(error.code, "storage");
        assert!(!error.retryable);

        let timeout = anyhow::Error::from(KernelError::LockTimeout {
            key: "plan:x".to_string(),
            attempts: 3,
        })
        .context("while updating steps");
        let error = ToolError::from_error(&timeout);
        assert_eq!(error.code, "lock_timeout");
        assert!(error.retryable);

        must(serde_json::to_value(ToolResponse::failure(&timeout)));
    }
}
