// Workflow aggregate root and its owned steps
//
// A workflow exclusively owns its steps; steps reference plugins by id only.
// All step transitions go through the aggregate so the status machines stay
// consistent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DomainError, Result};
use crate::events::{DomainEvent, EventQueue};
use crate::ids::{PluginId, WorkflowId, WorkflowStepId};

pub const WORKFLOW_NAME_MIN: usize = 3;
pub const WORKFLOW_NAME_MAX: usize = 100;
pub const WORKFLOW_DESCRIPTION_MAX: usize = 1000;
pub const STEP_NAME_MAX: usize = 200;

/// Workflow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(WorkflowStatus::Draft),
            "running" => Ok(WorkflowStatus::Running),
            "paused" => Ok(WorkflowStatus::Paused),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(DomainError::validation(
                "Workflow.Status",
                format!("unknown workflow status {other:?}"),
            )),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Step lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(DomainError::validation(
                "WorkflowStep.Status",
                format!("unknown step status {other:?}"),
            )),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One plugin execution inside a workflow
#[derive(Debug, Clone)]
pub struct WorkflowStep {
    id: WorkflowStepId,
    name: String,
    plugin_id: PluginId,
    order: i32,
    configuration: Map<String, Value>,
    status: StepStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    output: Option<String>,
}

impl WorkflowStep {
    fn new(
        name: impl Into<String>,
        plugin_id: PluginId,
        order: i32,
        configuration: Map<String, Value>,
    ) -> Result<Self> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(DomainError::validation(
                "WorkflowStep.Name",
                "step name must not be empty",
            ));
        }
        if name.chars().count() > STEP_NAME_MAX {
            return Err(DomainError::validation(
                "WorkflowStep.Name",
                format!("step name exceeds {STEP_NAME_MAX} characters"),
            ));
        }
        if order < 0 {
            return Err(DomainError::validation(
                "WorkflowStep.Order",
                "step order must be non-negative",
            ));
        }
        Ok(Self {
            id: WorkflowStepId::new(),
            name,
            plugin_id,
            order,
            configuration,
            status: StepStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            output: None,
        })
    }

    /// Restore a persisted step without validation
    #[allow(clippy::too_many_arguments)]
    pub fn rehydrate(
        id: WorkflowStepId,
        name: String,
        plugin_id: PluginId,
        order: i32,
        configuration: Map<String, Value>,
        status: StepStatus,
        created_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        error_message: Option<String>,
        output: Option<String>,
    ) -> Self {
        Self {
            id,
            name,
            plugin_id,
            order,
            configuration,
            status,
            created_at,
            started_at,
            completed_at,
            error_message,
            output,
        }
    }

    pub fn id(&self) -> WorkflowStepId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin_id(&self) -> PluginId {
        self.plugin_id
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn configuration(&self) -> &Map<String, Value> {
        &self.configuration
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    /// Wall-clock duration of the execution, when both timestamps exist
    pub fn execution_duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    fn begin(&mut self) -> Result<()> {
        if self.status != StepStatus::Pending {
            return Err(DomainError::validation(
                "WorkflowStep.NotPending",
                format!("step '{}' is {}", self.name, self.status),
            ));
        }
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    fn complete(&mut self, output: Option<String>) -> Result<()> {
        if self.status != StepStatus::Running {
            return Err(DomainError::validation(
                "WorkflowStep.NotRunning",
                format!("step '{}' is {}", self.name, self.status),
            ));
        }
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.output = output;
        Ok(())
    }

    // Failing from Pending is allowed: a missing plugin or a cancellation can
    // take a step down before it ever ran.
    fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        if !matches!(self.status, StepStatus::Pending | StepStatus::Running) {
            return Err(DomainError::validation(
                "WorkflowStep.AlreadySettled",
                format!("step '{}' is {}", self.name, self.status),
            ));
        }
        self.status = StepStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(message.into());
        Ok(())
    }

    fn skip(&mut self, reason: Option<String>) -> Result<()> {
        if self.status != StepStatus::Pending {
            return Err(DomainError::validation(
                "WorkflowStep.NotPending",
                format!("step '{}' is {}", self.name, self.status),
            ));
        }
        self.status = StepStatus::Skipped;
        self.completed_at = Some(Utc::now());
        self.error_message = reason;
        Ok(())
    }
}

/// Workflow aggregate
#[derive(Debug, Clone)]
pub struct Workflow {
    id: WorkflowId,
    name: String,
    description: String,
    status: WorkflowStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    steps: Vec<WorkflowStep>,
    row_version: i64,
    events: EventQueue,
}

impl Workflow {
    /// Create a draft workflow
    ///
    /// Emits `workflow.created`.
    pub fn create(name: impl Into<String>, description: impl Into<String>) -> Result<Self> {
        let name = Self::validate_name(name.into())?;
        let description = Self::validate_description(description.into())?;
        let now = Utc::now();
        let mut workflow = Self {
            id: WorkflowId::new(),
            name: name.clone(),
            description,
            status: WorkflowStatus::Draft,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            steps: Vec::new(),
            row_version: 0,
            events: EventQueue::new(),
        };
        workflow.events.push(DomainEvent::WorkflowCreated {
            workflow_id: workflow.id,
            name,
            occurred_at: now,
        });
        Ok(workflow)
    }

    /// Restore a persisted workflow without emitting events
    #[allow(clippy::too_many_arguments)]
    pub fn rehydrate(
        id: WorkflowId,
        name: String,
        description: String,
        status: WorkflowStatus,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        error_message: Option<String>,
        steps: Vec<WorkflowStep>,
        row_version: i64,
    ) -> Self {
        Self {
            id,
            name,
            description,
            status,
            created_at,
            updated_at,
            started_at,
            completed_at,
            error_message,
            steps,
            row_version,
            events: EventQueue::new(),
        }
    }

    fn validate_name(name: String) -> Result<String> {
        let name = name.trim().to_string();
        let len = name.chars().count();
        if !(WORKFLOW_NAME_MIN..=WORKFLOW_NAME_MAX).contains(&len) {
            return Err(DomainError::validation(
                "Workflow.Name",
                format!(
                    "workflow name must be {WORKFLOW_NAME_MIN}-{WORKFLOW_NAME_MAX} characters"
                ),
            ));
        }
        Ok(name)
    }

    fn validate_description(description: String) -> Result<String> {
        if description.chars().count() > WORKFLOW_DESCRIPTION_MAX {
            return Err(DomainError::validation(
                "Workflow.Description",
                format!("description exceeds {WORKFLOW_DESCRIPTION_MAX} characters"),
            ));
        }
        Ok(description)
    }

    // ---- accessors ----

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn step(&self, step_id: WorkflowStepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id() == step_id)
    }

    /// Execution order: ascending `order`, insertion order breaking ties
    pub fn steps_in_order(&self) -> Vec<&WorkflowStep> {
        let mut ordered: Vec<&WorkflowStep> = self.steps.iter().collect();
        ordered.sort_by_key(|s| s.order());
        ordered
    }

    pub fn row_version(&self) -> i64 {
        self.row_version
    }

    pub fn set_row_version(&mut self, version: i64) {
        self.row_version = version;
    }

    // ---- transitions ----

    /// Add a step; only Draft workflows are editable
    ///
    /// Emits `workflow.step_added`. Returns the new step id.
    pub fn add_step(
        &mut self,
        name: impl Into<String>,
        plugin_id: PluginId,
        order: i32,
        configuration: Map<String, Value>,
    ) -> Result<WorkflowStepId> {
        if self.status != WorkflowStatus::Draft {
            return Err(DomainError::validation(
                "Workflow.NotDraft",
                format!("workflow '{}' is {} and cannot be modified", self.name, self.status),
            ));
        }
        let step = WorkflowStep::new(name, plugin_id, order, configuration)?;
        let step_id = step.id();
        self.events.push(DomainEvent::WorkflowStepAdded {
            workflow_id: self.id,
            step_id,
            order,
            occurred_at: Utc::now(),
        });
        self.steps.push(step);
        self.touch();
        Ok(step_id)
    }

    /// Rename / re-describe; only Draft workflows are editable
    pub fn update_details(&mut self, name: Option<String>, description: Option<String>) -> Result<()> {
        if self.status != WorkflowStatus::Draft {
            return Err(DomainError::validation(
                "Workflow.NotDraft",
                format!("workflow '{}' is {} and cannot be modified", self.name, self.status),
            ));
        }
        if let Some(name) = name {
            self.name = Self::validate_name(name)?;
        }
        if let Some(description) = description {
            self.description = Self::validate_description(description)?;
        }
        self.events.push(DomainEvent::WorkflowUpdated {
            workflow_id: self.id,
            occurred_at: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    /// Draft -> Running; requires at least one step
    pub fn start(&mut self) -> Result<()> {
        if self.status != WorkflowStatus::Draft {
            return Err(DomainError::validation(
                "Workflow.NotDraft",
                format!("workflow '{}' is {}", self.name, self.status),
            ));
        }
        if self.steps.is_empty() {
            return Err(DomainError::validation(
                "Workflow.NoSteps",
                "workflow has no steps to execute",
            ));
        }
        self.status = WorkflowStatus::Running;
        self.started_at = Some(Utc::now());
        self.events.push(DomainEvent::WorkflowStarted {
            workflow_id: self.id,
            occurred_at: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    /// Running -> Completed; every non-skipped step must have completed
    pub fn complete(&mut self) -> Result<()> {
        if self.status != WorkflowStatus::Running {
            return Err(DomainError::validation(
                "Workflow.NotRunning",
                format!("workflow '{}' is {}", self.name, self.status),
            ));
        }
        if self
            .steps
            .iter()
            .any(|s| !matches!(s.status(), StepStatus::Completed | StepStatus::Skipped))
        {
            return Err(DomainError::validation(
                "Workflow.StepsIncomplete",
                "not all steps have completed",
            ));
        }
        self.status = WorkflowStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.events.push(DomainEvent::WorkflowCompleted {
            workflow_id: self.id,
            occurred_at: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    /// Running -> Failed
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        if self.status != WorkflowStatus::Running {
            return Err(DomainError::validation(
                "Workflow.NotRunning",
                format!("workflow '{}' is {}", self.name, self.status),
            ));
        }
        let message = message.into();
        self.status = WorkflowStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(message.clone());
        self.events.push(DomainEvent::WorkflowFailed {
            workflow_id: self.id,
            message,
            occurred_at: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    /// Running -> Paused
    pub fn pause(&mut self) -> Result<()> {
        if self.status != WorkflowStatus::Running {
            return Err(DomainError::validation(
                "Workflow.NotRunning",
                format!("workflow '{}' is {}", self.name, self.status),
            ));
        }
        self.status = WorkflowStatus::Paused;
        self.events.push(DomainEvent::WorkflowPaused {
            workflow_id: self.id,
            occurred_at: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    /// Paused -> Running
    pub fn resume(&mut self) -> Result<()> {
        if self.status != WorkflowStatus::Paused {
            return Err(DomainError::validation(
                "Workflow.NotPaused",
                format!("workflow '{}' is {}", self.name, self.status),
            ));
        }
        self.status = WorkflowStatus::Running;
        self.events.push(DomainEvent::WorkflowResumed {
            workflow_id: self.id,
            occurred_at: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    /// Any active status -> Cancelled
    pub fn cancel(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(DomainError::validation(
                "Workflow.AlreadyTerminal",
                format!("workflow '{}' is already {}", self.name, self.status),
            ));
        }
        self.status = WorkflowStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.events.push(DomainEvent::WorkflowCancelled {
            workflow_id: self.id,
            occurred_at: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    // ---- step transitions (owned by the aggregate) ----

    pub fn begin_step(&mut self, step_id: WorkflowStepId) -> Result<()> {
        self.step_mut(step_id)?.begin()?;
        self.touch();
        Ok(())
    }

    pub fn complete_step(&mut self, step_id: WorkflowStepId, output: Option<String>) -> Result<()> {
        self.step_mut(step_id)?.complete(output)?;
        self.touch();
        Ok(())
    }

    pub fn fail_step(&mut self, step_id: WorkflowStepId, message: impl Into<String>) -> Result<()> {
        self.step_mut(step_id)?.fail(message)?;
        self.touch();
        Ok(())
    }

    pub fn skip_step(&mut self, step_id: WorkflowStepId, reason: Option<String>) -> Result<()> {
        self.step_mut(step_id)?.skip(reason)?;
        self.touch();
        Ok(())
    }

    fn step_mut(&mut self, step_id: WorkflowStepId) -> Result<&mut WorkflowStep> {
        self.steps
            .iter_mut()
            .find(|s| s.id() == step_id)
            .ok_or_else(|| {
                DomainError::not_found(
                    "Workflow.StepNotFound",
                    format!("step {step_id} not part of this workflow"),
                )
            })
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    // ---- events ----

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        self.events.take()
    }

    pub fn clear_domain_events(&mut self) {
        self.events.clear();
    }
}
