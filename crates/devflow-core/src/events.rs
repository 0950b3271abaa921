// Domain events and the per-aggregate event queue
//
// Aggregates enqueue events as side effects of state transitions; the storage
// layer drains the queue after a successful commit and hands the events to the
// EventPublisher port. Events are never persisted with the aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{PluginId, WorkflowId, WorkflowStepId};

/// Everything that can happen to a DevFlow aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    PluginRegistered {
        plugin_id: PluginId,
        name: String,
        version: String,
        language: String,
        occurred_at: DateTime<Utc>,
    },
    PluginValidated {
        plugin_id: PluginId,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    PluginExecuted {
        plugin_id: PluginId,
        execution_count: i64,
        occurred_at: DateTime<Utc>,
    },
    PluginConfigurationUpdated {
        plugin_id: PluginId,
        occurred_at: DateTime<Utc>,
    },
    PluginDisabled {
        plugin_id: PluginId,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    PluginEnabled {
        plugin_id: PluginId,
        occurred_at: DateTime<Utc>,
    },
    PluginDependencyAdded {
        plugin_id: PluginId,
        dependency: String,
        dependency_type: String,
        occurred_at: DateTime<Utc>,
    },
    PluginDependencyRemoved {
        plugin_id: PluginId,
        dependency: String,
        dependency_type: String,
        occurred_at: DateTime<Utc>,
    },
    PluginDependenciesReplaced {
        plugin_id: PluginId,
        dependency_count: usize,
        occurred_at: DateTime<Utc>,
    },
    WorkflowCreated {
        workflow_id: WorkflowId,
        name: String,
        occurred_at: DateTime<Utc>,
    },
    WorkflowStarted {
        workflow_id: WorkflowId,
        occurred_at: DateTime<Utc>,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
        occurred_at: DateTime<Utc>,
    },
    WorkflowFailed {
        workflow_id: WorkflowId,
        message: String,
        occurred_at: DateTime<Utc>,
    },
    WorkflowPaused {
        workflow_id: WorkflowId,
        occurred_at: DateTime<Utc>,
    },
    WorkflowResumed {
        workflow_id: WorkflowId,
        occurred_at: DateTime<Utc>,
    },
    WorkflowCancelled {
        workflow_id: WorkflowId,
        occurred_at: DateTime<Utc>,
    },
    WorkflowUpdated {
        workflow_id: WorkflowId,
        occurred_at: DateTime<Utc>,
    },
    WorkflowStepAdded {
        workflow_id: WorkflowId,
        step_id: WorkflowStepId,
        order: i32,
        occurred_at: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Dotted event name used for routing and logging
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::PluginRegistered { .. } => "plugin.registered",
            DomainEvent::PluginValidated { .. } => "plugin.validated",
            DomainEvent::PluginExecuted { .. } => "plugin.executed",
            DomainEvent::PluginConfigurationUpdated { .. } => "plugin.configuration_updated",
            DomainEvent::PluginDisabled { .. } => "plugin.disabled",
            DomainEvent::PluginEnabled { .. } => "plugin.enabled",
            DomainEvent::PluginDependencyAdded { .. } => "plugin.dependency_added",
            DomainEvent::PluginDependencyRemoved { .. } => "plugin.dependency_removed",
            DomainEvent::PluginDependenciesReplaced { .. } => "plugin.dependencies_replaced",
            DomainEvent::WorkflowCreated { .. } => "workflow.created",
            DomainEvent::WorkflowStarted { .. } => "workflow.started",
            DomainEvent::WorkflowCompleted { .. } => "workflow.completed",
            DomainEvent::WorkflowFailed { .. } => "workflow.failed",
            DomainEvent::WorkflowPaused { .. } => "workflow.paused",
            DomainEvent::WorkflowResumed { .. } => "workflow.resumed",
            DomainEvent::WorkflowCancelled { .. } => "workflow.cancelled",
            DomainEvent::WorkflowUpdated { .. } => "workflow.updated",
            DomainEvent::WorkflowStepAdded { .. } => "workflow.step_added",
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Small FIFO of pending domain events, embedded in each aggregate
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    events: Vec<DomainEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: DomainEvent) {
        self.events.push(event);
    }

    /// Drain all queued events, preserving enqueue order
    pub fn take(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_and_json_shape() {
        let event = DomainEvent::PluginValidated {
            plugin_id: PluginId::new(),
            success: true,
            message: None,
            occurred_at: Utc::now(),
        };
        assert_eq!(event.event_type(), "plugin.validated");

        let json = event.to_json();
        assert_eq!(json["type"], "plugin_validated");
        assert_eq!(json["success"], true);
        assert!(json.get("message").is_none());
    }

    #[test]
    fn queue_drains_in_order() {
        let mut queue = EventQueue::new();
        let id = WorkflowId::new();
        queue.push(DomainEvent::WorkflowStarted {
            workflow_id: id,
            occurred_at: Utc::now(),
        });
        queue.push(DomainEvent::WorkflowCompleted {
            workflow_id: id,
            occurred_at: Utc::now(),
        });

        let drained = queue.take();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].event_type(), "workflow.started");
        assert_eq!(drained[1].event_type(), "workflow.completed");
        assert!(queue.is_empty());
    }
}
