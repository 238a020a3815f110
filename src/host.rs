//! Seam to the broadcast-control host that embeds this module.
//!
//! The host renders config forms, shows the status indicator and lets users
//! bind actions, feedbacks and variables to buttons. This crate only describes
//! them; [ModuleHost] is how the descriptions and updates reach the host.

use std::collections::HashMap;

use serde::Serialize;

pub use crate::matrix::Choice;

/// Status shown by the host for this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Uninitialized,
    BadConfig,
    Connecting,
    Ok,
    ConnectionFailure,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Uninitialized => "uninitialized",
            InstanceStatus::BadConfig => "bad_config",
            InstanceStatus::Connecting => "connecting",
            InstanceStatus::Ok => "ok",
            InstanceStatus::ConnectionFailure => "connection_failure",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input rendered for an action or feedback option.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OptionField {
    Dropdown {
        id: String,
        label: String,
        choices: Vec<Choice>,
        default: Option<String>,
    },
    TextInput {
        id: String,
        label: String,
        default: String,
    },
}

impl OptionField {
    pub fn id(&self) -> &str {
        match self {
            OptionField::Dropdown { id, .. } | OptionField::TextInput { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionDefinition {
    pub id: String,
    pub name: String,
    pub options: Vec<OptionField>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackDefinition {
    pub id: String,
    pub name: String,
    pub kind: FeedbackKind,
    pub options: Vec<OptionField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableDefinition {
    pub id: String,
    pub name: String,
}

/// Option values the host passes when running an action or evaluating a feedback.
pub type OptionValues = HashMap<String, String>;

/// Calls from this module into the host runtime.
pub trait ModuleHost: Send + Sync {
    fn set_status(&self, status: InstanceStatus, message: Option<&str>);
    fn set_action_definitions(&self, actions: Vec<ActionDefinition>);
    fn set_feedback_definitions(&self, feedbacks: Vec<FeedbackDefinition>);
    fn set_variable_definitions(&self, variables: Vec<VariableDefinition>);
    fn set_variable_values(&self, values: HashMap<String, String>);
    /// Ask the host to re-evaluate the given feedbacks.
    fn check_feedbacks(&self, feedback_ids: &[&str]);
}

/// Host which only logs. Used by the demo binary and handy for embedding
/// without a UI.
pub struct LogHost;

impl ModuleHost for LogHost {
    fn set_status(&self, status: InstanceStatus, message: Option<&str>) {
        log::info!("status: {} {}", status, message.unwrap_or(""));
    }

    fn set_action_definitions(&self, actions: Vec<ActionDefinition>) {
        log::info!(
            "actions: {}",
            actions.iter().map(|a| a.id.as_str()).collect::<Vec<_>>().join(", ")
        );
    }

    fn set_feedback_definitions(&self, feedbacks: Vec<FeedbackDefinition>) {
        log::info!(
            "feedbacks: {}",
            feedbacks.iter().map(|f| f.id.as_str()).collect::<Vec<_>>().join(", ")
        );
    }

    fn set_variable_definitions(&self, variables: Vec<VariableDefinition>) {
        log::debug!("{} variables defined", variables.len());
    }

    fn set_variable_values(&self, values: HashMap<String, String>) {
        let mut values: Vec<_> = values.into_iter().collect();
        values.sort();
        for (k, v) in values {
            log::info!("  ${} = {}", k, v);
        }
    }

    fn check_feedbacks(&self, feedback_ids: &[&str]) {
        log::trace!("check feedbacks {:?}", feedback_ids);
    }
}
