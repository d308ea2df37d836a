//! Name-to-action resolution.
//!
//! Resolution order:
//! 1. exact match among registered actions;
//! 2. `@custom/<executorID>/<actionID>` (both numeric);
//! 3. `@operator/<name>` (combo operators running a sub-Dag);
//! 4. the configured trigger-operator prefix.
//!
//! The three families are served by optional handlers; a family without a
//! handler resolves like an unknown name.

use std::collections::HashMap;
use std::sync::Arc;

use super::Action;
use crate::vm::dispatch::DispatchError;

pub const CUSTOM_PREFIX: &str = "@custom/";
pub const OPERATOR_PREFIX: &str = "@operator/";

/// What a call name resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionTarget {
    Registered { name: String },
    Custom { executor_id: u64, action_id: u64 },
    Operator { name: String },
    TriggerOperator { name: String },
}

#[derive(Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
    custom: Option<Arc<dyn Action>>,
    operator: Option<Arc<dyn Action>>,
    trigger_operator: Option<Arc<dyn Action>>,
    trigger_operator_prefix: String,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new("@trigger/operator/")
    }
}

impl ActionRegistry {
    pub fn new(trigger_operator_prefix: impl Into<String>) -> Self {
        Self {
            actions: HashMap::new(),
            custom: None,
            operator: None,
            trigger_operator: None,
            trigger_operator_prefix: trigger_operator_prefix.into(),
        }
    }

    /// Register an action under an exact name, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, action: Arc<dyn Action>) -> &mut Self {
        self.actions.insert(name.into(), action);
        self
    }

    pub fn with_custom_handler(&mut self, handler: Arc<dyn Action>) -> &mut Self {
        self.custom = Some(handler);
        self
    }

    pub fn with_operator_handler(&mut self, handler: Arc<dyn Action>) -> &mut Self {
        self.operator = Some(handler);
        self
    }

    pub fn with_trigger_operator_handler(&mut self, handler: Arc<dyn Action>) -> &mut Self {
        self.trigger_operator = Some(handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Resolve a call name to its target and handler.
    pub fn resolve(&self, name: &str) -> Result<(ActionTarget, Arc<dyn Action>), DispatchError> {
        if let Some(action) = self.actions.get(name) {
            return Ok((
                ActionTarget::Registered {
                    name: name.to_string(),
                },
                action.clone(),
            ));
        }

        if name.starts_with(CUSTOM_PREFIX) {
            let target = parse_custom(name)?;
            let handler = self
                .custom
                .clone()
                .ok_or_else(|| DispatchError::NotFound(name.to_string()))?;
            return Ok((target, handler));
        }

        if let Some(rest) = name.strip_prefix(OPERATOR_PREFIX) {
            let handler = self
                .operator
                .clone()
                .ok_or_else(|| DispatchError::NotFound(name.to_string()))?;
            return Ok((
                ActionTarget::Operator {
                    name: rest.to_string(),
                },
                handler,
            ));
        }

        if !self.trigger_operator_prefix.is_empty() {
            if let Some(rest) = name.strip_prefix(self.trigger_operator_prefix.as_str()) {
                let handler = self
                    .trigger_operator
                    .clone()
                    .ok_or_else(|| DispatchError::NotFound(name.to_string()))?;
                return Ok((
                    ActionTarget::TriggerOperator {
                        name: rest.to_string(),
                    },
                    handler,
                ));
            }
        }

        Err(DispatchError::NotFound(name.to_string()))
    }
}

fn parse_custom(name: &str) -> Result<ActionTarget, DispatchError> {
    let invalid = || DispatchError::InvalidAction(name.to_string());
    let parts: Vec<&str> = name.split('/').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }
    let executor_id = parts[1].parse::<u64>().map_err(|_| invalid())?;
    let action_id = parts[2].parse::<u64>().map_err(|_| invalid())?;
    Ok(ActionTarget::Custom {
        executor_id,
        action_id,
    })
}
