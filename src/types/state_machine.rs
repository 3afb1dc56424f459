use crate::core::context::{SUPER_ADMIN_ROLE_ID, SYSTEM_ROLE_ID};
use crate::core::{DomainError, Result, UserRole};
use crate::types::base_enum::BaseEnum;
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub trigger: String,
    pub source: Vec<String>,
    pub destination: String,
    pub authorised_user_roles: BTreeSet<String>,
    pub is_hidden: bool,
}

impl StateTransition {
    pub fn new<T: BaseEnum, S: BaseEnum>(trigger: T, source: &[S], destination: S) -> Self {
        Self {
            trigger: trigger.value().to_string(),
            source: source.iter().map(|s| s.value().to_string()).collect(),
            destination: destination.value().to_string(),
            authorised_user_roles: BTreeSet::new(),
            is_hidden: false,
        }
    }

    pub fn roles<I, R>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        self.authorised_user_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.is_hidden = true;
        self
    }

    pub fn applies_to(&self, state: &str) -> bool {
        self.source.iter().any(|s| s == state)
    }

    pub fn data(&self) -> serde_json::Value {
        serde_json::json!({
            "trigger": self.trigger,
            "source": self.source,
            "destination": self.destination,
            "is_hidden": self.is_hidden,
            "authorised_user_roles": self.authorised_user_roles,
        })
    }
}

/// Transitions over the values of one enum attribute (`state_key`).
#[derive(Debug, Clone)]
pub struct StateMachineDefinition {
    state_key: String,
    transitions: Vec<StateTransition>,
}

impl StateMachineDefinition {
    pub fn new(state_key: impl Into<String>) -> Self {
        Self {
            state_key: state_key.into(),
            transitions: Vec::new(),
        }
    }

    pub fn transition(mut self, transition: StateTransition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn state_key(&self) -> &str {
        &self.state_key
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Binds the definition to a current state.
    pub fn machine(&self, state: impl Into<String>) -> StateMachine<'_> {
        StateMachine {
            definition: self,
            state: state.into(),
        }
    }
}

pub struct StateMachine<'a> {
    definition: &'a StateMachineDefinition,
    state: String,
}

impl StateMachine<'_> {
    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn state_key(&self) -> &str {
        &self.definition.state_key
    }

    /// No declared roles means anyone may fire the trigger. The super admin and
    /// system roles always pass.
    pub fn is_authorised(&self, trigger: &str, user_roles: &[UserRole]) -> Result<bool> {
        let transition = self
            .definition
            .transitions
            .iter()
            .find(|t| t.trigger == trigger)
            .ok_or_else(|| {
                DomainError::validation(format!("Transition for state {} is not present.", trigger))
            })?;
        if transition.authorised_user_roles.is_empty() {
            return Ok(true);
        }
        if user_roles.is_empty() {
            return Ok(false);
        }
        if user_roles
            .iter()
            .any(|r| r.role_id == SUPER_ADMIN_ROLE_ID || r.role_id == SYSTEM_ROLE_ID)
        {
            return Ok(true);
        }
        Ok(user_roles
            .iter()
            .any(|r| transition.authorised_user_roles.contains(&r.role_id)))
    }

    /// Moves to the destination of `trigger`, failing with `InvalidState` when no
    /// transition leaves the current state on that trigger.
    pub fn fire(&mut self, trigger: &str) -> Result<&str> {
        let transition = self
            .definition
            .transitions
            .iter()
            .find(|t| t.trigger == trigger && t.applies_to(&self.state))
            .ok_or_else(|| {
                DomainError::InvalidState(format!(
                    "Can't trigger event {} from state {}!",
                    trigger, self.state
                ))
            })?;
        self.state = transition.destination.clone();
        Ok(&self.state)
    }

    /// Non-hidden transitions available from the current state.
    pub fn visible_transitions(&self) -> Vec<&StateTransition> {
        self.definition
            .transitions
            .iter()
            .filter(|t| !t.is_hidden && t.applies_to(&self.state))
            .collect()
    }
}
