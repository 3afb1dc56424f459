//! Explicit per-request context.
//!
//! Everything that would otherwise be ambient (tenant, acting user, currency) is
//! carried here and passed to factories and repositories.

use crate::core::config::FrameworkConfig;
use serde::{Deserialize, Serialize};

/// Role id that bypasses every transition guard.
pub const SUPER_ADMIN_ROLE_ID: &str = "super";

/// Role id used by background processes; bypasses transition guards.
pub const SYSTEM_ROLE_ID: &str = "SYSTEM";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRole {
    pub role_id: String,
}

impl UserRole {
    pub fn new(role_id: impl Into<String>) -> Self {
        Self {
            role_id: role_id.into(),
        }
    }

    pub fn super_admin() -> Self {
        Self::new(SUPER_ADMIN_ROLE_ID)
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_ROLE_ID)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub user_id: String,
    pub organisation_id: Option<String>,
    pub roles: Vec<UserRole>,
}

impl CurrentUser {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            organisation_id: None,
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: UserRole) -> Self {
        self.roles.push(role);
        self
    }

    pub fn with_organisation(mut self, organisation_id: impl Into<String>) -> Self {
        self.organisation_id = Some(organisation_id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    tenant_id: String,
    currency: String,
    user: Option<CurrentUser>,
    entity_set_id_parts: usize,
    id_suffix_length: usize,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        let config = FrameworkConfig::default();
        Self::from_config(&config).with_tenant(tenant_id)
    }

    pub fn from_config(config: &FrameworkConfig) -> Self {
        Self {
            tenant_id: config.default_tenant_id.clone(),
            currency: config.default_currency.clone(),
            user: None,
            entity_set_id_parts: config.entity_set_id_parts,
            id_suffix_length: config.id_suffix_length,
        }
    }

    /// Context for jobs and other work that runs without a caller.
    pub fn system(config: &FrameworkConfig) -> Self {
        Self::from_config(config)
            .with_user(CurrentUser::new(SYSTEM_ROLE_ID).with_role(UserRole::system()))
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into().to_ascii_uppercase();
        self
    }

    pub fn with_user(mut self, user: CurrentUser) -> Self {
        self.user = Some(user);
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn user(&self) -> Option<&CurrentUser> {
        self.user.as_ref()
    }

    pub fn user_roles(&self) -> &[UserRole] {
        self.user.as_ref().map(|u| u.roles.as_slice()).unwrap_or(&[])
    }

    pub fn entity_set_id_parts(&self) -> usize {
        self.entity_set_id_parts
    }

    pub fn id_suffix_length(&self) -> usize {
        self.id_suffix_length
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::from_config(&FrameworkConfig::default())
    }
}
