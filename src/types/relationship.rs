//! Link aggregates between two other entities.
//!
//! A relationship schema carries `relationship_id`, a `status` driven by a fixed
//! review workflow, and one string attribute per related entity holding that
//! entity's primary id.

use crate::common::generate_id_with_prefix;
use crate::core::{DomainError, Result, Value};
use crate::types::base_enum::BaseEnum;
use crate::types::entity::{Entity, EntitySchema, EntitySchemaBuilder, TENANT_ID};
use crate::types::state_machine::{StateMachineDefinition, StateTransition};
use crate::types::type_info::FieldInfo;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const RELATIONSHIP_ID: &str = "relationship_id";
pub const STATUS: &str = "status";

crate::base_enum! {
    pub enum RelationshipStatus {
        Created = "created" ("Created"),
        InReview = "in_review" ("In Review"),
        Approved = "approved" ("Approved"),
        Rejected = "rejected" ("Rejected"),
        Active = "active" ("Active"),
        Deactivated = "deactivated" ("Deactivated"),
    }
}

crate::base_enum! {
    pub enum RelationshipAction {
        RaiseReview = "raise_review" ("Raise Review"),
        Approve = "approve" ("Approve"),
        Reject = "reject" ("Reject"),
        Activate = "activate" ("Activate"),
        Deactivate = "deactivate" ("Deactivate"),
    }
}

fn relationship_workflow() -> StateMachineDefinition {
    use RelationshipAction as A;
    use RelationshipStatus as S;
    StateMachineDefinition::new(STATUS)
        .transition(StateTransition::new(
            A::RaiseReview,
            &[S::Created, S::Rejected],
            S::InReview,
        ))
        .transition(StateTransition::new(A::Approve, &[S::InReview], S::Approved))
        .transition(StateTransition::new(
            A::Reject,
            &[S::Created, S::InReview],
            S::Rejected,
        ))
        .transition(StateTransition::new(
            A::Activate,
            &[S::Created, S::Approved],
            S::Active,
        ))
        .transition(StateTransition::new(
            A::Deactivate,
            &[S::Created, S::InReview, S::Approved, S::Rejected, S::Active],
            S::Deactivated,
        ))
}

/// Schema builder with the relationship attributes and workflow in place.
/// Declare the linked entities with [`EntitySchemaBuilder::related`].
pub fn relationship_schema(class_name: impl Into<String>) -> EntitySchemaBuilder {
    EntitySchema::builder(class_name)
        .field(FieldInfo::string(RELATIONSHIP_ID).primary_key())
        .field(
            FieldInfo::enumeration(STATUS, RelationshipStatus::enum_type())
                .default_value(RelationshipStatus::Active),
        )
        .state_machine(relationship_workflow())
}

/// Builds a relationship between two entities that `schema` declares as related.
///
/// Both entities must belong to the same tenant when either is multi-tenant.
pub fn make_relationship(
    schema: &Arc<EntitySchema>,
    first: &Entity,
    second: &Entity,
    status: RelationshipStatus,
) -> Result<Entity> {
    let mapped = |entity: &Entity| {
        schema
            .related_entities()
            .iter()
            .any(|r| r.entity_name == entity.entity_name())
    };
    if !mapped(first) || !mapped(second) {
        return Err(
            DomainError::validation("Invalid entity given to relationship").with_extra(json!({
                "entity_1": first.class_name(),
                "entity_2": second.class_name(),
                "relationship": schema.class_name(),
            })),
        );
    }
    let tenant = match (first.tenant_id(), second.tenant_id()) {
        (None, None) => None,
        (a, b) if a == b => a,
        _ => {
            return Err(DomainError::validation(
                "Both entity to be create relationship with should have same tenant.",
            ));
        }
    };

    let context = first.context();
    let mut kwargs = BTreeMap::new();
    kwargs.insert(
        RELATIONSHIP_ID.to_string(),
        Value::Text(generate_id_with_prefix(
            "REL",
            None,
            context.id_suffix_length(),
        )),
    );
    kwargs.insert(STATUS.to_string(), status.to_value());
    if let Some(tenant) = tenant.filter(|_| schema.is_multi_tenant()) {
        kwargs.insert(TENANT_ID.to_string(), Value::Text(tenant.to_string()));
    }
    for entity in [first, second] {
        kwargs.insert(entity.primary_key().to_string(), entity.primary_value().clone());
    }
    Entity::new(schema, kwargs, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use crate::common::ActionRequest;
    use crate::core::{RequestContext, UserRole};

    fn user_schema() -> Arc<EntitySchema> {
        EntitySchema::builder("UserAggregate")
            .multi_tenant()
            .field(FieldInfo::string("user_id").primary_key())
            .build()
            .unwrap()
    }

    fn group_schema() -> Arc<EntitySchema> {
        EntitySchema::builder("GroupAggregate")
            .multi_tenant()
            .field(FieldInfo::string("group_id").primary_key())
            .build()
            .unwrap()
    }

    fn membership_schema() -> Arc<EntitySchema> {
        relationship_schema("MembershipAggregate")
            .multi_tenant()
            .related(&user_schema())
            .related(&group_schema())
            .build()
            .unwrap()
    }

    fn user(tenant: &str) -> Entity {
        Entity::new(
            &user_schema(),
            attrs! { "user_id" => "U1" },
            &RequestContext::new(tenant),
        )
        .unwrap()
    }

    fn group(tenant: &str) -> Entity {
        Entity::new(
            &group_schema(),
            attrs! { "group_id" => "G1" },
            &RequestContext::new(tenant),
        )
        .unwrap()
    }

    #[test]
    fn test_make_relationship_links_both_ids() {
        let rel = make_relationship(
            &membership_schema(),
            &user("T1"),
            &group("T1"),
            RelationshipStatus::Created,
        )
        .unwrap();
        assert!(rel.primary_id().starts_with("REL-"));
        assert_eq!(rel.get_str("user_id"), Some("U1"));
        assert_eq!(rel.get_str("group_id"), Some("G1"));
        assert_eq!(rel.tenant_id(), Some("T1"));
        assert_eq!(rel.get_str(STATUS), Some("created"));
    }

    #[test]
    fn test_tenant_mismatch_rejected() {
        let err = make_relationship(
            &membership_schema(),
            &user("T1"),
            &group("T2"),
            RelationshipStatus::Active,
        )
        .unwrap_err();
        assert!(err.to_string().contains("same tenant"));
    }

    #[test]
    fn test_unmapped_entity_rejected() {
        let other = EntitySchema::builder("InvoiceAggregate")
            .field(FieldInfo::string("invoice_id").primary_key())
            .build()
            .unwrap();
        let invoice = Entity::new(
            &other,
            attrs! { "invoice_id" => "I1" },
            &RequestContext::default(),
        )
        .unwrap();
        let err = make_relationship(
            &membership_schema(),
            &user("SUP"),
            &invoice,
            RelationshipStatus::Active,
        )
        .unwrap_err();
        match err {
            DomainError::Validation { extra_payload, .. } => {
                assert_eq!(extra_payload.unwrap()["entity_2"], "InvoiceAggregate");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_review_workflow() {
        let mut rel = make_relationship(
            &membership_schema(),
            &user("T1"),
            &group("T1"),
            RelationshipStatus::Created,
        )
        .unwrap();
        let roles = [UserRole::new("member")];
        rel.act(ActionRequest::new(RelationshipAction::RaiseReview), &roles)
            .unwrap();
        rel.act(ActionRequest::new(RelationshipAction::Approve), &roles)
            .unwrap();
        rel.act(ActionRequest::new(RelationshipAction::Activate), &roles)
            .unwrap();
        assert_eq!(
            rel.get_enum::<RelationshipStatus>(STATUS).unwrap(),
            RelationshipStatus::Active
        );
        assert!(rel
            .act(ActionRequest::new(RelationshipAction::Approve), &roles)
            .is_err());
        rel.act(ActionRequest::new(RelationshipAction::Deactivate), &roles)
            .unwrap();
        assert_eq!(rel.get_str(STATUS), Some("deactivated"));
    }
}
