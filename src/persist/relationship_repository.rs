use super::db_adapter::AggregateQuery;
use super::repository::AggregateRepository;
use super::session::Session;
use crate::common::ActionRequest;
use crate::core::{DomainError, RequestContext, Result, UserRole};
use crate::storage::Filter;
use crate::types::entity::TENANT_ID;
use crate::types::relationship::STATUS;
use crate::types::{Aggregate, BaseEnum, Entity, RelationshipStatus, make_relationship};
use serde_json::json;
use std::ops::Deref;

/// Repository for relationship aggregates, adding lookups by linked entity.
pub struct RelationshipRepository<A: Aggregate> {
    inner: AggregateRepository<A>,
}

impl<A: Aggregate> Clone for RelationshipRepository<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Aggregate> Deref for RelationshipRepository<A> {
    type Target = AggregateRepository<A>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<A: Aggregate> RelationshipRepository<A> {
    pub fn new(inner: AggregateRepository<A>) -> Self {
        Self { inner }
    }

    /// Relationships holding `id` in `column`, optionally in one status.
    pub async fn find_by_column(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        column: &str,
        id: &str,
        status: Option<RelationshipStatus>,
    ) -> Result<Vec<A>> {
        let mut filter = Filter::new().eq(column, id);
        if let Some(status) = status {
            filter = filter.eq(STATUS, status.value());
        }
        self.inner
            .load_where(session, context, AggregateQuery::new(filter))
            .await
    }

    /// Relationships that link `entity`, scoped to its tenant.
    pub async fn find_by_entity(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        entity: &Entity,
        status: Option<RelationshipStatus>,
    ) -> Result<Vec<A>> {
        let schema = A::schema()?;
        let related = schema
            .related_entities()
            .iter()
            .find(|r| r.entity_name == entity.entity_name())
            .ok_or_else(|| {
                DomainError::validation("Invalid entity given to relationship").with_extra(json!({
                    "entity_1": entity.entity_name(),
                    "relationship": schema.entity_name(),
                }))
            })?;

        let mut filter = Filter::new().eq(related.attribute.as_str(), entity.primary_value().clone());
        if let Some(status) = status {
            filter = filter.eq(STATUS, status.value());
        }
        if let Some(tenant) = entity.tenant_id() {
            filter = filter.eq(TENANT_ID, tenant);
        }
        self.inner
            .load_where(session, context, AggregateQuery::new(filter))
            .await
    }
}

/// Creates relationships and moves them through their workflow.
pub struct RelationshipService<A: Aggregate> {
    repository: RelationshipRepository<A>,
}

impl<A: Aggregate> RelationshipService<A> {
    pub fn new(repository: RelationshipRepository<A>) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &RelationshipRepository<A> {
        &self.repository
    }

    pub async fn create_relationship(
        &self,
        session: &dyn Session,
        first: &Entity,
        second: &Entity,
        status: RelationshipStatus,
    ) -> Result<A> {
        let mut relationship = A::from_entity(make_relationship(&A::schema()?, first, second, status)?)?;
        self.repository.save(session, &mut relationship).await?;
        Ok(relationship)
    }

    /// Links `first` to each of `others` as active relationships.
    pub async fn create_relationships(
        &self,
        session: &dyn Session,
        first: &Entity,
        others: &[Entity],
    ) -> Result<Vec<A>> {
        let schema = A::schema()?;
        let mut relationships = others
            .iter()
            .map(|other| {
                make_relationship(&schema, first, other, RelationshipStatus::Active)
                    .and_then(A::from_entity)
            })
            .collect::<Result<Vec<_>>>()?;
        self.repository.save_all(session, &mut relationships).await?;
        Ok(relationships)
    }

    /// Applies one action to every listed relationship.
    pub async fn update_relationship_status(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        ids: &[String],
        request: ActionRequest,
        user_roles: &[UserRole],
    ) -> Result<Vec<A>> {
        let mut relationships = self
            .repository
            .load_many(session, context, ids, true, false)
            .await?;
        for relationship in relationships.iter_mut() {
            relationship.entity_mut().act(request.clone(), user_roles)?;
        }
        self.repository
            .update_all(session, &mut relationships, false)
            .await?;
        Ok(relationships)
    }

    pub async fn find_all(
        &self,
        session: &dyn Session,
        context: &RequestContext,
        entity: &Entity,
        status: Option<RelationshipStatus>,
    ) -> Result<Vec<A>> {
        self.repository
            .find_by_entity(session, context, entity, status)
            .await
    }
}
