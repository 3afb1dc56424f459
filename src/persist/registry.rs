//! Explicit registration of entity schemas, record mappings, repositories and
//! services, done once at startup. Name collisions fail `build()`.

use super::db_adapter::DbAdapter;
use super::entity_map::{EntityMap, RecordMapping};
use crate::core::{DomainError, FrameworkConfig, Result};
use crate::types::{Aggregate, EntitySchema};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type Component = Arc<dyn Any + Send + Sync>;
type ComponentFactory = Box<dyn FnOnce(&Arc<DbAdapter>, &FrameworkConfig) -> Component>;

pub struct RegistryBuilder {
    config: FrameworkConfig,
    entities: Vec<(Result<Arc<EntitySchema>>, RecordMapping)>,
    components: Vec<(String, ComponentFactory)>,
}

impl RegistryBuilder {
    pub fn new(config: FrameworkConfig) -> Self {
        Self {
            config,
            entities: Vec::new(),
            components: Vec::new(),
        }
    }

    /// Registers an entity class and where its rows live.
    pub fn entity(mut self, schema: Arc<EntitySchema>, mapping: RecordMapping) -> Self {
        self.entities.push((Ok(schema), mapping));
        self
    }

    pub fn aggregate<A: Aggregate>(mut self, mapping: RecordMapping) -> Self {
        self.entities.push((A::schema(), mapping));
        self
    }

    /// Registers a repository built from the shared adapter.
    pub fn repository<R, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        R: Any + Send + Sync,
        F: FnOnce(Arc<DbAdapter>, &FrameworkConfig) -> R + 'static,
    {
        self.components.push((
            name.into(),
            Box::new(move |adapter: &Arc<DbAdapter>, config: &FrameworkConfig| {
                Arc::new(factory(Arc::clone(adapter), config)) as Component
            }),
        ));
        self
    }

    pub fn service<S: Any + Send + Sync>(mut self, name: impl Into<String>, service: S) -> Self {
        let service: Component = Arc::new(service);
        self.components.push((
            name.into(),
            Box::new(move |_: &Arc<DbAdapter>, _: &FrameworkConfig| service),
        ));
        self
    }

    pub fn build(self) -> Result<Registry> {
        let mut schemas: BTreeMap<String, Arc<EntitySchema>> = BTreeMap::new();
        let mut entity_names: BTreeMap<String, String> = BTreeMap::new();
        let mut entity_map = EntityMap::new();

        for (schema, mapping) in self.entities {
            let schema = schema?;
            let class_name = schema.class_name().to_string();
            if schemas.contains_key(&class_name) {
                return Err(DomainError::Configuration(format!(
                    "Entity class {} registered twice",
                    class_name
                )));
            }
            if let Some(owner) = entity_names.get(schema.entity_name()) {
                return Err(DomainError::Configuration(format!(
                    "Entity name {} is used by both {} and {}",
                    schema.entity_name(),
                    owner,
                    class_name
                )));
            }
            entity_names.insert(schema.entity_name().to_string(), class_name.clone());
            entity_map.insert(class_name.clone(), mapping);
            schemas.insert(class_name, schema);
        }

        for schema in schemas.values() {
            for (_, child) in schema.child_schemas() {
                if !entity_map.contains(child.class_name()) {
                    return Err(DomainError::Configuration(format!(
                        "{} owns {} which has no record mapping",
                        schema.class_name(),
                        child.class_name()
                    )));
                }
            }
        }

        let adapter = Arc::new(DbAdapter::new(Arc::new(entity_map)));
        let mut components = HashMap::new();
        for (name, factory) in self.components {
            if components.contains_key(&name) {
                return Err(DomainError::Configuration(format!(
                    "Component {} registered twice",
                    name
                )));
            }
            let component = factory(&adapter, &self.config);
            components.insert(name, component);
        }

        Ok(Registry {
            config: self.config,
            schemas,
            adapter,
            components,
        })
    }
}

/// Lookup table produced by [`RegistryBuilder::build`].
pub struct Registry {
    config: FrameworkConfig,
    schemas: BTreeMap<String, Arc<EntitySchema>>,
    adapter: Arc<DbAdapter>,
    components: HashMap<String, Component>,
}

impl Registry {
    pub fn builder(config: FrameworkConfig) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<DbAdapter> {
        &self.adapter
    }

    pub fn schema(&self, class_name: &str) -> Result<&Arc<EntitySchema>> {
        self.schemas.get(class_name).ok_or_else(|| {
            DomainError::Configuration(format!("Entity class {} is not registered", class_name))
        })
    }

    pub fn schemas(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.schemas.values()
    }

    pub fn repository<R: Any + Send + Sync>(&self, name: &str) -> Result<Arc<R>> {
        self.component(name)
    }

    pub fn service<S: Any + Send + Sync>(&self, name: &str) -> Result<Arc<S>> {
        self.component(name)
    }

    fn component<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        let component = self.components.get(name).ok_or_else(|| {
            DomainError::Configuration(format!("No component registered as {}", name))
        })?;
        Arc::clone(component).downcast::<T>().map_err(|_| {
            DomainError::Configuration(format!(
                "Component {} is not a {}",
                name,
                std::any::type_name::<T>()
            ))
        })
    }
}
