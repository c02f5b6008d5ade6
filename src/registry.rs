//! The immutable entity registry shared by every session.
//!
//! Built exactly once when the server is assembled, then only read: the
//! registry is the sole piece of shared state between sessions, and it is
//! shared behind an `Arc` for concurrent lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::{Action, ACTION_ENTITY_TYPE};
use crate::codec::TypeRegistry;
use crate::entity::{EventSourcedEntity, EVENT_SOURCED_ENTITY_TYPE};
use crate::error::RegistrationError;
use crate::function::{StatelessFunction, STATELESS_FUNCTION_ENTITY_TYPE};
use crate::proto;

/// Maps service names to entity definitions, one map per protocol variant,
/// plus the process-wide payload type registry merged from every entity.
pub struct EntityRegistry {
    event_sourced: HashMap<String, Arc<EventSourcedEntity>>,
    actions: HashMap<String, Arc<Action>>,
    functions: HashMap<String, Arc<StatelessFunction>>,
    types: TypeRegistry,
}

impl EntityRegistry {
    /// Assemble the registry from the registered entities.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::DuplicateService`] if two entities (of any
    /// protocol variant) share a service name.
    pub fn build(
        event_sourced: Vec<EventSourcedEntity>,
        actions: Vec<Action>,
        functions: Vec<StatelessFunction>,
    ) -> Result<Self, RegistrationError> {
        let mut registry = Self {
            event_sourced: HashMap::new(),
            actions: HashMap::new(),
            functions: HashMap::new(),
            types: TypeRegistry::new(),
        };
        let mut seen: Vec<String> = Vec::new();

        let mut claim = |seen: &mut Vec<String>, name: &str| {
            if seen.iter().any(|s| s == name) {
                Err(RegistrationError::DuplicateService(name.to_string()))
            } else {
                seen.push(name.to_string());
                Ok(())
            }
        };

        for entity in event_sourced {
            claim(&mut seen, entity.service_name())?;
            registry.types.merge(&entity.types);
            registry
                .event_sourced
                .insert(entity.service_name().to_string(), Arc::new(entity));
        }
        for action in actions {
            claim(&mut seen, action.service_name())?;
            registry.types.merge(action.types());
            registry
                .actions
                .insert(action.service_name().to_string(), Arc::new(action));
        }
        for function in functions {
            claim(&mut seen, function.service_name())?;
            registry.types.merge(function.types());
            registry
                .functions
                .insert(function.service_name().to_string(), Arc::new(function));
        }

        Ok(registry)
    }

    /// Look up an event-sourced entity by service name.
    pub fn event_sourced(&self, service_name: &str) -> Option<Arc<EventSourcedEntity>> {
        self.event_sourced.get(service_name).cloned()
    }

    /// Look up an action entity by service name.
    pub fn action(&self, service_name: &str) -> Option<Arc<Action>> {
        self.actions.get(service_name).cloned()
    }

    /// Look up a stateless function by service name.
    pub fn function(&self, service_name: &str) -> Option<Arc<StatelessFunction>> {
        self.functions.get(service_name).cloned()
    }

    /// The process-wide payload type registry.
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub(crate) fn has_event_sourced(&self) -> bool {
        !self.event_sourced.is_empty()
    }

    pub(crate) fn has_actions(&self) -> bool {
        !self.actions.is_empty()
    }

    pub(crate) fn has_functions(&self) -> bool {
        !self.functions.is_empty()
    }

    /// The per-entity descriptors announced to the proxy during discovery.
    pub(crate) fn discovery_entities(&self) -> Vec<proto::Entity> {
        let mut entities: Vec<proto::Entity> = Vec::new();
        for entity in self.event_sourced.values() {
            entities.push(proto::Entity {
                entity_type: EVENT_SOURCED_ENTITY_TYPE.to_string(),
                service_name: entity.service_name().to_string(),
                persistence_id: entity.persistence_id().to_string(),
            });
        }
        for action in self.actions.values() {
            entities.push(proto::Entity {
                entity_type: ACTION_ENTITY_TYPE.to_string(),
                service_name: action.service_name().to_string(),
                persistence_id: action.service_name().to_string(),
            });
        }
        for function in self.functions.values() {
            entities.push(proto::Entity {
                entity_type: STATELESS_FUNCTION_ENTITY_TYPE.to_string(),
                service_name: function.service_name().to_string(),
                persistence_id: function.service_name().to_string(),
            });
        }
        entities.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        entities
    }

    /// Serialized `FileDescriptorSet`s contributed by registered entities.
    pub(crate) fn descriptor_sets(&self) -> Vec<&[u8]> {
        let mut sets: Vec<&[u8]> = Vec::new();
        for entity in self.event_sourced.values() {
            if !entity.descriptor_set.is_empty() {
                sets.push(&entity.descriptor_set);
            }
        }
        for action in self.actions.values() {
            if !action.descriptor_set().is_empty() {
                sets.push(action.descriptor_set());
            }
        }
        for function in self.functions.values() {
            if !function.descriptor_set().is_empty() {
                sets.push(function.descriptor_set());
            }
        }
        sets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::test_fixtures::counter_entity;

    #[test]
    fn lookup_by_service_name() {
        let registry =
            EntityRegistry::build(vec![counter_entity(0)], Vec::new(), Vec::new()).unwrap();

        assert!(registry.event_sourced("test.counter.Counter").is_some());
        assert!(registry.event_sourced("test.counter.Missing").is_none());
        assert!(registry.has_event_sourced());
        assert!(!registry.has_actions());
    }

    #[test]
    fn duplicate_service_name_rejected() {
        let result = EntityRegistry::build(
            vec![counter_entity(0), counter_entity(5)],
            Vec::new(),
            Vec::new(),
        );
        assert!(matches!(
            result,
            Err(RegistrationError::DuplicateService(ref name)) if name == "test.counter.Counter"
        ));
    }

    #[test]
    fn types_are_merged_process_wide() {
        let registry =
            EntityRegistry::build(vec![counter_entity(0)], Vec::new(), Vec::new()).unwrap();
        assert!(registry.types().contains("test.counter.Increased"));
    }

    #[test]
    fn discovery_entities_describe_registrations() {
        let registry =
            EntityRegistry::build(vec![counter_entity(0)], Vec::new(), Vec::new()).unwrap();
        let entities = registry.discovery_entities();

        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity_type, EVENT_SOURCED_ENTITY_TYPE);
        assert_eq!(entities[0].service_name, "test.counter.Counter");
        assert_eq!(entities[0].persistence_id, "test.counter.Counter");
    }
}
