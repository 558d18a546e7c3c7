//! # Per-message dispatcher routing tables.
//!
//! The topology tracks which endpoints exist, which messages are defined for
//! which endpoints, and which dispatchers are registered where. Registrations
//! are keyed per message and endpoint by a [`RoutingKey`]: either the
//! wildcard (no entity) or one specific entity.
//!
//! ## Diagram
//! ```text
//!   Topology
//!     ├── endpoints: [EndpointId, ...]          (definition order)
//!     └── messages:  [MessageRegistry, ...]     (definition order)
//!           └── endpoints: [EndpointRoutes, ...]
//!                 └── routes: [(RoutingKey, [DispatchCore, ...]), ...]
//! ```
//!
//! ## Rules
//! - Events match the wildcard key plus the exact entity key when the
//!   trigger carries an entity.
//! - Requests with an entity match only that entity key; without an entity
//!   they match every key.
//! - Within one key the same dispatcher is delivered to at most once per
//!   send; across keys it receives one delivery per matched key.
//! - Delivery order is produced here as registration order; the bus sorts
//!   by descending priority before dispatching.

use std::sync::Arc;

use crate::bus::id::{EndpointId, MessageId};
use crate::bus::state::{DispatcherState, EndpointState};
use crate::dispatch::DispatchCore;
use crate::error::BusError;

/// Registration key under one (message, endpoint) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RoutingKey {
    /// Matches regardless of entity.
    Wildcard,
    /// Matches one specific entity.
    Entity(Arc<str>),
}

impl RoutingKey {
    fn entity(&self) -> Option<&Arc<str>> {
        match self {
            RoutingKey::Wildcard => None,
            RoutingKey::Entity(entity) => Some(entity),
        }
    }

    /// Whether a deregistration entity filter selects this key.
    /// An empty filter selects every key; a non-empty filter never
    /// selects the wildcard.
    fn selected_by(&self, entities: &[Arc<str>]) -> bool {
        if entities.is_empty() {
            return true;
        }
        match self {
            RoutingKey::Wildcard => false,
            RoutingKey::Entity(entity) => entities.contains(entity),
        }
    }
}

/// One dispatcher delivery produced by target collection.
pub(crate) struct Delivery {
    pub(crate) core: Arc<DispatchCore>,
    pub(crate) entity: Option<Arc<str>>,
}

/// Routes registered on one endpoint of one message.
struct EndpointRoutes {
    endpoint: EndpointId,
    routes: Vec<(RoutingKey, Vec<Arc<DispatchCore>>)>,
}

impl EndpointRoutes {
    fn new(endpoint: EndpointId) -> Self {
        EndpointRoutes {
            endpoint,
            routes: Vec::new(),
        }
    }

    fn route_mut(&mut self, key: RoutingKey) -> &mut Vec<Arc<DispatchCore>> {
        let pos = match self.routes.iter().position(|(k, _)| *k == key) {
            Some(pos) => pos,
            None => {
                self.routes.push((key, Vec::new()));
                self.routes.len() - 1
            }
        };
        &mut self.routes[pos].1
    }

    fn add(&mut self, core: &Arc<DispatchCore>, entities: &[Arc<str>]) {
        if entities.is_empty() {
            self.route_mut(RoutingKey::Wildcard).push(Arc::clone(core));
        } else {
            for entity in entities {
                self.route_mut(RoutingKey::Entity(Arc::clone(entity)))
                    .push(Arc::clone(core));
            }
        }
    }

    /// Removes the first occurrence of `core` from every key the entity
    /// filter selects. Returns how many occurrences were removed.
    fn remove(&mut self, core: &Arc<DispatchCore>, entities: &[Arc<str>]) -> usize {
        let mut removed = 0;
        for (key, dispatchers) in &mut self.routes {
            if !key.selected_by(entities) {
                continue;
            }
            if let Some(pos) = dispatchers.iter().position(|c| Arc::ptr_eq(c, core)) {
                dispatchers.remove(pos);
                removed += 1;
            }
        }
        removed
    }

    fn remove_everywhere(&mut self, core: &Arc<DispatchCore>) -> usize {
        let mut removed = 0;
        for (_, dispatchers) in &mut self.routes {
            let before = dispatchers.len();
            dispatchers.retain(|c| !Arc::ptr_eq(c, core));
            removed += before - dispatchers.len();
        }
        removed
    }

    fn contains(&self, core: &Arc<DispatchCore>) -> bool {
        self.routes
            .iter()
            .any(|(_, dispatchers)| dispatchers.iter().any(|c| Arc::ptr_eq(c, core)))
    }

    fn collect_distinct(&self, out: &mut Vec<Arc<DispatchCore>>) {
        for (_, dispatchers) in &self.routes {
            for core in dispatchers {
                if !out.iter().any(|c| Arc::ptr_eq(c, core)) {
                    out.push(Arc::clone(core));
                }
            }
        }
    }
}

/// Everything registered for one message.
struct MessageRegistry {
    message: MessageId,
    endpoints: Vec<EndpointRoutes>,
}

impl MessageRegistry {
    fn new(message: MessageId) -> Self {
        MessageRegistry {
            message,
            endpoints: Vec::new(),
        }
    }

    fn endpoint_routes(&self, endpoint: &EndpointId) -> Option<&EndpointRoutes> {
        self.endpoints
            .iter()
            .find(|routes| routes.endpoint == *endpoint)
    }

    fn define_endpoint(&mut self, endpoint: &EndpointId) -> Result<(), BusError> {
        if self.endpoint_routes(endpoint).is_some() {
            return Err(BusError::EndpointAlreadyDefined {
                endpoint: Arc::clone(endpoint.name()),
                message: Some(Arc::clone(self.message.name())),
            });
        }
        self.endpoints.push(EndpointRoutes::new(endpoint.clone()));
        Ok(())
    }

    fn register(
        &mut self,
        core: &Arc<DispatchCore>,
        endpoints: &[EndpointId],
        entities: &[Arc<str>],
    ) -> Result<(), BusError> {
        for endpoint in endpoints {
            if self.endpoint_routes(endpoint).is_none() {
                return Err(BusError::NoSuchEndpoint {
                    endpoint: Arc::clone(endpoint.name()),
                    message: Some(Arc::clone(self.message.name())),
                });
            }
        }
        for routes in &mut self.endpoints {
            if endpoints.is_empty() || endpoints.contains(&routes.endpoint) {
                routes.add(core, entities);
            }
        }
        Ok(())
    }

    fn deregister(
        &mut self,
        core: &Arc<DispatchCore>,
        endpoints: &[EndpointId],
        entities: &[Arc<str>],
    ) -> Result<(), BusError> {
        let mut removed = 0;
        for routes in &mut self.endpoints {
            if endpoints.is_empty() || endpoints.contains(&routes.endpoint) {
                removed += routes.remove(core, entities);
            }
        }
        if removed == 0 {
            return Err(BusError::NoSuchDispatcher {
                dispatcher: core.name_arc(),
            });
        }
        Ok(())
    }
}

/// The whole bus topology. Guarded by the bus lock; every method here is
/// synchronous and never blocks.
#[derive(Default)]
pub(crate) struct Topology {
    endpoints: Vec<EndpointId>,
    messages: Vec<MessageRegistry>,
}

impl Topology {
    fn registry(&self, message: &MessageId) -> Option<&MessageRegistry> {
        self.messages
            .iter()
            .find(|registry| registry.message == *message)
    }

    fn registry_mut(&mut self, message: &MessageId) -> Option<&mut MessageRegistry> {
        self.messages
            .iter_mut()
            .find(|registry| registry.message == *message)
    }

    pub(crate) fn is_endpoint_defined(&self, endpoint: &EndpointId) -> bool {
        self.endpoints.contains(endpoint)
    }

    pub(crate) fn is_message_defined_for_endpoint(
        &self,
        message: &MessageId,
        endpoint: &EndpointId,
    ) -> bool {
        self.registry(message)
            .is_some_and(|registry| registry.endpoint_routes(endpoint).is_some())
    }

    pub(crate) fn define_endpoint(&mut self, endpoint: &EndpointId) -> Result<(), BusError> {
        if self.is_endpoint_defined(endpoint) {
            return Err(BusError::EndpointAlreadyDefined {
                endpoint: Arc::clone(endpoint.name()),
                message: None,
            });
        }
        self.endpoints.push(endpoint.clone());
        Ok(())
    }

    pub(crate) fn define_message(
        &mut self,
        message: &MessageId,
        endpoint: &EndpointId,
    ) -> Result<(), BusError> {
        if !self.is_endpoint_defined(endpoint) {
            return Err(BusError::NoSuchEndpoint {
                endpoint: Arc::clone(endpoint.name()),
                message: Some(Arc::clone(message.name())),
            });
        }
        if let Some(registry) = self.registry_mut(message) {
            return registry.define_endpoint(endpoint);
        }
        let mut registry = MessageRegistry::new(message.clone());
        registry.define_endpoint(endpoint)?;
        self.messages.push(registry);
        Ok(())
    }

    pub(crate) fn register(
        &mut self,
        core: &Arc<DispatchCore>,
        messages: &[MessageId],
        endpoints: &[EndpointId],
        entities: &[Arc<str>],
    ) -> Result<(), BusError> {
        for message in messages {
            match self.registry_mut(message) {
                Some(registry) => registry.register(core, endpoints, entities)?,
                None => {
                    return Err(BusError::NoSuchMessage {
                        message: Arc::clone(message.name()),
                    })
                }
            }
        }
        Ok(())
    }

    /// Deregisters matching registrations. An empty message list means
    /// every message the dispatcher is registered for.
    ///
    /// Returns whether the dispatcher still has registrations left.
    pub(crate) fn deregister(
        &mut self,
        core: &Arc<DispatchCore>,
        messages: &[MessageId],
        endpoints: &[EndpointId],
        entities: &[Arc<str>],
    ) -> Result<bool, BusError> {
        if messages.is_empty() {
            let mut deregistered = false;
            for registry in &mut self.messages {
                if registry.deregister(core, endpoints, entities).is_ok() {
                    deregistered = true;
                }
            }
            if !deregistered {
                return Err(BusError::NoSuchDispatcher {
                    dispatcher: core.name_arc(),
                });
            }
        } else {
            for message in messages {
                match self.registry_mut(message) {
                    Some(registry) => registry.deregister(core, endpoints, entities)?,
                    None => {
                        return Err(BusError::NoSuchMessage {
                            message: Arc::clone(message.name()),
                        })
                    }
                }
            }
        }
        Ok(self.still_registered(core))
    }

    /// Strips every registration of `core`. Returns whether any existed.
    pub(crate) fn remove_everywhere(&mut self, core: &Arc<DispatchCore>) -> bool {
        let mut removed = 0;
        for registry in &mut self.messages {
            for routes in &mut registry.endpoints {
                removed += routes.remove_everywhere(core);
            }
        }
        removed > 0
    }

    pub(crate) fn still_registered(&self, core: &Arc<DispatchCore>) -> bool {
        self.messages.iter().any(|registry| {
            registry
                .endpoints
                .iter()
                .any(|routes| routes.contains(core))
        })
    }

    /// Deliveries for an event: wildcard registrations on the sender
    /// endpoint, plus exact-entity registrations when the trigger carries
    /// an entity. A sender endpoint the message is not defined for yields
    /// no deliveries.
    pub(crate) fn collect_event_targets(
        &self,
        message: &MessageId,
        sender: &EndpointId,
        entity: Option<&Arc<str>>,
    ) -> Result<Vec<Delivery>, BusError> {
        let registry = self.registry(message).ok_or_else(|| BusError::NoSuchMessage {
            message: Arc::clone(message.name()),
        })?;
        let mut out = Vec::new();
        for routes in &registry.endpoints {
            if routes.endpoint != *sender {
                continue;
            }
            for (key, dispatchers) in &routes.routes {
                let matched = match key {
                    RoutingKey::Wildcard => true,
                    RoutingKey::Entity(key_entity) => entity.is_some_and(|e| e == key_entity),
                };
                if matched {
                    push_key_deliveries(&mut out, dispatchers, entity.cloned().or_else(|| key.entity().cloned()));
                }
            }
        }
        Ok(out)
    }

    /// Deliveries for a request: the addressed endpoint (or all endpoints),
    /// the exact entity key (or all keys). Unknown messages and unmatched
    /// receivers yield no deliveries rather than an error.
    pub(crate) fn collect_request_targets(
        &self,
        message: &MessageId,
        receiver: Option<&EndpointId>,
        entity: Option<&Arc<str>>,
    ) -> Vec<Delivery> {
        let Some(registry) = self.registry(message) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for routes in &registry.endpoints {
            if receiver.is_some_and(|r| *r != routes.endpoint) {
                continue;
            }
            for (key, dispatchers) in &routes.routes {
                let matched = match entity {
                    Some(e) => matches!(key, RoutingKey::Entity(key_entity) if key_entity == e),
                    None => true,
                };
                if matched {
                    push_key_deliveries(&mut out, dispatchers, entity.cloned().or_else(|| key.entity().cloned()));
                }
            }
        }
        out
    }

    /// Whether any dispatcher is registered for (message, endpoint, entity).
    /// `None` checks the wildcard key only.
    pub(crate) fn has_registered(
        &self,
        message: &MessageId,
        endpoint: &EndpointId,
        entity: Option<&Arc<str>>,
    ) -> bool {
        let Some(registry) = self.registry(message) else {
            return false;
        };
        let Some(routes) = registry.endpoint_routes(endpoint) else {
            return false;
        };
        routes.routes.iter().any(|(key, dispatchers)| {
            let matched = match (key, entity) {
                (RoutingKey::Wildcard, None) => true,
                (RoutingKey::Entity(key_entity), Some(e)) => key_entity == e,
                _ => false,
            };
            matched && !dispatchers.is_empty()
        })
    }

    pub(crate) fn endpoint_state(&self, endpoint: &EndpointId) -> Result<EndpointState, BusError> {
        if !self.is_endpoint_defined(endpoint) {
            return Err(BusError::NoSuchEndpoint {
                endpoint: Arc::clone(endpoint.name()),
                message: None,
            });
        }
        let mut cores: Vec<Arc<DispatchCore>> = Vec::new();
        for registry in &self.messages {
            if let Some(routes) = registry.endpoint_routes(endpoint) {
                routes.collect_distinct(&mut cores);
            }
        }
        Ok(EndpointState {
            endpoint: endpoint.clone(),
            dispatchers: cores
                .iter()
                .map(|core| DispatcherState {
                    dispatcher: core.name_arc(),
                    active_count: core.active_count(),
                    queue_count: core.queue_count(),
                })
                .collect(),
        })
    }

    pub(crate) fn endpoint_states(
        &self,
        endpoint: Option<&EndpointId>,
    ) -> Result<Vec<EndpointState>, BusError> {
        match endpoint {
            Some(endpoint) => Ok(vec![self.endpoint_state(endpoint)?]),
            None => self
                .endpoints
                .iter()
                .map(|endpoint| self.endpoint_state(endpoint))
                .collect(),
        }
    }

    pub(crate) fn defined_messages_and_endpoints(&self) -> Vec<(MessageId, Vec<EndpointId>)> {
        self.messages
            .iter()
            .map(|registry| {
                (
                    registry.message.clone(),
                    registry
                        .endpoints
                        .iter()
                        .map(|routes| routes.endpoint.clone())
                        .collect(),
                )
            })
            .collect()
    }

    pub(crate) fn defined_endpoints_and_messages(&self) -> Vec<(EndpointId, Vec<MessageId>)> {
        self.endpoints
            .iter()
            .map(|endpoint| {
                (
                    endpoint.clone(),
                    self.messages
                        .iter()
                        .filter(|registry| registry.endpoint_routes(endpoint).is_some())
                        .map(|registry| registry.message.clone())
                        .collect(),
                )
            })
            .collect()
    }
}

/// Appends one delivery per distinct dispatcher under a single key.
fn push_key_deliveries(
    out: &mut Vec<Delivery>,
    dispatchers: &[Arc<DispatchCore>],
    entity: Option<Arc<str>>,
) {
    let mut seen: Vec<&Arc<DispatchCore>> = Vec::new();
    for core in dispatchers {
        if seen.iter().any(|c| Arc::ptr_eq(c, core)) {
            continue;
        }
        seen.push(core);
        out.push(Delivery {
            core: Arc::clone(core),
            entity: entity.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchStrategy, HandlerFn};

    fn test_core(name: &str) -> Arc<DispatchCore> {
        DispatchCore::new(
            name,
            DispatchStrategy::Callback,
            HandlerFn::arc(name.to_string(), |_message| async { Ok(None) }),
            0,
        )
    }

    fn topology_with(message: &MessageId, endpoint: &EndpointId) -> Topology {
        let mut topology = Topology::default();
        topology.define_endpoint(endpoint).unwrap();
        topology.define_message(message, endpoint).unwrap();
        topology
    }

    #[test]
    fn test_define_message_rejects_duplicate_pair() {
        let message = MessageId::new("PING", "ping");
        let endpoint = EndpointId::new("sut", "sut");
        let mut topology = topology_with(&message, &endpoint);

        let err = topology.define_message(&message, &endpoint).unwrap_err();
        assert!(matches!(err, BusError::EndpointAlreadyDefined { .. }));
        assert_eq!(
            err.to_string(),
            "endpoint 'sut' already defined for message 'PING'"
        );
    }

    #[test]
    fn test_event_targets_match_wildcard_and_exact_entity() {
        let message = MessageId::new("PING", "ping");
        let endpoint = EndpointId::new("sut", "sut");
        let mut topology = topology_with(&message, &endpoint);

        let wildcard = test_core("wildcard");
        let for_db: Arc<str> = "db".into();
        let entity_bound = test_core("entity");
        topology
            .register(&wildcard, &[message.clone()], &[], &[])
            .unwrap();
        topology
            .register(&entity_bound, &[message.clone()], &[], &[for_db.clone()])
            .unwrap();

        // No entity: wildcard only, delivery entity stays None.
        let targets = topology
            .collect_event_targets(&message, &endpoint, None)
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert!(Arc::ptr_eq(&targets[0].core, &wildcard));
        assert!(targets[0].entity.is_none());

        // With entity: wildcard and the exact key, both tagged with it.
        let targets = topology
            .collect_event_targets(&message, &endpoint, Some(&for_db))
            .unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.entity.as_deref() == Some("db")));
    }

    #[test]
    fn test_request_targets_entity_excludes_wildcard() {
        let message = MessageId::new("REQ", "req");
        let endpoint = EndpointId::new("sut", "sut");
        let mut topology = topology_with(&message, &endpoint);

        let wildcard = test_core("wildcard");
        let for_db: Arc<str> = "db".into();
        let entity_bound = test_core("entity");
        topology
            .register(&wildcard, &[message.clone()], &[], &[])
            .unwrap();
        topology
            .register(&entity_bound, &[message.clone()], &[], &[for_db.clone()])
            .unwrap();

        let targets = topology.collect_request_targets(&message, None, Some(&for_db));
        assert_eq!(targets.len(), 1);
        assert!(Arc::ptr_eq(&targets[0].core, &entity_bound));

        // No entity: every key; wildcard delivery keeps entity None, the
        // entity-bound one carries its registration entity.
        let targets = topology.collect_request_targets(&message, None, None);
        assert_eq!(targets.len(), 2);
        assert!(targets
            .iter()
            .any(|t| Arc::ptr_eq(&t.core, &wildcard) && t.entity.is_none()));
        assert!(targets
            .iter()
            .any(|t| Arc::ptr_eq(&t.core, &entity_bound) && t.entity.as_deref() == Some("db")));
    }

    #[test]
    fn test_request_targets_unknown_message_is_empty() {
        let topology = Topology::default();
        let message = MessageId::new("REQ", "req");
        assert!(topology
            .collect_request_targets(&message, None, None)
            .is_empty());
    }

    #[test]
    fn test_duplicate_registration_same_key_delivers_once() {
        let message = MessageId::new("PING", "ping");
        let endpoint = EndpointId::new("sut", "sut");
        let mut topology = topology_with(&message, &endpoint);

        let core = test_core("dup");
        topology.register(&core, &[message.clone()], &[], &[]).unwrap();
        topology.register(&core, &[message.clone()], &[], &[]).unwrap();

        let targets = topology
            .collect_event_targets(&message, &endpoint, None)
            .unwrap();
        assert_eq!(targets.len(), 1, "same key must deliver once");

        // One deregistration still leaves the second bookkeeping entry.
        assert!(topology.deregister(&core, &[message.clone()], &[], &[]).unwrap());
        assert!(!topology.deregister(&core, &[message.clone()], &[], &[]).unwrap());
    }

    #[test]
    fn test_deregister_honors_endpoint_filter() {
        let message = MessageId::new("PING", "ping");
        let first = EndpointId::new("first", "first");
        let second = EndpointId::new("second", "second");
        let mut topology = Topology::default();
        topology.define_endpoint(&first).unwrap();
        topology.define_endpoint(&second).unwrap();
        topology.define_message(&message, &first).unwrap();
        topology.define_message(&message, &second).unwrap();

        let core = test_core("filtered");
        topology.register(&core, &[message.clone()], &[], &[]).unwrap();

        let still = topology
            .deregister(&core, &[message.clone()], &[first.clone()], &[])
            .unwrap();
        assert!(still, "registration on the second endpoint must survive");

        let targets = topology
            .collect_event_targets(&message, &first, None)
            .unwrap();
        assert!(targets.is_empty());
        let targets = topology
            .collect_event_targets(&message, &second, None)
            .unwrap();
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn test_deregister_unknown_dispatcher_errors() {
        let message = MessageId::new("PING", "ping");
        let endpoint = EndpointId::new("sut", "sut");
        let mut topology = topology_with(&message, &endpoint);

        let core = test_core("ghost");
        let err = topology
            .deregister(&core, &[message.clone()], &[], &[])
            .unwrap_err();
        assert!(matches!(err, BusError::NoSuchDispatcher { .. }));

        // All-messages sweep on an empty topology reports the same.
        let err = topology.deregister(&core, &[], &[], &[]).unwrap_err();
        assert!(matches!(err, BusError::NoSuchDispatcher { .. }));
    }

    #[test]
    fn test_entity_filtered_deregister_keeps_wildcard() {
        let message = MessageId::new("PING", "ping");
        let endpoint = EndpointId::new("sut", "sut");
        let mut topology = topology_with(&message, &endpoint);

        let for_db: Arc<str> = "db".into();
        let core = test_core("mixed");
        topology.register(&core, &[message.clone()], &[], &[]).unwrap();
        topology
            .register(&core, &[message.clone()], &[], &[for_db.clone()])
            .unwrap();

        let still = topology
            .deregister(&core, &[message.clone()], &[], &[for_db.clone()])
            .unwrap();
        assert!(still, "wildcard registration must survive an entity filter");
        assert!(topology.has_registered(&message, &endpoint, None));
        assert!(!topology.has_registered(&message, &endpoint, Some(&for_db)));
    }

    #[test]
    fn test_has_registered_matrix() {
        let message = MessageId::new("PING", "ping");
        let endpoint = EndpointId::new("sut", "sut");
        let other = MessageId::new("OTHER", "other");
        let mut topology = topology_with(&message, &endpoint);

        let for_db: Arc<str> = "db".into();
        let core = test_core("entity-only");
        topology
            .register(&core, &[message.clone()], &[], &[for_db.clone()])
            .unwrap();

        assert!(topology.has_registered(&message, &endpoint, Some(&for_db)));
        // Wildcard probe does not see entity registrations.
        assert!(!topology.has_registered(&message, &endpoint, None));
        assert!(!topology.has_registered(&other, &endpoint, None));
    }

    #[test]
    fn test_remove_everywhere_strips_all_keys() {
        let message = MessageId::new("PING", "ping");
        let endpoint = EndpointId::new("sut", "sut");
        let mut topology = topology_with(&message, &endpoint);

        let for_db: Arc<str> = "db".into();
        let core = test_core("everywhere");
        topology.register(&core, &[message.clone()], &[], &[]).unwrap();
        topology.register(&core, &[message.clone()], &[], &[]).unwrap();
        topology
            .register(&core, &[message.clone()], &[], &[for_db.clone()])
            .unwrap();

        assert!(topology.remove_everywhere(&core));
        assert!(!topology.still_registered(&core));
        assert!(!topology.remove_everywhere(&core), "second pass finds nothing");
    }
}
