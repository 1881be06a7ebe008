//! Lifecycle event bus keyed by (event, sender).
//!
//! Handlers are registered either against one concrete model's [`SchemaId`]
//! or against a declaration. Declaration handlers fire for every concrete
//! model bound with that declaration in its lineage, with the concrete model
//! as sender.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;
use uuid::Uuid;

use crate::concrete::{ConcreteModel, SchemaId};
use crate::schema::ModelKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    PreInit,
    PostInit,
    PreSave,
    PostSave,
    PreDelete,
    PostDelete,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 6] = [
        LifecycleEvent::PreInit,
        LifecycleEvent::PostInit,
        LifecycleEvent::PreSave,
        LifecycleEvent::PostSave,
        LifecycleEvent::PreDelete,
        LifecycleEvent::PostDelete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::PreInit => "pre_init",
            LifecycleEvent::PostInit => "post_init",
            LifecycleEvent::PreSave => "pre_save",
            LifecycleEvent::PostSave => "post_save",
            LifecycleEvent::PreDelete => "pre_delete",
            LifecycleEvent::PostDelete => "post_delete",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sender {
    Model(SchemaId),
    Declaration(ModelKey),
}

/// Payload handed to handlers.
#[derive(Debug, Clone)]
pub struct ModelEvent {
    pub kind: LifecycleEvent,
    pub sender: SchemaId,
    pub declaration: ModelKey,
    pub tenant_id: Uuid,
    pub record_id: Option<i64>,
    /// Only meaningful for `post_save`.
    pub created: bool,
}

pub type Handler = Arc<dyn Fn(&ModelEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct BusState {
    handlers: HashMap<(LifecycleEvent, Sender), Vec<(HandlerId, Handler)>>,
    bindings: HashMap<SchemaId, BTreeSet<ModelKey>>,
}

#[derive(Default)]
pub struct EventBus {
    state: RwLock<BusState>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventBus")
            .field("handlers", &state.handlers.len())
            .field("bound_senders", &state.bindings.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect<F>(&self, kind: LifecycleEvent, sender: Sender, handler: F) -> HandlerId
    where
        F: Fn(&ModelEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .handlers
            .entry((kind, sender))
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns false if it was not connected.
    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for handlers in state.handlers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            removed |= handlers.len() != before;
        }
        state.handlers.retain(|_, handlers| !handlers.is_empty());
        removed
    }

    /// Registers a concrete model as a valid sender.
    pub fn bind(&self, model: &ConcreteModel) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .bindings
            .insert(model.schema_id(), model.lineage().clone());
    }

    /// Forgets a sender and every handler registered against it.
    pub fn unbind(&self, schema_id: &SchemaId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.bindings.remove(schema_id);
        state
            .handlers
            .retain(|(_, sender), _| sender != &Sender::Model(schema_id.clone()));
    }

    pub fn is_bound(&self, schema_id: &SchemaId) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .bindings
            .contains_key(schema_id)
    }

    /// Calls every handler for `event`: those of the concrete sender first,
    /// then those of declarations in the sender's lineage.
    pub fn dispatch(&self, event: &ModelEvent) {
        let handlers: Vec<Handler> = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let Some(lineage) = state.bindings.get(&event.sender) else {
                trace!(sender = %event.sender, event = %event.kind, "dropping event from unbound sender");
                return;
            };

            let mut handlers: Vec<Handler> = state
                .handlers
                .get(&(event.kind, Sender::Model(event.sender.clone())))
                .into_iter()
                .flatten()
                .map(|(_, handler)| handler.clone())
                .collect();
            for key in lineage {
                if let Some(found) = state
                    .handlers
                    .get(&(event.kind, Sender::Declaration(key.clone())))
                {
                    handlers.extend(found.iter().map(|(_, handler)| handler.clone()));
                }
            }
            handlers
        };

        for handler in handlers {
            handler(event);
        }
    }
}
