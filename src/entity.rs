//! Event-sourced entity definitions and their registration API.
//!
//! An [`EventSourcedEntity`] is built once at startup through
//! [`EventSourcedEntityBuilder`]: the user registers an initial-state
//! function, command handlers by name, event handlers by payload type, and
//! optionally a snapshot producer/handler pair. The built value is
//! immutable and owned by the entity registry for the process lifetime.
//!
//! Handlers receive a call scope ([`CommandCall`], [`EventCall`], ...) that
//! exposes exactly the parameter roles the handler declared at
//! registration; see [`crate::dispatch`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::codec::{Payload, TypeRegistry};
use crate::context::{CommandContext, EventContext, SnapshotContext};
use crate::dispatch::{HandlerKind, ParamRole, Signature};
use crate::error::{HandlerError, RegistrationError};

/// Fully qualified name of the protocol service driving event-sourced
/// entities, reported to the proxy during discovery.
pub const EVENT_SOURCED_ENTITY_TYPE: &str = "cloudstate.eventsourced.EventSourced";

/// The entity's opaque state, exclusively owned by one session.
///
/// The library never inspects the state; only the entity's own handlers
/// downcast it back to the concrete type chosen by the initial-state
/// function.
pub struct DynState {
    inner: Box<dyn Any + Send>,
}

impl DynState {
    /// Wrap a concrete state value.
    pub fn new<S: Send + 'static>(state: S) -> Self {
        Self {
            inner: Box::new(state),
        }
    }

    fn downcast_ref<S: 'static>(&self) -> Option<&S> {
        self.inner.downcast_ref::<S>()
    }

    fn downcast_mut<S: 'static>(&mut self) -> Option<&mut S> {
        self.inner.downcast_mut::<S>()
    }
}

impl fmt::Debug for DynState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynState").finish_non_exhaustive()
    }
}

fn undeclared(role: &str) -> HandlerError {
    HandlerError::new(format!("handler did not declare the {role} parameter"))
}

fn wrong_type(role: &str) -> HandlerError {
    HandlerError::new(format!("{role} value does not have the expected type"))
}

/// Call scope for a command handler: the declared subset of state, decoded
/// payload, and command context.
pub struct CommandCall<'a> {
    state: Option<&'a mut DynState>,
    payload: Option<&'a Payload>,
    context: Option<&'a mut CommandContext>,
}

impl CommandCall<'_> {
    /// Borrow the entity state, downcast to its concrete type.
    ///
    /// # Errors
    ///
    /// A [`HandlerError`] if the handler did not declare
    /// [`ParamRole::State`] or the downcast type is wrong.
    pub fn state<S: 'static>(&self) -> Result<&S, HandlerError> {
        self.state
            .as_deref()
            .ok_or_else(|| undeclared("state"))?
            .downcast_ref::<S>()
            .ok_or_else(|| wrong_type("state"))
    }

    /// Mutably borrow the entity state, downcast to its concrete type.
    pub fn state_mut<S: 'static>(&mut self) -> Result<&mut S, HandlerError> {
        self.state
            .as_deref_mut()
            .ok_or_else(|| undeclared("state"))?
            .downcast_mut::<S>()
            .ok_or_else(|| wrong_type("state"))
    }

    /// Borrow the decoded command payload, downcast to its concrete type.
    pub fn payload<P: 'static>(&self) -> Result<&P, HandlerError> {
        self.payload
            .ok_or_else(|| undeclared("payload"))?
            .downcast_ref::<P>()
            .ok_or_else(|| wrong_type("payload"))
    }

    /// Borrow the command context for emitting events, failing, forwarding,
    /// or requesting side effects.
    pub fn ctx(&mut self) -> Result<&mut CommandContext, HandlerError> {
        self.context
            .as_deref_mut()
            .ok_or_else(|| undeclared("context"))
    }
}

/// Call scope for an event handler.
pub struct EventCall<'a> {
    state: Option<&'a mut DynState>,
    payload: Option<&'a Payload>,
    context: Option<&'a EventContext>,
}

impl EventCall<'_> {
    /// Borrow the entity state, downcast to its concrete type.
    pub fn state<S: 'static>(&self) -> Result<&S, HandlerError> {
        self.state
            .as_deref()
            .ok_or_else(|| undeclared("state"))?
            .downcast_ref::<S>()
            .ok_or_else(|| wrong_type("state"))
    }

    /// Mutably borrow the entity state, downcast to its concrete type.
    pub fn state_mut<S: 'static>(&mut self) -> Result<&mut S, HandlerError> {
        self.state
            .as_deref_mut()
            .ok_or_else(|| undeclared("state"))?
            .downcast_mut::<S>()
            .ok_or_else(|| wrong_type("state"))
    }

    /// Borrow the decoded event payload, downcast to its concrete type.
    pub fn payload<P: 'static>(&self) -> Result<&P, HandlerError> {
        self.payload
            .ok_or_else(|| undeclared("payload"))?
            .downcast_ref::<P>()
            .ok_or_else(|| wrong_type("payload"))
    }

    /// Borrow the event context (entity id and sequence number).
    pub fn ctx(&self) -> Result<&EventContext, HandlerError> {
        self.context.ok_or_else(|| undeclared("context"))
    }
}

/// Call scope for the snapshot producer: state and snapshot context only.
pub struct SnapshotCall<'a> {
    state: Option<&'a DynState>,
    context: Option<&'a SnapshotContext>,
}

impl SnapshotCall<'_> {
    /// Borrow the entity state, downcast to its concrete type.
    pub fn state<S: 'static>(&self) -> Result<&S, HandlerError> {
        self.state
            .ok_or_else(|| undeclared("state"))?
            .downcast_ref::<S>()
            .ok_or_else(|| wrong_type("state"))
    }

    /// Borrow the snapshot context.
    pub fn ctx(&self) -> Result<&SnapshotContext, HandlerError> {
        self.context.ok_or_else(|| undeclared("context"))
    }
}

/// Call scope for the snapshot handler: state, snapshot payload, context.
pub struct SnapshotHandlerCall<'a> {
    state: Option<&'a mut DynState>,
    payload: Option<&'a Payload>,
    context: Option<&'a SnapshotContext>,
}

impl SnapshotHandlerCall<'_> {
    /// Mutably borrow the entity state, downcast to its concrete type.
    pub fn state_mut<S: 'static>(&mut self) -> Result<&mut S, HandlerError> {
        self.state
            .as_deref_mut()
            .ok_or_else(|| undeclared("state"))?
            .downcast_mut::<S>()
            .ok_or_else(|| wrong_type("state"))
    }

    /// Borrow the decoded snapshot payload, downcast to its concrete type.
    pub fn payload<P: 'static>(&self) -> Result<&P, HandlerError> {
        self.payload
            .ok_or_else(|| undeclared("payload"))?
            .downcast_ref::<P>()
            .ok_or_else(|| wrong_type("payload"))
    }

    /// Borrow the snapshot context.
    pub fn ctx(&self) -> Result<&SnapshotContext, HandlerError> {
        self.context.ok_or_else(|| undeclared("context"))
    }
}

type InitFn = Box<dyn Fn(&str) -> DynState + Send + Sync>;
type CommandFn =
    Box<dyn Fn(&mut CommandCall<'_>) -> Result<Option<Payload>, HandlerError> + Send + Sync>;
type EventFn = Box<dyn Fn(&mut EventCall<'_>) -> Result<(), HandlerError> + Send + Sync>;
type SnapshotProducerFn =
    Box<dyn Fn(&SnapshotCall<'_>) -> Result<Payload, HandlerError> + Send + Sync>;
type SnapshotHandlerFn =
    Box<dyn Fn(&mut SnapshotHandlerCall<'_>) -> Result<(), HandlerError> + Send + Sync>;

pub(crate) struct CommandHandler {
    signature: Signature,
    func: CommandFn,
}

impl CommandHandler {
    pub(crate) fn invoke(
        &self,
        state: &mut DynState,
        payload: &Payload,
        context: &mut CommandContext,
    ) -> Result<Option<Payload>, HandlerError> {
        let mut call = CommandCall {
            state: declared_mut(&self.signature, ParamRole::State, state),
            payload: declared(&self.signature, ParamRole::Payload, payload),
            context: declared_mut(&self.signature, ParamRole::Context, context),
        };
        (self.func)(&mut call)
    }
}

pub(crate) struct EventHandler {
    signature: Signature,
    func: EventFn,
}

impl EventHandler {
    pub(crate) fn invoke(
        &self,
        state: &mut DynState,
        payload: &Payload,
        context: &EventContext,
    ) -> Result<(), HandlerError> {
        let mut call = EventCall {
            state: declared_mut(&self.signature, ParamRole::State, state),
            payload: declared(&self.signature, ParamRole::Payload, payload),
            context: declared(&self.signature, ParamRole::Context, context),
        };
        (self.func)(&mut call)
    }
}

pub(crate) struct SnapshotProducer {
    signature: Signature,
    func: SnapshotProducerFn,
}

impl SnapshotProducer {
    pub(crate) fn invoke(
        &self,
        state: &DynState,
        context: &SnapshotContext,
    ) -> Result<Payload, HandlerError> {
        let call = SnapshotCall {
            state: declared(&self.signature, ParamRole::State, state),
            context: declared(&self.signature, ParamRole::Context, context),
        };
        (self.func)(&call)
    }
}

pub(crate) struct SnapshotHandler {
    signature: Signature,
    func: SnapshotHandlerFn,
}

impl SnapshotHandler {
    pub(crate) fn invoke(
        &self,
        state: &mut DynState,
        payload: &Payload,
        context: &SnapshotContext,
    ) -> Result<(), HandlerError> {
        let mut call = SnapshotHandlerCall {
            state: declared_mut(&self.signature, ParamRole::State, state),
            payload: declared(&self.signature, ParamRole::Payload, payload),
            context: declared(&self.signature, ParamRole::Context, context),
        };
        (self.func)(&mut call)
    }
}

pub(crate) fn declared<'a, T: ?Sized>(
    signature: &Signature,
    role: ParamRole,
    value: &'a T,
) -> Option<&'a T> {
    if signature.declares(role) {
        Some(value)
    } else {
        None
    }
}

pub(crate) fn declared_mut<'a, T: ?Sized>(
    signature: &Signature,
    role: ParamRole,
    value: &'a mut T,
) -> Option<&'a mut T> {
    if signature.declares(role) {
        Some(value)
    } else {
        None
    }
}

/// An immutable event-sourced entity definition.
///
/// Assemble with [`EventSourcedEntity::builder`] and register on
/// [`CloudState`](crate::CloudState).
pub struct EventSourcedEntity {
    pub(crate) service_name: String,
    pub(crate) persistence_id: String,
    pub(crate) snapshot_every: i64,
    pub(crate) descriptor_set: Vec<u8>,
    pub(crate) init: InitFn,
    pub(crate) command_handlers: HashMap<String, CommandHandler>,
    pub(crate) event_handlers: HashMap<String, EventHandler>,
    pub(crate) snapshot: Option<SnapshotProducer>,
    pub(crate) snapshot_handler: Option<SnapshotHandler>,
    pub(crate) types: TypeRegistry,
}

impl EventSourcedEntity {
    /// Start building an entity for the given fully qualified service name.
    pub fn builder(service_name: impl Into<String>) -> EventSourcedEntityBuilder {
        EventSourcedEntityBuilder {
            service_name: service_name.into(),
            persistence_id: None,
            snapshot_every: 0,
            descriptor_set: Vec::new(),
            init: None,
            command_handlers: HashMap::new(),
            event_handlers: HashMap::new(),
            snapshot: None,
            snapshot_handler: None,
            types: TypeRegistry::new(),
        }
    }

    /// The fully qualified service name this entity serves.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Journal namespace reported to the proxy.
    pub fn persistence_id(&self) -> &str {
        &self.persistence_id
    }

    /// Snapshot cadence: a snapshot is produced when a command's event batch
    /// crosses a multiple of this value. Zero disables snapshotting.
    pub fn snapshot_every(&self) -> i64 {
        self.snapshot_every
    }

    pub(crate) fn init_state(&self, entity_id: &str) -> DynState {
        (self.init)(entity_id)
    }
}

impl fmt::Debug for EventSourcedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSourcedEntity")
            .field("service_name", &self.service_name)
            .field("persistence_id", &self.persistence_id)
            .field("snapshot_every", &self.snapshot_every)
            .field("commands", &self.command_handlers.keys().collect::<Vec<_>>())
            .field("events", &self.event_handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Builder for [`EventSourcedEntity`].
///
/// Every registration accepts exactly one handler per key; a duplicate is
/// an immediate [`RegistrationError`].
pub struct EventSourcedEntityBuilder {
    service_name: String,
    persistence_id: Option<String>,
    snapshot_every: i64,
    descriptor_set: Vec<u8>,
    init: Option<InitFn>,
    command_handlers: HashMap<String, CommandHandler>,
    event_handlers: HashMap<String, EventHandler>,
    snapshot: Option<SnapshotProducer>,
    snapshot_handler: Option<SnapshotHandler>,
    types: TypeRegistry,
}

impl EventSourcedEntityBuilder {
    /// Set the journal namespace. Defaults to the service name.
    pub fn persistence_id(mut self, persistence_id: impl Into<String>) -> Self {
        self.persistence_id = Some(persistence_id.into());
        self
    }

    /// Set the snapshot cadence. Zero (the default) disables snapshotting.
    pub fn snapshot_every(mut self, snapshot_every: i64) -> Self {
        self.snapshot_every = snapshot_every;
        self
    }

    /// Attach the serialized `google.protobuf.FileDescriptorSet` for this
    /// entity's service proto, served to the proxy during discovery.
    pub fn descriptor_set(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.descriptor_set = bytes.into();
        self
    }

    /// Register the initial-state function, called once per session with
    /// the entity id.
    pub fn init<S, F>(mut self, f: F) -> Self
    where
        S: Send + 'static,
        F: Fn(&str) -> S + Send + Sync + 'static,
    {
        self.init = Some(Box::new(move |entity_id| DynState::new(f(entity_id))));
        self
    }

    /// Register a command handler under a command name.
    ///
    /// `T` is the expected command payload type; it is added to the
    /// entity's type registry so the codec can decode incoming commands.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::DuplicateCommandHandler`] if the name is taken.
    /// * [`RegistrationError::Signature`] if the role declaration is invalid.
    pub fn command_handler<T, F>(
        mut self,
        name: impl Into<String>,
        roles: impl Into<Vec<ParamRole>>,
        f: F,
    ) -> Result<Self, RegistrationError>
    where
        T: prost::Name + Default + Send + Sync + 'static,
        F: Fn(&mut CommandCall<'_>) -> Result<Option<Payload>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let signature = Signature::validate(roles, HandlerKind::Command)?;
        if self.command_handlers.contains_key(&name) {
            return Err(RegistrationError::DuplicateCommandHandler(name));
        }
        self.types.register::<T>();
        self.command_handlers.insert(
            name,
            CommandHandler {
                signature,
                func: Box::new(f),
            },
        );
        Ok(self)
    }

    /// Register an event handler keyed by the event payload type `T`.
    ///
    /// Lookup at application time is an exact match on the payload's fully
    /// qualified type name; registrations must be disjoint.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::DuplicateEventHandler`] if `T` is taken.
    /// * [`RegistrationError::Signature`] if the role declaration is invalid.
    pub fn event_handler<T, F>(
        mut self,
        roles: impl Into<Vec<ParamRole>>,
        f: F,
    ) -> Result<Self, RegistrationError>
    where
        T: prost::Name + Default + Send + Sync + 'static,
        F: Fn(&mut EventCall<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let type_name = T::full_name();
        let signature = Signature::validate(roles, HandlerKind::Event)?;
        if self.event_handlers.contains_key(&type_name) {
            return Err(RegistrationError::DuplicateEventHandler(type_name));
        }
        self.types.register::<T>();
        self.event_handlers.insert(
            type_name,
            EventHandler {
                signature,
                func: Box::new(f),
            },
        );
        Ok(self)
    }

    /// Register the snapshot producer: turns the current state into the
    /// durable snapshot payload. At most one per entity.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::DuplicateSnapshot`] on a second registration.
    /// * [`RegistrationError::Signature`] if the role declaration is invalid.
    pub fn snapshot<F>(
        mut self,
        roles: impl Into<Vec<ParamRole>>,
        f: F,
    ) -> Result<Self, RegistrationError>
    where
        F: Fn(&SnapshotCall<'_>) -> Result<Payload, HandlerError> + Send + Sync + 'static,
    {
        let signature = Signature::validate(roles, HandlerKind::Snapshot)?;
        if self.snapshot.is_some() {
            return Err(RegistrationError::DuplicateSnapshot);
        }
        self.snapshot = Some(SnapshotProducer {
            signature,
            func: Box::new(f),
        });
        Ok(self)
    }

    /// Register the snapshot handler: restores state from a snapshot
    /// payload of type `T` during session initialisation. At most one per
    /// entity.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::DuplicateSnapshotHandler`] on a second
    ///   registration.
    /// * [`RegistrationError::Signature`] if the role declaration is invalid.
    pub fn snapshot_handler<T, F>(
        mut self,
        roles: impl Into<Vec<ParamRole>>,
        f: F,
    ) -> Result<Self, RegistrationError>
    where
        T: prost::Name + Default + Send + Sync + 'static,
        F: Fn(&mut SnapshotHandlerCall<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let signature = Signature::validate(roles, HandlerKind::SnapshotHandler)?;
        if self.snapshot_handler.is_some() {
            return Err(RegistrationError::DuplicateSnapshotHandler);
        }
        self.types.register::<T>();
        self.snapshot_handler = Some(SnapshotHandler {
            signature,
            func: Box::new(f),
        });
        Ok(self)
    }

    /// Finish the definition.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::MissingInitState`] if no initial-state function
    /// was registered.
    pub fn build(self) -> Result<EventSourcedEntity, RegistrationError> {
        let init = self
            .init
            .ok_or_else(|| RegistrationError::MissingInitState(self.service_name.clone()))?;

        Ok(EventSourcedEntity {
            persistence_id: self
                .persistence_id
                .unwrap_or_else(|| self.service_name.clone()),
            service_name: self.service_name,
            snapshot_every: self.snapshot_every,
            descriptor_set: self.descriptor_set,
            init,
            command_handlers: self.command_handlers,
            event_handlers: self.event_handlers,
            snapshot: self.snapshot,
            snapshot_handler: self.snapshot_handler,
            types: self.types,
        })
    }
}
