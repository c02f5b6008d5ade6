//! Support library for writing Cloudstate user functions in Rust.
//!
//! A Cloudstate user function holds business logic only; a sidecar proxy
//! owns durable storage and drives the function over gRPC. This crate
//! implements the user-function side of that protocol: register typed
//! command, event, and snapshot handlers on an [`EventSourcedEntity`] (or
//! stateless handlers on an [`Action`] / [`StatelessFunction`]), hand them
//! to [`CloudState`], and start serving. The proxy discovers what is
//! registered, replays journaled events on each new entity session, and
//! delivers commands; replies carry the events to persist.

mod action;
mod codec;
mod context;
mod discovery;
mod dispatch;
mod entity;
mod error;
mod event_sourced;
mod function;
pub mod proto;
mod registry;
mod server;
mod session;

pub use action::{
    Action, ActionBuilder, CommandStream, ItemSink, UnaryCall, ACTION_ENTITY_TYPE,
};
pub use codec::{Payload, TypeRegistry, TYPE_URL_PREFIX};
pub use context::{
    ActionContext, ClientActionContext, CommandContext, EventContext, SnapshotContext,
};
pub use dispatch::{HandlerKind, ParamRole, Signature, SignatureError};
pub use entity::{
    CommandCall, DynState, EventCall, EventSourcedEntity, EventSourcedEntityBuilder, SnapshotCall,
    SnapshotHandlerCall, EVENT_SOURCED_ENTITY_TYPE,
};
pub use error::{HandlerError, ProtocolError, RegistrationError, StartError};
pub use function::{
    StatelessFunction, StatelessFunctionBuilder, STATELESS_FUNCTION_ENTITY_TYPE,
};
pub use registry::EntityRegistry;
pub use server::CloudState;
pub use session::Session;
